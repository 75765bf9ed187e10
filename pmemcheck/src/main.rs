//! Pool consistency check.
//!
//! Usage: pmemcheck [-s SIGNATURE] <pool-or-set-file>
//!
//! Exit codes: 0 consistent, 1 inconsistent, 2 usage or I/O error.

use std::path::PathBuf;
use std::process::ExitCode;

use pmem::pool::{check, CheckResult, PoolAttr};

const DEFAULT_SIGNATURE: &str = "PMEMOBJ";

fn usage() -> ExitCode {
    eprintln!("usage: pmemcheck [-s SIGNATURE] <pool-or-set-file>");
    ExitCode::from(2)
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let mut signature = DEFAULT_SIGNATURE.to_string();
    let mut path: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-s" => match args.next() {
                Some(sig) => signature = sig,
                None => return usage(),
            },
            "-h" | "--help" => return usage(),
            _ if path.is_none() => path = Some(PathBuf::from(arg)),
            _ => return usage(),
        }
    }

    let Some(path) = path else {
        return usage();
    };

    let attr = match PoolAttr::new(&signature) {
        Ok(attr) => attr,
        Err(_) => {
            eprintln!("pmemcheck: bad signature \"{}\"", signature);
            return ExitCode::from(2);
        }
    };

    match check(&path, &attr) {
        Ok(CheckResult::Consistent) => {
            println!("{}: consistent", path.display());
            ExitCode::SUCCESS
        }
        Ok(CheckResult::Inconsistent) => {
            println!("{}: inconsistent: {}", path.display(), pmem::last_error());
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("pmemcheck: {}: {}", path.display(), e);
            let msg = pmem::last_error();
            if !msg.is_empty() {
                eprintln!("pmemcheck: {}", msg);
            }
            ExitCode::from(2)
        }
    }
}
