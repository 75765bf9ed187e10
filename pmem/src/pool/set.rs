/// Pool-set descriptors.
///
/// A set file is UTF-8 text, one directive per line, `#` starting a
/// comment:
///
/// ```text
/// PMEMPOOLSET
/// OPTION SINGLEHDR
/// 2M /mnt/pmem0/part0
/// 4M /mnt/pmem0/part1
/// REPLICA
/// 8M /mnt/pmem1/copy
/// ```
///
/// A pool backed by a single plain file is represented as a one-part,
/// one-replica set inferred from the file itself.
use std::path::{Path, PathBuf};

use crate::error::{fail, Error, Result};

/// First effective line of every set file.
pub const SET_MAGIC: &str = "PMEMPOOLSET";

/// Architectural minimum size of a single part.
pub const MIN_PART_SIZE: u64 = 2 * 1024 * 1024;

/// Which parts carry a pool header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrMode {
    /// Every part has its own header (the default).
    PerPart,
    /// Only the first part of each replica (OPTION SINGLEHDR).
    Single,
    /// No headers at all (OPTION NOHDRS).
    None,
}

impl HdrMode {
    /// Does part `idx` of a replica carry a header?
    pub fn part_has_hdr(self, idx: usize) -> bool {
        match self {
            HdrMode::PerPart => true,
            HdrMode::Single => idx == 0,
            HdrMode::None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSpec {
    pub path: PathBuf,
    /// Declared size; 0 when the actual file size is authoritative.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicaSpec {
    pub parts: Vec<PartSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSpec {
    pub replicas: Vec<ReplicaSpec>,
    pub hdr_mode: HdrMode,
}

/// Parse `<digits>[K|M|G|T]` with power-of-two suffixes.
pub fn parse_size(token: &str) -> Result<u64> {
    let (digits, shift) = match token.as_bytes().last().copied() {
        Some(b'K') | Some(b'k') => (&token[..token.len() - 1], 10),
        Some(b'M') | Some(b'm') => (&token[..token.len() - 1], 20),
        Some(b'G') | Some(b'g') => (&token[..token.len() - 1], 30),
        Some(b'T') | Some(b't') => (&token[..token.len() - 1], 40),
        _ => (token, 0),
    };

    let base: u64 = match digits.parse() {
        Ok(n) => n,
        Err(_) => {
            fail!(Error::InvalidArgument, "invalid size \"{}\" in pool set file", token);
        }
    };
    if base == 0 || (shift > 0 && base > u64::MAX >> shift) {
        fail!(Error::InvalidArgument, "invalid size \"{}\" in pool set file", token);
    }
    Ok(base << shift)
}

/// Does this file content look like a set descriptor? True when the first
/// non-blank, non-comment line is the set magic.
pub fn looks_like_set(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        return line == SET_MAGIC;
    }
    false
}

impl SetSpec {
    /// The descriptor of a pool backed by one plain file.
    pub fn single(path: &Path, size: u64) -> SetSpec {
        SetSpec {
            replicas: vec![ReplicaSpec {
                parts: vec![PartSpec { path: path.to_path_buf(), size }],
            }],
            hdr_mode: HdrMode::PerPart,
        }
    }

    /// Parse a set file. Relative part paths resolve against `base_dir`
    /// (the directory containing the set file).
    pub fn parse(text: &str, base_dir: &Path) -> Result<SetSpec> {
        let mut seen_magic = false;
        let mut hdr_mode = HdrMode::PerPart;
        let mut replicas: Vec<ReplicaSpec> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if !seen_magic {
                if line != SET_MAGIC {
                    fail!(
                        Error::InvalidArgument,
                        "pool set file must start with {} (line {})",
                        SET_MAGIC,
                        lineno + 1
                    );
                }
                seen_magic = true;
                replicas.push(ReplicaSpec::default());
                continue;
            }

            let mut tokens = line.split_whitespace();
            let first = tokens.next().unwrap();

            match first {
                "OPTION" => {
                    let name = tokens.next().unwrap_or("");
                    match name {
                        "SINGLEHDR" => hdr_mode = HdrMode::Single,
                        "NOHDRS" => hdr_mode = HdrMode::None,
                        _ => {
                            fail!(
                                Error::InvalidArgument,
                                "unknown option \"{}\" (line {})",
                                name,
                                lineno + 1
                            );
                        }
                    }
                    if tokens.next().is_some() {
                        fail!(Error::InvalidArgument, "trailing tokens after OPTION (line {})", lineno + 1);
                    }
                }
                "REPLICA" => {
                    if replicas.last().unwrap().parts.is_empty() {
                        fail!(
                            Error::InvalidArgument,
                            "REPLICA with no parts before line {}",
                            lineno + 1
                        );
                    }
                    replicas.push(ReplicaSpec::default());
                }
                size_token => {
                    let Some(path_token) = tokens.next() else {
                        fail!(
                            Error::InvalidArgument,
                            "part line needs \"<size> <path>\" (line {})",
                            lineno + 1
                        );
                    };
                    if tokens.next().is_some() {
                        fail!(Error::InvalidArgument, "trailing tokens after part path (line {})", lineno + 1);
                    }

                    let size = parse_size(size_token)?;
                    if size < MIN_PART_SIZE {
                        fail!(
                            Error::InvalidArgument,
                            "part size {} smaller than the {} byte minimum (line {})",
                            size,
                            MIN_PART_SIZE,
                            lineno + 1
                        );
                    }

                    let path = Path::new(path_token);
                    let path = if path.is_absolute() {
                        path.to_path_buf()
                    } else {
                        base_dir.join(path)
                    };
                    replicas.last_mut().unwrap().parts.push(PartSpec { path, size });
                }
            }
        }

        if !seen_magic {
            fail!(Error::InvalidArgument, "not a pool set file");
        }
        if replicas.last().map(|r| r.parts.is_empty()).unwrap_or(true) {
            fail!(Error::InvalidArgument, "pool set file declares no parts");
        }

        Ok(SetSpec { replicas, hdr_mode })
    }
}
