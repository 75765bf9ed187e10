/// Runtime configuration.
///
/// `PersistConfig` is a one-shot snapshot of the environment overrides that
/// feed dispatch selection; tests construct it directly instead of mutating
/// the process environment. `parse_params` is the `key=value` string parser
/// used by the allocator controller.
use crate::error::{fail, Error, Result};

/// Copies at or above this many bytes switch from temporal stores plus
/// explicit flush to non-temporal streaming stores.
pub const DEFAULT_MOVNT_THRESHOLD: usize = 256;

/// Environment-variable overrides consumed by `arch::init`.
///
/// Each library flavor prefixes the variable names with its own tag
/// (`PMEM_NO_CLWB`, `PMEMOBJ_NO_CLWB`, ...); the core takes the prefix as a
/// parameter.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// `NO_CLWB=1`: pretend clwb is absent, fall back to clflushopt.
    pub no_clwb: bool,
    /// `NO_CLFLUSHOPT=1`: pretend clflushopt is absent, fall back to clflush.
    pub no_clflushopt: bool,
    /// `NO_MOVNT=1`: disable streaming stores entirely.
    pub no_movnt: bool,
    /// `MOVNT_THRESHOLD=N`: override the temporal/non-temporal switch point.
    pub movnt_threshold: usize,
    /// `NO_FLUSH=1` forces the no-op flush, `NO_FLUSH=0` forces a real flush
    /// even when eADR was detected. Unset: follow eADR detection.
    pub no_flush: Option<bool>,
    /// `NO_GENERIC_MEMCPY=1`: portable copy path uses the libc-style copy
    /// instead of the word-at-a-time loop.
    pub no_generic_memcpy: bool,
    /// `WC_WORKAROUND=0|1`: force the write-combining barrier variant of the
    /// streaming copies on or off. Unset: enabled on genuine Intel CPUs.
    pub wc_workaround: Option<bool>,
    /// `IS_PMEM_FORCE=0|1`: force the `is_pmem` predicate to a constant.
    pub is_pmem_force: Option<bool>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        PersistConfig {
            no_clwb: false,
            no_clflushopt: false,
            no_movnt: false,
            movnt_threshold: DEFAULT_MOVNT_THRESHOLD,
            no_flush: None,
            no_generic_memcpy: false,
            wc_workaround: None,
            is_pmem_force: None,
        }
    }
}

fn var(prefix: &str, name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", prefix, name)).ok()
}

/// True only for the literal value "1", matching the C library's treatment
/// of these variables.
fn flag(prefix: &str, name: &str) -> bool {
    var(prefix, name).as_deref() == Some("1")
}

/// "0" => Some(false), "1" => Some(true), anything else (or unset) => None.
fn tristate(prefix: &str, name: &str) -> Option<bool> {
    match var(prefix, name).as_deref() {
        Some("0") => Some(false),
        Some("1") => Some(true),
        Some(other) => {
            log::info!("incorrect value of {}_{} ({})", prefix, name, other);
            None
        }
        None => None,
    }
}

impl PersistConfig {
    /// Snapshot the overrides for the given flavor prefix.
    pub fn from_env(prefix: &str) -> Self {
        let movnt_threshold = match var(prefix, "MOVNT_THRESHOLD") {
            Some(v) => match v.parse::<usize>() {
                Ok(n) => {
                    log::info!("{}_MOVNT_THRESHOLD set to {}", prefix, n);
                    n
                }
                Err(_) => {
                    log::info!("invalid {}_MOVNT_THRESHOLD", prefix);
                    DEFAULT_MOVNT_THRESHOLD
                }
            },
            None => DEFAULT_MOVNT_THRESHOLD,
        };

        PersistConfig {
            no_clwb: flag(prefix, "NO_CLWB"),
            no_clflushopt: flag(prefix, "NO_CLFLUSHOPT"),
            no_movnt: flag(prefix, "NO_MOVNT"),
            movnt_threshold,
            no_flush: tristate(prefix, "NO_FLUSH"),
            no_generic_memcpy: flag(prefix, "NO_GENERIC_MEMCPY"),
            wc_workaround: tristate(prefix, "WC_WORKAROUND"),
            is_pmem_force: tristate(prefix, "IS_PMEM_FORCE"),
        }
    }
}

/// Parse a `key=value[;key=value...]` parameter string into ordered pairs.
///
/// Whitespace around keys and values is trimmed; empty clauses between
/// semicolons are skipped. A clause without `=`, or with an empty key,
/// is an `InvalidArgument`.
pub fn parse_params(input: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();

    for clause in input.split(';') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }

        let Some((key, value)) = clause.split_once('=') else {
            fail!(
                Error::InvalidArgument,
                "invalid parameter clause \"{}\" (expected key=value)",
                clause
            );
        };

        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            fail!(Error::InvalidArgument, "empty key in parameter clause \"{}\"", clause);
        }

        out.push((key.to_string(), value.to_string()));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = PersistConfig::default();
        assert!(!cfg.no_clwb);
        assert!(!cfg.no_movnt);
        assert_eq!(cfg.movnt_threshold, DEFAULT_MOVNT_THRESHOLD);
        assert_eq!(cfg.no_flush, None);
        assert_eq!(cfg.is_pmem_force, None);
    }

    #[test]
    fn parse_params_basic() {
        let params = parse_params("size=4k; mode = strict ;debug=1").unwrap();
        assert_eq!(
            params,
            vec![
                ("size".into(), "4k".into()),
                ("mode".into(), "strict".into()),
                ("debug".into(), "1".into()),
            ]
        );
    }

    #[test]
    fn parse_params_empty_clauses() {
        assert_eq!(parse_params("").unwrap(), vec![]);
        assert_eq!(parse_params(" ; ;; ").unwrap(), vec![]);
    }

    #[test]
    fn parse_params_rejects_garbage() {
        assert_eq!(parse_params("novalue"), Err(Error::InvalidArgument));
        assert_eq!(parse_params("=x"), Err(Error::InvalidArgument));
        assert_eq!(parse_params("a=1;junk;b=2"), Err(Error::InvalidArgument));
    }

    #[test]
    fn parse_params_keeps_empty_values() {
        let params = parse_params("key=").unwrap();
        assert_eq!(params, vec![("key".into(), "".into())]);
    }
}
