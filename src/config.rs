//! Tracker configuration.  The preload library reads it from the environment once, when the
//! profiled program reaches its entry point.

use std::{env, path::PathBuf, process};

pub const OUTPUT_VAR: &str = "MALLOC_LEAKS_OUTPUT";
pub const DUMP_DIR_VAR: &str = "MALLOC_LEAKS_DUMP_DIR";
pub const LOG_VAR: &str = "MALLOC_LEAKS_LOG";

pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Frames requested from the unwinder for each tracked call: the interception point that invoked
/// the dispatcher, then its caller.  The deepest one is reported as the allocation's caller.
pub const FRAMES_REQUIRED: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Text report destination; `None` writes to stdout.
    pub output: Option<PathBuf>,
    /// Directory receiving `malloc_leaks.<pid>.yaml`, if set.
    pub dump_dir: Option<PathBuf>,
    pub frames_required: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output: None,
            dump_dir: None,
            frames_required: FRAMES_REQUIRED,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var_os(name))
    }

    fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<std::ffi::OsString>,
    {
        let path = |name: &str| var(name).filter(|v| !v.is_empty()).map(PathBuf::from);
        Config {
            output: path(OUTPUT_VAR),
            dump_dir: path(DUMP_DIR_VAR),
            ..Config::default()
        }
    }

    /// Index of the caller frame in a buffer of `frames_required` frames.
    pub fn caller_frame(&self) -> usize {
        self.frames_required.saturating_sub(1)
    }

    pub fn dump_path(&self) -> Option<PathBuf> {
        self.dump_dir
            .as_ref()
            .map(|dir| dir.join(format!("malloc_leaks.{}.yaml", process::id())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, ffi::OsString};

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_write_to_stdout() {
        let config = config_with(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.output, None);
        assert_eq!(config.dump_path(), None);
        assert_eq!(config.caller_frame(), 1);
    }

    #[test]
    fn reads_paths() {
        let config = config_with(&[(OUTPUT_VAR, "/tmp/leaks.txt"), (DUMP_DIR_VAR, "/tmp/dumps")]);
        assert_eq!(config.output, Some(PathBuf::from("/tmp/leaks.txt")));
        let dump = config.dump_path().unwrap();
        assert!(dump.starts_with("/tmp/dumps"));
        assert!(dump
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("malloc_leaks."));
    }

    #[test]
    fn empty_values_are_ignored() {
        let config = config_with(&[(OUTPUT_VAR, "")]);
        assert_eq!(config.output, None);
    }
}
