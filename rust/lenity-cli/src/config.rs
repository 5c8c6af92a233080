//! Configuration file parsing for `lenity.toml`.
//!
//! Searches the current directory then its ancestors. A missing file means
//! defaults everywhere.

use lenity_vm::VmConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "lenity.toml";

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct LenityConfig {
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct LogSection {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl LenityConfig {
    /// Load config from `lenity.toml`, searching the current dir then parents.
    /// Returns `Default` when no file is found.
    pub fn load() -> Result<Self, String> {
        let Ok(dir) = std::env::current_dir() else {
            return Ok(Self::default());
        };
        Ok(Self::find_from(&dir)?.map(|(_path, cfg)| cfg).unwrap_or_default())
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("invalid toml in '{}': {}", path.display(), e))
    }

    /// Nearest `lenity.toml` at or above `start`. A file that exists but does
    /// not parse is an error rather than silently skipped.
    pub fn find_from(start: &Path) -> Result<Option<(PathBuf, Self)>, String> {
        let mut dir = start.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.is_file() {
                let cfg = Self::load_from(&config_path)?;
                return Ok(Some((config_path, cfg)));
            }
            if !dir.pop() {
                return Ok(None);
            }
        }
    }

    pub fn log_filter(&self) -> &str {
        self.log.filter.as_deref().unwrap_or("warn")
    }

    /// Generate a default `lenity.toml` template.
    pub fn default_template() -> &'static str {
        r#"# Lenity configuration

[vm]
# max_call_depth = 256
# max_lenient_depth = 64
# max_instructions = 1000000
# trace_execution = false

[log]
# filter = "lenity_vm=debug"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lenity-config-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn parse_vm_section() {
        let toml_str = r#"
[vm]
max_call_depth = 32
max_instructions = 5000
"#;
        let cfg: LenityConfig = toml::from_str(toml_str).expect("should parse");
        assert_eq!(cfg.vm.max_call_depth, 32);
        assert_eq!(cfg.vm.max_instructions, Some(5000));
        // unspecified fields keep their defaults
        assert_eq!(cfg.vm.max_lenient_depth, 64);
        assert!(!cfg.vm.trace_execution);
    }

    #[test]
    fn parse_log_filter() {
        let cfg: LenityConfig = toml::from_str("[log]\nfilter = \"lenity_vm=trace\"\n").expect("should parse");
        assert_eq!(cfg.log_filter(), "lenity_vm=trace");
    }

    #[test]
    fn empty_string_returns_default() {
        let cfg: LenityConfig = toml::from_str("").expect("empty toml is valid");
        assert_eq!(cfg, LenityConfig::default());
        assert_eq!(cfg.log_filter(), "warn");
    }

    #[test]
    fn invalid_toml_returns_error() {
        let result: Result<LenityConfig, _> = toml::from_str("[vm");
        assert!(result.is_err());
    }

    #[test]
    fn default_template_round_trips() {
        let cfg: LenityConfig =
            toml::from_str(LenityConfig::default_template()).expect("default template must be valid toml");
        assert_eq!(cfg, LenityConfig::default());
    }

    #[test]
    fn found_in_ancestor_directory() {
        let root = scratch_dir("ancestor");
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.join(CONFIG_FILE), "[vm]\nmax_call_depth = 7\n").unwrap();

        let (path, cfg) = LenityConfig::find_from(&nested).unwrap().expect("config should be found");
        assert_eq!(path, root.join(CONFIG_FILE));
        assert_eq!(cfg.vm.max_call_depth, 7);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn malformed_file_is_reported() {
        let root = scratch_dir("malformed");
        std::fs::write(root.join(CONFIG_FILE), "[vm]\nmax_call_depth = \"deep\"\n").unwrap();
        let err = LenityConfig::find_from(&root).unwrap_err();
        assert!(err.contains("invalid toml"), "{err}");
        let _ = std::fs::remove_dir_all(&root);
    }
}
