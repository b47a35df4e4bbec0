//! Compiler configuration
//!
//! Small knob set threaded through the pipeline: whether the peephole
//! optimizer runs and which directory the emitted `include` directives point
//! at. Defaults match the conventional layout (`source\start.inc` /
//! `source\end.inc` next to the assembled program).
//!
//! A configuration can also be loaded from a TOML file:
//!
//! ```toml
//! include_dir = "runtime"
//! optimize = true
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Directory prefix of the `include <dir>\start.inc` / `end.inc`
    /// directives that frame the program.
    pub include_dir: String,

    /// Run the peephole optimizer before writing.
    pub optimize: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            include_dir: "source".to_string(),
            optimize: false,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_include_dir(mut self, dir: impl Into<String>) -> Self {
        self.include_dir = dir.into();
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("Invalid config: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
        Self::from_toml_str(&text)
    }
}

/// Output path for an input path: the last three characters are overwritten
/// with `asm` (`fib.pas` -> `fib.asm`).
pub fn derive_output_name(input: &Path) -> PathBuf {
    let text = input.to_string_lossy();
    let mut chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    if n >= 3 {
        chars[n - 3] = 'a';
        chars[n - 2] = 's';
        chars[n - 1] = 'm';
    } else {
        chars.extend(['a', 's', 'm']);
    }
    PathBuf::from(chars.into_iter().collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.include_dir, "source");
        assert!(!config.optimize);
    }

    #[test]
    fn test_builder() {
        let config = CompilerConfig::new()
            .with_include_dir("runtime")
            .with_optimize(true);
        assert_eq!(config.include_dir, "runtime");
        assert!(config.optimize);
    }

    #[test]
    fn test_toml_round_trip() {
        let config =
            CompilerConfig::from_toml_str("include_dir = \"rt\"\noptimize = true\n").unwrap();
        assert_eq!(config.include_dir, "rt");
        assert!(config.optimize);
    }

    #[test]
    fn test_toml_defaults_apply() {
        let config = CompilerConfig::from_toml_str("optimize = true\n").unwrap();
        assert_eq!(config.include_dir, "source");
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(CompilerConfig::from_toml_str("optimise = true\n").is_err());
    }

    #[test]
    fn test_output_name_overwrites_last_three_characters() {
        assert_eq!(
            derive_output_name(Path::new("fib.pas")),
            PathBuf::from("fib.asm")
        );
        assert_eq!(
            derive_output_name(Path::new("dir/prog.pas")),
            PathBuf::from("dir/prog.asm")
        );
    }
}
