use crate::filter::{Exclusion, ExclusionSet, Preset};
use crate::matcher::MatchMode;
use crate::{t, t_args};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "cts-runner.yaml";

/// Per-stage subprocess limits, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StageTimeouts {
    pub generate: u64,
    pub build: u64,
    pub run: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            generate: 120,
            build: 120,
            run: 10,
        }
    }
}

impl StageTimeouts {
    pub fn generate(&self) -> Duration {
        Duration::from_secs(self.generate)
    }
    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build)
    }
    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Selector compiler command line; the selector is fed on stdin.
    pub compiler: Vec<String>,
    /// C++ compiler driver.
    pub cxx: String,
    /// Value for `-std=`.
    pub std: String,
    /// simdjson install prefix (`include/` and `lib/` below it). When unset
    /// the system search paths are used.
    pub simdjson: Option<PathBuf>,
    /// Support library compiled next to every generated program. A header
    /// with the same stem is copied along when present.
    pub support_lib: PathBuf,
    pub extra_flags: Vec<String>,
    /// Parent directory for per-case build directories (system temp dir if unset).
    pub workdir: Option<PathBuf>,
    pub timeouts: StageTimeouts,
    pub preset: Preset,
    pub exclude: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub match_mode: MatchMode,
    pub jobs: Option<usize>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            compiler: vec!["cargo".into(), "run".into(), "--quiet".into()],
            cxx: "c++".into(),
            std: "c++20".into(),
            simdjson: None,
            support_lib: PathBuf::from("helpers.cpp"),
            extra_flags: vec!["-Wno-unused-result".into()],
            workdir: None,
            timeouts: StageTimeouts::default(),
            preset: Preset::default(),
            exclude: Vec::new(),
            exclude_patterns: Vec::new(),
            match_mode: MatchMode::default(),
            jobs: None,
        }
    }
}

impl HarnessConfig {
    /// Load `path`, or `cts-runner.yaml` in the working directory if it
    /// exists, or fall back to the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| t_args!("config-read-failed", "file" => path.display()))?;
        let mut cfg = Self::from_yaml(&content)
            .with_context(|| t_args!("config-yaml-error", "file" => path.display()))?;
        cfg.resolve_relative_to(path);
        Ok(cfg)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(content)?;
        cfg.check()?;
        Ok(cfg)
    }

    fn check(&self) -> Result<()> {
        if self.compiler.is_empty() {
            anyhow::bail!(t!("config-empty-compiler"));
        }
        Ok(())
    }

    // Paths in a config file are relative to the file, not to the caller's cwd
    fn resolve_relative_to(&mut self, config_path: &Path) {
        let Some(base) = config_path.parent() else {
            return;
        };
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.support_lib);
        // A bare command name is looked up on PATH; only path-like ones move
        if let Some(program) = self.compiler.first_mut() {
            let path = Path::new(program.as_str());
            if path.is_relative() && path.components().count() > 1 {
                *program = base.join(path).to_string_lossy().into_owned();
            }
        }
        if let Some(p) = self.simdjson.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.workdir.as_mut() {
            resolve(p);
        }
    }

    /// Preset tags plus the configured name substrings and patterns.
    pub fn exclusions(&self) -> Result<ExclusionSet> {
        let mut set = ExclusionSet::from_preset(self.preset);
        for s in &self.exclude {
            set.push(Exclusion::NameContains(s.clone()));
        }
        for pattern in &self.exclude_patterns {
            let re = Regex::new(pattern)
                .with_context(|| t_args!("config-bad-pattern", "pattern" => pattern))?;
            set.push(Exclusion::NameMatches(re));
        }
        Ok(set)
    }

    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_the_reference_invocation() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.compiler, ["cargo", "run", "--quiet"]);
        assert_eq!(cfg.cxx, "c++");
        assert_eq!(cfg.preset, Preset::Minimal);
        assert_eq!(cfg.match_mode, MatchMode::Exact);
        assert!(cfg.jobs() >= 1);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = HarnessConfig::from_yaml(
            r#"
compiler: [target/release/jsonpath-compiler]
simdjson: /opt/simdjson
timeouts:
  run: 3
preset: broad
match_mode: ignore-order
exclude: [slice]
exclude_patterns: ["^name selector"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.compiler, ["target/release/jsonpath-compiler"]);
        assert_eq!(cfg.simdjson, Some(PathBuf::from("/opt/simdjson")));
        assert_eq!(cfg.timeouts.run, 3);
        assert_eq!(cfg.timeouts.build, 120);
        assert_eq!(cfg.preset, Preset::Broad);
        assert_eq!(cfg.match_mode, MatchMode::IgnoreOrder);
        assert_eq!(cfg.std, "c++20");
        let set = cfg.exclusions().unwrap();
        assert!(!set.is_empty());
    }

    #[test]
    fn unknown_keys_and_empty_compiler_are_rejected() {
        assert!(HarnessConfig::from_yaml("simdjsn: /opt\n").is_err());
        assert!(HarnessConfig::from_yaml("compiler: []\n").is_err());
    }

    #[test]
    fn bad_pattern_is_reported() {
        let cfg = HarnessConfig {
            exclude_patterns: vec!["(".into()],
            ..HarnessConfig::default()
        };
        assert!(cfg.exclusions().is_err());
    }

    #[test]
    fn file_paths_resolve_against_the_config_dir() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("cts-runner.yaml");
        let yaml = "support_lib: lib/helpers.cpp\n\
                    simdjson: /abs\n\
                    compiler: [target/release/jpc, -q]\n";
        fs::write(&file, yaml).unwrap();
        let cfg = HarnessConfig::from_file(&file).unwrap();
        assert_eq!(cfg.support_lib, dir.path().join("lib/helpers.cpp"));
        assert_eq!(cfg.simdjson, Some(PathBuf::from("/abs")));
        let compiler = dir.path().join("target/release/jpc");
        let compiler = compiler.to_string_lossy().into_owned();
        assert_eq!(cfg.compiler, [compiler.as_str(), "-q"]);

        fs::write(&file, "compiler: [cargo, run]\n").unwrap();
        let cfg = HarnessConfig::from_file(&file).unwrap();
        assert_eq!(cfg.compiler, ["cargo", "run"]);
    }
}
