use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use nixrm_domain::{MappingError, RootMapping, DEFAULT_REMAP_ROOT, DEFAULT_STORE_ROOT};

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalOptions {
    pub quiet: bool,
    pub verbose: u8,
    pub trace: bool,
    pub json: bool,
}

/// Frozen copy of the process environment, so configuration is computed once
/// and tests can supply their own variables.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    #[must_use]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: fmt::Display,
    {
        match self.var(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|err| anyhow::anyhow!("invalid {key}='{raw}': {err}")),
        }
    }
}

/// Which library directories the remote wrapper puts on `LD_LIBRARY_PATH`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryPathMode {
    /// Only the primary object's `lib`.
    #[default]
    Primary,
    /// Every closure object's `lib`.
    Closure,
    None,
}

impl LibraryPathMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Closure => "closure",
            Self::None => "none",
        }
    }
}

impl fmt::Display for LibraryPathMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibraryPathMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "closure" | "all" => Ok(Self::Closure),
            "none" | "off" => Ok(Self::None),
            other => Err(format!(
                "unknown library path mode '{other}' (expected primary, closure or none)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheLocation {
    pub path: PathBuf,
    pub source: &'static str,
}

/// Values set on the command line; each one replaces its environment default.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub store: Option<String>,
    pub remap: Option<String>,
    pub remote_tmp: Option<String>,
    pub jobs: Option<usize>,
    pub retries: Option<u32>,
    pub library_path: Option<LibraryPathMode>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_root: String,
    pub remap_root: String,
    pub remote_tmp: Option<String>,
    pub jobs: Option<usize>,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub cache: CacheLocation,
    pub nix_program: String,
    pub library_path: LibraryPathMode,
}

impl Config {
    /// Builds a configuration from the current process environment.
    ///
    /// # Errors
    /// Returns an error when a variable holds an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    /// # Errors
    /// Returns an error when a variable holds an unparsable value.
    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let library_path = match snapshot.var("NIXRM_LIBRARY_PATH") {
            Some(raw) => raw
                .parse()
                .map_err(|err: String| anyhow::anyhow!("invalid NIXRM_LIBRARY_PATH: {err}"))?,
            None => LibraryPathMode::default(),
        };
        let jobs = snapshot.parsed::<usize>("NIXRM_JOBS")?;
        if jobs == Some(0) {
            bail!("invalid NIXRM_JOBS='0': at least one worker is required");
        }
        Ok(Self {
            store_root: snapshot
                .var("NIXRM_STORE")
                .unwrap_or(DEFAULT_STORE_ROOT)
                .to_string(),
            remap_root: snapshot
                .var("NIXRM_REMAP")
                .unwrap_or(DEFAULT_REMAP_ROOT)
                .to_string(),
            remote_tmp: snapshot.var("NIXRM_REMOTE_TMP").map(ToOwned::to_owned),
            jobs,
            retries: snapshot
                .parsed::<u32>("NIXRM_RETRIES")?
                .unwrap_or(DEFAULT_RETRIES)
                .max(1),
            retry_backoff: Duration::from_millis(
                snapshot
                    .parsed::<u64>("NIXRM_RETRY_BACKOFF_MS")?
                    .unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            ),
            cache: resolve_cache_location(snapshot)?,
            nix_program: snapshot.var("NIXRM_NIX").unwrap_or("nix").to_string(),
            library_path,
        })
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(store) = overrides.store {
            self.store_root = store;
        }
        if let Some(remap) = overrides.remap {
            self.remap_root = remap;
        }
        if let Some(tmp) = overrides.remote_tmp {
            self.remote_tmp = Some(tmp);
        }
        if let Some(jobs) = overrides.jobs {
            self.jobs = Some(jobs.max(1));
        }
        if let Some(retries) = overrides.retries {
            self.retries = retries.max(1);
        }
        if let Some(mode) = overrides.library_path {
            self.library_path = mode;
        }
        self
    }

    /// Validated root mapping for this configuration.
    ///
    /// # Errors
    /// Returns the mapping error when the roots violate the length or shape rules.
    pub fn mapping(&self) -> Result<RootMapping, MappingError> {
        RootMapping::new(self.store_root.clone(), self.remap_root.clone())
    }
}

fn resolve_cache_location(snapshot: &EnvSnapshot) -> Result<CacheLocation> {
    if let Some(path) = snapshot.var("NIXRM_CACHE_DIR") {
        let path = PathBuf::from(path);
        let path = if path.is_absolute() {
            path
        } else {
            env::current_dir()
                .context("failed to resolve NIXRM_CACHE_DIR against the working directory")?
                .join(path)
        };
        return Ok(CacheLocation {
            path,
            source: "NIXRM_CACHE_DIR",
        });
    }
    if let Some(base) = snapshot.var("XDG_CACHE_HOME") {
        return Ok(CacheLocation {
            path: PathBuf::from(base).join("nixrm"),
            source: "XDG_CACHE_HOME",
        });
    }
    if let Some(base) = dirs_next::cache_dir() {
        return Ok(CacheLocation {
            path: base.join("nixrm"),
            source: "platform cache dir",
        });
    }
    if let Some(home) = dirs_next::home_dir() {
        return Ok(CacheLocation {
            path: home.join(".cache").join("nixrm"),
            source: "HOME",
        });
    }
    Ok(CacheLocation {
        path: env::temp_dir().join("nixrm-cache"),
        source: "temp dir",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_nix_layout() -> Result<()> {
        let config = Config::from_snapshot(&EnvSnapshot::from_pairs(&[(
            "NIXRM_CACHE_DIR",
            "/var/cache/nixrm",
        )]))?;
        assert_eq!(config.store_root, "/nix/store");
        assert_eq!(config.remap_root, "/tmp/nixrm");
        assert_eq!(config.retries, 3);
        assert_eq!(config.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.library_path, LibraryPathMode::Primary);
        assert_eq!(config.cache.path, PathBuf::from("/var/cache/nixrm"));
        assert_eq!(config.cache.source, "NIXRM_CACHE_DIR");
        assert_eq!(config.nix_program, "nix");
        assert!(config.mapping().is_ok());
        Ok(())
    }

    #[test]
    fn flags_override_environment() -> Result<()> {
        let snapshot = EnvSnapshot::from_pairs(&[
            ("NIXRM_REMAP", "/opt/nixrm"),
            ("NIXRM_JOBS", "4"),
            ("NIXRM_LIBRARY_PATH", "closure"),
        ]);
        let config = Config::from_snapshot(&snapshot)?.with_overrides(ConfigOverrides {
            remap: Some("/tmp/nixr".into()),
            jobs: Some(2),
            library_path: Some(LibraryPathMode::None),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.remap_root, "/tmp/nixr");
        assert_eq!(config.jobs, Some(2));
        assert_eq!(config.library_path, LibraryPathMode::None);
        assert!(matches!(
            config.mapping(),
            Err(MappingError::LengthMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn rejects_invalid_values() {
        for pairs in [
            [("NIXRM_JOBS", "many")],
            [("NIXRM_JOBS", "0")],
            [("NIXRM_LIBRARY_PATH", "everything")],
            [("NIXRM_RETRIES", "-1")],
        ] {
            assert!(
                Config::from_snapshot(&EnvSnapshot::from_pairs(&pairs)).is_err(),
                "{pairs:?} should be rejected"
            );
        }
    }

    #[test]
    fn blank_values_fall_back_to_defaults() -> Result<()> {
        let config = Config::from_snapshot(&EnvSnapshot::from_pairs(&[
            ("NIXRM_STORE", " "),
            ("NIXRM_CACHE_DIR", "/c"),
        ]))?;
        assert_eq!(config.store_root, "/nix/store");
        Ok(())
    }

    #[test]
    #[serial_test::serial]
    fn from_env_reads_the_process_environment() -> Result<()> {
        let saved: Vec<_> = ["NIXRM_REMAP", "NIXRM_CACHE_DIR"]
            .iter()
            .map(|key| (*key, env::var_os(key)))
            .collect();
        env::set_var("NIXRM_REMAP", "/var/nixrm");
        env::set_var("NIXRM_CACHE_DIR", "/tmp/nixrm-cache-test");
        let config = Config::from_env();
        for (key, value) in saved {
            match value {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
        let config = config?;
        assert_eq!(config.remap_root, "/var/nixrm");
        assert_eq!(config.cache.path, PathBuf::from("/tmp/nixrm-cache-test"));
        Ok(())
    }
}
