//! vsync configuration file parsing (.vsync.toml)

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::filter::STATE_DIR;
use crate::limiter::{DEFAULT_CONCURRENCY, MAX_CONCURRENCY};
use crate::scan::{DEFAULT_COMMIT_EVERY, DiffOptions, ScanOptions};

/// Config file name
pub const CONFIG_FILE: &str = ".vsync.toml";

/// Per-source configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VsyncConfig {
    /// Device id used in vector clocks; a persisted UUID when unset
    pub device_id: Option<String>,

    /// LMDB state directory, relative to the source root
    pub state_dir: PathBuf,

    pub follow_links: bool,

    /// Store a BLAKE3 digest of every file
    pub hash_contents: bool,

    /// Gitignore-syntax patterns excluded from every scan
    pub exclude: Vec<String>,

    /// Files larger than this are left out of the tree
    pub max_file_size: Option<u64>,

    pub scan: ScanConfig,

    pub watch: WatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Concurrent filesystem operations (1-32)
    pub concurrency: usize,
    /// Inserts between commits
    pub commit_every: usize,
    pub rescan_unchanged_directories: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    pub directory_adds: bool,
    pub directory_removes: bool,
}

impl Default for VsyncConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            state_dir: PathBuf::from(STATE_DIR),
            follow_links: false,
            hash_contents: false,
            exclude: Vec::new(),
            max_file_size: None,
            scan: ScanConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            commit_every: DEFAULT_COMMIT_EVERY,
            rescan_unchanged_directories: false,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            directory_adds: true,
            directory_removes: true,
        }
    }
}

impl VsyncConfig {
    /// Load config from a source root.
    ///
    /// Returns default config if .vsync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read, parsed or
    /// validated.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(&config_path).map_err(|e| Error::io(&config_path, e))?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns `Config` for malformed TOML or out-of-range values.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=MAX_CONCURRENCY).contains(&self.scan.concurrency) {
            return Err(Error::Config(format!(
                "scan.concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.scan.concurrency
            )));
        }
        if self.scan.commit_every == 0 {
            return Err(Error::Config("scan.commit_every must be at least 1".into()));
        }
        if self.state_dir.is_absolute() || self.state_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "state_dir must be a non-empty path relative to the source root".into(),
            ));
        }
        Ok(())
    }

    /// Absolute location of the LMDB environment.
    #[must_use]
    pub fn state_path(&self, root: &Path) -> PathBuf {
        root.join(&self.state_dir)
    }

    #[must_use]
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            follow_links: self.follow_links,
            hash_contents: self.hash_contents,
            commit_every: self.scan.commit_every,
            rescan_unchanged_directories: self.scan.rescan_unchanged_directories,
            ..ScanOptions::default()
        }
    }

    #[must_use]
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            directory_adds: self.watch.directory_adds,
            directory_removes: self.watch.directory_removes,
        }
    }
}
