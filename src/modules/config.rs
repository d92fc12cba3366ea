//! Daemon configuration.
//!
//! Values come from built-in defaults, then an optional JSON file, then
//! command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::constants::{
    DEFAULT_ACK_TIMEOUT, DEFAULT_HELPER_TIMEOUT, DEFAULT_INSTANCE, DEFAULT_TAKEOVER_TIMEOUT,
    HELPER_RETRY_ATTEMPTS, HELPER_RETRY_INITIAL_DELAY, HELPER_RETRY_MAX_DELAY, MAX_CONFIG_TIMEOUT,
    RUNTIME_SUBDIR, TAKEOVER_SOCKET_NAME,
};
use super::paths;
use super::supervisor::Backoff;

/// Settings for one daemon instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Instance name; one takeover socket and record per name
    pub instance: String,
    /// Base directory for instance state
    pub runtime_dir: PathBuf,
    /// Allow-list roots for every mount path
    pub mount_roots: Vec<PathBuf>,
    /// Socket of a standalone helper; forks one when unset
    pub helper_socket: Option<PathBuf>,
    /// File the daemon and its helper log into
    pub log_file: Option<PathBuf>,
    pub takeover_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub helper_timeout_secs: u64,
    /// Attempts per helper request, including the first
    pub helper_retries: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            instance: DEFAULT_INSTANCE.to_string(),
            runtime_dir: default_runtime_dir(),
            mount_roots: Vec::new(),
            helper_socket: None,
            log_file: None,
            takeover_timeout_secs: DEFAULT_TAKEOVER_TIMEOUT.as_secs(),
            ack_timeout_secs: DEFAULT_ACK_TIMEOUT.as_secs(),
            helper_timeout_secs: DEFAULT_HELPER_TIMEOUT.as_secs(),
            helper_retries: HELPER_RETRY_ATTEMPTS,
        }
    }
}

/// `$XDG_RUNTIME_DIR` when set, else `/tmp`.
pub fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

impl DaemonConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
        let config: DaemonConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {:?}", path))?;
        Ok(config)
    }

    /// Defaults, overlaid with `path` when given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Rejects settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.instance.is_empty()
            || self.instance.contains('/')
            || self.instance == "."
            || self.instance == ".."
        {
            bail!("invalid instance name {:?}", self.instance);
        }
        for root in &self.mount_roots {
            let normalized = paths::normalize(root)?;
            if normalized == Path::new("/") {
                bail!("refusing to allow mounts anywhere under /");
            }
        }
        if self.helper_retries == 0 {
            bail!("helper_retries must be at least 1");
        }
        for (name, secs) in [
            ("takeover_timeout_secs", self.takeover_timeout_secs),
            ("ack_timeout_secs", self.ack_timeout_secs),
            ("helper_timeout_secs", self.helper_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_CONFIG_TIMEOUT.as_secs() {
                bail!(
                    "{} must be between 1 and {}",
                    name,
                    MAX_CONFIG_TIMEOUT.as_secs()
                );
            }
        }
        Ok(())
    }

    /// `<runtime_dir>/leapfrog`
    pub fn state_root(&self) -> PathBuf {
        self.runtime_dir.join(RUNTIME_SUBDIR)
    }

    /// `<runtime_dir>/leapfrog/<instance>`
    pub fn instance_dir(&self) -> PathBuf {
        self.state_root().join(&self.instance)
    }

    pub fn takeover_socket(&self) -> PathBuf {
        self.instance_dir().join(TAKEOVER_SOCKET_NAME)
    }

    pub fn takeover_timeout(&self) -> Duration {
        Duration::from_secs(self.takeover_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_timeout_secs)
    }

    pub fn helper_backoff(&self) -> Backoff {
        Backoff::new(
            self.helper_retries,
            HELPER_RETRY_INITIAL_DELAY,
            HELPER_RETRY_MAX_DELAY,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(
            file,
            r#"{{"instance": "repo1", "mount_roots": ["/data"], "ack_timeout_secs": 5}}"#
        )?;

        let config = DaemonConfig::load(file.path())?;
        assert_eq!(config.instance, "repo1");
        assert_eq!(config.mount_roots, vec![PathBuf::from("/data")]);
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.takeover_timeout(), DEFAULT_TAKEOVER_TIMEOUT);
        assert_eq!(config.helper_retries, HELPER_RETRY_ATTEMPTS);
        config.validate()?;
        Ok(())
    }

    #[test]
    fn test_layout_under_runtime_dir() {
        let config = DaemonConfig {
            runtime_dir: PathBuf::from("/run/user/1000"),
            instance: "main".to_string(),
            ..DaemonConfig::default()
        };
        assert_eq!(
            config.takeover_socket(),
            PathBuf::from("/run/user/1000/leapfrog/main/takeover.sock")
        );
    }

    #[test]
    fn test_validation() {
        let bad_name = DaemonConfig {
            instance: "../etc".to_string(),
            ..DaemonConfig::default()
        };
        assert!(bad_name.validate().is_err());

        let root_everything = DaemonConfig {
            mount_roots: vec![PathBuf::from("/")],
            ..DaemonConfig::default()
        };
        assert!(root_everything.validate().is_err());

        let relative_root = DaemonConfig {
            mount_roots: vec![PathBuf::from("data")],
            ..DaemonConfig::default()
        };
        assert!(relative_root.validate().is_err());
    }

    #[test]
    fn test_timeouts_are_bounded() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(file, r#"{{"takeover_timeout_secs": 18446744073709551615}}"#)?;
        let huge = DaemonConfig::load(file.path())?;
        assert_eq!(huge.takeover_timeout_secs, u64::MAX);
        assert!(huge.validate().is_err());

        let zero = DaemonConfig {
            ack_timeout_secs: 0,
            ..DaemonConfig::default()
        };
        assert!(zero.validate().is_err());

        let day = DaemonConfig {
            helper_timeout_secs: MAX_CONFIG_TIMEOUT.as_secs(),
            ..DaemonConfig::default()
        };
        day.validate()?;
        Ok(())
    }
}
