//! Environment-driven configuration for a suite run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::config::Kubeconfig;
use tracing::debug;

use crate::cli::{Cli, ProcessRunner};
use crate::error::{E2eError, E2eResult};

pub const ENV_KUBECONFIG: &str = "KUBECONFIG";
pub const ENV_ADMIN_KUBECONFIG: &str = "E2E_ADMIN_KUBECONFIG";
pub const ENV_CLI_BINARY: &str = "E2E_CLI_BINARY";
pub const ENV_OUTPUT_DIR: &str = "E2E_OUTPUT_DIR";
pub const ENV_FIXTURE_DIR: &str = "E2E_FIXTURE_DIR";

/// Where the suite finds the cluster, its tools and its fixtures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E2eConfig {
    /// `oc` or `kubectl`, or a path to either
    pub binary: String,
    pub kubeconfig: PathBuf,
    /// Cluster-admin credentials, used for cluster-scoped objects
    pub admin_kubeconfig: PathBuf,
    /// Directory rendered manifests are written to
    pub output_dir: PathBuf,
    /// Directory relative template paths resolve against
    pub fixture_dir: PathBuf,
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// `~/.kube/config`.
#[must_use]
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".kube").join("config"))
}

/// `oc` when it is on `PATH`, `kubectl` otherwise.
#[must_use]
pub fn detect_binary() -> String {
    if which::which("oc").is_ok() {
        "oc".to_string()
    } else {
        "kubectl".to_string()
    }
}

impl E2eConfig {
    /// Build from the environment; `default_fixture_dir` applies when
    /// `E2E_FIXTURE_DIR` is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if no kubeconfig location can be determined.
    pub fn from_env(default_fixture_dir: impl Into<PathBuf>) -> E2eResult<Self> {
        let kubeconfig = env_path(ENV_KUBECONFIG)
            .or_else(default_kubeconfig_path)
            .ok_or_else(|| E2eError::Config {
                reason: "KUBECONFIG is unset and the home directory is unknown".to_string(),
            })?;
        let admin_kubeconfig = env_path(ENV_ADMIN_KUBECONFIG).unwrap_or_else(|| kubeconfig.clone());
        let binary = std::env::var(ENV_CLI_BINARY)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(detect_binary);
        let output_dir = env_path(ENV_OUTPUT_DIR).unwrap_or_else(std::env::temp_dir);
        let fixture_dir = env_path(ENV_FIXTURE_DIR).unwrap_or_else(|| default_fixture_dir.into());

        let config = Self {
            binary,
            kubeconfig,
            admin_kubeconfig,
            output_dir,
            fixture_dir,
        };
        debug!(?config, "Loaded e2e configuration");
        Ok(config)
    }

    /// Check that both kubeconfigs parse and name a current context.
    /// Returns the user context name.
    ///
    /// # Errors
    ///
    /// Returns an error if a kubeconfig is unreadable or has no current
    /// context.
    pub fn validate(&self) -> E2eResult<String> {
        let context = current_context(&self.kubeconfig)?;
        if self.admin_kubeconfig != self.kubeconfig {
            current_context(&self.admin_kubeconfig)?;
        }
        if !self.fixture_dir.is_dir() {
            return Err(E2eError::Config {
                reason: format!(
                    "fixture directory '{}' does not exist",
                    self.fixture_dir.display()
                ),
            });
        }
        Ok(context)
    }

    /// A CLI handle that spawns real processes.
    #[must_use]
    pub fn cli(&self) -> Cli {
        Cli::new(self.binary.clone(), Arc::new(ProcessRunner))
            .with_kubeconfig(&self.kubeconfig)
            .with_admin_kubeconfig(&self.admin_kubeconfig)
            .with_fixture_dir(&self.fixture_dir)
            .with_output_dir(&self.output_dir)
    }
}

/// Current context of the kubeconfig at `path`.
///
/// # Errors
///
/// Returns an error if the file does not parse or has no current context.
pub fn current_context(path: &Path) -> E2eResult<String> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| E2eError::Kubeconfig {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    kubeconfig
        .current_context
        .filter(|context| !context.is_empty())
        .ok_or_else(|| E2eError::Kubeconfig {
            path: path.display().to_string(),
            reason: "no current-context".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KUBECONFIG: &str = r"apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: https://127.0.0.1:6443
users:
- name: admin
  user:
    token: abc
contexts:
- name: admin@test
  context:
    cluster: test
    user: admin
current-context: admin@test
";

    fn clear_env() {
        // SAFETY: tests touching the environment run serially via #[serial]
        unsafe {
            for key in [
                ENV_KUBECONFIG,
                ENV_ADMIN_KUBECONFIG,
                ENV_CLI_BINARY,
                ENV_OUTPUT_DIR,
                ENV_FIXTURE_DIR,
            ] {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        // SAFETY: serialized
        unsafe {
            std::env::set_var(ENV_KUBECONFIG, "/tmp/user.kubeconfig");
            std::env::set_var(ENV_ADMIN_KUBECONFIG, "/tmp/admin.kubeconfig");
            std::env::set_var(ENV_CLI_BINARY, "kubectl");
            std::env::set_var(ENV_OUTPUT_DIR, "/tmp/manifests");
        }
        let config = E2eConfig::from_env("/fixtures").unwrap();
        assert_eq!(config.kubeconfig, PathBuf::from("/tmp/user.kubeconfig"));
        assert_eq!(config.admin_kubeconfig, PathBuf::from("/tmp/admin.kubeconfig"));
        assert_eq!(config.binary, "kubectl");
        assert_eq!(config.output_dir, PathBuf::from("/tmp/manifests"));
        assert_eq!(config.fixture_dir, PathBuf::from("/fixtures"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_admin_defaults_to_user_kubeconfig() {
        clear_env();
        // SAFETY: serialized
        unsafe {
            std::env::set_var(ENV_KUBECONFIG, "/tmp/only.kubeconfig");
        }
        let config = E2eConfig::from_env("/fixtures").unwrap();
        assert_eq!(config.admin_kubeconfig, config.kubeconfig);
        clear_env();
    }

    #[test]
    fn test_validate_reads_current_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, KUBECONFIG).unwrap();
        let config = E2eConfig {
            binary: "oc".to_string(),
            kubeconfig: path.clone(),
            admin_kubeconfig: path,
            output_dir: dir.path().to_path_buf(),
            fixture_dir: dir.path().to_path_buf(),
        };
        assert_eq!(config.validate().unwrap(), "admin@test");
    }

    #[test]
    fn test_validate_rejects_missing_file() {
        let config = E2eConfig {
            binary: "oc".to_string(),
            kubeconfig: PathBuf::from("/nonexistent/kubeconfig"),
            admin_kubeconfig: PathBuf::from("/nonexistent/kubeconfig"),
            output_dir: std::env::temp_dir(),
            fixture_dir: std::env::temp_dir(),
        };
        assert!(matches!(config.validate(), Err(E2eError::Kubeconfig { .. })));
    }
}
