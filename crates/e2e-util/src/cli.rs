//! Wrapper around the cluster command-line client.
//!
//! Every cluster interaction goes through `oc` or `kubectl`. A [`Cli`] knows
//! which binary to call, which kubeconfig to use (user or admin), and which
//! project namespace is current. The process itself is spawned by a
//! [`CommandRunner`], so tests can substitute scripted output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::jsonpath::{self, JsonEdit};
use crate::random::random_string;
use crate::template::{write_manifest, ManifestRenderer};

/// Captured result of one process run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[must_use]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Spawns the CLI binary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> E2eResult<CommandOutput>;
}

/// Runs commands as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> E2eResult<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| E2eError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Handle on the cluster CLI for one test project.
#[derive(Clone)]
pub struct Cli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    kubeconfig: Option<PathBuf>,
    admin_kubeconfig: Option<PathBuf>,
    namespace: Option<String>,
    fixture_dir: PathBuf,
    output_dir: PathBuf,
    as_admin: bool,
    without_namespace: bool,
}

impl fmt::Debug for Cli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cli")
            .field("binary", &self.binary)
            .field("kubeconfig", &self.kubeconfig)
            .field("admin_kubeconfig", &self.admin_kubeconfig)
            .field("namespace", &self.namespace)
            .field("as_admin", &self.as_admin)
            .field("without_namespace", &self.without_namespace)
            .finish_non_exhaustive()
    }
}

impl Cli {
    pub fn new(binary: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            kubeconfig: None,
            admin_kubeconfig: None,
            namespace: None,
            fixture_dir: PathBuf::from("."),
            output_dir: std::env::temp_dir(),
            as_admin: false,
            without_namespace: false,
        }
    }

    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_admin_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.admin_kubeconfig = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_fixture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fixture_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Copy that authenticates with the admin kubeconfig.
    #[must_use]
    pub fn as_admin(&self) -> Self {
        let mut cli = self.clone();
        cli.as_admin = true;
        cli
    }

    /// Copy that does not inject `--namespace`.
    #[must_use]
    pub fn without_namespace(&self) -> Self {
        let mut cli = self.clone();
        cli.without_namespace = true;
        cli
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// True when driving an OpenShift cluster through `oc`.
    #[must_use]
    pub fn is_openshift(&self) -> bool {
        Path::new(&self.binary)
            .file_name()
            .is_some_and(|name| name == "oc")
    }

    /// Current project namespace, empty before [`Cli::setup_project`].
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn fixture_dir(&self) -> &Path {
        &self.fixture_dir
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Start building an invocation of `verb`.
    pub fn run(&self, verb: impl Into<String>) -> Invocation<'_> {
        Invocation {
            cli: self,
            verb: verb.into(),
            args: Vec::new(),
        }
    }

    fn active_kubeconfig(&self) -> Option<&PathBuf> {
        if self.as_admin {
            self.admin_kubeconfig.as_ref().or(self.kubeconfig.as_ref())
        } else {
            self.kubeconfig.as_ref()
        }
    }

    /// Resolve a template path against the fixture directory.
    #[must_use]
    pub fn fixture(&self, template: &Path) -> PathBuf {
        if template.is_absolute() {
            template.to_path_buf()
        } else {
            self.fixture_dir.join(template)
        }
    }

    /// Render `template` with `params`, apply `edits`, write the manifest to
    /// the output directory and `apply` it. Returns the CLI output.
    ///
    /// # Errors
    ///
    /// Returns rendering or edit errors, or the CLI failure (with stderr) when
    /// the cluster rejects the object.
    pub async fn apply_template(
        &self,
        template: &Path,
        params: &[(&str, &str)],
        edits: &[JsonEdit],
    ) -> E2eResult<String> {
        let (stdout, _) = self.apply_template_outputs(template, params, edits).await?;
        Ok(stdout.trim().to_string())
    }

    /// Same as [`Cli::apply_template`] but returns `(stdout, stderr)`.
    /// Admission warnings are only visible on stderr.
    ///
    /// # Errors
    ///
    /// Returns rendering or edit errors, or the CLI failure.
    pub async fn apply_template_outputs(
        &self,
        template: &Path,
        params: &[(&str, &str)],
        edits: &[JsonEdit],
    ) -> E2eResult<(String, String)> {
        let template = self.fixture(template);
        let mut doc = ManifestRenderer::new().render_list(&template, params)?;
        jsonpath::apply_edits(&mut doc, edits)?;
        let manifest = write_manifest(&self.output_dir, self.namespace(), &doc)?;
        debug!(
            template = %template.display(),
            manifest = %manifest.display(),
            "Applying rendered manifest"
        );
        self.without_namespace()
            .run("apply")
            .args(["-f".to_string(), manifest.display().to_string()])
            .outputs()
            .await
    }

    /// Create a fresh project namespace and make it current.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be created.
    pub async fn setup_project(&mut self) -> E2eResult<String> {
        let name = format!("e2e-test-storage-{}", random_string());
        let admin = self.as_admin().without_namespace();
        admin.run("create").args(["namespace", &name]).execute().await?;
        admin
            .run("label")
            .args([
                "namespace",
                &name,
                "pod-security.kubernetes.io/enforce=privileged",
                "pod-security.kubernetes.io/audit=privileged",
                "pod-security.kubernetes.io/warn=privileged",
                "--overwrite",
            ])
            .execute()
            .await?;
        info!(namespace = %name, "Created test project");
        self.namespace = Some(name.clone());
        Ok(name)
    }

    /// Delete the current project namespace without waiting.
    pub async fn teardown_project(&self) {
        let Some(name) = self.namespace.as_deref() else {
            return;
        };
        let result = self
            .as_admin()
            .without_namespace()
            .run("delete")
            .args(["namespace", name, "--ignore-not-found", "--wait=false"])
            .execute()
            .await;
        match result {
            Ok(()) => info!(namespace = %name, "Deleted test project"),
            Err(e) => warn!(namespace = %name, error = %e, "Failed to delete test project"),
        }
    }
}

/// One pending CLI call.
pub struct Invocation<'a> {
    cli: &'a Cli,
    verb: String,
    args: Vec<String>,
}

impl Invocation<'_> {
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Full argument vector passed to the binary.
    #[must_use]
    pub fn command_args(&self) -> Vec<String> {
        let mut full = vec![self.verb.clone()];
        if let Some(path) = self.cli.active_kubeconfig() {
            full.push(format!("--kubeconfig={}", path.display()));
        }
        if !self.cli.without_namespace {
            if let Some(ns) = self.cli.namespace.as_deref() {
                full.push(format!("--namespace={ns}"));
            }
        }
        full.extend(self.args.iter().cloned());
        full
    }

    /// Run and return `(stdout, stderr)`.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` on a non-zero exit.
    pub async fn outputs(self) -> E2eResult<(String, String)> {
        let args = self.command_args();
        let command = format!("{} {}", self.cli.binary, args.join(" "));
        debug!(command = %command, "Running");
        let output = self.cli.runner.run(&self.cli.binary, &args).await?;
        if !output.success {
            debug!(command = %command, stderr = %output.stderr.trim(), "Command failed");
            return Err(E2eError::CommandFailed {
                command,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok((output.stdout, output.stderr))
    }

    /// Run and return trimmed stdout.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` on a non-zero exit.
    pub async fn output(self) -> E2eResult<String> {
        let (stdout, _) = self.outputs().await?;
        Ok(stdout.trim().to_string())
    }

    /// Run and discard the output.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` on a non-zero exit.
    pub async fn execute(self) -> E2eResult<()> {
        self.outputs().await.map(|_| ())
    }
}
