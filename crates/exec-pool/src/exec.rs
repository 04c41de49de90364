//! Remote command execution on pool pods.
//!
//! [`CommandExecutor`] is stateless: it never touches the service lock and
//! may be shared freely across tasks.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::types::PodRef;
use crate::{ClusterError, ExecPoolError, Result};

/// Output captured from a remote shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl ShellOutput {
    /// Whether the remote command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Transport that runs a command inside a pod.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `argv` in pod `namespace/pod`.
    ///
    /// A non-zero exit is reported through [`ShellOutput::exit_code`], not as
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be delivered at all.
    async fn execute(
        &self,
        namespace: &str,
        pod: &str,
        argv: &[String],
    ) -> std::result::Result<ShellOutput, ClusterError>;
}

/// [`RemoteShell`] that shells out to `kubectl exec`.
#[derive(Debug, Clone)]
pub struct KubectlShell {
    kubectl: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl Default for KubectlShell {
    fn default() -> Self {
        Self {
            kubectl: PathBuf::from("kubectl"),
            kubeconfig: None,
        }
    }
}

impl KubectlShell {
    /// Use `kubectl` from `PATH` with its default kubeconfig.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `kubectl` binary.
    #[must_use]
    pub fn with_binary(mut self, kubectl: impl Into<PathBuf>) -> Self {
        self.kubectl = kubectl.into();
        self
    }

    /// Pass `--kubeconfig` to every invocation.
    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(kubeconfig.into());
        self
    }

    fn command(&self, namespace: &str, pod: &str, argv: &[String]) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.arg("exec")
            .arg(format!("--namespace={namespace}"))
            .arg(pod)
            .arg("--")
            .args(argv)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteShell for KubectlShell {
    async fn execute(
        &self,
        namespace: &str,
        pod: &str,
        argv: &[String],
    ) -> std::result::Result<ShellOutput, ClusterError> {
        let output = self.command(namespace, pod, argv).output().await?;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Wrap a command line for `/bin/sh -x -c`.
#[must_use]
pub fn shell_argv(command: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-x".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]
}

/// Runs shell commands on pool pods.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor<S = KubectlShell> {
    shell: S,
}

impl<S: RemoteShell> CommandExecutor<S> {
    /// Create an executor over the given transport.
    #[must_use]
    pub fn new(shell: S) -> Self {
        Self { shell }
    }

    /// Run `command` through `/bin/sh` on `pod` and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`ExecPoolError::ExecutionFailed`] if the command exits
    /// non-zero or cannot be delivered. The error carries the captured
    /// stderr, available through [`ExecPoolError::output`].
    pub async fn run_command(&self, pod: &PodRef, command: &str) -> Result<String> {
        debug!(pod = %pod, command, "Running command on exec pod");

        match self
            .shell
            .execute(&pod.namespace, &pod.name, &shell_argv(command))
            .await
        {
            Ok(output) if output.success() => Ok(output.stdout),
            Ok(output) => Err(ExecPoolError::ExecutionFailed {
                pod: pod.to_string(),
                reason: match output.exit_code {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                },
                stderr: output.stderr,
            }),
            Err(e) => Err(ExecPoolError::ExecutionFailed {
                pod: pod.to_string(),
                stderr: String::new(),
                reason: e.to_string(),
            }),
        }
    }
}

/// In-memory shell for testing without a cluster.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    enum Reply {
        Output(ShellOutput),
        Unreachable(String),
    }

    /// A shell that answers every call with the same canned reply and records
    /// the `namespace/pod` targets it was called for.
    pub struct MockShell {
        reply: Reply,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MockShell {
        /// Exit 0 printing `stdout`.
        #[must_use]
        pub fn succeeding(stdout: impl Into<String>) -> Self {
            Self::with_output(ShellOutput {
                stdout: stdout.into(),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }

        /// Exit with `code` printing `stderr`.
        #[must_use]
        pub fn failing(code: i32, stderr: impl Into<String>) -> Self {
            Self::with_output(ShellOutput {
                stdout: String::new(),
                stderr: stderr.into(),
                exit_code: Some(code),
            })
        }

        /// Fail delivery with a transport error.
        #[must_use]
        pub fn unreachable(message: impl Into<String>) -> Self {
            Self {
                reply: Reply::Unreachable(message.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_output(output: ShellOutput) -> Self {
            Self {
                reply: Reply::Output(output),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Recorded `(namespace/pod, argv)` pairs.
        #[must_use]
        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteShell for MockShell {
        async fn execute(
            &self,
            namespace: &str,
            pod: &str,
            argv: &[String],
        ) -> std::result::Result<ShellOutput, ClusterError> {
            self.calls
                .lock()
                .push((format!("{namespace}/{pod}"), argv.to_vec()));
            match &self.reply {
                Reply::Output(output) => Ok(output.clone()),
                Reply::Unreachable(message) => Err(ClusterError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    message.clone(),
                ))),
            }
        }
    }
}
