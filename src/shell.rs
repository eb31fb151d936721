//! Privileged command execution
//!
//! appwall runs as an unprivileged app and only reaches for privileges
//! through two channels:
//!
//! - **Root**: a `su` binary (Magisk, KernelSU, ...) that runs a shell script as uid 0
//! - **Broker**: a broker shell (`rish` for Shizuku) that runs commands with
//!   the broker's elevated (shell or system) identity
//!
//! Every invocation is bounded by a timeout. A root manager that never
//! answers its prompt must not hang the caller.
//!
//! # Environment Variables
//!
//! - `APPWALL_SU_COMMAND`: Override the `su` binary (e.g. `/system/xbin/su`).
//! - `APPWALL_BROKER_COMMAND`: Override the broker shell binary (default `rish`).
//!
//! # Security
//!
//! - Scripts are passed on stdin, never interpolated into an argv string
//! - Callers validate package names and UIDs before building scripts
//!   (see [`crate::validators`])

use crate::core::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Converts a non-zero exit into `Error::PermissionDenied` or the error built by `on_fail`.
    pub fn check(self, on_fail: impl FnOnce(String) -> Error) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let message = if self.stderr.trim().is_empty() {
            format!("exit code {:?}", self.exit_code)
        } else {
            self.stderr.trim().to_string()
        };
        if is_denial(&message) {
            Err(Error::PermissionDenied(message))
        } else {
            Err(on_fail(message))
        }
    }
}

/// Whether stderr text reads like a privilege denial.
pub fn is_denial(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("permission denied")
        || lower.contains("not allowed")
        || lower.contains("access denied")
        || lower.contains("operation not permitted")
}

/// Checks if a binary exists in PATH (or is an existing absolute path)
pub fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Resolves a program name from an override variable, falling back to `default`.
fn resolve_program(env_var: &str, default: &str) -> String {
    match std::env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Runs `program args...`, optionally feeding `stdin`, bounded by `timeout`.
///
/// # Errors
///
/// - `Error::Unavailable` if the program cannot be found
/// - `Error::Timeout` if it does not finish in time (the child is killed)
/// - `Error::Io` for other spawn or pipe failures
pub async fn run_with_timeout(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
    timeout: Duration,
    operation: &str,
) -> Result<ShellOutput> {
    debug!("Running {} {:?} ({})", program, args, operation);

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Unavailable(format!("{program} not found"))
            } else {
                Error::Io(e)
            }
        })?;

    let run = async {
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }
        child.wait_with_output().await
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(output) => {
            let output = output?;
            Ok(ShellOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Err(_) => {
            warn!("{} timed out after {:?}", operation, timeout);
            Err(Error::Timeout {
                operation: operation.to_string(),
                secs: timeout.as_secs(),
            })
        }
    }
}

/// Root shell capability
#[async_trait]
pub trait RootShell: Send + Sync {
    /// Whether the privileged binary exists at all.
    fn is_present(&self) -> bool;

    /// Runs `script` as root.
    async fn exec(&self, script: &str, timeout: Duration) -> Result<ShellOutput>;
}

/// `su`-backed root shell
#[derive(Debug, Clone)]
pub struct SuShell {
    program: String,
}

impl Default for SuShell {
    fn default() -> Self {
        Self::new()
    }
}

impl SuShell {
    pub fn new() -> Self {
        Self {
            program: resolve_program("APPWALL_SU_COMMAND", "su"),
        }
    }

    /// Program that runs root scripts. Already-root callers skip `su`.
    fn launcher(&self) -> &str {
        if nix::unistd::getuid().is_root() {
            return "sh";
        }
        &self.program
    }
}

#[async_trait]
impl RootShell for SuShell {
    fn is_present(&self) -> bool {
        binary_exists(self.launcher())
    }

    async fn exec(&self, script: &str, timeout: Duration) -> Result<ShellOutput> {
        run_with_timeout(self.launcher(), &[], Some(script), timeout, "root command").await
    }
}

/// Program used to reach the broker shell.
pub fn broker_program() -> String {
    resolve_program("APPWALL_BROKER_COMMAND", "rish")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        // This should not exist
        assert!(!binary_exists("appwall_nonexistent_binary_xyz"));
        assert!(!binary_exists("/nonexistent/dir/su"));
    }

    #[test]
    fn test_launcher_uses_su_unless_root() {
        let shell = SuShell {
            program: "/custom/su".to_string(),
        };
        let expected = if nix::unistd::getuid().is_root() {
            "sh"
        } else {
            "/custom/su"
        };
        assert_eq!(shell.launcher(), expected);
    }

    #[test]
    fn test_denial_detection() {
        assert!(is_denial("su: Permission denied"));
        assert!(is_denial("Operation not permitted"));
        assert!(!is_denial("iptables: No chain/target/match by that name."));
    }

    #[test]
    fn test_check_maps_denial() {
        let output = ShellOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "permission denied".into(),
        };
        assert!(matches!(
            output.check(Error::Internal),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_check_uses_builder_for_other_failures() {
        let output = ShellOutput {
            exit_code: Some(2),
            stdout: String::new(),
            stderr: "bad rule".into(),
        };
        match output.check(Error::Internal) {
            Err(Error::Internal(msg)) => assert_eq!(msg, "bad rule"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_with_stdin() {
        let output = run_with_timeout(
            "sh",
            &[],
            Some("echo hello\n"),
            Duration::from_secs(5),
            "test",
        )
        .await
        .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let result = run_with_timeout(
            "appwall_nonexistent_binary_xyz",
            &[],
            None,
            Duration::from_secs(1),
            "test",
        )
        .await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_hung_command_times_out() {
        let result = run_with_timeout(
            "sh",
            &["-c", "sleep 5"],
            None,
            Duration::from_millis(100),
            "slow",
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }
}
