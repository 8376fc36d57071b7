//! External command execution

use tokio::process::Command;

use crate::error::{Error, Result};

/// Run a command to completion and return its trimmed stdout
///
/// A non-zero exit status is an error carrying stderr.
pub async fn run_checked(mut command: Command, label: &str) -> Result<String> {
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::ExternalOperation(format!("failed to execute {}: {}", label, e)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::ExternalOperation(format!(
            "{} failed ({}): {}",
            label,
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo ready"]);
        assert_eq!(run_checked(cmd, "echo").await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'slot exists' >&2; exit 3"]);
        let err = run_checked(cmd, "standby setup").await.unwrap_err();
        assert!(matches!(err, Error::ExternalOperation(_)));
        assert!(err.to_string().contains("slot exists"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = Command::new("/nonexistent/ispcluster-helper");
        let err = run_checked(cmd, "helper").await.unwrap_err();
        assert!(err.to_string().contains("failed to execute helper"));
    }
}
