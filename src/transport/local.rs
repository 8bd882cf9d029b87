//! KL-010: Local execution transport.

use super::ExecOutput;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// Run a shell script locally via `bash`, piped over stdin.
/// Uses bash (not sh/dash) because generated scripts use `set -o pipefail`.
pub fn exec_local(
    script: &str,
    cwd: Option<&Path>,
    env: &[(&str, String)],
) -> std::io::Result<ExecOutput> {
    let mut cmd = Command::new("bash");
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    let mut child = cmd.spawn()?;

    if let Some(ref mut stdin) = child.stdin {
        stdin.write_all(script.as_bytes())?;
    }

    let output = child.wait_with_output()?;
    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Single-quote a value for bash.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kl010_local_echo() {
        let out = exec_local("echo hello", None, &[]).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_kl010_local_failure() {
        let out = exec_local("exit 42", None, &[]).unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn test_kl010_local_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = exec_local(
            "pwd; echo \"$KILN_TEST_VAR\"",
            Some(dir.path()),
            &[("KILN_TEST_VAR", "set".to_string())],
        )
        .unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(lines[0]).canonicalize().unwrap(), canonical);
        assert_eq!(lines[1], "set");
    }

    #[test]
    fn test_kl010_local_pipefail() {
        let out = exec_local("set -euo pipefail\nfalse | true", None, &[]).unwrap();
        assert!(!out.success(), "pipefail should catch false in pipeline");
    }

    #[test]
    fn test_kl010_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        let out = exec_local(&format!("printf %s {}", shell_quote("a b'c")), None, &[]).unwrap();
        assert_eq!(out.stdout, "a b'c");
    }
}
