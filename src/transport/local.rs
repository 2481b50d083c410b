//! Local subprocess transport.

use super::ExecOutput;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// A subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub stdin: Option<&'a [u8]>,
    pub cwd: Option<&'a Path>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a str) -> Self {
        Self {
            program,
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdin(mut self, data: &'a [u8]) -> Self {
        self.stdin = Some(data);
        self
    }

    pub fn cwd(mut self, dir: &'a Path) -> Self {
        self.cwd = Some(dir);
        self
    }
}

/// Run a program to completion, capturing stdout and stderr.
///
/// Arguments are passed as a vector, never through a shell.
pub fn exec(inv: &Invocation) -> Result<ExecOutput, String> {
    let mut cmd = Command::new(inv.program);
    cmd.args(&inv.args)
        .stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = inv.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", inv.program, e))?;

    if let (Some(data), Some(mut stdin)) = (inv.stdin, child.stdin.take()) {
        // A child that exits without reading stdin closes the pipe early.
        if let Err(e) = stdin.write_all(data) {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(format!("stdin write error: {}", e));
            }
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("wait error: {}", e))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_echo() {
        let out = exec(&Invocation::new("echo").arg("hello")).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_exec_failure_code() {
        let out = exec(&Invocation::new("sh").arg("-c").arg("exit 42")).unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn test_exec_stdin_piped() {
        let out = exec(&Invocation::new("cat").stdin(b"from stdin")).unwrap();
        assert_eq!(out.stdout, "from stdin");
    }

    #[test]
    fn test_exec_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let out = exec(&Invocation::new("pwd").cwd(&canonical)).unwrap();
        assert_eq!(out.stdout.trim(), canonical.to_str().unwrap());
    }

    #[test]
    fn test_exec_missing_program() {
        let result = exec(&Invocation::new("/nonexistent/pkgsmith-tool"));
        assert!(result.unwrap_err().contains("failed to spawn"));
    }

    #[test]
    fn test_exec_signal_killed() {
        let out = exec(&Invocation::new("sh").arg("-c").arg("kill -9 $$")).unwrap();
        assert_eq!(out.exit_code, -1);
    }
}
