//! Local subprocess execution for external tools and processors.

pub mod local;

/// Output from running a subprocess.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// One-line failure description for error messages.
    pub fn failure_summary(&self, program: &str) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("{} exited with code {}", program, self.exit_code)
        } else {
            format!("{} exited with code {}: {}", program, self.exit_code, stderr)
        }
    }
}
