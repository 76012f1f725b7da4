use std::time::Duration;

use thiserror::Error;

/// Hard timeout for a single CLI invocation.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Output larger than this is treated as a fetch error.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TermError {
    #[error("terminal command failed: {0}")]
    CommandFailed(String),
    #[error("terminal-read not found")]
    NotFound,
    #[error("terminal read timed out after {0:?}")]
    Timeout(Duration),
    #[error("terminal output exceeded {0} bytes")]
    OutputTooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability seam between the poller and the terminal multiplexer.
///
/// Production uses [`TermExecutor`]; tests script snapshots with a fake.
pub trait PaneFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        pane_id: &str,
    ) -> impl std::future::Future<Output = Result<String, TermError>> + Send;
}

/// Executor for the external `terminal-read` CLI.
///
/// Each fetch spawns `terminal-read -p <paneId>` and returns its stdout.
/// Non-zero exit is a failure; stderr noise with a zero exit is not.
/// Invocations are bounded by [`READ_TIMEOUT`] and [`MAX_OUTPUT_BYTES`];
/// exceeding either is reported as an error so the poller can back off.
#[derive(Debug, Clone)]
pub struct TermExecutor {
    bin: String,
    timeout: Duration,
    max_output: usize,
}

impl TermExecutor {
    /// Executor using the default `terminal-read` binary on `$PATH`.
    pub fn new() -> Self {
        Self::with_bin("terminal-read")
    }

    /// Executor using a custom binary path.
    pub fn with_bin(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            timeout: READ_TIMEOUT,
            max_output: MAX_OUTPUT_BYTES,
        }
    }

    /// Override the invocation bounds. Mostly for tests.
    pub fn with_limits(mut self, timeout: Duration, max_output: usize) -> Self {
        self.timeout = timeout;
        self.max_output = max_output;
        self
    }

    /// Fetch the current screen content of a pane.
    pub async fn read_pane(&self, pane_id: &str) -> Result<String, TermError> {
        let mut command = tokio::process::Command::new(&self.bin);
        command.arg("-p").arg(pane_id).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TermError::NotFound);
            }
            Ok(Err(e)) => return Err(TermError::Io(e)),
            Err(_) => return Err(TermError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TermError::CommandFailed(format!(
                "exit {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                stderr.trim(),
            )));
        }

        if output.stdout.len() > self.max_output {
            return Err(TermError::OutputTooLarge(output.stdout.len()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TermExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PaneFetcher for TermExecutor {
    fn fetch(
        &self,
        pane_id: &str,
    ) -> impl std::future::Future<Output = Result<String, TermError>> + Send {
        self.read_pane(pane_id)
    }
}
