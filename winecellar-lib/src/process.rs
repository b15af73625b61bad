//! External process execution
//!
//! Every Wine, winetricks, tar and installer invocation funnels through
//! [`ProcessRunner`]. A nonzero exit code is reported as data in
//! [`ProcessOutput`]; only a failure to start the process is an error.

use crate::error::{CellarError, Result};
use crate::prefix::WineArch;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::debug;

/// Receives output chunks as they are read
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Result of a completed process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external executables.
///
/// Holds no state beyond the optional deadline, so clones are cheap and calls
/// are independent of each other.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill processes that outlive `timeout`. Processes otherwise run unbounded.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Run to completion, capturing stdout and stderr
    pub async fn run(
        &self,
        executable: &Path,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<ProcessOutput> {
        let started = Instant::now();
        let mut command = self.command(executable, args, env, cwd);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = spawn(&mut command, executable, args)?;
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| timeout_error(executable, limit))??,
            None => child.wait_with_output().await?,
        };

        let result = ProcessOutput {
            exit_code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };
        debug!(
            "{:?} exited with {} after {:?}",
            executable, result.exit_code, result.duration
        );
        Ok(result)
    }

    /// Run to completion, delivering merged stdout/stderr chunks to `sink`
    pub async fn run_streaming(
        &self,
        executable: &Path,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
        sink: OutputSink,
    ) -> Result<i32> {
        let mut command = self.command(executable, args, env, cwd);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = spawn(&mut command, executable, args)?;
        let readers = [
            child.stdout.take().map(|out| tokio::spawn(forward(out, sink.clone()))),
            child.stderr.take().map(|err| tokio::spawn(forward(err, sink.clone()))),
        ];

        let status = self.wait(&mut child, executable).await?;
        for reader in readers.into_iter().flatten() {
            if let Ok(Err(e)) = reader.await {
                debug!("Output stream of {:?} ended with error: {}", executable, e);
            }
        }

        let code = exit_code(status);
        debug!("{:?} exited with {}", executable, code);
        Ok(code)
    }

    /// Run a single shell command line through `/bin/sh -c`
    pub async fn shell(&self, command_line: &str) -> Result<ProcessOutput> {
        self.run(
            Path::new("/bin/sh"),
            &["-c".to_string(), command_line.to_string()],
            &HashMap::new(),
            None,
        )
        .await
    }

    /// Run a Wine binary against a prefix.
    ///
    /// WINEPREFIX and WINEARCH always reflect the target prefix; WINEDEBUG
    /// defaults to `-all` unless the overlay sets it. With a sink the output is
    /// streamed and the returned stdout/stderr are empty.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_wine(
        &self,
        wine_binary: &Path,
        args: &[String],
        wineprefix: &Path,
        arch: WineArch,
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
        sink: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        let mut overlay = env.clone();
        overlay.insert(
            "WINEPREFIX".to_string(),
            wineprefix.to_string_lossy().into_owned(),
        );
        overlay.insert("WINEARCH".to_string(), arch.as_str().to_string());
        overlay
            .entry("WINEDEBUG".to_string())
            .or_insert_with(|| "-all".to_string());

        match sink {
            Some(sink) => {
                let started = Instant::now();
                let exit_code = self
                    .run_streaming(wine_binary, args, &overlay, cwd, sink)
                    .await?;
                Ok(ProcessOutput {
                    exit_code,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: started.elapsed(),
                })
            }
            None => self.run(wine_binary, args, &overlay, cwd).await,
        }
    }

    fn command(
        &self,
        executable: &Path,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Command {
        let mut command = Command::new(executable);
        command.args(args).envs(env).stdin(Stdio::null());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        if self.timeout.is_some() {
            command.kill_on_drop(true);
        }

        debug!("Running command: {:?} {:?}", executable, args);
        command
    }

    async fn wait(&self, child: &mut Child, executable: &Path) -> Result<ExitStatus> {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Ok(status?),
                Err(_) => {
                    crate::error::ignore_failure("killing timed out process", child.kill().await);
                    Err(timeout_error(executable, limit))
                }
            },
            None => Ok(child.wait().await?),
        }
    }
}

fn spawn(command: &mut Command, executable: &Path, args: &[String]) -> Result<Child> {
    command.spawn().map_err(|e| CellarError::ProcessLaunch {
        command: format!("{} {}", executable.display(), args.join(" ")),
        error: e.to_string(),
    })
}

fn timeout_error(executable: &Path, limit: Duration) -> CellarError {
    CellarError::ProcessTimeout {
        command: executable.display().to_string(),
        seconds: limit.as_secs(),
    }
}

/// Signal-terminated processes report -1
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn forward<R>(mut reader: R, sink: OutputSink) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; 4096];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            return Ok(());
        }
        sink(&String::from_utf8_lossy(&buffer[..read]));
    }
}
