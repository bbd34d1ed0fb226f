//! Encoder subprocess lifecycle: launch, stderr routing, graceful shutdown.
//!
//! `Stdio::piped()` plus `kill_on_drop` plus a spawned line-log-collector
//! task. The encoder here is not a restartable named service, so there is
//! no process registry -- just one child the supervisor owns for the
//! lifetime of the program.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::{AppError, Result};
use crate::settings::Settings;

/// How long `shutdown` waits for SIGTERM to take effect before killing.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running encoder subprocess plus whatever read end feeds its H.264
/// Annex-B byte stream to the fan-out.
pub struct EncoderProcess {
    child: Child,
}

impl EncoderProcess {
    /// Launch the encoder per `settings`: stdout (piped) or a pre-existing
    /// named pipe, with stderr either forwarded or logged to `<app>.log`.
    pub async fn spawn(
        settings: &Settings,
    ) -> Result<(Self, Box<dyn AsyncRead + Unpin + Send>)> {
        let mut command = Command::new(&settings.app);
        command.args(&settings.args).kill_on_drop(true);

        if settings.stderr {
            command.stderr(Stdio::inherit());
        } else {
            command.stderr(Stdio::piped());
        }

        if let Some(pipe_name) = &settings.pipe_name {
            // The encoder writes to a named pipe instead of stdout; the pipe
            // is expected to already exist (created by the operator, e.g.
            // via `mkfifo`) -- we only open the read end.
            command.stdout(Stdio::null());
            let mut child = Self::start(command, settings)?;
            Self::collect_stderr(&mut child, settings);

            let receiver = tokio::net::unix::pipe::OpenOptions::new()
                .open_receiver(pipe_name)
                .map_err(|e| {
                    AppError::Encoder(format!("failed to open pipe '{pipe_name}': {e}"))
                })?;

            info!(pipe = %pipe_name, "encoder started, reading from named pipe");
            return Ok((Self { child }, Box::new(receiver)));
        }

        command.stdout(Stdio::piped());
        let mut child = Self::start(command, settings)?;
        Self::collect_stderr(&mut child, settings);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Encoder("encoder stdout was not piped".to_string()))?;

        info!(app = %settings.app, "encoder started, reading from stdout");
        Ok((Self { child }, Box::new(stdout)))
    }

    fn start(mut command: Command, settings: &Settings) -> Result<Child> {
        command
            .spawn()
            .map_err(|e| AppError::Encoder(format!("failed to start '{}': {e}", settings.app)))
    }

    fn collect_stderr(child: &mut Child, settings: &Settings) {
        if settings.stderr {
            return;
        }
        let Some(stderr) = child.stderr.take() else {
            return;
        };
        let log_path = format!("{}.log", settings.app);
        tokio::spawn(async move {
            let file = match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(path = %log_path, error = %e, "failed to open encoder log file");
                    return;
                }
            };
            let mut writer = BufWriter::new(file);
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if writer.write_all(line.as_bytes()).await.is_err()
                            || writer.write_all(b"\n").await.is_err()
                            || writer.flush().await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading encoder stderr");
                        break;
                    }
                }
            }
        });
    }

    /// Send SIGTERM and wait up to `grace` for a clean exit, then hard-kill.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(error = %e, "failed to send SIGTERM to encoder, killing instead");
                let _ = self.child.start_kill();
            }
        } else {
            return;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "encoder exited"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for encoder exit"),
            Err(_) => {
                warn!("encoder did not exit within grace period, killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}
