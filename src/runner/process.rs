//! Tokio-backed process runner
//!
//! Privileged commands are prefixed with the configured privilege command
//! (`sudo -n -E` by default) unless the process already runs as root.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use super::{RunningProcess, ToolCommand, ToolRunner};
use crate::config;
use crate::error::RunnerError;
use crate::utils::is_root;
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "runner";

pub struct TokioRunner {
    privilege_command: Vec<String>,
}

impl TokioRunner {
    pub fn new(privilege_command: Vec<String>) -> Self {
        Self { privilege_command }
    }

    /// Program and argument vector after privilege wrapping
    fn command_line(&self, command: &ToolCommand) -> (String, Vec<String>) {
        let elevate = command.privileged && !is_root();
        match self.privilege_command.split_first() {
            Some((wrapper, wrapper_args)) if elevate => {
                let mut args = wrapper_args.to_vec();
                args.push(command.program.clone());
                args.extend(command.args.iter().cloned());
                (wrapper.clone(), args)
            }
            _ => (command.program.clone(), command.args.clone()),
        }
    }
}

#[async_trait]
impl ToolRunner for TokioRunner {
    async fn spawn(&self, command: &ToolCommand) -> Result<RunningProcess, RunnerError> {
        let (program, args) = self.command_line(command);
        log_info!(MODULE, "Running: {} {}", program, args.join(" "));
        if let Some(cwd) = &command.cwd {
            log_debug!(MODULE, "Working directory: {}", cwd.display());
        }

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (line_tx, line_rx) = mpsc::channel(config::session::LINE_CHANNEL_CAPACITY);
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, line_tx.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, line_tx.clone())));
        drop(line_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let name = command.program.clone();
        tokio::spawn(async move {
            // Drain both pipes before reporting the exit code
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            let result = match child.wait().await {
                Ok(status) => {
                    let code = exit_code(status);
                    log_debug!(MODULE, "{} exited with code {}", name, code);
                    Ok(code)
                }
                Err(e) => {
                    log_warn!(MODULE, "Failed to wait for {}: {}", name, e);
                    Err(e.to_string())
                }
            };
            let _ = exit_tx.send(result);
        });

        Ok(RunningProcess::new(command.program.clone(), line_rx, exit_rx))
    }
}

/// Forward output lines, splitting on `\r` as well so carriage-return
/// progress meters produce one line per update
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                for part in text.trim_end_matches(['\n', '\r']).split('\r') {
                    if part.is_empty() {
                        continue;
                    }
                    if tx.send(part.to_string()).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                log_warn!(MODULE, "Output read error: {}", e);
                break;
            }
        }
    }
}

/// Exit code, mapping signal termination to the shell's `128 + signal`
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
