//! External tool runner
//!
//! Spawns host tools (tar, vendor flash scripts, chown) and exposes their
//! merged stdout/stderr as a line stream plus an exit code. The sequencer
//! and progress bridge depend only on the [`ToolRunner`] trait.

mod process;

pub use process::TokioRunner;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::RunnerError;

/// A concrete invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Run through the configured privilege command unless already root
    pub privileged: bool,
}

impl ToolCommand {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            cwd: None,
            env: Vec::new(),
            privileged: false,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// A spawned process: merged output lines, then an exit code
///
/// The line channel closes once both output pipes reach EOF; the exit code
/// is delivered after that, so draining lines before waiting never misses
/// output.
pub struct RunningProcess {
    pub program: String,
    lines: mpsc::Receiver<String>,
    exit: oneshot::Receiver<Result<i32, String>>,
}

impl RunningProcess {
    pub fn new(
        program: String,
        lines: mpsc::Receiver<String>,
        exit: oneshot::Receiver<Result<i32, String>>,
    ) -> Self {
        Self {
            program,
            lines,
            exit,
        }
    }

    /// An already-finished process with canned output
    pub fn finished(program: &str, output: Vec<String>, exit_code: i32) -> Self {
        let (line_tx, line_rx) = mpsc::channel(output.len().max(1));
        for line in output {
            // Capacity covers every line
            let _ = line_tx.try_send(line);
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = exit_tx.send(Ok(exit_code));
        Self::new(program.to_string(), line_rx, exit_rx)
    }

    /// Next output line, `None` once output is exhausted
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Wait for the exit code (drop remaining output)
    pub async fn wait(self) -> Result<i32, RunnerError> {
        let program = self.program;
        match self.exit.await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(reason)) => Err(RunnerError::Wait { program, reason }),
            Err(_) => Err(RunnerError::Wait {
                program,
                reason: "process monitor went away".to_string(),
            }),
        }
    }
}

/// Process spawning capability
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn spawn(&self, command: &ToolCommand) -> Result<RunningProcess, RunnerError>;

    /// Run to completion, returning exit code and all output lines
    async fn run(&self, command: &ToolCommand) -> Result<(i32, Vec<String>), RunnerError> {
        let mut process = self.spawn(command).await?;
        let mut output = Vec::new();
        while let Some(line) = process.next_line().await {
            output.push(line);
        }
        let code = process.wait().await?;
        Ok((code, output))
    }
}
