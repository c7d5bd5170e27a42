//! Progress bridge
//!
//! Reads a running process line by line, classifies each line and publishes
//! the result. Every line yields exactly one event; the process exit yields
//! one final `Complete` or `Error` event.

use std::collections::VecDeque;

use tokio::task::JoinHandle;

use super::{LineMatcher, ProgressEvent, ProgressHub, Subscription};
use crate::error::RunnerError;
use crate::runner::RunningProcess;
use crate::{log_debug, log_warn};

const MODULE: &str = "progress::bridge";

/// Bounded ring of the most recent output lines
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn extend(&mut self, lines: impl IntoIterator<Item = String>) {
        for line in lines {
            self.push(line);
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// How a bridged process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    /// Last output lines, oldest first
    pub output_tail: Vec<String>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Events of one bridged process plus its eventual outcome
pub struct ProgressStream {
    hub: ProgressHub<ProgressEvent>,
    task: JoinHandle<Result<ProcessOutcome, RunnerError>>,
}

impl ProgressStream {
    pub fn subscribe(&self) -> Subscription<ProgressEvent> {
        self.hub.subscribe()
    }

    /// Wait for the process to exit and its output to be fully published
    pub async fn wait(self) -> Result<ProcessOutcome, RunnerError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RunnerError::Wait {
                program: "progress bridge".to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

pub struct ProgressBridge;

impl ProgressBridge {
    /// Bridge a process whose output never carries download progress
    pub fn attach(process: RunningProcess, tail_lines: usize) -> ProgressStream {
        Self::attach_with(process, LineMatcher::after_download(), tail_lines)
    }

    pub fn attach_with(
        mut process: RunningProcess,
        mut matcher: LineMatcher,
        tail_lines: usize,
    ) -> ProgressStream {
        let hub = ProgressHub::new();
        let publisher = hub.clone();

        let task = tokio::spawn(async move {
            let program = process.program.clone();
            let mut tail = OutputTail::new(tail_lines);

            while let Some(line) = process.next_line().await {
                log_debug!(MODULE, "[{}] {}", program, line);
                publisher.publish(matcher.classify(&line));
                tail.push(line);
            }

            match process.wait().await {
                Ok(exit_code) => {
                    publisher.close(if exit_code == 0 {
                        ProgressEvent::complete()
                    } else {
                        ProgressEvent::error(exit_code)
                    });
                    Ok(ProcessOutcome {
                        exit_code,
                        output_tail: tail.lines(),
                    })
                }
                Err(e) => {
                    log_warn!(MODULE, "{}", e);
                    publisher.close(ProgressEvent::error(-1));
                    Err(e)
                }
            }
        });

        ProgressStream { hub, task }
    }
}
