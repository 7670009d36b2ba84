use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Arc;

use serde::Deserialize;

use super::state::ShutdownState;

/// Decides whether shutdown waits for active clients.
///
/// Called from the blocking pool; implementations may block.
pub trait Operator: Send + Sync {
    fn confirm_wait(&self, active: usize, state: ShutdownState) -> bool;
}

/// Asks on the controlling terminal.
///
/// Without a terminal on stdin the answer is no.
#[derive(Debug, Default)]
pub struct Terminal;

impl Operator for Terminal {
    fn confirm_wait(&self, active: usize, state: ShutdownState) -> bool {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return false;
        }
        let mut stderr = io::stderr();
        let _ = write!(
            stderr,
            "{active} client(s) still connected ({state}). Wait for them to finish? [y/N] "
        );
        let _ = stderr.flush();

        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes" | "YES")
    }
}

/// Always gives the same answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Operator for FixedAnswer {
    fn confirm_wait(&self, _active: usize, _state: ShutdownState) -> bool {
        self.0
    }
}

/// Configured answer to the wait question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    /// Ask on the terminal.
    #[default]
    Prompt,
    Always,
    Never,
}

impl WaitPolicy {
    pub fn operator(self) -> Arc<dyn Operator> {
        match self {
            WaitPolicy::Prompt => Arc::new(Terminal),
            WaitPolicy::Always => Arc::new(FixedAnswer(true)),
            WaitPolicy::Never => Arc::new(FixedAnswer(false)),
        }
    }
}
