//! Platform command execution
//!
//! Every kernel-facing adapter shells out to the standard Linux tools through
//! a [`CommandRunner`]. [`SystemRunner`] spawns real processes;
//! [`RecordingRunner`] captures invocations so command construction can be
//! asserted without touching the host.

pub mod linux;

pub use linux::{IpRoute, LinkInfo, SystemRunner};

use crate::error::{BrgError, Result};
use std::sync::{Arc, Mutex};

/// Runs external programs
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, feeding `stdin` if given, and return stdout.
    /// A non-zero exit status is an `AdapterFailure` carrying stderr.
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        (**self).run(program, args, stdin)
    }
}

/// One captured command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Data written to stdin
    pub stdin: Option<String>,
}

impl Invocation {
    /// Program and arguments joined by spaces
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

enum Reply {
    Output(String),
    Fail(String),
}

/// Command runner double that records calls and replays canned output.
///
/// Replies are matched by command-line prefix; the most recently registered
/// matching prefix wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    replies: Mutex<Vec<(String, Reply)>>,
}

impl RecordingRunner {
    /// Create an empty runner
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to commands starting with `prefix` with `output`
    pub fn respond(&self, prefix: &str, output: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push((prefix.to_string(), Reply::Output(output.to_string())));
        }
    }

    /// Fail commands starting with `prefix`
    pub fn fail(&self, prefix: &str, stderr: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push((prefix.to_string(), Reply::Fail(stderr.to_string())));
        }
    }

    /// Captured invocations in call order
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Captured command lines in call order
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command_line).collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stdin: stdin.map(str::to_string),
        };
        let line = invocation.command_line();
        self.calls
            .lock()
            .map_err(|_| BrgError::Internal("recording runner poisoned".to_string()))?
            .push(invocation);

        let replies = self
            .replies
            .lock()
            .map_err(|_| BrgError::Internal("recording runner poisoned".to_string()))?;
        match replies.iter().rev().find(|(prefix, _)| line.starts_with(prefix)) {
            Some((_, Reply::Output(out))) => Ok(out.clone()),
            Some((_, Reply::Fail(stderr))) => Err(BrgError::AdapterFailure(format!(
                "Command failed: {}: {}",
                line, stderr
            ))),
            None => Ok(String::new()),
        }
    }
}
