//! Command runner abstraction for executing external programs.
//!
//! `CommandRunner` is the trait the ssh transfer path uses to execute rsync.
//! `ShellRunner` is the production implementation that spawns the program
//! directly (no shell). `MockRunner` records calls and returns preset responses.

use std::process::Command;
use std::sync::Mutex;

/// Trait for executing a program with an argument vector.
///
/// Runners are shared between concurrent transfers, hence `Sync`.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<String, String>;
}

/// Production runner that spawns `program args...`.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| format!("Failed to execute {}: {}", program, e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} exited with {}: {}", program, output.status, stderr.trim()))
        }
    }
}

/// Test-double runner that records command lines and returns pre-configured
/// responses in order.
pub struct MockRunner {
    responses: Mutex<Vec<Result<String, String>>>,
    commands: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn with_responses(responses: Vec<Result<String, String>>) -> Self {
        let mut reversed = responses;
        reversed.reverse();
        MockRunner {
            responses: Mutex::new(reversed),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        Self::with_responses(Vec::new())
    }

    /// Every command line run so far, as `program arg1 arg2 ...`.
    pub fn executed_commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, String> {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(line);
        }
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| "mock runner poisoned".to_string())?;
        responses.pop().unwrap_or_else(|| Ok(String::new()))
    }
}
