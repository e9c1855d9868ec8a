//! hostfleet CLI: the command-line entry point.
//!
//! # Usage
//!
//! ```text
//! hostfleet hosts fleet.yaml
//! hostfleet sync fleet.yaml --events run.jsonl
//! hostfleet help sync
//! ```

use std::path::Path;
use std::process;

use hostfleet_core::cli::parse_args;
use hostfleet_core::command::Command;
use hostfleet_core::config::FleetConfig;
use hostfleet_core::logging::{init_logging, LogConfig};
use hostfleet_core::sys::Sys;


fn main() {
    let args: Vec<String> = std::env::args().collect();
    let arg_refs: Vec<&str> = args[1..].iter().map(|s| s.as_str()).collect();

    let cmd = match parse_args(&arg_refs) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("hostfleet: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&log_config(&cmd)) {
        eprintln!("hostfleet: {}", e);
    }
    tracing::debug!(?cmd, "dispatching");

    match Sys::new().execute(cmd) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("hostfleet error: {}", e);
            process::exit(1);
        }
    }
}


/// Logging settings from the command's config file, if it has one and it
/// loads. Errors surface later when the command itself loads the file.
fn log_config(cmd: &Command) -> LogConfig {
    let path = match cmd {
        Command::Hosts { config, .. } | Command::Sync { config, .. } => config,
        Command::Help { .. } => return LogConfig::default(),
    };
    FleetConfig::load(Path::new(path))
        .map(|c| c.logging.clone().verbose(c.verbose))
        .unwrap_or_default()
}
