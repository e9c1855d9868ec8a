//! Command: the typed interface for everything the `hostfleet` binary does.
//!
//! Every operation dispatched through `Sys::execute()` is a variant of the
//! `Command` enum. Commands serialize as JSON objects with a `"command"`
//! discriminant:
//!
//! ```json
//! {"command": "hosts", "config": "fleet.yaml", "format": "json"}
//! {"command": "sync", "config": "fleet.yaml", "events": "run.jsonl"}
//! ```

use serde::{Deserialize, Serialize};


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command")]
pub enum Command {
    /// Parse the configured host specs and list the resulting identities.
    #[serde(rename = "hosts")]
    Hosts {
        /// Path to the fleet YAML file.
        config: String,
        /// Output format: "json" for JSON, omit for a table.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },

    /// Open gateways, mirror every root to every host, then close.
    #[serde(rename = "sync")]
    Sync {
        config: String,
        /// Append lifecycle events to this JSON Lines file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        events: Option<String>,
        /// Copy without deleting extraneous destination entries.
        #[serde(default)]
        no_delete: bool,
    },

    /// Show help, optionally for one command.
    #[serde(rename = "help")]
    Help {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
}
