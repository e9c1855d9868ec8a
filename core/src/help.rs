//! Usage text for the `hostfleet` commands.


/// Generate help text for a given topic.
///
/// - `None` → overview of all commands
/// - `Some("sync")` → detailed help for one command
pub fn help_text(topic: Option<&str>) -> String {
    match topic {
        None => overview(),
        Some(t) => command_help(t).unwrap_or_else(|| {
            format!("Unknown help topic: '{}'. Run 'hostfleet help' for a list of commands.", t)
        }),
    }
}


fn overview() -> String {
    "\
hostfleet: provision and tear down a fleet of worker hosts

Usage: hostfleet <command> [args...]

Commands:
  hosts <config> [--json]             Parse host specs and list identities
  sync <config> [--events <file>]     Mirror rsync roots onto every host
  help [command]                      Show help (this message, or one command)

Set HOSTFLEET_LOG (e.g. HOSTFLEET_LOG=debug) to change log verbosity."
        .to_string()
}


fn command_help(name: &str) -> Option<String> {
    let text = match name {
        "hosts" => "\
hostfleet hosts <config> [--json]

Load the fleet config and print one line per host: id, hostname, destination
relpath and whether rsync is enabled. A bare 'localhost' spec never syncs.",
        "sync" => "\
hostfleet sync <config> [--events <file>] [--no-delete]

Open a gateway to every host in order, mirror each rsync root onto every
host, then close all gateways. Transfers to different hosts run concurrently.
Files ending in .pyc, .pyo or ~, dotfiles, and paths in rsync_ignore are
skipped. Destination entries missing from the source are removed unless
--no-delete is given.

  --events <file>   Append lifecycle events to <file> as JSON Lines
  --no-delete       Copy only; keep extraneous destination entries",
        "help" => "hostfleet help [command]",
        _ => return None,
    };
    Some(text.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overview_lists_commands() {
        let text = help_text(None);
        assert!(text.contains("hosts <config>"));
        assert!(text.contains("sync <config>"));
        assert!(text.contains("HOSTFLEET_LOG"));
    }

    #[test]
    fn command_topic() {
        assert!(help_text(Some("sync")).contains("--no-delete"));
    }

    #[test]
    fn unknown_topic() {
        assert!(help_text(Some("deploy")).starts_with("Unknown help topic"));
    }
}
