use crate::command::Command;


/// Parse CLI arguments into a typed Command enum.
///
/// Arguments are expected WITHOUT the program name (i.e., `args` should
/// be `["hosts", "fleet.yaml"]`, not `["hostfleet", "hosts", "fleet.yaml"]`).
pub fn parse_args(args: &[&str]) -> Result<Command, String> {
    if args.is_empty() {
        return Err("No command specified. Run 'hostfleet help' for usage.".into());
    }

    match args[0] {
        "hosts" => parse_hosts(args),
        "sync" => parse_sync(args),
        "help" | "--help" | "-h" => parse_help(args),
        _ => Err(format!("Unknown command: '{}'", args[0])),
    }
}


// ---------------------------------------------------------------------------
// Sub-parsers
// ---------------------------------------------------------------------------

/// `hostfleet hosts <config> [--json]`
fn parse_hosts(args: &[&str]) -> Result<Command, String> {
    if args.len() < 2 || args[1].starts_with("--") {
        return Err("Usage: hostfleet hosts <config> [--json]".into());
    }
    let config = args[1].to_string();
    let mut format = None;
    for flag in &args[2..] {
        match *flag {
            "--json" => format = Some("json".to_string()),
            other => return Err(format!("Unknown flag for hosts: '{}'", other)),
        }
    }
    Ok(Command::Hosts { config, format })
}

/// `hostfleet sync <config> [--events <file>] [--no-delete]`
fn parse_sync(args: &[&str]) -> Result<Command, String> {
    if args.len() < 2 || args[1].starts_with("--") {
        return Err("Usage: hostfleet sync <config> [--events <file>] [--no-delete]".into());
    }
    let config = args[1].to_string();
    let mut events = None;
    let mut no_delete = false;

    let rest = &args[2..];
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            "--events" => {
                i += 1;
                events = Some(take_arg(rest, i, "--events")?);
            }
            "--no-delete" => no_delete = true,
            other => return Err(format!("Unknown flag for sync: '{}'", other)),
        }
        i += 1;
    }
    Ok(Command::Sync { config, events, no_delete })
}

/// `hostfleet help [topic]`
fn parse_help(args: &[&str]) -> Result<Command, String> {
    let topic = if args.len() > 1 {
        Some(args[1..].join(" "))
    } else {
        None
    };
    Ok(Command::Help { topic })
}

fn take_arg(args: &[&str], index: usize, flag: &str) -> Result<String, String> {
    if index >= args.len() {
        return Err(format!("{} requires a value", flag));
    }
    Ok(args[index].into())
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args() {
        assert!(parse_args(&[]).is_err());
    }

    #[test]
    fn unknown_command() {
        assert!(parse_args(&["deploy"]).is_err());
    }

    #[test]
    fn hosts() {
        let cmd = parse_args(&["hosts", "fleet.yaml"]).unwrap();
        assert_eq!(cmd, Command::Hosts { config: "fleet.yaml".into(), format: None });
    }

    #[test]
    fn hosts_json() {
        let cmd = parse_args(&["hosts", "fleet.yaml", "--json"]).unwrap();
        assert_eq!(
            cmd,
            Command::Hosts { config: "fleet.yaml".into(), format: Some("json".into()) }
        );
    }

    #[test]
    fn hosts_requires_config() {
        assert!(parse_args(&["hosts"]).is_err());
        assert!(parse_args(&["hosts", "--json"]).is_err());
    }

    #[test]
    fn sync_plain() {
        let cmd = parse_args(&["sync", "f.yaml"]).unwrap();
        assert_eq!(
            cmd,
            Command::Sync { config: "f.yaml".into(), events: None, no_delete: false }
        );
    }

    #[test]
    fn sync_with_flags() {
        let cmd = parse_args(&["sync", "f.yaml", "--no-delete", "--events", "run.jsonl"]).unwrap();
        assert_eq!(
            cmd,
            Command::Sync {
                config: "f.yaml".into(),
                events: Some("run.jsonl".into()),
                no_delete: true,
            }
        );
    }

    #[test]
    fn sync_events_needs_value() {
        let err = parse_args(&["sync", "f.yaml", "--events"]).unwrap_err();
        assert!(err.contains("--events requires a value"));
    }

    #[test]
    fn sync_unknown_flag() {
        assert!(parse_args(&["sync", "f.yaml", "--fast"]).is_err());
    }

    #[test]
    fn help_with_topic() {
        assert_eq!(parse_args(&["help"]).unwrap(), Command::Help { topic: None });
        assert_eq!(
            parse_args(&["help", "sync"]).unwrap(),
            Command::Help { topic: Some("sync".into()) }
        );
        assert_eq!(parse_args(&["--help"]).unwrap(), Command::Help { topic: None });
    }
}
