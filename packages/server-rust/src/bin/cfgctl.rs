//! Command-line control tool for the configuration plane.
//!
//! Commands target the appliance through the local RPC socket:
//!
//! ```text
//! cfgctl get @/rings/guest/vlan
//! cfgctl set @/clients/aa:bb:cc:dd:ee:ff/ring devices 30m
//! cfgctl add @/rings/guest/vlan 40 , add @/rings/guest/bridge br40
//! cfgctl del @/firewall/rules/block-iot
//! cfgctl mon @/clients
//! cfgctl export
//! cfgctl replace backup.json
//! ```
//!
//! A literal `,` separates the operations of one atomic batch. Exit
//! codes: 0 success, 1 operation failure, 2 usage error.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use cfgplane_core::wire::LEVEL_OPERATOR;
use cfgplane_core::{Batch, ClockSource, Subtree, SystemClock};
use cfgplane_server::notify::{KindFilter, Notification};
use cfgplane_server::rpc::ConfigClient;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "cfgctl",
    about = "configuration plane control tool",
    disable_help_subcommand = true
)]
struct Args {
    /// Appliance RPC socket.
    #[arg(long, env = "CFGD_SOCKET", default_value = "/run/cfgd/cfgd.sock")]
    socket: PathBuf,

    /// Access level to claim for mutations.
    #[arg(long, env = "CFGCTL_LEVEL", default_value_t = LEVEL_OPERATOR)]
    level: i32,

    /// Command words: get/set/add/del/mon/ping/replace/export, with `,`
    /// separating the ops of one batch.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

/// What one invocation asks for.
#[derive(Debug, PartialEq)]
enum Request {
    /// An atomic batch of get/set/add/del/ping ops.
    Exec(Vec<BatchOp>),
    /// Stream changes under a path prefix.
    Monitor { prefix: String },
    /// Print the whole tree as JSON.
    Export,
    /// Replace the tree from an export file (`-` for stdin).
    Replace { source: String },
}

#[derive(Debug, PartialEq)]
enum BatchOp {
    Get { path: String },
    Set { path: String, value: String, ttl_ms: Option<i64> },
    Add { path: String, value: String, ttl_ms: Option<i64> },
    Del { path: String },
    Ping,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let request = match parse_request(&args.command) {
        Ok(request) => request,
        Err(usage) => {
            eprintln!("cfgctl: {usage}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("cfgctl: runtime: {err}");
            return ExitCode::from(1);
        }
    };
    let client = ConfigClient::new(args.socket);
    runtime.block_on(run(&client, args.level, request))
}

async fn run(client: &ConfigClient, level: i32, request: Request) -> ExitCode {
    match request {
        Request::Exec(ops) => exec_batch(client, level, &ops).await,
        Request::Export => export(client, level).await,
        Request::Replace { source } => replace(client, level, &source).await,
        Request::Monitor { prefix } => monitor(client, &prefix).await,
    }
}

async fn exec_batch(client: &ConfigClient, level: i32, ops: &[BatchOp]) -> ExitCode {
    let mut batch = Batch::new("cfgctl", level);
    for op in ops {
        batch = match op {
            BatchOp::Get { path } => batch.get(path.clone()),
            BatchOp::Set { path, value, ttl_ms } => {
                batch.set(path.clone(), value.clone(), expiry_from(*ttl_ms))
            }
            BatchOp::Add { path, value, ttl_ms } => {
                batch.create(path.clone(), value.clone(), expiry_from(*ttl_ms))
            }
            BatchOp::Del { path } => batch.delete(path.clone()),
            BatchOp::Ping => batch.ping(),
        };
    }

    match client.exec(&batch).await {
        Ok(reply) if reply.is_ok() => {
            if !reply.value.is_empty() {
                println!("{}", reply.value);
            }
            ExitCode::SUCCESS
        }
        Ok(reply) => {
            match reply.err_ordinal {
                Some(ordinal) => eprintln!("cfgctl: {} at op {ordinal}", reply.err),
                None => eprintln!("cfgctl: {}", reply.err),
            }
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("cfgctl: {err}");
            ExitCode::from(1)
        }
    }
}

async fn export(client: &ConfigClient, level: i32) -> ExitCode {
    match client.exec(&Batch::new("cfgctl", level).get("@")).await {
        Ok(reply) if reply.is_ok() => {
            println!("{}", reply.value);
            ExitCode::SUCCESS
        }
        Ok(reply) => {
            eprintln!("cfgctl: {}", reply.err);
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("cfgctl: {err}");
            ExitCode::from(1)
        }
    }
}

async fn replace(client: &ConfigClient, level: i32, source: &str) -> ExitCode {
    let json = if source == "-" {
        let mut buffer = String::new();
        if let Err(err) = std::io::stdin().read_to_string(&mut buffer) {
            eprintln!("cfgctl: stdin: {err}");
            return ExitCode::from(1);
        }
        buffer
    } else {
        match std::fs::read_to_string(source) {
            Ok(json) => json,
            Err(err) => {
                eprintln!("cfgctl: {source}: {err}");
                return ExitCode::from(1);
            }
        }
    };
    let root: Subtree = match serde_json::from_str(&json) {
        Ok(root) => root,
        Err(err) => {
            eprintln!("cfgctl: parse export: {err}");
            return ExitCode::from(1);
        }
    };

    // Current top-level subtrees are deleted (apversion stays), then the
    // export's leaves are recreated -- one atomic batch.
    let current = match client.exec(&Batch::new("cfgctl", level).get("@")).await {
        Ok(reply) if reply.is_ok() => {
            serde_json::from_str::<Subtree>(&reply.value).unwrap_or_default()
        }
        Ok(reply) => {
            eprintln!("cfgctl: {}", reply.err);
            return ExitCode::from(1);
        }
        Err(err) => {
            eprintln!("cfgctl: {err}");
            return ExitCode::from(1);
        }
    };

    let mut batch = Batch::new("cfgctl", level);
    for label in current.children.keys() {
        if label != "apversion" {
            batch = batch.delete(format!("@/{label}"));
        }
    }
    let mut leaves = Vec::new();
    collect_leaves(&root, "@", &mut leaves);
    for (path, value, expiry_ms) in leaves {
        if path != "@/apversion" {
            batch = batch.create(path, value, expiry_ms);
        }
    }

    match client.exec(&batch).await {
        Ok(reply) if reply.is_ok() => ExitCode::SUCCESS,
        Ok(reply) => {
            match reply.err_ordinal {
                Some(ordinal) => eprintln!("cfgctl: {} at op {ordinal}", reply.err),
                None => eprintln!("cfgctl: {}", reply.err),
            }
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("cfgctl: {err}");
            ExitCode::from(1)
        }
    }
}

async fn monitor(client: &ConfigClient, prefix: &str) -> ExitCode {
    let pattern = prefix_pattern(prefix);
    let mut stream = match client.monitor(&pattern, KindFilter::all()).await {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("cfgctl: {err}");
            return ExitCode::from(1);
        }
    };

    while let Some(notification) = stream.next().await {
        match notification {
            Ok(Notification::Event { version, event }) => {
                let value = event.value.as_deref().unwrap_or("");
                println!("{version} {:?} {} {value}", event.kind, event.path);
            }
            Ok(Notification::Resync { path }) => {
                println!("resync {path}");
            }
            Err(err) => {
                eprintln!("cfgctl: {err}");
                return ExitCode::from(1);
            }
        }
    }
    ExitCode::SUCCESS
}

/// Splits the command words into a request; `,` separates batch ops.
fn parse_request(words: &[String]) -> Result<Request, String> {
    let groups: Vec<&[String]> = words.split(|word| word == ",").collect();

    // mon/export/replace do not compose with other commands.
    if groups.len() == 1 {
        let group = groups[0];
        match group.first().map(String::as_str) {
            Some("mon") => {
                return match group {
                    [_, path] => Ok(Request::Monitor {
                        prefix: path.clone(),
                    }),
                    _ => Err("usage: mon <path>".to_string()),
                };
            }
            Some("export") => {
                return match group {
                    [_] => Ok(Request::Export),
                    _ => Err("usage: export".to_string()),
                };
            }
            Some("replace") => {
                return match group {
                    [_, source] => Ok(Request::Replace {
                        source: source.clone(),
                    }),
                    _ => Err("usage: replace <file|->".to_string()),
                };
            }
            _ => {}
        }
    }

    let mut ops = Vec::new();
    for group in groups {
        ops.push(parse_op(group)?);
    }
    Ok(Request::Exec(ops))
}

fn parse_op(group: &[String]) -> Result<BatchOp, String> {
    match group.first().map(String::as_str) {
        Some("get") => match group {
            [_, path] => Ok(BatchOp::Get {
                path: resolve_alias(path),
            }),
            _ => Err("usage: get <path|clients|rings>".to_string()),
        },
        Some("set") => match group {
            [_, path, value] => Ok(BatchOp::Set {
                path: path.clone(),
                value: value.clone(),
                ttl_ms: None,
            }),
            [_, path, value, duration] => Ok(BatchOp::Set {
                path: path.clone(),
                value: value.clone(),
                ttl_ms: Some(parse_duration_ms(duration)?),
            }),
            _ => Err("usage: set <path> <value> [duration]".to_string()),
        },
        Some("add") => match group {
            [_, path, value] => Ok(BatchOp::Add {
                path: path.clone(),
                value: value.clone(),
                ttl_ms: None,
            }),
            [_, path, value, duration] => Ok(BatchOp::Add {
                path: path.clone(),
                value: value.clone(),
                ttl_ms: Some(parse_duration_ms(duration)?),
            }),
            _ => Err("usage: add <path> <value> [duration]".to_string()),
        },
        Some("del") => match group {
            [_, path] => Ok(BatchOp::Del { path: path.clone() }),
            _ => Err("usage: del <path>".to_string()),
        },
        Some("ping") => match group {
            [_] => Ok(BatchOp::Ping),
            _ => Err("usage: ping".to_string()),
        },
        Some(other) => Err(format!("unknown command {other:?}")),
        None => Err("empty command".to_string()),
    }
}

/// `clients` and `rings` shorthand for the common inspection targets.
fn resolve_alias(path: &str) -> String {
    match path {
        "clients" => "@/clients".to_string(),
        "rings" => "@/rings".to_string(),
        other => other.to_string(),
    }
}

/// `30s` / `10m` / `2h` / `1d` relative TTL.
fn parse_duration_ms(text: &str) -> Result<i64, String> {
    let bad = || format!("bad duration {text:?}");
    let unit = text.chars().last().ok_or_else(bad)?;
    let digits = &text[..text.len() - unit.len_utf8()];
    let count: i64 = digits.parse().map_err(|_| bad())?;
    let unit_ms = match unit {
        's' => 1_000,
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        _ => return Err(bad()),
    };
    count
        .checked_mul(unit_ms)
        .ok_or_else(|| format!("duration {text:?} overflows"))
}

fn expiry_from(ttl_ms: Option<i64>) -> Option<i64> {
    ttl_ms.map(|ttl| SystemClock.now_ms() + ttl)
}

/// Anchored regex matching a path and everything below it.
fn prefix_pattern(prefix: &str) -> String {
    format!("^{}(/.*)?$", regex::escape(prefix))
}

/// Leaves of an export, as (path, value, expiry).
fn collect_leaves(node: &Subtree, path: &str, out: &mut Vec<(String, String, Option<i64>)>) {
    if let Some(value) = &node.value {
        out.push((path.to_string(), value.clone(), node.expiry_ms));
    }
    for (label, child) in &node.children {
        collect_leaves(child, &format!("{path}/{label}"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn parse_single_get() {
        let request = parse_request(&words("get @/rings/guest/vlan")).unwrap();
        assert_eq!(
            request,
            Request::Exec(vec![BatchOp::Get {
                path: "@/rings/guest/vlan".to_string()
            }])
        );
    }

    #[test]
    fn parse_get_aliases() {
        let request = parse_request(&words("get clients")).unwrap();
        assert_eq!(
            request,
            Request::Exec(vec![BatchOp::Get {
                path: "@/clients".to_string()
            }])
        );
    }

    #[test]
    fn parse_set_with_duration() {
        let request = parse_request(&words("set @/clients/aa/ring devices 30m")).unwrap();
        assert_eq!(
            request,
            Request::Exec(vec![BatchOp::Set {
                path: "@/clients/aa/ring".to_string(),
                value: "devices".to_string(),
                ttl_ms: Some(1_800_000),
            }])
        );
    }

    #[test]
    fn parse_comma_composes_batch() {
        let request =
            parse_request(&words("add @/rings/guest/vlan 40 , add @/rings/guest/bridge br40"))
                .unwrap();
        match request {
            Request::Exec(ops) => {
                assert_eq!(ops.len(), 2);
                assert!(matches!(ops[0], BatchOp::Add { .. }));
                assert!(matches!(ops[1], BatchOp::Add { .. }));
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn parse_mon_export_replace() {
        assert_eq!(
            parse_request(&words("mon @/clients")).unwrap(),
            Request::Monitor {
                prefix: "@/clients".to_string()
            }
        );
        assert_eq!(parse_request(&words("export")).unwrap(), Request::Export);
        assert_eq!(
            parse_request(&words("replace backup.json")).unwrap(),
            Request::Replace {
                source: "backup.json".to_string()
            }
        );
    }

    #[test]
    fn usage_errors() {
        assert!(parse_request(&words("get")).is_err());
        assert!(parse_request(&words("set @/a")).is_err());
        assert!(parse_request(&words("frobnicate @/a")).is_err());
        assert!(parse_request(&words("mon")).is_err());
        assert!(parse_request(&words("set @/a v 30x")).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration_ms("30s").unwrap(), 30_000);
        assert_eq!(parse_duration_ms("10m").unwrap(), 600_000);
        assert_eq!(parse_duration_ms("2h").unwrap(), 7_200_000);
        assert_eq!(parse_duration_ms("1d").unwrap(), 86_400_000);
        assert!(parse_duration_ms("30x").is_err());
        assert!(parse_duration_ms("s").is_err());
    }

    #[test]
    fn monitor_pattern_is_prefix_anchored() {
        let pattern = prefix_pattern("@/clients");
        let re = regex::Regex::new(&pattern).unwrap();
        assert!(re.is_match("@/clients"));
        assert!(re.is_match("@/clients/aa:bb:cc:dd:ee:ff/ipv4"));
        assert!(!re.is_match("@/clientsX"));
        assert!(!re.is_match("@/rings/guest"));
    }

    #[test]
    fn collect_leaves_walks_export() {
        let root: Subtree = serde_json::from_str(
            r#"{"children":{"rings":{"children":{"guest":{"children":{"vlan":{"value":"40"}}}}}}}"#,
        )
        .unwrap();
        let mut leaves = Vec::new();
        collect_leaves(&root, "@", &mut leaves);
        assert_eq!(
            leaves,
            vec![("@/rings/guest/vlan".to_string(), "40".to_string(), None)]
        );
    }
}
