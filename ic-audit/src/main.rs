//! ic-audit - local audit trail collector
//!
//! Subcommands:
//! - `serve`: run the collector, with an interactive console for dumps
//! - `send`: emit one audit event to a running collector
//! - `dump`: write dump files straight from the snapshot, no server needed
//! - `projects`: list the projects recorded in the snapshot
//!
//! Uses XDG Base Directory specification for its own files:
//! - Logs: $XDG_STATE_HOME/ic-audit/ic-audit.log (~/.local/state/ic-audit/ic-audit.log)
//! - Config: $XDG_CONFIG_HOME/ic-audit/config.toml (~/.config/ic-audit/config.toml)
//!
//! The snapshot lives at ~/.cellar/loser_audit.jsonl unless configured otherwise.

mod console;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::Command as ConsoleCommand;
use ic_audit_core::config::ServerConfig;
use ic_audit_core::notifier::deliver;
use ic_audit_core::{
    events, AuditTrails, BlockingServer, Config, DumpWindow, Dumper, ExtraFields, FieldValue,
    Notifier, ProjectIdentity, SnapshotFile,
};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ic-audit")]
#[command(about = "Collect audit events from local trading programs")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the audit server
    Serve {
        /// No console; run until Ctrl+C
        #[arg(long)]
        headless: bool,

        /// Listen on this port instead of the configured one
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one audit event to the running server
    Send {
        /// Project name
        #[arg(long)]
        name: String,

        /// Market the project trades
        #[arg(long)]
        market: String,

        /// Project description
        #[arg(long)]
        description: String,

        /// Event type (default: boot)
        #[arg(long, default_value = events::BOOT)]
        event_type: String,

        /// Event description
        #[arg(short, long, default_value = "Project was booted.")]
        message: String,

        /// Privilege held by the project (repeatable)
        #[arg(long = "privilege")]
        privileges: Vec<String>,

        /// Extra field as key=value (repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, FieldValue)>,
    },

    /// Write dump files from the snapshot without a running server
    Dump {
        /// Include every event instead of the trailing window
        #[arg(long)]
        all: bool,

        /// Write the compact text dump instead of JSON
        #[arg(long)]
        compact: bool,

        /// Only dump these projects (repeatable)
        #[arg(long = "project")]
        projects: Vec<String>,
    },

    /// List projects recorded in the snapshot
    Projects,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        ic_audit_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("ic-audit starting");

    match args.command {
        Command::Serve { headless, port } => {
            let mut server_config = config.server_config();
            if let Some(port) = port {
                server_config.port = port;
            }
            run_server(server_config, headless)
        }
        Command::Send {
            name,
            market,
            description,
            event_type,
            message,
            privileges,
            fields,
        } => run_send(
            &config,
            ProjectIdentity::new(name, market, description, privileges),
            &event_type,
            &message,
            fields.into_iter().collect(),
        ),
        Command::Dump {
            all,
            compact,
            projects,
        } => run_dump(&config, all, compact, &projects),
        Command::Projects => run_projects(&config),
    }
}

/// Parse `key=value`; numbers become numeric fields.
fn parse_field(raw: &str) -> std::result::Result<(String, FieldValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty field name in '{}'", raw));
    }

    let value = match (value.parse::<i64>(), value.parse::<f64>()) {
        (Ok(i), _) => FieldValue::Integer(i),
        (_, Ok(f)) if f.is_finite() => FieldValue::Float(f),
        _ => FieldValue::Text(value.to_string()),
    };
    Ok((key.to_string(), value))
}

fn run_server(server_config: ServerConfig, headless: bool) -> Result<()> {
    let server =
        Arc::new(BlockingServer::start(server_config).context("failed to start audit server")?);

    println!(
        "Audit server listening on {}",
        server.server().local_addr()
    );
    println!("Snapshot: {}", server.server().snapshot_path().display());
    println!(
        "Loaded {} event(s) across {} project(s)",
        server.server().store().len(),
        server.server().store().project_count()
    );

    if headless {
        run_headless(&server)
    } else {
        run_console(server)
    }
}

fn run_headless(server: &BlockingServer) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    println!("Running headless. Press Ctrl+C to stop.");
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    server.shutdown().context("failed to save final snapshot")?;
    println!("Audit trails saved.");
    Ok(())
}

fn run_console(server: Arc<BlockingServer>) -> Result<()> {
    // The console thread is blocked on stdin, so the handler finishes the job itself.
    let handler_server = Arc::clone(&server);
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        let code = match handler_server.shutdown() {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Failed to save final snapshot: {}", e);
                1
            }
        };
        std::process::exit(code);
    })
    .context("failed to set Ctrl+C handler")?;

    println!("{}", console::HELP);

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("failed to read from stdin")?;

        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Exit => break,
            command => handle_console_command(&server, command),
        }
    }

    server.shutdown().context("failed to save final snapshot")?;
    println!("Audit trails saved.");
    Ok(())
}

fn handle_console_command(server: &BlockingServer, command: ConsoleCommand) {
    let audit = server.server();
    match command {
        ConsoleCommand::Dump => match server.dump_now() {
            Ok(report) => println!(
                "Dumped {} event(s) from {} project(s) to {}",
                report.events,
                report.projects,
                report.path.display()
            ),
            Err(e) => println!("Dump failed: {}", e),
        },
        ConsoleCommand::DumpAll => match audit.dump_all() {
            Ok(report) => println!(
                "Dumped all {} event(s) to {}",
                report.events,
                report.path.display()
            ),
            Err(e) => println!("Dump failed: {}", e),
        },
        ConsoleCommand::CompactDump(filters) => match audit.compact_dump(&filters) {
            Ok(report) => println!(
                "Compact dump of {} project(s) written to {}",
                report.projects,
                report.path.display()
            ),
            Err(e) => println!("Compact dump failed: {}", e),
        },
        ConsoleCommand::List => print_projects(&audit.store().snapshot()),
        ConsoleCommand::Prune(event_type) => match audit.prune(&event_type) {
            0 => println!("No {} events found to prune.", event_type),
            removed => println!("Pruned {} {} event(s).", removed, event_type),
        },
        ConsoleCommand::Save => match audit.save_snapshot() {
            Ok(true) => println!("Snapshot saved to {}", audit.snapshot_path().display()),
            Ok(false) => println!("Snapshot already up to date."),
            Err(e) => println!("Snapshot failed: {}", e),
        },
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Unknown(input) => {
            println!("Unknown command: {}", input);
            println!("{}", console::HELP);
        }
        ConsoleCommand::Exit => {}
    }
}

fn run_send(
    config: &Config,
    identity: ProjectIdentity,
    event_type: &str,
    message: &str,
    fields: ExtraFields,
) -> Result<()> {
    let notifier = Notifier::with_config(identity, config.notifier.clone());
    let envelope = notifier.envelope(event_type, message, fields);

    // Delivered inline so the process does not exit before the write lands.
    match deliver(notifier.config().address, notifier.config().timeout(), &envelope) {
        Ok(()) => println!(
            "Sent {} event for {} to {}",
            envelope.event_type,
            envelope.project_name,
            notifier.config().address
        ),
        Err(e) => {
            tracing::debug!(error = %e, "Audit event dropped");
            eprintln!("Audit server unreachable, event dropped: {}", e);
        }
    }
    Ok(())
}

fn load_snapshot(config: &Config) -> Result<(SnapshotFile, AuditTrails)> {
    let file = SnapshotFile::new(config.server_config().snapshot_path());
    let trails = file
        .load()
        .with_context(|| format!("failed to read snapshot {}", file.path().display()))?;
    Ok((file, trails))
}

fn run_dump(config: &Config, all: bool, compact: bool, projects: &[String]) -> Result<()> {
    if all && compact {
        bail!("--all only applies to the JSON dump");
    }

    let (file, mut trails) = load_snapshot(config)?;
    println!("Snapshot: {}", file.path().display());

    let dumper = Dumper::new(config.dump.clone());
    let report = if compact {
        dumper
            .write_compact(&trails, projects)
            .context("failed to write compact dump")?
    } else {
        if !projects.is_empty() {
            trails.retain(|project, _| projects.contains(project));
        }
        let window = if all {
            DumpWindow::All
        } else {
            dumper.default_window()
        };
        dumper
            .write_json(&trails, window)
            .context("failed to write dump")?
    };

    println!(
        "Dumped {} event(s) from {} project(s) to {}",
        report.events,
        report.projects,
        report.path.display()
    );
    Ok(())
}

fn run_projects(config: &Config) -> Result<()> {
    let (_, trails) = load_snapshot(config)?;
    print_projects(&trails);
    Ok(())
}

fn print_projects(trails: &AuditTrails) {
    if trails.is_empty() {
        println!("No projects recorded.");
        return;
    }

    println!("{} project(s):", trails.len());
    for (project, events) in trails {
        println!("  - {}: {} event(s)", project, events.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_numbers_and_text() {
        assert_eq!(
            parse_field("qty=3").unwrap(),
            ("qty".to_string(), FieldValue::Integer(3))
        );
        assert_eq!(
            parse_field("price=1.25").unwrap(),
            ("price".to_string(), FieldValue::Float(1.25))
        );
        assert_eq!(
            parse_field("symbol=EUR=X").unwrap(),
            ("symbol".to_string(), FieldValue::Text("EUR=X".to_string()))
        );
        assert_eq!(
            parse_field("note=NaN").unwrap(),
            ("note".to_string(), FieldValue::Text("NaN".to_string()))
        );
    }

    #[test]
    fn test_parse_field_rejects_missing_separator() {
        assert!(parse_field("symbol").is_err());
        assert!(parse_field("=value").is_err());
    }

    #[test]
    fn test_args_parse_send() {
        let args = Args::try_parse_from([
            "ic-audit",
            "send",
            "--name",
            "grid",
            "--market",
            "crypto",
            "--description",
            "Grid bot",
            "--privilege",
            "execute_trade",
            "--field",
            "symbol=BTC",
        ])
        .unwrap();

        match args.command {
            Command::Send {
                event_type,
                privileges,
                fields,
                ..
            } => {
                assert_eq!(event_type, "boot");
                assert_eq!(privileges, vec!["execute_trade"]);
                assert_eq!(fields.len(), 1);
            }
            _ => panic!("expected send"),
        }
    }
}
