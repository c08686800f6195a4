//! Interactive console commands for `ic-audit serve`

use ic_audit_core::events;

pub const HELP: &str = "Press Enter to dump the last window of audit trails.\n\
Other commands: help | list | dump_all | compact_dump | compact_dump <p1,p2> | prune [event_type] | save | exit";

/// One line typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Empty line
    Dump,
    DumpAll,
    CompactDump(Vec<String>),
    List,
    Prune(String),
    Save,
    Help,
    Exit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Dump;
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "dump_all" => Command::DumpAll,
            "compact_dump" => Command::CompactDump(parse_filters(rest)),
            "list" => Command::List,
            "prune" if rest.is_empty() => Command::Prune(events::BOOT.to_string()),
            "prune" => Command::Prune(rest.to_string()),
            "save" => Command::Save,
            "help" => Command::Help,
            "exit" | "quit" => Command::Exit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

/// Comma separated project names; blanks are ignored.
fn parse_filters(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(String::from)
        .collect()
}
