//! REPL – Read-Eval-Print Loop for the lablink shell.
//!
//! Supported commands (a leading `/` is accepted and ignored):
//!   help                              – show this list
//!   devices                           – registered devices and their kinds
//!   state <device>                    – last published status
//!   action <device>[.<ch>] <method> [args]  – call a handler, discard the result
//!   request <device>[.<ch>] <method> [args] – call a handler, print the result
//!   step <device>                     – run one loop step now
//!   faults                            – fault events since the last call
//!   health                            – devices whose loop has gone stale
//!   save                              – persist settings and append a snapshot
//!   quit | exit                       – shut the rig down and exit
//!
//! Arguments are JSON values separated by commas (`0, 1.5, "scan"`); bare words
//! that are not JSON are taken as strings.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use lablink_middleware::{Topic, TopicReceiver};
use lablink_runtime::{DeviceCall, DeviceRuntime, SettingsStore};
use lablink_types::{EventPayload, LabError};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::Value;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Devices,
    State(String),
    Action(DeviceCall),
    Request(DeviceCall),
    Step(String),
    Faults,
    Health,
    Save,
    Quit,
}

/// Everything a command can touch.
pub struct Session {
    pub runtime: DeviceRuntime,
    pub store: SettingsStore,
    faults: TopicReceiver,
}

impl Session {
    pub fn new(runtime: DeviceRuntime, store: SettingsStore) -> Self {
        let faults = runtime.bus().subscribe_to(Topic::Faults);
        Self { runtime, store, faults }
    }
}

/// Entry point for the interactive REPL.
///
/// Each command runs to completion on `rt` before the next prompt. The loop
/// exits on `quit`, end of input, an interrupted prompt, or once `shutdown`
/// is set by the Ctrl-C handler.
pub fn run(rt: &tokio::runtime::Runtime, session: &mut Session, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };
    let prompt = format!("{} ", "lablink>".bold().cyan());

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        match parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => rt.block_on(execute(session, command)),
            Err(message) => println!(
                "{} {}. Type {} for available commands.",
                "Invalid command:".red(),
                message,
                "help".bold()
            ),
        }
    }
    shutdown.store(true, Ordering::SeqCst);
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim().trim_start_matches('/');
    let (verb, rest) = split_word(line);
    let rest = rest.trim();
    let device = || match split_word(rest) {
        ("", _) => Err(format!("'{verb}' needs a device name")),
        (name, _) => Ok(name.to_string()),
    };

    match verb {
        "help" | "?" => Ok(Command::Help),
        "devices" | "ls" => Ok(Command::Devices),
        "state" => Ok(Command::State(device()?)),
        "step" => Ok(Command::Step(device()?)),
        "action" => Ok(Command::Action(parse_call(rest)?)),
        "request" => Ok(Command::Request(parse_call(rest)?)),
        "faults" => Ok(Command::Faults),
        "health" => Ok(Command::Health),
        "save" => Ok(Command::Save),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    text.split_once(char::is_whitespace).unwrap_or((text, ""))
}

/// `<device>[.<channel>] <method> [args]`
fn parse_call(text: &str) -> Result<DeviceCall, String> {
    let (target, rest) = split_word(text);
    let (method, args) = split_word(rest);
    if target.is_empty() || method.is_empty() {
        return Err("expected <device>[.<channel>] <method> [args]".into());
    }
    let call = match target.split_once('.') {
        Some((device, channel)) => DeviceCall::new(device, method, parse_args(args)).with_channel(channel),
        None => DeviceCall::new(target, method, parse_args(args)),
    };
    Ok(call)
}

/// Comma-separated JSON values; anything that is not JSON becomes a string.
pub fn parse_args(text: &str) -> Vec<Value> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if let Ok(Value::Array(values)) = serde_json::from_str(&format!("[{text}]")) {
        return values;
    }
    text.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| serde_json::from_str(token).unwrap_or_else(|_| Value::String(token.to_string())))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

pub async fn execute(session: &mut Session, command: Command) {
    let result = match command {
        Command::Help => {
            cmd_help();
            Ok(())
        }
        Command::Devices => cmd_devices(&session.runtime),
        Command::State(device) => session.runtime.get_device_state(&device).map(|state| {
            print_json(state.as_value());
        }),
        Command::Action(call) => session.runtime.invoke(&call).await.map(|_| {
            println!("{}", "✓ ok".green());
        }),
        Command::Request(call) => session.runtime.invoke(&call).await.map(|value| print_json(&value)),
        Command::Step(device) => session.runtime.step(&device).await.map(|wait| {
            println!("{} next step in {:?}", "✓".green(), wait);
        }),
        Command::Faults => {
            cmd_faults(&mut session.faults);
            Ok(())
        }
        Command::Health => {
            cmd_health(&session.runtime);
            Ok(())
        }
        Command::Save => session.store.save_runtime(&session.runtime).await.map(|count| {
            println!(
                "{} {} device(s) to {}",
                "✓ Saved".green(),
                count,
                session.store.path().display().to_string().bold()
            );
        }),
        Command::Quit => Ok(()),
    };
    if let Err(e) = result {
        report(&e);
    }
}

fn cmd_help() {
    println!();
    println!("{}", "lablink Commands".bold().underline());
    println!("  {}                          – registered devices", "devices".bold().cyan());
    println!("  {}                   – last published status", "state <dev>".bold().cyan());
    println!("  {}  – call a handler", "action <dev>[.<ch>] <method> [args]".bold().cyan());
    println!("  {} – call a handler, print the result", "request <dev>[.<ch>] <method> [args]".bold().cyan());
    println!("  {}                    – run one loop step now", "step <dev>".bold().cyan());
    println!("  {}                           – faults since the last call", "faults".bold().cyan());
    println!("  {}                           – stale device loops", "health".bold().cyan());
    println!("  {}                             – persist settings", "save".bold().cyan());
    println!("  {}                      – shut down and exit", "quit  exit".bold().cyan());
    println!();
    println!("  Arguments are comma-separated JSON, e.g. {}", "action smaract move_to 0, 1.25".dimmed());
    println!();
}

fn cmd_devices(runtime: &DeviceRuntime) -> Result<(), LabError> {
    println!("{}", "Devices".bold().underline());
    for name in runtime.device_names() {
        let kind = runtime.device_kind(&name)?;
        println!("  {:<20} {}", name.bold(), kind.dimmed());
    }
    Ok(())
}

fn cmd_faults(faults: &mut TopicReceiver) {
    let events = faults.drain();
    if events.is_empty() {
        println!("  {}", "no faults".green());
        return;
    }
    for event in events {
        if let EventPayload::Fault { message } = event.payload {
            println!(
                "  {} {} {}",
                event.timestamp.format("%H:%M:%S").to_string().dimmed(),
                event.device.yellow().bold(),
                message
            );
        }
    }
}

fn cmd_health(runtime: &DeviceRuntime) {
    let stale = runtime.stale_devices();
    if stale.is_empty() {
        println!("  {} all device loops healthy", "🟢".green());
    } else {
        for device in stale {
            println!("  {} {} {}", "🔴".red(), device.bold(), "loop is stale".red());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

fn report(error: &LabError) {
    println!("{}: {}", "Error".red().bold(), error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_verbs_with_or_without_slash() {
        assert_eq!(parse("/help"), Ok(Command::Help));
        assert_eq!(parse("  devices "), Ok(Command::Devices));
        assert_eq!(parse("state smaract"), Ok(Command::State("smaract".into())));
        assert_eq!(parse("/step z_lock"), Ok(Command::Step("z_lock".into())));
        assert_eq!(parse("exit"), Ok(Command::Quit));
        assert!(parse("state").is_err());
        assert!(parse("launch rockets").is_err());
    }

    #[test]
    fn parses_calls_with_channel_and_json_args() {
        let Ok(Command::Action(call)) = parse("action smaract.0 move_to 0, 1.25, \"closed-loop\"") else {
            panic!("expected an action");
        };
        assert_eq!(call.device, "smaract");
        assert_eq!(call.channel.as_deref(), Some("0"));
        assert_eq!(call.method, "move_to");
        assert_eq!(call.args.0, vec![json!(0), json!(1.25), json!("closed-loop")]);

        let Ok(Command::Request(call)) = parse("request detuning_scan get_state") else {
            panic!("expected a request");
        };
        assert!(call.args.is_empty());
        assert!(call.channel.is_none());
        assert!(parse("action smaract").is_err());
    }

    #[test]
    fn bare_words_become_strings() {
        assert_eq!(parse_args("particle A"), vec![json!("particle A")]);
        assert_eq!(parse_args("heterodyne_frequency, 2e6"), vec![json!("heterodyne_frequency"), json!(2e6)]);
        assert_eq!(
            parse_args(r#"[{"offset": 1e6, "duration": 1}]"#),
            vec![json!([{"offset": 1e6, "duration": 1}])]
        );
        assert!(parse_args("   ").is_empty());
    }

    #[tokio::test]
    async fn save_writes_the_settings_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("settings.json");
        let runtime = DeviceRuntime::default();
        runtime.register("constants", lablink_runtime::devices::ConstantsDevice::default()).await?;
        let mut session = Session::new(runtime, SettingsStore::new(&path));

        execute(&mut session, parse("action constants set heterodyne_frequency, 2e6")?).await;
        execute(&mut session, Command::Save).await;

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(saved["constants"]["heterodyneFrequency"], json!(2e6));
        Ok(())
    }
}
