//! `lablink` – laboratory device runtime shell.
//!
//! This binary is the entry point for running a rig. It:
//!
//! 1. Loads the rig file (`~/.lablink/rig.toml`, or the path given as the
//!    first argument); falls back to the built-in simulated bench.
//! 2. Registers every device and restores persisted settings.
//! 3. Starts the device loops and drops the user into an interactive REPL.
//! 4. On `quit`, end of input or **Ctrl-C**, stops the loops and tears every
//!    device down, which also restores anything a running scan changed.

mod config;
mod repl;
mod rig;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use lablink_runtime::{DeviceRuntime, SettingsStore};
use tracing::{error, warn};

fn main() -> ExitCode {
    // Before the Tokio runtime exists: the OTLP exporter builds a blocking
    // HTTP client.
    let _telemetry = lablink_runtime::init_tracing("lablink");

    print_banner();

    let rig_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(config::rig_path);
    let rig = match config::load_or_default(&rig_path) {
        Ok(rig) => rig,
        Err(e) => {
            println!("{}: {}", "Rig error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    if rig_path.exists() {
        println!("  Rig loaded from {}", rig_path.display().to_string().bold());
    } else {
        println!("  No rig file found – using the simulated bench.");
        match config::save_to(&config::RigConfig::default(), &rig_path) {
            Ok(()) => println!("  Bench written to {} for editing.", rig_path.display().to_string().bold()),
            Err(e) => println!("  {}: {}", "Could not write rig file".yellow(), e),
        }
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    // ── Devices ───────────────────────────────────────────────────────────
    let runtime = DeviceRuntime::new(rig.runtime_config());
    if let Err(e) = rt.block_on(rig::build(&runtime, &rig)) {
        println!("{}: {}", "Rig assembly failed".red(), e);
        rt.block_on(runtime.shutdown());
        return ExitCode::FAILURE;
    }
    println!("  {} device(s) registered.", runtime.device_names().len().to_string().bold());

    // ── Settings ──────────────────────────────────────────────────────────
    let store = SettingsStore::new(&rig.settings_path);
    match rt.block_on(store.restore_runtime(&runtime)) {
        Ok(failures) => {
            for (device, e) in failures {
                println!("  {} settings for {} not restored: {}", "⚠".yellow(), device.bold(), e);
            }
        }
        Err(e) => {
            warn!(path = %store.path().display(), error = %e, "settings file unreadable, starting from defaults");
            println!("  {}: {}", "Settings not restored".yellow(), e);
        }
    }

    rt.block_on(async { runtime.start() });

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting the rig down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; use `quit` to shut down cleanly");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    let mut session = repl::Session::new(runtime.clone(), store);
    repl::run(&rt, &mut session, shutdown);

    rt.block_on(runtime.shutdown());
    println!("{}", "  ✓ All devices torn down. Goodbye.".green());
    ExitCode::SUCCESS
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __        __   ___       __"#.bold().cyan());
    println!("{}", r#"  / /  ___ _/ /  / (_)__   / /__"#.bold().cyan());
    println!("{}", r#" / /__/ _ `/ _ \/ / / _ \ /  '_/"#.bold().cyan());
    println!("{}", r#"/____/\_,_/_.__/_/_/_//_//_/\_\ "#.bold().cyan());
    println!();
    println!("  {} {}", "lablink".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Laboratory device runtime");
    println!();
}
