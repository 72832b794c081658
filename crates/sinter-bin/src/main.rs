//! sinter entrypoint: logging bootstrap, HAL selection, and the G-code
//! command loop (interactive shell or file playback).

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use core_config::MachineConfig;
use core_gcode::GcodeLine;
use core_hal::{SharedHal, VirtualHal};
use core_machine::GMachine;
use hal_rpi::RpiHal;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt, reload};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "sinter", version, about = "G-code CNC/3D printer controller")]
struct Args {
    /// G-code file to execute; without it an interactive shell starts.
    pub file: Option<PathBuf>,
    /// Configuration file path (overrides discovery of `sinter.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Use the verifying virtual backend even on real hardware.
    #[arg(long = "virtual-hal")]
    pub virtual_hal: bool,
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// File log with a runtime-switchable filter so M111 can raise verbosity
/// mid-session.
fn configure_logging() -> Result<(Option<WorkerGuard>, FilterHandle)> {
    let log_path = std::path::Path::new("sinter.log");
    if log_path.exists() {
        let _ = std::fs::remove_file(log_path);
    }
    let appender = tracing_appender::rolling::never(".", "sinter.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let (filter, handle) = reload::Layer::new(EnvFilter::from_default_env());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok((Some(guard), handle))
}

fn install_panic_hook() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!(target: "runtime.panic", %panic_info, "panic");
        default_panic(panic_info);
    }));
}

fn select_hal(config: Arc<MachineConfig>, force_virtual: bool) -> SharedHal {
    if !force_virtual && RpiHal::available() {
        match RpiHal::new(config.clone()) {
            Ok(hal) => {
                info!(target: "runtime", "using raspberry pi backend");
                return Arc::new(hal);
            }
            Err(err) => {
                error!(target: "runtime", ?err, "hardware backend failed, using virtual");
            }
        }
    }
    println!("----- Hardware not detected, using virtual environment -----");
    println!("----- Use M111 command to enable more detailed debug -----");
    info!(target: "runtime", "using virtual backend");
    Arc::new(VirtualHal::new(config))
}

/// Execute one input line: parse, dispatch, report. Returns `false` when the
/// line failed.
fn do_line(machine: &mut GMachine, filter: &FilterHandle, line: &str) -> bool {
    let parsed = match GcodeLine::parse(line) {
        Ok(parsed) => parsed,
        Err(err) => {
            println!("ERROR {err}");
            return false;
        }
    };
    let Some(parsed) = parsed else {
        println!("OK");
        return true;
    };
    if parsed.command().as_deref() == Some("M111") {
        let _ = filter.modify(|f| *f = EnvFilter::new("debug"));
        info!(target: "runtime", "debug logging enabled");
    }
    match machine.do_command(&parsed) {
        Ok(reply) => {
            if let Some(reply) = reply {
                println!("{reply}");
            }
            println!("OK");
            true
        }
        Err(err) => {
            println!("ERROR {err}");
            false
        }
    }
}

fn run_file(machine: &mut GMachine, filter: &FilterHandle, path: &PathBuf) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        println!("> {line}");
        if !do_line(machine, filter, line) {
            break;
        }
    }
    Ok(())
}

fn run_shell(machine: &mut GMachine, filter: &FilterHandle) -> Result<()> {
    println!("*************** Welcome to sinter! ***************");
    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line == "quit" || line == "exit" {
                    break;
                }
                let _ = editor.add_history_entry(line);
                do_line(machine, filter, line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let (_log_guard, filter) = configure_logging()?;
    install_panic_hook();
    let args = Args::parse();
    info!(target: "runtime", file = ?args.file, "startup");

    let config = Arc::new(core_config::load_from(args.config.clone())?);
    let hal = select_hal(config.clone(), args.virtual_hal);
    let mut machine = GMachine::new(hal, config).context("machine initialization failed")?;

    let outcome = match &args.file {
        Some(path) => run_file(&mut machine, &filter, path),
        None => run_shell(&mut machine, &filter),
    };
    println!("\r\nExiting...");
    machine.release();
    outcome
}
