//
// main.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! ktclient
//!
//! A command line client for the kernel transport: launches installed
//! Jupyter kernels and runs code in them.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ktcore::{KernelLaunchSpec, KernelRegistry, KernelTransport, TransportConfig};
use ktshared::jupyter_message::JupyterChannel;
use ktshared::kernel_event::TransportEvent;
use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The log level to use (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value_t = String::from("info"))]
    log_level: String,

    /// Optional file to write logs to, in addition to the terminal
    #[arg(short = 'f', long, value_name = "FILE")]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the Jupyter kernels installed on this machine
    Kernels,

    /// Launch a kernel and print its kernel_info reply
    Info {
        /// The name of the installed kernel to launch
        #[arg(short, long)]
        kernel: String,
    },

    /// Launch a kernel, execute code in it, and print the results
    Execute {
        /// The name of the installed kernel to launch
        #[arg(short, long)]
        kernel: String,

        /// The code to execute
        #[arg(short, long)]
        code: String,

        /// Also print kernel lifecycle events as they arrive
        #[arg(short, long)]
        events: bool,
    },
}

#[cfg(target_os = "macos")]
fn jupyter_dir() -> anyhow::Result<PathBuf> {
    // On macOS, Jupyter doesn't follow the XDG Base Directory
    // Specification; it stores its data in `~/Library/Jupyter` instead
    // of the "correct" XDG location in `~/Library/Application Support`.
    let base_dir = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("could not find home directory"))?;
    Ok(base_dir.home_dir().join("Library").join("Jupyter"))
}

#[cfg(not(target_os = "macos"))]
fn jupyter_dir() -> anyhow::Result<PathBuf> {
    let dir = directories::ProjectDirs::from("Jupyter", "", "")
        .ok_or_else(|| anyhow::anyhow!("could not find Jupyter data directory"))?;
    Ok(dir.data_dir().to_path_buf())
}

/// Load the spec for an installed kernel by name.
fn find_kernel_spec(name: &str) -> anyhow::Result<KernelLaunchSpec> {
    let path = jupyter_dir()?
        .join("kernels")
        .join(name)
        .join("kernel.json");
    KernelLaunchSpec::from_file(&path)
        .map_err(|err| anyhow::anyhow!("failed to read kernel spec at {:?}: {}", path, err))
}

fn list_kernels() -> anyhow::Result<()> {
    let kernels_dir = jupyter_dir()?.join("kernels");
    let entries = std::fs::read_dir(&kernels_dir)
        .map_err(|err| anyhow::anyhow!("failed to read {:?}: {}", kernels_dir, err))?;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        match KernelLaunchSpec::from_file(entry.path().join("kernel.json")) {
            Ok(spec) => println!("{}\t{} ({})", name, spec.display_name, spec.language),
            Err(err) => log::debug!("Skipping {:?}: {}", entry.path(), err),
        }
    }
    Ok(())
}

async fn launch(kernel: &str) -> anyhow::Result<KernelTransport> {
    let spec = find_kernel_spec(kernel)?;
    let registry = Arc::new(KernelRegistry::new());
    let transport = KernelTransport::launch(spec, TransportConfig::default(), registry).await?;
    Ok(transport)
}

async fn kernel_info(kernel: &str) -> anyhow::Result<()> {
    let transport = launch(kernel).await?;
    let reply_rx = transport.kernel_info().await?;
    if let Ok(reply) = reply_rx.recv().await {
        println!("{}", serde_json::to_string_pretty(&reply.content)?);
    }
    transport.graceful_shutdown(5).await;
    Ok(())
}

async fn execute(kernel: &str, code: &str, events: bool) -> anyhow::Result<()> {
    let transport = launch(kernel).await?;

    if events {
        let event_rx = transport.events();
        tokio::spawn(async move {
            while let Ok(event) = event_rx.recv().await {
                match event {
                    TransportEvent::Output(stream, line) => {
                        print!("[{:?}] {}", stream, line);
                    }
                    other => println!("[event] {:?}", other),
                }
            }
        });
    }

    let result_rx = transport.execute(code).await?;
    while let Ok(message) = result_rx.recv().await {
        println!(
            "--- {:?}: {} ---\n{}",
            message.channel,
            message.header.msg_type,
            serde_json::to_string_pretty(&message.content)?
        );
        // The shell-channel reply is the terminal message
        if message.channel == JupyterChannel::Shell {
            break;
        }
    }

    transport.graceful_shutdown(5).await;
    Ok(())
}

fn init_logging(args: &Args) {
    let log_level = match args.log_level.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        other => {
            println!("Invalid log level '{}'; using 'info'", other);
            LevelFilter::Info
        }
    };

    match args.log_file {
        Some(ref log_file) => {
            // A log file was provided; use a combined logger that writes to
            // the log file and the terminal
            let file = match File::create(log_file) {
                Ok(file) => file,
                Err(err) => {
                    println!("Failed to create log file {}: {}", log_file, err);
                    std::process::exit(1);
                }
            };
            if let Err(err) = CombinedLogger::init(vec![
                TermLogger::new(
                    log_level,
                    Config::default(),
                    TerminalMode::Mixed,
                    ColorChoice::Auto,
                ),
                WriteLogger::new(log_level, Config::default(), file),
            ]) {
                println!(
                    "Failed to initialize combined file/terminal logging: {}",
                    err
                );
                std::process::exit(1);
            }
        }
        None => {
            if let Err(err) = TermLogger::init(
                log_level,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            ) {
                println!("Failed to initialize terminal logging: {}", err);
                std::process::exit(1);
            }
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Failed to create async runtime: {}", err);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Kernels => list_kernels(),
        Commands::Info { ref kernel } => rt.block_on(kernel_info(kernel)),
        Commands::Execute {
            ref kernel,
            ref code,
            events,
        } => rt.block_on(execute(kernel, code, events)),
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
