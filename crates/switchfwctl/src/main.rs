//! switchfwctl - switch firmware control CLI
//!
//! Builds and inspects firmware images and drives the update engine against a
//! directory of file-backed flash regions.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod completion;
mod engine;
mod error;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::*;
use crate::engine::EngineArgs;
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "switchfwctl")]
#[command(about = "Switch firmware control - build, install and inspect firmware images")]
#[command(version)]
#[command(long_about = "
switchfwctl drives the switch firmware update engine against a directory of
file-backed flash regions. It generates signing keys, builds and inspects
firmware images, installs them into the standby partition, swaps the boot
image and reports what each partition holds.

Use --json for machine-readable output suitable for scripting.
")]
pub(crate) struct Cli {
    /// Print results as JSON envelopes instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an Ed25519 signing key
    Keygen {
        /// Key file to write (JSON, holds the private half)
        #[arg(short, long)]
        output: PathBuf,
        /// Key identifier stored in the key file
        #[arg(long, default_value = "fwkey")]
        identifier: String,
        /// Also install the public key as the firmware verification key
        #[arg(long)]
        install: bool,
    },

    /// Image building and inspection commands
    #[command(subcommand)]
    Image(ImageCommands),

    /// Flash bank and partition table commands
    #[command(subcommand)]
    Flash(FlashCommands),

    /// Install a firmware image into the standby partition
    Upgrade {
        /// Image file
        image: PathBuf,
        /// Name recorded for the upload (defaults to the file name)
        #[arg(long)]
        filename: Option<String>,
        /// Restart the system after a successful install
        #[arg(long, value_enum)]
        restart: Option<RestartArg>,
        /// Hand the image to the background worker and wait for it
        #[arg(long)]
        background: bool,
    },

    /// Make the backup image the one booted next
    Swap,

    /// Show installed images and the partition table
    Status,

    /// Print a shell completion script
    Completion {
        /// Target shell
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_no_env| {
                format!("switchfwctl={0},switchfw_update={0},switchfw_crypto={0}", log_level).into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match execute_command(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }

            ExitCode::from(e.downcast_ref::<CliError>().map_or(1, CliError::exit_code))
        }
    }
}

fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Keygen {
            output,
            identifier,
            install,
        } => commands::keys::generate(output, identifier, *install, &cli.engine, cli.json),
        Commands::Image(cmd) => commands::image::execute(cmd, &cli.engine, cli.json),
        Commands::Flash(cmd) => commands::flash::execute(cmd, &cli.engine, cli.json),
        Commands::Upgrade {
            image,
            filename,
            restart,
            background,
        } => commands::upgrade::upgrade(
            image,
            filename.as_deref(),
            restart.map(RestartArg::mode),
            *background,
            &cli.engine,
            cli.json,
        ),
        Commands::Swap => commands::upgrade::swap(&cli.engine, cli.json),
        Commands::Status => commands::flash::status(&cli.engine, cli.json),
        Commands::Completion { shell } => {
            completion::generate_completion(*shell);
            Ok(())
        }
    }
}
