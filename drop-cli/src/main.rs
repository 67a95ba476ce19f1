//! # sharedrop
//!
//! Send a file to another machine through a sharedrop relay.
//!
//! ## Commands
//!
//! - `send`: Open a room and send one file to whoever joins it
//! - `receive`: Join a room and save the file offered there
//! - `code`: Print a fresh room code
//!
//! ## Example
//!
//! ```bash
//! # On the sending machine
//! sharedrop send ./holiday.mp4
//! #   Room code: k3x9qa
//!
//! # On the receiving machine
//! sharedrop receive k3x9qa --out ~/Downloads
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use drop_core::Tunables;
use drop_types::DEFAULT_CODE_LEN;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{code, receive, send};

/// Send files through a sharedrop relay.
#[derive(Parser, Debug)]
#[command(name = "sharedrop")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Relay address (default: $SHAREDROP_RELAY or ws://127.0.0.1:5050/ws)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Chunks per batch before waiting for the receiver
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a room and send one file
    Send {
        /// File to send
        file: PathBuf,

        /// Room code to use instead of a generated one
        #[arg(long, short)]
        code: Option<String>,
    },

    /// Join a room and receive the file offered there
    Receive {
        /// Room code shown by the sender
        code: String,

        /// Directory to save into (default: the user's download directory)
        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// Print a fresh room code
    Code {
        /// Code length
        #[arg(long, default_value_t = DEFAULT_CODE_LEN)]
        length: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let relay = config::resolve_relay(cli.relay);
    let mut tunables = Tunables::default();
    if let Some(batch_size) = cli.batch_size {
        tunables.batch_size = batch_size.max(1);
    }

    match cli.command {
        Commands::Send { file, code } => {
            send::run(&relay, &file, code.as_deref(), tunables).await?;
        }
        Commands::Receive { code, out } => {
            let out = match out {
                Some(dir) => dir,
                None => config::default_download_dir()?,
            };
            receive::run(&relay, &code, &out, tunables).await?;
        }
        Commands::Code { length } => {
            code::run(length);
        }
    }

    Ok(())
}
