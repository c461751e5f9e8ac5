//! Tutor Call - call signaling core for two-party tutoring video calls
//!
//! Runs the WebSocket signaling relay, or a simulated call participant
//! against it.

mod calling;
mod config;
mod relay;
mod shell;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::calling::AccountRole;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "tutor-call")]
#[command(about = "Signaling relay and call participant for tutoring video calls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket signaling relay
    Serve {
        /// Address to listen on (defaults to relay.listen_addr)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Join a call room as a simulated participant
    Call {
        /// Room to join; students may omit it and wait for an invitation
        #[arg(long)]
        room: Option<String>,

        /// Your user id
        #[arg(short, long)]
        user: String,

        /// Display name shown to the callee
        #[arg(short, long, default_value = "Anonymous")]
        name: String,

        /// Account role: admin starts negotiation, student answers
        #[arg(short, long, value_enum)]
        role: AccountRole,

        /// Relay WebSocket URL (defaults to relay.url)
        #[arg(long)]
        relay: Option<String>,

        /// Ring this user before joining (admin only)
        #[arg(long)]
        invite: Option<String>,

        /// Hang up this many seconds after connecting
        #[arg(short, long)]
        duration: Option<u64>,

        /// Start sharing the screen this many seconds after connecting
        #[arg(long)]
        share_screen_after: Option<u64>,

        /// Mute the microphone this many seconds after connecting
        #[arg(long)]
        mute_after: Option<u64>,

        /// Turn the camera off this many seconds after connecting
        #[arg(long)]
        camera_off_after: Option<u64>,

        /// Pretend no camera is available
        #[arg(long)]
        audio_only: bool,

        /// Decline the first invitation (students waiting without --room)
        #[arg(long)]
        reject: bool,
    },

    /// Run a complete two-party call in-process
    Demo,

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load()?;

    match cli.command {
        Commands::Serve { listen } => {
            let addr = listen.unwrap_or_else(|| config.relay.listen_addr.clone());
            tracing::info!("Starting relay on {}...", addr);
            relay::server::serve(&addr, Arc::new(relay::hub::RelayHub::new())).await?;
        }
        Commands::Call {
            room,
            user,
            name,
            role,
            relay: relay_url,
            invite,
            duration,
            share_screen_after,
            mute_after,
            camera_off_after,
            audio_only,
            reject,
        } => {
            let opts = shell::CallOptions {
                room: room.map(Into::into),
                user: user.into(),
                name,
                role,
                relay_url: relay_url.unwrap_or_else(|| config.relay.url.clone()),
                invite: invite.map(Into::into),
                duration: duration.map(Duration::from_secs),
                share_screen_after: share_screen_after.map(Duration::from_secs),
                mute_after: mute_after.map(Duration::from_secs),
                camera_off_after: camera_off_after.map(Duration::from_secs),
                audio_only,
                reject,
            };
            shell::run_call(&config, opts).await?;
        }
        Commands::Demo => {
            tracing::info!("Running in-process demo call...");
            shell::run_demo(&config).await?;
        }
        Commands::Config { init } => {
            if init {
                let path = Config::default().save()?;
                println!("Wrote default configuration to {}", path.display());
            } else {
                println!("# {}", Config::config_path()?.display());
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}
