// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! channelcast — self-hosted virtual-TV channel streaming engine
//!
//! Usage:
//!   channelcast serve    --config config.toml
//!   channelcast status   --config config.toml
//!   channelcast channels --config config.toml

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use channelcast::api;
use channelcast::config::Config;
use channelcast::encoder::FfmpegEncoder;
use channelcast::manager::StreamManager;
use channelcast::repository::StaticRepository;

#[derive(Parser)]
#[command(name = "channelcast", about = "Virtual-TV channel streaming engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and stream manager.
    Serve {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a brief status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// List configured channels.
    Channels {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => run_serve(config).await,
        Command::Status { config } => run_status(config),
        Command::Channels { config } => run_channels(config),
    }
}

async fn run_serve(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        channels = cfg.channels.len(),
        segment_path = ?cfg.streaming.segment_path,
        window_size = cfg.streaming.window_size,
        batch_size = cfg.streaming.batch_size,
        "Starting channelcast"
    );

    if let Err(e) = std::fs::create_dir_all(&cfg.streaming.segment_path) {
        error!(error = %e, "Failed to create segment root");
        std::process::exit(1);
    }

    let repository = match StaticRepository::new(&cfg.channels, Utc::now()) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "Failed to load channel repository");
            std::process::exit(1);
        }
    };
    let encoder = Arc::new(FfmpegEncoder::default());
    let manager = Arc::new(StreamManager::new(cfg.clone(), repository, encoder));

    if cfg.api.enabled {
        let state = Arc::new(api::AppState {
            manager: manager.clone(),
            config: Arc::new(parking_lot::RwLock::new(cfg.clone())),
        });
        let port = cfg.api.port;
        tokio::spawn(async move {
            api::start_server(state, port).await;
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received CTRL+C, shutting down…"),
        Err(e) => error!(error = %e, "Signal error"),
    }

    manager.stop().await;
}

fn run_status(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    println!("=== channelcast status ===");
    println!("Segment root   : {}", cfg.streaming.segment_path.display());
    println!("Segment length : {}s", cfg.streaming.segment_duration_seconds);
    println!("Window size    : {}", cfg.streaming.window_size);
    println!("Batch size     : {}", cfg.streaming.batch_size);
    println!("Channels       : {}", cfg.channels.len());
    for channel in &cfg.channels {
        println!("  {} ({}): {} items", channel.id, channel.name, channel.items.len());
    }
}

fn run_channels(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    if cfg.channels.is_empty() {
        println!("No channels configured");
        return;
    }

    println!("{:<16} {:<24} {:<6} {:<8}", "ID", "Name", "Loop", "Items");
    println!("{}", "-".repeat(60));
    for channel in &cfg.channels {
        println!(
            "{:<16} {:<24} {:<6} {:<8}",
            channel.id,
            channel.name,
            channel.loop_playback,
            channel.items.len()
        );
    }
}
