//! WolfMirror - Asynchronous Block Volume Mirroring
//!
//! Command line entry point: configuration management and an in-process
//! mirroring simulation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmirror::config::MirrorConfig;
use wolfmirror::error::{Error, Result};
use wolfmirror::mirror::{MirrorRegistry, Peer, ReplicationController};
use wolfmirror::volume::{LocalVolume, MemoryPool, MemoryRemote};

/// Size of the simulated volume
const SIMULATED_VOLUME_SIZE: u64 = 1 << 22;
/// Block size written by the simulation
const SIMULATED_BLOCK_SIZE: usize = 512;

/// WolfMirror - Asynchronous Block Volume Mirroring
#[derive(Parser)]
#[command(name = "wolfmirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmirror.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmirror.toml")]
        output: PathBuf,

        /// Local mirror uuid (generated when omitted)
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Mirror an in-memory volume and verify the replica
    Simulate {
        /// Writer sessions (journal tags) to replicate
        #[arg(long, default_value_t = 10)]
        epochs: u32,

        /// 512-byte blocks written per session
        #[arg(long, default_value_t = 11)]
        blocks: usize,

        /// Seconds to wait for each catch-up
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config is optional for init and simulate
    let config = if cli.config.exists() {
        Some(MirrorConfig::from_file(&cli.config))
    } else {
        None
    };

    let (level, format) = match &config {
        Some(Ok(config)) => (config.logging.level.clone(), config.logging.format.clone()),
        _ => ("info".to_string(), "pretty".to_string()),
    };
    init_logging(cli.log_level.as_deref().unwrap_or(&level), &format);

    match cli.command {
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Simulate {
            epochs,
            blocks,
            timeout_secs,
        } => {
            let config = match config {
                Some(config) => config?,
                None => {
                    tracing::info!("No configuration at {:?}, using defaults", cli.config);
                    MirrorConfig::default()
                }
            };
            run_simulate(config, epochs, blocks, Duration::from_secs(timeout_secs)).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Write a default configuration file
fn run_init(output: PathBuf, node_id: Option<String>) -> Result<()> {
    let mut config = MirrorConfig::default();
    if let Some(node_id) = node_id {
        config.node.id = node_id;
    }
    config.validate()?;

    let content = format!(
        "# WolfMirror Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );
    std::fs::write(&output, content)?;

    println!("✓ Configuration written to {}", output.display());
    println!("  Node ID: {}", config.node.id);
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match MirrorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Local Pool: {}", config.node.local_pool);
            println!(
                "  Replay Delay: {}s",
                config.replay.mirroring_replay_delay_secs
            );
            println!(
                "  Resync After Disconnect: {}",
                config.replay.resync_after_disconnect
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Replicate an in-memory remote volume and verify every epoch
async fn run_simulate(
    config: MirrorConfig,
    epochs: u32,
    blocks: usize,
    timeout: Duration,
) -> Result<()> {
    if blocks == 0 || (blocks * SIMULATED_BLOCK_SIZE) as u64 > SIMULATED_VOLUME_SIZE {
        return Err(Error::InvalidArgument(format!(
            "blocks must be between 1 and {}",
            SIMULATED_VOLUME_SIZE / SIMULATED_BLOCK_SIZE as u64
        )));
    }

    let remote = MemoryRemote::new("image", SIMULATED_VOLUME_SIZE, config.journal.clone());
    let pool = Arc::new(MemoryPool::new());
    let registry = MirrorRegistry::new(pool.clone(), config.replayer_settings());

    let global_id = remote
        .global_id()
        .await
        .ok_or_else(|| Error::Internal("simulated volume has no global id".into()))?;
    let peer = Peer {
        cluster_name: "simulated-remote".into(),
        remote: remote.clone(),
        local_mirror_uuid: config.node.id.clone(),
        remote_mirror_uuid: uuid::Uuid::new_v4().to_string(),
    };
    let controller = registry.get_or_create(&global_id, peer).await?;

    tracing::info!(
        "Simulating {} epochs of {} blocks into pool '{}'",
        epochs,
        blocks,
        config.node.local_pool
    );
    controller.start().await?;

    for epoch in 0..epochs {
        let mut writer = remote.open_writer().await?;
        let mut data = vec![0u8; SIMULATED_BLOCK_SIZE];
        for i in 0..blocks {
            rand::thread_rng().fill(&mut data[..]);
            writer.write((i * SIMULATED_BLOCK_SIZE) as u64, &data).await?;
        }
        writer.close().await?;

        wait_for_catch_up(&controller, timeout).await?;

        let replica = pool
            .get("image")
            .await
            .ok_or_else(|| Error::NotFound("replica volume 'image'".into()))?;
        for i in 0..blocks {
            let offset = (i * SIMULATED_BLOCK_SIZE) as u64;
            let expected = remote
                .image()
                .read(offset, SIMULATED_BLOCK_SIZE as u64)
                .await?;
            let actual = replica.read(offset, SIMULATED_BLOCK_SIZE as u64).await?;
            if expected != actual {
                return Err(Error::Internal(format!(
                    "epoch {}: replica differs from primary at offset {}",
                    epoch, offset
                )));
            }
        }
        tracing::info!("Epoch {} replicated and verified", epoch);
    }

    let status = controller.status().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&status).map_err(|e| Error::Serialization(e.to_string()))?
    );

    registry.shutdown_all().await
}

async fn wait_for_catch_up(controller: &ReplicationController, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if controller.caught_up().await? {
            return Ok(());
        }
        if controller.is_stopped() {
            return Err(controller
                .last_error()
                .await
                .unwrap_or_else(|| Error::Internal("replication stopped".into())));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Internal(format!(
                "replica did not catch up within {:?}",
                timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
