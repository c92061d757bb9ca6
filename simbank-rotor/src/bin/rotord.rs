//! Rotation engine daemon.
//!
//! Acquires the instance lock, assembles the engine from the configured
//! pool table and drives the rotation loop until interrupted. On ctrl-c the
//! current rotation state is persisted before exit so the next run resumes
//! where this one stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use simbank_rotor::channel::{CommandChannel, DryRunChannel, SerialChannel};
use simbank_rotor::companion::{Companion, NullCompanion, ProcessCompanion};
use simbank_rotor::config::{self, SLOT_MAX, SLOT_MIN, Settings};
use simbank_rotor::coordinator::{RotationCoordinator, RotationMode};
use simbank_rotor::registry::EndpointRegistry;
use simbank_rotor::state::{LockFile, RotationState};
use simbank_rotor::store::{FileNumberStore, HttpNumberStore, NumberStore, TieredStore};

#[derive(Parser, Debug)]
#[command(
    name = "rotord",
    about = "SIM bank slot rotation and verification engine",
    version
)]
struct Args {
    /// Rotate continuously, sleeping between steps (default: bulk mode,
    /// which processes the whole cycle back-to-back once).
    #[arg(long)]
    continuous: bool,

    /// Minutes between rotations in continuous mode.
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Override the starting step (1-32) instead of resuming from state.
    #[arg(long, value_parser = clap::value_parser!(u8).range(SLOT_MIN as i64..=SLOT_MAX as i64))]
    start_step: Option<u8>,

    /// Simulate without hardware: every command answers OK.
    #[arg(long)]
    dry_run: bool,

    /// Pool table (JSON). Falls back to the built-in four-pool default.
    #[arg(long)]
    pools: Option<PathBuf>,

    /// Logical port mapping file.
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// Companion application process name to cycle around serial work.
    #[arg(long)]
    companion: Option<String>,

    /// Command line used to relaunch the companion application.
    #[arg(long, requires = "companion")]
    companion_launch: Option<String>,

    /// External number upsert endpoint (HTTP).
    #[arg(long)]
    upsert_url: Option<String>,

    /// Bearer token for the upsert endpoint.
    #[arg(long, requires = "upsert_url")]
    upsert_token: Option<String>,

    /// Deduplicate the local number file and exit.
    #[arg(long)]
    clean_numbers: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = Settings::default();
    settings.dry_run = args.dry_run;
    if let Some(mapping) = &args.mapping {
        settings.paths.port_mapping = mapping.clone();
    }

    if args.clean_numbers {
        let store = FileNumberStore::new(settings.paths.numbers.clone());
        let (before, after) = store.dedupe().await?;
        info!(before, after, "number file cleaned");
        return Ok(());
    }

    let pools = match &args.pools {
        Some(path) => config::load_pools(path).context("loading pool table")?,
        None => match config::load_pools(&settings.paths.pools) {
            Ok(pools) => pools,
            Err(_) => {
                info!("no pool table found, using built-in defaults");
                config::default_pools()
            }
        },
    };
    for pool in &pools {
        info!(
            pool = %pool.name,
            controller = %pool.controller,
            offset = pool.offset,
            ports = pool.logical_ports.len(),
            "pool configured"
        );
    }

    let _lock = LockFile::acquire(&settings.paths.lock).context("acquiring instance lock")?;

    let channel: Arc<dyn CommandChannel> = if settings.dry_run {
        info!("dry run: hardware will not be touched");
        Arc::new(DryRunChannel)
    } else {
        Arc::new(SerialChannel::new(settings.baud))
    };

    let registry = Arc::new(EndpointRegistry::new(
        settings.unstable_threshold,
        settings.blacklist_cooldown,
        &settings.permanent_blacklist,
    ));

    let mut stores: Vec<Box<dyn NumberStore>> = vec![Box::new(FileNumberStore::new(
        settings.paths.numbers.clone(),
    ))];
    if let Some(url) = &args.upsert_url {
        stores.push(Box::new(HttpNumberStore::new(
            url.clone(),
            args.upsert_token.clone(),
        )));
    }
    let store: Arc<dyn NumberStore> = Arc::new(TieredStore::new(stores));

    let companion: Arc<dyn Companion> = match &args.companion {
        Some(name) if !settings.dry_run => {
            let launch = args
                .companion_launch
                .as_ref()
                .map(|cmd| cmd.split_whitespace().map(String::from).collect());
            Arc::new(ProcessCompanion::new(name.clone(), launch))
        }
        _ => Arc::new(NullCompanion),
    };

    let mut state = RotationState::load(&settings.paths.state);
    if let Some(step) = args.start_step {
        info!(step, "starting step overridden");
        state.current_step = step;
    }
    info!(
        step = state.current_step,
        iteration = state.iteration,
        "resuming rotation cycle"
    );

    let mode = if args.continuous {
        RotationMode::Continuous {
            interval: Duration::from_secs(args.interval * 60),
        }
    } else {
        RotationMode::Bulk
    };

    let coordinator = RotationCoordinator::new(
        pools,
        channel,
        registry,
        store,
        companion,
        settings,
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing up and persisting state");
            signal_cancel.cancel();
        }
    });

    coordinator.run(mode, &mut state, &cancel).await;
    Ok(())
}
