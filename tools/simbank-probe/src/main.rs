//! Connectivity self-test for SIM bank controllers.
//!
//! Sends a ping and a harmless switch command to each controller and
//! reports what came back. Run this after recabling before trusting a
//! rotation run to the hardware.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use simbank_rotor::channel::{self, CommandChannel, SerialChannel};
use simbank_rotor::config::{self, Pool};
use simbank_rotor::registry;

#[derive(Parser, Debug)]
#[command(
    name = "simbank-probe",
    about = "Connectivity self-test for SIM bank controllers",
    version
)]
struct Args {
    /// Controller transports to probe. Defaults to the configured pool
    /// table, or the built-in defaults when none exists.
    ports: Vec<String>,

    /// Pool table (JSON) to read controllers from.
    #[arg(long)]
    pools: Option<std::path::PathBuf>,

    /// Baud rate for the controller ports.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Also list every serial transport visible on this host.
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let available = registry::available_transports();
    if args.list {
        println!("Serial transports ({}):", available.len());
        for port in &available {
            println!("  {port}");
        }
        println!();
    }

    let controllers: Vec<String> = if !args.ports.is_empty() {
        args.ports.clone()
    } else {
        let pools: Vec<Pool> = match &args.pools {
            Some(path) => config::load_pools(path)?,
            None => config::load_pools(std::path::Path::new("pools.json"))
                .unwrap_or_else(|_| config::default_pools()),
        };
        pools.into_iter().map(|p| p.controller).collect()
    };

    let channel = SerialChannel::new(args.baud);
    let mut failures = 0;

    for port in &controllers {
        println!("{port}:");
        if !available.iter().any(|p| p == port) {
            println!("  NOT PRESENT on this host");
            failures += 1;
            continue;
        }

        match channel.send(port, "AT", Duration::from_millis(500)).await {
            Ok(response) if channel::is_ok(&response) => println!("  ping: OK"),
            Ok(response) if response.is_empty() => println!("  ping: silent"),
            Ok(response) => println!("  ping: unexpected ({})", truncate(&response)),
            Err(e) => {
                println!("  ping: FAILED ({e})");
                failures += 1;
                continue;
            }
        }

        // Slot 1 on port 1: the switch every bank already honors, so the
        // probe never leaves the bank in a surprising position.
        match channel
            .send(port, "SWIT01-0001", Duration::from_millis(500))
            .await
        {
            Ok(response) if channel::is_ok(&response) || response.is_empty() => {
                println!("  switch: OK")
            }
            Ok(response) => {
                println!("  switch: rejected ({})", truncate(&response));
                failures += 1;
            }
            Err(e) => {
                println!("  switch: FAILED ({e})");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        println!("\n{failures} controller(s) failed the probe");
        std::process::exit(1);
    }
    println!("\nAll controllers answered");
    Ok(())
}

fn truncate(response: &str) -> String {
    let flat = response.replace(['\r', '\n'], " ");
    if flat.len() > 60 {
        format!("{}...", &flat[..60])
    } else {
        flat
    }
}
