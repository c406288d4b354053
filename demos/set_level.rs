//! Set a heater's level.
//!
//! Run with: cargo run --example set_level -- <ADDRESS> <0|33|66|100> 0x001f=<UUID> [HANDLE=UUID ...]
//!
//! The `HANDLE=UUID` pairs map attribute handles to the characteristic UUIDs
//! your heater reports. The unlock handle 0x001f must be among them.

use solamagic_ble::{Error, HandleTable, HeaterRegistry, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("solamagic_ble=debug".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(address), Some(level)) = (args.next(), args.next()) else {
        eprintln!("usage: set_level <ADDRESS> <0|33|66|100> 0x001f=<UUID> [HANDLE=UUID ...]");
        std::process::exit(2);
    };
    let percentage: u8 = level.parse().map_err(|_| Error::InvalidParameter {
        name: "level".to_string(),
        value: level.clone(),
    })?;

    let mut handles = HandleTable::default();
    for entry in args {
        let (handle, uuid) = HandleTable::parse_entry(&entry)?;
        handles.insert(handle, uuid);
    }

    let registry = HeaterRegistry::with_platform(handles).await?;
    let heater = registry.get_or_insert(&address);

    let _status = heater.on_status(|status| {
        println!("Status: {} ({:?})", status.level, status.source);
    });
    let _confirmations = heater.on_confirmation(|bytes| {
        println!("Confirmation: {:02X?}", bytes);
    });

    println!("Setting {} to {}%...", heater.address(), percentage);
    heater.set_level(percentage).await?;

    // Give late notifications a chance to arrive
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Some(status) = heater.last_status() {
        println!("Last status: {} at {}", status.level, status.observed_at);
    }

    registry.shutdown().await?;
    Ok(())
}
