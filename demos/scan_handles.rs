//! Probe a range of attribute handles and report which are readable.
//!
//! Run with: cargo run --example scan_handles -- <ADDRESS> [START] [END] [HANDLE=UUID ...]
//!
//! Only handles present in the handle table can be read through btleplug, so
//! pass `HANDLE=UUID` pairs for the attributes you want to probe.

use solamagic_ble::{
    parse_hex, Error, HandleTable, HeaterRegistry, MemoryTokenStore, PlatformConnector, Result,
};
use std::sync::Arc;

fn parse_handle(value: &str) -> Result<u16> {
    let bytes = parse_hex(value.trim_start_matches("0x"))?;
    match bytes.as_slice() {
        [lo] => Ok(u16::from(*lo)),
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(Error::InvalidParameter {
            name: "handle".to_string(),
            value: value.to_string(),
        }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("solamagic_ble=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(address) = args.first() else {
        eprintln!("usage: scan_handles <ADDRESS> [START] [END] [HANDLE=UUID ...]");
        std::process::exit(2);
    };

    let mut positional = Vec::new();
    let mut handles = HandleTable::default();
    for arg in &args[1..] {
        if arg.contains('=') {
            let (handle, uuid) = HandleTable::parse_entry(arg)?;
            handles.insert(handle, uuid);
        } else {
            positional.push(parse_handle(arg)?);
        }
    }
    let start = positional.first().copied().unwrap_or(0x0001);
    let end = positional.get(1).copied().unwrap_or(0x0040);

    let connector = PlatformConnector::new().await?.with_handles(handles);
    let registry = HeaterRegistry::new(Arc::new(connector), Arc::new(MemoryTokenStore::new()));
    let heater = registry.get_or_insert(address);

    println!("Scanning {} handles {:#06x}..={:#06x}", heater.address(), start, end);
    let readings = heater.scan_handles(start..=end).await?;

    for reading in &readings {
        let marker = if reading.looks_like_init_token() {
            "  <- init token?"
        } else {
            ""
        };
        println!(
            "  {:#06x}: {} ({} bytes){}",
            reading.handle,
            reading.hex(),
            reading.value.len(),
            marker
        );
    }
    println!("{} readable handles", readings.len());

    if let Some(token) = heater.read_init_token().await.ok().flatten() {
        println!("Init token: {}", token);
    }

    registry.shutdown().await?;
    Ok(())
}
