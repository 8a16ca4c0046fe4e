//! Battery level example
//!
//! Scans for peripherals advertising the Battery service, connects to the
//! strongest one, reads its battery level and prints notifications for a
//! few seconds.
//!
//! Run with: cargo run --example battery_level
//!
//! To connect to a specific peripheral:
//!   cargo run --example battery_level -- --id aabbccddeeff

use ble_central::{
    Central, CentralConfig, CentralEvent, Error, EventKind, PeripheralId, Result, BATTERY_LEVEL,
    BATTERY_SERVICE,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ble_central=debug")
        .init();

    println!("Battery Level");
    println!("=============\n");

    let args: Vec<String> = std::env::args().collect();
    let target = args
        .iter()
        .position(|arg| arg == "--id")
        .and_then(|i| args.get(i + 1))
        .map(PeripheralId::new);

    let central = Central::with_btleplug(CentralConfig::default()).await?;
    let _state = central.on(EventKind::StateChange, |event| {
        if let CentralEvent::StateChange(state) = event {
            println!("Radio: {}", state);
        }
    });
    let _notifications = central.on(EventKind::Data, |event| {
        if let CentralEvent::Data {
            value,
            is_notification: true,
            ..
        } = event
        {
            if let Some(level) = value.first() {
                println!("  Battery level: {}%", level);
            }
        }
    });

    central.start().await?;
    central.start_scanning(&[BATTERY_SERVICE], false).await?;
    println!("Scanning for 5 seconds...\n");
    tokio::time::sleep(Duration::from_secs(5)).await;
    central.stop_scanning().await?;

    let peripherals = central.peripherals().await?;
    let chosen = match target {
        Some(id) => peripherals.into_iter().find(|p| p.id == id),
        None => peripherals
            .into_iter()
            .filter(|p| p.advertisement.matches_services(&[BATTERY_SERVICE]))
            .max_by_key(|p| p.rssi.unwrap_or(i16::MIN)),
    };
    let peripheral = match chosen {
        Some(peripheral) => peripheral,
        None => {
            println!("No peripheral with a Battery service found.");
            central.shutdown().await?;
            return Ok(());
        }
    };

    println!(
        "Connecting to {} ({})...",
        peripheral.id,
        peripheral
            .advertisement
            .local_name
            .as_deref()
            .unwrap_or("unnamed")
    );
    central.connect(&peripheral.id).await?;

    let services = central
        .discover_services(&peripheral.id, &[BATTERY_SERVICE])
        .await?;
    let service = services.first().ok_or(Error::NotSupported {
        operation: "battery service".to_string(),
    })?;
    let characteristics = central
        .discover_characteristics(&peripheral.id, service.handle, &[BATTERY_LEVEL])
        .await?;
    let level = characteristics.first().ok_or(Error::NotSupported {
        operation: "battery level characteristic".to_string(),
    })?;

    let value = central.read(&peripheral.id, level.handle).await?;
    match value.first() {
        Some(percent) => println!("Battery level: {}%", percent),
        None => println!("Battery level: empty response"),
    }

    match central.subscribe(&peripheral.id, level.handle).await {
        Ok(()) => {
            println!("\nWaiting for notifications...");
            tokio::time::sleep(Duration::from_secs(10)).await;
            central.unsubscribe(&peripheral.id, level.handle).await?;
        }
        Err(e) => println!("Notifications unavailable: {}", e),
    }

    central.disconnect(&peripheral.id).await?;
    central.shutdown().await?;
    Ok(())
}
