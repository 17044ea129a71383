//! Terminal over the Nordic UART Service
//!
//! Run with: cargo run --example ble_terminal [device-name]
//!
//! Scans for UART peripherals, connects to the first one (or the first whose
//! name contains the argument), then sends each line typed on stdin and
//! prints whatever the peripheral sends back.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use uart_bridge::{BleConfig, BleTransport, ConnectionState, Result, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("uart_bridge=debug".parse().unwrap()),
        )
        .init();

    let wanted = std::env::args().nth(1);

    let transport = BleTransport::with_system_adapter(BleConfig::default()).await?;
    transport.start_scan()?;

    println!("Scanning for UART peripherals for 5 seconds...");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let devices = transport.devices();
    println!("Found {} device(s)", devices.len());
    for device in &devices {
        println!("  {} ({}) RSSI: {:?}", device.display_name(), device.id, device.rssi);
    }

    let Some(device) = devices.into_iter().find(|d| match &wanted {
        Some(name) => d.display_name().contains(name.as_str()),
        None => true,
    }) else {
        println!("No matching device found.");
        transport.shutdown().await?;
        return Ok(());
    };

    let _state_handle = transport.on_state_changed(|state| println!("[{}]", state));
    let _text_handle = transport.on_text_received(|text| print!("{}", text));

    println!("Connecting to {}...", device.display_name());
    transport.connect(device.id.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if transport.state() != ConnectionState::Connected {
                        println!("Not connected, line dropped.");
                        continue;
                    }
                    transport.send(&format!("{line}\n"))?;
                }
                None => break,
            },
        }
    }

    transport.disconnect()?;
    transport.shutdown().await?;
    println!("\nReceived in total:\n{}", transport.received_text());

    Ok(())
}
