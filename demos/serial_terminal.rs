//! Terminal over a serial port
//!
//! Run with: cargo run --example serial_terminal [port] [baud-rate]
//!
//! Without a port argument the first enumerated port is used. The baud rate
//! defaults to the one used last time.

use tokio::io::{AsyncBufReadExt, BufReader};
use uart_bridge::{
    JsonFilePreferences, Result, SerialConfig, SerialTarget, SerialTransport, Transport,
    BAUD_RATES,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("uart_bridge=debug")
        .init();

    let preferences = JsonFilePreferences::open_default()?;
    println!("Preferences: {}", preferences.path().display());

    let transport = SerialTransport::with_system_ports(preferences, SerialConfig::default());

    println!("Serial ports:");
    for port in transport.ports() {
        println!("  {} - {} ({:?})", port.path, port.name, port.kind);
    }

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next().or_else(|| transport.selected_port()) else {
        println!("No serial ports found.");
        transport.shutdown().await?;
        return Ok(());
    };
    let baud_rate = match args.next() {
        Some(rate) => rate.parse::<u32>().map_err(|_| uart_bridge::Error::InvalidParameter {
            name: "baud_rate".to_string(),
            value: rate.clone(),
        })?,
        None => transport.baud_rate(),
    };
    if !BAUD_RATES.contains(&baud_rate) {
        println!("Note: {} is not one of the usual rates {:?}", baud_rate, BAUD_RATES);
    }

    let _state_handle = transport.on_state_changed(|state| println!("[{}]", state));
    let _text_handle = transport.on_text_received(|text| print!("{}", text));

    println!("Connecting to {} at {} baud...", path, baud_rate);
    transport.connect(SerialTarget::new(path, baud_rate))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line == "/clear" => transport.clear_received_text()?,
                Some(line) if line == "/ports" => {
                    transport.refresh_ports()?;
                    transport.sync().await?;
                    for port in transport.ports() {
                        println!("  {} - {}", port.path, port.name);
                    }
                }
                Some(line) => transport.send(&format!("{line}\n"))?,
                None => break,
            },
        }
    }

    transport.disconnect()?;
    transport.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
