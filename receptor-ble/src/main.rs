//! BLE receiver for receptor devices
//!
//! Finds the receptor peripheral, subscribes to its value characteristic and
//! prints every value it sends.

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use receptor_ble_controller::event::EventSender;
use receptor_ble_controller::{
    BtleBackend, Client, ClientConfig, DisplayHandle, Event, HostPermissions, Surface, ble,
    display, event,
};

#[derive(Parser)]
#[command(name = "receptor-ble")]
#[command(about = "BLE receiver for receptor devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the first receptor device found and show its values
    Listen {
        /// Config file (JSON); defaults to $RECEPTOR_CONFIG
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Bluetooth adapter index
        #[arg(short, long)]
        adapter: Option<usize>,
        /// Device name shown while searching
        #[arg(short, long)]
        label: Option<String>,
    },
    /// List receptor devices in range
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Bluetooth adapter index
        #[arg(short, long, default_value = "0")]
        adapter: usize,
    },
}

/// Status and value lines on the terminal
struct Terminal;

impl Surface for Terminal {
    fn set_status(&mut self, text: &str) {
        println!("Status: {text}");
    }

    fn set_value(&mut self, text: &str) {
        println!("Value: {text}");
    }

    fn notify(&mut self, text: &str) {
        eprintln!("{text}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Listen { config, adapter, label } => {
            let mut config = ClientConfig::resolve(config.as_deref())?;
            if let Some(adapter) = adapter {
                config.adapter_index = adapter;
            }
            if let Some(label) = label {
                config.peripheral_label = label;
            }
            listen(config).await?;
        }
        Commands::Scan { duration, adapter } => {
            scan_devices(adapter, duration).await?;
        }
    }

    Ok(())
}

async fn listen(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (events_tx, events_rx) = event::channel();
    let (screen, updates) = DisplayHandle::channel();

    let adapter = ble::get_adapter(config.adapter_index).await?;
    let backend = BtleBackend::new(adapter, events_tx.clone()).await?;
    let permissions = HostPermissions::new(events_tx.clone());
    let client = Client::new(backend, permissions, screen, config);

    let surface = tokio::spawn(display::drive(updates, Terminal));
    spawn_scan_control(events_tx.clone());
    tokio::spawn(stop_on_ctrl_c(events_tx.clone()));

    println!("Press Enter to scan again, Ctrl-C to quit.");
    events_tx.send(Event::Resumed)?;
    events_tx.send(Event::ScanRequested)?;
    drop(events_tx);

    let client = client.run(events_rx).await;
    // dropping the client drops the last display handle
    let backend = client.into_backend();
    backend.shutdown().await;
    surface.await?;
    Ok(())
}

/// Every line on stdin is a press of the scan control
fn spawn_scan_control<D: Send + 'static>(events: EventSender<D>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line.is_err() || events.send(Event::ScanRequested).is_err() {
                break;
            }
        }
    });
}

async fn stop_on_ctrl_c<D: Send>(events: EventSender<D>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("cannot listen for Ctrl-C: {e}");
        return;
    }
    let _ = events.send(Event::Stopped);
}

async fn scan_devices(adapter: usize, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for receptor devices ({} seconds)...", duration);

    let adapter = ble::get_adapter(adapter).await?;
    let devices = ble::scan(&adapter, Duration::from_secs(duration)).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        println!("  {} ({}) RSSI: {}", device.name, device.address, rssi);
    }

    Ok(())
}
