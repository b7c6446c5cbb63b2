use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use hublink_core::discovery::{list_dfu_devices, list_usb_hubs};
use hublink_core::{
    FirmwareArchive, FlashTarget, HubConfig, HubDescriptor, HubFilter, HubKind, HubSession,
    MpyCross, Scanner,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run programs on and install firmware to Pybricks hubs",
    long_about = None
)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a compiled program to a hub and run it
    Run {
        /// Hub name or address, or a serial port path
        hub: String,
        /// Compiled program (.mpy)
        program: PathBuf,
        /// Look for the hub on USB instead of BLE
        #[arg(long)]
        usb: bool,
    },
    /// Install firmware from a firmware.zip bundle
    Flash {
        firmware: PathBuf,
        /// Hub name to store in the firmware
        #[arg(long)]
        name: Option<String>,
        /// Flash a hub waiting in USB DFU mode
        #[arg(long)]
        usb: bool,
        /// Name or address of the BLE hub to flash
        #[arg(long)]
        hub: Option<String>,
        /// mpy-cross executable used for firmware with an embedded main.py
        #[arg(long, default_value = "mpy-cross")]
        mpy_cross: PathBuf,
    },
    /// Save the firmware of a hub in USB DFU mode
    Backup { file: PathBuf },
    /// Restore a firmware backup to a hub in USB DFU mode
    Restore { file: PathBuf },
    /// List hubs on BLE and USB
    Scan,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => HubConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HubConfig::default(),
    };
    let session = HubSession::new(config);

    match args.command {
        Commands::Run { hub, program, usb } => {
            let program =
                std::fs::read(&program).with_context(|| format!("reading {}", program.display()))?;
            let target = resolve_hub(&session, &hub, usb).await?;
            let outcome = session
                .run_program(target, &program, |out| {
                    let mut stdout = std::io::stdout().lock();
                    let _ = stdout.write_all(out);
                    let _ = stdout.flush();
                })
                .await?;
            info!(
                bytes = outcome.transfer.bytes,
                retries = outcome.transfer.retries,
                completed = outcome.completed,
                "Program finished"
            );
        }
        Commands::Flash {
            firmware,
            name,
            usb,
            hub,
            mpy_cross,
        } => {
            let archive = FirmwareArchive::open(&firmware)
                .with_context(|| format!("reading {}", firmware.display()))?;
            let target = if usb {
                FlashTarget::UsbDfu(None)
            } else {
                FlashTarget::Ble(HubFilter::new(hub))
            };
            let report = session
                .flash_firmware(&archive, &MpyCross::new(mpy_cross), name.as_deref(), target)
                .await?;
            info!(bytes = report.bytes, verified = report.verified, "Firmware installed");
        }
        Commands::Backup { file } => {
            let backup = session.backup_firmware(&file, None).await?;
            info!(path = %file.display(), bytes = backup.len(), "Backup written");
        }
        Commands::Restore { file } => {
            let report = session.restore_firmware(&file, None).await?;
            info!(bytes = report.bytes, verified = report.verified, "Backup restored");
        }
        Commands::Scan => scan(&session).await?,
    }
    Ok(())
}

async fn resolve_hub(session: &HubSession, hub: &str, usb: bool) -> Result<HubDescriptor> {
    if hub.starts_with("/dev/") || hub.to_ascii_uppercase().starts_with("COM") {
        return Ok(HubDescriptor::serial(hub, HubKind::TechnicLarge));
    }
    if usb {
        return match list_usb_hubs()?
            .into_iter()
            .find(|d| HubFilter::new(Some(hub.to_string())).matches(d) || hub == "any")
        {
            Some(found) => Ok(found),
            None => bail!("no USB hub matching '{}'", hub),
        };
    }
    Ok(session.find_hub(HubFilter::new(Some(hub.to_string()))).await?)
}

async fn scan(session: &HubSession) -> Result<()> {
    let dfu = &session.config().dfu;
    for hub in list_dfu_devices(dfu.vendor_id, &dfu.product_ids)? {
        println!("{:<24} {:<12} {:?} (DFU)", hub.address, "-", hub.hub_kind);
    }
    for hub in list_usb_hubs()? {
        println!(
            "{:<24} {:<12} {:?} (USB)",
            hub.address,
            hub.name.as_deref().unwrap_or("-"),
            hub.hub_kind
        );
    }

    let scanner = Scanner::new().await?;
    let stream = scanner
        .scan(HubFilter::default(), session.config().scan_timeout())
        .await?;
    futures::pin_mut!(stream);
    while let Some(hub) = stream.next().await {
        println!(
            "{:<24} {:<12} {:?}{} rssi={}",
            hub.address,
            hub.name.as_deref().unwrap_or("-"),
            hub.hub_kind,
            if hub.bootloader { " (bootloader)" } else { "" },
            hub.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into())
        );
    }
    Ok(())
}
