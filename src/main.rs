use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};

mod device;
mod entry;
mod listing;
mod monitor;
mod sync;
mod transport;
mod util;

use crate::device::{Device, DEFAULT_ADB_PORT, DEFAULT_TIMEOUT_MS};
use crate::entry::EntryId;
use crate::listing::FileListingService;
use crate::monitor::ConsoleProgressMonitor;
use crate::sync::{file_type_from_mode, SyncService};
use crate::util::config;
use crate::util::logging::init_logger;

#[derive(Debug, Parser)]
#[command(name = "adbsync", version, about = "Browse, pull and push device files over the adb sync service")]
struct Cli {
    /// Device serial (defaults to the persisted serial, else any device)
    #[arg(long, short = 's', global = true)]
    serial: Option<String>,

    /// adb host server port
    #[arg(long, default_value_t = DEFAULT_ADB_PORT, global = true)]
    port: u16,

    /// Per-operation I/O timeout (milliseconds)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Verbose logging
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List devices known to the adb host server
    Devices,
    /// List a remote directory
    Ls {
        path: String,
        /// Bypass the listing cache
        #[arg(long, action = ArgAction::SetTrue)]
        no_cache: bool,
    },
    /// Print the mode of a remote file
    Stat { path: String },
    /// Download a remote file or directory tree
    Pull { remote: String, local: PathBuf },
    /// Upload a local file or directory tree
    Push { local: PathBuf, remote: String },
    /// Persistently set the default device serial
    SetDefaultSerial { serial: String },
    /// Clear the persisted default device serial
    ClearDefaultSerial,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut state = config::load_state();
    init_logger(cli.verbose);

    // Handle config-only subcommands before touching the network
    match &cli.command {
        Commands::SetDefaultSerial { serial } => {
            state.default_serial = Some(serial.clone());
            config::save_state(&state).context("saving state")?;
            println!("Default serial saved.");
            return Ok(());
        }
        Commands::ClearDefaultSerial => {
            state.default_serial = None;
            config::save_state(&state).context("saving state")?;
            println!("Default serial cleared.");
            return Ok(());
        }
        _ => {}
    }

    let timeout = Duration::from_millis(
        cli.timeout_ms
            .or(state.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS),
    );

    if let Commands::Devices = cli.command {
        let devices = device::list_devices(cli.port, timeout)
            .context("Querying adb host server for devices")?;
        if devices.is_empty() {
            println!("No devices attached.");
        }
        for d in devices {
            println!("{}\t{}", d.serial, d.state);
        }
        return Ok(());
    }

    let serial = cli.serial.or(state.default_serial);
    let device = Arc::new(Device::new(cli.port, serial, timeout));

    match cli.command {
        Commands::Ls { path, no_cache } => {
            let fls = FileListingService::new(device);
            let target = resolve_remote(&fls, &path)
                .with_context(|| format!("Resolving {}", path))?;
            let children = if no_cache {
                fls.get_children_sync(target).context("Listing directory")?
            } else {
                fls.get_children(target, true, None)
            };
            for id in children {
                print_entry(&fls, id);
            }
        }
        Commands::Stat { path } => {
            let mut service = open_sync(&device)?;
            match service.read_mode(&path).context("STAT request failed")? {
                Some(0) => println!("{}: no such remote object", path),
                Some(mode) => println!(
                    "{}: mode {:o} ({:?})",
                    path,
                    mode,
                    file_type_from_mode(mode)
                ),
                None => println!("{}: mode unknown", path),
            }
        }
        Commands::Pull { remote, local } => {
            let fls = FileListingService::new(device.clone());
            let mut service = open_sync(&device)?;
            let monitor = ConsoleProgressMonitor::new();

            match resolve_remote(&fls, &remote) {
                Ok(id) if fls.entry(id).map(|e| e.is_directory()).unwrap_or(false) => {
                    std::fs::create_dir_all(&local)
                        .with_context(|| format!("creating {}", local.display()))?;
                    service
                        .pull(&fls, &[id], &local, &monitor)
                        .context("Pull failed")?;
                }
                Ok(id) => {
                    let dest = file_destination(&local, &fls.entry(id).map(|e| e.name).unwrap_or_default());
                    service
                        .pull_entry(&fls, id, &dest, &monitor)
                        .context("Pull failed")?;
                }
                // not browsable through the listing tree: pull by path
                Err(_) => {
                    let name = remote.rsplit('/').next().unwrap_or(&remote);
                    let dest = file_destination(&local, name);
                    service
                        .pull_file(&remote, &dest, &monitor)
                        .context("Pull failed")?;
                }
            }
            println!("Pulled {} -> {}", remote, local.display());
        }
        Commands::Push { local, remote } => {
            let fls = FileListingService::new(device.clone());
            let mut service = open_sync(&device)?;
            let monitor = ConsoleProgressMonitor::new();

            let remote_dir = resolve_remote(&fls, &remote)
                .ok()
                .filter(|&id| fls.entry(id).map(|e| e.is_directory()).unwrap_or(false));
            match remote_dir {
                Some(id) => {
                    service
                        .push(&[local.clone()], &fls, id, &monitor)
                        .context("Push failed")?;
                }
                None => {
                    service
                        .push_file(&local, &remote, &monitor)
                        .context("Push failed")?;
                }
            }
            println!("Pushed {} -> {}", local.display(), remote);
        }
        Commands::Devices
        | Commands::SetDefaultSerial { .. }
        | Commands::ClearDefaultSerial => unreachable!("handled above"),
    }

    Ok(())
}

fn open_sync(device: &Device) -> Result<SyncService> {
    match SyncService::open(device).context("Opening sync service")? {
        Some(service) => Ok(service),
        None => bail!("adb refused the sync connection (is the device online?)"),
    }
}

/// Walks the listing tree from the root along `path`.
fn resolve_remote(fls: &FileListingService, path: &str) -> Result<EntryId> {
    let mut current = fls.root();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        fls.get_children(current, true, None);
        current = fls
            .find_child(current, segment)
            .with_context(|| format!("no such remote entry: {}", segment))?;
    }
    Ok(current)
}

/// An existing local directory receives the file under its remote name.
fn file_destination(local: &Path, name: &str) -> PathBuf {
    if local.is_dir() {
        local.join(name)
    } else {
        local.to_path_buf()
    }
}

fn print_entry(fls: &FileListingService, id: EntryId) {
    let Some(e) = fls.entry(id) else { return };
    let size = if e.size.is_empty() { "-".to_string() } else { e.size.clone() };
    if e.info.is_empty() {
        println!(
            "{} {:8} {:8} {:>9} {} {} {}",
            e.permissions, e.owner, e.group, size, e.date, e.time, e.name
        );
    } else {
        println!(
            "{} {:8} {:8} {:>9} {} {} {} {}",
            e.permissions, e.owner, e.group, size, e.date, e.time, e.name, e.info
        );
    }
}
