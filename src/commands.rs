//! Command handlers.
//!
//! Each command connects to the first camera found, runs one operation,
//! prints the outcome and disconnects.  Handlers are generic over the camera
//! backend.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::camera::{Camera, CaptureMode};
use crate::config::ClientConfig;
use crate::error::{CamError, Result};
use crate::shutdown::ShutdownFlag;
use crate::transfer::batch::copy_files;
use crate::transfer::{
    format_bytes, monitored_download, monitored_upload, require_success, MonitorSettings,
    TerminalSink, Verification,
};
use crate::util;

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Connect to the camera and print its details.
    Connect,
    /// Take a photo and download it (default: the configured download_dir).
    Photo { dir: Option<PathBuf> },
    /// Switch to video mode and start recording.
    RecordStart,
    /// Stop recording and download the resulting files.
    RecordStop { dir: Option<PathBuf> },
    /// Download every file on the camera, deleting each one once its copy is verified.
    CopyStorage { dir: Option<PathBuf> },
    /// List files on the camera.
    List,
    /// Download a single file.
    Download { remote: String, dir: Option<PathBuf> },
    /// Upload a local file to the camera storage.
    Upload { local: PathBuf, name: Option<String> },
    /// Delete a single file from the camera.
    Delete { remote: String },
    /// Print battery status.
    Battery,
    /// Print storage status.
    Storage,
    /// Power off the camera.
    Shutdown,
    /// Read commands from stdin until quit.
    Interactive,
}

/// One line typed in interactive mode, parsed with the same grammar as the CLI.
#[derive(Debug, Parser)]
#[command(name = "camctl", no_binary_name = true)]
struct ReplLine {
    #[command(subcommand)]
    command: Command,
}

const REPL_HELP: &str = "\
Commands:
  photo [dir]          take a photo and download it
  record-start         start recording
  record-stop [dir]    stop recording and download the files
  copy-storage [dir]   move every file off the camera
  list                 list files on the camera
  download <url> [dir] download one file
  upload <path> [name] upload one file
  delete <url>         delete one file
  battery              battery status
  storage              storage status
  shutdown             power off the camera and exit
  quit                 leave interactive mode";

pub struct Context<'a> {
    pub cfg:      &'a ClientConfig,
    pub shutdown: &'a ShutdownFlag,
}

impl Context<'_> {
    fn settings(&self) -> MonitorSettings {
        MonitorSettings::from(self.cfg)
    }

    fn dir_or_default<'p>(&'p self, dir: Option<&'p Path>) -> &'p Path {
        dir.unwrap_or(&self.cfg.download_dir)
    }
}

/// Connect, run `cmd`, disconnect.
pub async fn run<C: Camera>(mut cam: C, cmd: &Command, ctx: &Context<'_>) -> Result<()> {
    connect(&mut cam).await?;

    let result = match cmd {
        Command::Interactive => interactive(&mut cam, ctx).await,
        other => dispatch(&mut cam, other, ctx).await,
    };

    match cam.close().await {
        Ok(()) => println!("Disconnected from camera."),
        Err(e) => warn!("closing camera: {e}"),
    }
    result
}

async fn connect<C: Camera>(cam: &mut C) -> Result<()> {
    println!("Discovering cameras...");
    let devices = cam.discover().await?;
    if devices.is_empty() {
        eprintln!("Error: No camera found.");
        eprintln!("Please ensure:");
        eprintln!("  1. Camera is powered on");
        eprintln!("  2. Camera is connected via USB or WiFi");
        return Err(CamError::NoDevice);
    }

    println!("Found {} camera(s):", devices.len());
    for (i, dev) in devices.iter().enumerate() {
        println!(
            "  [{i}] {} (SN: {}, FW: {}) at {}",
            dev.name, dev.serial_number, dev.firmware_version, dev.address
        );
    }

    let selected = &devices[0];
    println!("\nConnecting to: {} (SN: {})...", selected.name, selected.serial_number);
    cam.open(selected).await?;

    match cam.sync_time(Local::now()).await {
        Ok(()) => debug!("camera clock synced"),
        Err(CamError::Unsupported(what)) => debug!("skipping clock sync: {what}"),
        Err(e) => warn!("could not sync camera clock: {e}"),
    }

    println!("Successfully connected to camera!");
    Ok(())
}

async fn dispatch<C: Camera>(cam: &mut C, cmd: &Command, ctx: &Context<'_>) -> Result<()> {
    match cmd {
        Command::Connect => {
            println!("Camera connected.");
            Ok(())
        }
        Command::Photo { dir } => take_photo(cam, ctx.dir_or_default(dir.as_deref()), ctx).await,
        Command::RecordStart => record_start(cam).await,
        Command::RecordStop { dir } => record_stop(cam, ctx.dir_or_default(dir.as_deref()), ctx).await,
        Command::CopyStorage { dir } => copy_storage(cam, ctx.dir_or_default(dir.as_deref()), ctx).await,
        Command::List => list(cam).await,
        Command::Download { remote, dir } => {
            download(cam, remote, ctx.dir_or_default(dir.as_deref()), ctx).await
        }
        Command::Upload { local, name } => upload(cam, local, name.as_deref(), ctx).await,
        Command::Delete { remote } => {
            cam.delete_file(remote).await?;
            println!("Deleted {remote}");
            Ok(())
        }
        Command::Battery => battery(cam).await,
        Command::Storage => storage(cam).await,
        Command::Shutdown => shutdown(cam).await,
        Command::Interactive => Err(CamError::Config("already in interactive mode".into())),
    }
}

// ── Transfers ─────────────────────────────────────────────────────────────────

/// Monitored download of one file, reported on the terminal.
async fn download_one<C: Camera>(
    cam:        &C,
    remote:     &str,
    local:      &Path,
    advertised: Option<u64>,
    ctx:        &Context<'_>,
) -> Result<Verification> {
    println!("Downloading {remote} to: {}", local.display());
    let sink = TerminalSink::new("Download progress");
    let verification = monitored_download(cam, remote, local, advertised, ctx.settings(), sink).await;

    match verification {
        Verification::Succeeded { actual_size } => {
            println!("Saved {} ({})", local.display(), format_bytes(actual_size));
        }
        Verification::SucceededWithWarning { actual_size, expected_size } => {
            println!(
                "Saved {} ({}, expected {})",
                local.display(),
                format_bytes(actual_size),
                format_bytes(expected_size)
            );
        }
        Verification::Failed { reason } => {
            eprintln!("Error: failed to download {remote}: {reason}");
            eprintln!("File on camera: {remote}");
        }
    }
    require_success(remote, verification)
}

async fn take_photo<C: Camera>(cam: &C, dir: &Path, ctx: &Context<'_>) -> Result<()> {
    println!("Setting photo mode...");
    if let Err(e) = cam.set_capture_mode(CaptureMode::Image).await {
        warn!("failed to set photo mode, continuing anyway: {e}");
    }

    println!("Taking photo...");
    let media = cam.take_photo().await?;
    let url = media
        .single_origin()
        .ok_or_else(|| CamError::Protocol("camera did not return a single photo URL".into()))?
        .to_string();
    println!("Photo captured! URL: {url}");

    if !dir.is_dir() {
        warn!("save directory does not exist: {}", dir.display());
        println!("Photo URL saved on camera: {url}");
        return Ok(());
    }

    let local = dir.join(util::local_file_name(&url, "photo", "jpg"));
    download_one(cam, &url, &local, None, ctx).await?;
    Ok(())
}

async fn record_start<C: Camera>(cam: &C) -> Result<()> {
    println!("Setting video mode...");
    if let Err(e) = cam.set_capture_mode(CaptureMode::Video).await {
        warn!("failed to set video mode, continuing anyway: {e}");
    }
    cam.start_recording().await?;
    println!("Recording started.");
    Ok(())
}

async fn record_stop<C: Camera>(cam: &C, dir: &Path, ctx: &Context<'_>) -> Result<()> {
    let media = cam.stop_recording().await?;
    if media.is_empty() {
        return Err(CamError::Protocol("camera did not return a recording URL".into()));
    }
    println!("Recording stopped.");
    for url in media.origins() {
        println!("  {url}");
    }

    if !dir.is_dir() {
        warn!("save directory does not exist: {}", dir.display());
        return Ok(());
    }

    let total = media.origins().len();
    let mut failed = 0;
    for url in media.origins() {
        let local = dir.join(util::local_file_name(url, "video", "insv"));
        if download_one(cam, url, &local, None, ctx).await.is_err() {
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(CamError::Batch { failed, total });
    }
    Ok(())
}

async fn copy_storage<C: Camera>(cam: &C, dir: &Path, ctx: &Context<'_>) -> Result<()> {
    let files = cam.list_files().await?;
    if files.is_empty() {
        println!("No files on camera.");
        return Ok(());
    }
    tokio::fs::create_dir_all(dir).await?;
    println!("Copying {} file(s) to {}", files.len(), dir.display());

    let summary = copy_files(cam, &files, dir, ctx.settings(), ctx.shutdown, |i, n, file| {
        let name = util::file_name_from_url(&file.url).unwrap_or_else(|| file.url.clone());
        TerminalSink::new(format!("[{i}/{n}] {name}"))
    })
    .await;

    println!(
        "Copied {} of {} file(s), {} failed{}",
        summary.success_count,
        summary.total,
        summary.fail_count,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    if !summary.is_success() {
        return Err(CamError::Batch {
            failed: summary.total - summary.success_count,
            total:  summary.total,
        });
    }
    Ok(())
}

async fn download<C: Camera>(cam: &C, remote: &str, dir: &Path, ctx: &Context<'_>) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let advertised = match cam.remote_size(remote).await {
        Ok(size) => size,
        Err(e) => {
            debug!("no advertised size for {remote}: {e}");
            None
        }
    };
    let local = dir.join(util::local_file_name(remote, "file", "bin"));
    download_one(cam, remote, &local, advertised, ctx).await?;
    Ok(())
}

async fn upload<C: Camera>(cam: &C, local: &Path, name: Option<&str>, ctx: &Context<'_>) -> Result<()> {
    if !local.is_file() {
        return Err(CamError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", local.display()),
        )));
    }
    let name = match name {
        Some(n) => n.to_string(),
        None => local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CamError::Config(format!("cannot derive a name from {}", local.display())))?,
    };

    println!("Uploading {} as {name}", local.display());
    let sink = TerminalSink::new("Upload progress");
    let (remote, verification) = monitored_upload(cam, local, &name, ctx.settings(), sink).await;
    let verification = require_success(&local.display().to_string(), verification)?;

    let remote = remote.unwrap_or(name);
    match verification {
        Verification::SucceededWithWarning { actual_size, expected_size } => println!(
            "Uploaded {} as {remote} ({} on camera, expected {})",
            local.display(),
            format_bytes(actual_size),
            format_bytes(expected_size)
        ),
        _ => println!("Uploaded {} as {remote}", local.display()),
    }
    Ok(())
}

// ── Status ────────────────────────────────────────────────────────────────────

async fn list<C: Camera>(cam: &C) -> Result<()> {
    let files = cam.list_files().await?;
    for file in &files {
        let size = file.size.map(format_bytes).unwrap_or_else(|| "?".to_string());
        println!("{size:>12}  {}", file.url);
    }
    println!("{} file(s)", files.len());
    Ok(())
}

async fn battery<C: Camera>(cam: &C) -> Result<()> {
    let status = cam.battery_status().await?;
    println!("Battery Status:");
    println!("  Power Type: {}", status.power_type);
    println!("  Battery Level: {}%", status.battery_level);
    if let Some(state) = &status.state {
        println!("  State: {state}");
    }
    Ok(())
}

async fn storage<C: Camera>(cam: &C) -> Result<()> {
    let status = cam.storage_status().await?;
    println!("Storage Status:");
    println!("  Free Space: {}", format_bytes(status.free_space));
    println!("  Total Space: {}", format_bytes(status.total_space));
    println!("  State: {}", status.state);
    Ok(())
}

async fn shutdown<C: Camera>(cam: &mut C) -> Result<()> {
    println!("Shutting down camera...");
    cam.shutdown().await?;
    println!("Camera shutdown command sent successfully.");
    Ok(())
}

// ── Interactive mode ──────────────────────────────────────────────────────────

async fn interactive<C: Camera>(cam: &mut C, ctx: &Context<'_>) -> Result<()> {
    println!("\n=== Interactive Mode ===");
    println!("Type 'help' for commands, 'quit' to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = ctx.shutdown.wait() => {
                println!();
                break;
            }
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => continue,
            "quit" | "exit" => break,
            "help" => {
                println!("{REPL_HELP}");
                continue;
            }
            _ => {}
        }

        let cmd = match ReplLine::try_parse_from(line.split_whitespace()) {
            Ok(parsed) => parsed.command,
            Err(e) => {
                println!("{e}");
                println!("Unknown command. Type 'help' for a list.");
                continue;
            }
        };

        match cmd {
            Command::Interactive | Command::Connect => println!("Already connected."),
            Command::Shutdown => match shutdown(cam).await {
                Ok(()) => break,
                Err(e) => eprintln!("Error: {e}"),
            },
            other => {
                if let Err(e) = dispatch(cam, &other, ctx).await {
                    eprintln!("Error: {e}");
                }
            }
        }

        if ctx.shutdown.is_set() {
            info!("leaving interactive mode");
            break;
        }
        if !cam.is_connected().await {
            println!("Camera disconnected. Exiting...");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> std::result::Result<Command, clap::Error> {
        ReplLine::try_parse_from(line.split_whitespace()).map(|r| r.command)
    }

    #[test]
    fn repl_lines_use_cli_grammar() {
        assert!(matches!(parse("photo").unwrap(), Command::Photo { dir: None }));
        match parse("photo ./shots").unwrap() {
            Command::Photo { dir } => assert_eq!(dir, Some(PathBuf::from("./shots"))),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse("copy-storage /mnt/backup").unwrap(), Command::CopyStorage { .. }));
        assert!(matches!(parse("record-stop").unwrap(), Command::RecordStop { dir: None }));
        assert!(matches!(parse("battery").unwrap(), Command::Battery));
    }

    #[test]
    fn repl_rejects_unknown() {
        assert!(parse("selfie").is_err());
        assert!(parse("delete").is_err());
    }

    #[test]
    fn default_dir_comes_from_config() {
        let cfg = ClientConfig { download_dir: PathBuf::from("/data/cam"), ..ClientConfig::default() };
        let flag = ShutdownFlag::new();
        let ctx = Context { cfg: &cfg, shutdown: &flag };
        assert_eq!(ctx.dir_or_default(None), Path::new("/data/cam"));
        assert_eq!(ctx.dir_or_default(Some(Path::new("x"))), Path::new("x"));
    }
}
