//! Progress tracking and post-transfer verification for camera file transfers.
//!
//! A [`TransferMonitor`] is handed to a camera download/upload call as its
//! [`TransferProgress`] callback.  It turns the raw `(current, total)` stream
//! into rate-limited progress lines, notices when the byte count stops moving,
//! and once the call returns checks the transferred artifact independently of
//! the success flag the camera reported.

pub mod batch;

use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::camera::Camera;
use crate::config::ClientConfig;
use crate::error::CamError;

// ── Callback interface ────────────────────────────────────────────────────────

/// Receives progress from a running transfer.
///
/// Both directions report `(bytes_done, bytes_total)`; `total == 0` means the
/// size is unknown.
pub trait TransferProgress {
    fn on_progress(&mut self, current: u64, total: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    fn past_tense(self) -> &'static str {
        match self {
            Direction::Download => "downloaded",
            Direction::Upload   => "uploaded",
        }
    }
}

// ── Formatting ────────────────────────────────────────────────────────────────

/// Format a byte count with two decimals above one kilobyte.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Whole percent of `total`; reaching or passing `total` is exactly 100.
fn percent_of(current: u64, total: u64) -> u8 {
    if current >= total {
        return 100;
    }
    (u128::from(current) * 100 / u128::from(total)) as u8
}

// ── Output sink ───────────────────────────────────────────────────────────────

/// Where a monitor sends what it has to say.
pub trait ProgressSink {
    /// A new progress line, e.g. `42% (4.20 MB / 10.00 MB)`.
    fn display(&mut self, line: &str);
    /// The byte count has not moved for `idle`.
    fn stalled(&mut self, bytes: u64, idle: Duration);
    /// The transfer call has returned.
    fn finish(&mut self) {}
}

/// Rewrites a single terminal line on stdout.
pub struct TerminalSink {
    label:     String,
    line_open: bool,
}

impl TerminalSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), line_open: false }
    }

    fn close_line(&mut self) {
        if self.line_open {
            println!();
            self.line_open = false;
        }
    }
}

impl ProgressSink for TerminalSink {
    fn display(&mut self, line: &str) {
        let mut out = io::stdout().lock();
        let _ = write!(out, "\r{}: {line}    ", self.label);
        let _ = out.flush();
        self.line_open = true;
    }

    fn stalled(&mut self, bytes: u64, idle: Duration) {
        self.close_line();
        warn!(
            "{}: no progress for {}s (stuck at {})",
            self.label,
            idle.as_secs(),
            format_bytes(bytes)
        );
    }

    fn finish(&mut self) {
        self.close_line();
    }
}

// ── Monitor ───────────────────────────────────────────────────────────────────

/// Tunables for progress display and stall detection.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Time without byte movement before a stall warning.
    pub stall_timeout: Duration,
    /// From this percent of the total on, every byte change is displayed.
    pub tail_percent:  u8,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { stall_timeout: Duration::from_secs(30), tail_percent: 97 }
    }
}

impl From<&ClientConfig> for MonitorSettings {
    fn from(cfg: &ClientConfig) -> Self {
        Self { stall_timeout: cfg.stall_timeout(), tail_percent: cfg.tail_percent }
    }
}

/// Mutable state of one transfer.  Discarded after [`TransferMonitor::finalize`].
#[derive(Debug, Clone)]
pub struct TransferState {
    pub last_reported_percent:  Option<u8>,
    pub last_bytes_transferred: u64,
    pub last_event_time:        Instant,
    /// Last positive total reported by the transfer.
    pub total_bytes:            Option<u64>,
    pub stalled_warned:         bool,
    displayed:                  bool,
}

impl TransferState {
    fn new(now: Instant) -> Self {
        Self {
            last_reported_percent:  None,
            last_bytes_transferred: 0,
            last_event_time:        now,
            total_bytes:            None,
            stalled_warned:         false,
            displayed:              false,
        }
    }
}

pub struct TransferMonitor<S> {
    direction: Direction,
    settings:  MonitorSettings,
    state:     TransferState,
    sink:      S,
}

impl<S: ProgressSink> TransferMonitor<S> {
    pub fn new(direction: Direction, settings: MonitorSettings, sink: S) -> Self {
        Self::started_at(direction, settings, sink, Instant::now())
    }

    /// Like [`new`](Self::new) with an explicit start time.
    pub fn started_at(direction: Direction, settings: MonitorSettings, sink: S, now: Instant) -> Self {
        Self { direction, settings, state: TransferState::new(now), sink }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn in_tail(&self, current: u64, total: u64) -> bool {
        u128::from(current) * 100 >= u128::from(total) * u128::from(self.settings.tail_percent)
    }

    /// Process one progress event observed at `now`.
    pub fn observe(&mut self, current: u64, total: u64, now: Instant) {
        let known = total > 0;
        if known {
            self.state.total_bytes = Some(total);
        }
        let progressed = current != self.state.last_bytes_transferred;

        let percent = known.then(|| percent_of(current, total));
        let emit = match percent {
            Some(p) => {
                self.state.last_reported_percent != Some(p)
                    || (progressed && self.in_tail(current, total))
            }
            None => !self.state.displayed || progressed,
        };

        if emit {
            let line = match percent {
                Some(p) => format!("{p}% ({} / {})", format_bytes(current), format_bytes(total)),
                None    => format!("{} {}", format_bytes(current), self.direction.past_tense()),
            };
            self.sink.display(&line);
            self.state.displayed = true;
            self.state.last_reported_percent = percent;
            self.state.last_bytes_transferred = current;
            self.state.last_event_time = now;
        }

        if progressed {
            self.state.last_bytes_transferred = current;
            self.state.last_event_time = now;
            self.state.stalled_warned = false;
            return;
        }

        // Without a total there is nothing left to wait for, so no stall.
        let unfinished = known && current < total;
        let idle = now.saturating_duration_since(self.state.last_event_time);
        if unfinished && !self.state.stalled_warned && idle > self.settings.stall_timeout {
            self.state.stalled_warned = true;
            self.sink.stalled(current, idle);
        }
    }

    /// Verify the local artifact of a finished download.
    ///
    /// `advertised` is the size the camera announced before the transfer and
    /// is only used when the progress stream never carried a total.
    pub async fn finalize(mut self, succeeded: bool, local: &Path, advertised: Option<u64>) -> Verification {
        self.sink.finish();
        let expected = self.state.total_bytes.or(advertised.filter(|&n| n > 0));
        verify_local(succeeded, local, expected).await
    }

    /// Verify a finished upload against the size the camera reports for it.
    pub fn finalize_remote(mut self, succeeded: bool, remote_size: Option<u64>, advertised: Option<u64>) -> Verification {
        self.sink.finish();
        let expected = self.state.total_bytes.or(advertised.filter(|&n| n > 0));
        verify(succeeded, remote_size, expected)
    }
}

impl<S: ProgressSink> TransferProgress for TransferMonitor<S> {
    fn on_progress(&mut self, current: u64, total: u64) {
        self.observe(current, total, Instant::now());
    }
}

// ── Verification ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The camera call itself returned an error.
    TransferFailed,
    /// Reported success but the artifact does not exist.
    MissingAfterSuccess,
    /// Reported success but the artifact has no content.
    EmptyFile,
}

impl FailureReason {
    /// True when the camera claimed success but the artifact says otherwise.
    pub fn is_integrity(self) -> bool {
        !matches!(self, FailureReason::TransferFailed)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailureReason::TransferFailed      => "transfer reported failure",
            FailureReason::MissingAfterSuccess => "missing after success",
            FailureReason::EmptyFile           => "empty file",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Succeeded { actual_size: u64 },
    /// Accepted, but the size differs from what the transfer announced.
    SucceededWithWarning { actual_size: u64, expected_size: u64 },
    Failed { reason: FailureReason },
}

impl Verification {
    pub fn is_success(&self) -> bool {
        !matches!(self, Verification::Failed { .. })
    }
}

/// Check a transfer outcome against the artifact's size (`None` = absent).
pub fn verify(succeeded: bool, artifact_size: Option<u64>, expected: Option<u64>) -> Verification {
    if !succeeded {
        return Verification::Failed { reason: FailureReason::TransferFailed };
    }
    match (artifact_size, expected) {
        (None, _) => Verification::Failed { reason: FailureReason::MissingAfterSuccess },
        (Some(0), _) => Verification::Failed { reason: FailureReason::EmptyFile },
        (Some(actual_size), Some(expected_size)) if actual_size != expected_size => {
            Verification::SucceededWithWarning { actual_size, expected_size }
        }
        (Some(actual_size), _) => Verification::Succeeded { actual_size },
    }
}

/// [`verify`] against a file on the local filesystem.
pub async fn verify_local(succeeded: bool, path: &Path, expected: Option<u64>) -> Verification {
    let size = if succeeded {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => None,
            Err(e) => {
                debug!("stat {}: {e}", path.display());
                None
            }
        }
    } else {
        None
    };
    verify(succeeded, size, expected)
}

// ── Monitored transfers ───────────────────────────────────────────────────────

/// Download `remote` to `local` under a monitor and verify the result.
pub async fn monitored_download<C, S>(
    cam:        &C,
    remote:     &str,
    local:      &Path,
    advertised: Option<u64>,
    settings:   MonitorSettings,
    sink:       S,
) -> Verification
where
    C: Camera,
    S: ProgressSink,
{
    let mut monitor = TransferMonitor::new(Direction::Download, settings, sink);
    let result = cam.download(remote, local, &mut monitor).await;
    if let Err(e) = &result {
        monitor.sink.finish();
        warn!("download of {remote} failed: {e}");
    }
    let verification = monitor.finalize(result.is_ok(), local, advertised).await;
    log_verification(remote, &verification);
    verification
}

/// Upload `local` as `remote_name` under a monitor and verify the remote copy.
///
/// Returns the camera's identifier for the uploaded file alongside the outcome.
pub async fn monitored_upload<C, S>(
    cam:         &C,
    local:       &Path,
    remote_name: &str,
    settings:    MonitorSettings,
    sink:        S,
) -> (Option<String>, Verification)
where
    C: Camera,
    S: ProgressSink,
{
    let advertised = tokio::fs::metadata(local).await.ok().map(|m| m.len());
    let mut monitor = TransferMonitor::new(Direction::Upload, settings, sink);
    let remote = match cam.upload(local, remote_name, &mut monitor).await {
        Ok(remote) => Some(remote),
        Err(e) => {
            monitor.sink.finish();
            warn!("upload of {} failed: {e}", local.display());
            None
        }
    };

    let remote_size = match &remote {
        Some(id) => match cam.remote_size(id).await {
            Ok(size) => size,
            Err(e) => {
                warn!("cannot stat uploaded file {id}: {e}");
                None
            }
        },
        None => None,
    };
    let verification = monitor.finalize_remote(remote.is_some(), remote_size, advertised);
    log_verification(remote_name, &verification);
    (remote, verification)
}

fn log_verification(what: &str, v: &Verification) {
    match v {
        Verification::Succeeded { actual_size } => {
            debug!("{what}: verified {actual_size} bytes");
        }
        Verification::SucceededWithWarning { actual_size, expected_size } => {
            warn!(
                "{what}: size mismatch, got {} but the transfer announced {}",
                format_bytes(*actual_size),
                format_bytes(*expected_size)
            );
        }
        Verification::Failed { reason } if reason.is_integrity() => {
            warn!("{what}: camera reported success but the file is {reason}");
        }
        Verification::Failed { .. } => {}
    }
}

/// Turn a failed verification into an error for the command layer.
pub fn require_success(what: &str, v: Verification) -> Result<Verification, CamError> {
    match v {
        Verification::Failed { reason } => Err(CamError::Transfer {
            file:   what.to_string(),
            reason: reason.to_string(),
        }),
        ok => Ok(ok),
    }
}
