//! Camera collaborators.
//!
//! Every backend exposes the same small RPC-style surface: discover, open,
//! capture, list, transfer, delete, status.  Command handlers are generic over
//! [`Camera`] and never know which transport is underneath.

pub mod osc;
pub mod storage;

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Local};

use crate::error::Result;
use crate::transfer::TransferProgress;

/// A camera found during discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name:             String,
    pub serial_number:    String,
    pub firmware_version: String,
    /// Where the backend reaches it (host or mount point).
    pub address:          String,
}

/// Origin URL(s) of a captured photo or recording.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaUrl {
    urls: Vec<String>,
}

impl MediaUrl {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls: urls.into_iter().filter(|u| !u.is_empty()).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// The URL when exactly one origin file was produced.
    pub fn single_origin(&self) -> Option<&str> {
        match self.urls.as_slice() {
            [one] => Some(one.as_str()),
            _ => None,
        }
    }

    pub fn origins(&self) -> &[String] {
        &self.urls
    }
}

/// A file on the camera storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Backend-specific identifier, passed back to `download`/`delete_file`.
    pub url:  String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerType {
    Battery,
    Adapter,
}

impl fmt::Display for PowerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerType::Battery => "Battery",
            PowerType::Adapter => "Adapter",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatteryStatus {
    pub power_type:    PowerType,
    /// 0-100.
    pub battery_level: u8,
    /// Raw charging state as reported by the camera, if any.
    pub state:         Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStatus {
    pub free_space:  u64,
    pub total_space: u64,
    pub state:       String,
}

/// The operations a camera backend provides.
///
/// `download` and `upload` call `progress` inline, from inside the call, as
/// bytes move; both report `(bytes_done, bytes_total)`.
pub trait Camera {
    async fn discover(&self) -> Result<Vec<DeviceInfo>>;
    async fn open(&mut self, device: &DeviceInfo) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn is_connected(&self) -> bool;
    /// Set the camera clock to the host's local time.
    async fn sync_time(&self, now: DateTime<Local>) -> Result<()>;

    async fn set_capture_mode(&self, mode: CaptureMode) -> Result<()>;
    async fn take_photo(&self) -> Result<MediaUrl>;
    async fn start_recording(&self) -> Result<()>;
    async fn stop_recording(&self) -> Result<MediaUrl>;

    async fn list_files(&self) -> Result<Vec<RemoteFile>>;
    async fn download(&self, remote: &str, local: &Path, progress: &mut dyn TransferProgress) -> Result<()>;
    /// Returns the identifier of the uploaded file.
    async fn upload(&self, local: &Path, remote_name: &str, progress: &mut dyn TransferProgress) -> Result<String>;
    /// Size of a remote file, `None` when it does not exist.
    async fn remote_size(&self, remote: &str) -> Result<Option<u64>>;
    async fn delete_file(&self, remote: &str) -> Result<()>;

    async fn battery_status(&self) -> Result<BatteryStatus>;
    async fn storage_status(&self) -> Result<StorageStatus>;
    async fn shutdown(&mut self) -> Result<()>;
}
