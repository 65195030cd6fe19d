//! Camera storage mounted as a local directory (USB mass-storage mode).
//!
//! In this mode the camera is just a disk: listing, transfers and deletes work,
//! capture and power control do not.  Remote identifiers are paths relative to
//! the mount point, with `/` separators.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local};
use log::debug;
use nix::sys::statvfs::statvfs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::camera::{
    BatteryStatus, Camera, CaptureMode, DeviceInfo, MediaUrl, RemoteFile, StorageStatus,
};
use crate::error::{CamError, Result};
use crate::transfer::TransferProgress;

const CHUNK_SIZE: usize = 256 * 1024;
const MEDIA_DIR: &str = "DCIM";

pub struct StorageCamera {
    root:   PathBuf,
    opened: bool,
}

impl StorageCamera {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), opened: false }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened { Ok(()) } else { Err(CamError::NotConnected) }
    }

    /// Map a remote identifier to a path under the mount point.
    fn resolve(&self, remote: &str) -> Result<PathBuf> {
        let rel = Path::new(remote.trim_start_matches('/'));
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || remote.trim_start_matches('/').is_empty() {
            return Err(CamError::Protocol(format!("invalid storage path {remote:?}")));
        }
        Ok(self.root.join(rel))
    }

    /// Directory scanned for media: `DCIM` when present, otherwise the root.
    async fn media_root(&self) -> PathBuf {
        let dcim = self.root.join(MEDIA_DIR);
        match tokio::fs::metadata(&dcim).await {
            Ok(meta) if meta.is_dir() => dcim,
            _ => self.root.clone(),
        }
    }

    fn remote_id(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

/// Copy `src` to `dst` in chunks, reporting `(copied, total)` after each one.
async fn copy_with_progress(src: &Path, dst: &Path, progress: &mut dyn TransferProgress) -> Result<u64> {
    let mut input = tokio::fs::File::open(src).await?;
    let total = input.metadata().await?.len();
    let mut output = tokio::fs::File::create(dst).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied: u64 = 0;
    progress.on_progress(copied, total);
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).await?;
        copied += n as u64;
        progress.on_progress(copied, total);
    }
    output.flush().await?;
    Ok(copied)
}

impl Camera for StorageCamera {
    async fn discover(&self) -> Result<Vec<DeviceInfo>> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(vec![DeviceInfo {
                name:             "Mass storage".to_string(),
                serial_number:    String::new(),
                firmware_version: String::new(),
                address:          self.root.display().to_string(),
            }]),
            _ => {
                debug!("storage root {} is not a directory", self.root.display());
                Ok(Vec::new())
            }
        }
    }

    async fn open(&mut self, _device: &DeviceInfo) -> Result<()> {
        if !tokio::fs::metadata(&self.root).await?.is_dir() {
            return Err(CamError::Protocol(format!("{} is not a directory", self.root.display())));
        }
        self.opened = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.opened && self.root.is_dir()
    }

    async fn sync_time(&self, _now: DateTime<Local>) -> Result<()> {
        Err(CamError::Unsupported("clock sync on mounted storage"))
    }

    async fn set_capture_mode(&self, _mode: CaptureMode) -> Result<()> {
        Err(CamError::Unsupported("capture on mounted storage"))
    }

    async fn take_photo(&self) -> Result<MediaUrl> {
        Err(CamError::Unsupported("capture on mounted storage"))
    }

    async fn start_recording(&self) -> Result<()> {
        Err(CamError::Unsupported("capture on mounted storage"))
    }

    async fn stop_recording(&self) -> Result<MediaUrl> {
        Err(CamError::Unsupported("capture on mounted storage"))
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        self.ensure_open()?;
        let mut files = Vec::new();
        let mut pending = vec![self.media_root().await];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Some(url) = self.remote_id(&path) {
                        let size = entry.metadata().await.ok().map(|m| m.len());
                        files.push(RemoteFile { url, size });
                    }
                }
            }
        }

        files.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(files)
    }

    async fn download(&self, remote: &str, local: &Path, progress: &mut dyn TransferProgress) -> Result<()> {
        self.ensure_open()?;
        let src = self.resolve(remote)?;
        copy_with_progress(&src, local, progress).await?;
        Ok(())
    }

    async fn upload(&self, local: &Path, remote_name: &str, progress: &mut dyn TransferProgress) -> Result<String> {
        self.ensure_open()?;
        let dst = self.resolve(remote_name)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        copy_with_progress(local, &dst, progress).await?;
        Ok(remote_name.trim_start_matches('/').to_string())
    }

    async fn remote_size(&self, remote: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        match tokio::fs::metadata(self.resolve(remote)?).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, remote: &str) -> Result<()> {
        self.ensure_open()?;
        tokio::fs::remove_file(self.resolve(remote)?).await?;
        Ok(())
    }

    async fn battery_status(&self) -> Result<BatteryStatus> {
        Err(CamError::Unsupported("battery status on mounted storage"))
    }

    async fn storage_status(&self) -> Result<StorageStatus> {
        self.ensure_open()?;
        let root = self.root.clone();
        let stat = tokio::task::spawn_blocking(move || statvfs(&root))
            .await
            .map_err(|e| CamError::Protocol(format!("statvfs task: {e}")))??;
        let frag = stat.fragment_size() as u64;
        Ok(StorageStatus {
            free_space:  stat.blocks_available() as u64 * frag,
            total_space: stat.blocks() as u64 * frag,
            state:       "mounted".to_string(),
        })
    }

    async fn shutdown(&mut self) -> Result<()> {
        Err(CamError::Unsupported("power off on mounted storage"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace(Vec<(u64, u64)>);

    impl TransferProgress for Trace {
        fn on_progress(&mut self, current: u64, total: u64) {
            self.0.push((current, total));
        }
    }

    async fn opened(root: &Path) -> StorageCamera {
        let mut cam = StorageCamera::new(root);
        let devices = cam.discover().await.unwrap();
        assert_eq!(devices.len(), 1);
        cam.open(&devices[0]).await.unwrap();
        cam
    }

    #[tokio::test]
    async fn lists_media_under_dcim() {
        let dir = tempfile::tempdir().unwrap();
        let cam_dir = dir.path().join("DCIM/Camera01");
        std::fs::create_dir_all(&cam_dir).unwrap();
        std::fs::write(cam_dir.join("VID_2.insv"), [1u8; 20]).unwrap();
        std::fs::write(cam_dir.join("IMG_1.insp"), [1u8; 10]).unwrap();
        std::fs::write(dir.path().join("firmware.bin"), [0u8; 4]).unwrap();

        let cam = opened(dir.path()).await;
        let files = cam.list_files().await.unwrap();

        assert_eq!(
            files,
            vec![
                RemoteFile { url: "DCIM/Camera01/IMG_1.insp".into(), size: Some(10) },
                RemoteFile { url: "DCIM/Camera01/VID_2.insv".into(), size: Some(20) },
            ]
        );
    }

    #[tokio::test]
    async fn download_reports_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let len = CHUNK_SIZE + 100;
        std::fs::write(dir.path().join("big.insv"), vec![9u8; len]).unwrap();
        let out = tempfile::tempdir().unwrap();
        let local = out.path().join("big.insv");

        let cam = opened(dir.path()).await;
        let mut trace = Trace::default();
        cam.download("big.insv", &local, &mut trace).await.unwrap();

        let total = len as u64;
        assert_eq!(trace.0.first(), Some(&(0, total)));
        assert_eq!(trace.0.last(), Some(&(total, total)));
        assert!(trace.0.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(std::fs::metadata(&local).unwrap().len(), total);
    }

    #[tokio::test]
    async fn upload_then_stat_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("fw.bin");
        std::fs::write(&src, [3u8; 64]).unwrap();

        let cam = opened(dir.path()).await;
        let mut trace = Trace::default();
        let id = cam.upload(&src, "/Insta360X4FW.bin", &mut trace).await.unwrap();

        assert_eq!(id, "Insta360X4FW.bin");
        assert_eq!(trace.0.last(), Some(&(64, 64)));
        assert_eq!(cam.remote_size(&id).await.unwrap(), Some(64));

        cam.delete_file(&id).await.unwrap();
        assert_eq!(cam.remote_size(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn paths_cannot_escape_the_mount() {
        let dir = tempfile::tempdir().unwrap();
        let cam = opened(dir.path()).await;
        assert!(cam.delete_file("../outside.txt").await.is_err());
        assert!(cam.remote_size("DCIM/../../etc/passwd").await.is_err());
        assert!(cam.remote_size("/").await.is_err());
    }

    #[tokio::test]
    async fn missing_root_is_not_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let cam = StorageCamera::new(dir.path().join("not-mounted"));
        assert!(cam.discover().await.unwrap().is_empty());
        assert!(matches!(cam.list_files().await, Err(CamError::NotConnected)));
    }

    #[tokio::test]
    async fn open_rejects_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-mount");
        std::fs::write(&file, b"x").unwrap();
        let mut cam = StorageCamera::new(&file);
        assert!(cam.open(&DeviceInfo::default()).await.is_err());
        assert!(!cam.is_connected().await);
    }

    #[tokio::test]
    async fn storage_space_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cam = opened(dir.path()).await;
        let status = cam.storage_status().await.unwrap();
        assert!(status.total_space >= status.free_space);
        assert!(status.total_space > 0);
    }
}
