//! Copy every file off the camera storage, deleting each remote original only
//! after its local copy has been verified.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::camera::{Camera, RemoteFile};
use crate::shutdown::ShutdownFlag;
use crate::transfer::{monitored_download, MonitorSettings, ProgressSink};
use crate::util;

/// Aggregate outcome of a batch copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub success_count: usize,
    pub fail_count:    usize,
    /// Number of files found on the camera.
    pub total:         usize,
    /// Stopped early on a shutdown request; unattempted files are in neither count.
    pub interrupted:   bool,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.fail_count == 0 && !self.interrupted
    }
}

/// Pick a path in `dir` for `file` that does not exist yet and was not used
/// earlier in this batch.  Same-named files from different camera folders get
/// `_1`, `_2`, ... suffixes instead of overwriting each other.
async fn claim_local_path(
    dir:     &Path,
    file:    &RemoteFile,
    claimed: &mut HashSet<PathBuf>,
) -> std::io::Result<PathBuf> {
    let name = util::local_file_name(&file.url, "file", "bin");
    let mut n = 0;
    loop {
        let path = dir.join(util::numbered_name(&name, n));
        if !claimed.contains(&path) && !tokio::fs::try_exists(&path).await? {
            claimed.insert(path.clone());
            return Ok(path);
        }
        n += 1;
    }
}

/// Download `files` one at a time into `dir`.
///
/// A failed file is left on the camera and the batch moves on.  Existing local
/// files are never overwritten.  The shutdown flag is checked between files,
/// never in the middle of one.
pub async fn copy_files<C, S, F>(
    cam:       &C,
    files:     &[RemoteFile],
    dir:       &Path,
    settings:  MonitorSettings,
    shutdown:  &ShutdownFlag,
    mut sink_for: F,
) -> BatchSummary
where
    C: Camera,
    S: ProgressSink,
    F: FnMut(usize, usize, &RemoteFile) -> S,
{
    let mut summary = BatchSummary { total: files.len(), ..BatchSummary::default() };
    let mut claimed = HashSet::new();

    for (idx, file) in files.iter().enumerate() {
        if shutdown.is_set() {
            warn!("shutdown requested, stopping after {idx} of {} files", files.len());
            summary.interrupted = true;
            break;
        }

        let local = match claim_local_path(dir, file, &mut claimed).await {
            Ok(path) => path,
            Err(e) => {
                warn!("{}: cannot choose a local path in {}: {e}; left on camera", file.url, dir.display());
                summary.fail_count += 1;
                continue;
            }
        };
        info!("[{}/{}] {} -> {}", idx + 1, files.len(), file.url, local.display());

        let sink = sink_for(idx + 1, files.len(), file);
        let verification = monitored_download(cam, &file.url, &local, file.size, settings, sink).await;

        if !verification.is_success() {
            warn!("{}: not verified, left on camera", file.url);
            summary.fail_count += 1;
            continue;
        }
        summary.success_count += 1;
        if let Err(e) = cam.delete_file(&file.url).await {
            warn!("{}: copied but could not delete from camera: {e}", file.url);
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::camera::{BatteryStatus, CaptureMode, DeviceInfo, MediaUrl, StorageStatus};
    use crate::error::{CamError, Result};
    use crate::transfer::TransferProgress;

    /// In-memory camera storage.  Files listed in `broken` fail mid-download.
    struct FakeCamera {
        files:  Mutex<BTreeMap<String, Vec<u8>>>,
        broken: Vec<String>,
        /// Files whose download "succeeds" without writing anything.
        silent: Vec<String>,
    }

    impl FakeCamera {
        fn new(files: &[(&str, usize)]) -> Self {
            let files = files
                .iter()
                .map(|(name, len)| (name.to_string(), vec![0xAB; *len]))
                .collect();
            Self { files: Mutex::new(files), broken: Vec::new(), silent: Vec::new() }
        }

        fn remaining(&self) -> Vec<String> {
            self.files.lock().unwrap().keys().cloned().collect()
        }
    }

    impl Camera for FakeCamera {
        async fn discover(&self) -> Result<Vec<DeviceInfo>> {
            Ok(Vec::new())
        }
        async fn open(&mut self, _device: &DeviceInfo) -> Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn sync_time(&self, _now: chrono::DateTime<chrono::Local>) -> Result<()> {
            Ok(())
        }
        async fn set_capture_mode(&self, _mode: CaptureMode) -> Result<()> {
            Ok(())
        }
        async fn take_photo(&self) -> Result<MediaUrl> {
            Err(CamError::Unsupported("take_photo"))
        }
        async fn start_recording(&self) -> Result<()> {
            Err(CamError::Unsupported("start_recording"))
        }
        async fn stop_recording(&self) -> Result<MediaUrl> {
            Err(CamError::Unsupported("stop_recording"))
        }
        async fn list_files(&self) -> Result<Vec<RemoteFile>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .map(|(url, data)| RemoteFile { url: url.clone(), size: Some(data.len() as u64) })
                .collect())
        }
        async fn download(&self, remote: &str, local: &Path, progress: &mut dyn TransferProgress) -> Result<()> {
            let data = self
                .files
                .lock()
                .unwrap()
                .get(remote)
                .cloned()
                .ok_or_else(|| CamError::Protocol(format!("no such file {remote}")))?;
            let total = data.len() as u64;
            progress.on_progress(0, total);
            if self.broken.iter().any(|b| b == remote) {
                progress.on_progress(total / 2, total);
                return Err(CamError::Protocol("connection reset".into()));
            }
            if self.silent.iter().any(|b| b == remote) {
                progress.on_progress(total, total);
                return Ok(());
            }
            std::fs::write(local, &data)?;
            progress.on_progress(total, total);
            Ok(())
        }
        async fn upload(&self, _local: &Path, _name: &str, _progress: &mut dyn TransferProgress) -> Result<String> {
            Err(CamError::Unsupported("upload"))
        }
        async fn remote_size(&self, remote: &str) -> Result<Option<u64>> {
            Ok(self.files.lock().unwrap().get(remote).map(|d| d.len() as u64))
        }
        async fn delete_file(&self, remote: &str) -> Result<()> {
            self.files.lock().unwrap().remove(remote);
            Ok(())
        }
        async fn battery_status(&self) -> Result<BatteryStatus> {
            Err(CamError::Unsupported("battery_status"))
        }
        async fn storage_status(&self) -> Result<StorageStatus> {
            Err(CamError::Unsupported("storage_status"))
        }
        async fn shutdown(&mut self) -> Result<()> {
            Err(CamError::Unsupported("shutdown"))
        }
    }

    #[derive(Default)]
    struct Quiet;

    impl ProgressSink for Quiet {
        fn display(&mut self, _line: &str) {}
        fn stalled(&mut self, _bytes: u64, _idle: Duration) {}
    }

    async fn run(cam: &FakeCamera, dir: &Path, shutdown: &ShutdownFlag) -> BatchSummary {
        let files = cam.list_files().await.unwrap();
        copy_files(cam, &files, dir, MonitorSettings::default(), shutdown, |_, _, _| Quiet).await
    }

    #[tokio::test]
    async fn failed_file_stays_on_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = FakeCamera::new(&[("DCIM/a.insv", 100), ("DCIM/b.insv", 200), ("DCIM/c.insp", 50)]);
        cam.broken.push("DCIM/b.insv".into());

        let summary = run(&cam, dir.path(), &ShutdownFlag::new()).await;

        assert_eq!(
            summary,
            BatchSummary { success_count: 2, fail_count: 1, total: 3, interrupted: false }
        );
        assert!(!summary.is_success());
        assert_eq!(cam.remaining(), vec!["DCIM/b.insv".to_string()]);
        assert_eq!(std::fs::read(dir.path().join("a.insv")).unwrap().len(), 100);
        assert_eq!(std::fs::read(dir.path().join("c.insp")).unwrap().len(), 50);
    }

    #[tokio::test]
    async fn same_name_in_different_folders_keeps_both() {
        let dir = tempfile::tempdir().unwrap();
        let cam = FakeCamera::new(&[("DCIM/Camera01/a.insv", 100), ("DCIM/Camera02/a.insv", 200)]);

        let summary = run(&cam, dir.path(), &ShutdownFlag::new()).await;

        assert!(summary.is_success());
        assert!(cam.remaining().is_empty());
        assert_eq!(std::fs::read(dir.path().join("a.insv")).unwrap().len(), 100);
        assert_eq!(std::fs::read(dir.path().join("a_1.insv")).unwrap().len(), 200);
    }

    #[tokio::test]
    async fn existing_local_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.jpg"), b"keep").unwrap();
        let cam = FakeCamera::new(&[("x.jpg", 3)]);

        let summary = run(&cam, dir.path(), &ShutdownFlag::new()).await;

        assert!(summary.is_success());
        assert_eq!(std::fs::read(dir.path().join("x.jpg")).unwrap(), b"keep");
        assert_eq!(std::fs::read(dir.path().join("x_1.jpg")).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn success_without_file_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = FakeCamera::new(&[("a.jpg", 10), ("b.jpg", 10)]);
        cam.silent.push("a.jpg".into());

        let summary = run(&cam, dir.path(), &ShutdownFlag::new()).await;

        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.fail_count, 1);
        assert_eq!(cam.remaining(), vec!["a.jpg".to_string()]);
    }

    #[tokio::test]
    async fn all_copied() {
        let dir = tempfile::tempdir().unwrap();
        let cam = FakeCamera::new(&[("x.jpg", 3), ("y.jpg", 4)]);

        let summary = run(&cam, dir.path(), &ShutdownFlag::new()).await;

        assert!(summary.is_success());
        assert_eq!(summary.total, 2);
        assert!(cam.remaining().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_between_files() {
        let dir = tempfile::tempdir().unwrap();
        let cam = FakeCamera::new(&[("x.jpg", 3), ("y.jpg", 4)]);
        let shutdown = ShutdownFlag::new();
        shutdown.trigger();

        let summary = run(&cam, dir.path(), &shutdown).await;

        assert!(summary.interrupted);
        assert_eq!(summary.success_count + summary.fail_count, 0);
        assert_eq!(cam.remaining().len(), 2);
        assert!(!dir.path().join("x.jpg").exists());
    }
}
