//! Open Spherical Camera (OSC) HTTP backend.
//!
//! 360° cameras expose the OSC API on their WiFi access point.  Commands are
//! posted to `/osc/commands/execute`; long-running ones answer `inProgress`
//! with an id that is polled through `/osc/commands/status` until `done`.
//! Files are fetched with a plain `GET` of their `fileUrl`.
//!
//! OSC has no file upload or power-off command, so those two operations
//! report [`CamError::Unsupported`].

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local};
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::camera::{
    BatteryStatus, Camera, CaptureMode, DeviceInfo, MediaUrl, PowerType, RemoteFile, StorageStatus,
};
use crate::config::ClientConfig;
use crate::error::{CamError, Result};
use crate::transfer::TransferProgress;

const INFO_TIMEOUT: Duration = Duration::from_secs(3);

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OscInfo {
    #[serde(default)]
    manufacturer:     String,
    #[serde(default)]
    model:            String,
    #[serde(default)]
    serial_number:    String,
    #[serde(default)]
    firmware_version: String,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    state:   String,
    id:      Option<String>,
    results: Option<Value>,
    error:   Option<CommandError>,
}

#[derive(Debug, Deserialize)]
struct CommandError {
    #[serde(default)]
    code:    String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: Value,
}

/// Where a command stands after one request.
#[derive(Debug, PartialEq)]
enum Progress {
    Done(Value),
    Pending(String),
}

fn interpret(name: &str, resp: CommandResponse) -> Result<Progress> {
    match resp.state.as_str() {
        "done" => Ok(Progress::Done(resp.results.unwrap_or(Value::Null))),
        "inProgress" => resp
            .id
            .map(Progress::Pending)
            .ok_or_else(|| CamError::Protocol(format!("{name}: inProgress without id"))),
        "error" => {
            let (code, message) = resp
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or_default();
            Err(CamError::Command {
                name:    name.to_string(),
                message: if message.is_empty() { code } else { format!("{code}: {message}") },
            })
        }
        other => Err(CamError::Protocol(format!("{name}: unexpected state {other:?}"))),
    }
}

/// Collect `fileUrl` / `fileUrls` from command results.
fn media_from_results(results: &Value) -> MediaUrl {
    let mut urls = Vec::new();
    if let Some(url) = results.get("fileUrl").and_then(Value::as_str) {
        urls.push(url.to_string());
    }
    if let Some(list) = results.get("fileUrls").and_then(Value::as_array) {
        urls.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
    }
    MediaUrl::new(urls)
}

/// Entries of one `camera.listFiles` page, plus the camera's total count.
fn entries_from_results(results: &Value) -> (Vec<RemoteFile>, Option<u64>) {
    let entries = results
        .get("entries")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|e| {
                    let url = e.get("fileUrl").and_then(Value::as_str)?;
                    Some(RemoteFile {
                        url:  url.to_string(),
                        size: e.get("size").and_then(Value::as_u64),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let total = results.get("totalEntries").and_then(Value::as_u64);
    (entries, total)
}

fn battery_from_state(state: &Value) -> Result<BatteryStatus> {
    let level = state
        .get("batteryLevel")
        .and_then(Value::as_f64)
        .ok_or_else(|| CamError::Protocol("state without batteryLevel".into()))?;
    let charge = state
        .get("_batteryState")
        .or_else(|| state.get("batteryState"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let power_type = match charge.as_deref() {
        Some("charging") | Some("charged") => PowerType::Adapter,
        _ => PowerType::Battery,
    };
    Ok(BatteryStatus {
        power_type,
        battery_level: (level.clamp(0.0, 1.0) * 100.0).round() as u8,
        state: charge,
    })
}

/// `YYYY:MM:DD HH:MM:SS+HH:MM`, the OSC `dateTimeZone` format.
fn osc_date_time(now: &DateTime<Local>) -> String {
    now.format("%Y:%m:%d %H:%M:%S%:z").to_string()
}

// ── Client ────────────────────────────────────────────────────────────────────

/// An OSC camera reached over HTTP.
pub struct OscCamera {
    http:            Client,
    base:            Url,
    request_timeout: Duration,
    poll_interval:   Duration,
    command_timeout: Duration,
    page_size:       u32,
    device:          Option<DeviceInfo>,
}

/// Build the HTTP client used for all camera calls.
///
/// No overall request timeout: file downloads may legitimately take minutes.
/// Command requests set their own timeout.
pub fn build_camera_http_client(connect_timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(CamError::Http)
}

impl OscCamera {
    pub fn new(cfg: &ClientConfig) -> Result<Self> {
        let request_timeout = Duration::from_secs(cfg.http_timeout);
        let base = Url::parse(&format!("http://{}:{}/", cfg.camera_host, cfg.camera_port))?;
        Ok(Self {
            http: build_camera_http_client(request_timeout)?,
            base,
            request_timeout,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(50)),
            command_timeout: Duration::from_secs(cfg.command_timeout),
            page_size: cfg.list_page_size.max(1),
            device: None,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.device.is_some() { Ok(()) } else { Err(CamError::NotConnected) }
    }

    /// Resolve a file URL the camera gave us (absolute or camera-relative).
    fn resolve(&self, remote: &str) -> Result<Url> {
        match Url::parse(remote) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(self.base.join(remote)?),
            Err(e) => Err(e.into()),
        }
    }

    async fn info(&self) -> Result<OscInfo> {
        let url = self.base.join("osc/info")?;
        let info = self
            .http
            .get(url)
            .timeout(INFO_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<OscInfo>()
            .await?;
        Ok(info)
    }

    async fn state(&self) -> Result<Value> {
        let url = self.base.join("osc/state")?;
        let resp = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<StateResponse>()
            .await?;
        Ok(resp.state)
    }

    async fn post_command(&self, path: &str, name: &str, body: &Value) -> Result<Progress> {
        let url = self.base.join(path)?;
        let resp = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        match serde_json::from_str::<CommandResponse>(&text) {
            Ok(parsed) => interpret(name, parsed),
            Err(_) if !status.is_success() => {
                Err(CamError::Protocol(format!("{name}: HTTP {status}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run a command to completion and return its `results`.
    async fn execute(&self, name: &str, parameters: Value) -> Result<Value> {
        debug!("osc execute {name} {parameters}");
        let body = json!({ "name": name, "parameters": parameters });
        let mut progress = self.post_command("osc/commands/execute", name, &body).await?;
        let deadline = tokio::time::Instant::now() + self.command_timeout;

        loop {
            let id = match progress {
                Progress::Done(results) => return Ok(results),
                Progress::Pending(id) => id,
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(CamError::Command {
                    name:    name.to_string(),
                    message: format!("still in progress after {}s", self.command_timeout.as_secs()),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            progress = self
                .post_command("osc/commands/status", name, &json!({ "id": id }))
                .await?;
        }
    }

    async fn set_options(&self, options: Value) -> Result<()> {
        self.execute("camera.setOptions", json!({ "options": options })).await?;
        Ok(())
    }
}

impl Camera for OscCamera {
    async fn discover(&self) -> Result<Vec<DeviceInfo>> {
        match self.info().await {
            Ok(info) => {
                let name = format!("{} {}", info.manufacturer, info.model).trim().to_string();
                Ok(vec![DeviceInfo {
                    name,
                    serial_number:    info.serial_number,
                    firmware_version: info.firmware_version,
                    address:          self.base.host_str().unwrap_or_default().to_string(),
                }])
            }
            Err(e) => {
                debug!("no OSC camera at {}: {e}", self.base);
                Ok(Vec::new())
            }
        }
    }

    async fn open(&mut self, device: &DeviceInfo) -> Result<()> {
        // The state endpoint answers only once the camera is ready for commands.
        self.state().await?;
        info!("opened {} (SN {})", device.name, device.serial_number);
        self.device = Some(device.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.device = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.device.is_some() && self.state().await.is_ok()
    }

    async fn sync_time(&self, now: DateTime<Local>) -> Result<()> {
        self.ensure_open()?;
        self.set_options(json!({ "dateTimeZone": osc_date_time(&now) })).await
    }

    async fn set_capture_mode(&self, mode: CaptureMode) -> Result<()> {
        self.ensure_open()?;
        let mode = match mode {
            CaptureMode::Image => "image",
            CaptureMode::Video => "video",
        };
        self.set_options(json!({ "captureMode": mode })).await
    }

    async fn take_photo(&self) -> Result<MediaUrl> {
        self.ensure_open()?;
        let results = self.execute("camera.takePicture", json!({})).await?;
        Ok(media_from_results(&results))
    }

    async fn start_recording(&self) -> Result<()> {
        self.ensure_open()?;
        self.execute("camera.startCapture", json!({})).await?;
        Ok(())
    }

    async fn stop_recording(&self) -> Result<MediaUrl> {
        self.ensure_open()?;
        let results = self.execute("camera.stopCapture", json!({})).await?;
        Ok(media_from_results(&results))
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        self.ensure_open()?;
        let mut files = Vec::new();
        loop {
            let params = json!({
                "fileType":      "all",
                "startPosition": files.len(),
                "entryCount":    self.page_size,
                "maxThumbSize":  Value::Null,
            });
            let results = self.execute("camera.listFiles", params).await?;
            let (page, total) = entries_from_results(&results);
            if page.is_empty() {
                break;
            }
            files.extend(page);
            if total.map_or(true, |t| files.len() as u64 >= t) {
                break;
            }
        }
        Ok(files)
    }

    async fn download(&self, remote: &str, local: &Path, progress: &mut dyn TransferProgress) -> Result<()> {
        self.ensure_open()?;
        let url = self.resolve(remote)?;
        let resp = self.http.get(url).send().await?.error_for_status()?;
        let total = resp.content_length().unwrap_or(0);

        let mut file = tokio::fs::File::create(local).await?;
        let mut written: u64 = 0;
        progress.on_progress(written, total);

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.on_progress(written, total);
        }
        file.flush().await?;
        Ok(())
    }

    async fn upload(&self, _local: &Path, _remote_name: &str, _progress: &mut dyn TransferProgress) -> Result<String> {
        Err(CamError::Unsupported("upload over OSC"))
    }

    async fn remote_size(&self, remote: &str) -> Result<Option<u64>> {
        let files = self.list_files().await?;
        Ok(files.into_iter().find(|f| f.url == remote).and_then(|f| f.size))
    }

    async fn delete_file(&self, remote: &str) -> Result<()> {
        self.ensure_open()?;
        self.execute("camera.delete", json!({ "fileUrls": [remote] })).await?;
        Ok(())
    }

    async fn battery_status(&self) -> Result<BatteryStatus> {
        self.ensure_open()?;
        battery_from_state(&self.state().await?)
    }

    async fn storage_status(&self) -> Result<StorageStatus> {
        self.ensure_open()?;
        let results = self
            .execute(
                "camera.getOptions",
                json!({ "optionNames": ["remainingSpace", "totalSpace"] }),
            )
            .await?;
        let options = results.get("options").cloned().unwrap_or(Value::Null);
        let free = options.get("remainingSpace").and_then(Value::as_u64);
        let total = options.get("totalSpace").and_then(Value::as_u64);
        if free.is_none() || total.is_none() {
            warn!("camera did not report storage space: {options}");
        }
        Ok(StorageStatus {
            free_space:  free.unwrap_or(0),
            total_space: total.unwrap_or(0),
            state:       if total.unwrap_or(0) > 0 { "ready".into() } else { "unavailable".into() },
        })
    }

    async fn shutdown(&mut self) -> Result<()> {
        Err(CamError::Unsupported("power off over OSC"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn response(text: &str) -> CommandResponse {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn done_command_yields_results() {
        let resp = response(
            r#"{"name":"camera.takePicture","state":"done","results":{"fileUrl":"http://192.168.42.1:80/DCIM/Camera01/IMG_1.insp"}}"#,
        );
        let Progress::Done(results) = interpret("camera.takePicture", resp).unwrap() else {
            panic!("expected done");
        };
        assert_eq!(
            media_from_results(&results).single_origin(),
            Some("http://192.168.42.1:80/DCIM/Camera01/IMG_1.insp")
        );
    }

    #[test]
    fn in_progress_needs_id() {
        let resp = response(r#"{"name":"camera.takePicture","state":"inProgress","id":"42"}"#);
        assert_eq!(interpret("x", resp).unwrap(), Progress::Pending("42".into()));

        let resp = response(r#"{"state":"inProgress"}"#);
        assert!(matches!(interpret("x", resp), Err(CamError::Protocol(_))));
    }

    #[test]
    fn error_state_carries_message() {
        let resp = response(
            r#"{"name":"camera.delete","state":"error","error":{"code":"invalidParameterValue","message":"no such file"}}"#,
        );
        match interpret("camera.delete", resp) {
            Err(CamError::Command { name, message }) => {
                assert_eq!(name, "camera.delete");
                assert_eq!(message, "invalidParameterValue: no such file");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn recording_yields_all_origins() {
        let results = json!({ "fileUrls": ["http://cam/VID_1_00.insv", "http://cam/VID_1_10.insv"] });
        let media = media_from_results(&results);
        assert_eq!(media.origins().len(), 2);
        assert!(media.single_origin().is_none());
    }

    #[test]
    fn list_page_parsing() {
        let results = json!({
            "entries": [
                { "name": "a.insp", "fileUrl": "http://cam/DCIM/a.insp", "size": 1024 },
                { "name": "b.insv", "fileUrl": "http://cam/DCIM/b.insv" },
                { "name": "broken" }
            ],
            "totalEntries": 3
        });
        let (files, total) = entries_from_results(&results);
        assert_eq!(total, Some(3));
        assert_eq!(
            files,
            vec![
                RemoteFile { url: "http://cam/DCIM/a.insp".into(), size: Some(1024) },
                RemoteFile { url: "http://cam/DCIM/b.insv".into(), size: None },
            ]
        );
    }

    #[test]
    fn battery_parsing() {
        let state = json!({ "batteryLevel": 0.57, "_batteryState": "charging" });
        let status = battery_from_state(&state).unwrap();
        assert_eq!(status.battery_level, 57);
        assert_eq!(status.power_type, PowerType::Adapter);

        let state = json!({ "batteryLevel": 1.0, "batteryState": "disconnect" });
        let status = battery_from_state(&state).unwrap();
        assert_eq!(status.battery_level, 100);
        assert_eq!(status.power_type, PowerType::Battery);

        assert!(battery_from_state(&json!({})).is_err());
    }

    #[test]
    fn date_time_zone_format() {
        let now = Local.with_ymd_and_hms(2025, 4, 18, 16, 15, 12).unwrap();
        let s = osc_date_time(&now);
        assert!(s.starts_with("2025:04:18 16:15:12"), "{s}");
        assert_eq!(s.len(), "2025:04:18 16:15:12+02:00".len());
    }

    #[test]
    fn relative_urls_resolve_against_camera() {
        let cam = OscCamera::new(&ClientConfig::default()).unwrap();
        assert_eq!(
            cam.resolve("/DCIM/a.insp").unwrap().as_str(),
            "http://192.168.42.1/DCIM/a.insp"
        );
        assert_eq!(cam.resolve("http://other/x").unwrap().as_str(), "http://other/x");
    }
}
