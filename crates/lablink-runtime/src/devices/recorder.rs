//! Experiment recorder (registered as `"main"` on a rig).
//!
//! Owns the naming of recordings and their timing. Data capture itself is
//! done by whatever consumes the status bus while `isRecording` holds.
//!
//! # Handlers
//!
//! | Method | Arguments | Effect |
//! |---|---|---|
//! | `set_filename` | `name` | Label used for the next recordings |
//! | `set_save_directory` | `dir` | Directory template |
//! | `start_recording` | `[seconds]` | Start; `0` or absent records until stopped |
//! | `stop_recording` | | Stop now |
//! | `set_remaining_recordings` | `count` | Published countdown for sequencers |
//! | `next_file_path` | | Path the next recording would get |
//!
//! Directory and filename templates may contain `{year}`, `{month}`, `{day}`,
//! `{date}`, `{time}` and `{device.field}` placeholders, the latter resolved
//! from another device's published status. Recordings are numbered
//! `<n> <filename>` with `n` one past the highest number already present.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, TimeDelta};
use lablink_types::{LabError, RecorderStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::context::DeviceContext;
use crate::device::{Device, DeviceCall, to_status};

/// Recordings started shortly after midnight still belong to the previous
/// day's session.
const SESSION_DAY_SHIFT_HOURS: i64 = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecorderSettings {
    save_directory: Option<String>,
    filename: Option<String>,
}

pub struct RecorderDevice {
    status: RecorderStatus,
    poll_interval: Duration,
    started: Option<Instant>,
}

impl Default for RecorderDevice {
    fn default() -> Self {
        Self {
            status: RecorderStatus {
                save_directory: "experiment/{date}".into(),
                ..RecorderStatus::default()
            },
            poll_interval: Duration::from_millis(100),
            started: None,
        }
    }
}

impl RecorderDevice {
    pub fn with_save_directory(mut self, dir: impl Into<String>) -> Self {
        self.status.save_directory = dir.into();
        self
    }

    pub fn is_recording(&self) -> bool {
        self.started.is_some()
    }

    /// Start a recording. Returns `false` when one is already running.
    fn start(&mut self, ctx: &DeviceContext, seconds: Option<f64>) -> Result<bool, LabError> {
        if self.started.is_some() {
            debug!("recording already running, start ignored");
            return Ok(false);
        }
        let planned = match seconds {
            Some(s) if s < 0.0 || !s.is_finite() => {
                return Err(LabError::out_of_range("recording duration", s, 0.0, f64::MAX));
            }
            Some(s) if s > 0.0 => Some(s),
            _ => None,
        };
        let path = self.next_file_path(ctx);
        self.started = Some(Instant::now());
        self.status.is_recording = true;
        self.status.recording_time_seconds = 0.0;
        self.status.planned_recording_time_seconds = planned;
        self.status.current_file = Some(path.display().to_string());
        info!(file = %path.display(), planned_seconds = ?planned, "recording started");
        Ok(true)
    }

    fn stop(&mut self) {
        if self.started.take().is_some() {
            info!(seconds = self.status.recording_time_seconds, "recording stopped");
        }
        self.status.is_recording = false;
    }

    fn next_file_path(&self, ctx: &DeviceContext) -> PathBuf {
        let now = Local::now().naive_local() - TimeDelta::hours(SESSION_DAY_SHIFT_HOURS);
        let lookup = |key: &str| lookup_state(ctx, key);
        let dir = PathBuf::from(interpolate(&self.status.save_directory, now, lookup));
        let filename = interpolate(&self.status.filename, now, lookup);
        let index = highest_index(&dir) + 1;
        if filename.is_empty() {
            dir.join(index.to_string())
        } else {
            dir.join(format!("{index} {filename}"))
        }
    }
}

/// Resolve `device.field` against a published status.
fn lookup_state(ctx: &DeviceContext, key: &str) -> Option<String> {
    let (device, field) = key.split_once('.')?;
    let state = ctx.get_device_state(device).ok()?;
    match state.as_value().get(field)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Expand `{placeholder}` tokens. Unknown placeholders lose their braces.
fn interpolate(template: &str, now: NaiveDateTime, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = &after[..close];
        let valid = !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if !valid {
            out.push('{');
            rest = after;
            continue;
        }
        let value = match key {
            "year" => now.format("%Y").to_string(),
            "month" => now.format("%m").to_string(),
            "day" => now.format("%d").to_string(),
            "date" => now.format("%Y-%m-%d").to_string(),
            "time" => now.format("%H:%M:%S").to_string(),
            other => lookup(other).unwrap_or_else(|| other.to_string()),
        };
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Highest `<n>` among entries named `<n> …` or `<n>.…` in `dir`.
fn highest_index(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
            let separator = name[digits.len()..].chars().next();
            match separator {
                Some(' ') | Some('.') => digits.parse().ok(),
                _ => None,
            }
        })
        .max()
        .unwrap_or(0)
}

#[async_trait]
impl Device for RecorderDevice {
    fn kind(&self) -> &'static str {
        "recorder"
    }

    fn status(&self) -> Value {
        to_status(&self.status)
    }

    async fn call(&mut self, ctx: &DeviceContext, call: &DeviceCall) -> Result<Value, LabError> {
        let args = &call.args;
        match call.method.as_str() {
            "set_filename" => {
                self.status.filename = args.str(0)?.to_string();
                Ok(Value::Null)
            }
            "set_save_directory" => {
                self.status.save_directory = args.str(0)?.to_string();
                Ok(Value::Null)
            }
            "start_recording" => Ok(self.start(ctx, args.opt_f64(0)?)?.into()),
            "stop_recording" => {
                self.stop();
                Ok(Value::Null)
            }
            "set_remaining_recordings" | "set_remaining_additional_recordings" => {
                let count = args.index(0)?;
                self.status.remaining_additional_recordings = u32::try_from(count)
                    .map_err(|_| LabError::InvalidArguments(format!("recording count {count} is negative")))?;
                Ok(Value::Null)
            }
            "next_file_path" => Ok(self.next_file_path(ctx).display().to_string().into()),
            "get_state" => Ok(self.status()),
            _ => Err(call.unknown()),
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }

    async fn poll(&mut self, _ctx: &DeviceContext) -> Result<Duration, LabError> {
        if let Some(started) = self.started {
            let seconds = started.elapsed().as_secs_f64();
            self.status.recording_time_seconds = seconds;
            if self.status.planned_recording_time_seconds.is_some_and(|planned| seconds >= planned) {
                self.stop();
            }
        }
        Ok(self.poll_interval)
    }

    async fn teardown(&mut self, _ctx: &DeviceContext) -> Result<(), LabError> {
        self.stop();
        Ok(())
    }

    fn settings(&self) -> Option<Value> {
        serde_json::to_value(RecorderSettings {
            save_directory: Some(self.status.save_directory.clone()),
            filename: Some(self.status.filename.clone()),
        })
        .ok()
    }

    fn load_settings(&mut self, settings: Value) -> Result<(), LabError> {
        let settings: RecorderSettings = serde_json::from_value(settings)?;
        if let Some(dir) = settings.save_directory {
            self.status.save_directory = dir;
        }
        if let Some(filename) = settings.filename {
            self.status.filename = filename;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::DeviceRuntime;
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::TempDir;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(12, 30, 5))
            .unwrap_or_default()
    }

    #[test]
    fn placeholders_expand() {
        let lookup = |key: &str| (key == "constants.heterodyneFrequency").then(|| "1000000".to_string());
        assert_eq!(interpolate("runs/{date}/{time}", noon(), lookup), "runs/2024-03-09/12:30:05");
        assert_eq!(interpolate("{year}{month}{day}", noon(), lookup), "20240309");
        assert_eq!(interpolate("het {constants.heterodyneFrequency}", noon(), lookup), "het 1000000");
        assert_eq!(interpolate("{ghost.field} x", noon(), lookup), "ghost.field x");
        assert_eq!(interpolate("{ not a key } {", noon(), lookup), "{ not a key } {");
    }

    #[test]
    fn numbering_continues_after_existing_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        assert_eq!(highest_index(dir.path()), 0);
        fs::write(dir.path().join("3 particle A.h5"), "")?;
        fs::write(dir.path().join("7.h5"), "")?;
        fs::write(dir.path().join("12notes.txt"), "")?;
        assert_eq!(highest_index(dir.path()), 7);
        assert_eq!(highest_index(&dir.path().join("missing")), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timed_recording_stops_itself() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let runtime = DeviceRuntime::default();
        let recorder = RecorderDevice::default().with_save_directory(dir.path().display().to_string());
        runtime.register("main", recorder).await?;
        runtime.action("main", None, "set_filename", vec![json!("particle A")]).await?;
        runtime.start();

        assert_eq!(runtime.request("main", None, "start_recording", vec![json!(2)]).await?, json!(true));
        assert_eq!(runtime.request("main", None, "start_recording", vec![json!(2)]).await?, json!(false));
        let status: RecorderStatus = runtime.get_device_state("main")?.typed()?;
        assert!(status.is_recording);
        let expected = dir.path().join("1 particle A").display().to_string();
        assert_eq!(status.current_file.as_deref(), Some(expected.as_str()));

        tokio::time::sleep(Duration::from_millis(2_300)).await;
        let status: RecorderStatus = runtime.get_device_state("main")?.typed()?;
        assert!(!status.is_recording);
        assert!((2.0..2.2).contains(&status.recording_time_seconds));
        runtime.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_recordings_are_not_rounded_up() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let runtime = DeviceRuntime::default();
        let recorder = RecorderDevice::default().with_save_directory(dir.path().display().to_string());
        runtime.register("main", recorder).await?;
        runtime.start();

        runtime.action("main", None, "start_recording", vec![json!(0.6)]).await?;
        tokio::time::sleep(Duration::from_millis(850)).await;
        let status: RecorderStatus = runtime.get_device_state("main")?.typed()?;
        assert!(!status.is_recording);
        assert!((0.6..0.8).contains(&status.recording_time_seconds), "{}", status.recording_time_seconds);
        runtime.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn rejects_negative_counts_and_durations() -> Result<(), Box<dyn std::error::Error>> {
        let runtime = DeviceRuntime::default();
        runtime.register("main", RecorderDevice::default()).await?;
        assert!(matches!(
            runtime.action("main", None, "set_remaining_recordings", vec![json!(-1)]).await,
            Err(LabError::InvalidArguments(_))
        ));
        assert!(matches!(
            runtime.action("main", None, "start_recording", vec![json!(-5)]).await,
            Err(LabError::OutOfRange { .. })
        ));
        runtime.action("main", None, "set_remaining_additional_recordings", vec![json!(3)]).await?;
        let status: RecorderStatus = runtime.get_device_state("main")?.typed()?;
        assert_eq!(status.remaining_additional_recordings, 3);
        assert!(!status.is_recording);
        Ok(())
    }

    #[tokio::test]
    async fn settings_keep_directory_and_label() -> Result<(), Box<dyn std::error::Error>> {
        let mut recorder = RecorderDevice::default();
        recorder.load_settings(json!({"saveDirectory": "/data/{date}", "filename": "run"}))?;
        let blob = recorder.settings().ok_or("no settings")?;
        assert_eq!(blob, json!({"saveDirectory": "/data/{date}", "filename": "run"}));

        recorder.load_settings(json!({"filename": "other"}))?;
        assert_eq!(recorder.status.save_directory, "/data/{date}");
        Ok(())
    }
}
