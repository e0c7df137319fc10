//! On-disk settings and save snapshots.
//!
//! Settings are one JSON object mapping device name to that device's opaque
//! blob. Blobs are never interpreted here; they round-trip verbatim.
//!
//! Save snapshots are appended as one JSON line per save
//! (`{"timestamp": …, "devices": {…}}`) so the file reads as an audit log.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use lablink_types::LabError;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::runtime::DeviceRuntime;

pub type SettingsMap = BTreeMap<String, Value>;

/// Settings file plus snapshot log living side by side.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot log next to the settings file (`<stem>.snapshots.jsonl`).
    pub fn snapshot_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings".to_string());
        self.path.with_file_name(format!("{stem}.snapshots.jsonl"))
    }

    /// Read the settings map. A missing file yields an empty map.
    pub fn load(&self) -> Result<SettingsMap, LabError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no settings file yet");
            return Ok(SettingsMap::new());
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the settings map, replacing the file through a temporary sibling.
    pub fn save(&self, settings: &SettingsMap) -> Result<(), LabError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(settings)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Append one snapshot line.
    pub fn append_snapshot(&self, snapshots: &SettingsMap) -> Result<(), LabError> {
        let path = self.snapshot_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let line = json!({ "timestamp": Utc::now(), "devices": snapshots });
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Collect settings and snapshots from `runtime` and write both.
    pub async fn save_runtime(&self, runtime: &DeviceRuntime) -> Result<usize, LabError> {
        let settings = runtime.collect_settings().await;
        self.save(&settings)?;
        self.append_snapshot(&runtime.collect_snapshots().await)?;
        info!(path = %self.path.display(), devices = settings.len(), "settings saved");
        Ok(settings.len())
    }

    /// Load the settings file into `runtime`, returning per-device failures.
    pub async fn restore_runtime(&self, runtime: &DeviceRuntime) -> Result<Vec<(String, LabError)>, LabError> {
        let settings = self.load()?;
        let count = settings.len();
        let failures = runtime.restore_settings(settings).await;
        info!(
            path = %self.path.display(),
            restored = count - failures.len(),
            failed = failures.len(),
            "settings restored"
        );
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{ConstantsDevice, RecorderDevice};
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = SettingsStore::new(dir.path().join("settings.json"));
        assert!(store.load()?.is_empty());
        Ok(())
    }

    #[test]
    fn blobs_roundtrip_verbatim() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = SettingsStore::new(dir.path().join("nested").join("settings.json"));
        let mut map = SettingsMap::new();
        map.insert("scan".into(), json!({"measurementPlan": [{"offset": 1.0, "duration": 2.0}]}));
        map.insert("main".into(), json!({"filename": "run", "saveDirectory": "/data"}));
        store.save(&map)?;
        assert_eq!(store.load()?, map);
        Ok(())
    }

    #[test]
    fn snapshots_append_lines() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = SettingsStore::new(dir.path().join("rig.json"));
        let mut snap = SettingsMap::new();
        snap.insert("smaract".into(), json!([0.1, 0.2]));
        store.append_snapshot(&snap)?;
        store.append_snapshot(&snap)?;
        let text = fs::read_to_string(store.snapshot_path())?;
        assert_eq!(text.lines().count(), 2);
        assert!(store.snapshot_path().ends_with("rig.snapshots.jsonl"));
        let first: Value = serde_json::from_str(text.lines().next().ok_or("empty")?)?;
        assert_eq!(first["devices"]["smaract"], json!([0.1, 0.2]));
        Ok(())
    }

    #[tokio::test]
    async fn runtime_save_and_restore() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = SettingsStore::new(dir.path().join("settings.json"));

        let runtime = DeviceRuntime::default();
        runtime.register("constants", ConstantsDevice::default()).await?;
        runtime.register("main", RecorderDevice::default()).await?;
        runtime
            .action("constants", None, "set", vec!["tweezerQwpOffset".into(), 12.5.into()])
            .await?;
        runtime.action("main", None, "set_filename", vec!["particle A".into()]).await?;
        assert_eq!(store.save_runtime(&runtime).await?, 2);

        let fresh = DeviceRuntime::default();
        fresh.register("constants", ConstantsDevice::default()).await?;
        fresh.register("main", RecorderDevice::default()).await?;
        assert!(store.restore_runtime(&fresh).await?.is_empty());
        assert_eq!(fresh.collect_settings().await, runtime.collect_settings().await);
        Ok(())
    }
}
