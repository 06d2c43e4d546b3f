//! Lights configuration document (JSON).
//!
//! The document is parsed once at startup. Updates are written back as the
//! full JSON text and the written text becomes the live document.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

/// One `.lights.schedules[]` entry, as found in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub device: Option<String>,
    pub on: Option<String>,
    pub off: Option<String>,
    pub days: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightsConfig {
    pub mode: Option<String>,
    pub schedules: Vec<ScheduleEntry>,
}

pub struct ConfigStore {
    path: PathBuf,
    doc: Value,
}

impl ConfigStore {
    /// Read and parse the document. A missing file is an empty document, so
    /// a fresh install starts with no schedules.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse lights config: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no lights config, starting empty");
                Value::Object(Default::default())
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read lights config: {}", path.display()))
            }
        };
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `lights` section. Anything that is not of the expected shape is
    /// treated as absent.
    pub fn lights(&self) -> LightsConfig {
        let mode = self
            .doc
            .pointer("/lights/mode")
            .and_then(Value::as_str)
            .map(str::to_string);

        let text = |item: &Value, key: &str| item.get(key).and_then(Value::as_str).map(str::to_string);
        let schedules = self
            .doc
            .pointer("/lights/schedules")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.is_object())
                    .map(|item| ScheduleEntry {
                        device: text(item, "device"),
                        on: text(item, "on"),
                        off: text(item, "off"),
                        days: item
                            .get("days")
                            .and_then(Value::as_u64)
                            .map(|d| (d & 0x7f) as u32)
                            .unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default();

        LightsConfig { mode, schedules }
    }

    /// Replace the document with `text` and write it to disk.
    pub fn save(&mut self, text: &str) -> Result<()> {
        let doc: Value = serde_json::from_str(text).context("refusing to save invalid JSON")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write lights config: {}", self.path.display()))?;
        self.doc = doc;
        info!(path = %self.path.display(), "lights config saved");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "host": "hub",
        "lights": {
            "mode": "manual",
            "schedules": [
                {"device": "porch", "on": "+00:30", "off": "23:00", "days": 62},
                {"device": "garage", "on": "21:00"},
                "garbage",
                {"on": "21:00", "off": "22:00", "days": 300}
            ]
        }
    }"#;

    #[test]
    fn missing_file_is_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("lights.json")).unwrap();
        assert_eq!(store.lights(), LightsConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lights.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ConfigStore::load(&path).err().unwrap();
        assert!(format!("{err:#}").contains("failed to parse lights config"));
    }

    #[test]
    fn lights_section_is_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lights.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let lights = ConfigStore::load(&path).unwrap().lights();

        assert_eq!(lights.mode.as_deref(), Some("manual"));
        assert_eq!(lights.schedules.len(), 3);
        assert_eq!(lights.schedules[0].device.as_deref(), Some("porch"));
        assert_eq!(lights.schedules[0].days, 62);
        assert_eq!(lights.schedules[1].off, None);
        assert_eq!(lights.schedules[1].days, 0);
        assert_eq!(lights.schedules[2].device, None);
        assert_eq!(lights.schedules[2].days, 300 & 0x7f);
    }

    #[test]
    fn save_writes_and_replaces_live_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lights.json");
        let mut store = ConfigStore::load(&path).unwrap();

        let text = r#"{"lights":{"mode":"auto","schedules":[]}}"#;
        store.save(text).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
        assert_eq!(store.lights().mode.as_deref(), Some("auto"));

        assert!(store.save("nope").is_err());
        assert_eq!(store.lights().mode.as_deref(), Some("auto"));
    }
}
