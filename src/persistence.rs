//! Saved instrument settings.
//!
//! One JSON object per instrument at `<dir>/<group>/<id>.json`, mapping
//! property names to their last written values. Values are only read at
//! start-up; nothing keeps the files in sync while running.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::core::PropertyValue;
use crate::error::AppResult;

/// Flat property-name to value mapping.
pub type SavedSettings = BTreeMap<String, PropertyValue>;

/// Directory of saved settings, one file per instrument.
#[derive(Clone, Debug)]
pub struct SettingsStore {
    dir: PathBuf,
}

impl SettingsStore {
    /// A store rooted at `dir`. Nothing is created until the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File holding the settings of `group`/`id`.
    pub fn path(&self, group: &str, id: &str) -> PathBuf {
        self.dir.join(group).join(format!("{}.json", id))
    }

    /// Saved settings, or `None` when nothing was saved yet.
    pub fn load(&self, group: &str, id: &str) -> AppResult<Option<SavedSettings>> {
        let path = self.path(group, id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no saved settings at '{}'", path.display());
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write `settings` as pretty JSON, creating the group directory.
    pub fn save(&self, group: &str, id: &str, settings: &SavedSettings) -> AppResult<()> {
        let path = self.path(group, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(settings)?)?;
        info!("saved {} settings to '{}'", settings.len(), path.display());
        Ok(())
    }
}
