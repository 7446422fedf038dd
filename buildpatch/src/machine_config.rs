//! Per-machine persisted state.
//!
//! The machine config is a TOML file holding the ids of prerequisites
//! already installed on this machine:
//!
//! ```toml
//! [Prerequisites]
//! InstalledPrereqs = ["vcredist-2022", "directx-june2010"]
//! ```
//!
//! All file access happens on a designated owner thread. The public
//! methods marshal onto it and block until done, so they may be called
//! from anywhere.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use toml::{Table, Value};

use crate::error::{BuildPatchError, BuildPatchResult};
use crate::util::OwnerThread;

const PREREQS_SECTION: &str = "Prerequisites";
const INSTALLED_PREREQS_KEY: &str = "InstalledPrereqs";

/// The machine config.
#[derive(Debug)]
pub struct MachineConfig {
    owner: OwnerThread,
    document: Arc<Mutex<Document>>,
}

#[derive(Debug)]
struct Document {
    path: PathBuf,
    always_flush: bool,

    /// Loaded on first use.
    table: Option<Table>,
    dirty: bool,
}

impl MachineConfig {
    /// Creates a machine config backed by `path`.
    ///
    /// With `always_flush`, every save is written to disk immediately.
    /// Otherwise saves are written by `flush` or on drop.
    pub fn new(path: impl Into<PathBuf>, always_flush: bool, owner: OwnerThread) -> Self {
        Self {
            owner,
            document: Arc::new(Mutex::new(Document {
                path: path.into(),
                always_flush,
                table: None,
                dirty: false,
            })),
        }
    }

    /// Returns the ids of installed prerequisites.
    pub fn load_installed_prereq_ids(&self) -> BuildPatchResult<HashSet<String>> {
        let document = self.document.clone();
        self.owner.run_blocking(move || -> BuildPatchResult<HashSet<String>> {
            let mut document = document.lock();
            let ids = document
                .table()?
                .get(PREREQS_SECTION)
                .and_then(|section| section.get(INSTALLED_PREREQS_KEY))
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();

            Ok(ids)
        })?
    }

    /// Replaces the set of installed prerequisites.
    pub fn save_installed_prereq_ids(&self, ids: &HashSet<String>) -> BuildPatchResult<()> {
        let mut ids: Vec<String> = ids.iter().cloned().collect();
        ids.sort();

        let document = self.document.clone();
        self.owner.run_blocking(move || -> BuildPatchResult<()> {
            let mut document = document.lock();
            let path = document.path.clone();

            let table = document.table()?;
            let section = table
                .entry(PREREQS_SECTION)
                .or_insert_with(|| Value::Table(Table::new()));
            let Value::Table(section) = section else {
                return Err(invalid(&path, "[Prerequisites] is not a table"));
            };
            section.insert(
                INSTALLED_PREREQS_KEY.to_owned(),
                Value::Array(ids.into_iter().map(Value::String).collect()),
            );
            document.dirty = true;

            if document.always_flush {
                document.flush()?;
            }

            Ok(())
        })?
    }

    /// Writes pending changes to disk.
    pub fn flush(&self) -> BuildPatchResult<()> {
        let document = self.document.clone();
        self.owner.run_blocking(move || document.lock().flush())?
    }
}

impl Document {
    fn table(&mut self) -> BuildPatchResult<&mut Table> {
        if self.table.is_none() {
            self.table = Some(load_table(&self.path)?);
        }

        Ok(self.table.get_or_insert_with(Table::new))
    }

    fn flush(&mut self) -> BuildPatchResult<()> {
        if !self.dirty {
            return Ok(());
        }

        let Some(table) = &self.table else {
            return Ok(());
        };

        let contents = toml::to_string(table).map_err(|e| invalid(&self.path, e))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, contents)?;

        tracing::debug!("Saved machine config to {:?}", self.path);
        self.dirty = false;

        Ok(())
    }
}

impl Drop for MachineConfig {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("Failed to save machine config: {}", e);
        }
    }
}

fn load_table(path: &Path) -> BuildPatchResult<Table> {
    if !path.exists() {
        tracing::debug!("No machine config at {:?}", path);
        return Ok(Table::new());
    }

    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|e| invalid(path, e))
}

fn invalid(path: &Path, reason: impl ToString) -> BuildPatchError {
    BuildPatchError::InvalidConfig {
        path: path.to_owned(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn ids(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let owner = OwnerThread::spawn("config").unwrap();
        let config = MachineConfig::new(dir.path().join("machine.toml"), false, owner);

        assert!(config.load_installed_prereq_ids().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("machine.toml");
        let owner = OwnerThread::spawn("config").unwrap();

        {
            let config = MachineConfig::new(&path, false, owner.clone());
            config
                .save_installed_prereq_ids(&ids(&["b", "a"]))
                .unwrap();

            // Not written until flushed
            assert!(!path.exists());
            assert_eq!(ids(&["a", "b"]), config.load_installed_prereq_ids().unwrap());
        }

        // Dropping flushes
        let config = MachineConfig::new(&path, false, owner);
        assert_eq!(ids(&["a", "b"]), config.load_installed_prereq_ids().unwrap());
    }

    #[test]
    fn test_always_flush_preserves_other_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("machine.toml");
        std::fs::write(
            &path,
            "[Launcher]\nLastRun = 42\n\n[Prerequisites]\nInstalledPrereqs = [\"old\"]\n",
        )
        .unwrap();

        let owner = OwnerThread::spawn("config").unwrap();
        let config = MachineConfig::new(&path, true, owner);
        assert_eq!(ids(&["old"]), config.load_installed_prereq_ids().unwrap());

        config
            .save_installed_prereq_ids(&ids(&["old", "new"]))
            .unwrap();

        let saved: Table = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(Some(42), saved["Launcher"]["LastRun"].as_integer());

        let prereqs = saved["Prerequisites"]["InstalledPrereqs"].as_array().unwrap();
        assert_eq!(2, prereqs.len());
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("machine.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();

        let owner = OwnerThread::spawn("config").unwrap();
        let config = MachineConfig::new(&path, false, owner);

        let err = config.load_installed_prereq_ids().unwrap_err();
        assert_eq!("InvalidConfig", err.name());
    }
}
