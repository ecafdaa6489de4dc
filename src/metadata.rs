//! Measurement metadata.
//!
//! The engine writes provenance (the script that ran, the parameter settings,
//! data records and the measurement datetime) to a [`MetadataStore`]. How the
//! store persists it is up to the implementation: [`InMemoryMetadata`] keeps
//! it for inspection, [`JsonFileMetadata`] dumps it as JSON on `save_to_db`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{AppResult, DaqError};

/// One recorded dataset reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRecord {
    /// Dataset name
    pub name: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Free-form notes
    #[serde(default)]
    pub notes: String,
}

/// Captures provenance for one measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// Unique id of this measurement
    pub id: Uuid,
    /// Measurement name
    pub measurement_name: String,
    /// Start of the run, set by the datetime hook
    pub datetime: Option<DateTime<Utc>>,
    /// Name of the routine
    pub script: Option<String>,
    /// Parameter store snapshot
    pub settings: Option<serde_json::Value>,
    /// Datasets produced by the measurement
    pub data_records: Vec<DataRecord>,
    /// Version of the measurement engine.
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            measurement_name: "Default Measurement".to_string(),
            datetime: None,
            script: None,
            settings: None,
            data_records: Vec::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    /// A builder with a fresh id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the measurement name.
    pub fn measurement_name(mut self, name: &str) -> Self {
        self.inner.measurement_name = name.to_string();
        self
    }

    /// Set the run start time.
    pub fn datetime(mut self, datetime: DateTime<Utc>) -> Self {
        self.inner.datetime = Some(datetime);
        self
    }

    /// Finish the metadata.
    pub fn build(self) -> Metadata {
        self.inner
    }
}

impl Metadata {
    /// Validates the metadata.
    pub fn validate(&self) -> Result<(), String> {
        if self.measurement_name.is_empty() {
            return Err("Measurement name cannot be empty.".to_string());
        }
        Ok(())
    }
}

/// Write-side interface the engine uses for provenance.
///
/// Implementations use interior mutability; the engine only ever holds a
/// shared reference.
pub trait MetadataStore: Send + Sync {
    /// Record the script name.
    fn set_script(&self, script: &str) -> AppResult<()>;

    /// Record the parameter settings.
    fn set_settings(&self, settings: serde_json::Value) -> AppResult<()>;

    /// Append a dataset reference.
    fn add_data_record(&self, record: DataRecord) -> AppResult<()>;

    /// Set the measurement datetime unless one is already present.
    ///
    /// Returns whether the datetime was written.
    fn set_datetime_if_absent(&self, datetime: DateTime<Utc>) -> AppResult<bool>;

    /// Persist everything recorded so far.
    fn save_to_db(&self) -> AppResult<()>;
}

/// Metadata kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    inner: Mutex<Metadata>,
    saves: Mutex<usize>,
}

impl InMemoryMetadata {
    /// Store starting from `metadata`.
    pub fn new(metadata: Metadata) -> Self {
        Self {
            inner: Mutex::new(metadata),
            saves: Mutex::new(0),
        }
    }

    /// Copy of the current metadata.
    pub fn snapshot(&self) -> Metadata {
        self.inner.lock().clone()
    }

    /// How often `save_to_db` was called
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl MetadataStore for InMemoryMetadata {
    fn set_script(&self, script: &str) -> AppResult<()> {
        self.inner.lock().script = Some(script.to_string());
        Ok(())
    }

    fn set_settings(&self, settings: serde_json::Value) -> AppResult<()> {
        self.inner.lock().settings = Some(settings);
        Ok(())
    }

    fn add_data_record(&self, record: DataRecord) -> AppResult<()> {
        self.inner.lock().data_records.push(record);
        Ok(())
    }

    fn set_datetime_if_absent(&self, datetime: DateTime<Utc>) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        if inner.datetime.is_some() {
            return Ok(false);
        }
        inner.datetime = Some(datetime);
        Ok(true)
    }

    fn save_to_db(&self) -> AppResult<()> {
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// Metadata written to `<dir>/<measurement id>.json` on `save_to_db`.
#[derive(Debug)]
pub struct JsonFileMetadata {
    memory: InMemoryMetadata,
    dir: PathBuf,
}

impl JsonFileMetadata {
    /// Store persisting `metadata` as JSON under `dir`.
    pub fn new(metadata: Metadata, dir: impl AsRef<Path>) -> Self {
        Self {
            memory: InMemoryMetadata::new(metadata),
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// File the metadata is written to.
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.memory.inner.lock().id))
    }

    /// Read metadata back from a file written by `save_to_db`.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Metadata> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Copy of the current metadata.
    pub fn snapshot(&self) -> Metadata {
        self.memory.snapshot()
    }
}

impl MetadataStore for JsonFileMetadata {
    fn set_script(&self, script: &str) -> AppResult<()> {
        self.memory.set_script(script)
    }

    fn set_settings(&self, settings: serde_json::Value) -> AppResult<()> {
        self.memory.set_settings(settings)
    }

    fn add_data_record(&self, record: DataRecord) -> AppResult<()> {
        self.memory.add_data_record(record)
    }

    fn set_datetime_if_absent(&self, datetime: DateTime<Utc>) -> AppResult<bool> {
        self.memory.set_datetime_if_absent(datetime)
    }

    fn save_to_db(&self) -> AppResult<()> {
        let snapshot = self.memory.snapshot();
        snapshot.validate().map_err(DaqError::Configuration)?;
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(self.path(), json)?;
        self.memory.save_to_db()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_is_only_set_once() {
        let store = InMemoryMetadata::default();
        let first = Utc::now();
        assert!(store.set_datetime_if_absent(first).unwrap());
        assert!(!store.set_datetime_if_absent(Utc::now()).unwrap());
        assert_eq!(store.snapshot().datetime, Some(first));
    }

    #[test]
    fn builder_and_validation() {
        let metadata = MetadataBuilder::new().measurement_name("").build();
        assert!(metadata.validate().is_err());
        let metadata = MetadataBuilder::new().measurement_name("sweep").build();
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn json_file_metadata_saves_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileMetadata::new(
            MetadataBuilder::new().measurement_name("gate sweep").build(),
            dir.path(),
        );
        store.set_script("Sweep1D").unwrap();
        store
            .set_settings(serde_json::json!({"G1": {"voltage": {"role": "static"}}}))
            .unwrap();
        store.save_to_db().unwrap();

        let loaded = JsonFileMetadata::load(store.path()).unwrap();
        assert_eq!(loaded.measurement_name, "gate sweep");
        assert_eq!(loaded.script.as_deref(), Some("Sweep1D"));
        assert_eq!(loaded, store.snapshot());
    }
}
