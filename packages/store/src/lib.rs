#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Flat JSON file holding one record per connection.
//!
//! The file is a JSON array. A missing file reads as an empty array, and so
//! does a file whose content is not an array (the bad content is replaced on
//! the next write). Array elements that are not records are kept as they are. Submissions are serialized through a single
//! lock so concurrent connections cannot lose each other's updates, and every
//! write goes through a temporary file that is renamed over the target.

use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use pulseform_models::{FORM_READ_ERROR_MESSAGE, FORM_WRITE_ERROR_MESSAGE, FormData};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt as _, sync::Mutex};

pub const DEFAULT_FILE_NAME: &str = "formData.json";

/// One persisted form submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "socketId")]
    pub connection_id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keys a record owns. Submitted form fields with these names are dropped.
const RESERVED_FIELDS: [&str; 4] = ["message", "connectionId", "socketId", "timestamp"];

/// One element of the data file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entry {
    Record(Record),
    /// An element that does not parse as a [`Record`]. It is written back
    /// unchanged.
    Other(Value),
}

impl Entry {
    #[must_use]
    pub fn into_record(self) -> Option<Record> {
        match self {
            Self::Record(record) => Some(record),
            Self::Other(_) => None,
        }
    }

    fn from_value(value: Value) -> Self {
        if !value.is_object() {
            return Self::Other(value);
        }

        match serde_json::from_value::<Record>(value.clone()) {
            Ok(record) => Self::Record(record),
            Err(e) => {
                log::warn!("Keeping unrecognized data file entry as is: {e}");
                Self::Other(value)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum SubmitOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read data file: {0}")]
    Read(#[source] std::io::Error),
    #[error("Failed to write data file: {0}")]
    Write(#[source] std::io::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// The message reported back to the client that triggered the failure.
    #[must_use]
    pub const fn client_message(&self) -> &'static str {
        match self {
            Self::Read(_) => FORM_READ_ERROR_MESSAGE,
            Self::Write(_) | Self::Serialize(_) => FORM_WRITE_ERROR_MESSAGE,
        }
    }
}

/// Current time in the format stored in [`Record::timestamp`], e.g.
/// `2024-05-01T12:00:00.000Z`.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Interprets the content of the data file.
///
/// Content that is not a JSON array is logged and treated as empty.
#[must_use]
pub fn parse_entries(content: &str) -> Vec<Entry> {
    let value = match serde_json::from_str::<Value>(content) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("Data file is not valid JSON, re-initializing: {e:?}");
            return vec![];
        }
    };

    let Value::Array(values) = value else {
        log::warn!("Data file was not an array, re-initializing.");
        return vec![];
    };

    values.into_iter().map(Entry::from_value).collect()
}

/// The records in the content of the data file, skipping anything else.
#[must_use]
pub fn parse_records(content: &str) -> Vec<Record> {
    parse_entries(content)
        .into_iter()
        .filter_map(Entry::into_record)
        .collect()
}

/// Updates the record for `connection_id` in place, or appends a new one.
///
/// An existing record only has its `message` and `timestamp` replaced. A new
/// record also takes the extra fields of `form`, except any that would
/// shadow the record's own fields.
pub fn upsert(
    entries: &mut Vec<Entry>,
    connection_id: &str,
    form: FormData,
    timestamp: String,
) -> SubmitOutcome {
    let existing = entries.iter_mut().find_map(|x| match x {
        Entry::Record(record) if record.connection_id == connection_id => Some(record),
        _ => None,
    });

    if let Some(record) = existing {
        record.message = form.message;
        record.timestamp = timestamp;
        SubmitOutcome::Updated
    } else {
        let mut extra = form.extra;
        extra.retain(|key, _| !RESERVED_FIELDS.contains(&key.as_str()));

        entries.push(Entry::Record(Record {
            message: form.message,
            connection_id: connection_id.to_string(),
            timestamp,
            extra,
        }));
        SubmitOutcome::Inserted
    }
}

#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RecordStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// A store backed by [`DEFAULT_FILE_NAME`] inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(DEFAULT_FILE_NAME))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| OsString::from(DEFAULT_FILE_NAME), ToOwned::to_owned);
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Creates the directory the data file lives in.
    ///
    /// # Errors
    ///
    /// * If the directory cannot be created
    pub async fn ensure_data_dir(&self) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|x| !x.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await.map_err(StoreError::Write)?;
            log::debug!("Data directory ensured: {}", dir.display());
        }

        Ok(())
    }

    /// Reads every record currently in the store.
    ///
    /// # Errors
    ///
    /// * If the data file exists but cannot be read
    pub async fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .read_entries()
            .await?
            .into_iter()
            .filter_map(Entry::into_record)
            .collect())
    }

    /// Reads every element of the data file, records or not.
    ///
    /// # Errors
    ///
    /// * If the data file exists but cannot be read
    pub async fn read_entries(&self) -> Result<Vec<Entry>, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(parse_entries(&content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No data file at {}", self.path.display());
                Ok(vec![])
            }
            Err(e) => Err(StoreError::Read(e)),
        }
    }

    async fn write_all(&self, entries: &[Entry]) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entries)?;
        let temp_path = self.temp_path();

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &self.path).await
        };

        if let Err(e) = write.await {
            if let Err(remove_err) = fs::remove_file(&temp_path).await
                && remove_err.kind() != ErrorKind::NotFound
            {
                log::warn!(
                    "Failed to remove temp file {}: {remove_err:?}",
                    temp_path.display()
                );
            }
            return Err(StoreError::Write(e));
        }

        Ok(())
    }

    /// Stores `form` as the record for `connection_id`, stamped with the
    /// current time.
    ///
    /// # Errors
    ///
    /// * If the data file exists but cannot be read
    /// * If the data file cannot be written
    pub async fn submit(
        &self,
        connection_id: &str,
        form: FormData,
    ) -> Result<SubmitOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.read_entries().await?;
        let outcome = upsert(&mut entries, connection_id, form, now_timestamp());
        self.write_all(&entries).await?;

        log::debug!(
            "{} entry for connection_id={connection_id} in {}",
            outcome.as_ref(),
            self.path.display()
        );

        Ok(outcome)
    }
}
