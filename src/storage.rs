use crate::error::{Result, SentinelError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const CALIBRATION_PROFILE_KEY: &str = "calibration_profile";
pub const OFFLINE_QUEUE_KEY: &str = "offline_queue";
pub const DRIVER_REACTIONS_KEY: &str = "driver_reactions";
pub const ALERT_DISTANCES_KEY: &str = "alert_distances";
pub const ALERT_SETTINGS_KEY: &str = "alert_settings";

/// Key→value slots that survive process restart
///
/// # File Format
/// One file per key: `{dir}/{key}.json.gz`, gzip-compressed JSON.
/// Writes go to `{key}.json.gz.tmp` first and are renamed into place, so a
/// crash mid-write leaves the previous value intact.
#[derive(Clone, Debug)]
pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    /// Open a store rooted at `dir`, creating the directory if missing
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .map_err(|e| SentinelError::Storage(format!("Failed to create store dir: {}", e)))?;
        }
        Ok(KvStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json.gz", key))
    }

    /// Read a slot. A slot that was never written is `Ok(None)`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.slot_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path)
            .map_err(|e| SentinelError::Storage(format!("Failed to open {}: {}", key, e)))?;
        let mut decoder = GzDecoder::new(file);
        let mut json = String::new();
        decoder
            .read_to_string(&mut json)
            .map_err(|e| SentinelError::Storage(format!("Failed to decompress {}: {}", key, e)))?;

        let value = serde_json::from_str(&json)?;
        Ok(Some(value))
    }

    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;

        let path = self.slot_path(key);
        let tmp_path = path.with_extension("gz.tmp");
        let file = File::create(&tmp_path)
            .map_err(|e| SentinelError::Storage(format!("Failed to create {}: {}", key, e)))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(json.as_bytes())
            .map_err(|e| SentinelError::Storage(format!("Failed to write {}: {}", key, e)))?;
        encoder
            .finish()
            .map_err(|e| SentinelError::Storage(format!("Failed to finalize {}: {}", key, e)))?;

        fs::rename(&tmp_path, &path)
            .map_err(|e| SentinelError::Storage(format!("Failed to commit {}: {}", key, e)))?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.slot_path(key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| SentinelError::Storage(format!("Failed to remove {}: {}", key, e)))?;
        }
        Ok(())
    }

    /// `load` that logs and swallows failures; used where a corrupt slot must
    /// not stop the pipeline.
    pub fn load_or_warn<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.load(key) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Discarding unreadable slot {}: {}", key, e);
                None
            }
        }
    }

    pub fn save_or_warn<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.save(key, value) {
            log::warn!("Failed to persist {}: {}", key, e);
        }
    }
}
