//! Durable per-archive state, persisted as `statefile.json`.
//!
//! Every mutation rewrites the whole file through a temp file and a rename,
//! so a crash never leaves a half-written state file. A file that fails to
//! parse is an error, never silently reset: losing the temp-file records
//! would strand plaintext key material.
//!
//! Single writer per archive directory is assumed; there is no locking.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chillbox_core::{ChillboxError, ChillboxResult};
use chillbox_secrets::{shred_file, TempRecords, LOCAL_PRIVATE_KEY_TEMP};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CURRENT_USER: &str = "current_user";
pub const CURRENT_USER_DATA: &str = "current_user_data";
pub const SSH_CONFIG_TEMP: &str = "ssh_config_temp";
pub const IDENTITY_FILE_TEMP: &str = "identity_file_temp";
pub const OUTPUT_ENV_TEMP: &str = "output_env_temp";
pub const BASE_IMAGES: &str = "base_images";
pub const SERVER_IMAGES: &str = "server_images";

/// Keys whose values are paths of plaintext temp files.
pub const TEMP_FILE_KEYS: [&str; 4] = [
    LOCAL_PRIVATE_KEY_TEMP,
    SSH_CONFIG_TEMP,
    IDENTITY_FILE_TEMP,
    OUTPUT_ENV_TEMP,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUserData {
    #[serde(default)]
    pub public_ssh_key: Vec<String>,
    #[serde(default)]
    pub password_hash: String,
}

/// What [`ArchiveState::cleanup_previous_run`] found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Leftover unlocked keys that were shredded.
    pub shredded: Vec<PathBuf>,
    /// Records whose file no longer existed.
    pub dangling: Vec<(String, PathBuf)>,
}

#[derive(Debug)]
pub struct ArchiveState {
    path: PathBuf,
    data: Map<String, Value>,
}

fn default_data() -> Map<String, Value> {
    let mut data = Map::new();
    data.insert(CURRENT_USER.into(), Value::Null);
    data.insert(
        CURRENT_USER_DATA.into(),
        serde_json::json!({ "public_ssh_key": [], "password_hash": "" }),
    );
    for key in TEMP_FILE_KEYS {
        data.insert(key.into(), Value::Null);
    }
    data.insert(BASE_IMAGES.into(), Value::Object(Map::new()));
    data.insert(SERVER_IMAGES.into(), Value::Object(Map::new()));
    data
}

impl ArchiveState {
    /// Load the state file, creating it with defaults on first access.
    pub fn open(path: &Path) -> ChillboxResult<Self> {
        if !path.exists() {
            let state = Self {
                path: path.to_path_buf(),
                data: default_data(),
            };
            state.write()?;
            tracing::debug!(path = %path.display(), "created state file");
            return Ok(state);
        }

        let content = std::fs::read(path)?;
        let data: Map<String, Value> =
            serde_json::from_slice(&content).map_err(|e| ChillboxError::InvalidStateFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Typed lookup. A missing key or a JSON `null` is `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> ChillboxResult<Option<T>> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                ChillboxError::InvalidStateFile {
                    path: self.path.clone(),
                    message: format!("{key}: {e}"),
                }
            }),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> ChillboxResult<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> ChillboxResult<()> {
        let value = serde_json::to_value(value).map_err(|e| anyhow::anyhow!(e))?;
        self.data.insert(key.to_string(), value);
        self.write()
    }

    pub fn delete(&mut self, key: &str) -> ChillboxResult<()> {
        self.data.remove(key);
        self.write()
    }

    fn write(&self) -> ChillboxResult<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;

        let json = serde_json::to_string_pretty(&self.data).map_err(|e| anyhow::anyhow!(e))?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    // ── typed helpers ──

    pub fn current_user(&self) -> ChillboxResult<Option<String>> {
        self.get(CURRENT_USER)
    }

    pub fn current_user_data(&self) -> ChillboxResult<CurrentUserData> {
        self.get_or(CURRENT_USER_DATA, CurrentUserData::default())
    }

    pub fn set_current_user_data(&mut self, data: &CurrentUserData) -> ChillboxResult<()> {
        self.set(CURRENT_USER_DATA, data)
    }

    pub fn temp_path(&self, key: &str) -> ChillboxResult<Option<PathBuf>> {
        self.get(key)
    }

    /// Recorded temp files that no longer exist.
    pub fn verify_temp_records(&self) -> ChillboxResult<Vec<(String, PathBuf)>> {
        let mut dangling = Vec::new();
        for key in TEMP_FILE_KEYS {
            if let Some(path) = self.temp_path(key)? {
                if !path.exists() {
                    dangling.push((key.to_string(), path));
                }
            }
        }
        Ok(dangling)
    }

    /// Deal with temp files a previous invocation left behind.
    ///
    /// An unlocked private key never outlives its run, so one still on disk
    /// is shredded. The other temp files (ssh identity, ssh config, env
    /// output) stay until their lock/clean command runs. Records pointing at
    /// missing files are reported and cleared.
    pub fn cleanup_previous_run(&mut self) -> ChillboxResult<CleanupReport> {
        let mut report = CleanupReport::default();

        for (key, path) in self.verify_temp_records()? {
            tracing::warn!(
                key = %key,
                path = %path.display(),
                "state records a temp file that no longer exists; clearing the record"
            );
            self.set(&key, Value::Null)?;
            report.dangling.push((key, path));
        }

        if let Some(path) = self.temp_path(LOCAL_PRIVATE_KEY_TEMP)? {
            tracing::warn!(path = %path.display(), "shredding an unlocked private key left by a previous run");
            shred_file(&path)?;
            self.set(LOCAL_PRIVATE_KEY_TEMP, Value::Null)?;
            report.shredded.push(path);
        }

        Ok(report)
    }

    /// Shred the temp file recorded under `key` and clear the record.
    pub fn shred_recorded(&mut self, key: &str) -> ChillboxResult<Option<PathBuf>> {
        let path = self.temp_path(key)?;
        if let Some(path) = &path {
            shred_file(path)?;
        }
        self.set(key, Value::Null)?;
        Ok(path)
    }
}

impl TempRecords for ArchiveState {
    fn record_temp(&mut self, key: &str, path: &Path) -> ChillboxResult<()> {
        self.set(key, path.to_string_lossy())
    }

    fn clear_temp(&mut self, key: &str) -> ChillboxResult<()> {
        self.set(key, Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_open_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statefile.json");
        let state = ArchiveState::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(state.current_user().unwrap(), None);
        assert_eq!(state.current_user_data().unwrap(), CurrentUserData::default());
        let images: BTreeMap<String, String> = state.get_or(BASE_IMAGES, BTreeMap::new()).unwrap();
        assert!(images.is_empty());
    }

    #[test]
    fn test_set_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statefile.json");
        {
            let mut state = ArchiveState::open(&path).unwrap();
            state.set(CURRENT_USER, "alice").unwrap();
            state
                .set_current_user_data(&CurrentUserData {
                    public_ssh_key: vec!["ssh-ed25519 AAAA alice".into()],
                    password_hash: String::new(),
                })
                .unwrap();
        }
        let state = ArchiveState::open(&path).unwrap();
        assert_eq!(state.current_user().unwrap().as_deref(), Some("alice"));
        assert_eq!(state.current_user_data().unwrap().public_ssh_key.len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_delete_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statefile.json");
        let mut state = ArchiveState::open(&path).unwrap();
        state.set(CURRENT_USER, "alice").unwrap();
        state.delete(CURRENT_USER).unwrap();
        assert_eq!(ArchiveState::open(&path).unwrap().current_user().unwrap(), None);
    }

    #[test]
    fn test_malformed_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statefile.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ArchiveState::open(&path).unwrap_err();
        assert!(matches!(err, ChillboxError::InvalidStateFile { .. }));
        // the broken file is left for the operator to inspect
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");

        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x7b]).unwrap();
        let err = ArchiveState::open(&path).unwrap_err();
        assert!(matches!(err, ChillboxError::InvalidStateFile { .. }));
    }

    #[test]
    fn test_state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statefile.json");
        ArchiveState::open(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_cleanup_shreds_leftover_key_and_clears_dangling() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ArchiveState::open(&dir.path().join("statefile.json")).unwrap();

        let leftover = dir.path().join("leftover-key");
        std::fs::write(&leftover, "AGE-SECRET-KEY-1").unwrap();
        state.record_temp(LOCAL_PRIVATE_KEY_TEMP, &leftover).unwrap();

        let ssh_config = dir.path().join("ssh_config");
        std::fs::write(&ssh_config, "Host web1").unwrap();
        state.record_temp(SSH_CONFIG_TEMP, &ssh_config).unwrap();

        state
            .record_temp(OUTPUT_ENV_TEMP, &dir.path().join("gone"))
            .unwrap();

        let report = state.cleanup_previous_run().unwrap();
        assert_eq!(report.shredded, vec![leftover.clone()]);
        assert_eq!(report.dangling.len(), 1);
        assert_eq!(report.dangling[0].0, OUTPUT_ENV_TEMP);

        assert!(!leftover.exists());
        assert!(ssh_config.exists());
        assert_eq!(state.temp_path(LOCAL_PRIVATE_KEY_TEMP).unwrap(), None);
        assert_eq!(state.temp_path(OUTPUT_ENV_TEMP).unwrap(), None);
        assert_eq!(state.temp_path(SSH_CONFIG_TEMP).unwrap(), Some(ssh_config));
        assert!(state.verify_temp_records().unwrap().is_empty());
    }
}
