//! `NAME='value'` env files for sourcing from other scripts:
//!
//! ```sh
//! set -a; . "$(chillbox output-env)"; set +a
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use chillbox_core::config::ChillboxConfig;
use chillbox_core::{shell, ChillboxResult};
use chillbox_secrets::{ShredGuard, TempRecords};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::state::{ArchiveState, OUTPUT_ENV_TEMP};

/// Sorted `NAME='value'` lines. Secrets are included only when given.
pub fn env_lines(
    config: &ChillboxConfig,
    secrets: Option<&BTreeMap<String, SecretString>>,
) -> Zeroizing<String> {
    let mut vars: BTreeMap<&str, &str> = BTreeMap::new();
    vars.insert("CHILLBOX_INSTANCE", &config.instance);
    let archive = config.archive_directory.to_string_lossy();
    vars.insert("CHILLBOX_ARCHIVE_DIRECTORY", &archive);
    for (k, v) in &config.env {
        vars.insert(k, v);
    }
    if let Some(secrets) = secrets {
        for (k, v) in secrets {
            vars.insert(k, v.expose_secret());
        }
    }

    let lines = vars
        .into_iter()
        .map(|(k, v)| format!("{k}={}", shell::quote(v)))
        .collect::<Vec<_>>();
    Zeroizing::new(lines.join("\n") + "\n")
}

/// Replace any previous env file with a new one and record it in state.
pub fn write_output_env(
    state: &mut ArchiveState,
    config: &ChillboxConfig,
    secrets: Option<&BTreeMap<String, SecretString>>,
) -> ChillboxResult<PathBuf> {
    state.shred_recorded(OUTPUT_ENV_TEMP)?;

    let file = tempfile::Builder::new()
        .prefix("chillbox-")
        .suffix(".chillbox.env")
        .tempfile()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    let guard = ShredGuard::new(&path);
    state.record_temp(OUTPUT_ENV_TEMP, &path)?;

    std::fs::write(guard.path(), env_lines(config, secrets).as_bytes())?;
    tracing::info!(path = %path.display(), sensitive = secrets.is_some(), "wrote env file");
    Ok(guard.into_path())
}

/// Shred the recorded env file, if any.
pub fn clean_output_env(state: &mut ArchiveState) -> ChillboxResult<Option<PathBuf>> {
    state.shred_recorded(OUTPUT_ENV_TEMP)
}
