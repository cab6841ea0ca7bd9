//! Materializes configured path entries into `path/{id}` as compressed
//! ciphertext encrypted to the local instance key.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chillbox_core::config::{Context, PathEntry, PathSource};
use chillbox_core::{
    ArchiveLayout, ChillboxError, ChillboxResult, Decision, EntryFailure, Identity, SkipReason,
};
use chillbox_secrets::tool::read_key_file;
use chillbox_secrets::{CryptoTool, UnlockedKey};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::compress::{gzip_bytes, gzip_file, tar_gz_dir};
use crate::render::{merge_contexts, Renderer};
use crate::umask::UmaskGuard;

/// Entries owned by someone else are left out of this operator's archive.
pub fn evaluate_path(entry: &PathEntry, identity: &Identity) -> Decision {
    if identity.may_access(entry.owner.as_deref()) {
        Decision::Process
    } else {
        Decision::Skip(SkipReason::NotOwner {
            owner: entry.owner.clone(),
        })
    }
}

/// Base template context: env values overlaid with decrypted secrets.
pub fn template_context(
    env: &BTreeMap<String, String>,
    secrets: &BTreeMap<String, SecretString>,
) -> Context {
    let mut context = Context::new();
    for (k, v) in env {
        context.insert(k.clone(), Value::String(v.clone()));
    }
    for (k, v) in secrets {
        context.insert(k.clone(), Value::String(v.expose_secret().to_string()));
    }
    context
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub written: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct PathProcessor<'a> {
    layout: &'a ArchiveLayout,
    crypto: &'a dyn CryptoTool,
    renderer: &'a dyn Renderer,
    identity: &'a Identity,
}

impl<'a> PathProcessor<'a> {
    pub fn new(
        layout: &'a ArchiveLayout,
        crypto: &'a dyn CryptoTool,
        renderer: &'a dyn Renderer,
        identity: &'a Identity,
    ) -> Self {
        Self {
            layout,
            crypto,
            renderer,
            identity,
        }
    }

    /// Process every entry, collecting per-entry failures into one
    /// [`ChillboxError::ArchiveDirectory`].
    pub fn build_archive(
        &self,
        paths: &[PathEntry],
        base_context: &Context,
        key: &UnlockedKey,
    ) -> ChillboxResult<BuildReport> {
        let _umask = UmaskGuard::owner_only();

        let public_key = read_key_file(&self.layout.public_key())?;
        let private_key = key.private_key()?;
        std::fs::create_dir_all(self.layout.paths_dir())?;

        let mut report = BuildReport::default();
        let mut failures = Vec::new();

        for entry in paths {
            if let Decision::Skip(reason) = evaluate_path(entry, self.identity) {
                tracing::info!(path_id = %entry.id, "skipping path: {reason}");
                report.skipped.push(entry.id.clone());
                continue;
            }

            let result = self.payload(entry, base_context).and_then(|payload| {
                let dest = self.layout.path(&entry.id);
                if self.unchanged(&dest, &private_key, &payload) {
                    return Ok(false);
                }
                let ciphertext = self.crypto.encrypt(&public_key, &payload)?;
                write_atomic(&dest, &ciphertext)?;
                Ok(true)
            });

            match result {
                Ok(true) => {
                    tracing::info!(path_id = %entry.id, "added path to archive");
                    report.written.push(entry.id.clone());
                }
                Ok(false) => {
                    tracing::debug!(path_id = %entry.id, "path unchanged");
                    report.unchanged.push(entry.id.clone());
                }
                Err(e) => {
                    tracing::warn!(path_id = %entry.id, "failed to process path: {e}");
                    failures.push(EntryFailure::new(&entry.id, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(ChillboxError::ArchiveDirectory {
                message: "failed to process all paths into the archive".into(),
                failures,
            });
        }
        Ok(report)
    }

    /// Compressed plaintext for one entry.
    fn payload(&self, entry: &PathEntry, base_context: &Context) -> ChillboxResult<Vec<u8>> {
        match &entry.src {
            PathSource::Template(template) => {
                let context = merge_contexts([base_context, &entry.context]);
                let text = self
                    .renderer
                    .render(template, &context)
                    .map_err(missing_template_is_config_error)?;
                Ok(gzip_bytes(text.as_bytes())?)
            }
            PathSource::TemplateFile(path) => {
                let context = merge_contexts([base_context, &entry.context]);
                let text = self
                    .renderer
                    .render_file(path, &context)
                    .map_err(missing_template_is_config_error)?;
                Ok(gzip_bytes(text.as_bytes())?)
            }
            PathSource::File(path) => Ok(gzip_file(path).map_err(|e| {
                ChillboxError::MissingFile(format!("{}: {e}", path.display()))
            })?),
            PathSource::Directory(dir) => {
                let top = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| entry.id.clone());
                Ok(tar_gz_dir(dir, &top)?)
            }
        }
    }

    /// True when `dest` already decrypts to exactly `payload`.
    fn unchanged(&self, dest: &Path, private_key: &SecretString, payload: &[u8]) -> bool {
        let Ok(existing) = std::fs::read(dest) else {
            return false;
        };
        match self.crypto.decrypt(private_key, &existing) {
            Ok(plaintext) => plaintext.as_slice() == payload,
            Err(e) => {
                tracing::warn!(path = %dest.display(), "existing archive file does not decrypt, replacing it: {e}");
                false
            }
        }
    }
}

fn missing_template_is_config_error(err: ChillboxError) -> ChillboxError {
    match err {
        ChillboxError::MissingFile(message) => ChillboxError::InvalidConfig(message),
        other => other,
    }
}

pub(crate) fn write_atomic(dest: &Path, data: &[u8]) -> ChillboxResult<()> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    let tmp = parent.join(format!(
        ".{}.tmp",
        dest.file_name().unwrap_or_default().to_string_lossy()
    ));
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(&tmp, dest)?;
    Ok(())
}
