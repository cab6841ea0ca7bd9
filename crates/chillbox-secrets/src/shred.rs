//! Secure erasure of plaintext temp files.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chillbox_core::ChillboxResult;
use rand::RngCore;

const RANDOM_PASSES: usize = 3;
const CHUNK: usize = 64 * 1024;

/// Overwrite a file with random bytes, then zeros, sync, and unlink it.
///
/// A missing file is not an error.
pub fn shred_file(path: &Path) -> ChillboxResult<()> {
    let len = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => {
            std::fs::remove_file(path)?;
            return Ok(());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut file = OpenOptions::new().write(true).open(path)?;
    let mut buf = vec![0u8; CHUNK];
    let mut rng = rand::thread_rng();

    for pass in 0..=RANDOM_PASSES {
        file.seek(SeekFrom::Start(0))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            if pass < RANDOM_PASSES {
                rng.fill_bytes(&mut buf[..n]);
            } else {
                buf[..n].fill(0);
            }
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    drop(file);

    std::fs::remove_file(path)?;
    tracing::debug!(path = %path.display(), "shredded");
    Ok(())
}

/// Create an owner-only temp file that outlives its handle. The caller is
/// responsible for shredding it.
pub fn private_temp_file(prefix: &str) -> ChillboxResult<PathBuf> {
    let file = tempfile::Builder::new().prefix(prefix).tempfile()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Owns a plaintext temp file and shreds it when dropped.
#[derive(Debug)]
pub struct ShredGuard {
    path: Option<PathBuf>,
}

impl ShredGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Create a new owner-only temp file and guard it.
    pub fn temp(prefix: &str) -> ChillboxResult<Self> {
        Ok(Self::new(private_temp_file(prefix)?))
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Shred now, reporting any failure.
    pub fn shred(mut self) -> ChillboxResult<()> {
        match self.path.take() {
            Some(path) => shred_file(&path),
            None => Ok(()),
        }
    }

    /// Stop guarding the file and hand its path to the caller.
    pub fn into_path(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for ShredGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = shred_file(&path) {
                tracing::warn!(path = %path.display(), "failed to shred temp file: {e}");
            }
        }
    }
}
