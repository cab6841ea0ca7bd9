//! chillbox-archive: the local archive directory
//!
//! Holds the durable state file, turns configured paths into encrypted
//! archive entries, renders server user-data, and reads entries back out.

pub mod compress;
pub mod output_env;
pub mod processor;
pub mod render;
pub mod show;
pub mod state;
pub mod umask;
pub mod userdata;

pub use processor::{evaluate_path, template_context, BuildReport, PathProcessor};
pub use render::{Renderer, TemplateRenderer};
pub use state::{ArchiveState, CleanupReport, CurrentUserData};

use chillbox_core::{ArchiveLayout, ChillboxResult};

/// Remove the whole archive directory. This is the only way state is
/// deleted.
pub fn remove_archive(layout: &ArchiveLayout) -> ChillboxResult<bool> {
    let root = layout.root();
    if !root.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(root)?;
    tracing::info!(archive = %root.display(), "removed archive directory");
    Ok(true)
}
