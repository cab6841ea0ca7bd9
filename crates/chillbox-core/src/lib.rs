pub mod config;
pub mod error;
pub mod shell;
pub mod types;

pub use config::ChillboxConfig;
pub use error::{ChillboxError, ChillboxResult, EntryFailure};
pub use types::{ArchiveLayout, Decision, Identity, SkipReason};
