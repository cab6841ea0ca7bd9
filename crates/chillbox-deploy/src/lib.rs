//! chillbox-deploy: getting archive content onto servers
//!
//! Everything here talks to a server through [`RemoteSession`]; the real
//! implementation drives the OpenSSH client binaries.

pub mod remote;
pub mod ssh;
pub mod upload;

pub use remote::{OpenSshSession, RemoteOutput, RemoteSession};
pub use ssh::{ensure_user_ssh_key, render_ssh_config, ssh_lock, ssh_unlock};
pub use upload::{DistributionReport, DistributionUploader};
