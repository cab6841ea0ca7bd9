use nix::sys::stat::{umask, Mode};

/// Tightens the process umask to owner-only until dropped.
#[derive(Debug)]
pub struct UmaskGuard {
    previous: Mode,
}

impl UmaskGuard {
    pub fn owner_only() -> Self {
        Self::set(Mode::from_bits_truncate(0o077))
    }

    pub fn set(mask: Mode) -> Self {
        let previous = umask(mask);
        Self { previous }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.previous);
    }
}
