//! Architecture-specific implementations for memory management.
//!
//! This module conditionally imports either hardware-specific implementations
//! or software emulation based on the target architecture and features.

use core::fmt;

use crate::{AccessKind, Protection};

// Use x86_64 hardware implementation when we're on x86_64 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
#[cfg_attr(any(test, feature = "software-emulation"), allow(dead_code))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled, OR
// - there is no hardware implementation for the target
#[cfg(any(test, feature = "software-emulation", not(target_arch = "x86_64")))]
mod software;
#[cfg(any(test, feature = "software-emulation", not(target_arch = "x86_64")))]
pub use self::software::*;

impl PageFlags {
    /// Returns the flags for a present, user-accessible leaf granting `protection`.
    ///
    /// Write access implies read access: no supported format can express a page that is
    /// writable but not readable.
    pub fn user(protection: Protection) -> Self {
        let mut flags = Self::empty();
        flags.set_user(true);
        flags.apply_protection(protection);
        flags
    }

    /// Rewrites the read, write and execute permissions to exactly `protection`.
    ///
    /// The copy-on-write marker is always cleared: an explicit grant of write access
    /// overrides pending copy-on-write, and withholding it leaves nothing pending.
    pub fn apply_protection(&mut self, protection: Protection) {
        self.set_readable(protection.readable() || protection.writable());
        self.set_writable(protection.writable());
        self.set_executable(protection.executable());
        self.set_cow(false);
        self.set_leaf_present();
    }

    /// Returns whether these flags let user code perform `access` without trapping.
    pub fn permits(self, access: AccessKind) -> bool {
        if !self.is_accessible() || !self.is_user() {
            return false;
        }
        match access {
            AccessKind::Read => self.is_readable(),
            AccessKind::Write => self.is_writable(),
            AccessKind::Execute => self.is_executable(),
        }
    }
}

/// Formats flags as a compact string such as `VRW-U-`, in the order valid, readable,
/// writable, executable, user, copy-on-write.
impl fmt::Display for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = [
            (self.is_accessible(), 'V'),
            (self.is_readable(), 'R'),
            (self.is_writable(), 'W'),
            (self.is_executable(), 'X'),
            (self.is_user(), 'U'),
            (self.is_cow(), 'C'),
        ];
        for (set, letter) in bits {
            write!(f, "{}", if set { letter } else { '-' })?;
        }
        Ok(())
    }
}
