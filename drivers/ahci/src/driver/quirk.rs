//! Controller specific workarounds.

use crate::ResetMode;

/// PCI vendor ID of Intel
const INTEL: u16 = 0x8086;

/// Devices which do not bring up the link unless each port is reset with a COMRESET.
const FORCE_COMPLETE_RESET: &[(u16, u16)] = &[
    // 5 Series/3400 Series SATA AHCI
    (INTEL, 0x3b22),
];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResetQuirk {
    None,
    /// Ports must always be reset with [ResetMode::Complete]
    ForceCompleteReset,
}

impl ResetQuirk {
    pub fn for_device(vendor: u16, device: u16) -> Self {
        if FORCE_COMPLETE_RESET.contains(&(vendor, device)) {
            Self::ForceCompleteReset
        } else {
            Self::None
        }
    }

    /// Returns the reset mode which must be used when `requested` is configured.
    pub fn effective_mode(&self, requested: ResetMode) -> ResetMode {
        match self {
            Self::None => requested,
            Self::ForceCompleteReset => ResetMode::Complete,
        }
    }
}
