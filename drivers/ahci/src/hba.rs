//! This module provides the register level interface to AHCI devices.
//! Documentation for registers within this module conforms to a general outline.
//!
//! First a mnemonic is provided that can help with identifying the field/register within the
//! specification documentation.
//!
//! An identifier as to how the field/register should be read/written.
//! - (RO) -- Read only; This field may not be modified by software.
//! - (RW) -- Read Write: Software may modify the field. Limitations may be imposed at to when
//!   software may write to the bit.
//! - (R1C) -- Read 1 Clear: Hardware may set the bit to `1` Software is not allowed to set the bit
//!   to `1`. Software may clear the bit to `0` wy writing `1`.
//! - (RW1) -- Read Write 1: Software may set the bit to `1` but cannot set the bit to `0`
//! - (CD) -- Check documentation for information about read/writing to this register
//!
//! This will be followed by normal documentation of the register/field.

use crate::hba::port_control::PortControl;
use core::ptr::NonNull;

pub(crate) mod command;
pub(crate) mod general_control;
pub(crate) mod port_control;

const _: () = {
    assert!(core::mem::offset_of!(HbaRegisters, vendor) == 0xa0);
    assert!(core::mem::offset_of!(HbaRegisters, ports) == 0x100);
    assert!(core::mem::size_of::<HbaRegisters>() == general_control::ABAR_SIZE);
};

/// Layout of the region pointed to by ABAR
#[repr(C)]
struct HbaRegisters {
    general: general_control::GeneralControl,
    _res: [u32; 29],
    /// Vendor specific registers are defined at the hardware level and must be identified by the
    /// vendor/device in the PCI configuration region
    vendor: [u8; 0x60],
    ports: [PortControl; 32],
}

/// References into the HBA register block. The mapping is never released, an AHCI controller is
/// in use for the life of the system.
#[derive(Copy, Clone)]
pub struct HostBusAdapter {
    pub(crate) general: &'static general_control::GeneralControl,
    pub(crate) ports: &'static [PortControl; 32],
}

impl HostBusAdapter {
    /// Constructs Self from a pointer to the HBA configuration region.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a mapping of ABAR at least [general_control::ABAR_SIZE] bytes long
    /// which is never unmapped.
    pub(crate) unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        let regs: &'static HbaRegisters = unsafe { &*ptr.as_ptr().cast() };
        Self {
            general: &regs.general,
            ports: &regs.ports,
        }
    }

    /// Returns a reference to the given port
    pub(crate) fn get_port(&self, port: u8) -> &'static PortControl {
        &self.ports[port as usize]
    }
}

/// Index of a command slot, always less than 32.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct CmdIndex {
    index: u8,
}

impl CmdIndex {
    pub fn new(index: u8) -> Option<Self> {
        if index < 32 {
            Some(Self { index })
        } else {
            None
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }
}

impl core::fmt::Display for CmdIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "slot {}", self.index)
    }
}
