//! Driver for AHCI 1.x SATA host bus adapters.
//!
//! The controller is brought up by [driver::AhciController], which groups the implemented ports
//! by interrupt line into [driver::handler::PortHandler]s. Each port exposes ATA disks through
//! [driver::block::AhciDiskDevice].

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod bitfield;
pub mod driver;
pub(crate) mod hba;
pub(crate) mod register;

pub use driver::kernel_if::KernelServices;

/// This enum is to represent the last known link state of a port.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum LinkState {
    /// The port is not implemented by the hba
    NotImplemented,
    /// No device has been detected connected to this port
    None,
    /// A device is present but phy communication has not been established.
    Present,
    /// A device has been detected by cold presence detection.
    ///
    /// This state is only valid when the port supports cold presence detection. Otherwise the state will be [Self::None]
    Cold,
    /// A device is connected and is in a low power state which cannot respond to all commands.
    Warm,
    /// A device is connected and ready to receive commands.
    Hot,
}

/// Type of device attached to a port, determined from PxSIG.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum DeviceType {
    Sata,
    Satapi,
    /// Enclosure management bridge
    Semb,
    PortMultiplier,
    Unknown,
}

/// Determines how ports are brought up when the controller is initialized.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ResetMode {
    /// Every port is reset with a COMRESET.
    Complete,
    /// Ports are rebased and started without resetting the attached device.
    ControllerOnly,
}

/// Driver configuration.
#[derive(Debug, Copy, Clone)]
pub struct AhciConfig {
    pub reset_mode: ResetMode,
    /// Deadline for a single read, write or flush command.
    pub command_timeout_ms: u64,
    /// Deadline for IDENTIFY DEVICE during initialization.
    pub identify_timeout_ms: u64,
    /// Size of the data buffer for each command slot. Larger transfers are split.
    pub slot_buffer_pages: usize,
    /// When false the controller must be serviced with [driver::AhciController::poll].
    pub use_interrupts: bool,
}

impl Default for AhciConfig {
    fn default() -> Self {
        Self {
            reset_mode: ResetMode::Complete,
            command_timeout_ms: 5000,
            identify_timeout_ms: 256,
            slot_buffer_pages: 16,
            use_interrupts: true,
        }
    }
}

/// Errors which prevent the controller from being brought up.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum AhciError {
    /// The PCI function is not an AHCI 1.x controller.
    NotAhci,
    /// BAR 5 is not implemented.
    MissingAbar,
    /// The register block could not be mapped.
    MapFailed,
    /// The firmware did not release the controller.
    FirmwareHandoffTimeout,
    /// GHC.HR did not clear.
    ResetTimeout,
    /// Interrupts were requested but no interrupt lines were given.
    NoIrq,
    /// The kernel refused to register an interrupt handler.
    IrqRegistration,
}

impl core::fmt::Display for AhciError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            AhciError::NotAhci => "not an AHCI controller",
            AhciError::MissingAbar => "BAR 5 not implemented",
            AhciError::MapFailed => "failed to map ABAR",
            AhciError::FirmwareHandoffTimeout => "firmware did not release the HBA",
            AhciError::ResetTimeout => "HBA reset timed out",
            AhciError::NoIrq => "no interrupt line available",
            AhciError::IrqRegistration => "interrupt registration failed",
        };
        f.write_str(s)
    }
}
