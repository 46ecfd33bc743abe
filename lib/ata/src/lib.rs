//! ATA command set definitions used by SATA host controller drivers.
//!
//! This crate does not talk to hardware. It describes commands ([command::AtaCommand]), helps
//! compose the register values for them ([command::constructor]) and decodes the data returned
//! by `IDENTIFY DEVICE` ([structures::identification]).
#![cfg_attr(not(test), no_std)]

pub mod command;
pub mod structures;

/// ATA status register bits as reported in the task file.
pub mod status {
    /// ERR
    pub const ERROR: u8 = 1;
    /// DRQ
    pub const DATA_REQUEST: u8 = 1 << 3;
    /// DF
    pub const DEVICE_FAULT: u8 = 1 << 5;
    /// DRDY
    pub const READY: u8 = 1 << 6;
    /// BSY
    pub const BUSY: u8 = 1 << 7;
}
