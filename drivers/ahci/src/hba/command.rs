pub mod frame_information_structure;

use crate::register::*;
use frame_information_structure as fis;

/// Number of PRDT entries in each command table.
pub(crate) const PRDT_LEN: usize = 8;
/// Maximum number of bytes described by a single PRD.
pub(crate) const MAX_PRD_BYTES: u32 = 1 << 22;

const _: () = {
    assert!(core::mem::size_of::<CommandHeader>() == 32);
    assert!(core::mem::size_of::<PhysicalRegionDescription>() == 16);
    assert!(core::mem::offset_of!(CommandTable, prdt) == 0x80);
    assert!(core::mem::size_of::<CommandTable>() == 0x80 + 16 * PRDT_LEN);
};

/// An entry in the command list. PxCLB points to an array of 32 of these, where index `n`
/// describes command slot `n`.
#[repr(C)]
pub struct CommandHeader {
    description_info: Register<DescriptionInformation>,
    /// PRDBC
    ///
    /// Updated by the HBA with the number of bytes transferred.
    byte_count: Register<u32>,
    /// This field contains the physical address of the command table for this entry
    command_table_base_addr: HbaAddr<128>,
    _res: [u32; 4],
}

impl CommandHeader {
    /// Assigns a new [CommandTable] to self.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the `addr` contains the physical address of a valid command
    /// table.
    pub(crate) unsafe fn set_table(&self, addr: u64) {
        // Prevents a shorter table being read with the old length.
        self.description_info.write(DescriptionInformation::empty());
        self.command_table_base_addr.set(addr);
    }

    pub(crate) fn table_addr(&self) -> u64 {
        self.command_table_base_addr.read()
    }

    /// Configures this header for a new command. The FIS length is taken from the H2D register
    /// FIS.
    ///
    /// # Panics
    ///
    /// This fn will panic if `prdt_len` exceeds [PRDT_LEN]
    pub(crate) fn prepare(&self, prdt_len: u16, write: bool) {
        assert!(prdt_len as usize <= PRDT_LEN);
        let mut d = DescriptionInformation::empty();
        d.set_command_fis_len(fis::RegisterHostToDevFis::LEN_DWORDS);
        d.set(DescriptionInformation::WRITE, write);
        // prefetching is only allowed when not using NCQ
        d.set(DescriptionInformation::PREFETCHABLE, prdt_len != 0);
        d.set_prdt_len(prdt_len);
        self.byte_count.write(0);
        self.description_info.write(d);
    }

    /// Returns the number of bytes transferred by the last command in this slot.
    pub(crate) fn bytes_transferred(&self) -> u32 {
        self.byte_count.read()
    }

    pub(crate) fn description(&self) -> DescriptionInformation {
        self.description_info.read()
    }
}

bitflags::bitflags! {
    /// DW 0 (RW)
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub(crate) struct DescriptionInformation: u32 {
        /// C
        ///
        /// When set the HBA shall clear the busy flag in the task file register and the PxCI bit
        /// corresponding to this command slot after the FIS is sent and R_OK is received.
        const CLEAR_BUSY_ON_OK = 1 << 10;
        /// B
        ///
        /// Indicates that the command is for sending a BIST FIS. The HBA shall send the FIS and
        /// enter test mode.
        const BIST = 1 << 9;
        /// R
        ///
        /// Indicates that the command is for a part of a software reset sequence tha manipulates
        /// the SRST bit in the device control register. The HBA must perform a SYNC escape if
        /// necessary to get the device into an idle state before sending the command.
        const RESET = 1 << 8;
        /// P
        ///
        /// only valid when PRDTL is Non-Zero or [Self::ATAPI] is set.
        ///
        /// When PRDTL is non-zero the HBA may prefetch PRDs in anticipation of a data transfer.
        ///
        /// When [Self::ATAPI] is set the HBA may prefetch the ATAPI command.
        ///
        /// This may not be set when Native command queueing or FIS-based switching is being used.
        const PREFETCHABLE = 1 << 7;
        /// W
        ///
        /// Indicates the the HBA will send fis data to the device. When cleared this is a read. When this bit
        /// and [Self::PREFETCHABLE] is set the HBA may prefetch data.
        const WRITE = 1 << 6;
        /// A
        ///
        /// Indicates that a PIO setup FIS shall be sent by the device indicating a transfer for the
        /// ATAPI command.
        const ATAPI = 1 << 5;

        const _ = !(1 << 11);
    }
}

// SAFETY: bit 11 is the only reserved bit
unsafe impl ClearReserved for DescriptionInformation {
    fn clear_reserved(&mut self) {
        *self = Self::from_bits_truncate(self.bits());
    }
}

impl DescriptionInformation {
    /// CFL
    ///
    /// Gets the length of the FIS in dwords.
    pub fn get_command_fis_len(&self) -> u8 {
        (self.bits() & 0x1f) as u8
    }

    /// Sets the FIS length in dwords.
    ///
    /// # Panics
    ///
    /// This fn will panic if `len` is 1 or 0 or greater than 16
    pub fn set_command_fis_len(&mut self, len: u8) {
        assert!(len > 1, "Illegal FIS Size: {} ", len);
        assert!(len <= 16, "Illegal FIS Size: {}", len);
        let mut t = self.bits();
        t &= !0x1f;
        t |= len as u32;
        *self = Self::from_bits_retain(t)
    }

    /// PRDTL
    pub fn get_prdt_len(&self) -> u16 {
        (self.bits() >> 16) as u16
    }

    pub fn set_prdt_len(&mut self, len: u16) {
        let mut t = self.bits();
        t &= 0xffff;
        t |= (len as u32) << 16;
        *self = Self::from_bits_retain(t)
    }
}

/// This struct is the Command Table defined in the AHCI specification.
///
/// The table is allocated with a fixed PRDT length of [PRDT_LEN].
#[repr(C, align(128))]
pub(crate) struct CommandTable {
    /// This contains the frame information structure that will be sent to the device.
    pub(crate) command_fis: CommandBuff,
    /// This is reserved for ATAPI commands
    _atapi_cmd: [u8; 16],
    _res: [u8; 0x30],
    /// This table contains the Physical Region Descriptor Table
    prdt: [PhysicalRegionDescription; PRDT_LEN],
}

impl CommandTable {
    /// Sets PRD `index`.
    ///
    /// # Panics
    ///
    /// This fn will panic if `index >= PRDT_LEN`
    pub(crate) fn set_prd(&mut self, index: usize, prd: PhysicalRegionDescription) {
        // SAFETY: The pointer is derived from a reference
        unsafe { core::ptr::write_volatile(&mut self.prdt[index], prd) }
    }

    #[cfg(test)]
    pub(crate) fn prd(&self, index: usize) -> PhysicalRegionDescription {
        self.prdt[index]
    }
}

#[repr(C)]
pub(crate) struct CommandBuff {
    buff: [u8; 64],
}

impl CommandBuff {
    /// Writes `fis` into the command FIS area. Remaining bytes are zeroed.
    pub(crate) fn send_cmd(&mut self, fis: &fis::RegisterHostToDevFis) {
        let mut raw = [0u8; 64];
        raw[..20].copy_from_slice(&fis.as_bytes());
        // SAFETY: The pointer is derived from a reference
        unsafe { core::ptr::write_volatile(&mut self.buff, raw) };
    }

    #[cfg(test)]
    pub(crate) fn bytes(&self) -> &[u8; 64] {
        &self.buff
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct PhysicalRegionDescription {
    /// DBA:DBAU bit 0 is reserved
    base_addr: u64,
    _res: u32,
    data_count: PhysicalDataCount,
}

impl PhysicalRegionDescription {
    /// Attempts to create a new Self using the start address and the size in bytes of the region
    ///
    /// Returns `None` if `len` is not an even number between `2` and 4MiB or `start` is not
    /// aligned to `2`
    pub(crate) fn new(start: u64, len: u32) -> Option<Self> {
        if start & 1 != 0 {
            return None;
        }
        Some(Self {
            base_addr: start,
            _res: 0,
            data_count: PhysicalDataCount::new(len)?,
        })
    }

    pub(crate) fn addr(&self) -> u64 {
        self.base_addr
    }

    pub(crate) fn len(&self) -> u32 {
        self.data_count.count()
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct PhysicalDataCount {
    inner: u32,
}

impl PhysicalDataCount {
    /// Creates a new instance of Self. `count` must be less than or equal to 4MiB and must be
    /// an even number.
    fn new(count: u32) -> Option<Self> {
        if count == 0 || count > MAX_PRD_BYTES || (count & 1 != 0) {
            None
        } else {
            let mut t = Self { inner: 0 };
            t.set_data_count(count);
            Some(t)
        }
    }

    /// Sets the length of the physical region to `count`. The maximum length is 4MiB
    ///
    /// The HBA adds one to the actual value in this field and so is subtracted by one before writing.
    fn set_data_count(&mut self, mut count: u32) {
        count -= 1;
        self.inner &= !((1 << 22) - 1);
        self.inner |= count;
    }

    fn count(&self) -> u32 {
        (self.inner & ((1 << 22) - 1)) + 1
    }
}

/// Command list page layout. The command list occupies the start of the page and the received
/// FIS area follows it.
pub(crate) const CMD_LIST_OFFSET: usize = 0;
pub(crate) const RECEIVED_FIS_OFFSET: usize = 0x400;

const _: () = {
    assert!(core::mem::size_of::<[CommandHeader; 32]>() == RECEIVED_FIS_OFFSET);
    assert!(RECEIVED_FIS_OFFSET + core::mem::size_of::<fis::ReceivedFis>() <= 4096);
};
