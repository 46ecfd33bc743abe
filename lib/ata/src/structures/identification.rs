use core::fmt::{Debug, Display, Formatter};

const _ASSERT: () = {
    assert!(core::mem::size_of::<DeviceIdentity>() == 512);
    assert!(core::mem::offset_of!(DeviceIdentity, lba_28) == 60 * 2);
    assert!(core::mem::offset_of!(DeviceIdentity, features) == 82 * 2);
    assert!(core::mem::offset_of!(DeviceIdentity, logical_sectors) == 100 * 2);
    assert!(core::mem::offset_of!(DeviceIdentity, sector_geom) == 106 * 2);
    assert!(core::mem::offset_of!(DeviceIdentity, logical_sector_size) == 117 * 2);
    assert!(core::mem::offset_of!(DeviceIdentity, sector_alignment) == 209 * 2);
};

/// This struct is returned by [crate::command::AtaCommand::IDENTIFY_DEVICE]. It represents the
/// current device configuration most contained values are static but some may be changed.
/// This struct cannot be used configure the device.
///
/// Only the words used to operate a disk are named, the remaining words are kept as reserved
/// padding so the layout matches the 256 word response.
#[repr(C)]
#[derive(Clone)]
pub struct DeviceIdentity {
    pub general_cfg: GeneralCfg,
    ob0: u16,
    pub specific_cfg: u16,
    ob1: [u16; 7],
    pub serial: AtaString<20>,
    re0: [u16; 3],
    pub firmware_vers: AtaString<8>,
    pub model_num: AtaString<40>,
    ob2: [u16; 2],
    pub capabilities: Capabilities,
    pub cap_50: u16,
    ob3: [u16; 2],
    pub wd_53: u16,
    ob4: [u16; 6],
    /// Words 60..62. Total number of user addressable sectors for 28bit commands
    pub lba_28: u32,
    ob5: [u16; 13],
    pub queue_depth: u16,
    pub sata_cap: u16,
    pub sata_cap2: u16,
    pub sata_features: u16,
    pub sata_features_en: u16,
    pub major_version: u16,
    pub minor_version: u16,
    /// Words 82..85
    pub features: FeaturesSet,
    /// Words 85..88
    pub features_enabled: FeaturesSet,
    pub ultra_dma: u16,
    re1: [u16; 11],
    /// Words 100..104. Total number of user addressable sectors for 48bit commands
    pub logical_sectors: u64,
    re2: [u16; 2],
    pub sector_geom: SectorGeom,
    re3: [u16; 10],
    pub logical_sector_size: LbaSize, // count in words not bytes
    re4: [u16; 90],
    pub sector_alignment: SectorAlignment,
    re5: [u16; 45],
    checksum: Integrity,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct FeaturesSet {
    pub features_82: Features82,
    pub features_83: Features83,
    pub features_84: u16,
}

impl DeviceIdentity {
    /// Decodes the response from the 256 little endian words returned by the device.
    pub fn from_words(words: &[u16; 256]) -> Self {
        let mut bytes = [0u8; 512];
        for (i, w) in words.iter().enumerate() {
            bytes[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
        }
        Self::from_bytes(&bytes)
    }

    /// Decodes the response from the raw 512 byte buffer written by the device.
    ///
    /// The device writes the response in little endian order, this is only correct on little
    /// endian hosts.
    pub fn from_bytes(bytes: &[u8; 512]) -> Self {
        // SAFETY: Self is repr(C), exactly 512 bytes and every field is valid for all bit patterns.
        unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast()) }
    }

    /// Returns true on a good checksum, otherwise returns false.
    /// Devices which do not implement the checksum report a signature other than `0xa5`, in this
    /// case this returns true.
    ///
    /// If this fn returns false this may indicate a hardware failure on the HBA cable or device.
    pub fn checksum(&self) -> bool {
        if self.checksum.validity != 0xa5 {
            return true;
        }

        // SAFETY: Self is 512 bytes of plain data.
        let arr = unsafe { &*(self as *const _ as *const [u8; 512]) };
        arr.iter().fold(0u8, |sum, i| sum.wrapping_add(*i)) == 0
    }

    /// Returns the general config of the device
    pub fn get_general_config(&self) -> GeneralCfg {
        self.general_cfg
    }

    /// Returns the Specific config of the device indicating weather or not the device requires powering up
    pub fn get_specific_cfg(&self) -> SpecificCfg {
        match self.specific_cfg {
            0x37c8 => SpecificCfg::ReqSpinUpInCom,
            0x738c => SpecificCfg::ReqSpinUpCom,
            0x8c73 => SpecificCfg::NoSpinUpInCom,
            0xc837 => SpecificCfg::NoSpinUpCom,
            r => SpecificCfg::Reserved(r),
        }
    }

    /// Returns whether the device supports the 48bit address feature set.
    pub fn supports_lba48(&self) -> bool {
        self.features.features_83.contains(Features83::LBA_48)
    }

    /// Returns whether word 106 contains valid data.
    ///
    /// Word 106 is valid when bit 14 is set and bit 15 is clear.
    pub fn sector_geom_valid(&self) -> bool {
        self.sector_geom.bits() >> 14 == 1
    }

    /// Returns the number of addressable logical sectors. Devices supporting 48bit addressing
    /// report words 100..104, otherwise words 60..62 are used.
    pub fn addressable_sectors(&self) -> u64 {
        if self.supports_lba48() {
            self.logical_sectors & 0xffff_ffff_ffff
        } else {
            self.lba_28 as u64
        }
    }

    pub fn get_device_geometry(&self) -> DeviceGeometry {
        let mut logical_sec_size = 512;
        let mut phys_sec_size = 512;
        let mut alignment = 0;

        if self.sector_geom_valid() {
            if self.sector_geom.contains(SectorGeom::LOGICAL_GREATHER_512_BYTES) {
                let words = self.logical_sector_size.read();
                if words != 0 {
                    logical_sec_size = words << 1; // converts from words to bytes
                }
            }

            phys_sec_size = logical_sec_size as u64;
            if self.sector_geom.contains(SectorGeom::MULTIPLE_LOGICAL_PER_PHYS) {
                phys_sec_size <<= self.sector_geom.log_sec_per_phys_exp();
                alignment = self.sector_alignment.get_alignment();
            }
        }

        DeviceGeometry {
            sector_count: self.addressable_sectors(),
            logical_sec_size,
            phys_sec_size,
            alignment,
        }
    }
}

impl Debug for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("model", &self.model_num)
            .field("serial", &self.serial)
            .field("firmware", &self.firmware_vers)
            .field("lba48", &self.supports_lba48())
            .field("geometry", &self.get_device_geometry())
            .finish()
    }
}

/// Contains the device geometry.
///
/// - Logical sectors are the blocks which are addressed by software.
/// - Physical sectors are the blocks accessed by hardware.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceGeometry {
    sector_count: u64,
    /// This field contains the size of each LBA
    pub logical_sec_size: u32,
    /// This field contains the physical size of each sector in the device.
    /// Operations should be aligned to physical sector boundaries for optimal performance.
    pub phys_sec_size: u64,

    alignment: u16,
}

impl DeviceGeometry {
    /// Gets the number of logical sectors on the device.
    pub fn lba_count(&self) -> u64 {
        self.sector_count
    }

    /// Gets size in bytes of the logical sectors on the device.
    pub fn logical_sec_size(&self) -> u32 {
        self.logical_sec_size
    }

    /// Gets the size in bytes of the physical sectors the device.
    pub fn phys_sec_size(&self) -> u64 {
        self.phys_sec_size
    }

    /// Returns the offset of the first lba into the first physical sector.
    ///
    /// For example a device with 4K physical sectors where this value is
    ///
    /// - 0: LBA 0 is the start of the first physical sector.
    /// - 1: LBA 0 starts at byte 512 if the first physical sector.
    pub fn get_alignment(&self) -> u16 {
        self.alignment
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug)]
pub struct GeneralCfg(u16);

impl GeneralCfg {
    pub fn is_ata(&self) -> bool {
        self.0 & (1 << 15) == 0
    }

    pub fn is_complete(&self) -> bool {
        self.0 & (1 << 2) == 0
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SpecificCfg {
    /// Device requires spin up, identification data is incomplete.
    ReqSpinUpInCom,
    /// Device Requires spin up and identification data is complete.
    ReqSpinUpCom,
    /// Device does not require spin up, identification data is incomplete.
    NoSpinUpInCom,
    /// Device does not require spin up and identification data is complete.
    NoSpinUpCom,
    Reserved(u16),
}

/// ATA strings are stored as big endian byte pairs padded with spaces.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct AtaString<const N: usize>([u8; N]);

impl<const N: usize> AtaString<N> {
    /// Returns the string in byte order, including trailing padding.
    pub fn bytes(&self) -> [u8; N] {
        let mut out = self.0;
        for pair in out.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
        out
    }
}

impl<const N: usize> Display for AtaString<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let b = self.bytes();
        let s = core::str::from_utf8(&b).unwrap_or("<invalid>");
        f.write_str(s.trim())
    }
}

impl<const N: usize> Debug for AtaString<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone)]
    #[repr(transparent)]
    pub struct Capabilities: u16 {
        const STANDBY_TIMER = 1 << 13;
        const IORDY = 1 << 11;
        const IORDY_DISABLE = 1 << 10;
        const LBA = 1 << 9;
        const DMA = 1 << 8;
    }

    #[derive(Debug, Copy, Clone)]
    #[repr(transparent)]
    pub struct Features82: u16 {
        const NOP = 1 << 14;
        const READ_BUFFER = 1 << 13;
        const WRITE_BUFFER = 1 << 12;
        const DEVICE_RESET = 1 << 9;
        const LOOK_AHEAD = 1 << 6;
        const VOLATILE_WRITE_CACHE = 1 << 5;
        const PACKET_FEATURES = 1 << 4;
        const POWER_MANAGEMENT_FEATURES = 1 << 3;
        const SECUTITY_FEATURES = 1 << 1;
        const SMART = 1;
    }

    #[derive(Debug, Copy, Clone)]
    #[repr(transparent)]
    pub struct Features83: u16 {
        const FLUSH_CACHE_EXT = 1 << 13;
        const FLUSH_CACHE = 1 << 12;
        const LBA_48 = 1 << 10;
        /// Set features is required to spin up the disk
        const SET_FEATURES_REQUIRED = 1 << 6;
        const PUIS = 1 << 5;
        const APM = 1 << 3;
        const DOWNLOAD_MICROCODE = 1;
    }

    /// Word 106
    #[derive(Debug, Copy, Clone)]
    #[repr(transparent)]
    pub struct SectorGeom: u16 {
        const VALID = 1 << 14;
        const MULTIPLE_LOGICAL_PER_PHYS = 1 << 13;
        const LOGICAL_GREATHER_512_BYTES = 1 << 12;
        const _ = !0;
    }
}

impl SectorGeom {
    /// Returns `n` where `2^n` logical sectors are contained in each physical sector.
    pub fn log_sec_per_phys_exp(&self) -> u16 {
        self.bits() & 0xf
    }

    pub fn log_sec_per_phys(&self) -> u16 {
        1 << self.log_sec_per_phys_exp()
    }
}

// required for misaligned read of u32
#[repr(C)]
#[derive(Copy, Clone)]
pub struct LbaSize {
    lba_low: u16,
    lba_high: u16,
}

impl Debug for LbaSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let mut fmt = Formatter::debug_struct(f, core::any::type_name::<Self>());
        fmt.field("len", &self.read());
        fmt.finish()
    }
}

impl LbaSize {
    /// Returns the logical sector size in words.
    pub fn read(&self) -> u32 {
        let t = self.lba_low as u32;
        t | (self.lba_high as u32) << 16
    }
}

/// Word 209
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub struct SectorAlignment(u16);

impl SectorAlignment {
    /// This value is the number of logical sectors between the beginning of physical sector 0 and LBA 0
    fn get_alignment(&self) -> u16 {
        if self.0 >> 14 == 1 { self.0 & 0x3fff } else { 0 }
    }
}

#[derive(Debug, Copy, Clone)]
#[repr(C)]
struct Integrity {
    validity: u8,
    checksum: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    const W106_VALID: u16 = 1 << 14;

    fn lba48_words() -> [u16; 256] {
        let mut words = [0u16; 256];
        words[83] = 1 << 10;
        words[100] = 0x5678;
        words[101] = 0x1234;
        words
    }

    #[test]
    fn physical_sector_from_ratio() {
        let mut words = lba48_words();
        words[106] = W106_VALID | (1 << 12) | (1 << 13) | 3;
        words[117] = 256;

        let geom = DeviceIdentity::from_words(&words).get_device_geometry();
        assert_eq!(geom.logical_sec_size(), 512);
        assert_eq!(geom.phys_sec_size(), 4096);
        assert_eq!(geom.lba_count(), 0x1234_5678);
    }

    #[test]
    fn large_logical_sectors() {
        let mut words = lba48_words();
        words[106] = W106_VALID | (1 << 12);
        words[117] = 2048;

        let geom = DeviceIdentity::from_words(&words).get_device_geometry();
        assert_eq!(geom.logical_sec_size(), 4096);
        assert_eq!(geom.phys_sec_size(), 4096);
    }

    #[test]
    fn invalid_word_106_is_ignored() {
        let mut words = lba48_words();
        // bit 15 set marks the word as invalid
        words[106] = (1 << 15) | W106_VALID | (1 << 12) | (1 << 13) | 3;
        words[117] = 2048;

        let geom = DeviceIdentity::from_words(&words).get_device_geometry();
        assert_eq!(geom.logical_sec_size(), 512);
        assert_eq!(geom.phys_sec_size(), 512);
    }

    #[test]
    fn sector_count_without_lba48() {
        let mut words = [0u16; 256];
        words[60] = 0xbeef;
        words[61] = 0x0ead;
        words[100] = 0xffff;
        words[101] = 0xffff;

        let id = DeviceIdentity::from_words(&words);
        assert!(!id.supports_lba48());
        assert_eq!(id.addressable_sectors(), 0x0ead_beef);
    }

    #[test]
    fn ata_strings_are_byte_swapped() {
        let mut words = [0x2020u16; 256];
        // "QEMU HARDDISK"
        let model = b"QEMU HARDDISK   ";
        for (i, pair) in model.chunks_exact(2).enumerate() {
            words[27 + i] = u16::from_be_bytes([pair[0], pair[1]]);
        }

        let id = DeviceIdentity::from_words(&words);
        assert_eq!(alloc_fmt(&id.model_num), "QEMU HARDDISK");
    }

    #[test]
    fn checksum() {
        let mut words = lba48_words();
        let mut bytes = [0u8; 512];
        for (i, w) in words.iter().enumerate() {
            bytes[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
        }
        let sum = bytes[..510]
            .iter()
            .fold(0xa5u8, |s, b| s.wrapping_add(*b));
        words[255] = 0xa5 | ((sum.wrapping_neg() as u16) << 8);
        assert!(DeviceIdentity::from_words(&words).checksum());

        words[255] ^= 0x100;
        assert!(!DeviceIdentity::from_words(&words).checksum());
    }

    fn alloc_fmt<T: Display>(t: &T) -> String {
        format!("{t}")
    }
}
