#[repr(u8)]
#[derive(Eq, PartialEq, Copy, Clone, Debug, num_enum::TryFromPrimitive)]
#[allow(non_camel_case_types)]
pub enum AtaCommand {
    // Read
    /// Reads from the device using DMA.
    ///
    /// - LBA contains the first sector to be transferred. Bits 24..28 are placed in the device
    ///   register.
    /// - Count contains the number of sectors to be transferred. A value of 0 is treated as 256
    READ_DMA = 0xc8,
    /// See [Self::READ_DMA]
    /// - Count: Size of this field is doubled. A value of 0 is treated as 65,536
    READ_DMA_EXT = 0x25,

    // Write
    /// Writes to the disk using DMA.
    ///
    /// - LBA contains the first sector to be written
    /// - Count contains the number of sectors to be written. A value of 0 is treated as 256 sectors
    WRITE_DMA = 0xca,
    /// See [Self::WRITE_DMA]
    /// - Count: Size of this field is doubled. A value of 0 is treated as 65,536
    WRITE_DMA_EXT = 0x35,
    /// Performs an uncached [Self::WRITE_DMA_EXT] regardless of the current caching policy.
    WRITE_DMA_FUA_EXT = 0x3d,

    READ_FPDMA_QUEUED = 0x60,
    WRITE_FPDMA_QUEUED = 0x61,

    /// On completion this will return an error
    NOP = 0x00,
    CHECK_POWER_MODE = 0xe5,
    STANDBY_IMMEDIATE = 0xe0,
    IDLE_IMMEDIATE = 0xe1,

    /// Writes any cached data to non-volatile media.
    /// Completes when an error occurs or when all data is written.
    /// If the cache is disabled or not present this will complete normally.
    ///
    /// This command may not return errors correctly if errors occur in LBAs above 0xFFFFFF.
    /// For this reason [Self::FLUSH_CACHE_EXT] is preferred.
    FLUSH_CACHE = 0xe7,
    /// Writes any cached data to non-volatile media.
    /// Completes when an error occurs or when all data is written.
    FLUSH_CACHE_EXT = 0xea,

    /// Returns 512 bytes of [crate::structures::identification::DeviceIdentity].
    IDENTIFY_DEVICE = 0xec,
    /// Identical to [Self::IDENTIFY_DEVICE] for devices implementing the packet feature set.
    /// ATA devices abort this command.
    IDENTIFY_PACKET_DEVICE = 0xa1,
    SET_FEATURES = 0xef,
}

impl AtaCommand {
    /// Returns whether this command uses the 48bit register layout.
    pub fn is_48_bit(&self) -> bool {
        match self {
            Self::READ_DMA_EXT
            | Self::WRITE_DMA_EXT
            | Self::WRITE_DMA_FUA_EXT
            | Self::READ_FPDMA_QUEUED
            | Self::WRITE_FPDMA_QUEUED
            | Self::FLUSH_CACHE_EXT => true,
            _ => false,
        }
    }

    /// Returns whether this is a native command queueing command.
    pub fn is_nqc(&self) -> bool {
        match self {
            Self::READ_FPDMA_QUEUED | Self::WRITE_FPDMA_QUEUED => true,
            _ => false,
        }
    }

    /// Returns true when the command transfers data from the host to the device.
    pub fn is_write(&self) -> bool {
        match self {
            Self::WRITE_DMA
            | Self::WRITE_DMA_EXT
            | Self::WRITE_DMA_FUA_EXT
            | Self::WRITE_FPDMA_QUEUED => true,
            _ => false,
        }
    }
}

impl From<AtaCommand> for u8 {
    fn from(value: AtaCommand) -> Self {
        value as u8
    }
}

pub mod constructor {
    use crate::command::AtaCommand;

    /// Device register bit selecting LBA addressing.
    pub const DEVICE_LBA_MODE: u8 = 1 << 6;

    /// A composed command contains all the fields required to issue a command.
    /// A field containing none is not defined at the ATA level and must be set by the driver.
    /// A field containing `Some(_)` may be modified, but this may result in errors from the device.
    ///
    /// Some unused fields may be left as None when the command is Opaque. In this case see
    /// [super::AtaCommand] for their usage.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ComposedCommand {
        pub command: MaybeOpaqueCommand,
        pub feature: Option<u16>,
        pub count: Option<u16>,
        pub lba: Option<u64>,
        pub device: Option<u8>,
        pub icc: Option<u8>,
        pub aux: Option<u32>,
    }

    impl ComposedCommand {
        fn zeroed(cmd: MaybeOpaqueCommand) -> Self {
            Self {
                command: cmd,
                feature: Some(0),
                count: Some(0),
                lba: Some(0),
                device: Some(0),
                icc: Some(0),
                aux: Some(0),
            }
        }

        fn empty(cmd: MaybeOpaqueCommand) -> Self {
            Self {
                command: cmd,
                feature: None,
                count: None,
                lba: None,
                device: None,
                icc: None,
                aux: None,
            }
        }

        /// Returns true if the command is a concrete 48bit command or if any field requires the 48bit
        /// layout, otherwise returns false.
        ///
        /// If false the feature and count can be treated as a u8 and lba can be treated as a u32
        /// where only the first 28 bits are valid.
        pub fn is_48_bit(&self) -> bool {
            if let MaybeOpaqueCommand::Concrete(c) = self.command {
                if c.is_48_bit() {
                    return true;
                }
            }

            self.feature.is_some_and(|n| n > u8::MAX as u16)
                || self.count.is_some_and(|n| n > u8::MAX as u16)
                || self.lba.is_some_and(|n| n > 0xfff_ffff)
        }

        /// Resolves an opaque command into a concrete DMA command.
        ///
        /// When `lba48` is false the 28bit variants are used, which place LBA bits 24..28 into the
        /// device register. Returns `None` when the arguments cannot be expressed by the selected
        /// variant. Concrete commands are returned unchanged.
        pub fn resolve(&self, lba48: bool) -> Option<Self> {
            let MaybeOpaqueCommand::Opaque(op) = self.command else {
                return Some(*self);
            };

            let mut cmd = *self;
            let dev = self.device.unwrap_or(0) | DEVICE_LBA_MODE;

            let concrete = match (op, lba48) {
                (OpaqueCommand::Flush, true) => {
                    cmd.device = Some(0);
                    AtaCommand::FLUSH_CACHE_EXT
                }
                (OpaqueCommand::Flush, false) => {
                    cmd.device = Some(0);
                    AtaCommand::FLUSH_CACHE
                }
                (OpaqueCommand::Read | OpaqueCommand::Write, true) => {
                    cmd.device = Some(dev);
                    if op == OpaqueCommand::Read {
                        AtaCommand::READ_DMA_EXT
                    } else {
                        AtaCommand::WRITE_DMA_EXT
                    }
                }
                (OpaqueCommand::Read | OpaqueCommand::Write, false) => {
                    let lba = self.lba?;
                    if lba > 0xfff_ffff {
                        return None;
                    }
                    // 0 means 256 sectors for 28bit commands
                    cmd.count = match self.count? {
                        0 => return None,
                        256 => Some(0),
                        n if n > 256 => return None,
                        n => Some(n),
                    };
                    cmd.lba = Some(lba & 0xff_ffff);
                    cmd.device = Some(dev | ((lba >> 24) & 0xf) as u8);
                    if op == OpaqueCommand::Read {
                        AtaCommand::READ_DMA
                    } else {
                        AtaCommand::WRITE_DMA
                    }
                }
            };
            cmd.command = MaybeOpaqueCommand::Concrete(concrete);
            Some(cmd)
        }
    }

    /// Contains either an [AtaCommand] or an [OpaqueCommand]. This allows [ComposedCommand]s to not need
    /// to specify an exact command when a driver may want to specify the exact behaviour of a command
    /// i.e. a driver can choose to use a 28bit read instead of a 48bit read.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum MaybeOpaqueCommand {
        Concrete(AtaCommand),
        Opaque(OpaqueCommand),
    }

    impl TryFrom<MaybeOpaqueCommand> for u8 {
        type Error = MaybeOpaqueCommand;

        fn try_from(value: MaybeOpaqueCommand) -> Result<u8, Self::Error> {
            match value {
                MaybeOpaqueCommand::Concrete(c) => Ok(c.into()),
                MaybeOpaqueCommand::Opaque(_) => Err(value),
            }
        }
    }

    /// Opaque commands are commands have multiple potential command that the driver may want fine
    /// control of.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum OpaqueCommand {
        Read,
        Write,
        Flush,
    }

    pub trait CommandConstructor {
        fn compose(self) -> ComposedCommand;
    }

    /// A struct to construct simple command that spans over a region of LBAs such as reading or writing
    #[derive(Copy, Clone, Debug)]
    pub struct SpanningCmd {
        cmd: SpanningCmdType,
        lba: u64,
        count: u16,
    }

    impl SpanningCmd {
        /// Constructs a new spanning command. `count` uses the 48bit encoding where `0` is 65536
        /// sectors.
        ///
        /// Returns `None` if `lba` cannot be addressed by a 48bit command.
        pub fn new(cmd: SpanningCmdType, lba: u64, count: u16) -> Option<Self> {
            if lba >= 1 << 48 {
                None
            } else {
                Some(Self { cmd, lba, count })
            }
        }
    }

    impl CommandConstructor for SpanningCmd {
        fn compose(self) -> ComposedCommand {
            let mut cmd = ComposedCommand::empty(self.cmd.into());
            cmd.lba = Some(self.lba);
            cmd.count = Some(self.count);
            cmd.feature = Some(0);
            cmd
        }
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum SpanningCmdType {
        Read,
        Write,
    }

    impl From<SpanningCmdType> for MaybeOpaqueCommand {
        fn from(value: SpanningCmdType) -> Self {
            match value {
                SpanningCmdType::Read => MaybeOpaqueCommand::Opaque(OpaqueCommand::Read),
                SpanningCmdType::Write => MaybeOpaqueCommand::Opaque(OpaqueCommand::Write),
            }
        }
    }

    /// Commands which do not take any arguments.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum NoArgCmd {
        /// Generates a [ComposedCommand] which will signal to the device to identify itself returning
        /// a [crate::structures::identification::DeviceIdentity].
        IdentifyDevice,
        /// See [AtaCommand::IDENTIFY_PACKET_DEVICE]
        IdentifyPacketDevice,
        /// Flushes the write cache using whichever flush command the driver selects.
        FlushCache,
    }

    impl CommandConstructor for NoArgCmd {
        fn compose(self) -> ComposedCommand {
            match self {
                NoArgCmd::IdentifyDevice => {
                    ComposedCommand::zeroed(MaybeOpaqueCommand::Concrete(AtaCommand::IDENTIFY_DEVICE))
                }
                NoArgCmd::IdentifyPacketDevice => ComposedCommand::zeroed(MaybeOpaqueCommand::Concrete(
                    AtaCommand::IDENTIFY_PACKET_DEVICE,
                )),
                NoArgCmd::FlushCache => {
                    ComposedCommand::zeroed(MaybeOpaqueCommand::Opaque(OpaqueCommand::Flush))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::constructor::*;
    use super::*;

    #[test]
    fn command_from_raw() {
        assert_eq!(AtaCommand::try_from(0xecu8).ok(), Some(AtaCommand::IDENTIFY_DEVICE));
        assert!(AtaCommand::try_from(0xffu8).is_err());
    }

    #[test]
    fn write_commands_are_classified() {
        assert!(AtaCommand::WRITE_DMA.is_write());
        assert!(AtaCommand::WRITE_FPDMA_QUEUED.is_write());
        assert!(!AtaCommand::READ_DMA_EXT.is_write());
        assert!(!AtaCommand::IDENTIFY_DEVICE.is_write());
    }

    #[test]
    fn resolve_48bit_read() {
        let cmd = SpanningCmd::new(SpanningCmdType::Read, 0x1234_5678_9a, 16)
            .unwrap()
            .compose()
            .resolve(true)
            .unwrap();

        assert_eq!(cmd.command, MaybeOpaqueCommand::Concrete(AtaCommand::READ_DMA_EXT));
        assert_eq!(cmd.lba, Some(0x1234_5678_9a));
        assert_eq!(cmd.device, Some(DEVICE_LBA_MODE));
        assert!(cmd.is_48_bit());
    }

    #[test]
    fn resolve_28bit_write_moves_high_lba_into_device() {
        let cmd = SpanningCmd::new(SpanningCmdType::Write, 0x0abc_def0, 256)
            .unwrap()
            .compose()
            .resolve(false)
            .unwrap();

        assert_eq!(cmd.command, MaybeOpaqueCommand::Concrete(AtaCommand::WRITE_DMA));
        assert_eq!(cmd.lba, Some(0xbc_def0));
        assert_eq!(cmd.device, Some(DEVICE_LBA_MODE | 0xa));
        assert_eq!(cmd.count, Some(0));
    }

    #[test]
    fn resolve_28bit_rejects_out_of_range() {
        let high = SpanningCmd::new(SpanningCmdType::Read, 0x1000_0000, 1)
            .unwrap()
            .compose();
        assert_eq!(high.resolve(false), None);

        let long = SpanningCmd::new(SpanningCmdType::Read, 0, 257).unwrap().compose();
        assert_eq!(long.resolve(false), None);
    }

    #[test]
    fn spanning_cmd_rejects_large_lba() {
        assert!(SpanningCmd::new(SpanningCmdType::Read, 1 << 48, 1).is_none());
    }

    #[test]
    fn flush_selects_variant() {
        let ext = NoArgCmd::FlushCache.compose().resolve(true).unwrap();
        assert_eq!(ext.command, MaybeOpaqueCommand::Concrete(AtaCommand::FLUSH_CACHE_EXT));
        let short = NoArgCmd::FlushCache.compose().resolve(false).unwrap();
        assert_eq!(short.command, MaybeOpaqueCommand::Concrete(AtaCommand::FLUSH_CACHE));
    }
}
