use ata::command::constructor::{ComposedCommand, MaybeOpaqueCommand};

const _: () = {
    assert!(core::mem::size_of::<RegisterHostToDevFis>() == 20);
    assert!(core::mem::size_of::<RegisterDevToHostFis>() == 20);
    assert!(core::mem::size_of::<ReceivedFis>() == 256);
    assert!(core::mem::offset_of!(ReceivedFis, _pio_setup) == 0x20);
    assert!(core::mem::offset_of!(ReceivedFis, d2h) == 0x40);
    assert!(core::mem::offset_of!(ReceivedFis, _set_dev_bits) == 0x58);
    assert!(core::mem::offset_of!(ReceivedFis, _unknown_fis) == 0x60);
};

/// The received FIS area pointed to by PxFB. The HBA copies FISes received from the device into
/// the matching field.
///
/// Only the D2H register FIS is interpreted, the other areas are kept for layout.
#[repr(C, align(256))]
pub struct ReceivedFis {
    /// DSFIS
    _dma_setup: [u32; 7],
    _res0: [u8; 4],
    /// PSFIS
    _pio_setup: [u32; 5],
    _res1: [u8; 12],
    /// RFIS
    d2h: RegisterDevToHostFis,
    _res2: [u8; 4],
    /// SDBFIS
    _set_dev_bits: [u32; 2],
    /// UFIS
    _unknown_fis: [u8; 64],
    _res3: [u8; 0x60],
}

impl ReceivedFis {
    /// Returns the last D2H register FIS received from the device.
    pub(crate) fn d2h(&self) -> RegisterDevToHostFis {
        // SAFETY: The field is written by hardware and is valid for reads
        unsafe { core::ptr::read_volatile(&self.d2h) }
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Default)]
pub struct FisCommand {
    low: u8,
}

impl FisCommand {
    /// C
    ///
    /// When set the FIS contains a command, when clear it is a device control update.
    pub fn set_cmd_bit(&mut self, value: bool) {
        if value {
            self.low |= 1 << 7
        } else {
            self.low &= !(1 << 7)
        }
    }

    pub fn get_cmd_bit(&self) -> bool {
        self.low & 1 << 7 != 0
    }

    /// PM Port
    pub fn set_port(&mut self, port: u8) {
        assert!(port < 16);
        self.low &= !0xf;
        self.low |= port;
    }
}

/// Register FIS - Host to Device
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RegisterHostToDevFis {
    pub(crate) fis_type: FisType,
    pub(crate) cfg: FisCommand,
    pub(crate) command: u8,
    pub(crate) features_low: u8,
    pub(crate) lba_low: [u8; 3],
    pub(crate) dev: u8,
    pub(crate) lba_high: [u8; 3],
    pub(crate) features_high: u8,
    pub(crate) count: u16,
    pub(crate) icc: u8,
    pub(crate) control: u8,
    pub(crate) aux: u32,
}

impl RegisterHostToDevFis {
    /// Length of this FIS in dwords, used for CFL in the command header.
    pub(crate) const LEN_DWORDS: u8 = (core::mem::size_of::<Self>() / 4) as u8;

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cmd: ata::command::AtaCommand,
        port: u8,
        features: u16,
        lba: u64,
        device: u8,
        count: u16,
        icc: u8,
        control: u8,
        aux: u32,
    ) -> Self {
        assert!(lba < 1 << 48);

        let (lba_low, lba_high) = {
            let lba_bytes: [u8; 8] = lba.to_le_bytes();
            let mut lba_low = [0u8; 3];
            let mut lba_high = [0u8; 3];
            lba_low[..].copy_from_slice(&lba_bytes[0..3]);
            lba_high[..].copy_from_slice(&lba_bytes[3..6]);
            (lba_low, lba_high)
        };

        let [features_low, features_high] = features.to_le_bytes();
        let mut cfg = FisCommand { low: 0 };
        cfg.set_port(port);
        cfg.set_cmd_bit(true);

        Self {
            fis_type: FisType::RegisterH2D,
            cfg,
            command: cmd as u8,
            features_low,
            lba_low,
            dev: device,
            lba_high,
            features_high,
            count: count.to_le(),
            icc,
            control,
            aux: aux.to_le(),
        }
    }

    pub(crate) fn command(&self) -> u8 {
        self.command
    }

    pub(crate) fn lba(&self) -> u64 {
        let mut b = [0u8; 8];
        b[0..3].copy_from_slice(&self.lba_low);
        b[3..6].copy_from_slice(&self.lba_high);
        u64::from_le_bytes(b)
    }

    pub(crate) fn count(&self) -> u16 {
        u16::from_le(self.count)
    }

    /// Returns the FIS as it is laid out in memory.
    pub(crate) fn as_bytes(&self) -> [u8; 20] {
        // SAFETY: Self is repr(C) and contains no padding
        unsafe { core::mem::transmute_copy(self) }
    }
}

impl core::fmt::Debug for RegisterHostToDevFis {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisterHostToDevFis")
            .field("command", &format_args!("{:#04x}", self.command))
            .field("lba", &format_args!("{:#x}", self.lba()))
            .field("count", &self.count())
            .field("dev", &format_args!("{:#04x}", self.dev))
            .finish_non_exhaustive()
    }
}

impl TryFrom<&ComposedCommand> for RegisterHostToDevFis {
    type Error = ();

    /// Fails if the command is still opaque, see [ComposedCommand::resolve]
    fn try_from(value: &ComposedCommand) -> Result<Self, Self::Error> {
        if let MaybeOpaqueCommand::Concrete(c) = value.command {
            Ok(Self::new(
                c,
                0,
                value.feature.unwrap_or(0),
                value.lba.unwrap_or(0),
                value.device.unwrap_or(0),
                value.count.unwrap_or(0),
                value.icc.unwrap_or(0),
                0,
                value.aux.unwrap_or(0),
            ))
        } else {
            Err(())
        }
    }
}

/// Register FIS - Device to Host
///
/// Only the status and error bytes are read back, the remainder mirrors the H2D layout.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct RegisterDevToHostFis {
    _fis_type: u8,
    _flags: u8,
    status: u8,
    err: u8,
    _lba_low: [u8; 3],
    _dev: u8,
    _lba_high: [u8; 3],
    _res0: u8,
    _count: u16,
    _res1: [u8; 6],
}

impl RegisterDevToHostFis {
    pub(crate) fn status(&self) -> u8 {
        self.status
    }

    pub(crate) fn err(&self) -> u8 {
        self.err
    }
}

/// FIS type codes the host transmits.
#[repr(u8)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub enum FisType {
    RegisterH2D = 0x27,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ata::command::AtaCommand;
    use ata::command::constructor::{CommandConstructor, SpanningCmd, SpanningCmdType};

    #[test]
    fn h2d_layout() {
        let fis = RegisterHostToDevFis::new(
            AtaCommand::READ_DMA_EXT,
            0,
            0,
            0x0605_0403_0201,
            0x40,
            8,
            0,
            0,
            0,
        );
        let b = fis.as_bytes();
        assert_eq!(b[0], 0x27);
        assert_eq!(b[1], 0x80);
        assert_eq!(b[2], 0x25);
        assert_eq!(&b[4..7], &[1, 2, 3]);
        assert_eq!(b[7], 0x40);
        assert_eq!(&b[8..11], &[4, 5, 6]);
        assert_eq!(&b[12..14], &[8, 0]);
    }

    #[test]
    fn opaque_commands_are_rejected() {
        let cmd = SpanningCmd::new(SpanningCmdType::Read, 0, 1).unwrap().compose();
        assert!(RegisterHostToDevFis::try_from(&cmd).is_err());
        let resolved = cmd.resolve(true).unwrap();
        let fis = RegisterHostToDevFis::try_from(&resolved).unwrap();
        assert_eq!(fis.command(), AtaCommand::READ_DMA_EXT as u8);
        assert_eq!(fis.count(), 1);
    }
}
