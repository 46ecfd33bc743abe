use crate::bitfield::MaskedBitField;
use crate::register::{ClearReserved, ReadOnly, ReadWriteClear, Register};

/// Generic host control registers, located at offset 0 of ABAR.
#[repr(C)]
pub(crate) struct GeneralControl {
    /// CAP
    capabilities: Register<HbaCapabilities, ReadOnly>,
    /// GHC
    host_ctl: Register<GlobalHbaCtl>,
    /// IS (R1C)
    ///
    /// Bit `n` is set when port `n` has a pending interrupt.
    interrupt_status: Register<u32, ReadWriteClear<u32>>,
    /// PI
    ///
    /// Ports implemented. Bitfield corresponding to ports implemented by the hba.
    ports: Register<u32, ReadOnly>,
    version: Register<VersionRegister, ReadOnly>,
    ccc_control: Register<CCCControl>,
    ccc_ports: Register<u32>,
    /// EM_LOC
    _enclosure_management: Register<u32, ReadOnly>,
    /// EM_CTL
    _enclosure_ctl: Register<u32>,
    capabilities_2: Register<HbaCapabilitiesExt, ReadOnly>,
    bios_handoff_ctl_status: Register<FirmwareHandoffCtl>,
}

const _: () = {
    assert!(core::mem::size_of::<GeneralControl>() == 0x2c);
    assert!(core::mem::offset_of!(GeneralControl, _enclosure_ctl) == 0x20);
    assert!(core::mem::offset_of!(GeneralControl, bios_handoff_ctl_status) == 0x28);
};

/// Number of spins while waiting for the firmware to release the HBA.
const HANDOFF_SPIN_LIMIT: u32 = 25_000;
/// Number of spins while waiting for [GlobalHbaCtl::HBA_RESET] to clear.
const RESET_SPIN_LIMIT: u32 = 1_000;

impl GeneralControl {
    pub fn get_capabilities(&self) -> (HbaCapabilities, HbaCapabilitiesExt) {
        (self.capabilities.read(), self.capabilities_2.read())
    }
    /// Returns the PI register.
    pub fn implemented_ports(&self) -> MaskedBitField<'_> {
        MaskedBitField::new(&self.ports, !0)
    }

    /// Returns the IS register as seen by the owner of the ports in `mask`.
    pub fn pending_interrupts(&self, mask: u32) -> MaskedBitField<'_, ReadWriteClear<u32>> {
        MaskedBitField::new(&self.interrupt_status, mask)
    }

    pub fn version(&self) -> (u16, u16) {
        self.version.read().maj_min()
    }

    /// Sets or clears GHC.IE
    pub fn set_interrupts(&self, state: bool) {
        self.host_ctl
            .update(|c| c.set(GlobalHbaCtl::INTERRUPT_ENABLE, state));
    }

    /// Sets GHC.AE. This must be set before any other AHCI register is accessed.
    pub fn enable_ahci(&self) {
        self.host_ctl.update(|c| c.insert(GlobalHbaCtl::AHCI_ENABLE));
    }

    /// Performs a HBA reset. On return all ports are idle and GHC has been restored to its
    /// default value, software must enable AHCI mode again.
    ///
    /// `delay` is called between polls of GHC.HR
    ///
    /// Returns `false` if the HBA did not complete the reset within the allowed time.
    pub fn reset(&self, mut delay: impl FnMut()) -> bool {
        self.enable_ahci();
        self.host_ctl.update(|c| c.insert(GlobalHbaCtl::HBA_RESET));
        for _ in 0..RESET_SPIN_LIMIT {
            if !self.host_ctl.read().contains(GlobalHbaCtl::HBA_RESET) {
                return true;
            }
            delay();
        }
        false
    }

    /// Claims the HBA from the firmware.
    ///
    /// Returns `false` if the firmware did not release the HBA within the allowed time.
    pub fn claim_from_firmware(&self, mut delay: impl FnMut()) -> bool {
        if !self
            .capabilities_2
            .read()
            .contains(HbaCapabilitiesExt::BIOS_HANDOFF)
        {
            return true;
        }
        let r = &self.bios_handoff_ctl_status;
        r.update(|t| t.insert(FirmwareHandoffCtl::OS_OWNED_SEMAPHORE));
        for _ in 0..HANDOFF_SPIN_LIMIT {
            let s = r.read();
            if !s.contains(FirmwareHandoffCtl::FW_OWNED_SEMAPHORE)
                && !s.contains(FirmwareHandoffCtl::FW_BUSY)
            {
                return true;
            }
            delay();
        }
        false
    }

    /// Disables command completion coalescing, all command completions raise an interrupt.
    pub fn disable_ccc(&self) {
        if self
            .capabilities
            .read()
            .contains(HbaCapabilities::COMMAND_COMPLETION_COALESCING)
        {
            self.ccc_control.update(|c| c.enable(false));
            self.ccc_ports.write(0);
        }
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug)]
    /// CAP (RO)
    pub(crate) struct HbaCapabilities: u32 {
        /// S64A
        ///
        /// When this is present the device supports 64 bit addressing for all address registers.
        const QWORD_BIT_ADDRESSING = 1 << 31;
        /// SNCQ
        ///
        /// When this is present this device supports native command queuing.
        /// If this is not present NCQ commands must not be issued
        const NATIVE_COMMAND_QUEUEING = 1 << 30;
        /// SSNTF
        ///
        /// When this is set the HBA supports the PxSNTF register
        const SNOTIFICATION = 1 << 29;
        /// SMPS
        ///
        /// The device supports a mechanical presence switch for hot plug devices.
        const PRESENCE_SWITCH = 1 << 28;
        /// SSS
        ///
        /// The device supports supports staggered spin up. This feature helps to prevent large
        /// power spikes on startup. When set software must spin up each port by setting
        /// [super::port_control::CommStatus::SPIN_UP_DEVICE].
        const STAGGERED_SPIN_UP = 1 << 27;
        /// SALP
        ///
        /// Aggressive link management allows using timers to automatically reduce power mode of
        /// the connected device.
        const AGGRESSIVE_LINK_POWER_MANGEMENT = 1 << 26;
        /// SAL
        ///
        /// This device supports an activity LED.
        const ACTIVITY_LED = 1 << 25;
        /// SCLO
        ///
        /// The HBA supports overriding the command list to preform a device reset.
        /// When this is present the [super::port_control::CommStatus::COMMAND_LIST_OVERRIDE] but
        /// may be used.
        const COMMAND_LIST_OVERRIDE = 1 << 24;
        /// SAM
        ///
        /// Then this bit is present the device cannot be used as a legacy IDE controller
        const AHCI_MODE_ONLY = 1 << 18;
        /// SPM
        ///
        /// When present the HBA supports communicating with port multipliers using command based
        /// switching.
        // command based switching is not implemented
        const PORT_MULTIPLIER = 1 << 17;
        /// FBSS
        ///
        /// When this but is present the device supports FIS based switching. This uses the port
        /// field a sent the FIS to identify the target device.
        const FIS_BASED_SWITCHING = 1 << 16;
        /// PMD
        ///
        /// When this bit is present this the HBA supports more than one DRQ block data transfers for the PIO
        /// command protocol.
        const PIO_MULTIPLE_DRQ_BLOCK = 1 << 15;
        /// SSC
        ///
        /// When this bit is present the HBA supports transitioning devices to the slumber mode to
        /// reduce power usage.
        const SLUMBER_STATE = 1 << 14;
        /// PSC
        ///
        /// When present the HBA supports transitioning devices into the partial power state
        const PARTIAL_STATE = 1 << 13;
        /// CCCS
        ///
        /// Indicates that the HBA supports the Command Completion Coalescing protocol.
        /// CCC is used to reduce the number of interrupts generated, to allow multiple command
        /// completions to be signalled by a single interrupt.
        const COMMAND_COMPLETION_COALESCING = 1 << 7;
        /// EMS
        ///
        /// Indicates that the HBA supports enclosure management
        const ENCLOSURE_MANAGEMENT = 1 << 6;
        /// SXS
        ///
        /// Indicates that at leas one port uses an eSATA connector.
        const E_SATA = 1 << 5;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Copy, Clone, Debug)]
    /// CAP2 (RO)
    pub(crate) struct HbaCapabilitiesExt: u32 {
        /// `DESO`
        const DEVSLP_FROM_SLUMBER_ONLY = 1 << 5;
        /// `SADM`
        const AGGRESSIVE_DEVICE_SLP_MANAGEMENT = 1 << 4;
        /// `SDS`
        const DEVICE_SLEEP = 1 << 3;
        /// `APST`
        const AUTOMATIC_PARTIAL_TO_SLEEP = 1 << 2;
        /// `NVMP`
        /// When set the NVMHCI table is present
        const NVMHCI = 1 << 1;
        /// `BOH`
        const BIOS_HANDOFF = 1;
    }

    /// GHC
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug)]
    pub(crate) struct GlobalHbaCtl: u32 {
        /// AE (CD)
        const AHCI_ENABLE = 1 << 31;
        /// MRSM (RO)
        ///
        /// Set when the HBA has fallen back to a single MSI message.
        const MSI_SINGLE_MESSAGE = 1 << 2;
        /// IE (RW)
        const INTERRUPT_ENABLE = 1 << 1;
        /// HR (RW1)
        ///
        /// Resets the HBA, this bit is cleared by the HBA when the reset has completed.
        const HBA_RESET = 1;
    }

    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub(crate) struct FirmwareHandoffCtl: u32 {
        /// Indicates that the firmware is cleaning up for ownership change.
        const FW_BUSY = 1 << 4;
        /// Indicates that the ownership has changed. Write 1 to clear this.
        const OWNERSHIP_CHANGE = 1 << 3;
        /// Sends an SMI when ownership is requested by the OS
        const SMI_ON_OWNERSHIP_CHANGE = 1 << 2;
        /// Used to request ownership from the firmware. When [Self::FW_OWNED_SEMAPHORE] is false
        /// the OS has ownership of the HBA.
        const OS_OWNED_SEMAPHORE = 1 << 1;
        /// Indicates that the firmware has ownership of the HBA. When this bit is clear the OS has ownership of the HBA.
        const FW_OWNED_SEMAPHORE = 1;
    }
}

unsafe impl ClearReserved for FirmwareHandoffCtl {
    fn clear_reserved(&mut self) {
        // OOC is R1C, writing it back would acknowledge it
        *self = Self::from_bits_truncate(self.bits());
        self.remove(Self::OWNERSHIP_CHANGE);
    }
}

// SAFETY: MRSM is read only, writing it has no effect
unsafe impl ClearReserved for GlobalHbaCtl {
    fn clear_reserved(&mut self) {
        *self = Self::from_bits_truncate(self.bits());
    }
}

impl HbaCapabilities {
    pub fn supports_qword_addr(&self) -> bool {
        self.contains(Self::QWORD_BIT_ADDRESSING)
    }

    /// Retrieves the maximum interface speed supported as an integer.
    /// The returned value is the link generation number.
    ///
    /// Gen1: up to 1.5Gib/s
    /// Gen2: up to 3Gib/s
    /// Gen3: up to 6Gib/s
    pub fn get_if_speed(&self) -> u8 {
        ((self.bits() >> 20) & 0xf) as u8
    }

    /// NCS
    ///
    /// Returns the maximum number of command slots per port, between 1 and 32
    pub fn get_command_slots(&self) -> u8 {
        ((self.bits() >> 8) & 0x1f) as u8 + 1
    }

    /// NP
    ///
    /// Gets the number of supported ports, between 1 and 32. This may be lower than the number
    /// of bits set in PI.
    pub fn port_count(&self) -> u8 {
        (self.bits() & 0x1f) as u8 + 1
    }
}

#[repr(transparent)]
#[derive(Copy, Clone)]
struct VersionRegister {
    inner: u32,
}

impl VersionRegister {
    pub fn maj_min(&self) -> (u16, u16) {
        let low = self.inner as u16;
        let high = (self.inner >> 16) as u16;
        (high, low)
    }
}

#[repr(transparent)]
#[derive(Copy, Clone)]
pub(crate) struct CCCControl {
    inner: u32,
}

unsafe impl ClearReserved for CCCControl {
    fn clear_reserved(&mut self) {
        // bits 1,2 are reserved
        self.inner &= !0b110;
    }
}

impl CCCControl {
    /// Enables or disables CCC.
    pub fn enable(&mut self, state: bool) {
        if state {
            self.inner |= 1;
        } else {
            self.inner &= !1;
        }
    }
}

/// Size of the region mapped from ABAR. Contains the generic registers, vendor registers and
/// all 32 port register blocks.
pub(crate) const ABAR_SIZE: usize = 0x1100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_counts_are_one_based() {
        let cap = HbaCapabilities::from_bits_retain((31 << 8) | 5);
        assert_eq!(cap.get_command_slots(), 32);
        assert_eq!(cap.port_count(), 6);
        let cap = HbaCapabilities::from_bits_retain(0);
        assert_eq!(cap.get_command_slots(), 1);
    }

    #[test]
    fn ahci_enable_is_bit_31() {
        assert_eq!(GlobalHbaCtl::AHCI_ENABLE.bits(), 0x8000_0000);
    }

    #[test]
    fn handoff_write_does_not_ack() {
        let mut t = FirmwareHandoffCtl::OWNERSHIP_CHANGE | FirmwareHandoffCtl::OS_OWNED_SEMAPHORE;
        t.clear_reserved();
        assert_eq!(t, FirmwareHandoffCtl::OS_OWNED_SEMAPHORE);
    }
}
