use crate::bitfield::MaskedBitField;
use crate::hba::HostBusAdapter;
use crate::{AhciConfig, AhciError};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use block::AhciDiskDevice;
use handler::PortHandler;
use kernel_if::{KernelServices, MemRegion, PciFunction};
use pci_config::{ConfigSpaceAccessor, DeviceAddress, MmioMapper};
use port::Port;
use quirk::ResetQuirk;

pub mod block;
mod cmd_ctl;
pub mod handler;
pub mod kernel_if;
pub mod port;
pub mod quirk;

pub use crate::hba::CmdIndex;
pub use cmd_ctl::{CommandError, QueueFull};

/// Delay between polls of BOHC while waiting for the firmware.
const HANDOFF_POLL_US: u64 = 40;
/// Delay between polls of GHC.HR during a HBA reset.
const RESET_POLL_US: u64 = 1000;

pub(crate) type HbaContextRef = Arc<HbaContext>;

/// State shared between the controller, its handlers and its ports.
pub(crate) struct HbaContext {
    pub(crate) hba: HostBusAdapter,
    pub(crate) info: HbaInfo,
    pub(crate) services: Arc<dyn KernelServices>,
    pub(crate) config: AhciConfig,
    pub(crate) quirk: ResetQuirk,
}

/// This struct contains HBA specific information that is shared between all components.
/// This allows components to get information that they do not otherwise have direct access to.
#[derive(Debug, Copy, Clone)]
pub struct HbaInfo {
    is_64_bit: bool,
    queue_depth: u8,
    port_count: u8,
    mech_presence_switch: bool,
    version: (u16, u16),
    pci_addr: DeviceAddress,
}

impl HbaInfo {
    pub(crate) fn from_general(
        ctl: &crate::hba::general_control::GeneralControl,
        pci_addr: DeviceAddress,
    ) -> Self {
        let (cap, _) = ctl.get_capabilities();
        Self {
            is_64_bit: cap.supports_qword_addr(),
            queue_depth: cap.get_command_slots(),
            port_count: cap.port_count(),
            mech_presence_switch: cap
                .contains(crate::hba::general_control::HbaCapabilities::PRESENCE_SWITCH),
            version: ctl.version(),
            pci_addr,
        }
    }

    pub(crate) fn mem_region(&self) -> MemRegion {
        match self.is_64_bit {
            true => MemRegion::Mem64,
            false => MemRegion::Mem32,
        }
    }

    /// Returns the number of command slots allowed per port. Command slots `0..Self.queue_depth`.
    /// This will never return 0 or a value above 32, this means regardless of the returned value
    /// slot 0 will always be usable
    pub fn queue_depth(&self) -> u8 {
        self.queue_depth
    }

    /// Number of ports reported by CAP.NP. This may differ from the number of implemented ports.
    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    pub fn is_64_bit(&self) -> bool {
        self.is_64_bit
    }

    pub fn mech_presence_switch(&self) -> bool {
        self.mech_presence_switch
    }

    /// AHCI version as (major, minor)
    pub fn version(&self) -> (u16, u16) {
        self.version
    }

    pub fn pci_addr(&self) -> DeviceAddress {
        self.pci_addr
    }
}

/// An initialized AHCI controller.
pub struct AhciController {
    ctx: HbaContextRef,
    function: PciFunction,
    handlers: Vec<Arc<PortHandler>>,
}

impl AhciController {
    /// Reads the PCI function at `address`, see [PciFunction::probe].
    pub fn probe<M: MmioMapper>(
        cfg: &ConfigSpaceAccessor<M>,
        address: DeviceAddress,
    ) -> Result<PciFunction, AhciError> {
        PciFunction::probe(cfg, address)
    }

    /// Brings up the HBA.
    ///
    /// The HBA is claimed from the firmware, reset and placed into AHCI mode. Implemented ports are
    /// grouped by interrupt line and a [PortHandler] is created for each group, which resets
    /// its ports. Port `n` uses `irqs[n]`, when fewer lines are given the remaining ports share
    /// the last one.
    ///
    /// When [AhciConfig::use_interrupts] is false `irqs` is ignored and the caller must
    /// call [Self::poll].
    pub fn new(
        function: PciFunction,
        services: Arc<dyn KernelServices>,
        config: AhciConfig,
        irqs: &[u8],
    ) -> Result<Self, AhciError> {
        if config.use_interrupts && irqs.is_empty() {
            return Err(AhciError::NoIrq);
        }
        let abar = function.abar.ok_or(AhciError::MissingAbar)?;
        let ptr = services
            .map(abar, crate::hba::general_control::ABAR_SIZE)
            .ok_or(AhciError::MapFailed)?;

        // SAFETY: ptr is a mapping of ABAR, which is never unmapped
        let hba = unsafe { HostBusAdapter::from_raw(ptr) };
        let general = hba.general;

        if !general.claim_from_firmware(|| services.delay_us(HANDOFF_POLL_US)) {
            log::error!("{}: Firmware did not release the HBA", function.address);
            return Err(AhciError::FirmwareHandoffTimeout);
        }
        if !general.reset(|| services.delay_us(RESET_POLL_US)) {
            log::error!("{}: HBA reset timed out", function.address);
            return Err(AhciError::ResetTimeout);
        }
        general.enable_ahci();
        general.disable_ccc();

        let info = HbaInfo::from_general(general, function.address);
        let (maj, min) = info.version();
        log::info!(
            "{}: AHCI {maj}.{min:02x} {} ports, {} command slots, 64bit: {}",
            function.address,
            info.port_count(),
            info.queue_depth(),
            info.is_64_bit()
        );

        let quirk = ResetQuirk::for_device(function.vendor_id, function.device_id);
        if quirk != ResetQuirk::None {
            log::debug!("{}: Using reset quirk {quirk:?}", function.address);
        }

        let ctx = Arc::new(HbaContext {
            hba,
            info,
            services,
            config,
            quirk,
        });

        // irq -> ports
        let mut groups: BTreeMap<Option<u8>, u32> = BTreeMap::new();
        for i in general.implemented_ports().to_vec() {
            let irq = config
                .use_interrupts
                .then(|| irqs[(i as usize).min(irqs.len() - 1)]);
            *groups.entry(irq).or_default() |= 1 << i;
        }

        let mut handlers = Vec::new();
        for (irq, ports) in groups {
            handlers.push(PortHandler::create(&ctx, irq, ports)?);
        }

        if config.use_interrupts {
            general.set_interrupts(true);
        }

        Ok(Self {
            ctx,
            function,
            handlers,
        })
    }

    /// Returns the PI register.
    pub fn implemented_ports(&self) -> MaskedBitField<'static> {
        self.ctx.hba.general.implemented_ports()
    }

    /// Identifies the device on each port. Returns the disks which were found.
    pub async fn initialize_devices(&self) -> Vec<Arc<AhciDiskDevice>> {
        let mut disks = Vec::new();
        for port in self.ports() {
            if let Some(d) = port.initialize().await {
                disks.push(d);
            }
        }
        disks
    }

    /// Services all ports without waiting for an interrupt.
    /// Returns whether any port had a pending interrupt.
    pub fn poll(&self) -> bool {
        self.handlers
            .iter()
            .fold(false, |acc, h| h.handle_irq() | acc)
    }

    /// Resets and identifies devices which were attached while the controller was running.
    /// Returns any new disks.
    pub async fn service_deferred(&self) -> Vec<Arc<AhciDiskDevice>> {
        let mut disks = Vec::new();
        for port in self.ports() {
            if !port.take_deferred_reset() {
                continue;
            }
            log::debug!("{port}: Running deferred reset");
            if port.reset_with(self.ctx.config.reset_mode) {
                if let Some(d) = port.initialize().await {
                    disks.push(d);
                }
            }
        }
        disks
    }

    pub fn handlers(&self) -> &[Arc<PortHandler>] {
        &self.handlers
    }

    pub fn info(&self) -> HbaInfo {
        self.ctx.info
    }

    pub fn pci_function(&self) -> &PciFunction {
        &self.function
    }

    /// Returns the port at `index` if it is implemented.
    pub fn port(&self, index: u8) -> Option<Arc<Port>> {
        self.handlers
            .iter()
            .find_map(|h| h.port_at_index(index).ok())
    }

    fn ports(&self) -> Vec<Arc<Port>> {
        let mut ports = Vec::new();
        for h in &self.handlers {
            h.enumerate_ports(|p| ports.push(p.clone()));
        }
        ports
    }
}

impl core::fmt::Debug for AhciController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AhciController")
            .field("function", &self.function)
            .field("info", &self.ctx.info)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// The port does not belong to the handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotOwned(pub u8);

#[derive(Clone, Debug)]
/// This struct contains device identification information
pub struct DevIdentity {
    /// Number of bytes per logical sector. A logical sector is the smallest value that the device
    /// can access. Commands that access the physical medium must be aligned to this value.
    /// This should never exceed `0x20000`  bytes
    lba_size: u64,
    /// Number of bytes in the physical sector. Operations prefer to be aligned to this over `lba_size` for optimal performance.
    /// This number is always a multiple of `lba_size`
    phys_sec_size: u64,
    /// LBA offset. This value is the offset of hte first LBA into the first physical sector.
    /// For an LBA size of 512 and a physical sector size of 4096 if this value is 1 the first lba
    /// is byte 512 of the first physical sector.
    ///
    /// For optimal performance commands should start and end at physical sector boundaries.
    offset: u16,
    /// Total number of LBAs on the device. Commands may never exceed this LBA. This has a maximum value of `0xFFFF_FFFF_FFFF`
    lba_count: u64,
    lba48: bool,
    model: ata::structures::identification::AtaString<40>,
    serial: ata::structures::identification::AtaString<20>,
}

impl DevIdentity {
    /// Checks if the given args will exceed the last lba on the device.
    pub fn exceeds_dev(&self, lba: SectorAddress, count: SectorCount) -> bool {
        lba.raw() + count.get() as u64 > self.lba_count
    }

    pub fn lba_size(&self) -> u64 {
        self.lba_size
    }

    pub fn phys_sec_size(&self) -> u64 {
        self.phys_sec_size
    }

    pub fn alignment(&self) -> u16 {
        self.offset
    }

    pub fn lba_count(&self) -> u64 {
        self.lba_count
    }

    /// Whether 48bit commands are used for this device
    pub fn lba48(&self) -> bool {
        self.lba48
    }

    pub fn model(&self) -> &impl core::fmt::Display {
        &self.model
    }

    pub fn serial(&self) -> &impl core::fmt::Display {
        &self.serial
    }
}

impl From<&ata::structures::identification::DeviceIdentity> for DevIdentity {
    fn from(value: &ata::structures::identification::DeviceIdentity) -> Self {
        let g = value.get_device_geometry();
        Self {
            lba_size: g.logical_sec_size() as u64,
            phys_sec_size: g.phys_sec_size(),
            offset: g.get_alignment(),
            lba_count: g.lba_count(),
            lba48: value.supports_lba48(),
            model: value.model_num,
            serial: value.serial,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CmdErr {
    /// An error with the command was detected. This this variant means the attempted command was
    /// declared erroneous by the driver.
    AtaErr,
    /// The device signaled completion with an error.
    /// Contains the error bits from the command.
    DevErr(u8),
    /// A transport error occurred, the command may not have reached the device.
    Transport,
    /// The command did not complete before its deadline and was aborted.
    Timeout,
    /// The system is no longer in communication with the target device.
    Disowned,
    /// The caller gave invalid arguments to the fn. The fn should document arguments which may
    /// cause this err.
    BadArgs,
    /// An error was encountered while building the command. This differs from [Self::AtaErr] because
    /// the command itself was logically correct but an issue was encountered while building the command.
    BuildErr(CommandError),
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub struct SectorAddress(u64);

impl SectorAddress {
    pub fn new(addr: u64) -> Option<Self> {
        if addr < 1 << 48 { Some(Self(addr)) } else { None }
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub struct SectorCount(core::num::NonZeroU32);

impl SectorCount {
    pub fn new(count: u32) -> Option<Self> {
        match count {
            n if n > (1 << 16) => None,
            n => core::num::NonZeroU32::new(n).map(Self),
        }
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }

    /// Returns the raw number of sectors for a 48 bit command.
    fn count_ext(&self) -> u16 {
        let n = self.0.get();
        if n == 1 << 16 { 0 } else { n as u16 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_count_limits() {
        assert!(SectorCount::new(0).is_none());
        assert!(SectorCount::new((1 << 16) + 1).is_none());
        assert_eq!(SectorCount::new(1 << 16).unwrap().count_ext(), 0);
        assert_eq!(SectorCount::new(256).unwrap().count_ext(), 256);
    }

    #[test]
    fn sector_address_is_48_bit() {
        assert!(SectorAddress::new((1 << 48) - 1).is_some());
        assert!(SectorAddress::new(1 << 48).is_none());
    }

    #[test]
    fn identity_bounds() {
        let mut words = [0u16; 256];
        words[60] = 100;
        let raw = ata::structures::identification::DeviceIdentity::from_words(&words);
        let id = DevIdentity::from(&raw);
        assert_eq!(id.lba_count(), 100);
        assert_eq!(id.lba_size(), 512);
        assert!(!id.lba48());
        let lba = SectorAddress::new(96).unwrap();
        assert!(!id.exceeds_dev(lba, SectorCount::new(4).unwrap()));
        assert!(id.exceeds_dev(lba, SectorCount::new(5).unwrap()));
    }
}
