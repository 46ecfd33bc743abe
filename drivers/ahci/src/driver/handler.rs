//! Interrupt dispatch for a group of ports sharing an interrupt line.

use super::kernel_if::{DmaRegion, IrqHandler, PAGE_SIZE};
use super::port::{IDENTIFY_LEN, Port};
use super::{HbaContextRef, NotOwned};
use crate::AhciError;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Number of pages required to hold the IDENTIFY responses of every port.
const IDENTIFY_PAGES: usize = (super::kernel_if::MAX_PORTS * IDENTIFY_LEN).div_ceil(PAGE_SIZE);

/// Owns the ports which raise interrupts on a single interrupt line.
///
/// When polling is configured the handler has no interrupt line and is serviced by
/// [super::AhciController::poll].
pub struct PortHandler {
    ctx: HbaContextRef,
    irq: Option<u8>,
    taken: u32,
    ports: BTreeMap<u8, Arc<Port>>,
    identify_pages: Arc<Vec<DmaRegion>>,
}

impl PortHandler {
    /// Creates a handler for the ports set in `taken`.
    ///
    /// Stale interrupts are acknowledged and each port is reset according to the configured reset
    /// mode. The interrupt handler is registered before delivery is enabled.
    pub(crate) fn create(
        ctx: &HbaContextRef,
        irq: Option<u8>,
        taken: u32,
    ) -> Result<Arc<Self>, AhciError> {
        let identify_pages: Arc<Vec<DmaRegion>> = Arc::new(
            (0..IDENTIFY_PAGES)
                .map(|_| DmaRegion::new(&ctx.services, 1, ctx.info.mem_region()))
                .collect(),
        );

        ctx.hba.general.pending_interrupts(taken).set_all();

        let mut ports = BTreeMap::new();
        for i in (0..32u8).filter(|i| taken & 1 << i != 0) {
            let region = IdentifyRegion::new(identify_pages.clone(), i);
            let port = Port::new(ctx.clone(), i, region);
            port.reset_with(ctx.config.reset_mode);
            log::debug!("{port}: {:?}", port.state());
            ports.insert(i, port);
        }

        let this = Arc::new(Self {
            ctx: ctx.clone(),
            irq,
            taken,
            ports,
            identify_pages,
        });

        if let Some(irq) = irq {
            let weak = Arc::downgrade(&this);
            if !ctx.services.register_irq(irq, weak) {
                log::error!("{}: Failed to register IRQ {irq}", ctx.info.pci_addr());
                return Err(AhciError::IrqRegistration);
            }
            ctx.services.set_irq_enabled(irq, true);
        }

        Ok(this)
    }

    /// Returns the physical address of the IDENTIFY buffer for the port at `index`.
    pub fn get_identify_metadata_physical_region(&self, index: u8) -> u64 {
        identify_addr(&self.identify_pages, index)
    }

    /// Calls `f` on each port owned by this handler in ascending order.
    pub fn enumerate_ports(&self, mut f: impl FnMut(&Arc<Port>)) {
        for p in self.ports.values() {
            f(p)
        }
    }

    pub fn port_at_index(&self, index: u8) -> Result<Arc<Port>, NotOwned> {
        self.ports.get(&index).cloned().ok_or(NotOwned(index))
    }

    /// Returns the mask of ports owned by this handler.
    pub fn taken_ports(&self) -> u32 {
        self.taken
    }

    pub fn irq(&self) -> Option<u8> {
        self.irq
    }

    /// Services every port with a pending interrupt. The pending bits which were serviced are
    /// acknowledged together once every port has been handled.
    ///
    /// Returns whether any interrupt was pending.
    pub fn handle_irq(&self) -> bool {
        let pending = self.ctx.hba.general.pending_interrupts(self.taken);
        let raw = pending.raw();
        for i in (0..32u8).filter(|i| raw & 1 << i != 0) {
            match self.ports.get(&i) {
                Some(p) => p.handle_interrupt(),
                None => log::warn!("{}: Interrupt for unknown port {i}", self.ctx.info.pci_addr()),
            }
        }
        pending.ack(raw);
        raw != 0
    }
}

impl IrqHandler for PortHandler {
    fn handle_irq(&self) -> bool {
        PortHandler::handle_irq(self)
    }
}

impl Drop for PortHandler {
    fn drop(&mut self) {
        if let Some(irq) = self.irq {
            self.ctx.services.set_irq_enabled(irq, false);
        }
    }
}

impl core::fmt::Debug for PortHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PortHandler")
            .field("irq", &self.irq)
            .field("taken", &format_args!("{:#x}", self.taken))
            .field("ports", &self.ports.keys())
            .finish()
    }
}

fn identify_addr(pages: &[DmaRegion], index: u8) -> u64 {
    let offset = index as usize * IDENTIFY_LEN;
    pages[offset / PAGE_SIZE].phys() + (offset % PAGE_SIZE) as u64
}

/// The IDENTIFY buffer of a single port.
pub(crate) struct IdentifyRegion {
    pages: Arc<Vec<DmaRegion>>,
    index: u8,
}

impl IdentifyRegion {
    fn new(pages: Arc<Vec<DmaRegion>>, index: u8) -> Self {
        assert!((index as usize) < super::kernel_if::MAX_PORTS);
        Self { pages, index }
    }

    pub(crate) fn phys(&self) -> u64 {
        identify_addr(&self.pages, self.index)
    }

    /// Copies out the buffer. The HBA must not be writing to the buffer.
    pub(crate) fn read(&self) -> [u8; IDENTIFY_LEN] {
        let offset = self.index as usize * IDENTIFY_LEN;
        let page = &self.pages[offset / PAGE_SIZE];
        let mut buff = [0u8; IDENTIFY_LEN];
        // SAFETY: The region is within the page and no IDENTIFY command is in flight
        unsafe {
            core::ptr::copy_nonoverlapping(
                page.as_ptr().add(offset % PAGE_SIZE),
                buff.as_mut_ptr(),
                IDENTIFY_LEN,
            )
        };
        buff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::kernel_if::MemRegion;
    use crate::driver::kernel_if::test_util::HeapServices;

    #[test]
    fn identify_regions_are_disjoint() {
        let s = HeapServices::new();
        let pages: Vec<_> = (0..IDENTIFY_PAGES)
            .map(|_| DmaRegion::new(&s, 1, MemRegion::Mem64))
            .collect();
        assert_eq!(pages.len(), 4);

        let mut addrs: Vec<_> = (0..32).map(|i| identify_addr(&pages, i)).collect();
        for (i, a) in addrs.iter().enumerate() {
            let page = &pages[i * IDENTIFY_LEN / PAGE_SIZE];
            assert!(*a >= page.phys());
            assert!(*a + IDENTIFY_LEN as u64 <= page.phys() + PAGE_SIZE as u64);
        }
        assert_eq!(identify_addr(&pages, 9), pages[1].phys() + 512);
        addrs.sort();
        assert!(addrs.windows(2).all(|w| w[1] - w[0] >= IDENTIFY_LEN as u64));
    }

    #[test]
    fn identify_region_reads_port_buffer() {
        let s = HeapServices::new();
        let pages = Arc::new(
            (0..IDENTIFY_PAGES)
                .map(|_| DmaRegion::new(&s, 1, MemRegion::Mem64))
                .collect::<Vec<_>>(),
        );
        let region = IdentifyRegion::new(pages.clone(), 10);
        // SAFETY: phys == virt for HeapServices
        unsafe { core::ptr::write_bytes(region.phys() as *mut u8, 0xaa, IDENTIFY_LEN) };
        assert!(region.read().iter().all(|b| *b == 0xaa));
        assert!(IdentifyRegion::new(pages, 11).read().iter().all(|b| *b == 0));
    }
}
