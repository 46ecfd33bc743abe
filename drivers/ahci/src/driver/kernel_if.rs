//! Interfaces the driver requires from the kernel.

use alloc::sync::{Arc, Weak};
use core::ptr::NonNull;
use pci_config::{ConfigSpaceAccessor, DeviceAddress, MmioMapper};

// note: this is 1,6,1 (mass storage, sata, ahci 1.x)
pub const AHCI_CLASS: u32 = 0x01060100; // revision is masked.
pub const AHCI_HBA_BAR: u8 = 5;

pub const PAGE_SIZE: usize = 4096;
pub const MAX_PORTS: usize = 32;

/// Physical address range a DMA allocation must be contained within.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemRegion {
    /// Below 4GiB
    Mem32,
    Mem64,
}

/// Services provided by the kernel.
///
/// MMIO mappings are requested through [MmioMapper] and must be uncached.
pub trait KernelServices: MmioMapper {
    /// Allocates `pages` physically contiguous, zeroed pages within `region`.
    /// Returns the physical address and the virtual address of the allocation.
    fn alloc_dma_pages(&self, pages: usize, region: MemRegion) -> Option<(u64, NonNull<u8>)>;

    /// Frees an allocation returned by [Self::alloc_dma_pages]
    ///
    /// # Safety
    ///
    /// `virt` must have been returned by `alloc_dma_pages` with the same `pages` and must not be
    /// accessed after this call.
    unsafe fn free_dma_pages(&self, phys: u64, virt: NonNull<u8>, pages: usize);

    /// Busy waits for at least `us` microseconds.
    ///
    /// This is called with local interrupts disabled and must not depend on them.
    fn delay_us(&self, us: u64);

    /// Returns a future which completes once `ms` milliseconds have passed.
    fn deadline(&self, ms: u64) -> futures::future::BoxFuture<'static, ()>;

    /// Registers `handler` to be called when `irq` is raised. Delivery must not start until
    /// [Self::set_irq_enabled] is called.
    fn register_irq(&self, irq: u8, handler: Weak<dyn IrqHandler>) -> bool;

    fn set_irq_enabled(&self, irq: u8, enabled: bool);

    /// Runs `f` with local interrupts disabled.
    fn without_interrupts(&self, f: &mut dyn FnMut()) {
        f()
    }
}

/// Runs `f` through [KernelServices::without_interrupts] and returns its result.
pub(crate) fn without_interrupts<R>(services: &dyn KernelServices, f: impl FnOnce() -> R) -> R {
    let mut f = Some(f);
    let mut ret = None;
    services.without_interrupts(&mut || {
        if let Some(f) = f.take() {
            ret = Some(f());
        }
    });
    ret.expect("KernelServices::without_interrupts did not run the closure")
}

/// Called by the kernel when an interrupt line used by the driver is raised.
pub trait IrqHandler: Send + Sync {
    /// Returns whether the interrupt was raised by this handler's device.
    fn handle_irq(&self) -> bool;
}

/// A physically contiguous DMA allocation, freed on drop.
pub struct DmaRegion {
    services: Arc<dyn KernelServices>,
    phys: u64,
    virt: NonNull<u8>,
    pages: usize,
}

// SAFETY: The region is exclusively owned, access to the contents is synchronized by the owner.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocates `pages` pages in `region`.
    ///
    /// # Panics
    ///
    /// This fn will panic if the allocation fails.
    pub fn new(services: &Arc<dyn KernelServices>, pages: usize, region: MemRegion) -> Self {
        let (phys, virt) = services
            .alloc_dma_pages(pages, region)
            .expect("System ran out of memory");
        // SAFETY: The allocation is `pages` pages long
        unsafe { core::ptr::write_bytes(virt.as_ptr(), 0, pages * PAGE_SIZE) };
        Self {
            services: services.clone(),
            phys,
            virt,
            pages,
        }
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: Self owns the allocation
        unsafe {
            self.services
                .free_dma_pages(self.phys, self.virt, self.pages)
        }
    }
}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("pages", &self.pages)
            .finish()
    }
}

/// The configuration of the PCI function implementing the HBA.
#[derive(Debug, Copy, Clone)]
pub struct PciFunction {
    pub address: DeviceAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Physical address of the HBA registers
    pub abar: Option<u64>,
    pub interrupt_line: u8,
}

impl PciFunction {
    /// Reads the function at `address` and checks that it is an AHCI controller.
    ///
    /// On success memory space decoding and bus mastering are enabled.
    pub fn probe<M: MmioMapper>(
        cfg: &ConfigSpaceAccessor<M>,
        address: DeviceAddress,
    ) -> Result<Self, crate::AhciError> {
        use pci_config::regs;

        let (vendor_id, device_id, class, bar, interrupt_line) = {
            let mut l = cfg.lock();
            (
                l.read16_field_locked(address, regs::VENDOR_ID),
                l.read16_field_locked(address, regs::DEVICE_ID),
                l.read32_field_locked(address, regs::REVISION_ID) & !0xff, // mask revision bits
                l.read32_field_locked(address, regs::bar(AHCI_HBA_BAR)),
                l.read8_field_locked(address, regs::INTERRUPT_LINE),
            )
        };

        if class != AHCI_CLASS {
            log::trace!("{address}: class {class:#x} is not AHCI");
            return Err(crate::AhciError::NotAhci);
        }

        // ABAR is a 32bit memory BAR, the low bits are flags
        let abar = match bar & !0x1fff {
            0 => {
                log::error!(
                    "PCI device with class {AHCI_CLASS:#x} (AHCI) did not implement BAR 5; Poisoning device {address}"
                );
                None
            }
            n => Some(n as u64),
        };

        if abar.is_some() {
            cfg.enable_bus_mastering(address);
        }

        Ok(Self {
            address,
            vendor_id,
            device_id,
            abar,
            interrupt_line,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    //! Heap backed kernel services. Physical addresses are the virtual addresses.

    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    pub(crate) struct HeapServices {
        pub(crate) allocated: spin::Mutex<Vec<(u64, usize)>>,
    }

    impl HeapServices {
        pub(crate) fn new() -> Arc<dyn KernelServices> {
            Arc::new(Self {
                allocated: spin::Mutex::new(Vec::new()),
            })
        }
    }

    impl MmioMapper for HeapServices {
        fn map(&self, phys: u64, _len: usize) -> Option<NonNull<u8>> {
            NonNull::new(phys as *mut u8)
        }

        unsafe fn unmap(&self, _virt: NonNull<u8>, _len: usize) {}
    }

    impl KernelServices for HeapServices {
        fn alloc_dma_pages(&self, pages: usize, _region: MemRegion) -> Option<(u64, NonNull<u8>)> {
            let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).ok()?;
            // SAFETY: layout is not zero sized
            let ptr = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })?;
            self.allocated.lock().push((ptr.as_ptr() as u64, pages));
            Some((ptr.as_ptr() as u64, ptr))
        }

        unsafe fn free_dma_pages(&self, _phys: u64, virt: NonNull<u8>, pages: usize) {
            let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            self.allocated
                .lock()
                .retain(|(a, _)| *a != virt.as_ptr() as u64);
            unsafe { alloc::alloc::dealloc(virt.as_ptr(), layout) }
        }

        fn delay_us(&self, _us: u64) {}

        fn deadline(&self, _ms: u64) -> futures::future::BoxFuture<'static, ()> {
            Box::pin(futures::future::pending())
        }

        fn register_irq(&self, _irq: u8, _handler: Weak<dyn IrqHandler>) -> bool {
            true
        }

        fn set_irq_enabled(&self, _irq: u8, _enabled: bool) {}
    }
}
