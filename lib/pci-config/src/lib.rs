//! Memory mapped PCI configuration space access (ECAM).
//!
//! Each bus of a PCI segment occupies 1MiB of physical address space starting at the address
//! reported by the firmware. Within a bus every function has 4KiB of configuration space.
//! [ConfigSpaceAccessor] maps bus regions on demand and keeps recently used mappings in a small
//! cache.
#![cfg_attr(not(test), no_std)]
extern crate alloc;

use alloc::vec::Vec;
use core::fmt::Formatter;
use core::ptr::NonNull;

/// Size of the configuration region for one bus.
pub const BUS_MEMORY_RANGE: u64 = 1 << 20;
/// Size of the configuration region for one function.
pub const DEVICE_SPACE_SIZE: u64 = 4096;
pub const MAX_FUNCTIONS_PER_DEVICE: u64 = 8;
pub const MAX_DEVICES_PER_BUS: u8 = 32;

/// Offsets of the type 0 header registers.
pub mod regs {
    pub const VENDOR_ID: u32 = 0x00;
    pub const DEVICE_ID: u32 = 0x02;
    pub const COMMAND: u32 = 0x04;
    pub const STATUS: u32 = 0x06;
    pub const REVISION_ID: u32 = 0x08;
    pub const PROG_IF: u32 = 0x09;
    pub const SUBCLASS: u32 = 0x0a;
    pub const CLASS: u32 = 0x0b;
    pub const HEADER_TYPE: u32 = 0x0e;
    pub const BAR0: u32 = 0x10;
    pub const INTERRUPT_LINE: u32 = 0x3c;
    pub const INTERRUPT_PIN: u32 = 0x3d;

    /// Returns the offset of BAR `n`
    ///
    /// # Panics
    ///
    /// This fn will panic if `n > 5`
    pub const fn bar(n: u8) -> u32 {
        assert!(n < 6);
        BAR0 + n as u32 * 4
    }
}

/// Bits within the command register.
pub mod command {
    pub const IO_SPACE: u16 = 1;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
    pub const INTERRUPT_DISABLE: u16 = 1 << 10;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceAddress {
    segment_group: u16,
    bus: u8,
    device: u8,
    function: u8,
}

impl DeviceAddress {
    /// Creates a new device address ath the given address
    ///
    /// # Panics
    ///
    /// This fn will panic if the `device >= 32` or `function >= 8`.
    pub fn new(segment_group: u16, bus: u8, device: u8, function: u8) -> Self {
        assert!(device < MAX_DEVICES_PER_BUS);
        assert!((function as u64) < MAX_FUNCTIONS_PER_DEVICE);

        Self {
            segment_group,
            bus,
            device,
            function,
        }
    }

    pub fn segment(&self) -> u16 {
        self.segment_group
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn device(&self) -> u8 {
        self.device
    }

    pub fn function(&self) -> u8 {
        self.function
    }

    /// Returns the offset of this function's configuration space from the start of its bus region.
    pub fn function_offset(&self) -> u64 {
        DEVICE_SPACE_SIZE * self.function as u64
            + DEVICE_SPACE_SIZE * MAX_FUNCTIONS_PER_DEVICE * self.device as u64
    }
}

impl core::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment_group, self.bus, self.device, self.function
        )
    }
}

/// Describes the PCI segment handled by a host bridge.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Domain {
    pub segment: u16,
    pub start_bus: u8,
    pub end_bus: u8,
}

impl Domain {
    pub fn contains(&self, bus: u8) -> bool {
        bus >= self.start_bus && bus <= self.end_bus
    }
}

/// Maps physical memory into the virtual address space.
pub trait MmioMapper: Send + Sync {
    /// Maps `len` bytes of physical memory at `phys` as uncached memory and returns the virtual
    /// address. Returns `None` when the region cannot be mapped.
    fn map(&self, phys: u64, len: usize) -> Option<NonNull<u8>>;

    /// Unmaps a region previously returned by [Self::map].
    ///
    /// # Safety
    ///
    /// `virt` and `len` must describe a region returned by `map` which is no longer accessed.
    unsafe fn unmap(&self, virt: NonNull<u8>, len: usize);
}

/// Number of bus regions kept mapped when no capacity is given.
pub const DEFAULT_CACHED_BUSES: usize = 1;

/// Accesses the configuration space of a single PCI segment through its memory mapped region.
pub struct ConfigSpaceAccessor<M: MmioMapper> {
    domain: Domain,
    start_address: u64,
    mapper: M,
    cache: spin::Mutex<BusCache>,
}

struct MappedBus {
    bus: u8,
    virt: NonNull<u8>,
}

// SAFETY: The mapping is owned by the cache and only accessed while it is locked.
unsafe impl Send for MappedBus {}

/// Least recently used bus mappings. The most recently used entry is at the back.
struct BusCache {
    entries: Vec<MappedBus>,
    capacity: usize,
}

impl<M: MmioMapper> ConfigSpaceAccessor<M> {
    pub fn new(domain: Domain, start_address: u64, mapper: M) -> Self {
        Self::with_cache_capacity(domain, start_address, mapper, DEFAULT_CACHED_BUSES)
    }

    /// Creates a new accessor which keeps up to `capacity` bus regions mapped.
    ///
    /// # Panics
    ///
    /// This fn will panic if `capacity == 0`
    pub fn with_cache_capacity(domain: Domain, start_address: u64, mapper: M, capacity: usize) -> Self {
        assert_ne!(capacity, 0);
        Self {
            domain,
            start_address,
            mapper,
            cache: spin::Mutex::new(BusCache {
                entries: Vec::with_capacity(capacity),
                capacity,
            }),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Returns the physical address of the configuration region for `bus`
    pub fn base_address_for_bus(&self, bus: u8) -> u64 {
        let index = bus - bus.min(self.domain.start_bus);
        self.start_address + BUS_MEMORY_RANGE * index as u64
    }

    /// Acquires the access lock. All configuration space accesses are serialized through this lock.
    pub fn lock(&self) -> ConfigSpaceGuard<'_, M> {
        ConfigSpaceGuard {
            accessor: self,
            cache: self.cache.lock(),
        }
    }

    pub fn read8_field(&self, address: DeviceAddress, field: u32) -> u8 {
        self.lock().read8_field_locked(address, field)
    }

    pub fn read16_field(&self, address: DeviceAddress, field: u32) -> u16 {
        self.lock().read16_field_locked(address, field)
    }

    pub fn read32_field(&self, address: DeviceAddress, field: u32) -> u32 {
        self.lock().read32_field_locked(address, field)
    }

    pub fn write8_field(&self, address: DeviceAddress, field: u32, value: u8) {
        self.lock().write8_field_locked(address, field, value)
    }

    pub fn write16_field(&self, address: DeviceAddress, field: u32, value: u16) {
        self.lock().write16_field_locked(address, field, value)
    }

    pub fn write32_field(&self, address: DeviceAddress, field: u32, value: u32) {
        self.lock().write32_field_locked(address, field, value)
    }

    /// Enables memory space decoding and bus mastering for the function at `address`.
    pub fn enable_bus_mastering(&self, address: DeviceAddress) {
        let mut l = self.lock();
        let cmd = l.read16_field_locked(address, regs::COMMAND);
        let new = cmd | command::MEMORY_SPACE | command::BUS_MASTER;
        if new != cmd {
            log::trace!("{address}: command {cmd:#x} -> {new:#x}");
            l.write16_field_locked(address, regs::COMMAND, new);
        }
    }
}

impl<M: MmioMapper> Drop for ConfigSpaceAccessor<M> {
    fn drop(&mut self) {
        let cache = self.cache.get_mut();
        for e in cache.entries.drain(..) {
            // SAFETY: The accessor is being dropped, no references into the region remain.
            unsafe { self.mapper.unmap(e.virt, BUS_MEMORY_RANGE as usize) }
        }
    }
}

/// Holds the access lock of a [ConfigSpaceAccessor].
pub struct ConfigSpaceGuard<'a, M: MmioMapper> {
    accessor: &'a ConfigSpaceAccessor<M>,
    cache: spin::MutexGuard<'a, BusCache>,
}

impl<M: MmioMapper> ConfigSpaceGuard<'_, M> {
    /// Returns the virtual address of the region for `bus`, mapping it if required.
    ///
    /// # Panics
    ///
    /// This fn will panic if the region cannot be mapped. The configuration space is required to
    /// drive any device on the bus.
    fn map_bus_region(&mut self, bus: u8) -> NonNull<u8> {
        let cache = &mut *self.cache;
        if let Some(pos) = cache.entries.iter().position(|e| e.bus == bus) {
            let e = cache.entries.remove(pos);
            let virt = e.virt;
            cache.entries.push(e);
            return virt;
        }

        if cache.entries.len() == cache.capacity {
            let evicted = cache.entries.remove(0);
            log::trace!("PCI: unmapping bus {:#x}", evicted.bus);
            // SAFETY: References into the region never outlive a field access, which requires the lock.
            unsafe {
                self.accessor
                    .mapper
                    .unmap(evicted.virt, BUS_MEMORY_RANGE as usize)
            };
        }

        let phys = self.accessor.base_address_for_bus(bus);
        let virt = self
            .accessor
            .mapper
            .map(phys, BUS_MEMORY_RANGE as usize)
            .unwrap_or_else(|| {
                panic!("PCI: failed to map configuration space for bus {bus:#x} at {phys:#x}")
            });
        cache.entries.push(MappedBus { bus, virt });
        virt
    }

    fn field_ptr<T>(&mut self, address: DeviceAddress, field: u32) -> *mut T {
        assert_eq!(address.segment(), self.accessor.domain.segment);
        assert!(
            self.accessor.domain.contains(address.bus()),
            "PCI: bus {:#x} is outside of {:?}",
            address.bus(),
            self.accessor.domain
        );
        let base = self.map_bus_region(address.bus());
        // SAFETY: The function region lies within the mapped 1MiB bus region and `field` was bounds checked.
        unsafe {
            base.as_ptr()
                .add((address.function_offset() + field as u64) as usize)
                .cast()
        }
    }

    pub fn read8_field_locked(&mut self, address: DeviceAddress, field: u32) -> u8 {
        assert!(field <= 0xfff);
        let ptr = self.field_ptr::<u8>(address, field);
        // SAFETY: ptr points into mapped configuration space.
        volatile::Volatile::new(unsafe { &*ptr }).read()
    }

    /// Panics if `field` is not a multiple of two or runs past the end of the function's space.
    pub fn read16_field_locked(&mut self, address: DeviceAddress, field: u32) -> u16 {
        assert!(field < 0xfff);
        assert_eq!(field % 2, 0, "PCI: misaligned word access at {field:#x}");
        let ptr = self.field_ptr::<u16>(address, field);
        // SAFETY: ptr points into mapped configuration space.
        volatile::Volatile::new(unsafe { &*ptr }).read()
    }

    /// Panics if `field` is not a multiple of four or runs past the end of the function's space.
    pub fn read32_field_locked(&mut self, address: DeviceAddress, field: u32) -> u32 {
        assert!(field <= 0xffc);
        assert_eq!(field % 4, 0, "PCI: misaligned dword access at {field:#x}");
        let ptr = self.field_ptr::<u32>(address, field);
        // SAFETY: ptr points into mapped configuration space.
        volatile::Volatile::new(unsafe { &*ptr }).read()
    }

    pub fn write8_field_locked(&mut self, address: DeviceAddress, field: u32, value: u8) {
        assert!(field <= 0xfff);
        let ptr = self.field_ptr::<u8>(address, field);
        // SAFETY: ptr points into mapped configuration space.
        volatile::Volatile::new(unsafe { &mut *ptr }).write(value)
    }

    /// Panics if `field` is not a multiple of two or runs past the end of the function's space.
    pub fn write16_field_locked(&mut self, address: DeviceAddress, field: u32, value: u16) {
        assert!(field < 0xfff);
        assert_eq!(field % 2, 0, "PCI: misaligned word access at {field:#x}");
        let ptr = self.field_ptr::<u16>(address, field);
        // SAFETY: ptr points into mapped configuration space.
        volatile::Volatile::new(unsafe { &mut *ptr }).write(value)
    }

    /// Panics if `field` is not a multiple of four or runs past the end of the function's space.
    pub fn write32_field_locked(&mut self, address: DeviceAddress, field: u32, value: u32) {
        assert!(field <= 0xffc);
        assert_eq!(field % 4, 0, "PCI: misaligned dword access at {field:#x}");
        let ptr = self.field_ptr::<u32>(address, field);
        // SAFETY: ptr points into mapped configuration space.
        volatile::Volatile::new(unsafe { &mut *ptr }).write(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ECAM_BASE: u64 = 0xe000_0000;
    const BUSES: usize = 4;

    /// Backs the ECAM window with heap memory.
    struct FakeEcam {
        memory: *mut u8,
        maps: AtomicUsize,
        unmaps: AtomicUsize,
    }

    unsafe impl Send for FakeEcam {}
    unsafe impl Sync for FakeEcam {}

    impl FakeEcam {
        fn new() -> Arc<Self> {
            let memory = vec![0u8; BUSES * BUS_MEMORY_RANGE as usize].leak().as_mut_ptr();
            Arc::new(Self {
                memory,
                maps: AtomicUsize::new(0),
                unmaps: AtomicUsize::new(0),
            })
        }

        fn raw(&self, offset: u64) -> *mut u8 {
            unsafe { self.memory.add(offset as usize) }
        }
    }

    impl MmioMapper for Arc<FakeEcam> {
        fn map(&self, phys: u64, len: usize) -> Option<NonNull<u8>> {
            let offset = phys.checked_sub(ECAM_BASE)?;
            if offset as usize + len > BUSES * BUS_MEMORY_RANGE as usize {
                return None;
            }
            self.maps.fetch_add(1, Ordering::Relaxed);
            NonNull::new(self.raw(offset))
        }

        unsafe fn unmap(&self, _virt: NonNull<u8>, _len: usize) {
            self.unmaps.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn domain() -> Domain {
        Domain {
            segment: 0,
            start_bus: 0,
            end_bus: (BUSES - 1) as u8,
        }
    }

    #[test]
    fn write_then_read_dword() {
        let ecam = FakeEcam::new();
        let cfg = ConfigSpaceAccessor::new(domain(), ECAM_BASE, ecam.clone());
        let addr = DeviceAddress::new(0, 0, 1, 2);

        cfg.write32_field(addr, 0x10, 0xdead_beef);
        assert_eq!(cfg.read32_field(addr, 0x10), 0xdead_beef);

        let offset = 4096 * 2 + 4096 * 8 * 1 + 0x10;
        let raw = unsafe { core::ptr::read_unaligned(ecam.raw(offset).cast::<u32>()) };
        assert_eq!(raw, 0xdead_beef);
    }

    #[test]
    fn narrow_accesses_share_storage() {
        let ecam = FakeEcam::new();
        let cfg = ConfigSpaceAccessor::new(domain(), ECAM_BASE, ecam);
        let addr = DeviceAddress::new(0, 2, 31, 7);

        cfg.write32_field(addr, 0, 0x2922_8086);
        assert_eq!(cfg.read16_field(addr, regs::VENDOR_ID), 0x8086);
        assert_eq!(cfg.read16_field(addr, regs::DEVICE_ID), 0x2922);
        assert_eq!(cfg.read8_field(addr, 3), 0x29);

        cfg.write8_field(addr, 0xfff, 0x5a);
        assert_eq!(cfg.read8_field(addr, 0xfff), 0x5a);
    }

    #[test]
    fn bus_base_is_relative_to_start_bus() {
        let ecam = FakeEcam::new();
        let d = Domain {
            segment: 0,
            start_bus: 2,
            end_bus: 5,
        };
        let cfg = ConfigSpaceAccessor::new(d, ECAM_BASE, ecam);
        assert_eq!(cfg.base_address_for_bus(2), ECAM_BASE);
        assert_eq!(cfg.base_address_for_bus(3), ECAM_BASE + BUS_MEMORY_RANGE);
    }

    #[test]
    fn single_bus_cache_remaps() {
        let ecam = FakeEcam::new();
        let cfg = ConfigSpaceAccessor::new(domain(), ECAM_BASE, ecam.clone());

        cfg.read32_field(DeviceAddress::new(0, 0, 0, 0), 0);
        cfg.read32_field(DeviceAddress::new(0, 0, 3, 0), 0);
        assert_eq!(ecam.maps.load(Ordering::Relaxed), 1);

        cfg.read32_field(DeviceAddress::new(0, 1, 0, 0), 0);
        assert_eq!(ecam.maps.load(Ordering::Relaxed), 2);
        assert_eq!(ecam.unmaps.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn lru_evicts_least_recent() {
        let ecam = FakeEcam::new();
        let cfg = ConfigSpaceAccessor::with_cache_capacity(domain(), ECAM_BASE, ecam.clone(), 2);

        cfg.read32_field(DeviceAddress::new(0, 0, 0, 0), 0);
        cfg.read32_field(DeviceAddress::new(0, 1, 0, 0), 0);
        // bus 0 becomes most recent
        cfg.read32_field(DeviceAddress::new(0, 0, 0, 0), 0);
        // evicts bus 1
        cfg.read32_field(DeviceAddress::new(0, 2, 0, 0), 0);
        assert_eq!(ecam.maps.load(Ordering::Relaxed), 3);

        cfg.read32_field(DeviceAddress::new(0, 0, 0, 0), 0);
        assert_eq!(ecam.maps.load(Ordering::Relaxed), 3);
        cfg.read32_field(DeviceAddress::new(0, 1, 0, 0), 0);
        assert_eq!(ecam.maps.load(Ordering::Relaxed), 4);
        assert_eq!(ecam.unmaps.load(Ordering::Relaxed), 2);

        drop(cfg);
        assert_eq!(ecam.unmaps.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn enable_bus_mastering_sets_bits() {
        let ecam = FakeEcam::new();
        let cfg = ConfigSpaceAccessor::new(domain(), ECAM_BASE, ecam);
        let addr = DeviceAddress::new(0, 0, 31, 2);

        cfg.write16_field(addr, regs::COMMAND, command::IO_SPACE);
        cfg.enable_bus_mastering(addr);
        assert_eq!(
            cfg.read16_field(addr, regs::COMMAND),
            command::IO_SPACE | command::MEMORY_SPACE | command::BUS_MASTER
        );
    }

    #[test]
    #[should_panic]
    fn dword_field_out_of_bounds() {
        let cfg = ConfigSpaceAccessor::new(domain(), ECAM_BASE, FakeEcam::new());
        cfg.read32_field(DeviceAddress::new(0, 0, 0, 0), 0xffd);
    }

    #[test]
    #[should_panic]
    fn word_field_out_of_bounds() {
        let cfg = ConfigSpaceAccessor::new(domain(), ECAM_BASE, FakeEcam::new());
        cfg.write16_field(DeviceAddress::new(0, 0, 0, 0), 0xfff, 0);
    }

    #[test]
    #[should_panic]
    fn unmappable_bus_is_fatal() {
        let d = Domain {
            segment: 0,
            start_bus: 0,
            end_bus: 0xff,
        };
        let cfg = ConfigSpaceAccessor::new(d, ECAM_BASE, FakeEcam::new());
        cfg.read32_field(DeviceAddress::new(0, 0x80, 0, 0), 0);
    }

    #[test]
    #[should_panic(expected = "misaligned dword")]
    fn misaligned_dword_write_is_rejected() {
        let ecam = FakeEcam::new();
        let cfg = ConfigSpaceAccessor::new(domain(), ECAM_BASE, ecam);
        cfg.write32_field(DeviceAddress::new(0, 0, 1, 0), 0x12, 0);
    }

    #[test]
    #[should_panic(expected = "misaligned word")]
    fn misaligned_word_read_is_rejected() {
        let ecam = FakeEcam::new();
        let cfg = ConfigSpaceAccessor::new(domain(), ECAM_BASE, ecam);
        cfg.read16_field(DeviceAddress::new(0, 0, 1, 0), 0x3);
    }

    #[test]
    fn address_display() {
        assert_eq!(DeviceAddress::new(0, 0, 0x1f, 2).to_string(), "0000:00:1f.2");
    }
}
