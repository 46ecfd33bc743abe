use core::cell::UnsafeCell;
use core::fmt::{Debug, Formatter};

/// A single memory mapped register.
///
/// All accesses are volatile. Registers are accessed through shared references because the HBA
/// may modify them at any time, callers serialize read-modify-write sequences with the lock
/// owning the register block.
#[repr(transparent)]
pub(crate) struct Register<T, M = ReadWrite> {
    inner: UnsafeCell<T>,
    _phantom: core::marker::PhantomData<M>,
}

// SAFETY: Every access is a single volatile read or write of `T`
unsafe impl<T: Send, M> Sync for Register<T, M> {}

impl<T, M> Debug for Register<T, M>
where
    T: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(&self.read(), f)
    }
}

impl<T, M> Register<T, M> {
    /// Performs a volatile read and returns the inner data
    pub(crate) fn read(&self) -> T {
        // SAFETY: The pointer is derived from a reference and is valid for reads
        unsafe { core::ptr::read_volatile(self.inner.get()) }
    }

    /// Uses a volatile write to store the data
    pub(crate) fn write(&self, mut src: T)
    where
        M: ReadWriteMarker,
        T: ClearReserved,
    {
        src.clear_reserved();
        // SAFETY: The pointer is derived from a reference and is valid for writes
        unsafe { core::ptr::write_volatile(self.inner.get(), src) }
    }

    /// Writes the acknowledgement `src` into a write-1-to-clear register.
    pub(crate) fn clear<C: Acknowledge<T>>(&self, src: C)
    where
        M: Read1ClearMarker<C>,
    {
        // SAFETY: The pointer is derived from a reference and is valid for writes
        unsafe { core::ptr::write_volatile(self.inner.get(), src.ack()) }
    }

    /// Reads the register, runs `f` on the value and writes the result back.
    pub(crate) fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
        M: ReadWriteMarker,
        T: ClearReserved,
    {
        let mut t = self.read();
        f(&mut t);
        self.write(t);
    }
}

/// This struct is used to clear flags that require writing 1 to clear.
///
/// # Safety
///
/// It is the responsibility of the implementation to ensure that reserved bits are cleared to 0.
pub unsafe trait Acknowledge<T> {
    /// Creates an acknowledgement for `other`. This allows responding while preserving reserved bits.
    fn ack(self) -> T
    where
        Self: Sized;
}

/// Used by [Register::write] to clear all reserved bits.
///
/// # Safety
///
/// It is the responsibility of the implementation to ensure that all reserved bits are set to 0.
pub unsafe trait ClearReserved {
    fn clear_reserved(&mut self);
}

// SAFETY: Plain registers have no reserved bits.
unsafe impl ClearReserved for u32 {
    fn clear_reserved(&mut self) {}
}

// SAFETY: Writing a raw mask writes 1 only to the selected bits.
unsafe impl Acknowledge<u32> for u32 {
    fn ack(self) -> u32 {
        self
    }
}

pub struct ReadWrite;

pub trait ReadWriteMarker {}

impl ReadWriteMarker for ReadWrite {}

pub struct ReadOnly;

#[derive(Default)]
pub struct ReadWriteClear<T> {
    _phantom: core::marker::PhantomData<T>,
}

impl<T> Read1ClearMarker<T> for ReadWriteClear<T> {}

pub trait Read1ClearMarker<T> {}

#[derive(Default)]
/// A bit of everything
pub struct Aboe<T> {
    _phantom: core::marker::PhantomData<T>,
}

impl<T> ReadWriteMarker for Aboe<T> {}

impl<T> Read1ClearMarker<T> for Aboe<T> {}

/// This struct contains a physical address used by the HBA. The HBA may only support 32 bit addressing
///
/// The address is split into two registers which must be written individually.
#[repr(C)]
pub(crate) struct HbaAddr<const ALIGN: u32> {
    low: UnsafeCell<u32>,
    high: UnsafeCell<u32>,
}

// SAFETY: Accesses are volatile and serialized by the owning port lock
unsafe impl<const ALIGN: u32> Sync for HbaAddr<ALIGN> {}

impl<const ALIGN: u32> HbaAddr<ALIGN> {
    /// Sets the address of self to `addr`.
    ///
    /// # Panics
    ///
    /// This fn will panic if `addr` is not aligned to `ALIGN`
    pub(crate) fn set(&self, addr: u64) {
        assert_eq!(addr & (ALIGN - 1) as u64, 0);
        // SAFETY: Both pointers are derived from references
        unsafe {
            core::ptr::write_volatile(self.low.get(), addr as u32);
            core::ptr::write_volatile(self.high.get(), (addr >> 32) as u32);
        }
    }

    pub(crate) fn read(&self) -> u64 {
        // SAFETY: Both pointers are derived from references
        unsafe {
            let low = core::ptr::read_volatile(self.low.get()) as u64;
            let high = core::ptr::read_volatile(self.high.get()) as u64;
            high << 32 | low
        }
    }
}

impl<const ALIGN: u32> Debug for HbaAddr<ALIGN> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hba_addr_is_split() {
        let mut raw = [0u32; 2];
        let ptr = raw.as_mut_ptr();
        let addr: &HbaAddr<1024> = unsafe { &*ptr.cast() };
        addr.set(0x1_2345_6400);
        unsafe {
            assert_eq!(ptr.read_volatile(), 0x2345_6400);
            assert_eq!(ptr.add(1).read_volatile(), 1);
        }
        assert_eq!(addr.read(), 0x1_2345_6400);
    }

    #[test]
    #[should_panic]
    fn hba_addr_alignment() {
        let mut raw = [0u32; 2];
        let addr: &HbaAddr<1024> = unsafe { &*raw.as_mut_ptr().cast() };
        addr.set(0x200);
    }

    #[test]
    fn update_preserves_other_bits() {
        let mut raw = 0xf0u32;
        let reg: &Register<u32> = unsafe { &*(&mut raw as *mut u32).cast() };
        reg.update(|v| *v |= 1);
        assert_eq!(reg.read(), 0xf1);
    }
}
