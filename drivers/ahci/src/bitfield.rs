use crate::register::{ReadOnly, ReadWrite, ReadWriteClear, Register};
use alloc::vec::Vec;

/// A view over a 32 bit register where only the bits within `mask` are visible.
///
/// This is used for registers which contain a bit per port e.g. PI and IS. Each user of the
/// register only sees, and may only modify, the bits it owns.
///
/// The methods available depend on the access mode `M` of the register.
/// - `ReadOnly` registers may only be queried.
/// - `ReadWrite` registers may have bits set or cleared.
/// - `ReadWriteClear` registers are acknowledged. Setting a bit writes `1` to that bit only, which
///   clears it in hardware.
pub struct MaskedBitField<'a, M = ReadOnly> {
    register: &'a Register<u32, M>,
    mask: u32,
}

impl<'a, M> MaskedBitField<'a, M> {
    pub(crate) fn new(register: &'a Register<u32, M>, mask: u32) -> Self {
        Self { register, mask }
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Returns the visible bits of the register.
    pub fn raw(&self) -> u32 {
        self.register.read() & self.mask
    }

    /// Returns whether bit `index` is set.
    ///
    /// # Panics
    ///
    /// This fn will panic if `index >= 32` or `index` is outside of the mask.
    pub fn is_set_at(&self, index: u8) -> bool {
        Self::check(self.mask, index);
        self.raw() & (1 << index) != 0
    }

    /// Returns the indices of all set bits in ascending order.
    pub fn to_vec(&self) -> Vec<u8> {
        let raw = self.raw();
        (0..32u8).filter(|i| raw & (1 << i) != 0).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.raw() == 0
    }

    fn check(mask: u32, index: u8) {
        assert!(index < 32);
        assert_ne!(
            mask & (1 << index),
            0,
            "bit {index} is not in mask {mask:#010x}"
        );
    }
}

impl MaskedBitField<'_, ReadWrite> {
    pub fn set_at(&self, index: u8) {
        Self::check(self.mask, index);
        self.register.update(|r| *r |= 1 << index);
    }

    pub fn clear_at(&self, index: u8) {
        Self::check(self.mask, index);
        self.register.update(|r| *r &= !(1 << index));
    }

    pub fn set_all(&self) {
        let mask = self.mask;
        self.register.update(|r| *r |= mask);
    }

    pub fn clear_all(&self) {
        let mask = self.mask;
        self.register.update(|r| *r &= !mask);
    }
}

impl MaskedBitField<'_, ReadWriteClear<u32>> {
    /// Acknowledges bit `index`
    pub fn set_at(&self, index: u8) {
        Self::check(self.mask, index);
        self.register.clear(1u32 << index);
    }

    /// Acknowledges every bit within the mask.
    pub fn set_all(&self) {
        self.register.clear(self.mask);
    }

    /// Acknowledges the bits of `bits` which lie within the mask in a single write.
    pub fn ack(&self, bits: u32) {
        self.register.clear(bits & self.mask);
    }
}

impl<M> core::fmt::Debug for MaskedBitField<'_, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MaskedBitField")
            .field("mask", &format_args!("{:#010x}", self.mask))
            .field("value", &format_args!("{:#010x}", self.raw()))
            .finish()
    }
}
