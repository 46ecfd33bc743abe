use super::kernel_if::{DmaRegion, KernelServices, MemRegion, PAGE_SIZE};
use crate::hba::CmdIndex;
use crate::hba::command::frame_information_structure::{ReceivedFis, RegisterHostToDevFis};
use crate::hba::command::{
    CMD_LIST_OFFSET, CommandHeader, CommandTable, MAX_PRD_BYTES, PRDT_LEN,
    PhysicalRegionDescription, RECEIVED_FIS_OFFSET,
};
use alloc::sync::Arc;

const TABLE_SIZE: usize = core::mem::size_of::<CommandTable>();

/// CmdList owns the DMA memory used by a port to issue commands.
///
/// - One page containing the command list and the received FIS area.
/// - One region containing a command table for each implemented command slot.
/// - One region containing a data buffer for each implemented command slot.
///
/// Each slot is only accessed by the holder of the slot, see [SlotTracker].
// the list must never be reordered, the HBA holds the physical addresses.
pub(super) struct CmdList {
    list: DmaRegion,
    tables: DmaRegion,
    buffers: DmaRegion,
    buffer_len: usize,
    depth: u8,
    is_64_bit: bool,
}

impl CmdList {
    /// Allocates a new command list with tables and buffers for `depth` command slots.
    /// Each slot is given `buffer_pages` pages of data buffer.
    pub(super) fn new(
        services: &Arc<dyn KernelServices>,
        region: MemRegion,
        depth: u8,
        buffer_pages: usize,
    ) -> Self {
        assert!(depth > 0 && depth <= 32);
        assert!(buffer_pages > 0);

        let list = DmaRegion::new(services, 1, region);
        let tables = DmaRegion::new(
            services,
            (depth as usize * TABLE_SIZE).div_ceil(PAGE_SIZE),
            region,
        );
        let buffers = DmaRegion::new(services, depth as usize * buffer_pages, region);

        let ret = Self {
            list,
            tables,
            buffers,
            buffer_len: buffer_pages * PAGE_SIZE,
            depth,
            is_64_bit: region == MemRegion::Mem64,
        };

        for i in 0..depth as usize {
            // SAFETY: The table is within `tables`
            unsafe {
                ret.headers()[i].set_table(ret.tables.phys() + (i * TABLE_SIZE) as u64);
            }
        }

        ret
    }

    pub(super) fn headers(&self) -> &[CommandHeader; 32] {
        // SAFETY: The list is at the start of a zeroed page and is only modified through `Register`s
        unsafe { &*self.list.as_ptr().add(CMD_LIST_OFFSET).cast() }
    }

    pub(super) fn received_fis(&self) -> &ReceivedFis {
        // SAFETY: The FIS area is 256 byte aligned within the list page
        unsafe { &*self.list.as_ptr().add(RECEIVED_FIS_OFFSET).cast() }
    }

    /// Physical address of the command list, for PxCLB
    pub(super) fn list_addr(&self) -> u64 {
        self.list.phys() + CMD_LIST_OFFSET as u64
    }

    /// Physical address of the received FIS area, for PxFB
    pub(super) fn fis_addr(&self) -> u64 {
        self.list.phys() + RECEIVED_FIS_OFFSET as u64
    }

    pub(super) fn depth(&self) -> u8 {
        self.depth
    }

    /// Size in bytes of each slot buffer.
    pub(super) fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Returns the physical and virtual addresses of the data buffer for `slot`.
    pub(super) fn buffer(&self, slot: CmdIndex) -> (u64, *mut u8) {
        assert!(slot.index() < self.depth);
        let offset = slot.index() as usize * self.buffer_len;
        // SAFETY: offset is within `buffers`
        (self.buffers.phys() + offset as u64, unsafe {
            self.buffers.as_ptr().add(offset)
        })
    }

    /// # Safety
    ///
    /// The caller must hold `slot`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self, slot: CmdIndex) -> &mut CommandTable {
        assert!(slot.index() < self.depth);
        // SAFETY: The table is within `tables` and the caller has exclusive access to it.
        unsafe {
            &mut *self
                .tables
                .as_ptr()
                .add(slot.index() as usize * TABLE_SIZE)
                .cast()
        }
    }

    /// Copies `data` into the buffer for `slot`.
    ///
    /// # Safety
    ///
    /// The caller must hold `slot` and the HBA must not be accessing the buffer.
    pub(super) unsafe fn fill_buffer(&self, slot: CmdIndex, data: &[u8]) {
        assert!(data.len() <= self.buffer_len);
        let (_, ptr) = self.buffer(slot);
        // SAFETY: Guaranteed by caller
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) }
    }

    /// Copies `len` bytes out of the buffer for `slot`.
    ///
    /// # Safety
    ///
    /// See [Self::fill_buffer]
    pub(super) unsafe fn read_buffer(&self, slot: CmdIndex, len: usize) -> alloc::vec::Vec<u8> {
        assert!(len <= self.buffer_len);
        let (_, ptr) = self.buffer(slot);
        let mut v = alloc::vec![0u8; len];
        // SAFETY: Guaranteed by caller
        unsafe { core::ptr::copy_nonoverlapping(ptr, v.as_mut_ptr(), len) };
        v
    }

    /// Builds the command in `slot`. The FIS is written into the command table, the PRDT is built
    /// for `data` (physical address, length) and the command header is updated.
    ///
    /// `data` must be aligned to `2` and must have an even length or this will return
    /// [CommandError::BadBuffer]. If the HBA only supports 32bit addressing then the region must
    /// be entirely below 4GiB otherwise this fn will return [CommandError::BadAddress].
    ///
    /// When `data` cannot be described by the PRDT this returns `Err(CommandError::BuffTooLong(n))`
    /// where `n` is the number of bytes that would fit. The slot must not be issued.
    ///
    /// # Safety
    ///
    /// The caller must hold `slot`.
    pub(super) unsafe fn build(
        &self,
        slot: CmdIndex,
        fis: &RegisterHostToDevFis,
        data: Option<(u64, usize)>,
        write: bool,
    ) -> Result<(), CommandError> {
        // SAFETY: Guaranteed by caller
        let table = unsafe { self.table_mut(slot) };

        let mut prdt_len = 0;
        if let Some((addr, len)) = data {
            if len == 0 || len % 2 != 0 || addr % 2 != 0 {
                return Err(CommandError::BadBuffer);
            }
            if !self.is_64_bit && addr + len as u64 - 1 > u32::MAX as u64 {
                return Err(CommandError::BadAddress);
            }
            if len > PRDT_LEN * MAX_PRD_BYTES as usize {
                return Err(CommandError::BuffTooLong(PRDT_LEN * MAX_PRD_BYTES as usize));
            }

            let mut rem = len;
            let mut addr = addr;
            while rem > 0 {
                let chunk = rem.min(MAX_PRD_BYTES as usize);
                let prd = PhysicalRegionDescription::new(addr, chunk as u32)
                    .ok_or(CommandError::BadBuffer)?;
                table.set_prd(prdt_len, prd);
                prdt_len += 1;
                addr += chunk as u64;
                rem -= chunk;
            }
        }

        table.command_fis.send_cmd(fis);
        self.headers()[slot.index() as usize].prepare(prdt_len as u16, write);
        log::trace!("Built {slot}: {fis:?}, {prdt_len} PRDs");
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandError {
    /// Attempted to use a 64bit address on a device does not support 64bit addressing.
    BadAddress,
    /// Given buffer is too long, contained value contains the number of bytes which can be
    /// described by a single command.
    BuffTooLong(usize),
    /// A buffer likely has some requirements to it to be usable, any functions that may return
    /// this should define a usable buffer.
    BadBuffer,
}

/// Returned when every command slot is in use.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueFull;

/// This struct is to allow for the locking of command slots by the driver.
///
/// When a thread locates a free command it must set up a FIS and send the command before the CI bit
/// is set, during this time another thread may attempt to use this command slot. The entire port
/// can be placed within a mutex but this may have a high performance impact.
/// This struct minimizes this performance impact by only spinning while a free command is located.
/// This struct also allows command slots to be freed regardless of the lock.
pub(super) struct SlotTracker {
    lock: core::sync::atomic::AtomicBool,
    cmd: [atomic::Atomic<SlotState>; 32],
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub(super) enum SlotState {
    /// The slot is free.
    Unlocked,
    /// Slot is claimed but not issued. Command completion checks should ignore any command slots
    /// with this state.
    Setup,
    /// Slot is issued to the device. The command is complete when its PxCI bit is clear.
    Running,
    /// The device has finished the command and the driver is retiring it.
    Completing,
}

impl SlotTracker {
    pub(super) fn new() -> Self {
        Self {
            lock: core::sync::atomic::AtomicBool::new(false),
            cmd: core::array::from_fn(|_| atomic::Atomic::new(SlotState::Unlocked)),
        }
    }

    /// Returns the first slot below `depth` which is neither claimed nor set in `ci`.
    pub(super) fn find_free(&self, ci: u32, depth: u8) -> Result<CmdIndex, QueueFull> {
        (0..depth)
            .find(|&i| {
                ci & (1 << i) == 0
                    && self.cmd[i as usize].load(atomic::Ordering::Relaxed) == SlotState::Unlocked
            })
            .and_then(CmdIndex::new)
            .ok_or(QueueFull)
    }

    /// Claims the first free slot and returns it's index.
    pub(super) fn claim(&self, ci: u32, depth: u8) -> Result<CmdIndex, QueueFull> {
        while self
            .lock
            .compare_exchange_weak(
                false,
                true,
                atomic::Ordering::Acquire,
                atomic::Ordering::Relaxed,
            )
            .is_err()
        {
            core::hint::spin_loop();
        }

        let ret = self.find_free(ci, depth);
        if let Ok(slot) = ret {
            self.cmd[slot.index() as usize].store(SlotState::Setup, atomic::Ordering::Relaxed);
        }
        self.lock.store(false, atomic::Ordering::Release);
        ret
    }

    /// Changes the slot state from [SlotState::Setup] to [SlotState::Running].
    pub(super) fn full_lock(&self, slot: CmdIndex) {
        let prev =
            self.cmd[slot.index() as usize].swap(SlotState::Running, atomic::Ordering::Release);
        debug_assert_eq!(prev, SlotState::Setup, "AHCI: {slot} not claimed");
    }

    /// Frees the given slot without acquiring the lock.
    pub(super) fn free(&self, slot: CmdIndex) {
        self.cmd[slot.index() as usize].store(SlotState::Unlocked, atomic::Ordering::Release);
    }

    /// Moves the running slots in `mask` to [SlotState::Completing] and returns the slots which
    /// were moved. A slot is only ever returned to one caller.
    pub(super) fn take_finished(&self, mask: u32) -> u32 {
        (0..32usize)
            .filter(|i| mask & 1 << i != 0)
            .filter(|&i| {
                self.cmd[i]
                    .compare_exchange(
                        SlotState::Running,
                        SlotState::Completing,
                        atomic::Ordering::AcqRel,
                        atomic::Ordering::Relaxed,
                    )
                    .is_ok()
            })
            .fold(0, |acc, i| acc | 1 << i)
    }

    /// Returns a mask of all running slots.
    pub(super) fn running(&self) -> u32 {
        self.cmd
            .iter()
            .enumerate()
            .filter(|(_, s)| s.load(atomic::Ordering::Acquire) == SlotState::Running)
            .fold(0, |acc, (i, _)| acc | 1 << i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::kernel_if::test_util::HeapServices;
    use ata::command::AtaCommand;

    fn fis() -> RegisterHostToDevFis {
        RegisterHostToDevFis::new(AtaCommand::READ_DMA_EXT, 0, 0, 16, 0x40, 8, 0, 0, 0)
    }

    #[test]
    fn tables_are_assigned() {
        let s = HeapServices::new();
        let list = CmdList::new(&s, MemRegion::Mem64, 4, 1);
        for i in 0..4 {
            let addr = list.headers()[i].table_addr();
            assert_eq!(addr % 128, 0);
            assert_eq!(addr, list.tables.phys() + (i * TABLE_SIZE) as u64);
        }
        assert_eq!(list.headers()[4].table_addr(), 0);
        assert_eq!(list.fis_addr() - list.list_addr(), 0x400);
    }

    #[test]
    fn build_splits_prds() {
        let s = HeapServices::new();
        let list = CmdList::new(&s, MemRegion::Mem64, 1, 1);
        let slot = CmdIndex::new(0).unwrap();
        let len = MAX_PRD_BYTES as usize + 0x1000;
        unsafe { list.build(slot, &fis(), Some((0x10_0000, len)), true) }.unwrap();

        let header = &list.headers()[0];
        assert_eq!(header.description().get_prdt_len(), 2);
        assert_eq!(header.description().get_command_fis_len(), 5);
        let table = unsafe { list.table_mut(slot) };
        assert_eq!(table.prd(0).len(), MAX_PRD_BYTES);
        assert_eq!(table.prd(1).addr(), 0x10_0000 + MAX_PRD_BYTES as u64);
        assert_eq!(table.prd(1).len(), 0x1000);
        assert_eq!(table.command_fis.bytes()[0], 0x27);
        assert_eq!(table.command_fis.bytes()[2], AtaCommand::READ_DMA_EXT as u8);
    }

    #[test]
    fn build_rejects_bad_buffers() {
        let s = HeapServices::new();
        let list = CmdList::new(&s, MemRegion::Mem32, 1, 1);
        let slot = CmdIndex::new(0).unwrap();
        let r = unsafe { list.build(slot, &fis(), Some((0x1000, 511)), false) };
        assert_eq!(r, Err(CommandError::BadBuffer));
        let r = unsafe { list.build(slot, &fis(), Some((0xffff_f000, 0x2000)), false) };
        assert_eq!(r, Err(CommandError::BadAddress));
        let too_long = PRDT_LEN * MAX_PRD_BYTES as usize + 2;
        let r = unsafe { list.build(slot, &fis(), Some((0x1000, too_long)), false) };
        assert_eq!(
            r,
            Err(CommandError::BuffTooLong(PRDT_LEN * MAX_PRD_BYTES as usize))
        );
    }

    #[test]
    fn buffers_are_disjoint() {
        let s = HeapServices::new();
        let list = CmdList::new(&s, MemRegion::Mem64, 3, 2);
        let (a, _) = list.buffer(CmdIndex::new(0).unwrap());
        let (b, _) = list.buffer(CmdIndex::new(1).unwrap());
        assert_eq!(b - a, 2 * PAGE_SIZE as u64);
        let slot = CmdIndex::new(2).unwrap();
        unsafe {
            list.fill_buffer(slot, &[1, 2, 3, 4]);
            assert_eq!(list.read_buffer(slot, 4), [1, 2, 3, 4]);
        }
    }

    #[test]
    fn free_slot_skips_issued_and_claimed() {
        let t = SlotTracker::new();
        assert_eq!(t.find_free(0b1, 32).unwrap().index(), 1);
        let s = t.claim(0, 32).unwrap();
        assert_eq!(s.index(), 0);
        assert_eq!(t.find_free(0, 32).unwrap().index(), 1);
        t.full_lock(s);
        assert_eq!(t.running(), 1);
        assert_eq!(t.claim(0, 1), Err(QueueFull));
        t.free(s);
        assert_eq!(t.claim(0, 1).unwrap().index(), 0);
    }

    #[test]
    fn finished_slots_are_taken_once() {
        let t = SlotTracker::new();
        let a = t.claim(0, 32).unwrap();
        let b = t.claim(0, 32).unwrap();
        t.full_lock(a);
        // b is still being set up
        assert_eq!(t.take_finished(0b11), 0b01);
        assert_eq!(t.take_finished(0b11), 0);
        assert_eq!(t.running(), 0);
        // completing slots are not free
        assert_eq!(t.claim(0, 2), Err(QueueFull));
        t.free(a);
        t.full_lock(b);
        assert_eq!(t.take_finished(0b10), 0b10);
    }
}
