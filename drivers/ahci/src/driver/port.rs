use super::block::AhciDiskDevice;
use super::cmd_ctl::{CmdList, QueueFull, SlotTracker};
use super::handler::IdentifyRegion;
use super::kernel_if::without_interrupts;
use super::{CmdErr, DevIdentity, HbaContextRef, SectorAddress, SectorCount};
use crate::hba::CmdIndex;
use crate::hba::command::frame_information_structure::RegisterHostToDevFis;
use crate::hba::port_control::{
    CommStatus, DeviceDetection, DeviceDetectionInit, InterruptEnable, InterruptStatus,
    PortControl,
};
use crate::{DeviceType, LinkState, ResetMode};
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use ata::command::constructor::{
    CommandConstructor, ComposedCommand, NoArgCmd, SpanningCmd, SpanningCmdType,
};
use core::fmt::Formatter;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use core::task::{Context, Poll};

/// Maximum time in milliseconds for PxCMD.CR or PxCMD.FR to follow their enable bits.
const ENGINE_TIMEOUT_MS: u32 = 1000;
/// Maximum time in milliseconds for BSY and DRQ to clear.
const READY_TIMEOUT_MS: u32 = 100;
/// Maximum time in milliseconds for PxSSTS.DET to report an established link.
const LINK_TIMEOUT_MS: u32 = 10;
/// Minimum time PxSCTL.DET must be held at 1 to send a COMRESET.
const COMRESET_HOLD_US: u64 = 1000;
/// Size of the IDENTIFY DEVICE response
pub(crate) const IDENTIFY_LEN: usize = 512;

/// Driver state of a port.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PortState {
    /// The port has not been reset yet.
    Uninitialized,
    /// A reset is in progress. Commands are queued until it completes.
    Resetting,
    /// No device is attached.
    PhyDisabled,
    /// The command engine is running and no commands are in flight.
    Idle,
    /// At least one command is in flight.
    Busy,
    /// The port encountered an unrecoverable error, it will not be used until it is reset.
    Failed,
}

/// A single AHCI port and the commands issued to it.
pub struct Port {
    index: u8,
    ctx: HbaContextRef,
    weak_self: Weak<Self>,
    state: atomic::Atomic<PortState>,
    device_type: atomic::Atomic<DeviceType>,
    identity: spin::Mutex<Option<DevIdentity>>,
    // All register accesses go through this lock.
    regs: spin::Mutex<&'static PortControl>,
    cmd_list: CmdList,
    slots: SlotTracker,
    active_cmd_fut: [spin::Mutex<Option<CmdFuture>>; 32],
    cmd_queue: spin::Mutex<VecDeque<CmdFuture>>,
    identify_region: IdentifyRegion,
    disk: spin::Mutex<Option<Arc<AhciDiskDevice>>>,
    /// Changed whenever the attached device may have changed. Only modified with `regs` held.
    generation: AtomicU32,
    interrupts: AtomicU64,
    deferred_reset: AtomicBool,
    init_lock: async_lock::Mutex<()>,
}

/// Which commands fail when the command engine is restarted.
enum Failure {
    /// The command in the given slot fails, all others are retried.
    Slot(CmdIndex, CmdErr),
    /// Every in flight command fails.
    All(CmdErr),
}

impl Port {
    pub(crate) fn new(ctx: HbaContextRef, index: u8, identify_region: IdentifyRegion) -> Arc<Self> {
        let regs = ctx.hba.get_port(index);
        let cmd_list = CmdList::new(
            &ctx.services,
            ctx.info.mem_region(),
            ctx.info.queue_depth(),
            ctx.config.slot_buffer_pages,
        );

        Arc::new_cyclic(|weak_self| Self {
            index,
            ctx,
            weak_self: weak_self.clone(),
            state: atomic::Atomic::new(PortState::Uninitialized),
            device_type: atomic::Atomic::new(DeviceType::Unknown),
            identity: spin::Mutex::new(None),
            regs: spin::Mutex::new(regs),
            cmd_list,
            slots: SlotTracker::new(),
            active_cmd_fut: core::array::from_fn(|_| spin::Mutex::new(None)),
            cmd_queue: spin::Mutex::new(VecDeque::new()),
            identify_region,
            disk: spin::Mutex::new(None),
            generation: AtomicU32::new(0),
            interrupts: AtomicU64::new(0),
            deferred_reset: AtomicBool::new(false),
            init_lock: async_lock::Mutex::new(()),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn state(&self) -> PortState {
        self.state.load(atomic::Ordering::Acquire)
    }

    fn set_state(&self, state: PortState) {
        self.state.store(state, atomic::Ordering::Release)
    }

    /// Returns the type of the attached device, determined during [Self::initialize].
    pub fn device_type(&self) -> DeviceType {
        self.device_type.load(atomic::Ordering::Relaxed)
    }

    pub fn link_state(&self) -> LinkState {
        self.regs.lock().get_port_state()
    }

    /// Returns the identity of the attached device if it has been identified.
    pub fn identity(&self) -> Option<DevIdentity> {
        self.identity.lock().clone()
    }

    /// Returns the disk attached to this port.
    pub fn disk(&self) -> Option<Arc<AhciDiskDevice>> {
        self.disk.lock().clone()
    }

    /// Maximum number of bytes which can be transferred by a single command.
    pub fn max_transfer_len(&self) -> usize {
        self.cmd_list.buffer_len()
    }

    /// Identifies the device attached to the port. This changes when a device is attached,
    /// removed or identified again, commands issued on behalf of an older generation fail.
    pub fn generation(&self) -> u32 {
        self.generation.load(core::sync::atomic::Ordering::Acquire)
    }

    /// Starts a new generation and returns it.
    fn next_generation(&self) -> u32 {
        let _regs = self.regs.lock();
        self.generation
            .fetch_add(1, core::sync::atomic::Ordering::AcqRel)
            .wrapping_add(1)
    }

    /// Number of times [Self::handle_interrupt] was called.
    pub fn interrupt_count(&self) -> u64 {
        self.interrupts.load(core::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn take_deferred_reset(&self) -> bool {
        self.deferred_reset
            .swap(false, core::sync::atomic::Ordering::AcqRel)
    }

    /// Waits for `f` to return true, polling once per millisecond for at most `ms` milliseconds.
    fn wait_for(&self, ms: u32, mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..ms {
            if f() {
                return true;
            }
            self.ctx.services.delay_us(1000);
        }
        f()
    }

    /// Performs a complete reset of the port, including a COMRESET of the attached device.
    ///
    /// Returns true when a device is attached and the command engine is running.
    /// When no device is attached the port is left in [PortState::PhyDisabled]. If a device is
    /// present but does not respond the port is marked [PortState::Failed].
    pub fn reset(&self) -> bool {
        without_interrupts(&*self.ctx.services, || self.do_reset())
    }

    fn do_reset(&self) -> bool {
        self.set_state(PortState::Resetting);
        let regs = self.regs.lock();
        regs.set_interrupt_enable(InterruptEnable::empty());
        regs.ack_interrupts(regs.interrupt_status());

        if !self.rebase_locked(&regs) {
            drop(regs);
            log::error!("{self}: Command engine did not stop");
            self.set_state(PortState::Failed);
            return false;
        }

        regs.update_cmd(|c| c.insert(CommStatus::SPIN_UP_DEVICE | CommStatus::POWER_ON_DEVICE));
        regs.clear_sata_err();
        if !self.start_fis_locked(&regs) {
            drop(regs);
            log::error!("{self}: FIS receive did not start");
            self.set_state(PortState::Failed);
            return false;
        }

        if !self.comreset_locked(&regs) {
            let present = regs.sata_status().dev_detect() == DeviceDetection::NoComm;
            drop(regs);
            return if present {
                log::warn!("{self}: Device detected but communication was not established");
                self.set_state(PortState::Failed);
                false
            } else {
                log::debug!("{self}: No device attached");
                self.set_state(PortState::PhyDisabled);
                false
            };
        }

        self.finish_bring_up(regs)
    }

    /// Brings up the port without resetting the attached device.
    pub fn initialize_without_reset(&self) -> bool {
        without_interrupts(&*self.ctx.services, || self.do_initialize_without_reset())
    }

    fn do_initialize_without_reset(&self) -> bool {
        self.set_state(PortState::Resetting);
        let regs = self.regs.lock();
        regs.set_interrupt_enable(InterruptEnable::empty());
        regs.ack_interrupts(regs.interrupt_status());

        if !self.rebase_locked(&regs) {
            drop(regs);
            log::error!("{self}: Command engine did not stop");
            self.set_state(PortState::Failed);
            return false;
        }

        regs.update_cmd(|c| c.insert(CommStatus::SPIN_UP_DEVICE | CommStatus::POWER_ON_DEVICE));
        regs.clear_sata_err();
        if !self.start_fis_locked(&regs) {
            drop(regs);
            log::error!("{self}: FIS receive did not start");
            self.set_state(PortState::Failed);
            return false;
        }

        if !self.wait_for(LINK_TIMEOUT_MS, || {
            regs.sata_status().dev_detect() == DeviceDetection::InComm
        }) {
            drop(regs);
            log::debug!("{self}: No device attached");
            self.set_state(PortState::PhyDisabled);
            return false;
        }

        self.finish_bring_up(regs)
    }

    /// Resets the port using `mode` unless the controller requires a different mode.
    pub fn reset_with(&self, mode: ResetMode) -> bool {
        let effective = self.ctx.quirk.effective_mode(mode);
        if effective != mode {
            log::trace!("{self}: {mode:?} reset upgraded to {effective:?}");
        }
        match effective {
            ResetMode::Complete => self.reset(),
            ResetMode::ControllerOnly => self.initialize_without_reset(),
        }
    }

    /// Waits for the device to become ready and starts the command engine.
    fn finish_bring_up(&self, regs: spin::MutexGuard<'_, &'static PortControl>) -> bool {
        regs.clear_sata_err();
        regs.clear_notifications();
        regs.ack_interrupts(regs.interrupt_status());

        if !self.wait_for(READY_TIMEOUT_MS, || !regs.task_file().is_busy()) {
            drop(regs);
            log::warn!("{self}: Device did not become ready");
            self.set_state(PortState::Failed);
            return false;
        }
        if !self.start_cmd_locked(&regs) {
            drop(regs);
            log::error!("{self}: Command engine did not start");
            self.set_state(PortState::Failed);
            return false;
        }
        regs.set_interrupt_enable(InterruptEnable::driver_default());
        let link = regs.get_port_state();
        let speed = regs.sata_status().interface_speed();
        drop(regs);

        log::debug!("{self}: Link {link:?}, Gen {}", speed.unwrap_or(0));
        self.set_state(PortState::Idle);
        self.dispatch_queued();
        true
    }

    /// Returns whether communication with a device is established.
    pub fn is_phy_enabled(&self) -> bool {
        self.regs.lock().sata_status().dev_detect() == DeviceDetection::InComm
    }

    /// Stops the port and programs PxCLB and PxFB with the addresses of the command list and the
    /// received FIS area.
    pub fn rebase(&self) -> bool {
        self.with_regs(|regs| self.rebase_locked(regs))
    }

    /// Runs `f` with the register lock held and local interrupts disabled.
    ///
    /// Anything which waits while holding the lock must use this, otherwise an interrupt for this
    /// port on the same CPU would spin on the lock forever.
    fn with_regs<R>(&self, f: impl FnOnce(&PortControl) -> R) -> R {
        without_interrupts(&*self.ctx.services, || f(&self.regs.lock()))
    }

    fn rebase_locked(&self, regs: &PortControl) -> bool {
        if !self.stop_cmd_locked(regs) || !self.stop_fis_locked(regs) {
            return false;
        }
        regs.set_command_list(self.cmd_list.list_addr());
        regs.set_fis_base(self.cmd_list.fis_addr());
        log::trace!(
            "{self}: CLB {:#x} FB {:#x}",
            regs.command_list(),
            regs.fis_base()
        );
        true
    }

    pub fn start_command_list_processing(&self) -> bool {
        self.with_regs(|regs| self.start_cmd_locked(regs))
    }

    pub fn stop_command_list_processing(&self) -> bool {
        self.with_regs(|regs| self.stop_cmd_locked(regs))
    }

    pub fn start_fis_receiving(&self) -> bool {
        self.with_regs(|regs| self.start_fis_locked(regs))
    }

    pub fn stop_fis_receiving(&self) -> bool {
        self.with_regs(|regs| self.stop_fis_locked(regs))
    }

    fn start_cmd_locked(&self, regs: &PortControl) -> bool {
        regs.update_cmd(|c| c.insert(CommStatus::START));
        self.wait_for(ENGINE_TIMEOUT_MS, || {
            regs.cmd().contains(CommStatus::COMMAND_LIST_RUNNING)
        })
    }

    fn stop_cmd_locked(&self, regs: &PortControl) -> bool {
        regs.update_cmd(|c| c.remove(CommStatus::START));
        self.wait_for(ENGINE_TIMEOUT_MS, || {
            !regs.cmd().contains(CommStatus::COMMAND_LIST_RUNNING)
        })
    }

    fn start_fis_locked(&self, regs: &PortControl) -> bool {
        regs.update_cmd(|c| c.insert(CommStatus::FIS_RECIEVE_ENABLE));
        self.wait_for(ENGINE_TIMEOUT_MS, || {
            regs.cmd().contains(CommStatus::FIS_RECIEVE_RUNNING)
        })
    }

    fn stop_fis_locked(&self, regs: &PortControl) -> bool {
        regs.update_cmd(|c| c.remove(CommStatus::FIS_RECIEVE_ENABLE));
        self.wait_for(ENGINE_TIMEOUT_MS, || {
            !regs.cmd().contains(CommStatus::FIS_RECIEVE_RUNNING)
        })
    }

    /// Sends a COMRESET and waits for the link to come up.
    fn comreset_locked(&self, regs: &PortControl) -> bool {
        regs.set_dev_detect_init(DeviceDetectionInit::ResetInterface);
        self.ctx.services.delay_us(COMRESET_HOLD_US);
        regs.set_dev_detect_init(DeviceDetectionInit::NoAction);
        self.wait_for(LINK_TIMEOUT_MS, || {
            regs.sata_status().dev_detect() == DeviceDetection::InComm
        })
    }

    /// Waits for BSY and DRQ to clear.
    fn spin_until_ready(&self) -> bool {
        self.with_regs(|regs| self.wait_for(READY_TIMEOUT_MS, || !regs.task_file().is_busy()))
    }

    /// Returns the first slot which is not claimed by the driver and is clear in PxCI.
    pub fn find_free_slot(&self) -> Result<CmdIndex, QueueFull> {
        let ci = self.regs.lock().get_ci();
        self.slots.find_free(ci, self.cmd_list.depth())
    }

    /// Issues the command in `slot` by writing `1 << slot` to PxCI.
    ///
    /// # Safety
    ///
    /// The caller must ensure the slot contains a valid command and all memory referenced by its
    /// PRDT remains valid until the command completes.
    pub unsafe fn issue_command(&self, slot: CmdIndex) {
        // SAFETY: Guaranteed by caller
        unsafe { self.regs.lock().exec_cmd(slot.index()) }
    }

    /// Identifies the device and constructs the block device if the device is an ATA disk.
    pub async fn initialize(&self) -> Option<Arc<AhciDiskDevice>> {
        let _l = self.init_lock.lock().await;
        if self.state() != PortState::Idle {
            return None;
        }

        let ty = self.regs.lock().signature().device_type();
        self.device_type.store(ty, atomic::Ordering::Relaxed);
        match ty {
            DeviceType::Sata => {}
            DeviceType::Satapi => {
                self.regs
                    .lock()
                    .update_cmd(|c| c.insert(CommStatus::DEVICE_IS_ATAPI));
            }
            t => {
                log::info!("{self}: Ignoring unsupported device {t:?}");
                return None;
            }
        }

        let id = self.identify_device().await?;
        log::info!(
            "{self}: Found {ty:?} {} serial: {}, {} sectors of {} bytes",
            id.model(),
            id.serial(),
            id.lba_count(),
            id.lba_size()
        );

        if ty != DeviceType::Sata {
            return None;
        }

        let disk = Arc::new(AhciDiskDevice::new(
            self.weak_self.clone(),
            id,
            self.max_transfer_len(),
            self.next_generation(),
        ));
        *self.disk.lock() = Some(disk.clone());
        Some(disk)
    }

    /// Issues IDENTIFY DEVICE (or IDENTIFY PACKET DEVICE) and parses the response.
    ///
    /// Returns `None` if the device does not respond or reports an error.
    pub async fn identify_device(&self) -> Option<DevIdentity> {
        if !self.spin_until_ready() {
            log::warn!("{self}: Device busy, cannot identify");
            return None;
        }

        let cmd = match self.device_type() {
            DeviceType::Satapi => NoArgCmd::IdentifyPacketDevice,
            _ => NoArgCmd::IdentifyDevice,
        }
        .compose();

        let transfer = Transfer::Direct {
            phys: self.identify_region.phys(),
            len: IDENTIFY_LEN,
        };
        if let Err(e) = self
            .run(cmd, transfer, None, self.ctx.config.identify_timeout_ms)
            .await
        {
            log::warn!("{self}: IDENTIFY failed: {e:?}");
            return None;
        }

        let raw = ata::structures::identification::DeviceIdentity::from_bytes(
            &self.identify_region.read(),
        );
        if !raw.checksum() {
            log::warn!("{self}: IDENTIFY checksum mismatch");
        }
        let id = DevIdentity::from(&raw);
        log::trace!("{self}: {raw:?}");

        if id.lba_count() == 0 && self.device_type() != DeviceType::Satapi {
            log::error!("{self}: Device reported 0 sectors");
            return None;
        }
        *self.identity.lock() = Some(id.clone());
        Some(id)
    }

    /// Reads `count` sectors starting at `lba` into `buff`.
    /// Returns the number of bytes read.
    ///
    /// This fn will return `Err(BadArgs)` if `buff` is shorter than the requested sectors, if the
    /// request exceeds [Self::max_transfer_len] or if `lba + count` exceeds the last sector on the
    /// device.
    pub async fn read(
        &self,
        lba: SectorAddress,
        count: SectorCount,
        buff: &mut [u8],
    ) -> Result<usize, CmdErr> {
        self.read_as(None, lba, count, buff).await
    }

    /// Like [Self::read], when `generation` is given the command fails with
    /// [CmdErr::Disowned] unless it matches [Self::generation] when the command is issued.
    pub(crate) async fn read_as(
        &self,
        generation: Option<u32>,
        lba: SectorAddress,
        count: SectorCount,
        buff: &mut [u8],
    ) -> Result<usize, CmdErr> {
        let id = self.identity().ok_or(CmdErr::Disowned)?;
        let len = id.lba_size() as usize * count.get() as usize;
        if id.exceeds_dev(lba, count) || buff.len() < len || len > self.max_transfer_len() {
            return Err(CmdErr::BadArgs);
        }

        let cmd = SpanningCmd::new(SpanningCmdType::Read, lba.raw(), count.count_ext())
            .ok_or(CmdErr::BadArgs)?
            .compose()
            .resolve(id.lba48())
            .ok_or(CmdErr::BadArgs)?;

        let data = self
            .run(
                cmd,
                Transfer::Read(len),
                generation,
                self.ctx.config.command_timeout_ms,
            )
            .await?
            .ok_or(CmdErr::AtaErr)?;
        buff[..len].copy_from_slice(&data);
        Ok(len)
    }

    /// This fn writes the given buffer to the device at starting at `lba`.
    /// Returns the number of bytes written.
    ///
    /// This fn will return Err(BadArgs) if the size of given buffer is not aligned to the logical
    /// sector size of the device or the buffer + `lba` exceeds the size of the device.
    pub async fn write(&self, lba: SectorAddress, buff: &[u8]) -> Result<usize, CmdErr> {
        self.write_as(None, lba, buff).await
    }

    /// See [Self::read_as]
    pub(crate) async fn write_as(
        &self,
        generation: Option<u32>,
        lba: SectorAddress,
        buff: &[u8],
    ) -> Result<usize, CmdErr> {
        let id = self.identity().ok_or(CmdErr::Disowned)?;
        if buff.is_empty()
            || buff.len() as u64 % id.lba_size() != 0
            || buff.len() > self.max_transfer_len()
        {
            return Err(CmdErr::BadArgs);
        }

        let count = u32::try_from(buff.len() as u64 / id.lba_size())
            .ok()
            .and_then(SectorCount::new)
            .ok_or(CmdErr::BadArgs)?;
        if id.exceeds_dev(lba, count) {
            return Err(CmdErr::BadArgs);
        }

        let cmd = SpanningCmd::new(SpanningCmdType::Write, lba.raw(), count.count_ext())
            .ok_or(CmdErr::BadArgs)?
            .compose()
            .resolve(id.lba48())
            .ok_or(CmdErr::BadArgs)?;

        self.run(
            cmd,
            Transfer::Write(buff.to_vec()),
            generation,
            self.ctx.config.command_timeout_ms,
        )
        .await?;
        Ok(buff.len())
    }

    /// Flushes the device's write cache.
    pub async fn flush(&self) -> Result<(), CmdErr> {
        self.flush_as(None).await
    }

    /// See [Self::read_as]
    pub(crate) async fn flush_as(&self, generation: Option<u32>) -> Result<(), CmdErr> {
        let id = self.identity().ok_or(CmdErr::Disowned)?;
        let cmd = NoArgCmd::FlushCache
            .compose()
            .resolve(id.lba48())
            .ok_or(CmdErr::AtaErr)?;
        self.run(
            cmd,
            Transfer::None,
            generation,
            self.ctx.config.command_timeout_ms,
        )
        .await?;
        Ok(())
    }

    /// Submits `cmd` and waits for it to complete. The command is aborted if it does not complete
    /// within `timeout_ms`.
    async fn run(
        &self,
        cmd: ComposedCommand,
        transfer: Transfer,
        generation: Option<u32>,
        timeout_ms: u64,
    ) -> Result<Option<Vec<u8>>, CmdErr> {
        use futures::FutureExt;

        let fut = CmdFuture::new(cmd, transfer, generation);
        self.submit(fut.clone());

        let mut cmd_fut = fut.clone().fuse();
        let mut deadline = self.ctx.services.deadline(timeout_ms).fuse();
        futures::select_biased! {
            r = cmd_fut => r,
            _ = deadline => {
                self.abort(&fut);
                Err(CmdErr::Timeout)
            }
        }
    }

    /// Attempts to send the command to the device. If no command slots are free the command is
    /// queued and sent when a slot is freed.
    fn submit(&self, cmd: CmdFuture) {
        if !self.owns(&cmd) {
            cmd.err(CmdErr::Disowned);
            return;
        }
        match self.state() {
            PortState::Idle | PortState::Busy => {}
            PortState::Resetting => {
                self.cmd_queue.lock().push_back(cmd);
                return;
            }
            _ => {
                cmd.err(CmdErr::Disowned);
                return;
            }
        }

        let ci = self.regs.lock().get_ci();
        match self.slots.claim(ci, self.cmd_list.depth()) {
            Ok(slot) => self.dispatch(slot, cmd),
            Err(QueueFull) => {
                log::trace!("{self}: All command slots busy, queueing command");
                self.cmd_queue.lock().push_back(cmd);
                // a slot may have been freed since it was claimed.
                self.dispatch_queued();
            }
        }
    }

    /// Builds the command in the claimed `slot` and issues it.
    fn dispatch(&self, slot: CmdIndex, cmd: CmdFuture) {
        let fis = match RegisterHostToDevFis::try_from(&cmd.data.cmd) {
            Ok(fis) => fis,
            Err(()) => {
                self.slots.free(slot);
                cmd.err(CmdErr::AtaErr);
                return;
            }
        };

        let (buffer, _) = self.cmd_list.buffer(slot);
        let (data, write) = match &cmd.data.transfer {
            Transfer::None => (None, false),
            Transfer::Read(len) => (Some((buffer, *len)), false),
            Transfer::Write(b) => {
                // SAFETY: The slot is held and not issued
                unsafe { self.cmd_list.fill_buffer(slot, b) };
                (Some((buffer, b.len())), true)
            }
            Transfer::Direct { phys, len } => (Some((*phys, *len)), false),
        };

        // SAFETY: The slot is held
        if let Err(e) = unsafe { self.cmd_list.build(slot, &fis, data, write) } {
            log::warn!("{self}: Failed to build command: {e:?}");
            self.slots.free(slot);
            cmd.err(CmdErr::BuildErr(e));
            return;
        }

        let generation = cmd.data.generation;
        *self.active_cmd_fut[slot.index() as usize].lock() = Some(cmd);
        self.set_state(PortState::Busy);

        // The slot is marked running and the doorbell rung under the register lock, completion
        // samples PxCI and the running slots under the same lock.
        let issued = without_interrupts(&*self.ctx.services, || {
            let regs = self.regs.lock();
            if generation.is_some_and(|g| g != self.generation()) {
                return false;
            }
            self.slots.full_lock(slot);
            // SAFETY: The command was built above, data buffers are owned by the port or the
            // handler.
            unsafe { regs.exec_cmd(slot.index()) };
            true
        });

        if !issued {
            let cmd = self.active_cmd_fut[slot.index() as usize].lock().take();
            self.slots.free(slot);
            if let Some(cmd) = cmd {
                cmd.err(CmdErr::Disowned);
            }
            self.update_busy();
        }
    }

    /// Returns whether `cmd` was issued for the device currently attached.
    fn owns(&self, cmd: &CmdFuture) -> bool {
        cmd.data
            .generation
            .is_none_or(|g| g == self.generation())
    }

    /// Returns the port to [PortState::Idle] when no commands are running.
    fn update_busy(&self) {
        if self.slots.running() == 0 {
            let _ = self.state.compare_exchange(
                PortState::Busy,
                PortState::Idle,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Relaxed,
            );
        }
    }

    /// Issues queued commands while free slots remain.
    fn dispatch_queued(&self) {
        if !matches!(self.state(), PortState::Idle | PortState::Busy) {
            return;
        }
        loop {
            if self.cmd_queue.lock().is_empty() {
                return;
            }
            let ci = self.regs.lock().get_ci();
            let Ok(slot) = self.slots.claim(ci, self.cmd_list.depth()) else {
                return;
            };
            let Some(cmd) = self.cmd_queue.lock().pop_front() else {
                self.slots.free(slot);
                return;
            };
            self.dispatch(slot, cmd);
        }
    }

    /// Completes every running command whose PxCI bit is clear.
    fn complete_slots(&self) {
        let done = {
            let regs = self.regs.lock();
            self.slots.take_finished(self.slots.running() & !regs.get_ci())
        };
        self.retire(done);

        if done != 0 {
            self.dispatch_queued();
        }
        self.update_busy();
    }

    /// Completes the commands in the mask `done`, which must have been taken with
    /// [SlotTracker::take_finished].
    fn retire(&self, done: u32) {
        for slot in (0..32).filter(|i| done & 1 << i != 0).filter_map(CmdIndex::new) {
            let Some(cmd) = self.active_cmd_fut[slot.index() as usize].lock().take() else {
                self.slots.free(slot);
                continue;
            };
            let data = match cmd.data.transfer {
                // SAFETY: The command is complete, the HBA no longer accesses the buffer
                Transfer::Read(len) => Some(unsafe { self.cmd_list.read_buffer(slot, len) }),
                _ => None,
            };
            log::trace!(
                "{self}: {slot} complete, {} bytes",
                self.cmd_list.headers()[slot.index() as usize].bytes_transferred()
            );
            self.slots.free(slot);
            cmd.ready(data);
        }
    }

    /// Handles the ports current interrupt status.
    /// An interrupt does **not** need to be raised to call this fn.
    ///
    /// - Hot plug events either detach the device or request a deferred reset.
    /// - A host bus fatal error shuts the port down.
    /// - Interface fatal and host bus data errors fail every in flight command.
    /// - A task file error fails the command the device was processing, others are retried.
    /// - Completed commands are woken.
    pub fn handle_interrupt(&self) {
        self.interrupts
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        let (is, ccs, tfd) = {
            let l = self.regs.lock();
            let is = l.interrupt_status();
            l.ack_interrupts(is);
            (is, l.cmd().get_current_command(), l.task_file())
        };
        if is.is_empty() && self.slots.running() == 0 {
            return;
        }
        log::trace!("{self}: Interrupt {is:?}");

        if is.intersects(InterruptStatus::hot_plug()) {
            self.handle_hot_plug();
        }

        if is.contains(InterruptStatus::HOST_BUS_FATAL) {
            log::error!("{self}: Host bus fatal error, port disabled");
            self.shutdown();
            return;
        }

        if is.intersects(InterruptStatus::transport_errors()) {
            log::warn!(
                "{self}: Transport error {:?}, SERR {:?}",
                is & InterruptStatus::transport_errors(),
                self.regs.lock().sata_err()
            );
            self.recover(Failure::All(CmdErr::Transport));
        } else if is.contains(InterruptStatus::TASK_FILE_ERROR) {
            log::warn!(
                "{self}: Task file error in slot {ccs}: status {:#x} error {:#x}",
                tfd.get_status(),
                tfd.get_err()
            );
            log::trace!("{self}: {:?}", self.cmd_list.received_fis().d2h());
            match CmdIndex::new(ccs) {
                Some(slot) => self.recover(Failure::Slot(slot, CmdErr::DevErr(tfd.get_err()))),
                None => self.recover(Failure::All(CmdErr::DevErr(tfd.get_err()))),
            }
        }

        if is.contains(InterruptStatus::INTERFACE_NON_FATAL) {
            let l = self.regs.lock();
            log::warn!("{self}: Interface error {:?}", l.sata_err());
            l.clear_sata_err();
        }

        self.complete_slots();
    }

    /// Handles a device being attached or removed.
    fn handle_hot_plug(&self) {
        let status = {
            let l = self.regs.lock();
            l.clear_sata_err();
            l.sata_status()
        };
        if status.dev_detect() == DeviceDetection::InComm {
            log::info!("{self}: Device attached");
            // the device may have been exchanged
            self.next_generation();
            self.deferred_reset
                .store(true, core::sync::atomic::Ordering::Release);
        } else {
            log::info!("{self}: Device removed");
            self.unplug();
        }
    }

    /// Detaches the device, all commands fail.
    fn unplug(&self) {
        self.next_generation();
        self.set_state(PortState::PhyDisabled);
        self.abandon_cmd();
        self.device_type
            .store(DeviceType::Unknown, atomic::Ordering::Relaxed);
        *self.identity.lock() = None;
        *self.disk.lock() = None;
    }

    /// Disables the port after an unrecoverable error.
    fn shutdown(&self) {
        self.set_state(PortState::Failed);
        self.with_regs(|regs| {
            regs.set_interrupt_enable(InterruptEnable::empty());
            let _ = self.stop_cmd_locked(regs);
        });
        self.abandon_cmd();
    }

    /// Abandons all commands.
    ///
    /// This should be called in the event that the device becomes unavailable.
    fn abandon_cmd(&self) {
        for (i, c) in self.active_cmd_fut.iter().enumerate() {
            let Some(t) = c.lock().take() else { continue };
            if let Some(slot) = CmdIndex::new(i as u8) {
                self.slots.free(slot);
            }
            t.err(CmdErr::Disowned)
        }

        let mut ql = self.cmd_queue.lock();
        while let Some(c) = ql.pop_front() {
            c.err(CmdErr::Disowned);
        }
    }

    /// Stops the command engine, fails commands according to `failure` and restarts the engine.
    /// Commands which did not fail are issued again.
    fn recover(&self, failure: Failure) {
        without_interrupts(&*self.ctx.services, || self.do_recover(failure))
    }

    fn do_recover(&self, failure: Failure) {
        let regs = self.regs.lock();
        // Commands which completed before the engine stopped are not affected
        let finished = self.slots.take_finished(self.slots.running() & !regs.get_ci());
        self.retire(finished);

        if !self.stop_cmd_locked(&regs) {
            drop(regs);
            log::error!("{self}: Command engine did not stop during recovery");
            self.shutdown();
            return;
        }

        // PxCI is cleared by the HBA when PxCMD.ST is cleared
        let running = self.slots.running();
        let mut retry = Vec::new();
        for slot in (0..32)
            .filter(|i| running & 1 << i != 0)
            .filter_map(CmdIndex::new)
        {
            let cmd = self.active_cmd_fut[slot.index() as usize].lock().take();
            self.slots.free(slot);
            let Some(cmd) = cmd else { continue };
            match failure {
                Failure::Slot(s, e) if s == slot => cmd.err(e),
                Failure::All(e) => cmd.err(e),
                Failure::Slot(..) => retry.push(cmd),
            }
        }

        regs.clear_sata_err();
        if regs.task_file().is_busy() {
            log::warn!("{self}: Device busy after error, sending COMRESET");
            if !self.comreset_locked(&regs) {
                drop(regs);
                log::error!("{self}: Link lost during recovery");
                self.unplug();
                return;
            }
        }
        if !self.wait_for(READY_TIMEOUT_MS, || !regs.task_file().is_busy())
            || !self.start_cmd_locked(&regs)
        {
            drop(regs);
            log::error!("{self}: Command engine did not restart");
            self.shutdown();
            return;
        }
        drop(regs);

        {
            let mut q = self.cmd_queue.lock();
            for c in retry.into_iter().rev() {
                q.push_front(c);
            }
        }
        self.set_state(PortState::Idle);
        self.dispatch_queued();
    }

    /// Cancels `cmd` after its deadline expired.
    fn abort(&self, cmd: &CmdFuture) {
        {
            let mut q = self.cmd_queue.lock();
            if let Some(i) = q.iter().position(|c| Arc::ptr_eq(&c.data, &cmd.data)) {
                q.remove(i);
                cmd.err(CmdErr::Timeout);
                return;
            }
        }

        let slot = (0..self.cmd_list.depth())
            .filter_map(CmdIndex::new)
            .find(|s| {
                self.active_cmd_fut[s.index() as usize]
                    .lock()
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(&c.data, &cmd.data))
            });
        if let Some(slot) = slot {
            log::warn!("{self}: Command in {slot} timed out, aborting");
            self.recover(Failure::Slot(slot, CmdErr::Timeout));
        }
    }
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Port")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("device", &self.device_type())
            .field("regs", &*self.regs.lock())
            .finish()
    }
}

impl core::fmt::Display for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} - {}", self.ctx.info.pci_addr(), self.index)
    }
}

/// Describes the data phase of a command.
enum Transfer {
    None,
    /// Read into the slot buffer, the data is copied out on completion.
    Read(usize),
    /// Copied into the slot buffer when the command is issued.
    Write(Vec<u8>),
    /// A DMA region owned by the driver, read from the device.
    Direct { phys: u64, len: usize },
}

/// Contains the inner data for a future used to issue and receive commands.
struct CmdDataInner {
    cmd: ComposedCommand,
    transfer: Transfer,
    /// The port generation the command was issued for.
    generation: Option<u32>,
    state: atomic::Atomic<CmdState>,
    data: spin::Mutex<Option<Vec<u8>>>,
    waker: futures::task::AtomicWaker,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum CmdState {
    /// The command is waiting to be completed
    Waiting,
    /// The command has completed
    Completed,
    /// An error was detected. The data within the buffer may or may not be ready.
    Err(CmdErr),
}

#[derive(Clone)]
struct CmdFuture {
    data: Arc<CmdDataInner>,
}

impl CmdFuture {
    fn new(cmd: ComposedCommand, transfer: Transfer, generation: Option<u32>) -> Self {
        Self {
            data: Arc::new(CmdDataInner {
                cmd,
                transfer,
                generation,
                state: atomic::Atomic::new(CmdState::Waiting),
                data: spin::Mutex::new(None),
                waker: Default::default(),
            }),
        }
    }

    fn ready(&self, data: Option<Vec<u8>>) {
        *self.data.data.lock() = data;
        self.data
            .state
            .store(CmdState::Completed, atomic::Ordering::Release);
        self.data.waker.wake();
    }

    fn err(&self, err: CmdErr) {
        self.data
            .state
            .store(CmdState::Err(err), atomic::Ordering::Release);
        self.data.waker.wake();
    }
}

impl core::future::Future for CmdFuture {
    type Output = Result<Option<Vec<u8>>, CmdErr>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // registered first so a completion between the load and the register is not lost
        self.data.waker.register(cx.waker());
        match self.data.state.load(atomic::Ordering::Acquire) {
            CmdState::Completed => Poll::Ready(Ok(self.data.data.lock().take())),
            CmdState::Err(e) => Poll::Ready(Err(e)),
            CmdState::Waiting => Poll::Pending,
        }
    }
}
