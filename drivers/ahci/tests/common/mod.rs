//! A fake HBA backed by heap memory.
//!
//! DMA memory is identity mapped so the device side can follow the physical addresses written by
//! the driver. Register side effects are applied whenever the driver calls `delay_us`.
//!
//! IS, PxIS and PxSERR are write 1 to clear. The fake keeps the raised bits aside and stores them
//! with a reserved marker bit set, a driver acknowledgement overwrites the marker. Acknowledged
//! bits are dropped the next time the fake settles, which happens on every delay and every access
//! made through [FakeHba]. Only the last acknowledgement written between two settles is seen.

#![allow(dead_code)]

use ahci::driver::AhciController;
use ahci::driver::kernel_if::{IrqHandler, KernelServices, MemRegion, PAGE_SIZE, PciFunction};
use ahci::{AhciConfig, ResetMode};
use futures::future::BoxFuture;
use pci_config::{DeviceAddress, MmioMapper};
use std::alloc::Layout;
use std::future::Future;
use std::pin::pin;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

pub const CAP: usize = 0x00;
pub const GHC: usize = 0x04;
pub const IS: usize = 0x08;
pub const PI: usize = 0x0c;
pub const VS: usize = 0x10;

pub const PX_CLB: usize = 0x00;
pub const PX_IS: usize = 0x10;
pub const PX_CMD: usize = 0x18;
pub const PX_TFD: usize = 0x20;
pub const PX_SIG: usize = 0x24;
pub const PX_SSTS: usize = 0x28;
pub const PX_SCTL: usize = 0x2c;
pub const PX_SERR: usize = 0x30;
pub const PX_CI: usize = 0x38;

pub const IS_DHRS: u32 = 1;
pub const IS_PCS: u32 = 1 << 6;
pub const IS_IFS: u32 = 1 << 27;
pub const IS_TFES: u32 = 1 << 30;

/// Reserved bits marking a write 1 to clear register as untouched by the driver.
const IS_MARK: u32 = 1 << 31;
const PX_IS_MARK: u32 = 1 << 25;
const PX_SERR_MARK: u32 = 1 << 31;

const CMD_ST: u32 = 1;
const CMD_FRE: u32 = 1 << 4;
const CMD_FR: u32 = 1 << 14;
const CMD_CR: u32 = 1 << 15;

pub const SIG_ATA: u32 = 0x0000_0101;
pub const SIG_ATAPI: u32 = 0xeb14_0101;

/// SSTS for an active gen 2 link
const SSTS_UP: u32 = 0x123;

pub struct FakeHba {
    base: usize,
    attached: Mutex<u32>,
    comresets: Mutex<[u32; 32]>,
    /// offset -> bits raised and not yet acknowledged
    raised: Mutex<BTreeMap<usize, u32>>,
}

fn port_offset(port: u8, offset: usize) -> usize {
    0x100 + port as usize * 0x80 + offset
}

/// Returns the marker of the write 1 to clear register at `offset`.
fn w1c_mark(offset: usize) -> Option<u32> {
    match offset {
        IS => Some(IS_MARK),
        o if o >= 0x100 => match (o - 0x100) % 0x80 {
            PX_IS => Some(PX_IS_MARK),
            PX_SERR => Some(PX_SERR_MARK),
            _ => None,
        },
        _ => None,
    }
}

impl FakeHba {
    /// Creates a HBA with `ports` implemented and `slots` command slots per port.
    pub fn new(ports: u32, slots: u8) -> Arc<Self> {
        // bit 31 of IS is the marker
        assert_eq!(ports & 1 << 31, 0);
        let layout = Layout::from_size_align(2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        // leaked, the driver holds 'static references into it.
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        let raised = std::iter::once(IS)
            .chain((0..32).flat_map(|p| [port_offset(p, PX_IS), port_offset(p, PX_SERR)]))
            .map(|o| (o, 0))
            .collect();
        let hba = Arc::new(Self {
            base,
            attached: Mutex::new(0),
            comresets: Mutex::new([0; 32]),
            raised: Mutex::new(raised),
        });
        hba.settle();
        let np = 32 - ports.leading_zeros() - 1;
        // S64A | NCS | NP
        hba.write(CAP, 1 << 31 | ((slots as u32 - 1) << 8) | np);
        hba.write(PI, ports);
        hba.write(VS, 0x0001_0301);
        hba
    }

    pub fn abar(&self) -> u64 {
        self.base as u64
    }

    fn read_raw(&self, offset: usize) -> u32 {
        unsafe { ((self.base + offset) as *const u32).read_volatile() }
    }

    fn write_raw(&self, offset: usize, value: u32) {
        unsafe { ((self.base + offset) as *mut u32).write_volatile(value) }
    }

    /// Drops the bits the driver acknowledged since the last settle.
    fn settle(&self) {
        let mut raised = self.raised.lock().unwrap();
        for (&offset, bits) in raised.iter_mut() {
            let Some(mark) = w1c_mark(offset) else {
                continue;
            };
            let mem = self.read_raw(offset);
            if mem & mark == 0 {
                *bits &= !mem;
            }
            self.write_raw(offset, *bits | mark);
        }
    }

    /// Reads a register as the hardware would report it.
    pub fn read(&self, offset: usize) -> u32 {
        self.settle();
        match w1c_mark(offset) {
            Some(mark) => self.read_raw(offset) & !mark,
            None => self.read_raw(offset),
        }
    }

    /// Sets a register. Write 1 to clear registers are set to exactly `value`.
    pub fn write(&self, offset: usize, value: u32) {
        match w1c_mark(offset) {
            Some(mark) => {
                let mut raised = self.raised.lock().unwrap();
                raised.insert(offset, value);
                self.write_raw(offset, value | mark);
            }
            None => self.write_raw(offset, value),
        }
    }

    /// Sets `bits` in a write 1 to clear register, keeping the bits which are still pending.
    pub fn raise(&self, offset: usize, bits: u32) {
        let mark = w1c_mark(offset).expect("not a write 1 to clear register");
        self.settle();
        let mut raised = self.raised.lock().unwrap();
        let v = raised.entry(offset).or_default();
        *v |= bits;
        self.write_raw(offset, *v | mark);
    }

    pub fn port_read(&self, port: u8, offset: usize) -> u32 {
        self.read(port_offset(port, offset))
    }

    pub fn port_write(&self, port: u8, offset: usize, value: u32) {
        self.write(port_offset(port, offset), value)
    }

    pub fn port_raise(&self, port: u8, offset: usize, bits: u32) {
        self.raise(port_offset(port, offset), bits)
    }

    /// Raises `bits` in PxIS and the port's bit in IS.
    pub fn interrupt(&self, port: u8, bits: u32) {
        self.port_raise(port, PX_IS, bits);
        self.raise(IS, 1 << port);
    }

    /// Attaches a device with the given signature. The link comes up on the next delay.
    pub fn attach(&self, port: u8, sig: u32) {
        *self.attached.lock().unwrap() |= 1 << port;
        self.port_write(port, PX_SIG, sig);
    }

    /// Removes the device and drops the link immediately.
    pub fn detach(&self, port: u8) {
        *self.attached.lock().unwrap() &= !(1 << port);
        self.port_write(port, PX_SSTS, 0);
    }

    pub fn comresets(&self, port: u8) -> u32 {
        self.comresets.lock().unwrap()[port as usize]
    }

    /// Applies the side effects of the driver's register writes.
    fn tick(&self) {
        self.settle();
        // GHC.HR completes immediately
        self.write(GHC, self.read(GHC) & !1);

        let attached = *self.attached.lock().unwrap();
        let pi = self.read(PI);
        for p in (0..32u8).filter(|p| pi & 1 << p != 0) {
            let mut cmd = self.port_read(p, PX_CMD) & !(CMD_CR | CMD_FR);
            if cmd & CMD_ST != 0 {
                cmd |= CMD_CR;
            } else {
                self.port_write(p, PX_CI, 0);
                cmd &= !(0x1f << 8);
            }
            if cmd & CMD_FRE != 0 {
                cmd |= CMD_FR;
            }
            self.port_write(p, PX_CMD, cmd);

            if self.port_read(p, PX_SCTL) & 0xf == 1 {
                self.port_write(p, PX_SSTS, 0);
                self.comresets.lock().unwrap()[p as usize] += 1;
            } else if attached & 1 << p != 0 {
                self.port_write(p, PX_SSTS, SSTS_UP);
            }
        }
    }

    /// Zeroes every interrupt status register and the task file.
    pub fn clear_interrupts(&self) {
        self.write(IS, 0);
        for p in 0..32 {
            self.port_write(p, PX_IS, 0);
            self.port_write(p, PX_TFD, 0);
        }
    }

    /// Returns the commands issued to `port` which have not completed.
    pub fn issued(&self, port: u8) -> Vec<IssuedCmd> {
        let ci = self.port_read(port, PX_CI);
        let clb = self.port_read(port, PX_CLB) as u64 | (self.port_read(port, PX_CLB + 4) as u64) << 32;
        (0..32u8)
            .filter(|s| ci & 1 << s != 0)
            .map(|slot| unsafe { IssuedCmd::read(port, slot, clb as usize + slot as usize * 32) })
            .collect()
    }

    /// Completes `cmd` successfully.
    pub fn complete(&self, cmd: &IssuedCmd, bytes: u32) {
        unsafe { ((cmd.header + 4) as *mut u32).write_volatile(bytes) };
        let ci = self.port_read(cmd.port, PX_CI);
        self.port_write(cmd.port, PX_CI, ci & !(1 << cmd.slot));
        self.interrupt(cmd.port, IS_DHRS);
    }

    /// Fails `cmd` with a task file error. The command remains issued, as it would on hardware.
    pub fn fail(&self, cmd: &IssuedCmd, error: u8) {
        // ERR | DRDY
        self.port_write(cmd.port, PX_TFD, (error as u32) << 8 | 0x41);
        let c = self.port_read(cmd.port, PX_CMD) & !(0x1f << 8);
        self.port_write(cmd.port, PX_CMD, c | (cmd.slot as u32) << 8);
        self.interrupt(cmd.port, IS_TFES);
    }
}

/// A command found in the command list.
#[derive(Debug, Clone)]
pub struct IssuedCmd {
    pub port: u8,
    pub slot: u8,
    header: usize,
    pub write: bool,
    pub fis: [u8; 20],
    prds: Vec<(usize, usize)>,
}

impl IssuedCmd {
    unsafe fn read(port: u8, slot: u8, header: usize) -> Self {
        unsafe {
            let dw0 = (header as *const u32).read_volatile();
            let table = (header as *const u64).add(1).read_volatile() as usize;
            let mut fis = [0u8; 20];
            std::ptr::copy_nonoverlapping(table as *const u8, fis.as_mut_ptr(), 20);
            let prds = (0..(dw0 >> 16) as usize)
                .map(|i| {
                    let e = table + 0x80 + i * 16;
                    let dba = (e as *const u64).read_volatile() as usize;
                    let dbc = ((e + 12) as *const u32).read_volatile() & 0x3f_ffff;
                    (dba, dbc as usize + 1)
                })
                .collect();
            Self {
                port,
                slot,
                header,
                write: dw0 & 1 << 6 != 0,
                fis,
                prds,
            }
        }
    }

    pub fn command(&self) -> u8 {
        self.fis[2]
    }

    /// The LBA and sector count of a 48bit command.
    pub fn lba_ext(&self) -> (u64, u32) {
        let f = &self.fis;
        let lba = u64::from_le_bytes([f[4], f[5], f[6], f[8], f[9], f[10], 0, 0]);
        let count = match u16::from_le_bytes([f[12], f[13]]) {
            0 => 1 << 16,
            n => n as u32,
        };
        (lba, count)
    }

    /// The LBA and sector count of a 28bit command.
    pub fn lba_28(&self) -> (u64, u32) {
        let f = &self.fis;
        let lba = u64::from_le_bytes([f[4], f[5], f[6], f[7] & 0xf, 0, 0, 0, 0]);
        let count = match f[12] {
            0 => 256,
            n => n as u32,
        };
        (lba, count)
    }

    pub fn data_len(&self) -> usize {
        self.prds.iter().map(|(_, l)| l).sum()
    }

    /// Writes `data` to the regions described by the PRDT.
    pub fn put_data(&self, mut data: &[u8]) {
        for &(addr, len) in &self.prds {
            let n = len.min(data.len());
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, n) };
            data = &data[n..];
        }
    }

    /// Reads the regions described by the PRDT.
    pub fn get_data(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.data_len());
        for &(addr, len) in &self.prds {
            v.extend_from_slice(unsafe { std::slice::from_raw_parts(addr as *const u8, len) });
        }
        v
    }
}

pub struct FakeServices {
    hba: Arc<FakeHba>,
    expire_deadlines: AtomicBool,
    irqs: Mutex<Vec<(u8, Weak<dyn IrqHandler>, bool)>>,
    interrupts_disabled: AtomicUsize,
    delays_with_interrupts: AtomicUsize,
}

impl FakeServices {
    pub fn new(hba: &Arc<FakeHba>) -> Arc<Self> {
        Arc::new(Self {
            hba: hba.clone(),
            expire_deadlines: AtomicBool::new(false),
            irqs: Mutex::new(Vec::new()),
            interrupts_disabled: AtomicUsize::new(0),
            delays_with_interrupts: AtomicUsize::new(0),
        })
    }

    /// Returns the number of delays made outside of `without_interrupts` and resets the count.
    pub fn take_delays_with_interrupts(&self) -> usize {
        self.delays_with_interrupts.swap(0, Ordering::SeqCst)
    }

    /// When set every deadline has already passed.
    pub fn expire_deadlines(&self, expire: bool) {
        self.expire_deadlines.store(expire, Ordering::SeqCst)
    }

    /// Returns the registered interrupt lines and whether they are enabled.
    pub fn irqs(&self) -> Vec<(u8, bool)> {
        self.irqs.lock().unwrap().iter().map(|(i, _, e)| (*i, *e)).collect()
    }

    /// Calls the handlers registered for `irq`.
    pub fn raise(&self, irq: u8) -> bool {
        let handlers: Vec<_> = self
            .irqs
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _, e)| *i == irq && *e)
            .filter_map(|(_, h, _)| h.upgrade())
            .collect();
        let handled = handlers.iter().fold(false, |acc, h| h.handle_irq() | acc);
        self.hba.settle();
        handled
    }
}

impl MmioMapper for FakeServices {
    fn map(&self, phys: u64, _len: usize) -> Option<NonNull<u8>> {
        NonNull::new(phys as *mut u8)
    }

    unsafe fn unmap(&self, _virt: NonNull<u8>, _len: usize) {}
}

impl KernelServices for FakeServices {
    fn alloc_dma_pages(&self, pages: usize, _region: MemRegion) -> Option<(u64, NonNull<u8>)> {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).ok()?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        Some((ptr.as_ptr() as u64, ptr))
    }

    unsafe fn free_dma_pages(&self, _phys: u64, virt: NonNull<u8>, pages: usize) {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { std::alloc::dealloc(virt.as_ptr(), layout) }
    }

    fn delay_us(&self, _us: u64) {
        if self.interrupts_disabled.load(Ordering::SeqCst) == 0 {
            self.delays_with_interrupts.fetch_add(1, Ordering::SeqCst);
        }
        self.hba.tick()
    }

    fn deadline(&self, _ms: u64) -> BoxFuture<'static, ()> {
        if self.expire_deadlines.load(Ordering::SeqCst) {
            Box::pin(futures::future::ready(()))
        } else {
            Box::pin(futures::future::pending())
        }
    }

    fn register_irq(&self, irq: u8, handler: Weak<dyn IrqHandler>) -> bool {
        self.irqs.lock().unwrap().push((irq, handler, false));
        true
    }

    fn set_irq_enabled(&self, irq: u8, enabled: bool) {
        for (i, _, e) in self.irqs.lock().unwrap().iter_mut() {
            if *i == irq {
                *e = enabled;
            }
        }
    }

    fn without_interrupts(&self, f: &mut dyn FnMut()) {
        self.interrupts_disabled.fetch_add(1, Ordering::SeqCst);
        f();
        self.interrupts_disabled.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn function(hba: &FakeHba, vendor_id: u16, device_id: u16) -> PciFunction {
    PciFunction {
        address: DeviceAddress::new(0, 0, 0x1f, 2),
        vendor_id,
        device_id,
        abar: Some(hba.abar()),
        interrupt_line: 11,
    }
}

pub fn polled_config() -> AhciConfig {
    AhciConfig {
        use_interrupts: false,
        slot_buffer_pages: 2,
        ..Default::default()
    }
}

pub fn controller_only_config() -> AhciConfig {
    AhciConfig {
        reset_mode: ResetMode::ControllerOnly,
        ..polled_config()
    }
}

/// Brings up a polled controller. Interrupt status left over from the bring up is cleared.
pub fn bring_up(hba: &Arc<FakeHba>, config: AhciConfig) -> (Arc<FakeServices>, AhciController) {
    let services = FakeServices::new(hba);
    let ctl = AhciController::new(
        function(hba, 0x1022, 0x7901),
        services.clone(),
        config,
        &[],
    )
    .unwrap();
    hba.clear_interrupts();
    (services, ctl)
}

/// Builds an IDENTIFY DEVICE response.
pub struct IdentifyData {
    pub words: [u16; 256],
}

impl IdentifyData {
    /// A 28bit disk with 512 byte sectors.
    pub fn disk(sectors: u32) -> Self {
        let mut words = [0u16; 256];
        words[60] = sectors as u16;
        words[61] = (sectors >> 16) as u16;
        let mut s = Self { words };
        s.set_string(10, 20, "FAKE0001");
        s.set_string(27, 40, "FAKE DISK");
        s
    }

    pub fn lba48(mut self, sectors: u64) -> Self {
        self.words[83] |= 1 << 10;
        for i in 0..4 {
            self.words[100 + i] = (sectors >> (16 * i)) as u16;
        }
        self
    }

    pub fn set_string(&mut self, word: usize, len: usize, s: &str) {
        let mut b = vec![b' '; len];
        b[..s.len()].copy_from_slice(s.as_bytes());
        for (i, pair) in b.chunks(2).enumerate() {
            self.words[word + i] = (pair[0] as u16) << 8 | pair[1] as u16;
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// An in memory disk which services commands issued to it.
pub struct FakeDisk {
    pub identify: IdentifyData,
    pub sectors: Vec<u8>,
    pub sector_size: usize,
    pub log: Vec<(u8, u64, u32)>,
    /// Commands are failed with this ATA error while it is set.
    pub fail_next: Option<u8>,
}

impl FakeDisk {
    pub fn new(identify: IdentifyData, sector_size: usize, sectors: usize) -> Self {
        Self {
            identify,
            sectors: (0..sector_size * sectors).map(|i| (i / sector_size) as u8).collect(),
            sector_size,
            log: Vec::new(),
            fail_next: None,
        }
    }

    pub fn service(&mut self, hba: &FakeHba, cmd: &IssuedCmd) {
        if let Some(e) = self.fail_next.take() {
            self.log.push((cmd.command(), 0, 0));
            hba.fail(cmd, e);
            return;
        }
        let (lba, count) = match cmd.command() {
            0x25 | 0x35 => cmd.lba_ext(),
            0xc8 | 0xca => cmd.lba_28(),
            _ => (0, 0),
        };
        self.log.push((cmd.command(), lba, count));

        let range = lba as usize * self.sector_size..(lba as usize + count as usize) * self.sector_size;
        match cmd.command() {
            0xec | 0xa1 => cmd.put_data(&self.identify.bytes()),
            0x25 | 0xc8 => cmd.put_data(&self.sectors[range]),
            0x35 | 0xca => {
                let data = cmd.get_data();
                self.sectors[range.clone()].copy_from_slice(&data[..range.len()]);
            }
            _ => {}
        }
        hba.complete(cmd, cmd.data_len() as u32);
    }
}

/// Polls `fut` to completion. Between polls `device` services every issued command on `port` and
/// the controller is polled.
pub fn drive<F: Future>(
    hba: &FakeHba,
    ctl: &AhciController,
    port: u8,
    disk: &mut FakeDisk,
    fut: F,
) -> F::Output {
    let mut fut = pin!(fut);
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    for _ in 0..1000 {
        if let Poll::Ready(r) = fut.as_mut().poll(&mut cx) {
            return r;
        }
        for cmd in hba.issued(port) {
            disk.service(hba, &cmd);
        }
        ctl.poll();
        hba.clear_interrupts();
    }
    panic!("future did not complete");
}

/// Brings up a polled controller with a single disk on port 0 and identifies it.
pub fn disk_on_port_0(slots: u8, identify: IdentifyData, sectors: usize) -> Setup {
    let hba = FakeHba::new(1, slots);
    hba.attach(0, SIG_ATA);
    let (services, ctl) = bring_up(&hba, polled_config());
    let mut disk = FakeDisk::new(identify, 512, sectors);
    let disks = drive(&hba, &ctl, 0, &mut disk, ctl.initialize_devices());
    assert_eq!(disks.len(), 1);
    disk.log.clear();
    Setup {
        hba,
        services,
        ctl,
        disk,
        dev: disks.into_iter().next().unwrap(),
    }
}

pub struct Setup {
    pub hba: Arc<FakeHba>,
    pub services: Arc<FakeServices>,
    pub ctl: AhciController,
    pub disk: FakeDisk,
    pub dev: Arc<ahci::driver::block::AhciDiskDevice>,
}
