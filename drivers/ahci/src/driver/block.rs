use super::port::Port;
use super::{CmdErr, CommandError, DevIdentity, SectorAddress, SectorCount};
use alloc::sync::{Arc, Weak};
use futures::FutureExt;
use futures::future::BoxFuture;

pub type IoResult<'a, T> = BoxFuture<'a, Result<T, IoError>>;

/// Errors returned to the block layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoError {
    /// The device was removed. The caller should drop the device.
    DeviceOffline,
    /// The request exceeds the end of the device.
    OutOfRange,
    /// The buffer does not match the requested number of blocks.
    GeomError,
    /// The buffer has an odd address or length.
    Misaligned,
    HardwareError,
    Timeout,
    InternalDriverErr,
}

impl From<CmdErr> for IoError {
    fn from(value: CmdErr) -> Self {
        match value {
            CmdErr::AtaErr => IoError::InternalDriverErr,
            CmdErr::DevErr(e) => {
                log::error!("SATA Device returned Error {e:#x}");
                IoError::HardwareError
            }
            CmdErr::Transport => IoError::HardwareError,
            CmdErr::Timeout => IoError::Timeout,
            CmdErr::Disowned => IoError::DeviceOffline,
            CmdErr::BadArgs => IoError::OutOfRange,
            CmdErr::BuildErr(CommandError::BadBuffer) => IoError::Misaligned,
            CmdErr::BuildErr(_) => IoError::InternalDriverErr,
        }
    }
}

/// A device addressed in fixed size blocks.
pub trait BlockDevice: Send + Sync {
    /// Logical block size in bytes.
    fn block_size(&self) -> u64;

    fn block_count(&self) -> u64;

    /// Preferred transfer alignment in bytes.
    fn physical_block_size(&self) -> u64;

    /// Reads `count` blocks starting at `start_lba` into `buffer`.
    /// Returns the number of bytes read.
    fn read_blocks<'a>(
        &'a self,
        start_lba: u64,
        count: u64,
        buffer: &'a mut [u8],
    ) -> IoResult<'a, usize>;

    /// Writes `count` blocks from `buffer` starting at `start_lba`.
    /// Returns the number of bytes written.
    fn write_blocks<'a>(&'a self, start_lba: u64, count: u64, buffer: &'a [u8])
    -> IoResult<'a, usize>;

    fn flush(&self) -> IoResult<'_, ()>;
}

/// A SATA disk attached to a [Port].
///
/// This holds a weak reference to the port and the port generation the disk was identified in.
/// Once the device is removed or replaced all operations return [IoError::DeviceOffline], even
/// if another disk is attached to the same port.
pub struct AhciDiskDevice {
    port: Weak<Port>,
    generation: u32,
    identity: DevIdentity,
    /// Maximum number of blocks issued in a single command.
    max_blocks: u64,
}

impl AhciDiskDevice {
    pub(crate) fn new(
        port: Weak<Port>,
        identity: DevIdentity,
        buffer_len: usize,
        generation: u32,
    ) -> Self {
        let limit = if identity.lba48() { 1 << 16 } else { 1 << 8 };
        let max_blocks = (buffer_len as u64 / identity.lba_size()).clamp(1, limit);
        Self {
            port,
            generation,
            identity,
            max_blocks,
        }
    }

    /// Returns the port while it still holds this disk.
    // If this returns err then the caller must drop self
    fn port(&self) -> Result<Arc<Port>, IoError> {
        self.port
            .upgrade()
            .filter(|p| p.generation() == self.generation)
            .ok_or(IoError::DeviceOffline)
    }

    pub fn identity(&self) -> &DevIdentity {
        &self.identity
    }

    /// Maximum number of blocks transferred by one command. Larger requests are split.
    pub fn max_blocks_per_transfer(&self) -> u64 {
        self.max_blocks
    }

    /// Checks the request and returns its length in bytes.
    fn check(&self, start_lba: u64, count: u64, buffer_len: usize) -> Result<usize, IoError> {
        let len = count
            .checked_mul(self.identity.lba_size())
            .ok_or(IoError::OutOfRange)?;
        if count == 0 || buffer_len as u64 != len {
            return Err(IoError::GeomError);
        }
        if buffer_len % 2 != 0 {
            return Err(IoError::Misaligned);
        }
        match start_lba.checked_add(count) {
            Some(end) if end <= self.identity.lba_count() => Ok(len as usize),
            _ => Err(IoError::OutOfRange),
        }
    }

    /// Splits `start..start + count` into chunks of at most `max_blocks`.
    /// Yields `(lba, blocks, byte offset)`.
    fn chunks(&self, start: u64, count: u64) -> impl Iterator<Item = (u64, u64, usize)> + '_ {
        let bs = self.identity.lba_size() as usize;
        (0..count)
            .step_by(self.max_blocks as usize)
            .map(move |done| {
                let n = (count - done).min(self.max_blocks);
                (start + done, n, done as usize * bs)
            })
    }
}

impl BlockDevice for AhciDiskDevice {
    fn block_size(&self) -> u64 {
        self.identity.lba_size()
    }

    fn block_count(&self) -> u64 {
        self.identity.lba_count()
    }

    fn physical_block_size(&self) -> u64 {
        self.identity.phys_sec_size()
    }

    fn read_blocks<'a>(
        &'a self,
        start_lba: u64,
        count: u64,
        buffer: &'a mut [u8],
    ) -> IoResult<'a, usize> {
        async move {
            let port = self.port()?;
            let len = self.check(start_lba, count, buffer.len())?;

            let bs = self.identity.lba_size() as usize;
            let mut total = 0;
            for (lba, n, offset) in self.chunks(start_lba, count) {
                let lba = SectorAddress::new(lba).ok_or(IoError::OutOfRange)?;
                let n = SectorCount::new(n as u32).ok_or(IoError::GeomError)?;
                total += port
                    .read_as(
                        Some(self.generation),
                        lba,
                        n,
                        &mut buffer[offset..offset + n.get() as usize * bs],
                    )
                    .await?;
            }
            debug_assert_eq!(total, len);
            Ok(total)
        }
        .boxed()
    }

    fn write_blocks<'a>(
        &'a self,
        start_lba: u64,
        count: u64,
        buffer: &'a [u8],
    ) -> IoResult<'a, usize> {
        async move {
            let port = self.port()?;
            let len = self.check(start_lba, count, buffer.len())?;

            let bs = self.identity.lba_size() as usize;
            let mut total = 0;
            for (lba, n, offset) in self.chunks(start_lba, count) {
                let lba = SectorAddress::new(lba).ok_or(IoError::OutOfRange)?;
                total += port
                    .write_as(
                        Some(self.generation),
                        lba,
                        &buffer[offset..offset + n as usize * bs],
                    )
                    .await?;
            }
            debug_assert_eq!(total, len);
            Ok(total)
        }
        .boxed()
    }

    fn flush(&self) -> IoResult<'_, ()> {
        async move {
            let port = self.port()?;
            port.flush_as(Some(self.generation)).await?;
            Ok(())
        }
        .boxed()
    }
}

impl core::fmt::Debug for AhciDiskDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AhciDiskDevice")
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .field("max_blocks", &self.max_blocks)
            .field("online", &self.port().is_ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn disk(lba48: bool, buffer_len: usize) -> AhciDiskDevice {
        let mut words = [0u16; 256];
        words[60] = 1000;
        if lba48 {
            words[83] = 1 << 10;
            words[100] = 0x8000;
            words[101] = 0x1;
        }
        let raw = ata::structures::identification::DeviceIdentity::from_words(&words);
        AhciDiskDevice::new(Weak::new(), DevIdentity::from(&raw), buffer_len, 1)
    }

    #[test]
    fn transfer_limit_follows_addressing() {
        assert_eq!(disk(false, 1 << 20).max_blocks_per_transfer(), 256);
        assert_eq!(disk(true, 1 << 20).max_blocks_per_transfer(), 2048);
        assert_eq!(disk(true, 64 << 20).max_blocks_per_transfer(), 1 << 16);
    }

    #[test]
    fn requests_are_split() {
        let d = disk(false, 1 << 20);
        let c: Vec<_> = d.chunks(10, 600).collect();
        assert_eq!(c, [(10, 256, 0), (266, 256, 256 * 512), (522, 88, 512 * 512)]);
    }

    #[test]
    fn checks_geometry() {
        let d = disk(false, 4096);
        assert_eq!(d.check(0, 2, 1024), Ok(1024));
        assert_eq!(d.check(0, 2, 1000), Err(IoError::GeomError));
        assert_eq!(d.check(0, 0, 0), Err(IoError::GeomError));
        assert_eq!(d.check(999, 1, 512), Ok(512));
        assert_eq!(d.check(999, 2, 1024), Err(IoError::OutOfRange));
        assert_eq!(d.check(u64::MAX, 1, 512), Err(IoError::OutOfRange));
    }

    #[test]
    fn removed_port_is_offline() {
        let d = disk(false, 4096);
        let mut b = [0u8; 512];
        let r = futures::executor::block_on(d.read_blocks(0, 1, &mut b));
        assert_eq!(r, Err(IoError::DeviceOffline));
        let r = futures::executor::block_on(d.flush());
        assert_eq!(r, Err(IoError::DeviceOffline));
    }

    #[test]
    fn command_errors_map_to_io_errors() {
        assert_eq!(IoError::from(CmdErr::Timeout), IoError::Timeout);
        assert_eq!(IoError::from(CmdErr::DevErr(4)), IoError::HardwareError);
        assert_eq!(
            IoError::from(CmdErr::BuildErr(CommandError::BadBuffer)),
            IoError::Misaligned
        );
        assert_eq!(IoError::from(CmdErr::Disowned), IoError::DeviceOffline);
    }
}
