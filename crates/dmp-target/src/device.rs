//! Backing block devices
//!
//! [`BlockDevice`] is the lower layer a passthrough target forwards to.
//! Submission is fire-and-forget: the device finishes each bio through
//! [`Bio::endio`] whenever it is done, on whatever thread it likes.
//!
//! - [`MemDevice`]: RAM disk, completes inline on the submitting thread
//! - [`FileDevice`]: file or block-special file, serviced by a worker thread

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bio::{Bio, BlkStatus, ReqFlags, ReqOp};
use crate::error::TargetError;
use crate::{SECTOR_SIZE, bytes_to_sectors};

/// Zero buffer size used when clearing ranges on a file
const ZERO_CHUNK: usize = 64 * 1024;

/// Access mode of a device open (the table's mode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl DeviceMode {
    pub fn is_writable(&self) -> bool {
        matches!(self, DeviceMode::ReadWrite)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::ReadOnly => "ro",
            DeviceMode::ReadWrite => "rw",
        }
    }
}

impl FromStr for DeviceMode {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ro" | "r" => Ok(DeviceMode::ReadOnly),
            "rw" | "w" => Ok(DeviceMode::ReadWrite),
            other => Err(TargetError::InvalidConfiguration(format!(
                "unknown device mode '{other}' (expected ro or rw)"
            ))),
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device bios can be submitted to
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Device name (path or registered name)
    fn name(&self) -> &str;

    /// Capacity in 512-byte sectors
    fn capacity_sectors(&self) -> u64;

    /// Whether the device refuses writes
    fn read_only(&self) -> bool;

    /// Queue `bio` for execution.
    ///
    /// Never blocks on behalf of a NOWAIT bio: one that would have to wait
    /// completes with [`BlkStatus::Again`]. The bio may be completed before
    /// this returns.
    fn submit(&self, bio: Bio);

    /// Number of bios submitted so far
    fn submitted(&self) -> u64;
}

/// Check that `bio` fits within `capacity` bytes and may run on this device
fn admit(bio: &Bio, capacity: u64, read_only: bool) -> Result<(u64, u64), BlkStatus> {
    if read_only && bio.op().is_write() && bio.op() != ReqOp::Flush {
        return Err(BlkStatus::IoErr);
    }
    let start = bio.offset();
    match start.checked_add(bio.size()) {
        Some(end) if end <= capacity => Ok((start, end)),
        _ => Err(BlkStatus::IoErr),
    }
}

// ── MemDevice ────────────────────────────────────────────────────────────────

/// In-memory RAM disk
pub struct MemDevice {
    name: String,
    data: RwLock<Vec<u8>>,
    capacity: u64,
    read_only: bool,
    submitted: AtomicU64,
}

impl MemDevice {
    /// Create a zero-filled RAM disk of `size_bytes` (rounded down to whole sectors)
    pub fn new(name: impl Into<String>, size_bytes: u64) -> Self {
        let capacity = bytes_to_sectors(size_bytes) * SECTOR_SIZE;
        Self {
            name: name.into(),
            data: RwLock::new(vec![0u8; capacity as usize]),
            capacity,
            read_only: false,
            submitted: AtomicU64::new(0),
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Copy `len` bytes starting at `offset` out of the disk
    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.read();
        let start = offset as usize;
        data[start..start + len].to_vec()
    }

    /// Store `buf` at `offset`, bypassing the request path
    pub fn write_at(&self, offset: u64, buf: &[u8]) {
        let mut data = self.data.write();
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
    }

    /// Hold the disk exclusively, stalling every bio that needs it
    #[cfg(test)]
    pub(crate) fn lock_exclusive(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    fn lock_read(&self, nowait: bool) -> Option<RwLockReadGuard<'_, Vec<u8>>> {
        if nowait {
            self.data.try_read()
        } else {
            Some(self.data.read())
        }
    }

    fn lock_write(&self, nowait: bool) -> Option<RwLockWriteGuard<'_, Vec<u8>>> {
        if nowait {
            self.data.try_write()
        } else {
            Some(self.data.write())
        }
    }

    /// Run `bio` against the disk. NOWAIT bios that would wait for the
    /// lock fail with `Again`.
    fn execute(&self, bio: &mut Bio) -> BlkStatus {
        let (start, end) = match admit(bio, self.capacity, self.read_only) {
            Ok(range) => range,
            Err(status) => return status,
        };
        let (start, end) = (start as usize, end as usize);
        let nowait = bio.is_nowait();

        match bio.op() {
            ReqOp::Read => {
                let Some(data) = self.lock_read(nowait) else {
                    return BlkStatus::Again;
                };
                bio.data_mut().copy_from_slice(&data[start..end]);
            }
            ReqOp::Write => {
                let Some(mut data) = self.lock_write(nowait) else {
                    return BlkStatus::Again;
                };
                data[start..end].copy_from_slice(bio.data());
            }
            ReqOp::Discard | ReqOp::WriteZeroes | ReqOp::SecureErase => {
                let Some(mut data) = self.lock_write(nowait) else {
                    return BlkStatus::Again;
                };
                data[start..end].fill(0);
            }
            ReqOp::Flush => {}
        }
        BlkStatus::Ok
    }
}

impl fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemDevice")
            .field("name", &self.name)
            .field("capacity_sectors", &self.capacity_sectors())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl BlockDevice for MemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity_sectors(&self) -> u64 {
        bytes_to_sectors(self.capacity)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn submit(&self, mut bio: Bio) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let status = self.execute(&mut bio);
        bio.endio(status);
    }

    fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

// ── FileDevice ───────────────────────────────────────────────────────────────

/// File-backed device (regular file or block-special file)
///
/// Bios are handed to a dedicated worker thread over an unbounded channel, so
/// `submit` never waits on I/O. Dropping the device closes the channel, lets
/// the worker drain what was already queued and joins it.
pub struct FileDevice {
    name: String,
    capacity_sectors: u64,
    read_only: bool,
    tx: Option<mpsc::UnboundedSender<Bio>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    submitted: AtomicU64,
}

impl FileDevice {
    /// Open `path` with the given access mode and start its worker
    pub fn open(path: impl AsRef<Path>, mode: DeviceMode) -> io::Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(mode.is_writable())
            .open(path)?;
        // Seeking to the end also sizes block-special files, where metadata().len() is 0
        let capacity = file.seek(SeekFrom::End(0))?;
        let capacity_sectors = bytes_to_sectors(capacity);
        let read_only = !mode.is_writable();
        let name = path.to_string_lossy().to_string();

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name("dmp-io".to_string())
            .spawn(move || io_worker(file, capacity_sectors * SECTOR_SIZE, read_only, rx))?;

        debug!("Opened file device {name} ({capacity_sectors} sectors, {mode})");

        Ok(Self {
            name,
            capacity_sectors,
            read_only,
            tx: Some(tx),
            worker: Mutex::new(Some(worker)),
            submitted: AtomicU64::new(0),
        })
    }
}

fn io_worker(file: File, capacity: u64, read_only: bool, mut rx: mpsc::UnboundedReceiver<Bio>) {
    while let Some(mut bio) = rx.blocking_recv() {
        let status = match admit(&bio, capacity, read_only) {
            Ok((start, end)) => match execute_file(&file, &mut bio, start, end) {
                Ok(()) => BlkStatus::Ok,
                Err(e) => {
                    warn!("File device I/O error on {:?}: {e}", bio);
                    BlkStatus::IoErr
                }
            },
            Err(status) => status,
        };
        bio.endio(status);
    }
}

fn execute_file(file: &File, bio: &mut Bio, start: u64, end: u64) -> io::Result<()> {
    match bio.op() {
        ReqOp::Read => file.read_exact_at(bio.data_mut(), start),
        ReqOp::Write => {
            file.write_all_at(bio.data(), start)?;
            if bio.flags().contains(ReqFlags::FUA) {
                file.sync_data()?;
            }
            Ok(())
        }
        ReqOp::Discard | ReqOp::WriteZeroes | ReqOp::SecureErase => {
            let zeros = [0u8; ZERO_CHUNK];
            let mut pos = start;
            while pos < end {
                let n = ((end - pos) as usize).min(ZERO_CHUNK);
                file.write_all_at(&zeros[..n], pos)?;
                pos += n as u64;
            }
            Ok(())
        }
        ReqOp::Flush => file.sync_data(),
    }
}

impl fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDevice")
            .field("name", &self.name)
            .field("capacity_sectors", &self.capacity_sectors)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn submit(&self, bio: Bio) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = &self.tx {
            // A closed channel hands the bio back; dropping it completes it with IoErr
            if let Err(mpsc::error::SendError(bio)) = tx.send(bio) {
                warn!("File device {} worker gone, failing {:?}", self.name, bio);
            }
        }
    }

    fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            warn!("File device {} worker panicked", self.name);
        }
        debug!("Closed file device {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_device_mode_parse() {
        assert_eq!("ro".parse::<DeviceMode>().unwrap(), DeviceMode::ReadOnly);
        assert_eq!("rw".parse::<DeviceMode>().unwrap(), DeviceMode::ReadWrite);
        assert!("rx".parse::<DeviceMode>().is_err());
    }

    #[test]
    fn test_mem_device_write_then_read() {
        let dev = MemDevice::new("ram0", 64 * 1024);
        assert_eq!(dev.capacity_sectors(), 128);

        let (bio, waiter) = Bio::write(2, &[0x5A; 1024]).with_completion();
        dev.submit(bio);
        assert!(waiter.wait().status.is_ok());

        let (bio, waiter) = Bio::read(2, 1024).with_completion();
        dev.submit(bio);
        let done = waiter.wait();
        assert!(done.status.is_ok());
        assert!(done.data.iter().all(|&b| b == 0x5A));
        assert_eq!(dev.submitted(), 2);
    }

    #[test]
    fn test_mem_device_out_of_range() {
        let dev = MemDevice::new("ram0", 4096);
        let (bio, waiter) = Bio::read(7, 1024).with_completion();
        dev.submit(bio);
        assert_eq!(waiter.wait().status, BlkStatus::IoErr);
    }

    #[test]
    fn test_mem_device_discard_zeroes_range() {
        let dev = MemDevice::new("ram0", 8192);
        dev.write_at(0, &[0xFF; 8192]);

        let (bio, waiter) = Bio::discard(4, 2048).with_completion();
        dev.submit(bio);
        assert!(waiter.wait().status.is_ok());
        assert!(dev.read_at(2048, 2048).iter().all(|&b| b == 0));
        assert!(dev.read_at(0, 2048).iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_read_only_mem_device_rejects_writes() {
        let dev = MemDevice::new("ram0", 4096).with_read_only(true);
        let (bio, waiter) = Bio::write(0, &[1; 512]).with_completion();
        dev.submit(bio);
        assert_eq!(waiter.wait().status, BlkStatus::IoErr);
    }

    #[test]
    fn test_file_device_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 1 << 20]).unwrap();
        file.flush().unwrap();

        let dev = FileDevice::open(file.path(), DeviceMode::ReadWrite).unwrap();
        assert_eq!(dev.capacity_sectors(), 2048);

        let (bio, waiter) = Bio::write(100, &[0xC3; 4096]).with_completion();
        dev.submit(bio);
        assert!(waiter.wait().status.is_ok());

        let (bio, waiter) = Bio::read(100, 4096).with_completion();
        dev.submit(bio);
        let done = waiter.wait();
        assert!(done.status.is_ok());
        assert!(done.data.iter().all(|&b| b == 0xC3));
    }

    #[test]
    fn test_file_device_read_only_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 4096]).unwrap();
        file.flush().unwrap();

        let dev = FileDevice::open(file.path(), DeviceMode::ReadOnly).unwrap();
        assert!(dev.read_only());
        let (bio, waiter) = Bio::write(0, &[1; 512]).with_completion();
        dev.submit(bio);
        assert_eq!(waiter.wait().status, BlkStatus::IoErr);
    }

    #[test]
    fn test_mem_device_nowait_under_contention() {
        let dev = MemDevice::new("ram0", 8192);
        let guard = dev.lock_exclusive();

        for bio in [
            Bio::read(0, 512),
            Bio::write(0, &[1; 512]),
            Bio::discard(0, 512),
        ] {
            let (bio, waiter) = bio.with_flags(ReqFlags::NOWAIT).with_completion();
            dev.submit(bio);
            assert_eq!(waiter.wait().status, BlkStatus::Again);
        }
        drop(guard);

        let (bio, waiter) = Bio::read(0, 512)
            .with_flags(ReqFlags::NOWAIT)
            .with_completion();
        dev.submit(bio);
        assert!(waiter.wait().status.is_ok());
    }

    #[test]
    fn test_file_device_fua_write_and_flush() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 8192]).unwrap();
        file.flush().unwrap();

        let dev = FileDevice::open(file.path(), DeviceMode::ReadWrite).unwrap();
        let (bio, waiter) = Bio::write(0, &[0x9E; 4096])
            .with_flags(ReqFlags::FUA)
            .with_completion();
        dev.submit(bio);
        assert!(waiter.wait().status.is_ok());

        let (bio, waiter) = Bio::flush().with_completion();
        dev.submit(bio);
        assert!(waiter.wait().status.is_ok());

        let on_disk = std::fs::read(file.path()).unwrap();
        assert!(on_disk[..4096].iter().all(|&b| b == 0x9E));
    }

    #[test]
    fn test_file_device_missing_path() {
        assert!(FileDevice::open("/nonexistent/dmp-backing", DeviceMode::ReadWrite).is_err());
    }
}
