//! Block I/O requests
//!
//! A [`Bio`] is one request as the target sees it: an operation, flags, a
//! start sector, a byte size and (for reads and writes) a payload buffer.
//! Whoever finishes the request calls [`Bio::endio`], which fires the
//! completion token handed out by [`Bio::with_completion`]. A bio dropped
//! without `endio` completes with [`BlkStatus::IoErr`], so a submitter waiting
//! on a [`BioWaiter`] is always woken exactly once.

use std::fmt;
use std::mem;

use bitflags::bitflags;
use bytes::BytesMut;
use tokio::sync::oneshot;

/// Identifier the device registry assigns to each backing device
pub type DeviceId = u64;

/// Request operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqOp {
    Read,
    Write,
    Flush,
    Discard,
    SecureErase,
    WriteZeroes,
}

impl ReqOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReqOp::Read => "read",
            ReqOp::Write => "write",
            ReqOp::Flush => "flush",
            ReqOp::Discard => "discard",
            ReqOp::SecureErase => "secure-erase",
            ReqOp::WriteZeroes => "write-zeroes",
        }
    }

    /// Whether the request carries a data buffer
    pub fn has_payload(&self) -> bool {
        matches!(self, ReqOp::Read | ReqOp::Write)
    }

    /// Whether the request modifies the device
    pub fn is_write(&self) -> bool {
        !matches!(self, ReqOp::Read)
    }
}

impl fmt::Display for ReqOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Request modifier flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReqFlags: u32 {
        /// Synchronous I/O
        const SYNC = 1 << 0;
        /// Speculative read-ahead issued by a caching layer
        const RAHEAD = 1 << 1;
        /// Forced unit access
        const FUA = 1 << 2;
        /// Flush the device cache before this request
        const PREFLUSH = 1 << 3;
        /// Submitter cannot sleep; anything that would block must fail with `Again`
        const NOWAIT = 1 << 4;
    }
}

/// Completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkStatus {
    Ok,
    IoErr,
    /// Would have blocked a NOWAIT submitter; retry without NOWAIT
    Again,
}

impl BlkStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, BlkStatus::Ok)
    }

    /// Errno equivalent (0 for success)
    pub fn to_errno(&self) -> i32 {
        match self {
            BlkStatus::Ok => 0,
            BlkStatus::IoErr => libc::EIO,
            BlkStatus::Again => libc::EAGAIN,
        }
    }
}

/// What the submitter gets back when a bio finishes
#[derive(Debug)]
pub struct Completion {
    pub status: BlkStatus,
    /// Payload buffer; holds the data for a completed read
    pub data: BytesMut,
}

impl Completion {
    fn lost() -> Self {
        Self {
            status: BlkStatus::IoErr,
            data: BytesMut::new(),
        }
    }
}

/// Receiving side of a bio's completion token
#[derive(Debug)]
pub struct BioWaiter {
    rx: oneshot::Receiver<Completion>,
}

impl BioWaiter {
    /// Block the current thread until the bio completes.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`BioWaiter::completed`] there.
    pub fn wait(self) -> Completion {
        self.rx.blocking_recv().unwrap_or_else(|_| Completion::lost())
    }

    /// Wait for completion asynchronously
    pub async fn completed(self) -> Completion {
        self.rx.await.unwrap_or_else(|_| Completion::lost())
    }

    /// Non-blocking poll; `None` while the bio is still in flight
    pub fn try_completed(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

/// One block I/O request
pub struct Bio {
    op: ReqOp,
    flags: ReqFlags,
    /// Start sector
    sector: u64,
    /// Size in bytes
    size: u64,
    data: BytesMut,
    /// Device the bio is currently aimed at (None until remapped)
    dev: Option<DeviceId>,
    done: Option<oneshot::Sender<Completion>>,
}

impl Bio {
    /// Create a bio. Read and write bios get a zeroed buffer of `size` bytes.
    pub fn new(op: ReqOp, sector: u64, size: u64) -> Self {
        let data = if op.has_payload() {
            BytesMut::zeroed(size as usize)
        } else {
            BytesMut::new()
        };
        Self {
            op,
            flags: ReqFlags::empty(),
            sector,
            size,
            data,
            dev: None,
            done: None,
        }
    }

    pub fn read(sector: u64, len: u64) -> Self {
        Self::new(ReqOp::Read, sector, len)
    }

    /// Read into a caller-supplied buffer; the size is the buffer length
    pub fn read_into(sector: u64, buf: BytesMut) -> Self {
        let mut bio = Self::new(ReqOp::Read, sector, 0);
        bio.size = buf.len() as u64;
        bio.data = buf;
        bio
    }

    pub fn write(sector: u64, data: &[u8]) -> Self {
        let mut bio = Self::new(ReqOp::Write, sector, 0);
        bio.size = data.len() as u64;
        bio.data = BytesMut::from(data);
        bio
    }

    pub fn discard(sector: u64, len: u64) -> Self {
        Self::new(ReqOp::Discard, sector, len)
    }

    pub fn flush() -> Self {
        Self::new(ReqOp::Flush, 0, 0).with_flags(ReqFlags::PREFLUSH)
    }

    pub fn with_flags(mut self, flags: ReqFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Attach a completion token and return the waiting side
    pub fn with_completion(mut self) -> (Self, BioWaiter) {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        (self, BioWaiter { rx })
    }

    pub fn op(&self) -> ReqOp {
        self.op
    }

    pub fn flags(&self) -> ReqFlags {
        self.flags
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn dev(&self) -> Option<DeviceId> {
        self.dev
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Byte offset of the first sector
    pub fn offset(&self) -> u64 {
        crate::sectors_to_bytes(self.sector)
    }

    pub fn is_read_ahead(&self) -> bool {
        self.op == ReqOp::Read && self.flags.contains(ReqFlags::RAHEAD)
    }

    /// Submitter cannot sleep
    pub fn is_nowait(&self) -> bool {
        self.flags.contains(ReqFlags::NOWAIT)
    }

    /// Aim the bio at `dev` without moving it
    pub fn set_dev(&mut self, dev: DeviceId) {
        self.dev = Some(dev);
    }

    /// Point the bio at `dev`, starting at `sector`
    pub fn remap(&mut self, dev: DeviceId, sector: u64) {
        self.dev = Some(dev);
        self.sector = sector;
    }

    /// Fill the payload with zero bytes
    pub fn zero_fill(&mut self) {
        self.data.fill(0);
    }

    /// Finish the bio and fire its completion token
    pub fn endio(mut self, status: BlkStatus) {
        if let Some(tx) = self.done.take() {
            let data = mem::take(&mut self.data);
            // Submitter may have stopped waiting
            let _ = tx.send(Completion { status, data });
        }
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("op", &self.op)
            .field("flags", &self.flags)
            .field("sector", &self.sector)
            .field("size", &self.size)
            .field("dev", &self.dev)
            .finish()
    }
}

impl Drop for Bio {
    fn drop(&mut self) {
        if let Some(tx) = self.done.take() {
            let data = mem::take(&mut self.data);
            let _ = tx.send(Completion {
                status: BlkStatus::IoErr,
                data,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bio_has_zeroed_payload() {
        let bio = Bio::read(8, 4096);
        assert_eq!(bio.op(), ReqOp::Read);
        assert_eq!(bio.size(), 4096);
        assert_eq!(bio.offset(), 8 * 512);
        assert!(bio.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_discard_has_no_payload() {
        let bio = Bio::discard(0, 1 << 20);
        assert_eq!(bio.size(), 1 << 20);
        assert!(bio.data().is_empty());
    }

    #[test]
    fn test_read_ahead_only_applies_to_reads() {
        assert!(Bio::read(0, 512).with_flags(ReqFlags::RAHEAD).is_read_ahead());
        assert!(!Bio::write(0, &[1; 512]).with_flags(ReqFlags::RAHEAD).is_read_ahead());
        assert!(!Bio::read(0, 512).is_read_ahead());
    }

    #[test]
    fn test_endio_delivers_payload() {
        let (mut bio, waiter) = Bio::read(0, 4).with_completion();
        bio.data_mut().copy_from_slice(&[1, 2, 3, 4]);
        bio.endio(BlkStatus::Ok);

        let done = waiter.wait();
        assert!(done.status.is_ok());
        assert_eq!(&done.data[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_dropped_bio_completes_with_error() {
        let (bio, mut waiter) = Bio::write(0, &[0xAB; 512]).with_completion();
        assert!(waiter.try_completed().is_none());
        drop(bio);

        let done = waiter.try_completed().expect("completion after drop");
        assert_eq!(done.status, BlkStatus::IoErr);
    }

    #[test]
    fn test_remap_and_zero_fill() {
        let mut bio = Bio::read_into(10, BytesMut::from(&[0xFFu8; 1024][..]));
        bio.remap(7, 2058);
        bio.zero_fill();
        assert_eq!(bio.dev(), Some(7));
        assert_eq!(bio.sector(), 2058);
        assert_eq!(bio.size(), 1024);
        assert!(bio.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_status_errno() {
        assert_eq!(BlkStatus::Ok.to_errno(), 0);
        assert_eq!(BlkStatus::IoErr.to_errno(), libc::EIO);
        assert_eq!(BlkStatus::Again.to_errno(), libc::EAGAIN);
    }
}
