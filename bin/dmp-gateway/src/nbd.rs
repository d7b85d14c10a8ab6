//! NBD (Network Block Device) newstyle server
//!
//! Exports a single dmp target over TCP using the fixed-newstyle handshake.
//! Every READ, WRITE and TRIM becomes one bio mapped through the target; the
//! session awaits the bio's completion and turns its status into the NBD
//! error field.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use bytes::BytesMut;
use dmp_target::{Bio, BlkStatus, DmpTarget, MapOutcome, ReqFlags, SECTOR_SIZE, bytes_to_sectors};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

// ── NBD protocol constants ────────────────────────────────────────────────────

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

// Handshake flags
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Option IDs
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_OPT_LIST: u32 = 3;
const NBD_OPT_INFO: u32 = 6;
const NBD_OPT_GO: u32 = 7;

// Reply types
const NBD_REP_ACK: u32 = 1;
const NBD_REP_SERVER: u32 = 2;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;
const NBD_REP_ERR_UNKNOWN: u32 = 0x8000_0006;

// Transmission flags
const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
const NBD_FLAG_READ_ONLY: u16 = 0x0002;
const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;
const NBD_FLAG_SEND_FUA: u16 = 0x0008;
const NBD_FLAG_SEND_TRIM: u16 = 0x0020;

// Info types
const NBD_INFO_EXPORT: u16 = 0;

// Commands
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;
const NBD_CMD_TRIM: u16 = 4;

// Command flags
const NBD_CMD_FLAG_FUA: u16 = 0x0001;

/// Largest payload accepted in one request
const MAX_REQUEST_BYTES: u32 = 32 * 1024 * 1024;

// ── Export ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct NbdExport {
    name: String,
    size_bytes: u64,
    read_only: bool,
}

impl NbdExport {
    fn transmission_flags(&self) -> u16 {
        let mut flags =
            NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_FUA | NBD_FLAG_SEND_TRIM;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags
    }

    /// Empty names select the default export
    fn matches(&self, name: &str) -> bool {
        name.is_empty() || name == self.name
    }
}

pub struct NbdServer {
    target: Arc<DmpTarget>,
    export: NbdExport,
}

impl NbdServer {
    pub fn new(target: Arc<DmpTarget>, export_name: &str, read_only: bool) -> Self {
        let size_bytes = target.context().size_bytes();
        info!("NBD: export '{export_name}' ({size_bytes}B, read_only={read_only})");
        Self {
            target,
            export: NbdExport {
                name: export_name.to_string(),
                size_bytes,
                read_only,
            },
        }
    }

    /// Accept clients until the task is cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let peer = peer.to_string();
                        if let Err(e) = server.handle_client(stream, &peer).await {
                            warn!("NBD: client {peer} error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("NBD: accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_client<S>(&self, mut stream: S, peer: &str) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!("NBD: client {peer} connected");

        // ── Handshake ─────────────────────────────────────────────────────────
        stream.write_u64(NBD_MAGIC).await?;
        stream.write_u64(NBD_IHAVEOPT).await?;
        stream
            .write_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES)
            .await?;
        stream.flush().await?;

        let client_flags = stream.read_u32().await?;
        let no_zeroes = client_flags & u32::from(NBD_FLAG_NO_ZEROES) != 0;

        // ── Option negotiation ────────────────────────────────────────────────
        self.negotiate_options(&mut stream, no_zeroes).await?;

        // ── Data phase ────────────────────────────────────────────────────────
        self.data_phase(&mut stream, peer).await?;

        info!("NBD: client {peer} disconnected from '{}'", self.export.name);
        Ok(())
    }

    async fn negotiate_options<S>(&self, stream: &mut S, no_zeroes: bool) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let magic = stream.read_u64().await?;
            if magic != NBD_IHAVEOPT {
                return Err(anyhow::anyhow!("bad option magic: {magic:#x}"));
            }
            let option = stream.read_u32().await?;
            let data_len = stream.read_u32().await?;
            if data_len > 4096 {
                return Err(anyhow::anyhow!("option {option} too long: {data_len}"));
            }

            let mut option_data = vec![0u8; data_len as usize];
            stream.read_exact(&mut option_data).await?;

            match option {
                NBD_OPT_ABORT => {
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    return Err(anyhow::anyhow!("client sent NBD_OPT_ABORT"));
                }

                NBD_OPT_LIST => {
                    let name = self.export.name.as_bytes();
                    let mut reply = Vec::with_capacity(4 + name.len());
                    reply.extend_from_slice(&(name.len() as u32).to_be_bytes());
                    reply.extend_from_slice(name);
                    send_option_reply(stream, option, NBD_REP_SERVER, &reply).await?;
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }

                NBD_OPT_INFO | NBD_OPT_GO => {
                    // u32 name_len + name + u16 n_requests + requests
                    let Some(name) = parse_export_name(&option_data) else {
                        send_option_reply(stream, option, NBD_REP_ERR_UNSUP, b"malformed request")
                            .await?;
                        continue;
                    };
                    if !self.export.matches(&name) {
                        send_option_reply(stream, option, NBD_REP_ERR_UNKNOWN, b"export not found")
                            .await?;
                        continue;
                    }

                    let mut info = Vec::with_capacity(12);
                    info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                    info.extend_from_slice(&self.export.size_bytes.to_be_bytes());
                    info.extend_from_slice(&self.export.transmission_flags().to_be_bytes());
                    send_option_reply(stream, option, NBD_REP_INFO, &info).await?;
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;

                    if option == NBD_OPT_GO {
                        return Ok(());
                    }
                }

                NBD_OPT_EXPORT_NAME => {
                    let name = String::from_utf8_lossy(&option_data);
                    if !self.export.matches(&name) {
                        return Err(anyhow::anyhow!("export '{name}' not found"));
                    }
                    // Old-style reply: size + flags (+ 124 zero bytes)
                    stream.write_u64(self.export.size_bytes).await?;
                    stream.write_u16(self.export.transmission_flags()).await?;
                    if !no_zeroes {
                        stream.write_all(&[0u8; 124]).await?;
                    }
                    stream.flush().await?;
                    return Ok(());
                }

                _ => {
                    send_option_reply(stream, option, NBD_REP_ERR_UNSUP, b"unsupported").await?;
                }
            }
        }
    }

    async fn data_phase<S>(&self, stream: &mut S, peer: &str) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            // magic(4) + flags(2) + type(2) + handle(8) + offset(8) + length(4)
            let magic = stream.read_u32().await?;
            if magic != NBD_REQUEST_MAGIC {
                return Err(anyhow::anyhow!("bad request magic: {magic:#x}"));
            }
            let cmd_flags = stream.read_u16().await?;
            let cmd = stream.read_u16().await?;
            let handle = stream.read_u64().await?;
            let offset = stream.read_u64().await?;
            let length = stream.read_u32().await?;

            let mut flags = ReqFlags::empty();
            if cmd_flags & NBD_CMD_FLAG_FUA != 0 {
                flags |= ReqFlags::FUA;
            }

            match cmd {
                NBD_CMD_READ => {
                    if let Err(errno) = self.check_range(offset, length) {
                        send_reply(stream, handle, errno).await?;
                        continue;
                    }
                    let bio = Bio::read_into(
                        bytes_to_sectors(offset),
                        BytesMut::zeroed(length as usize),
                    )
                    .with_flags(flags);
                    let (status, data) = self.submit(bio).await;
                    if status.is_ok() {
                        stream.write_u32(NBD_REPLY_MAGIC).await?;
                        stream.write_u32(0).await?;
                        stream.write_u64(handle).await?;
                        stream.write_all(&data).await?;
                        stream.flush().await?;
                    } else {
                        debug!("NBD: read {offset}+{length} from {peer} failed: {status:?}");
                        send_reply(stream, handle, errno(status)).await?;
                    }
                }

                NBD_CMD_WRITE => {
                    if length > MAX_REQUEST_BYTES {
                        return Err(anyhow::anyhow!("write of {length}B exceeds limit"));
                    }
                    // Payload is consumed even when the write is refused
                    let mut data = vec![0u8; length as usize];
                    stream.read_exact(&mut data).await?;

                    if self.export.read_only {
                        send_reply(stream, handle, libc::EPERM as u32).await?;
                        continue;
                    }
                    if let Err(errno) = self.check_range(offset, length) {
                        send_reply(stream, handle, errno).await?;
                        continue;
                    }
                    let bio = Bio::write(bytes_to_sectors(offset), &data).with_flags(flags);
                    let (status, _) = self.submit(bio).await;
                    send_reply(stream, handle, errno(status)).await?;
                }

                NBD_CMD_TRIM => {
                    if self.export.read_only {
                        send_reply(stream, handle, libc::EPERM as u32).await?;
                        continue;
                    }
                    if let Err(errno) = self.check_range(offset, length) {
                        send_reply(stream, handle, errno).await?;
                        continue;
                    }
                    let bio = Bio::discard(bytes_to_sectors(offset), u64::from(length));
                    let (status, _) = self.submit(bio).await;
                    send_reply(stream, handle, errno(status)).await?;
                }

                NBD_CMD_FLUSH => {
                    // Null sinks keep nothing to flush
                    let error = match self.target.sync_backing() {
                        Some(waiter) => errno(waiter.completed().await.status),
                        None => 0,
                    };
                    send_reply(stream, handle, error).await?;
                }

                NBD_CMD_DISC => {
                    info!("NBD: client {peer} sent disconnect");
                    return Ok(());
                }

                _ => {
                    warn!("NBD: unknown command {cmd} from {peer}");
                    send_reply(stream, handle, libc::EINVAL as u32).await?;
                }
            }
        }
    }

    /// Sector-aligned and inside the export
    fn check_range(&self, offset: u64, length: u32) -> Result<(), u32> {
        if offset % SECTOR_SIZE != 0 || u64::from(length) % SECTOR_SIZE != 0 {
            return Err(libc::EINVAL as u32);
        }
        if length > MAX_REQUEST_BYTES {
            return Err(libc::EOVERFLOW as u32);
        }
        match offset.checked_add(u64::from(length)) {
            Some(end) if end <= self.export.size_bytes => Ok(()),
            _ => Err(libc::ENOSPC as u32),
        }
    }

    /// Map `bio` through the target and wait for it to finish
    async fn submit(&self, bio: Bio) -> (BlkStatus, BytesMut) {
        let (bio, waiter) = bio.with_completion();
        if let MapOutcome::Kill(e) = self.target.map(bio) {
            debug!("NBD: request killed: {e}");
        }
        let done = waiter.completed().await;
        (done.status, done.data)
    }
}

fn errno(status: BlkStatus) -> u32 {
    status.to_errno() as u32
}

fn parse_export_name(data: &[u8]) -> Option<String> {
    let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let name_len = u32::from_be_bytes(len_bytes) as usize;
    let name = data.get(4..4 + name_len)?;
    Some(String::from_utf8_lossy(name).to_string())
}

async fn send_option_reply<S>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u64(NBD_OPTION_REPLY_MAGIC).await?;
    stream.write_u32(option).await?;
    stream.write_u32(reply_type).await?;
    stream.write_u32(data.len() as u32).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await?;
    Ok(())
}

async fn send_reply<S>(stream: &mut S, handle: u64, error: u32) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(NBD_REPLY_MAGIC).await?;
    stream.write_u32(error).await?;
    stream.write_u64(handle).await?;
    stream.flush().await?;
    Ok(())
}
