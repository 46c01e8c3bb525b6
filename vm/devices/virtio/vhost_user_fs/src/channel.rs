// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The vhost-user slave channel socket.
//!
//! Each frame is a 12-byte header followed by `size` bytes of payload. File
//! descriptors travel with the header as `SCM_RIGHTS` ancillary data.

// UNSAFETY: Calls to libc sendmsg/recvmsg and the work to prepare their inputs
// and take ownership of received fds.
#![expect(unsafe_code)]

use crate::errno_status;
use crate::protocol::DecodeError;
use crate::protocol::MAX_MESSAGE_SIZE;
use crate::status_code;
use crate::worker::SlaveClient;
use crate::SlaveCommand;
use crate::SlaveError;
use bitfield_struct::bitfield;
use std::io;
use std::io::IoSliceMut;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::LE;
use zerocopy::U32;
use zerocopy::U64;

/// Request codes on the slave channel.
pub mod request {
    pub const FS_MAP: u32 = 6;
    pub const FS_UNMAP: u32 = 7;
    pub const FS_SYNC: u32 = 8;
    pub const FS_IO: u32 = 9;
}

const VERSION: u8 = 1;

/// The most descriptors accepted with one frame.
const MAX_FDS: usize = 8;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
struct FrameHeader {
    request: U32<LE>,
    flags: U32<LE>,
    size: U32<LE>,
}

#[bitfield(u32)]
struct FrameFlags {
    #[bits(2)]
    version: u8,
    reply: bool,
    need_reply: bool,
    #[bits(28)]
    _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
struct StatusReply {
    header: FrameHeader,
    status: U64<LE>,
}

/// A failure that ends a slave channel connection.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("slave channel i/o error")]
    Io(#[source] io::Error),
    #[error("unsupported vhost-user protocol version {0}")]
    BadVersion(u8),
    #[error("frame carried more than {MAX_FDS} file descriptors")]
    ControlTruncated,
}

/// Serves one slave channel connection, forwarding commands to a worker.
#[derive(Debug)]
pub struct SlaveChannel {
    stream: UnixStream,
    client: SlaveClient,
}

impl SlaveChannel {
    /// Returns a channel reading frames from `stream`.
    pub fn new(stream: UnixStream, client: SlaveClient) -> Self {
        Self { stream, client }
    }

    /// Processes frames until the peer closes the connection.
    ///
    /// Malformed commands are answered with an error status and do not end
    /// the connection. The client is dropped on return, so a worker with no
    /// other clients tears down its mappings.
    pub fn run(self) -> Result<(), ChannelError> {
        loop {
            let mut fds = Vec::new();
            let Some(header) = self.read_header(&mut fds)? else {
                tracing::info!("slave channel closed");
                return Ok(());
            };
            let flags = FrameFlags::from_bits(header.flags.get());
            if flags.version() != VERSION {
                return Err(ChannelError::BadVersion(flags.version()));
            }
            let code = header.request.get();
            let size = header.size.get() as usize;
            let status = if size > MAX_MESSAGE_SIZE {
                self.drain(size)?;
                self.reject(code, DecodeError::TooLong(size).into())
            } else {
                let mut payload = vec![0; size];
                (&self.stream)
                    .read_exact(&mut payload)
                    .map_err(ChannelError::Io)?;
                self.handle(code, payload, fds)
            };
            if flags.need_reply() {
                self.reply(code, status)?;
            }
        }
    }

    fn handle(&self, code: u32, payload: Vec<u8>, fds: Vec<OwnedFd>) -> u64 {
        let command = match code {
            request::FS_MAP | request::FS_IO => {
                let [fd] = match <[OwnedFd; 1]>::try_from(fds) {
                    Ok(fds) => fds,
                    Err(fds) => {
                        return self.reject(code, DecodeError::UnexpectedFdCount(fds.len()).into())
                    }
                };
                if code == request::FS_MAP {
                    SlaveCommand::Map(fd)
                } else {
                    SlaveCommand::Io(fd)
                }
            }
            request::FS_UNMAP => {
                if !fds.is_empty() {
                    return self.reject(code, DecodeError::UnexpectedFdCount(fds.len()).into());
                }
                SlaveCommand::Unmap
            }
            _ => {
                tracing::warn!(code, "unsupported slave request");
                return errno_status(libc::ENOSYS);
            }
        };
        status_code(&self.client.call_blocking(command, payload))
    }

    fn reject(&self, code: u32, err: SlaveError) -> u64 {
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            code,
            "rejected slave request"
        );
        err.status_code()
    }

    fn reply(&self, code: u32, status: u64) -> Result<(), ChannelError> {
        let reply = StatusReply {
            header: FrameHeader {
                request: code.into(),
                flags: FrameFlags::new()
                    .with_version(VERSION)
                    .with_reply(true)
                    .into_bits()
                    .into(),
                size: (size_of::<U64<LE>>() as u32).into(),
            },
            status: status.into(),
        };
        (&self.stream)
            .write_all(reply.as_bytes())
            .map_err(ChannelError::Io)
    }

    fn drain(&self, size: usize) -> Result<(), ChannelError> {
        let n = io::copy(&mut (&self.stream).take(size as u64), &mut io::sink())
            .map_err(ChannelError::Io)?;
        if n != size as u64 {
            return Err(ChannelError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }

    /// Reads the next frame header and the descriptors sent with it. Returns
    /// `None` at end of stream.
    fn read_header(&self, fds: &mut Vec<OwnedFd>) -> Result<Option<FrameHeader>, ChannelError> {
        let mut header = FrameHeader::new_zeroed();
        let buf = header.as_mut_bytes();
        let n = loop {
            match recv_with_fds(&self.stream, buf, fds) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.raw_os_error() == Some(libc::EMSGSIZE) => {
                    return Err(ChannelError::ControlTruncated)
                }
                Err(err) => return Err(ChannelError::Io(err)),
            }
        };
        if n == 0 {
            return Ok(None);
        }
        (&self.stream)
            .read_exact(&mut buf[n..])
            .map_err(ChannelError::Io)?;
        Ok(Some(header))
    }
}

#[repr(C)]
struct CmsgScmRights {
    hdr: libc::cmsghdr,
    fds: [RawFd; MAX_FDS],
}

/// Receives up to `buf.len()` bytes along with any descriptors attached to
/// them.
fn recv_with_fds(
    socket: &UnixStream,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = IoSliceMut::new(buf);
    // SAFETY: type has no invariants
    let mut cmsg: CmsgScmRights = unsafe { std::mem::zeroed() };
    // SAFETY: type has no invariants
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = std::ptr::from_mut(&mut iov).cast::<libc::iovec>();
    hdr.msg_iovlen = 1;
    hdr.msg_control = std::ptr::from_mut(&mut cmsg).cast::<libc::c_void>();
    hdr.msg_controllen = size_of_val(&cmsg) as _;

    // SAFETY: calling with properly initialized buffers.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut hdr, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let fd_count = if hdr.msg_controllen > 0 {
        if cmsg.hdr.cmsg_level != libc::SOL_SOCKET || cmsg.hdr.cmsg_type != libc::SCM_RIGHTS {
            return Err(io::ErrorKind::InvalidData.into());
        }
        #[allow(clippy::unnecessary_cast)] // cmsg_len is u32 on musl and usize on gnu.
        {
            (cmsg.hdr.cmsg_len as usize - size_of_val(&cmsg.hdr)) / size_of::<RawFd>()
        }
    } else {
        0
    };
    fds.extend(cmsg.fds[..fd_count.min(MAX_FDS)].iter().map(|&fd| {
        // SAFETY: according to the contract with the kernel, this fd is now
        // owned by the process.
        unsafe { OwnedFd::from_raw_fd(fd) }
    }));

    // Check for truncation only after taking ownership of the fds.
    if hdr.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::from_raw_os_error(libc::EMSGSIZE));
    }
    Ok(n as usize)
}
