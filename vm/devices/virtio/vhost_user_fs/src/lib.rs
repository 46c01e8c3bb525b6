// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host side of the vhost-user-fs slave channel.
//!
//! An out-of-process virtio-fs backend uses the slave channel to map ranges
//! of its files into the device's DAX cache window, unmap them again, or
//! copy data between a file and the window directly. This crate decodes
//! those requests, validates them against the window, applies them, and
//! reports a status back to the backend.
//!
//! The pieces, from the bottom up:
//!
//! * [`protocol`]: the wire format of a slave message.
//! * [`range_tracker`]: which parts of the window are mapped, and to what.
//! * [`CacheWindow`]: the reserved address range itself.
//! * [`SlaveDispatcher`]: applies decoded commands to a window.
//! * [`SlaveWorker`]: serializes commands from any number of clients onto a
//!   dispatcher and tears everything down when the clients go away.
//! * [`SlaveChannel`]: the vhost-user socket transport feeding a worker.
//! * [`VhostUserFsDevice`]: ties a configured window to slave connections.

#![cfg(target_os = "linux")]

mod channel;
mod device;
mod dispatcher;
pub mod protocol;
pub mod range_tracker;
mod window;
mod worker;

pub use channel::request;
pub use channel::ChannelError;
pub use channel::SlaveChannel;
pub use device::AttachError;
pub use device::DeviceError;
pub use device::SlaveChannelHandle;
pub use device::VhostUserFsDevice;
pub use dispatcher::SlaveDispatcher;
pub use window::CacheWindow;
pub use window::Mappable;
pub use worker::SlaveClient;
pub use worker::SlaveRequest;
pub use worker::SlaveWorker;

use protocol::DecodeError;
use range_tracker::CacheRange;
use std::io;
use std::os::fd::OwnedFd;
use thiserror::Error;

/// A slave channel command, along with the file descriptor it carries.
#[derive(Debug)]
pub enum SlaveCommand {
    /// Map file ranges into the window.
    Map(OwnedFd),
    /// Unmap window ranges.
    Unmap,
    /// Copy data between a file and the window.
    Io(OwnedFd),
}

impl SlaveCommand {
    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SlaveCommand::Map(_) => "map",
            SlaveCommand::Unmap => "unmap",
            SlaveCommand::Io(_) => "io",
        }
    }
}

/// The failure of a slave command, as reported to the backend.
#[derive(Debug, Error)]
pub enum SlaveError {
    #[error("malformed slave message")]
    MalformedMessage(#[from] DecodeError),
    #[error("range {offset:#x}+{len:#x} is outside the {capacity:#x} byte cache window")]
    OutOfBounds { offset: u64, len: u64, capacity: u64 },
    #[error("range {range} overlaps existing mapping {existing}")]
    Overlap {
        range: CacheRange,
        existing: CacheRange,
    },
    #[error("invalid mapping flags {0:#x}")]
    InvalidFlags(u64),
    #[error("backing file operation failed")]
    BackingIo(#[source] io::Error),
    #[error("the device has no cache window")]
    NoCacheWindow,
    #[error("the slave worker is not running")]
    Disconnected,
}

impl SlaveError {
    /// The errno reported to the backend for this error.
    pub fn errno(&self) -> i32 {
        match self {
            SlaveError::MalformedMessage(_) => libc::EBADMSG,
            SlaveError::OutOfBounds { .. } => libc::ERANGE,
            SlaveError::Overlap { .. } => libc::EEXIST,
            SlaveError::InvalidFlags(_) => libc::EINVAL,
            SlaveError::BackingIo(err) => err.raw_os_error().unwrap_or(libc::EIO),
            SlaveError::NoCacheWindow => libc::ENODEV,
            SlaveError::Disconnected => libc::ENOTCONN,
        }
    }

    /// The status value sent on the wire: the negated errno, as a `u64`.
    pub fn status_code(&self) -> u64 {
        errno_status(self.errno())
    }
}

pub(crate) fn errno_status(errno: i32) -> u64 {
    (-i64::from(errno)) as u64
}

/// Converts a command result to its wire status. Success is zero.
pub fn status_code(result: &Result<(), SlaveError>) -> u64 {
    match result {
        Ok(()) => 0,
        Err(err) => err.status_code(),
    }
}
