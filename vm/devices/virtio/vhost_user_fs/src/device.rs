// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::channel::ChannelError;
use crate::channel::SlaveChannel;
use crate::dispatcher::SlaveDispatcher;
use crate::window::CacheWindow;
use crate::worker::SlaveWorker;
use futures::executor::block_on;
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use vhost_user_fs_resources::ConfigError;
use vhost_user_fs_resources::VhostUserFsConfig;

/// An error creating a [`VhostUserFsDevice`].
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid device configuration")]
    Config(#[from] ConfigError),
    #[error("failed to reserve the cache window")]
    Window(#[source] io::Error),
}

/// An error attaching a slave channel connection.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("a slave channel is already attached")]
    AlreadyAttached,
    #[error("failed to spawn slave channel thread")]
    Spawn(#[source] io::Error),
}

/// The host half of a vhost-user-fs device: the configured cache window and
/// the connection from the backend that manages it.
#[derive(Debug)]
pub struct VhostUserFsDevice {
    config: VhostUserFsConfig,
    dispatcher: Option<Arc<SlaveDispatcher>>,
    attached: Arc<AtomicBool>,
}

/// Marks the device as attached until dropped.
struct Attachment(Arc<AtomicBool>);

impl Drop for Attachment {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl VhostUserFsDevice {
    /// Validates `config` and reserves the cache window, if it has one.
    pub fn new(config: VhostUserFsConfig) -> Result<Self, DeviceError> {
        config.validate(sparse_mmap::page_size() as u64)?;
        let dispatcher = if config.cache_size != 0 {
            let window = CacheWindow::new(config.cache_size).map_err(DeviceError::Window)?;
            Some(Arc::new(SlaveDispatcher::new(Arc::new(window))))
        } else {
            None
        };
        tracing::info!(
            tag = config.tag.as_str(),
            cache_size = config.cache_size,
            "created vhost-user-fs device"
        );
        Ok(Self {
            config,
            dispatcher,
            attached: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The device configuration.
    pub fn config(&self) -> &VhostUserFsConfig {
        &self.config
    }

    /// The cache window, for mapping into the guest.
    pub fn window(&self) -> Option<&Arc<CacheWindow>> {
        self.dispatcher.as_ref().map(|d| d.window())
    }

    /// The dispatcher managing the cache window.
    pub fn dispatcher(&self) -> Option<&Arc<SlaveDispatcher>> {
        self.dispatcher.as_ref()
    }

    /// Starts serving a slave channel connection on `stream`.
    ///
    /// Only one connection is served at a time; the device stays attached
    /// until the connection's mappings have been released. Anything left
    /// mapped outside a connection is released first.
    pub fn attach_slave_channel(
        &self,
        stream: UnixStream,
    ) -> Result<SlaveChannelHandle, AttachError> {
        if self
            .attached
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(AttachError::AlreadyAttached);
        }
        let attachment = Attachment(self.attached.clone());
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.reset();
        }
        let (worker, client) = SlaveWorker::new(self.dispatcher.clone());
        let worker = std::thread::Builder::new()
            .name("vhost-user-fs-slave".into())
            .spawn(move || {
                let _attachment = attachment;
                block_on(worker.run())
            })
            .map_err(AttachError::Spawn)?;
        let channel = std::thread::Builder::new()
            .name("vhost-user-fs-channel".into())
            .spawn(move || SlaveChannel::new(stream, client).run())
            .map_err(AttachError::Spawn)?;
        tracing::info!("attached slave channel");
        Ok(SlaveChannelHandle { worker, channel })
    }

    /// Returns true while a slave channel connection is being served.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

/// The threads serving one slave channel connection.
#[derive(Debug)]
#[must_use]
pub struct SlaveChannelHandle {
    worker: JoinHandle<()>,
    channel: JoinHandle<Result<(), ChannelError>>,
}

impl SlaveChannelHandle {
    /// Waits for the connection to end and its mappings to be released.
    pub fn join(self) -> Result<(), ChannelError> {
        let result = self
            .channel
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        if let Err(panic) = self.worker.join() {
            std::panic::resume_unwind(panic);
        }
        result
    }
}
