// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration definitions for the vhost-user-fs device.
//!
//! These are here to avoid needing to pull in the device implementation crate
//! just to construct and validate the device's config.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Size of the tag field in the virtio-fs device configuration space.
pub const MAX_TAG_LEN: usize = 36;

/// Largest virtqueue size supported by the device.
pub const MAX_QUEUE_SIZE: u16 = 1024;

/// Default number of request queues.
pub const DEFAULT_NUM_REQUEST_QUEUES: u16 = 1;

/// Default virtqueue size.
pub const DEFAULT_QUEUE_SIZE: u16 = 128;

/// Configuration for a vhost-user-fs device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostUserFsConfig {
    /// The mount tag the guest uses to find the filesystem.
    pub tag: String,
    /// Number of request virtqueues, not counting the high priority queue.
    pub num_request_queues: u16,
    /// Size of each virtqueue.
    pub queue_size: u16,
    /// Size in bytes of the DAX cache window. Zero disables the window.
    pub cache_size: u64,
}

impl VhostUserFsConfig {
    /// Returns a config with default queue settings and no cache window.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            num_request_queues: DEFAULT_NUM_REQUEST_QUEUES,
            queue_size: DEFAULT_QUEUE_SIZE,
            cache_size: 0,
        }
    }

    /// Sets the cache window size.
    pub fn with_cache_size(mut self, cache_size: u64) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Checks the config against device limits. `page_size` is the host page
    /// size, which the cache window size must be a multiple of.
    pub fn validate(&self, page_size: u64) -> Result<(), ConfigError> {
        if self.tag.is_empty() {
            return Err(ConfigError::EmptyTag);
        }
        if self.tag.len() > MAX_TAG_LEN {
            return Err(ConfigError::TagTooLong(self.tag.len()));
        }
        if self.num_request_queues == 0 {
            return Err(ConfigError::NoRequestQueues);
        }
        if !self.queue_size.is_power_of_two() || self.queue_size > MAX_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize(self.queue_size));
        }
        if self.cache_size % page_size != 0 {
            return Err(ConfigError::UnalignedCacheSize {
                cache_size: self.cache_size,
                page_size,
            });
        }
        Ok(())
    }
}

/// An invalid device configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tag must not be empty")]
    EmptyTag,
    #[error("tag is {0} bytes, maximum is {MAX_TAG_LEN}")]
    TagTooLong(usize),
    #[error("at least one request queue is required")]
    NoRequestQueues,
    #[error("queue size {0} must be a power of 2 no larger than {MAX_QUEUE_SIZE}")]
    InvalidQueueSize(u16),
    #[error("cache size {cache_size:#x} is not a multiple of the page size {page_size:#x}")]
    UnalignedCacheSize { cache_size: u64, page_size: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        VhostUserFsConfig::new("myfs").validate(4096).unwrap();
        VhostUserFsConfig::new("myfs")
            .with_cache_size(0x4000)
            .validate(4096)
            .unwrap();
    }

    #[test]
    fn test_invalid_configs() {
        let base = VhostUserFsConfig::new("myfs");
        assert_eq!(
            VhostUserFsConfig::new("").validate(4096),
            Err(ConfigError::EmptyTag)
        );
        assert_eq!(
            VhostUserFsConfig::new("x".repeat(37)).validate(4096),
            Err(ConfigError::TagTooLong(37))
        );
        assert_eq!(
            VhostUserFsConfig {
                num_request_queues: 0,
                ..base.clone()
            }
            .validate(4096),
            Err(ConfigError::NoRequestQueues)
        );
        for queue_size in [0, 100, 2048] {
            assert_eq!(
                VhostUserFsConfig {
                    queue_size,
                    ..base.clone()
                }
                .validate(4096),
                Err(ConfigError::InvalidQueueSize(queue_size))
            );
        }
        assert!(matches!(
            base.with_cache_size(4097).validate(4096),
            Err(ConfigError::UnalignedCacheSize { .. })
        ));
    }
}
