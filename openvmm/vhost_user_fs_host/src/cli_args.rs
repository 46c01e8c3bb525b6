// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CLI argument parsing.
//!
//! This module only turns raw CLI strings into typed values. Binding sockets
//! and reserving memory happen later.

#![warn(missing_docs)]

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use vhost_user_fs_resources::VhostUserFsConfig;
use vhost_user_fs_resources::DEFAULT_NUM_REQUEST_QUEUES;
use vhost_user_fs_resources::DEFAULT_QUEUE_SIZE;

/// Host side of a vhost-user-fs device.
///
/// Listens for slave channel connections from a virtio-fs backend and lets it
/// manage the device's DAX cache window.
#[derive(Parser, Debug)]
pub struct Options {
    /// path of the slave channel socket to listen on
    #[clap(short = 's', long, value_name = "PATH")]
    pub socket: PathBuf,

    /// filesystem mount tag
    #[clap(short = 't', long, value_name = "TAG")]
    pub tag: String,

    /// DAX cache window size, 0 to disable
    #[clap(
        short = 'c',
        long,
        value_name = "SIZE",
        default_value = "0",
        value_parser = parse_memory
    )]
    pub cache_size: u64,

    /// number of request queues
    #[clap(long, value_name = "COUNT", default_value_t = DEFAULT_NUM_REQUEST_QUEUES)]
    pub num_request_queues: u16,

    /// size of each virtqueue
    #[clap(long, value_name = "SIZE", default_value_t = DEFAULT_QUEUE_SIZE)]
    pub queue_size: u16,

    /// exit after the first connection closes
    #[clap(long)]
    pub once: bool,
}

impl Options {
    /// The device configuration described by the options.
    pub fn config(&self) -> VhostUserFsConfig {
        VhostUserFsConfig {
            tag: self.tag.clone(),
            num_request_queues: self.num_request_queues,
            queue_size: self.queue_size,
            cache_size: self.cache_size,
        }
    }
}

fn parse_memory(s: &str) -> anyhow::Result<u64> {
    || -> Option<u64> {
        let mut b = s.as_bytes();
        if s.ends_with('B') {
            b = &b[..b.len() - 1]
        }
        if b.is_empty() {
            return None;
        }
        let multi = match b[b.len() - 1] as char {
            'T' => Some(1024 * 1024 * 1024 * 1024),
            'G' => Some(1024 * 1024 * 1024),
            'M' => Some(1024 * 1024),
            'K' => Some(1024),
            _ => None,
        };
        if multi.is_some() {
            b = &b[..b.len() - 1]
        }
        let n: u64 = std::str::from_utf8(b).ok()?.parse().ok()?;
        n.checked_mul(multi.unwrap_or(1))
    }()
    .with_context(|| format!("invalid memory size '{0}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("0").unwrap(), 0);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
        assert_eq!(parse_memory("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_memory("2MB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1 << 30);
        assert_eq!(parse_memory("1T").unwrap(), 1 << 40);
        for bad in ["", "B", "K", "12Q", "-1", "99999999999T"] {
            parse_memory(bad).unwrap_err();
        }
    }

    #[test]
    fn test_options() {
        let opt =
            Options::try_parse_from(["vhost_user_fs_host", "-s", "/tmp/fs.sock", "-t", "myfs"])
                .unwrap();
        let config = opt.config();
        assert_eq!(config, VhostUserFsConfig::new("myfs"));
        assert!(!opt.once);

        let opt = Options::try_parse_from([
            "vhost_user_fs_host",
            "--socket",
            "/tmp/fs.sock",
            "--tag",
            "myfs",
            "--cache-size",
            "8M",
            "--queue-size",
            "256",
            "--once",
        ])
        .unwrap();
        assert_eq!(opt.config().cache_size, 8 << 20);
        assert_eq!(opt.config().queue_size, 256);
        assert!(opt.once);

        Options::try_parse_from(["vhost_user_fs_host", "-t", "myfs"]).unwrap_err();
    }
}
