// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Serves the slave channel of a vhost-user-fs device, letting a virtio-fs
//! backend map files into the device's DAX cache window.

mod cli_args;
mod tracing_init;

use anyhow::Context;
use clap::Parser;
use cli_args::Options;
use std::os::unix::net::UnixListener;
use vhost_user_fs::VhostUserFsDevice;

fn main() -> anyhow::Result<()> {
    let opt = Options::parse();
    tracing_init::enable_tracing()?;

    let device = VhostUserFsDevice::new(opt.config()).context("failed to create device")?;
    let listener = UnixListener::bind(&opt.socket)
        .with_context(|| format!("failed to bind {}", opt.socket.display()))?;
    tracing::info!(socket = %opt.socket.display(), "listening for slave channel connections");

    for stream in listener.incoming() {
        let stream = stream.context("failed to accept connection")?;
        let handle = device
            .attach_slave_channel(stream)
            .context("failed to start slave channel")?;
        if let Err(err) = handle.join() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "slave channel failed"
            );
        }
        if opt.once {
            break;
        }
    }
    Ok(())
}
