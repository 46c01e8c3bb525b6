// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::anyhow;
use anyhow::Context as _;
use std::io::IsTerminal;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::fmt::time::uptime;

/// Enables tracing output to stderr, filtered by `VHOST_USER_FS_LOG`.
pub fn enable_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = if let Ok(filter) = std::env::var("VHOST_USER_FS_LOG") {
        tracing_subscriber::EnvFilter::try_new(filter).context("invalid VHOST_USER_FS_LOG")?
    } else {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing::metadata::LevelFilter::INFO.into())
    };

    let is_terminal = std::io::stderr().is_terminal();
    let format = Format::default()
        .with_timer(uptime())
        .with_ansi(is_terminal);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .log_internal_errors(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::Registry::default()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!(e).context("failed to enable tracing"))?;

    Ok(())
}
