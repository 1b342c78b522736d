// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::resolver::{Target, resolve_targets};

pub(super) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = tokio::time::timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow!("{label} timeout")),
            }
        }
    }
}

/// Connects to `host:port`, trying SRV-discovered targets in order before
/// the direct address.
pub async fn connect(
    host: &str,
    port: u16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream> {
    let targets = resolve_targets(host, port).await?;
    connect_targets(&targets, timeout, cancel).await
}

pub async fn connect_targets(
    targets: &[Target],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream> {
    for target in targets {
        debug!(host = %target.host, port = target.port, "connecting");
        let attempt = io_with_timeout(
            "tcp connect",
            TcpStream::connect((target.host.as_str(), target.port)),
            timeout,
            cancel,
        )
        .await;

        match attempt {
            Ok(stream) => {
                stream.set_linger(None)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            },
            Err(e) => {
                warn!(host = %target.host, port = target.port, "connect failed: {e}");
            },
        }
    }
    bail!("no target of {} candidates accepted the connection", targets.len());
}
