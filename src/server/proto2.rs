// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{
    proto::http,
    server::{proto1, session::Session},
};

/// S on the full-duplex send channel: ingest and acknowledge; the response
/// never carries data on this protocol.
pub async fn handle_s<S>(
    stream: &mut S,
    headers: &str,
    session: &Arc<Session>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    proto1::ingest_frames(stream, headers, &session.recvq).await?;
    session.touch();
    http::respond_204(stream).await?;
    Ok(())
}

/// R on the receive channel: the body names how many seconds the server may
/// hold the poll open. Data within that window goes out as one 200 sized to
/// the queue's total; otherwise the poll nacks.
pub async fn handle_r<S>(
    stream: &mut S,
    headers: &str,
    session: &Arc<Session>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(body) = http::read_body(stream, headers).await? else {
        warn!("client sent no Content-Length; dropping");
        bail!("missing R body");
    };

    let secs = String::from_utf8_lossy(&body)
        .trim()
        .parse::<u64>()
        .unwrap_or(0);
    if secs == 0 {
        warn!("client sent invalid seconds spec");
        http::respond_400(stream).await?;
        bail!("invalid poll duration");
    }

    session.touch();
    let sendq = session.sendq().context("send queue not up yet")?;

    debug!("waiting up to {secs} seconds");
    if sendq.timed_wait(Duration::from_secs(secs)).await {
        let total = sendq.total_size();
        proto1::send_queue(stream, &sendq, total).await
    } else {
        debug!("returned from wait with no data");
        http::respond_204(stream).await?;
        Ok(())
    }
}
