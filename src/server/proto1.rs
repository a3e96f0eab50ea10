// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    cfg::config::ServerConfig,
    proto::{frame, http},
    queue::{AddFlags, PacketQueue},
    server::{ServerCtx, session::Session},
};

/// S on the half-duplex channel: ingest the client's frames, then batch
/// whatever is waiting for it into the response.
pub async fn handle_s<S>(
    stream: &mut S,
    headers: &str,
    session: &Arc<Session>,
    ctx: &Arc<ServerCtx>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ingest_frames(stream, headers, &session.recvq).await?;
    session.touch();

    let sendq = session.sendq().context("send queue not up yet")?;
    let cfg = ctx.cfg();
    let amount = sendq_wait(&sendq, &cfg).await;
    send_queue(stream, &sendq, amount).await
}

/// P: nothing inbound; run the same send-side drain as S.
pub async fn handle_p<S>(
    stream: &mut S,
    headers: &str,
    session: &Arc<Session>,
    ctx: &Arc<ServerCtx>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = http::read_body(stream, headers).await?;
    session.touch();

    let sendq = session.sendq().context("send queue not up yet")?;
    let cfg = ctx.cfg();
    let amount = sendq_wait(&sendq, &cfg).await;
    send_queue(stream, &sendq, amount).await
}

/// Reads exactly `Content-Length` bytes as self-delimiting frames into the
/// receive queue. An absent or empty body is a protocol violation.
pub(crate) async fn ingest_frames<S>(
    stream: &mut S,
    headers: &str,
    recvq: &PacketQueue,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let expected = http::content_length(headers);
    if expected < 1 {
        warn!("client sent no Content-Length; dropping");
        bail!("missing Content-Length");
    }
    let expected = expected as usize;

    let mut gotten = 0usize;
    let mut cnt = 0usize;
    while gotten < expected {
        let pkt = match frame::read_frame(stream).await {
            Ok(p) => p,
            Err(e) => {
                warn!("reading frame failed; dropping client: {e}");
                let _ = http::respond_500_err(stream).await;
                bail!("short frame body");
            }
        };
        gotten += pkt.len();
        cnt += 1;
        debug!("got {gotten} of {expected} bytes from client");
        if recvq.add(pkt, AddFlags::WAIT).await.is_err() {
            warn!("queueing inbound frame failed; dropping client");
            let _ = http::respond_500_err(stream).await;
            bail!("receive queue is gone");
        }
    }
    info!("got {gotten} bytes in {cnt} pkts");
    Ok(())
}

/// The batching policy. Returns the number of bytes the response should
/// carry, in order of precedence:
/// 1. nothing shows up within `min_nack_delay` -> 0 (caller nacks);
/// 2. the queue holds `packet_count_threshold` packets -> its total size;
/// 3. the queue went quiet for `packet_max_interval` after the last add;
/// 4. `max_response_delay` elapsed overall.
pub async fn sendq_wait(q: &PacketQueue, cfg: &ServerConfig) -> usize {
    let start = Instant::now();

    if !q.timed_wait(cfg.min_nack_delay).await {
        debug!(
            "no data in queue after min nack delay ({:?})",
            cfg.min_nack_delay
        );
        return 0;
    }

    loop {
        let nr_pkts = q.len();
        if nr_pkts >= cfg.packet_count_threshold {
            debug!(
                "pkt count threshold of {} reached w/{nr_pkts} pkts",
                cfg.packet_count_threshold
            );
            return q.total_size();
        }

        let quiet_deadline = q.last_add() + cfg.packet_max_interval;
        if quiet_deadline > Instant::now() {
            sleep_until(quiet_deadline).await;
        }
        if q.len() == nr_pkts {
            debug!("no new packets since last check");
            return q.total_size();
        }

        if start.elapsed() > cfg.max_response_delay {
            debug!("max response delay reached");
            return q.total_size();
        }
    }
}

/// Drains exactly `amount` bytes of frames into a 200, or answers 204 when
/// there is nothing to send.
pub(crate) async fn send_queue<S>(
    stream: &mut S,
    q: &PacketQueue,
    amount: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if amount == 0 {
        debug!("no data to send to client");
        http::respond_204(stream).await?;
        return Ok(());
    }

    http::respond_200_head(stream, amount).await?;
    let mut sent = 0usize;
    let mut cnt = 0usize;
    while sent < amount {
        let Some(pkt) = q.remove(false, None).await else {
            bail!("send queue drained early ({sent} of {amount} bytes)");
        };
        stream.write_all(&pkt).await?;
        sent += pkt.len();
        cnt += 1;
    }
    info!("sent {sent} bytes in {cnt} pkts");
    Ok(())
}
