// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt::Write as _, net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cfg::config::ClientConfig,
    client::ControlMsg,
    proto::{frame, http, http::RequestKind},
    queue::{AddFlags, PacketQueue},
    tun,
};

/// How long the protocol 2 sender dozes between looks at the send queue.
const SENDER_IDLE: Duration = Duration::from_secs(10);

/// Outcome of a renegotiation after a channel died.
pub enum Reconnect {
    /// Same address pair; carry on over the fresh socket.
    Same(TcpStream),
    /// The server handed out different addresses; the topology must be
    /// rebuilt from scratch.
    Changed,
}

/// Opens a connection through the proxy and negotiates a session: POST
/// CP1/CP2 with our MAC and acceptable ranges, expect 200 with the
/// `local\npeer\n` pair to program into the TUN device.
pub async fn negotiate(cfg: &ClientConfig) -> Result<(TcpStream, Ipv4Addr, Ipv4Addr)> {
    let mut stream = TcpStream::connect((cfg.proxy_ip, cfg.proxy_port))
        .await
        .context("connect() to proxy failed")?;
    stream.set_nodelay(true)?;

    let mac = tun::get_mac(&cfg.if_name)?;
    let mut body = format!("{mac}\n");
    for range in &cfg.iprange {
        let _ = writeln!(body, "{range}");
    }

    let kind = if cfg.protocol == 1 { RequestKind::Cp1 } else { RequestKind::Cp2 };
    http::write_request(
        &mut stream,
        cfg.server_ip,
        cfg.server_ports[0],
        kind,
        body.len(),
        cfg.proxy_auth().as_deref(),
    )
    .await?;
    stream.write_all(body.as_bytes()).await?;

    let headers = http::read_headers(&mut stream).await?;
    if http::is_status(&headers, 204) {
        bail!("server nacked the negotiation");
    }
    if !http::is_status(&headers, 200) {
        let line = headers.split("\r\n").next().unwrap_or("");
        bail!("unknown response from proxy or server: {line}");
    }

    let body = http::read_body(&mut stream, &headers)
        .await?
        .context("negotiation response carried no body")?;
    let text = String::from_utf8_lossy(&body);
    let mut lines = text.lines();
    let local: Ipv4Addr = lines
        .next()
        .context("missing local address line")?
        .trim()
        .parse()
        .context("bad local address")?;
    let peer: Ipv4Addr = lines
        .next()
        .context("missing peer address line")?
        .trim()
        .parse()
        .context("bad peer address")?;

    debug!("got ips, local: {local}, peer: {peer}");
    Ok((stream, local, peer))
}

/// Renegotiates after a dead channel and compares the assigned pair with
/// what the TUN device currently carries.
pub async fn restablish(
    cfg: &ClientConfig,
    old_local: Ipv4Addr,
    old_peer: Ipv4Addr,
) -> Result<Reconnect> {
    let (stream, local, peer) = negotiate(cfg)
        .await
        .with_context(|| format!("unable to reopen channel with server {}", cfg.server_ip))?;
    if local != old_local || peer != old_peer {
        info!(
            "server assigned new ips on reconnect (old {old_local}/{old_peer}, \
             new {local}/{peer}); reconfiguring"
        );
        return Ok(Reconnect::Changed);
    }
    Ok(Reconnect::Same(stream))
}

/// Drains the send queue into one S request. A frame that could not be
/// written goes back onto the head of the queue for the next channel.
pub async fn send_data<S>(
    stream: &mut S,
    sendq: &PacketQueue,
    cfg: &ClientConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let total = sendq.total_size();
    http::write_request(
        stream,
        cfg.server_ip,
        cfg.server_ports[0],
        RequestKind::S,
        total,
        cfg.proxy_auth().as_deref(),
    )
    .await?;

    let mut sent = 0usize;
    let mut cnt = 0usize;
    while sent < total {
        let Some(pkt) = sendq.remove(false, None).await else {
            bail!("premature end of sendq ({sent} of {total} bytes)");
        };
        if let Err(e) = stream.write_all(&pkt).await {
            warn!("client disconnected prematurely");
            let _ = sendq.add(pkt, AddFlags::PUSH).await;
            return Err(e.into());
        }
        sent += pkt.len();
        cnt += 1;
    }
    info!("sent {cnt} packets, {sent} bytes");
    Ok(())
}

/// Reads one response. A 204 nack yields `false`; a 200 decodes the body as
/// concatenated frames into the receive queue and yields `true`.
pub async fn recv_data<S>(stream: &mut S, recvq: &PacketQueue) -> Result<bool>
where S: AsyncRead + Unpin {
    let headers = http::read_headers(stream).await?;
    if http::is_status(&headers, 204) {
        debug!("nack returned");
        return Ok(false);
    }
    if !http::is_status(&headers, 200) {
        let line = headers.split("\r\n").next().unwrap_or("");
        warn!("bad or error HTTP response received from server: {line}");
        bail!("unexpected response");
    }

    let data_len = http::content_length(&headers);
    if data_len < 1 {
        bail!("unable to get Content-Length header value");
    }
    let data_len = data_len as usize;

    let mut got = 0usize;
    let mut num = 0usize;
    while got < data_len {
        let pkt = frame::read_frame(stream)
            .await
            .context("premature end of data stream")?;
        got += pkt.len();
        if recvq.add(pkt, AddFlags::WAIT).await.is_err() {
            warn!("insert packet, discarding");
        } else {
            num += 1;
        }
    }
    info!("rcvd {num} packets, {got} bytes");
    Ok(true)
}

async fn send_poll<S>(stream: &mut S, cfg: &ClientConfig) -> Result<()>
where S: AsyncRead + AsyncWrite + Unpin {
    debug!("polling server");
    http::write_request(
        stream,
        cfg.server_ip,
        cfg.server_ports[0],
        RequestKind::P,
        0,
        cfg.proxy_auth().as_deref(),
    )
    .await?;
    Ok(())
}

/// Tells the server it may hold the receive poll open for `wait`.
async fn send_long_poll<S>(stream: &mut S, cfg: &ClientConfig, wait: Duration) -> Result<()>
where S: AsyncRead + AsyncWrite + Unpin {
    let secs = wait.as_secs().to_string();
    http::write_request(
        stream,
        cfg.server_ip,
        cfg.server_ports[1],
        RequestKind::R,
        secs.len(),
        cfg.proxy_auth().as_deref(),
    )
    .await?;
    stream.write_all(secs.as_bytes()).await?;
    Ok(())
}

/// Waves goodbye; the server will tear the session down.
pub async fn send_finish<S>(stream: &mut S, cfg: &ClientConfig)
where S: AsyncRead + AsyncWrite + Unpin {
    let _ = http::write_request(
        stream,
        cfg.server_ip,
        cfg.server_ports[0],
        RequestKind::F,
        0,
        cfg.proxy_auth().as_deref(),
    )
    .await;
}

/// Protocol 1: the one task that owns the channel. Sends when the queue has
/// data, polls with exponential backoff when idle, renegotiates on failure,
/// and signs off with F once the queues shut down.
pub async fn proxy_channel(
    mut stream: TcpStream,
    cfg: Arc<ClientConfig>,
    local: Ipv4Addr,
    peer: Ipv4Addr,
    sendq: Arc<PacketQueue>,
    recvq: Arc<PacketQueue>,
    ctrl: mpsc::Sender<ControlMsg>,
) {
    let mut wait = cfg.min_poll_interval_msec;
    let mut idle_polls = 0u32;
    let mut need_reestablish = false;

    loop {
        if sendq.is_shutdown() || recvq.is_shutdown() {
            send_finish(&mut stream, &cfg).await;
            return;
        }

        if need_reestablish {
            info!("connection closed, attempting reopen");
            match restablish(&cfg, local, peer).await {
                Ok(Reconnect::Same(s)) => stream = s,
                Ok(Reconnect::Changed) => {
                    let _ = ctrl.send(ControlMsg::Restart).await;
                    return;
                }
                Err(e) => {
                    error!("{e:#}");
                    let _ = ctrl.send(ControlMsg::Quit).await;
                    return;
                }
            }
            need_reestablish = false;
        }

        if !sendq.is_empty() {
            if send_data(&mut stream, &sendq, &cfg).await.is_err() {
                warn!("client send failed");
                need_reestablish = true;
                continue;
            }
            match timeout(cfg.ack_wait, recv_data(&mut stream, &recvq)).await {
                Ok(Ok(_)) => {}
                _ => {
                    need_reestablish = true;
                    continue;
                }
            }
            // Outbound traffic puts the poll interval back on the floor.
            wait = cfg.min_poll_interval_msec;
            idle_polls = 0;
        } else if sendq.timed_wait(wait).await {
            wait = cfg.min_poll_interval_msec;
            idle_polls = 0;
        } else {
            if sendq.is_shutdown() {
                continue;
            }
            if send_poll(&mut stream, &cfg).await.is_err() {
                need_reestablish = true;
                continue;
            }
            match timeout(cfg.ack_wait, recv_data(&mut stream, &recvq)).await {
                Ok(Ok(true)) => {
                    wait = cfg.min_poll_interval_msec;
                    idle_polls = 0;
                }
                Ok(Ok(false)) => {
                    idle_polls += 1;
                    if idle_polls >= cfg.poll_backoff_rate {
                        wait = (wait * 2).min(cfg.max_poll_interval);
                        idle_polls = 0;
                    }
                }
                _ => {
                    need_reestablish = true;
                    continue;
                }
            }
        }
    }
}

/// Protocol 2 send-channel task: ship bursts as they appear, read the 204
/// ack, renegotiate on failure.
pub async fn sender(
    mut stream: TcpStream,
    cfg: Arc<ClientConfig>,
    local: Ipv4Addr,
    peer: Ipv4Addr,
    sendq: Arc<PacketQueue>,
    ctrl: mpsc::Sender<ControlMsg>,
) {
    let mut need_reestablish = false;

    loop {
        if need_reestablish {
            match restablish(&cfg, local, peer).await {
                Ok(Reconnect::Same(s)) => stream = s,
                Ok(Reconnect::Changed) => {
                    let _ = ctrl.send(ControlMsg::Restart).await;
                    return;
                }
                Err(e) => {
                    error!("{e:#}");
                    let _ = ctrl.send(ControlMsg::Quit).await;
                    return;
                }
            }
            need_reestablish = false;
        }

        if sendq.timed_wait(SENDER_IDLE).await {
            if send_data(&mut stream, &sendq, &cfg).await.is_err() {
                need_reestablish = true;
                continue;
            }
            match timeout(cfg.ack_wait, recv_ack(&mut stream)).await {
                Ok(Ok(())) => {}
                _ => need_reestablish = true,
            }
        } else if sendq.is_shutdown() {
            info!("send queue has shut down, exiting");
            send_finish(&mut stream, &cfg).await;
            return;
        }
        // Plain timeout: nothing to send, nothing to do.
    }
}

/// The protocol 2 ack is a bare 204; there is no body to route anywhere.
async fn recv_ack<S>(stream: &mut S) -> Result<()>
where S: AsyncRead + Unpin {
    let headers = http::read_headers(stream).await?;
    if !http::is_status(&headers, 204) {
        let line = headers.split("\r\n").next().unwrap_or("");
        bail!("expected 204 ack, got: {line}");
    }
    Ok(())
}

/// Opens the protocol 2 receive channel with a CR request carrying our MAC.
pub async fn open_receive_channel(cfg: &ClientConfig) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((cfg.proxy_ip, cfg.proxy_port))
        .await
        .context("connect() to proxy failed")?;
    stream.set_nodelay(true)?;

    let mac = tun::get_mac(&cfg.if_name)?;
    http::write_request(
        &mut stream,
        cfg.server_ip,
        cfg.server_ports[1],
        RequestKind::Cr,
        mac.len(),
        cfg.proxy_auth().as_deref(),
    )
    .await?;
    stream.write_all(mac.as_bytes()).await?;

    let headers = http::read_headers(&mut stream).await?;
    if http::is_status(&headers, 204) {
        info!("receive channel opened");
        return Ok(stream);
    }
    let reason = http::read_body(&mut stream, &headers)
        .await?
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    warn!("failed to open receive channel: {}", reason.trim());
    bail!("receive channel refused");
}

/// Protocol 2 receive-channel task: long-poll R requests in a loop, with its
/// own reconnect budget. Exhausting the budget takes the whole client down.
pub async fn receiver(
    cfg: Arc<ClientConfig>,
    recvq: Arc<PacketQueue>,
    ctrl: mpsc::Sender<ControlMsg>,
    cancel: CancellationToken,
) {
    let wait = cfg.channel_2_idle_allow;
    let mut retry = cfg.reconnect_tries;
    let mut stream: Option<TcpStream> = None;

    loop {
        if recvq.is_shutdown() || cancel.is_cancelled() {
            return;
        }

        if stream.is_none() {
            while retry != 0 || cfg.reconnect_tries == -1 {
                if recvq.is_shutdown() || cancel.is_cancelled() {
                    return;
                }
                match open_receive_channel(&cfg).await {
                    Ok(s) => {
                        retry = cfg.reconnect_tries;
                        stream = Some(s);
                        break;
                    }
                    Err(e) => {
                        warn!("receive channel connect failed, sleeping before retry: {e:#}");
                        retry -= 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = sleep(cfg.reconnect_sleep_sec) => {}
                        }
                    }
                }
            }
            if stream.is_none() {
                error!("receive channel connect failed, quitting");
                let _ = ctrl.send(ControlMsg::Quit).await;
                return;
            }
        }

        let Some(s) = stream.as_mut() else { continue };
        let round = tokio::select! {
            _ = cancel.cancelled() => return,
            round = poll_round(s, &cfg, &recvq, wait) => round,
        };
        if let Err(e) = round {
            debug!("receive poll failed: {e:#}");
            stream = None;
        }
    }
}

async fn poll_round(
    stream: &mut TcpStream,
    cfg: &ClientConfig,
    recvq: &PacketQueue,
    wait: Duration,
) -> Result<()> {
    send_long_poll(stream, cfg, wait).await?;
    // The server holds the poll for up to `wait`; pad with the ack window.
    timeout(wait + cfg.ack_wait, recv_data(stream, recvq))
        .await
        .context("poll response timed out")??;
    Ok(())
}
