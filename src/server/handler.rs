// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    iprange,
    proto::http::{self, HttpError, RequestKind},
    queue::AddFlags,
    server::{ServerCtx, proto1, proto2, session::Session},
    tun, util,
};

/// What kind of channel this socket settled into with its first request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChanType {
    Proto1,
    Proto2Send,
    Proto2Recv,
}

/// Per-socket request loop. Exactly one channel type per socket, fixed by
/// the first parsed request; every later request must match it.
pub async fn client_handler(mut stream: TcpStream, ctx: Arc<ServerCtx>) {
    let mut chan: Option<(ChanType, Arc<Session>, CancellationToken)> = None;

    loop {
        let idle = ctx.cfg().idle_disconnect;
        let req = match &chan {
            // A replacement CP cancels this token; the successor owns the
            // channel slot from that point on, so just drop the socket.
            Some((_, _, token)) => tokio::select! {
                _ = token.cancelled() => {
                    info!("channel replaced by a newer connection");
                    return;
                }
                req = http::read_request_line(&mut stream, idle) => req,
            },
            None => http::read_request_line(&mut stream, idle).await,
        };

        let (kind, rawline) = match req {
            Ok(pair) => pair,
            Err(HttpError::IdleTimeout) => {
                info!("idle disconnect");
                break;
            }
            Err(HttpError::BadRequest(line)) => {
                match &chan {
                    None => {
                        // Scanners get forwarded like any other web traffic.
                        redirect(&mut stream, &line, &ctx).await;
                        return;
                    }
                    Some((_, session, _)) => {
                        warn!("bad request on channel: {line}");
                        let session = Arc::clone(session);
                        handle_f(&mut stream, &ctx, &session).await;
                        return;
                    }
                }
            }
            Err(e) => {
                info!("disconnect: {e}");
                break;
            }
        };

        let headers = match http::read_headers(&mut stream).await {
            Ok(h) => h,
            Err(e) => {
                warn!("couldn't receive HTTP headers from client: {e}");
                break;
            }
        };

        // Requests after the first must match the established channel type.
        if let Some((ty, session_ref, _)) = &chan {
            let ty = *ty;
            let session = Arc::clone(session_ref);
            let outcome = match (ty, kind) {
                (ChanType::Proto1, RequestKind::S) => {
                    proto1::handle_s(&mut stream, &headers, &session, &ctx).await
                }
                (ChanType::Proto1, RequestKind::P) => {
                    proto1::handle_p(&mut stream, &headers, &session, &ctx).await
                }
                (ChanType::Proto2Send, RequestKind::S) => {
                    proto2::handle_s(&mut stream, &headers, &session).await
                }
                (ChanType::Proto2Recv, RequestKind::R) => {
                    proto2::handle_r(&mut stream, &headers, &session).await
                }
                (ChanType::Proto1 | ChanType::Proto2Send, RequestKind::F) => {
                    info!("client {} requested a close", session.macaddr());
                    handle_f(&mut stream, &ctx, &session).await;
                    return;
                }
                _ => {
                    warn!("bad request on channel: {rawline}");
                    handle_f(&mut stream, &ctx, &session).await;
                    return;
                }
            };
            if let Err(e) = outcome {
                info!("request handler failed: {e:#}");
                break;
            }
            continue;
        }

        // First request on this socket decides what the channel becomes.
        let opened = match kind {
            RequestKind::Cp1 => {
                info!("configuring protocol 1 channel");
                handle_cp(&mut stream, &headers, 1, &ctx)
                    .await
                    .map(|(s, t)| (ChanType::Proto1, s, t))
            }
            RequestKind::Cp2 => {
                info!("configuring protocol 2 send channel");
                handle_cp(&mut stream, &headers, 2, &ctx)
                    .await
                    .map(|(s, t)| (ChanType::Proto2Send, s, t))
            }
            RequestKind::Cr => {
                info!("configuring protocol 2 receive channel");
                handle_cr(&mut stream, &headers, &ctx)
                    .await
                    .map(|(s, t)| (ChanType::Proto2Recv, s, t))
            }
            _ => {
                warn!("redirecting bad request: {rawline}");
                redirect_with_headers(&mut stream, &rawline, &headers, &ctx).await;
                return;
            }
        };
        match opened {
            Ok(tuple) => chan = Some(tuple),
            Err(e) => {
                info!("channel bring-up failed: {e:#}");
                return;
            }
        }
    }

    // Mark the channel absent so the prune sweep can eventually collect the
    // session, unless a successor already took the slot over.
    if let Some((ty, session, token)) = chan {
        if !token.is_cancelled() {
            match ty {
                ChanType::Proto1 | ChanType::Proto2Send => session.detach_chan1(),
                ChanType::Proto2Recv => session.detach_chan2(),
            }
        }
    }
}

fn valid_mac(mac: &str) -> bool {
    mac.len() == 12 && hex::decode(mac).is_ok()
}

/// Session bring-up for CP1/CP2: body carries the MAC line and the client's
/// acceptable ranges. Replaces the channels of an existing session, or
/// allocates TUN + queues + worker tasks for a new one. Answers 200 with the
/// address pair the client must program.
async fn handle_cp(
    stream: &mut TcpStream,
    headers: &str,
    proto: u8,
    ctx: &Arc<ServerCtx>,
) -> Result<(Arc<Session>, CancellationToken)> {
    let Some(body) = http::read_body(stream, headers).await? else {
        bail!("client did not send the expected amount");
    };
    let text = String::from_utf8_lossy(&body);
    let mut lines = text.lines();

    let mac = lines.next().map(str::trim).unwrap_or("");
    if !valid_mac(mac) {
        warn!("client did not send a usable MAC address line");
        http::respond_400(stream).await?;
        bail!("missing MAC address");
    }
    debug!("got macaddr {mac}");

    let ranges = iprange::parse_advertised(lines);
    if ranges.is_empty() {
        warn!("client sent no ip ranges; dropping");
        http::respond_400(stream).await?;
        bail!("no usable ip ranges");
    }

    let session = match ctx.table.get(mac) {
        Some(session) => {
            info!(
                "client {mac} found. localip={}, peerip={}",
                session.srvaddr, session.cliaddr
            );
            if session.chan1_connected() {
                warn!("client chan1 appears to be connected already; dropping old");
            }
            if session.chan2_connected() {
                warn!("client chan2 appears to be connected already; dropping old");
                session.evict_chan2();
            }
            session.swap_ranges(ranges);
            session
        }
        None => {
            debug!("creating session for {mac}");
            util::getprivs("bringing up tun interface");
            let tun = tun::srv_tun_alloc(
                ctx.tun_name.as_deref(),
                &ranges,
                &ctx.cfg().iprange,
                &ctx.table,
            );
            util::dropprivs("tun interface configured");
            let tun = match tun {
                Ok(tun) => tun,
                Err(e) => {
                    warn!("tun allocation failed: {e:#}");
                    http::respond_503(stream).await?;
                    bail!("no address pair available");
                }
            };
            let session = Arc::new(Session::new(
                mac.to_ascii_uppercase(),
                tun.local,
                tun.peer,
                tun,
                ranges,
            ));
            ctx.table.insert(Arc::clone(&session));
            start_tun_writer(&session);
            if proto == 1 {
                // Protocol 2 defers the device-to-wire side until CR shows up.
                start_tun_reader(&session);
            }
            session
        }
    };

    let token = session.attach_chan1();
    session.touch();

    let reply = format!("{}\n{}\n", session.cliaddr, session.srvaddr);
    http::respond_200(stream, reply.as_bytes()).await?;
    Ok((session, token))
}

/// CR attaches the second channel of a protocol 2 session. The send channel
/// must already be up (412 otherwise).
async fn handle_cr(
    stream: &mut TcpStream,
    headers: &str,
    ctx: &Arc<ServerCtx>,
) -> Result<(Arc<Session>, CancellationToken)> {
    let Some(body) = http::read_body(stream, headers).await? else {
        bail!("client did not send the expected amount");
    };
    let text = String::from_utf8_lossy(&body);
    let mac = text.lines().next().map(str::trim).unwrap_or("");
    if mac.is_empty() {
        warn!("client did not send a MAC address line");
        http::respond_400(stream).await?;
        bail!("missing MAC address");
    }

    let session = match ctx.table.get(mac) {
        Some(s) if s.chan1_connected() => s,
        _ => {
            info!("client tried to connect chan2 before chan1");
            http::respond_412(stream).await?;
            bail!("no send channel for {mac}");
        }
    };

    let token = session.attach_chan2();
    start_tun_reader(&session);
    session.touch();

    http::respond_204(stream).await?;
    Ok((session, token))
}

/// F: acknowledge, then destroy the whole session. The teardown shuts both
/// queues down, which is what wakes the TUN reader and writer.
async fn handle_f(stream: &mut TcpStream, ctx: &Arc<ServerCtx>, session: &Session) {
    let _ = http::respond_204(stream).await;
    ctx.table.remove(session.macaddr()).await;
}

/// Device-to-wire worker: drains the TUN into the send queue until the
/// session goes away. Idempotent per session; a reconnecting CR reuses the
/// one started earlier.
fn start_tun_reader(session: &Arc<Session>) {
    let (sendq, created) = session.sendq_init();
    if !created {
        return;
    }
    let s = Arc::clone(session);
    let handle = tokio::spawn(async move {
        debug!("tun reader starting on {}", s.tun.name());
        loop {
            let frame = tokio::select! {
                _ = s.tun_cancel.cancelled() => break,
                frame = s.tun.read_frame() => frame,
            };
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    info!("tun read: {e}");
                    break;
                }
            };
            if sendq.add(frame, AddFlags::WAIT).await.is_err() {
                break;
            }
        }
        info!("tun reader exiting");
    });
    session.register_task(handle);
}

/// Wire-to-device worker: drains the receive queue onto the TUN until the
/// queue shuts down.
fn start_tun_writer(session: &Arc<Session>) {
    let s = Arc::clone(session);
    let handle = tokio::spawn(async move {
        debug!("tun writer starting on {}", s.tun.name());
        while let Some(frame) = s.recvq.remove(true, None).await {
            if let Err(e) = s.tun.write_frame(&frame).await {
                warn!("writing {} byte pkt to tun: {e}", frame.len());
                break;
            }
        }
        info!("tun writer exiting");
    });
    session.register_task(handle);
}

async fn redirect(stream: &mut TcpStream, rawline: &str, ctx: &Arc<ServerCtx>) {
    let headers = match http::read_headers(stream).await {
        Ok(h) => h,
        Err(e) => {
            warn!("couldn't receive HTTP headers from client: {e}");
            return;
        }
    };
    redirect_with_headers(stream, rawline, &headers, ctx).await;
}

async fn redirect_with_headers(
    stream: &mut TcpStream,
    rawline: &str,
    headers: &str,
    ctx: &Arc<ServerCtx>,
) {
    if let Err(e) = proxy_request(stream, rawline, headers, ctx).await {
        warn!("proxy redirect failed: {e:#}");
        let _ = http::respond_503(stream).await;
    }
}

/// Replays a non-tunnel request to the configured redirect host and streams
/// the answer back, which makes this daemon look like an ordinary web relay
/// to anything that is not a tunnel client.
async fn proxy_request(
    stream: &mut TcpStream,
    rawline: &str,
    headers: &str,
    ctx: &Arc<ServerCtx>,
) -> Result<()> {
    let cfg = ctx.cfg();
    let mut upstream =
        TcpStream::connect((cfg.redir_host.as_str(), cfg.redir_port)).await?;

    let mut msg = format!("{}\r\n", rawline.trim_end());
    for line in headers.split("\r\n") {
        if line.is_empty()
            || line.starts_with("Connection:")
            || line.starts_with("Host:")
        {
            continue;
        }
        msg.push_str(line);
        msg.push_str("\r\n");
    }
    msg.push_str(&format!("Host: {}:{}\r\n", cfg.redir_host, cfg.redir_port));
    msg.push_str("Connection: Close\r\n\r\n");
    upstream.write_all(msg.as_bytes()).await?;

    if let Some(body) = http::read_body(stream, headers).await? {
        upstream.write_all(&body).await?;
    }

    let resp_headers = http::read_headers(&mut upstream).await?;
    stream.write_all(resp_headers.as_bytes()).await?;
    if let Some(body) = http::read_body(&mut upstream, &resp_headers).await? {
        stream.write_all(&body).await?;
    }
    Ok(())
}
