// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use httptun::{
    cfg::config::ServerConfig,
    proto::{frame::split_frames, http},
    queue::AddFlags,
    server::{ServerCtx, proto1, proto2, session::Session},
    tun::TunDevice,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

fn server_cfg() -> ServerConfig {
    ServerConfig {
        max_clients: 10,
        max_pending: 5,
        idle_disconnect: Duration::from_secs(300),
        server_ports: [8888, 8889],
        min_nack_delay: Duration::from_millis(10),
        packet_count_threshold: 3,
        packet_max_interval: Duration::from_millis(50),
        max_response_delay: Duration::from_millis(2000),
        clidata_timeout: Duration::from_secs(600),
        iprange: vec!["10.2.0.0/16".parse().expect("range")],
        redir_host: "localhost".to_string(),
        redir_port: 80,
    }
}

fn test_session() -> Arc<Session> {
    let (a, _b) = tokio::io::duplex(65536);
    let (r, w) = tokio::io::split(a);
    let local = Ipv4Addr::new(10, 2, 0, 1);
    let peer = Ipv4Addr::new(10, 2, 0, 2);
    let tun = TunDevice::from_split(
        "tun-test".to_string(),
        local,
        peer,
        Box::new(r),
        Box::new(w),
    );
    Arc::new(Session::new(
        "AABBCCDDEEFF".to_string(),
        local,
        peer,
        tun,
        vec!["10.2.0.0/16".parse().expect("range")],
    ))
}

fn frame(len: usize, tag: u8) -> Bytes {
    let mut pkt = vec![0u8; len];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    pkt[19] = tag;
    Bytes::from(pkt)
}

fn body_of(frames: &[Bytes]) -> Bytes {
    let mut body = BytesMut::new();
    for f in frames {
        body.extend_from_slice(f);
    }
    body.freeze()
}

async fn read_response(stream: &mut DuplexStream) -> (String, Vec<Bytes>) {
    let headers = http::read_headers(stream).await.expect("response headers");
    let len = http::content_length(&headers);
    let mut frames = Vec::new();
    if len > 0 {
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.expect("response body");
        frames = split_frames(Bytes::from(buf)).expect("response frames");
    }
    (headers, frames)
}

#[tokio::test]
async fn full_duplex_send_ingests_frames_and_acks() {
    let session = test_session();
    let (mut cli, mut srv) = tokio::io::duplex(65536);

    let frames = [frame(40, 1), frame(60, 2)];
    let body = body_of(&frames);
    let headers = format!("Content-Length: {}\r\n\r\n", body.len());
    cli.write_all(&body).await.expect("send body");

    proto2::handle_s(&mut srv, &headers, &session)
        .await
        .expect("handle_s");

    let (resp, data) = read_response(&mut cli).await;
    assert!(http::is_status(&resp, 204));
    assert!(data.is_empty());

    assert_eq!(session.recvq.len(), 2);
    assert_eq!(
        session.recvq.remove(false, None).await.expect("frame"),
        frames[0]
    );
    assert_eq!(
        session.recvq.remove(false, None).await.expect("frame"),
        frames[1]
    );
}

#[tokio::test]
async fn a_send_without_a_body_is_a_violation() {
    let session = test_session();
    let (_cli, mut srv) = tokio::io::duplex(65536);

    let res = proto2::handle_s(&mut srv, "Host: x\r\n\r\n", &session).await;
    assert!(res.is_err());
    assert!(session.recvq.is_empty());
}

#[tokio::test(start_paused = true)]
async fn half_duplex_send_batches_the_return_path() {
    let session = test_session();
    let ctx = Arc::new(ServerCtx::new(server_cfg(), None));
    let (sendq, _) = session.sendq_init();

    // Two frames were queued earlier, 5ms apart, and have gone quiet.
    let queued = [frame(80, 7), frame(80, 8)];
    sendq.add(queued[0].clone(), AddFlags::empty()).await.expect("add");
    tokio::time::sleep(Duration::from_millis(5)).await;
    sendq.add(queued[1].clone(), AddFlags::empty()).await.expect("add");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut cli, mut srv) = tokio::io::duplex(65536);
    let inbound = [frame(48, 1)];
    let body = body_of(&inbound);
    let headers = format!("Content-Length: {}\r\n\r\n", body.len());
    cli.write_all(&body).await.expect("send body");

    proto1::handle_s(&mut srv, &headers, &session, &ctx)
        .await
        .expect("handle_s");

    // Both queued frames come back in one 200.
    let (resp, data) = read_response(&mut cli).await;
    assert!(http::is_status(&resp, 200));
    assert_eq!(data, queued);
    assert_eq!(session.recvq.len(), 1);

    // An immediate follow-up poll finds nothing and nacks quickly.
    let (mut cli2, mut srv2) = tokio::io::duplex(65536);
    cli2.write_all(b":)").await.expect("poll body");
    let start = tokio::time::Instant::now();
    proto1::handle_p(&mut srv2, "Content-Length: 2\r\n\r\n", &session, &ctx)
        .await
        .expect("handle_p");
    let waited = start.elapsed();

    let (resp, data) = read_response(&mut cli2).await;
    assert!(http::is_status(&resp, 204));
    assert!(data.is_empty());
    assert!(waited >= Duration::from_millis(10));
    assert!(waited < Duration::from_millis(60));
}

#[tokio::test(start_paused = true)]
async fn receive_poll_returns_queued_frames_or_nacks() {
    let session = test_session();
    let (sendq, _) = session.sendq_init();

    // Poll with data ready: one 200 sized to the queue total.
    let queued = [frame(120, 3)];
    sendq.add(queued[0].clone(), AddFlags::empty()).await.expect("add");

    let (mut cli, mut srv) = tokio::io::duplex(65536);
    cli.write_all(b"5").await.expect("poll body");
    proto2::handle_r(&mut srv, "Content-Length: 1\r\n\r\n", &session)
        .await
        .expect("handle_r");
    let (resp, data) = read_response(&mut cli).await;
    assert!(http::is_status(&resp, 200));
    assert_eq!(data, queued);

    // Poll with nothing queued: held for the requested window, then 204.
    let (mut cli2, mut srv2) = tokio::io::duplex(65536);
    cli2.write_all(b"2").await.expect("poll body");
    let start = tokio::time::Instant::now();
    proto2::handle_r(&mut srv2, "Content-Length: 1\r\n\r\n", &session)
        .await
        .expect("handle_r");
    assert!(start.elapsed() >= Duration::from_secs(2));
    let (resp, data) = read_response(&mut cli2).await;
    assert!(http::is_status(&resp, 204));
    assert!(data.is_empty());
}

#[tokio::test]
async fn zero_second_poll_is_rejected() {
    let session = test_session();
    let (_sendq, _) = session.sendq_init();

    let (mut cli, mut srv) = tokio::io::duplex(65536);
    cli.write_all(b"0").await.expect("poll body");
    let res = proto2::handle_r(&mut srv, "Content-Length: 1\r\n\r\n", &session).await;
    assert!(res.is_err());

    let headers = http::read_headers(&mut cli).await.expect("response");
    assert!(http::is_status(&headers, 400));
}
