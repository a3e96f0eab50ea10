// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use httptun::{
    cfg::config::ServerConfig,
    proto::http,
    server::{ServerCtx, handler::client_handler},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

const UPSTREAM_BODY: &[u8] = b"hello from upstream\n";

fn server_cfg(redir_port: u16) -> ServerConfig {
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
        redir_host: "127.0.0.1".to_string(),
        redir_port,
    }
}

/// A browser GET arriving on the tunnel port is replayed to the redirect
/// host with its hop headers rewritten, and the upstream answer streams
/// back untouched.
#[tokio::test]
async fn get_requests_are_relayed_to_the_redirect_host() {
    let upstream = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind upstream");
    let upstream_port = upstream.local_addr().expect("addr").port();

    let upstream_task = tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.expect("accept");
        let mut seen = Vec::new();
        loop {
            let mut line = String::new();
            let mut byte = [0u8; 1];
            loop {
                sock.read_exact(&mut byte).await.expect("read");
                if byte[0] == b'\n' {
                    break;
                }
                if byte[0] != b'\r' {
                    line.push(byte[0] as char);
                }
            }
            if line.is_empty() {
                break;
            }
            seen.push(line);
        }
        let resp = format!(
            "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n",
            UPSTREAM_BODY.len()
        );
        sock.write_all(resp.as_bytes()).await.expect("write head");
        sock.write_all(UPSTREAM_BODY).await.expect("write body");
        seen
    });

    let tunnel = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind tunnel");
    let tunnel_port = tunnel.local_addr().expect("addr").port();
    let ctx = Arc::new(ServerCtx::new(server_cfg(upstream_port), None));
    tokio::spawn(async move {
        let (sock, _) = tunnel.accept().await.expect("accept");
        client_handler(sock, ctx).await;
    });

    let mut browser = TcpStream::connect((Ipv4Addr::LOCALHOST, tunnel_port))
        .await
        .expect("connect");
    browser
        .write_all(
            b"GET /index.html HTTP/1.0\r\n\
              Host: example.com\r\n\
              X-Thing: kept\r\n\
              Connection: Keep-Alive\r\n\r\n",
        )
        .await
        .expect("send request");

    let headers = http::read_headers(&mut browser).await.expect("response");
    assert!(http::is_status(&headers, 200));
    let len = http::content_length(&headers);
    assert_eq!(len as usize, UPSTREAM_BODY.len());
    let mut body = vec![0u8; len as usize];
    browser.read_exact(&mut body).await.expect("body");
    assert_eq!(body, UPSTREAM_BODY);

    let seen = upstream_task.await.expect("upstream task");
    assert_eq!(seen[0], "GET /index.html HTTP/1.0");
    assert!(seen.contains(&format!("Host: 127.0.0.1:{upstream_port}")));
    assert!(seen.contains(&"Connection: Close".to_string()));
    assert!(seen.contains(&"X-Thing: kept".to_string()));
    assert!(!seen.contains(&"Host: example.com".to_string()));
    assert!(!seen.contains(&"Connection: Keep-Alive".to_string()));
}
