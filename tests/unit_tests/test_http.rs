// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, time::Duration};

use httptun::proto::http::{
    HttpError, RequestKind, basic_auth, content_length, header_value, is_status,
    read_body, read_headers, read_request_line, write_request,
};
use tokio::io::AsyncWriteExt;

const IDLE: Duration = Duration::from_secs(5);

async fn parse_line(input: &str) -> Result<(RequestKind, String), HttpError> {
    let (mut tx, mut rx) = tokio::io::duplex(4096);
    tx.write_all(input.as_bytes()).await.expect("write");
    drop(tx);
    read_request_line(&mut rx, IDLE).await
}

#[tokio::test]
async fn request_tokens_parse_case_insensitively() {
    let cases = [
        ("POST http://10.0.0.1:8888/CP1 HTTP/1.0\r\n", RequestKind::Cp1),
        ("POST http://10.0.0.1:8888/cp2 HTTP/1.0\r\n", RequestKind::Cp2),
        ("post /CR HTTP/1.0\r\n", RequestKind::Cr),
        ("POST /s HTTP/1.0\r\n", RequestKind::S),
        ("POST /R HTTP/1.0\r\n", RequestKind::R),
        ("POST /P HTTP/1.1\r\n", RequestKind::P),
        ("POST /F HTTP/1.0\r\n", RequestKind::F),
        ("get / HTTP/1.0\r\n", RequestKind::Get),
        ("POST https://server.example/S HTTP/1.0\r\n", RequestKind::S),
    ];
    for (line, expect) in cases {
        let (kind, raw) = parse_line(line).await.expect(line);
        assert_eq!(kind, expect, "{line}");
        assert_eq!(raw, line.trim_end_matches(['\r', '\n']));
    }
}

#[tokio::test]
async fn junk_requests_are_flagged_not_dropped_silently() {
    for line in [
        "POST /XYZ HTTP/1.0\r\n",
        "PUT /S HTTP/1.0\r\n",
        "nonsense\r\n",
    ] {
        match parse_line(line).await {
            Err(HttpError::BadRequest(raw)) => {
                assert_eq!(raw, line.trim_end_matches(['\r', '\n']))
            }
            other => panic!("{line}: expected BadRequest, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn closed_peer_reports_disconnect() {
    let (tx, mut rx) = tokio::io::duplex(64);
    drop(tx);
    assert!(matches!(
        read_request_line(&mut rx, IDLE).await,
        Err(HttpError::Disconnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn silence_is_an_idle_timeout() {
    let (_tx, mut rx) = tokio::io::duplex(64);
    assert!(matches!(
        read_request_line(&mut rx, Duration::from_secs(30)).await,
        Err(HttpError::IdleTimeout)
    ));
}

#[tokio::test]
async fn header_block_is_normalised_and_searchable() {
    let (mut tx, mut rx) = tokio::io::duplex(4096);
    tx.write_all(b"Content-Length: 42\r\nHost: example\nX-Odd:stuck\r\n\r\n")
        .await
        .expect("write");
    drop(tx);

    let headers = read_headers(&mut rx).await.expect("headers");
    assert!(headers.ends_with("\r\n\r\n"));
    assert_eq!(header_value(&headers, "Content-Length"), Some("42"));
    assert_eq!(header_value(&headers, "Host"), Some("example"));
    assert_eq!(header_value(&headers, "X-Odd"), Some("stuck"));
    // Case-sensitive, line-anchored.
    assert_eq!(header_value(&headers, "content-length"), None);
    assert_eq!(header_value(&headers, "ost"), None);
}

#[tokio::test]
async fn content_length_semantics() {
    assert_eq!(content_length("Host: x\r\n\r\n"), -1);
    assert_eq!(content_length("Content-Length: 0\r\n\r\n"), 0);
    assert_eq!(content_length("Content-Length: 512\r\n\r\n"), 512);
    assert_eq!(content_length("Content-Length: nope\r\n\r\n"), -1);
    assert_eq!(content_length("Content-Length: -7\r\n\r\n"), -1);
}

#[tokio::test]
async fn body_reads_are_exact() {
    let (mut tx, mut rx) = tokio::io::duplex(4096);
    tx.write_all(b"hello world").await.expect("write");

    let body = read_body(&mut rx, "Content-Length: 5\r\n\r\n")
        .await
        .expect("read")
        .expect("some");
    assert_eq!(&body[..], b"hello");

    // Zero or missing Content-Length means no body at all.
    assert!(
        read_body(&mut rx, "Content-Length: 0\r\n\r\n")
            .await
            .expect("read")
            .is_none()
    );
}

#[tokio::test]
async fn status_line_matching_accepts_both_http_versions() {
    assert!(is_status("HTTP/1.0 204 No Data\r\n\r\n", 204));
    assert!(is_status("HTTP/1.1 204 No Content\r\n\r\n", 204));
    assert!(is_status("HTTP/1.0 200 OK\r\nContent-Length: 4\r\n\r\n", 200));
    assert!(!is_status("HTTP/1.0 200 OK\r\n\r\n", 204));
    assert!(!is_status("garbage\r\n\r\n", 200));
}

#[tokio::test]
async fn requests_carry_the_tunnel_shape() {
    let server = Ipv4Addr::new(10, 0, 0, 1);

    let mut out = Vec::new();
    write_request(&mut out, server, 8888, RequestKind::S, 1500, None)
        .await
        .expect("write");
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.starts_with("POST http://10.0.0.1:8888/S HTTP/1.0\r\n"));
    assert!(text.contains("Proxy-Connection: Keep-Alive\r\n"));
    assert!(text.contains("Content-Length: 1500\r\n"));
    assert!(text.ends_with("\r\n\r\n"));

    // Poll and finish carry their marker bodies and F closes the connection.
    let mut out = Vec::new();
    write_request(&mut out, server, 8888, RequestKind::P, 0, None)
        .await
        .expect("write");
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("Content-Length: 2\r\n"));
    assert!(text.ends_with("\r\n\r\n:)"));

    let mut out = Vec::new();
    write_request(&mut out, server, 8888, RequestKind::F, 0, Some("dXNlcjpwdw=="))
        .await
        .expect("write");
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("Proxy-Connection: Close\r\n"));
    assert!(text.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
    assert!(text.ends_with(":("));
}

#[tokio::test]
async fn basic_auth_is_base64_of_user_colon_pass() {
    assert_eq!(basic_auth("user", "pw"), "dXNlcjpwdw==");
}
