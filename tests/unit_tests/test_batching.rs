// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use httptun::{
    cfg::config::ServerConfig,
    queue::{AddFlags, PacketQueue},
    server::proto1::sendq_wait,
};
use tokio::time::Instant;

fn cfg() -> ServerConfig {
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

fn frame(len: usize) -> Bytes {
    let mut pkt = vec![0u8; len];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    Bytes::from(pkt)
}

#[tokio::test(start_paused = true)]
async fn empty_queue_nacks_after_min_delay() {
    let q = PacketQueue::unbounded();
    let cfg = cfg();

    let start = Instant::now();
    assert_eq!(sendq_wait(&q, &cfg).await, 0);
    let waited = start.elapsed();
    assert!(waited >= cfg.min_nack_delay);
    assert!(waited < cfg.min_nack_delay + Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn packet_count_threshold_returns_at_once() {
    let q = PacketQueue::unbounded();
    for _ in 0..3 {
        q.add(frame(100), AddFlags::empty()).await.expect("add");
    }

    let start = Instant::now();
    assert_eq!(sendq_wait(&q, &cfg()).await, 300);
    // No quiet-period sleep when the threshold is already met.
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn a_quiet_queue_flushes_after_the_packet_interval() {
    let q = Arc::new(PacketQueue::unbounded());
    for _ in 0..2 {
        q.add(frame(64), AddFlags::empty()).await.expect("add");
    }

    let start = Instant::now();
    assert_eq!(sendq_wait(&q, &cfg()).await, 128);
    let waited = start.elapsed();
    // Below the count threshold, so the batch closes one quiet interval
    // after the last add.
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn a_steady_trickle_is_cut_off_by_the_overall_deadline() {
    let q = Arc::new(PacketQueue::unbounded());
    q.add(frame(64), AddFlags::empty()).await.expect("seed");

    // A fresh packet every 25ms keeps the quiet period from ever closing
    // the batch; with the count threshold out of reach, only the overall
    // deadline can end the wait.
    let mut cfg = cfg();
    cfg.packet_count_threshold = 1000;

    let feeder = Arc::clone(&q);
    let producer = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if feeder.add(frame(64), AddFlags::empty()).await.is_err() {
                break;
            }
        }
    });

    let start = Instant::now();
    let total = sendq_wait(&q, &cfg).await;
    let waited = start.elapsed();
    producer.abort();

    assert!(total >= 64);
    assert!(waited >= cfg.max_response_delay);
    assert!(waited < cfg.max_response_delay + Duration::from_millis(500));
}
