// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use bytes::Bytes;
use httptun::{
    iprange::IpRange,
    queue::AddFlags,
    server::session::{Session, SessionTable},
    tun::{TunDevice, pick_address_pair},
};

fn fake_tun(local: Ipv4Addr, peer: Ipv4Addr) -> TunDevice {
    let (a, _b) = tokio::io::duplex(65536);
    let (r, w) = tokio::io::split(a);
    TunDevice::from_split("tun-test".to_string(), local, peer, Box::new(r), Box::new(w))
}

fn session(mac: &str, local: [u8; 4], peer: [u8; 4]) -> Arc<Session> {
    let local = Ipv4Addr::from(local);
    let peer = Ipv4Addr::from(peer);
    Arc::new(Session::new(
        mac.to_string(),
        local,
        peer,
        fake_tun(local, peer),
        vec!["10.2.0.0/16".parse().expect("range")],
    ))
}

#[tokio::test]
async fn mac_lookup_is_case_insensitive() {
    let table = SessionTable::new();
    table.insert(session("AABBCCDDEEFF", [10, 2, 0, 1], [10, 2, 0, 2]));

    assert!(table.get("aabbccddeeff").is_some());
    assert!(table.get("AaBbCcDdEeFf").is_some());
    assert!(table.get("AABBCCDDEEFF").is_some());
    assert!(table.get("AABBCCDDEE00").is_none());
}

#[tokio::test]
async fn ip_used_covers_both_ends_of_every_session() {
    let table = SessionTable::new();
    table.insert(session("AABBCCDDEEFF", [10, 2, 0, 1], [10, 2, 0, 2]));
    table.insert(session("112233445566", [10, 2, 0, 3], [10, 2, 0, 4]));

    for last in 1..=4u8 {
        assert!(table.ip_used(Ipv4Addr::new(10, 2, 0, last)), ".{last}");
    }
    assert!(!table.ip_used(Ipv4Addr::new(10, 2, 0, 5)));
}

#[tokio::test]
async fn address_pairs_come_from_the_smaller_range_and_skip_used_ips() {
    let table = SessionTable::new();
    let client = vec!["10.2.4.0/30".parse::<IpRange>().expect("range")];
    let server = vec!["10.2.0.0/16".parse::<IpRange>().expect("range")];

    let (local, peer) =
        pick_address_pair(&client, &server, &table).expect("pair fits");
    assert_eq!(local, Ipv4Addr::new(10, 2, 4, 0));
    assert_eq!(peer, Ipv4Addr::new(10, 2, 4, 1));

    table.insert(session("AABBCCDDEEFF", [10, 2, 4, 0], [10, 2, 4, 1]));
    let (local, peer) =
        pick_address_pair(&client, &server, &table).expect("second pair");
    assert_eq!(local, Ipv4Addr::new(10, 2, 4, 2));
    assert_eq!(peer, Ipv4Addr::new(10, 2, 4, 3));

    // Now the /30 is exhausted.
    table.insert(session("112233445566", [10, 2, 4, 2], [10, 2, 4, 3]));
    assert!(pick_address_pair(&client, &server, &table).is_none());

    // Disjoint ranges never produce a pair.
    let far = vec!["172.16.0.0/24".parse::<IpRange>().expect("range")];
    assert!(pick_address_pair(&far, &server, &SessionTable::new()).is_none());
}

#[tokio::test]
async fn removal_shuts_down_the_session_queues() {
    let table = SessionTable::new();
    let s = session("AABBCCDDEEFF", [10, 2, 0, 1], [10, 2, 0, 2]);
    let recvq = Arc::clone(&s.recvq);
    recvq
        .add(Bytes::from_static(b"x"), AddFlags::empty())
        .await
        .expect("add");
    table.insert(s);

    assert!(table.remove("aabbccddeeff").await.is_some());
    assert!(table.is_empty());

    assert!(recvq.is_shutdown());
    assert_eq!(recvq.remove(true, None).await, None);
    assert!(
        recvq
            .add(Bytes::from_static(b"y"), AddFlags::WAIT)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn prune_takes_only_stale_fully_detached_sessions() {
    let table = SessionTable::new();

    let idle = session("AABBCCDDEEFF", [10, 2, 0, 1], [10, 2, 0, 2]);
    table.insert(Arc::clone(&idle));

    let live = session("112233445566", [10, 2, 0, 3], [10, 2, 0, 4]);
    let _chan1 = live.attach_chan1();
    table.insert(Arc::clone(&live));

    tokio::time::sleep(Duration::from_millis(20)).await;

    // Nothing is old enough yet under a long timeout.
    assert_eq!(table.prune(Duration::from_secs(600)).await, 0);

    // With a zero timeout only the fully detached session goes.
    assert_eq!(table.prune(Duration::ZERO).await, 1);
    assert!(table.get("AABBCCDDEEFF").is_none());
    assert!(table.get("112233445566").is_some());

    // Once its channel detaches and ages, the live one goes too.
    live.detach_chan1();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(table.prune(Duration::ZERO).await, 1);
    assert!(table.is_empty());
}

#[tokio::test]
async fn channel_attach_cancels_the_previous_owner() {
    let s = session("AABBCCDDEEFF", [10, 2, 0, 1], [10, 2, 0, 2]);

    let first = s.attach_chan1();
    assert!(s.chan1_connected());
    assert!(!first.is_cancelled());

    let second = s.attach_chan1();
    assert!(first.is_cancelled(), "old owner must be evicted");
    assert!(!second.is_cancelled());
    assert!(s.chan1_connected());

    s.detach_chan1();
    assert!(!s.chan1_connected());
}

#[tokio::test]
async fn sendq_is_created_exactly_once() {
    let s = session("AABBCCDDEEFF", [10, 2, 0, 1], [10, 2, 0, 2]);
    assert!(s.sendq().is_none());

    let (q1, created1) = s.sendq_init();
    assert!(created1);
    let (q2, created2) = s.sendq_init();
    assert!(!created2);
    assert!(Arc::ptr_eq(&q1, &q2));
}
