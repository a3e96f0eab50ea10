// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Bytes, BytesMut};
use httptun::proto::frame::{
    IPV4_HEADER_LEN, Ipv4Header, frame_len, read_frame, split_frames,
};
use tokio::io::AsyncWriteExt;

/// Minimal IPv4 datagram: version/IHL, the total-length field, src, dst.
fn fake_frame(total: u16, src: [u8; 4], dst: [u8; 4]) -> Bytes {
    let mut pkt = vec![0u8; usize::from(total)];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    pkt[8] = 64;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    Bytes::from(pkt)
}

#[test]
fn frame_len_reads_the_total_length_field() {
    let f = fake_frame(84, [10, 0, 0, 1], [10, 0, 0, 2]);
    assert_eq!(frame_len(&f).expect("parse"), 84);
}

#[test]
fn header_view_exposes_addresses() {
    let f = fake_frame(40, [192, 168, 1, 7], [10, 2, 0, 1]);
    let hdr = Ipv4Header::from_bytes(&f).expect("view");
    assert_eq!(hdr.src_addr().octets(), [192, 168, 1, 7]);
    assert_eq!(hdr.dst_addr().octets(), [10, 2, 0, 1]);
    assert_eq!(hdr.total_len.get(), 40);
}

#[test]
fn short_buffers_and_bogus_lengths_are_rejected() {
    assert!(frame_len(&[0u8; 10]).is_err());

    let mut too_short = fake_frame(20, [0; 4], [0; 4]).to_vec();
    too_short[2..4].copy_from_slice(&10u16.to_be_bytes());
    assert!(frame_len(&too_short).is_err());
}

#[test]
fn split_round_trips_a_concatenation() {
    let frames: Vec<Bytes> = [20u16, 64, 1500, 21]
        .iter()
        .map(|t| fake_frame(*t, [10, 0, 0, 1], [10, 0, 0, 2]))
        .collect();
    let mut body = BytesMut::new();
    for f in &frames {
        body.extend_from_slice(f);
    }

    let split = split_frames(body.freeze()).expect("split");
    assert_eq!(split, frames);
}

#[test]
fn split_rejects_empty_and_truncated_bodies() {
    assert!(split_frames(Bytes::new()).is_err());

    let f = fake_frame(100, [0; 4], [0; 4]);
    assert!(split_frames(f.slice(..50)).is_err());
}

#[tokio::test]
async fn read_frame_consumes_exactly_one_datagram() {
    let (mut tx, mut rx) = tokio::io::duplex(4096);

    let a = fake_frame(30, [10, 0, 0, 1], [10, 0, 0, 2]);
    let b = fake_frame(IPV4_HEADER_LEN as u16, [10, 0, 0, 2], [10, 0, 0, 1]);
    tx.write_all(&a).await.expect("write");
    tx.write_all(&b).await.expect("write");

    assert_eq!(read_frame(&mut rx).await.expect("frame a"), a);
    assert_eq!(read_frame(&mut rx).await.expect("frame b"), b);
}
