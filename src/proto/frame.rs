// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use zerocopy::{BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16};

/// Fixed part of an IPv4 header; options are never inspected.
pub const IPV4_HEADER_LEN: usize = 20;
/// Upper bound on a single tunnelled datagram.
pub const MAX_FRAME: usize = 65536;

/// View over the fixed IPv4 header. Only the fields the tunnel actually
/// consults are named; everything else stays opaque.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Ipv4Header {
    pub ver_ihl: u8,               // 0
    pub tos: u8,                   // 1
    pub total_len: U16<BigEndian>, // 2..4
    pub ident: U16<BigEndian>,     // 4..6
    pub flags_frag: U16<BigEndian>, // 6..8
    pub ttl: u8,                   // 8
    pub protocol: u8,              // 9
    pub checksum: U16<BigEndian>,  // 10..12
    pub src: [u8; 4],              // 12..16
    pub dst: [u8; 4],              // 16..20
}

impl Ipv4Header {
    pub fn from_bytes(buf: &[u8]) -> Result<&Self> {
        let (hdr, _rest) = Self::ref_from_prefix(buf)
            .map_err(|_| anyhow::anyhow!("short buffer for IPv4 header"))?;
        Ok(hdr)
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }
}

/// Length of the frame starting at `buf`, taken from the IPv4 total-length
/// field. Fails on a short buffer or a nonsensical length.
pub fn frame_len(buf: &[u8]) -> Result<usize> {
    let hdr = Ipv4Header::from_bytes(buf)?;
    let len = usize::from(hdr.total_len.get());
    if len < IPV4_HEADER_LEN {
        bail!("IPv4 total length {len} shorter than the header");
    }
    if len > MAX_FRAME {
        bail!("IPv4 total length {len} exceeds the {MAX_FRAME}-byte cap");
    }
    Ok(len)
}

/// Reads exactly one datagram from a stream: the 20 header bytes first, then
/// `total_len - 20` more.
pub async fn read_frame<R>(r: &mut R) -> Result<Bytes>
where R: AsyncRead + Unpin {
    let mut buf = BytesMut::zeroed(IPV4_HEADER_LEN);
    r.read_exact(&mut buf).await?;

    let len = frame_len(&buf)?;
    if len > IPV4_HEADER_LEN {
        let old = buf.len();
        buf.resize(len, 0);
        r.read_exact(&mut buf[old..]).await?;
    }
    Ok(buf.freeze())
}

/// Splits a body of concatenated datagrams into individual frames. The body
/// must be an exact concatenation; anything left over (or an empty body) is
/// an error.
pub fn split_frames(mut body: Bytes) -> Result<Vec<Bytes>> {
    if body.is_empty() {
        bail!("empty frame body");
    }
    let mut frames = Vec::new();
    while !body.is_empty() {
        let len = frame_len(&body)?;
        if body.len() < len {
            bail!("truncated frame: {} of {len} bytes", body.len());
        }
        frames.push(body.split_to(len));
    }
    Ok(frames)
}
