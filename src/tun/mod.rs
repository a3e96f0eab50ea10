// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use anyhow::{Context, Result, bail, ensure};
use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    iprange::IpRange,
    proto::frame::{self, MAX_FRAME},
    server::session::SessionTable,
};

pub type FrameReader = Box<dyn AsyncRead + Send + Unpin>;
pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One configured point-to-point TUN interface. The reader task does `read`,
/// the writer task does `write`; the halves never overlap.
pub struct TunDevice {
    name: String,
    pub local: Ipv4Addr,
    pub peer: Ipv4Addr,
    reader: Mutex<FrameReader>,
    writer: Mutex<FrameWriter>,
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl TunDevice {
    /// Opens a TUN device, assigns the local/peer pair, and brings it up.
    /// Packet information is disabled so reads and writes carry raw IPv4
    /// frames. Requires elevated privilege; callers hold the privilege
    /// bracket around this.
    pub fn open(name: Option<&str>, local: Ipv4Addr, peer: Ipv4Addr) -> Result<Self> {
        let mut config = tun::Configuration::default();
        config
            .address(local)
            .destination(peer)
            .netmask((255, 255, 255, 255))
            .up();
        if let Some(name) = name {
            config.name(name);
        }
        #[cfg(target_os = "linux")]
        config.platform(|p| {
            p.packet_information(false);
        });

        let dev = tun::create_as_async(&config)
            .context("opening TUN device (missing privilege?)")?;
        let name = {
            use tun::Device as _;
            dev.get_ref()
                .name()
                .context("reading tun device name")?
        };
        info!("allocated tun device {name} ({local} -> {peer})");

        let (reader, writer) = tokio::io::split(dev);
        Ok(Self::from_split(
            name,
            local,
            peer,
            Box::new(reader),
            Box::new(writer),
        ))
    }

    /// Wraps an already-open frame-carrying byte stream pair. The rest of
    /// the system only ever sees this surface, so it works over any duplex
    /// that speaks self-delimited IPv4 frames.
    pub fn from_split(
        name: String,
        local: Ipv4Addr,
        peer: Ipv4Addr,
        reader: FrameReader,
        writer: FrameWriter,
    ) -> Self {
        Self {
            name,
            local,
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One `read` yields one datagram from the device.
    pub async fn read_frame(&self) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(MAX_FRAME);
        let n = {
            let mut r = self.reader.lock().await;
            r.read(&mut buf).await?
        };
        if n == 0 {
            bail!("tun device {} closed", self.name);
        }
        buf.truncate(n);
        let frame = buf.freeze();
        // Cross-check the self-delimiting length against what the device
        // handed us; a mismatch means we are out of sync.
        let expect = frame::frame_len(&frame)?;
        ensure!(
            expect == frame.len(),
            "tun read {} bytes but header says {expect}",
            frame.len()
        );
        Ok(frame)
    }

    pub async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(frame).await?;
        Ok(())
    }
}

/// Client-side allocation: both addresses are dictated by the server.
pub fn cli_tun_alloc(
    name: Option<&str>,
    local: Ipv4Addr,
    peer: Ipv4Addr,
) -> Result<TunDevice> {
    TunDevice::open(name, local, peer)
}

/// Server-side allocation. Walks every (client range, server range) pair
/// where one subsumes the other and takes the first two free addresses of
/// the smaller range: the first becomes the server-side local address, the
/// next the client-side peer. Fails when every candidate pair is exhausted.
pub fn srv_tun_alloc(
    name: Option<&str>,
    client_ranges: &[IpRange],
    server_ranges: &[IpRange],
    table: &SessionTable,
) -> Result<TunDevice> {
    let (local, peer) = pick_address_pair(client_ranges, server_ranges, table)
        .context("no free address pair fits the advertised ranges")?;
    TunDevice::open(name, local, peer)
}

/// The address-pair search, separated from device creation so it can be
/// exercised without privilege.
pub fn pick_address_pair(
    client_ranges: &[IpRange],
    server_ranges: &[IpRange],
    table: &SessionTable,
) -> Option<(Ipv4Addr, Ipv4Addr)> {
    for crange in client_ranges {
        for srange in server_ranges {
            if !(crange.subsumes(srange) || srange.subsumes(crange)) {
                debug!("ranges {crange} and {srange} do not overlap");
                continue;
            }
            // Candidates start at the beginning of the smaller range.
            let smaller =
                if crange.prefix() >= srange.prefix() { crange } else { srange };
            let mut free = smaller.iter().filter(|ip| {
                crange.contains(*ip) && srange.contains(*ip) && !table.ip_used(*ip)
            });
            // Order matters: local (server side) first, then peer.
            if let (Some(local), Some(peer)) = (free.next(), free.next()) {
                debug!("picked pair local={local} peer={peer} from {smaller}");
                return Some((local, peer));
            }
        }
    }
    None
}

static MAC: OnceCell<String> = OnceCell::new();

/// Canonical uppercase 12-hex-digit link-layer address of a physical
/// interface, cached after the first read.
pub fn get_mac(ifname: &str) -> Result<&'static str> {
    MAC.get_or_try_init(|| {
        let path = format!("/sys/class/net/{ifname}/address");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading hardware address from {path}"))?;
        let mac: String = raw
            .trim()
            .chars()
            .filter(|c| *c != ':')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        ensure!(
            mac.len() == 12 && mac.bytes().all(|b| b.is_ascii_hexdigit()),
            "interface {ifname} has no usable hardware address: {raw:?}"
        );
        Ok(mac)
    })
    .map(String::as_str)
}

/// Snapshot of the default route taken before the tunnel replaces it.
#[derive(Debug, Clone)]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub iface: String,
}

const PROCNET_ROUTE: &str = "/proc/net/route";

/// Reads the current default gateway out of `/proc/net/route`. `None` when
/// the host has no default route.
pub fn store_default_gw() -> Result<Option<DefaultRoute>> {
    let table = std::fs::read_to_string(PROCNET_ROUTE)
        .with_context(|| format!("reading {PROCNET_ROUTE}"))?;
    for line in table.lines().skip(1) {
        let mut fields = line.split_ascii_whitespace();
        let (Some(iface), Some(dest), Some(gw)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(dest) = u32::from_str_radix(dest, 16) else { continue };
        if dest != 0 {
            continue;
        }
        let Ok(gw) = u32::from_str_radix(gw, 16) else { continue };
        if gw == 0 {
            continue;
        }
        // Kernel prints these little-endian.
        let gateway = Ipv4Addr::from(gw.swap_bytes());
        debug!("default gateway {gateway} via {iface}");
        return Ok(Some(DefaultRoute { gateway, iface: iface.to_string() }));
    }
    info!("no default gateway found");
    Ok(None)
}

/// Points the default route at the tunnel peer. Best-effort beyond the
/// final add: failures are reported to the caller who logs and continues.
pub async fn set_default_gw(peer: Ipv4Addr) -> Result<()> {
    let status = tokio::process::Command::new("ip")
        .args(["route", "replace", "default", "via", &peer.to_string()])
        .status()
        .await
        .context("spawning `ip route replace`")?;
    ensure!(status.success(), "`ip route replace default` failed: {status}");
    info!("default route now points at {peer}");
    Ok(())
}

/// Puts the saved default route back at shutdown.
pub async fn restore_default_gw(saved: Option<&DefaultRoute>) -> Result<()> {
    let status = match saved {
        Some(route) => {
            tokio::process::Command::new("ip")
                .args([
                    "route",
                    "replace",
                    "default",
                    "via",
                    &route.gateway.to_string(),
                    "dev",
                    &route.iface,
                ])
                .status()
                .await
                .context("spawning `ip route replace`")?
        }
        None => {
            // There was nothing before the tunnel; just drop ours.
            tokio::process::Command::new("ip")
                .args(["route", "del", "default"])
                .status()
                .await
                .context("spawning `ip route del`")?
        }
    };
    if !status.success() {
        warn!("restoring previous default gw: {status}");
        bail!("could not restore the default route");
    }
    info!("restored default route");
    Ok(())
}
