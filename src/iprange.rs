// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, net::Ipv4Addr, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("missing '/' separator in {0:?}")]
    MissingSlash(String),
    #[error("bad network address in {0:?}")]
    BadNetwork(String),
    #[error("prefix length out of range in {0:?}")]
    BadPrefix(String),
}

/// One `a.b.c.d/p` address range. The stored network is always masked down
/// to its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    net: Ipv4Addr,
    prefix: u8,
}

impl IpRange {
    pub fn new(net: Ipv4Addr, prefix: u8) -> Result<Self, RangeError> {
        if prefix > 32 {
            return Err(RangeError::BadPrefix(format!("{net}/{prefix}")));
        }
        let masked = u32::from(net) & mask_of(prefix);
        Ok(Self { net: Ipv4Addr::from(masked), prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.net
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn mask(&self) -> u32 {
        mask_of(self.prefix)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.net) & self.mask()
    }

    /// True when every address of `other` also lies in `self`.
    pub fn subsumes(&self, other: &IpRange) -> bool {
        self.prefix <= other.prefix && self.contains(other.net)
    }

    /// Addresses of the range in ascending order, starting at the network
    /// address.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let range = *self;
        let mut next = Some(range.net);
        std::iter::from_fn(move || {
            let cur = next?;
            next = u32::from(cur)
                .checked_add(1)
                .map(Ipv4Addr::from)
                .filter(|ip| range.contains(*ip));
            Some(cur)
        })
    }
}

fn mask_of(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
}

impl FromStr for IpRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (net, bits) = s
            .split_once('/')
            .ok_or_else(|| RangeError::MissingSlash(s.to_string()))?;
        let net: Ipv4Addr = net
            .parse()
            .map_err(|_| RangeError::BadNetwork(s.to_string()))?;
        let prefix: u8 = bits
            .parse()
            .map_err(|_| RangeError::BadPrefix(s.to_string()))?;
        Self::new(net, prefix)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net, self.prefix)
    }
}

impl Serialize for IpRange {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpRange {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses the range lines a client advertises during channel bring-up,
/// skipping (and logging) anything malformed. Empty lines are ignored.
pub fn parse_advertised(lines: impl Iterator<Item = impl AsRef<str>>) -> Vec<IpRange> {
    let mut out = Vec::new();
    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<IpRange>() {
            Ok(r) => out.push(r),
            Err(e) => warn!("ignoring invalid ip range: {e}"),
        }
    }
    out
}
