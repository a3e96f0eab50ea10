// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::Ipv4Addr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{iprange::IpRange, proto::http};

/// Which half of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Log destination; `-` means stdout (and implies foreground).
    #[serde(default = "default_logfile")]
    pub logfile: String,
    /// Include debug-level messages in the log.
    #[serde(default)]
    pub debug: bool,
    /// Explicit TUN interface name; the kernel picks one when unset.
    #[serde(default)]
    pub tun_name: Option<String>,
    /// Present exactly when running as the server.
    #[serde(default)]
    pub server: Option<ServerConfig>,
    /// Present exactly when running as the client.
    #[serde(default)]
    pub client: Option<ClientConfig>,
}

fn default_logfile() -> String {
    "-".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Handler pool size; also the hard cap on concurrently served sockets.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Accepted sockets allowed to queue for a free handler.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Seconds a channel may sit idle before the server drops it.
    #[serde(default = "default_idle_disconnect", with = "serde_secs")]
    pub idle_disconnect: Duration,
    /// Primary and secondary listening ports.
    pub server_ports: [u16; 2],
    /// Minimum wait before answering an S/P with an empty 204.
    #[serde(default = "default_min_nack_delay", with = "serde_millis")]
    pub min_nack_delay: Duration,
    /// Respond as soon as this many packets are queued.
    #[serde(default = "default_packet_count_threshold")]
    pub packet_count_threshold: usize,
    /// Quiet period after the last queued packet that closes a batch.
    #[serde(default = "default_packet_max_interval", with = "serde_millis")]
    pub packet_max_interval: Duration,
    /// Hard ceiling on how long one response may be delayed.
    #[serde(default = "default_max_response_delay", with = "serde_millis")]
    pub max_response_delay: Duration,
    /// Idle sessions older than this are pruned.
    #[serde(default = "default_clidata_timeout", with = "serde_secs")]
    pub clidata_timeout: Duration,
    /// Address ranges tunnel endpoints may be assigned from.
    pub iprange: Vec<IpRange>,
    /// Where non-tunnel HTTP traffic is replayed to.
    pub redir_host: String,
    pub redir_port: u16,
}

fn default_max_clients() -> usize {
    10
}
fn default_max_pending() -> usize {
    5
}
fn default_idle_disconnect() -> Duration {
    Duration::from_secs(300)
}
fn default_min_nack_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_packet_count_threshold() -> usize {
    10
}
fn default_packet_max_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_max_response_delay() -> Duration {
    Duration::from_millis(2000)
}
fn default_clidata_timeout() -> Duration {
    Duration::from_secs(600)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    pub proxy_ip: Ipv4Addr,
    pub proxy_port: u16,
    /// The tunnel server as reached *through* the proxy.
    pub server_ip: Ipv4Addr,
    pub server_ports: [u16; 2],
    /// Optional fixed endpoint addresses; normally the server assigns them.
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub peer_ip: Option<Ipv4Addr>,
    /// Replace the default route with one through the tunnel.
    #[serde(default = "default_true")]
    pub do_routing: bool,
    /// Poll backoff ceiling.
    #[serde(default = "default_max_poll_interval", with = "serde_secs")]
    pub max_poll_interval: Duration,
    /// Poll interval floor, restored whenever traffic flows.
    #[serde(default = "default_min_poll_interval", with = "serde_millis")]
    pub min_poll_interval_msec: Duration,
    /// Consecutive empty polls before the interval doubles.
    #[serde(default = "default_poll_backoff_rate")]
    pub poll_backoff_rate: u32,
    /// Long-poll duration the receive channel asks the server to hold.
    #[serde(default = "default_channel_2_idle_allow", with = "serde_secs")]
    pub channel_2_idle_allow: Duration,
    /// Negotiation attempts at startup; -1 retries forever.
    #[serde(default = "default_tries")]
    pub connect_tries: i32,
    /// Receive-channel reopen attempts; -1 retries forever.
    #[serde(default = "default_tries")]
    pub reconnect_tries: i32,
    #[serde(default = "default_reconnect_sleep", with = "serde_secs")]
    pub reconnect_sleep_sec: Duration,
    /// 1 = half-duplex single channel, 2 = full-duplex two channels.
    #[serde(default = "default_protocol")]
    pub protocol: u8,
    /// How long to wait for the server's response to a send.
    #[serde(default = "default_ack_wait", with = "serde_secs")]
    pub ack_wait: Duration,
    /// Physical interface whose MAC identifies this client.
    pub if_name: String,
    #[serde(default)]
    pub proxy_user: Option<String>,
    #[serde(default)]
    pub proxy_pass: Option<String>,
    /// Ranges this client will accept tunnel addresses from.
    pub iprange: Vec<IpRange>,
}

fn default_true() -> bool {
    true
}
fn default_max_poll_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_min_poll_interval() -> Duration {
    Duration::from_millis(200)
}
fn default_poll_backoff_rate() -> u32 {
    4
}
fn default_channel_2_idle_allow() -> Duration {
    Duration::from_secs(60)
}
fn default_tries() -> i32 {
    -1
}
fn default_reconnect_sleep() -> Duration {
    Duration::from_secs(5)
}
fn default_protocol() -> u8 {
    1
}
fn default_ack_wait() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("reading config file {}", path.as_ref().display())
        })?;
        let cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn mode(&self) -> Result<Mode> {
        match (&self.server, &self.client) {
            (Some(_), None) => Ok(Mode::Server),
            (None, Some(_)) => Ok(Mode::Client),
            (Some(_), Some(_)) => {
                anyhow::bail!("config must not contain both server and client sections")
            }
            (None, None) => {
                anyhow::bail!("config needs either a server or a client section")
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mode = self.mode()?;
        if let (Mode::Server, Some(s)) = (mode, &self.server) {
            ensure!(
                s.server_ports.iter().all(|p| *p != 0),
                "server_ports must not be 0; perhaps you forgot a config entry?"
            );
            ensure!(s.max_clients >= 1, "max_clients must be >= 1");
            ensure!(
                s.packet_count_threshold >= 1,
                "packet_count_threshold must be >= 1"
            );
            ensure!(!s.iprange.is_empty(), "server needs at least one iprange");
            ensure!(!s.redir_host.is_empty(), "redir_host must not be empty");
            ensure!(s.redir_port != 0, "redir_port must not be 0");
        }
        if let (Mode::Client, Some(c)) = (mode, &self.client) {
            ensure!(
                c.server_ports.iter().all(|p| *p != 0),
                "server_ports must not be 0"
            );
            ensure!(c.proxy_port != 0, "proxy_port must not be 0");
            ensure!(
                c.protocol == 1 || c.protocol == 2,
                "protocol must be 1 or 2"
            );
            ensure!(!c.if_name.is_empty(), "if_name must not be empty");
            ensure!(!c.iprange.is_empty(), "client needs at least one iprange");
            ensure!(
                c.proxy_user.is_some() == c.proxy_pass.is_some(),
                "proxy_user and proxy_pass must be set together"
            );
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Precomputed `Proxy-Authorization: Basic` credentials, when configured.
    pub fn proxy_auth(&self) -> Option<String> {
        match (&self.proxy_user, &self.proxy_pass) {
            (Some(user), Some(pass)) => Some(http::basic_auth(user, pass)),
            _ => None,
        }
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
