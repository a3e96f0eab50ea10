// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{iprange::IpRange, queue::PacketQueue, tun::TunDevice};

/// Liveness of one channel socket. The token cancels whatever handler task
/// currently owns the socket, which is how a replacement CP evicts its
/// predecessor without touching the socket it does not own.
#[derive(Debug)]
struct ChannelSlot {
    connected: bool,
    cancel: CancellationToken,
}

impl ChannelSlot {
    fn vacant() -> Self {
        Self { connected: false, cancel: CancellationToken::new() }
    }

    fn attach(&mut self) -> CancellationToken {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.connected = true;
        self.cancel.clone()
    }

    fn detach(&mut self) {
        self.connected = false;
    }
}

/// Per-client state on the server, keyed by MAC identity. One logical owner
/// (the table); handler tasks hold `Arc` clones scoped to their request loop
/// and observe teardown through queue shutdown and channel tokens.
#[derive(Debug)]
pub struct Session {
    macaddr: String,
    /// Client side of the point-to-point pair.
    pub cliaddr: Ipv4Addr,
    /// Server side of the point-to-point pair.
    pub srvaddr: Ipv4Addr,
    pub tun: Arc<TunDevice>,
    /// Frames bound for the client's TUN (wire -> device).
    pub recvq: Arc<PacketQueue>,
    /// Frames bound for the wire (device -> responses). Created when the
    /// send side starts: at CP for protocol 1, at CR for protocol 2.
    sendq: OnceCell<Arc<PacketQueue>>,
    chan1: Mutex<ChannelSlot>,
    chan2: Mutex<ChannelSlot>,
    lastuse: Mutex<Instant>,
    ranges: Mutex<Vec<IpRange>>,
    /// Wakes the TUN reader/writer tasks at teardown.
    pub tun_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        macaddr: String,
        srvaddr: Ipv4Addr,
        cliaddr: Ipv4Addr,
        tun: TunDevice,
        ranges: Vec<IpRange>,
    ) -> Self {
        Self {
            macaddr,
            cliaddr,
            srvaddr,
            tun: Arc::new(tun),
            recvq: Arc::new(PacketQueue::unbounded()),
            sendq: OnceCell::new(),
            chan1: Mutex::new(ChannelSlot::vacant()),
            chan2: Mutex::new(ChannelSlot::vacant()),
            lastuse: Mutex::new(Instant::now()),
            ranges: Mutex::new(ranges),
            tun_cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn macaddr(&self) -> &str {
        &self.macaddr
    }

    pub fn touch(&self) {
        *lock(&self.lastuse) = Instant::now();
    }

    /// The send queue, creating it on first use. Survives channel
    /// replacement so queued frames outlive a reconnect.
    pub fn sendq_or_init(&self) -> Arc<PacketQueue> {
        Arc::clone(self.sendq.get_or_init(|| Arc::new(PacketQueue::unbounded())))
    }

    pub fn sendq(&self) -> Option<Arc<PacketQueue>> {
        self.sendq.get().map(Arc::clone)
    }

    /// Like [`Session::sendq_or_init`], but also reports whether this call
    /// created the queue, so the caller knows to start the worker exactly
    /// once.
    pub fn sendq_init(&self) -> (Arc<PacketQueue>, bool) {
        let mut created = false;
        let q = self.sendq.get_or_init(|| {
            created = true;
            Arc::new(PacketQueue::unbounded())
        });
        (Arc::clone(q), created)
    }

    /// Marks chan1 owned by a new handler; any previous owner is cancelled.
    pub fn attach_chan1(&self) -> CancellationToken {
        lock(&self.chan1).attach()
    }

    pub fn attach_chan2(&self) -> CancellationToken {
        lock(&self.chan2).attach()
    }

    pub fn detach_chan1(&self) {
        lock(&self.chan1).detach();
        self.touch();
    }

    /// Cancels whatever handler currently owns chan1 and marks the slot
    /// absent.
    pub fn evict_chan1(&self) {
        let mut slot = lock(&self.chan1);
        slot.attach().cancel();
        slot.detach();
    }

    pub fn evict_chan2(&self) {
        let mut slot = lock(&self.chan2);
        slot.attach().cancel();
        slot.detach();
    }

    pub fn detach_chan2(&self) {
        lock(&self.chan2).detach();
        self.touch();
    }

    pub fn chan1_connected(&self) -> bool {
        lock(&self.chan1).connected
    }

    pub fn chan2_connected(&self) -> bool {
        lock(&self.chan2).connected
    }

    pub fn swap_ranges(&self, ranges: Vec<IpRange>) {
        *lock(&self.ranges) = ranges;
    }

    /// The ranges the client advertised on its most recent CP.
    pub fn ranges(&self) -> Vec<IpRange> {
        lock(&self.ranges).clone()
    }

    pub fn register_task(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).push(handle);
    }

    /// Eligible for the prune sweep: both channels absent and idle past the
    /// timeout.
    pub fn stale(&self, timeout: Duration) -> bool {
        !self.chan1_connected()
            && !self.chan2_connected()
            && lock(&self.lastuse).elapsed() > timeout
    }

    /// Releases every per-session resource: evicts channel owners, wakes the
    /// TUN tasks, shuts both queues down, and joins the workers. Runs after
    /// the session is unlinked from the table, so nothing blocks under a map
    /// guard.
    pub async fn teardown(&self) {
        self.evict_chan1();
        self.evict_chan2();
        self.tun_cancel.cancel();

        self.recvq.shutdown().await;
        if let Some(sendq) = self.sendq.get() {
            sendq.shutdown().await;
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.tasks));
        for handle in handles {
            let _ = handle.await;
        }
        debug!("session {} torn down", self.macaddr);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Concurrent MAC -> session map. Keys are stored uppercase, so lookups are
/// case-insensitive.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(mac: &str) -> String {
        mac.to_ascii_uppercase()
    }

    pub fn get(&self, mac: &str) -> Option<Arc<Session>> {
        self.sessions.get(&Self::key(mac)).map(|s| Arc::clone(&s))
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions
            .insert(Self::key(session.macaddr()), session);
    }

    /// Unlinks and fully tears the session down. Resource release happens
    /// outside the map shard lock.
    pub async fn remove(&self, mac: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&Self::key(mac))?;
        info!("removing session for MAC {}", session.macaddr());
        session.teardown().await;
        Some(session)
    }

    /// True when `ip` is the local or peer address of any live session.
    pub fn ip_used(&self, ip: Ipv4Addr) -> bool {
        self.sessions
            .iter()
            .any(|s| s.cliaddr == ip || s.srvaddr == ip)
    }

    /// Removes every session whose channels are both absent and whose last
    /// use is older than `timeout`. Returns how many were removed.
    pub async fn prune(&self, timeout: Duration) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.stale(timeout))
            .map(|s| s.key().clone())
            .collect();
        let mut removed = 0;
        for mac in stale {
            if self.remove(&mac).await.is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Clears the whole table at server shutdown.
    pub async fn clear(&self) {
        let macs: Vec<String> =
            self.sessions.iter().map(|s| s.key().clone()).collect();
        for mac in macs {
            self.remove(&mac).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// INFO dump of every session, for the USR1 handler.
    pub fn dump(&self) {
        info!("known clients:");
        for s in self.sessions.iter() {
            info!("client {}:", s.macaddr());
            info!("\tclient ip : {}", s.cliaddr);
            info!("\tserver ip : {}", s.srvaddr);
            info!("\ttun dev   : {}", s.tun.name());
            info!("\tchan1     : {}", if s.chan1_connected() { "up" } else { "-" });
            info!("\tchan2     : {}", if s.chan2_connected() { "up" } else { "-" });
            let ranges: Vec<String> =
                s.ranges().iter().map(ToString::to_string).collect();
            info!("\tranges    : {}", ranges.join(" "));
            match s.sendq() {
                Some(q) => info!("\tsend queue: {}", q.stats()),
                None => info!("\tsend queue: none"),
            }
            info!("\trecv queue: {}", s.recvq.stats());
        }
    }
}
