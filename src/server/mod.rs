// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Per-socket request state machine and session bring-up.
pub mod handler;
/// Protocol 1 (half-duplex) data handlers and the batching policy.
pub mod proto1;
/// Protocol 2 (full-duplex) data handlers.
pub mod proto2;
/// The session table.
pub mod session;
/// Bounded handler pool.
pub mod tpool;

use std::{
    net::Ipv4Addr,
    path::Path,
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal::unix::{SignalKind, signal}};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cfg::config::{Config, ServerConfig},
    server::{session::SessionTable, tpool::TaskPool},
    util,
};

/// How often the prune sweep runs.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide server state threaded through every handler task.
pub struct ServerCtx {
    cfg: RwLock<Arc<ServerConfig>>,
    pub tun_name: Option<String>,
    pub table: SessionTable,
}

impl ServerCtx {
    pub fn new(cfg: ServerConfig, tun_name: Option<String>) -> Self {
        Self {
            cfg: RwLock::new(Arc::new(cfg)),
            tun_name,
            table: SessionTable::new(),
        }
    }

    /// Cheap snapshot; reload replaces the whole Arc (copy-swap).
    pub fn cfg(&self) -> Arc<ServerConfig> {
        match self.cfg.read() {
            Ok(g) => Arc::clone(&g),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap_cfg(&self, new: ServerConfig) {
        let mut slot = match self.cfg.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Arc::new(new);
    }
}

/// Binds one listening socket, taking privileges for the low ports.
async fn create_srvsock(port: u16) -> Result<TcpListener> {
    if port < 1024 {
        util::getprivs("binding to port");
    }
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("binding to port {port}"))?;
    if port < 1024 {
        util::dropprivs("bound to port");
    }
    info!("daemon bound to port {port} and listening");
    Ok(listener)
}

/// Accept loop for one listening port: every socket goes to the handler
/// pool, and a full pool simply drops the connection.
async fn dispatcher(
    listener: TcpListener,
    pool: Arc<TaskPool>,
    ctx: Arc<ServerCtx>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept() failed: {e}");
                continue;
            }
        };
        info!("accepted connection from {peer}");
        let ctx = Arc::clone(&ctx);
        if pool
            .submit(async move { handler::client_handler(stream, ctx).await })
            .await
            .is_err()
        {
            info!("request queue full; dumping client {peer}");
        }
    }
}

/// Server entry point: two dispatchers, the prune timer, and the signal
/// loop. Returns once an orderly shutdown completes.
pub async fn server_main(config: Config, cfgfile: &Path) -> Result<()> {
    let scfg = config.server.context("config has no server section")?;
    let ports = scfg.server_ports;
    let pool = Arc::new(TaskPool::new(scfg.max_clients, scfg.max_pending, true));
    let ctx = Arc::new(ServerCtx::new(scfg, config.tun_name));

    let cancel = CancellationToken::new();
    let mut dispatchers = Vec::new();
    for port in ports {
        let listener = create_srvsock(port).await?;
        dispatchers.push(tokio::spawn(dispatcher(
            listener,
            Arc::clone(&pool),
            Arc::clone(&ctx),
            cancel.clone(),
        )));
    }

    info!("tunnel server daemon started successfully");

    let prune_ctx = Arc::clone(&ctx);
    let prune_cancel = cancel.clone();
    let pruner = tokio::spawn(async move {
        let mut tick = tokio::time::interval(PRUNE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = prune_cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let timeout = prune_ctx.cfg().clidata_timeout;
            let removed = prune_ctx.table.prune(timeout).await;
            if removed > 0 {
                info!("pruned {removed} idle session(s)");
            }
        }
    });

    signal_loop(&ctx, cfgfile).await?;

    info!("shutting down");
    cancel.cancel();
    for handle in dispatchers {
        let _ = handle.await;
    }
    let _ = pruner.await;
    ctx.table.clear().await;
    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown(false).await,
        Err(_) => error!("could not reclaim the handler pool for shutdown"),
    }

    info!("tunnel server daemon exiting");
    Ok(())
}

/// Blocks in the signal set until INT/TERM. HUP re-reads the config, USR1
/// dumps the session table, TSTP parks the process.
async fn signal_loop(ctx: &Arc<ServerCtx>, cfgfile: &Path) -> Result<()> {
    let mut hup = signal(SignalKind::hangup()).context("installing SIGHUP")?;
    let mut int = signal(SignalKind::interrupt()).context("installing SIGINT")?;
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM")?;
    let mut usr1 =
        signal(SignalKind::user_defined1()).context("installing SIGUSR1")?;
    let mut tstp = signal(SignalKind::from_raw(libc::SIGTSTP))
        .context("installing SIGTSTP")?;

    loop {
        tokio::select! {
            _ = hup.recv() => {
                info!("program received SIGHUP; re-reading config file");
                match Config::load_from_file(cfgfile) {
                    Ok(new) => match new.server {
                        Some(s) => ctx.swap_cfg(s),
                        None => error!("reloaded config has no server section; keeping the old one"),
                    },
                    Err(e) => error!("config reload failed: {e:#}"),
                }
            }
            _ = usr1.recv() => {
                info!("program received SIGUSR1");
                ctx.table.dump();
            }
            _ = tstp.recv() => {
                info!("program received SIGTSTP");
                util::self_stop();
            }
            _ = int.recv() => {
                info!("program received SIGINT");
                break;
            }
            _ = term.recv() => {
                info!("program received SIGTERM");
                break;
            }
        }
    }
    Ok(())
}
