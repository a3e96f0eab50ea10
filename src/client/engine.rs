// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use tokio::{
    net::TcpStream,
    signal::unix::{SignalKind, signal},
    sync::mpsc,
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cfg::config::{ClientConfig, Config},
    client::{ControlMsg, channel},
    queue::{AddFlags, PacketQueue},
    tun::{self, TunDevice},
    util,
};

/// Client entry point. Owns the lifecycle loop: negotiate, bring the
/// topology up, park on the control channel, tear down, and either rebuild
/// or exit. Signals feed the same control channel the worker tasks use.
pub async fn client_main(mut config: Config, cfgfile: &Path) -> Result<()> {
    info!("tunnel client starting");

    let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<ControlMsg>(8);
    spawn_signal_task(ctrl_tx.clone())?;

    loop {
        let ccfg = Arc::new(
            config
                .client
                .clone()
                .context("config has no client section")?,
        );

        info!("initiating server connection");
        let Some((stream, local, peer)) = connect_with_retries(&ccfg).await else {
            bail!(
                "unable to negotiate protocol {} with server {}:{} via proxy {}:{}",
                ccfg.protocol,
                ccfg.server_ip,
                ccfg.server_ports[0],
                ccfg.proxy_ip,
                ccfg.proxy_port
            );
        };
        info!("server channel established");

        let sendq = Arc::new(PacketQueue::unbounded());
        let recvq = Arc::new(PacketQueue::unbounded());

        let (tun_dev, saved_route) =
            match bring_up(&config, &ccfg, local, peer).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("{e:#}");
                    bail!("unable to configure the tun device");
                }
            };
        let tun_dev = Arc::new(tun_dev);

        let topo_cancel = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(spawn_tun_reader(
            Arc::clone(&tun_dev),
            Arc::clone(&sendq),
            topo_cancel.clone(),
        ));
        tasks.push(spawn_tun_writer(Arc::clone(&tun_dev), Arc::clone(&recvq)));
        if ccfg.protocol == 1 {
            tasks.push(tokio::spawn(channel::proxy_channel(
                stream,
                Arc::clone(&ccfg),
                local,
                peer,
                Arc::clone(&sendq),
                Arc::clone(&recvq),
                ctrl_tx.clone(),
            )));
        } else {
            tasks.push(tokio::spawn(channel::sender(
                stream,
                Arc::clone(&ccfg),
                local,
                peer,
                Arc::clone(&sendq),
                ctrl_tx.clone(),
            )));
            tasks.push(tokio::spawn(channel::receiver(
                Arc::clone(&ccfg),
                Arc::clone(&recvq),
                ctrl_tx.clone(),
                topo_cancel.clone(),
            )));
        }

        // Park until a signal or a worker asks for something.
        let msg = ctrl_rx.recv().await.unwrap_or(ControlMsg::Quit);
        info!("supervisor received {msg:?}");

        shut_down_topology(&sendq, &recvq, topo_cancel, tasks, saved_route).await?;
        drop(tun_dev);

        match msg {
            ControlMsg::Reload => {
                info!("re-reading config file");
                match Config::load_from_file(cfgfile) {
                    Ok(new) => config = new,
                    Err(e) => {
                        error!("config reload failed, keeping old config: {e:#}")
                    }
                }
            }
            ControlMsg::Restart => {}
            ControlMsg::Quit => break,
        }
    }

    info!("tunnel client daemon exiting");
    Ok(())
}

/// Negotiation with the configured retry budget; -1 keeps trying forever.
async fn connect_with_retries(
    ccfg: &ClientConfig,
) -> Option<(TcpStream, Ipv4Addr, Ipv4Addr)> {
    let mut tries = ccfg.connect_tries;
    loop {
        if tries == 0 && ccfg.connect_tries != -1 {
            return None;
        }
        match channel::negotiate(ccfg).await {
            Ok(t) => return Some(t),
            Err(e) => {
                warn!("connect failed, sleeping before retry: {e:#}");
                tries -= 1;
                sleep(ccfg.reconnect_sleep_sec).await;
            }
        }
    }
}

/// Configures the TUN device with the negotiated pair and optionally swings
/// the default route through it, all inside one privilege bracket.
async fn bring_up(
    config: &Config,
    ccfg: &ClientConfig,
    local: Ipv4Addr,
    peer: Ipv4Addr,
) -> Result<(TunDevice, Option<Option<tun::DefaultRoute>>)> {
    util::getprivs("setting up the tun device");
    let result = async {
        let dev = tun::cli_tun_alloc(config.tun_name.as_deref(), local, peer)?;
        let saved = if ccfg.do_routing {
            let saved = tun::store_default_gw().context("unable to store default route")?;
            tun::set_default_gw(peer)
                .await
                .context("unable to set default route")?;
            Some(saved)
        } else {
            None
        };
        Ok((dev, saved))
    }
    .await;
    util::dropprivs("tun device up");
    result
}

/// Tears the running topology down in dependency order: queues first (the
/// channel tasks observe the shutdown and sign off with F), then the TUN
/// tasks, then the route.
async fn shut_down_topology(
    sendq: &PacketQueue,
    recvq: &PacketQueue,
    topo_cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    saved_route: Option<Option<tun::DefaultRoute>>,
) -> Result<()> {
    sendq.shutdown().await;
    recvq.shutdown().await;
    info!("send and recv queues destroyed");

    topo_cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("worker tasks exited");

    if let Some(saved) = saved_route {
        util::getprivs("restoring default gw");
        let restored = tun::restore_default_gw(saved.as_ref()).await;
        util::dropprivs("done restoring default gw");
        restored.context("unable to restore default route")?;
    }
    Ok(())
}

/// Device-to-wire worker.
fn spawn_tun_reader(
    dev: Arc<TunDevice>,
    sendq: Arc<PacketQueue>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("tun reader starting on {}", dev.name());
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = dev.read_frame() => frame,
            };
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    info!("tun read failed, quitting: {e}");
                    break;
                }
            };
            debug!("got packet: {}", frame.len());
            if sendq.add(frame, AddFlags::WAIT).await.is_err() {
                info!("queue add failed, quitting");
                break;
            }
        }
    })
}

/// Wire-to-device worker.
fn spawn_tun_writer(dev: Arc<TunDevice>, recvq: Arc<PacketQueue>) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("tun writer starting on {}", dev.name());
        while let Some(frame) = recvq.remove(true, None).await {
            if let Err(e) = dev.write_frame(&frame).await {
                warn!("tun write failed: {e}");
            } else {
                debug!("wrote {}", frame.len());
            }
        }
    })
}

/// Translates the process signal set into supervisor commands.
fn spawn_signal_task(ctrl: mpsc::Sender<ControlMsg>) -> Result<()> {
    let mut hup = signal(SignalKind::hangup()).context("installing SIGHUP")?;
    let mut int = signal(SignalKind::interrupt()).context("installing SIGINT")?;
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM")?;
    let mut tstp = signal(SignalKind::from_raw(libc::SIGTSTP))
        .context("installing SIGTSTP")?;

    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = hup.recv() => {
                    info!("program received SIGHUP");
                    ControlMsg::Reload
                }
                _ = int.recv() => {
                    info!("program received SIGINT");
                    ControlMsg::Quit
                }
                _ = term.recv() => {
                    info!("program received SIGTERM");
                    ControlMsg::Quit
                }
                _ = tstp.recv() => {
                    info!("program received SIGTSTP");
                    util::self_stop();
                    continue;
                }
            };
            if ctrl.send(msg).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}
