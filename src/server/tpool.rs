// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fixed set of workers draining a bounded work queue. Submission either
/// fails fast on a full queue (`nonblock_on_full`) or waits for a slot.
///
/// Workers share the receiver behind a mutex: lock, pop, unlock, run. A job
/// therefore occupies its worker until it completes, so the pool size is the
/// hard bound on concurrent handlers.
pub struct TaskPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    nonblock_on_full: bool,
}

impl TaskPool {
    pub fn new(workers: usize, max_queue: usize, nonblock_on_full: bool) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(max_queue.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            _ = cancel.cancelled() => break,
                            job = async { rx.lock().await.recv().await } => job,
                        };
                        let Some(job) = job else {
                            // Intake closed and queue drained.
                            break;
                        };
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = job => {}
                        }
                    }
                    debug!("pool worker #{id} exiting");
                })
            })
            .collect();

        Self { tx, workers: handles, cancel, nonblock_on_full }
    }

    /// Hands a job to the pool. `Err` means the queue was full (or the pool
    /// is shutting down) and the job was not accepted.
    pub async fn submit<F>(&self, job: F) -> Result<(), ()>
    where F: Future<Output = ()> + Send + 'static {
        let job: Job = Box::pin(job);
        if self.nonblock_on_full {
            self.tx.try_send(job).map_err(|_| ())
        } else {
            self.tx.send(job).await.map_err(|_| ())
        }
    }

    /// Closes the queue to new work. With `finish`, queued jobs drain before
    /// the workers exit; otherwise queued jobs are abandoned and running
    /// jobs are dropped at their next suspension point.
    pub async fn shutdown(self, finish: bool) {
        drop(self.tx);
        if !finish {
            self.cancel.cancel();
        }
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}
