//! Connection pools keyed by destination plus proxy chain.
//!
//! A pool is a pull-based work queue: every idle connector parks a one-shot
//! slot on the pool's idle queue and whoever dispatches a task takes the
//! next slot. When no slot is parked the caller dials a fresh connector
//! instead of waiting. A pool removes itself from the registry when its last
//! connector exits.

pub(crate) mod task;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::scope::Scope;
use crate::transport::connector::{Connector, TaskResult};

use self::task::{ReadyHook, ReqTask};

/// Parked idle connector waiting for its next task.
type IdleSlot = oneshot::Sender<ReqTask>;

pub(crate) struct ConnPool {
    key: Arc<str>,
    live: AtomicUsize,
    idle_tx: Sender<IdleSlot>,
    idle_rx: Receiver<IdleSlot>,
    /// Delete scopes of live connectors, for force close.
    conns: DashMap<u64, Scope>,
    close: Scope,
    registry: Weak<Registry>,
    idle_timeout: Duration,
}

impl ConnPool {
    fn new(key: &str, registry: Weak<Registry>, idle_timeout: Duration) -> Arc<Self> {
        let (idle_tx, idle_rx) = unbounded();
        tracing::debug!("Pool {}: created", key);
        Arc::new(Self {
            key: Arc::from(key),
            live: AtomicUsize::new(0),
            idle_tx,
            idle_rx,
            conns: DashMap::new(),
            close: Scope::new(),
            registry,
            idle_timeout,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Connectors currently parked and waiting for work.
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Hand `task` to an idle connector without waiting. Gives the task back
    /// when none is parked or the pool is closed.
    pub fn dispatch(&self, task: ReqTask) -> Result<(), ReqTask> {
        if self.is_closed() {
            return Err(task);
        }
        let mut task = task;
        while let Ok(slot) = self.idle_rx.try_recv() {
            // A slot whose connector already left hands the task back.
            match slot.send(task) {
                Ok(()) => return Ok(()),
                Err(returned) => task = returned,
            }
        }
        Err(task)
    }

    /// Dispatch, or bounce the task to its caller to dial fresh.
    fn redispatch(&self, task: ReqTask) {
        if let Err(task) = self.dispatch(task) {
            task.bounce();
        }
    }

    /// Serve loop for one connector, starting with `first`.
    pub async fn serve(self: Arc<Self>, conn: Arc<Connector>, first: ReqTask) {
        self.conns.insert(conn.id(), conn.delete_scope().clone());
        let mut task = first;
        loop {
            let (slot_tx, slot_rx) = oneshot::channel();
            let idle_tx = self.idle_tx.clone();
            let ready = ReadyHook::new(move || {
                let _ = idle_tx.send(slot_tx);
            });

            match conn.run_task(task, ready).await {
                TaskResult::Served => {}
                TaskResult::Discard(unsent) => {
                    tracing::debug!("Pool {}: connector {} discarded a task", self.key, conn.id());
                    self.redispatch(unsent);
                    break;
                }
                TaskResult::Fatal => break,
            }

            match self.wait_task(&conn, slot_rx).await {
                Some(next) => task = next,
                None => break,
            }
        }

        tracing::debug!("Pool {}: connector {} exiting", self.key, conn.id());
        conn.close_with_error(Error::Closed);
        self.conns.remove(&conn.id());
        self.release();
    }

    /// Wait for the next task on the parked slot, or for a reason to stop.
    async fn wait_task(&self, conn: &Connector, mut slot: oneshot::Receiver<ReqTask>) -> Option<ReqTask> {
        let delete = conn.delete_scope().clone();
        let close = conn.close_scope().clone();
        tokio::select! {
            biased;
            _ = delete.cancelled() => {}
            _ = close.cancelled() => {}
            _ = self.close.cancelled() => {}
            task = &mut slot => return task.ok(),
            _ = tokio::time::sleep(self.idle_timeout) => {
                tracing::debug!("Pool {}: connector {} idle for {:?}", self.key, conn.id(), self.idle_timeout);
            }
        }
        // A dispatcher may have won the race with the exit path.
        slot.close();
        if let Ok(task) = slot.try_recv() {
            self.redispatch(task);
        }
        None
    }

    /// Drop one live connector; the last one out removes the pool.
    fn release(self: &Arc<Self>) {
        if self.live.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let removed = match self.registry.upgrade() {
            Some(registry) => registry
                .pools
                .remove_if(&*self.key, |_, pool| {
                    Arc::ptr_eq(pool, self) && pool.live.load(Ordering::Acquire) == 0
                })
                .is_some(),
            None => true,
        };
        if removed {
            tracing::debug!("Pool {}: removed (no live connections)", self.key);
            self.close.cancel(Error::Closed);
        }
    }

    /// Stop dispatching; connectors exit after their current body.
    pub fn close(self: &Arc<Self>) {
        self.close.cancel(Error::Closed);
        if let Some(registry) = self.registry.upgrade() {
            registry
                .pools
                .remove_if(&*self.key, |_, pool| Arc::ptr_eq(pool, self));
        }
    }

    /// Close and tear every connector down now.
    pub fn force_close(self: &Arc<Self>) {
        self.close();
        for conn in self.conns.iter() {
            conn.value().cancel(Error::ForceClosed);
        }
    }
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("key", &self.key)
            .field("live", &self.live())
            .field("idle", &self.idle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Concurrent map from pool key to pool.
#[derive(Default)]
pub(crate) struct Registry {
    pools: DashMap<String, Arc<ConnPool>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open pool for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<ConnPool>> {
        self.pools
            .get(key)
            .map(|pool| pool.value().clone())
            .filter(|pool| !pool.is_closed())
    }

    /// Count a new connector against the pool for `key`, creating the pool
    /// (or replacing a closed one) as needed.
    pub fn register(self: &Arc<Self>, key: &str, idle_timeout: Duration) -> Arc<ConnPool> {
        let mut entry = self
            .pools
            .entry(key.to_string())
            .or_insert_with(|| ConnPool::new(key, Arc::downgrade(self), idle_timeout));
        if entry.is_closed() {
            *entry = ConnPool::new(key, Arc::downgrade(self), idle_timeout);
        }
        // Counted under the entry lock so a concurrent release cannot
        // remove a pool that just gained a connector.
        entry.live.fetch_add(1, Ordering::AcqRel);
        entry.value().clone()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pools.contains_key(key)
    }

    fn drain(&self) -> Vec<Arc<ConnPool>> {
        let pools: Vec<_> = self.pools.iter().map(|p| p.value().clone()).collect();
        self.pools.clear();
        pools
    }

    /// Gracefully close every pool.
    pub fn close_all(&self) {
        for pool in self.drain() {
            pool.close();
        }
    }

    /// Force close every pool and connector.
    pub fn force_close_all(&self) {
        for pool in self.drain() {
            pool.force_close();
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("pools", &self.pools.len())
            .finish()
    }
}
