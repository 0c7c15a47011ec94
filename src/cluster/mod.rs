mod redirect;
mod slots;

pub use redirect::{RedirInfo, RedirKind};
pub use slots::{parse_cluster_slots, SlotLayout, SlotNode, SlotRange, SlotTable};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{bail, Result};
use bytes::Bytes;
use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::conn::Conn;
use crate::pool::{NodePoolRegistry, PoolFactory, PoolStats, PooledConn};
use crate::protocol::Command;
use crate::pubsub::{PubSubConn, ShardedPubSubConn};

/// Entry point: a cluster-wide pool that routes by hash slot.
///
/// The pool owns the per-node connection pools and the slot table; the
/// connection facades it hands out keep a shared reference back to it, so
/// the pool may be closed while facades are still alive — their operations
/// then fail instead of dangling.
pub struct ClusterPool {
    // handle to ourselves for facades and background reload tasks; set by
    // Arc::new_cyclic, upgradable as long as any caller still borrows us
    self_ref: Weak<ClusterPool>,
    registry: NodePoolRegistry,
    slots: SlotTable,
    seeds: Vec<String>,
    closed: AtomicBool,
}

impl ClusterPool {
    /// Build a pool from configuration. Connections are dialed raw unless
    /// the config carries a `pool` section.
    pub fn new(config: ClusterConfig) -> Result<Arc<Self>> {
        Self::build(config, None)
    }

    /// Build a pool whose per-node pools come from a custom factory.
    pub fn with_factory(config: ClusterConfig, factory: Arc<dyn PoolFactory>) -> Result<Arc<Self>> {
        Self::build(config, Some(factory))
    }

    fn build(config: ClusterConfig, factory: Option<Arc<dyn PoolFactory>>) -> Result<Arc<Self>> {
        config.ensure_valid()?;
        let registry = NodePoolRegistry::new(&config, factory);
        let seeds = config.entry_addrs.clone();
        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            registry,
            slots: SlotTable::new(),
            seeds,
            closed: AtomicBool::new(false),
        }))
    }

    fn shared(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("cluster pool outlives its borrows")
    }

    /// A read-write facade that follows redirections automatically.
    pub fn conn(&self) -> Conn {
        Conn::new(self.shared(), true, false)
    }

    /// A facade that routes reads to replicas where the slot has any.
    pub fn readonly_conn(&self) -> Conn {
        Conn::new(self.shared(), true, true)
    }

    /// A facade that surfaces MOVED/ASK errors instead of chasing them.
    pub fn no_redir_conn(&self) -> Conn {
        Conn::new(self.shared(), false, false)
    }

    /// Subscribe-capable connection on an arbitrary node.
    pub async fn pubsub_conn(&self) -> Result<PubSubConn> {
        let conn = self.conn_for_slot(None).await?;
        Ok(PubSubConn::new(conn))
    }

    /// Sharded pub/sub facade; the connection is established on the first
    /// `ssubscribe`, on the owner of the channels' slot.
    pub fn sharded_pubsub_conn(&self) -> ShardedPubSubConn {
        ShardedPubSubConn::new(self.shared())
    }

    /// Refresh the slot table from the first node that answers.
    ///
    /// Single-flight: when a refresh is already running this returns
    /// immediately and lets it finish.
    pub async fn reload_slot_mapping(&self) -> Result<()> {
        if !self.slots.begin_reload() {
            return Ok(());
        }
        let result = self.reload_inner().await;
        self.slots.finish_reload();
        result
    }

    async fn reload_inner(&self) -> Result<()> {
        self.ensure_open()?;
        let mut candidates = self.slots.known_nodes(true);
        if candidates.is_empty() {
            candidates = self.seeds.clone();
        }
        if candidates.is_empty() {
            bail!("empty node");
        }

        let command = Command::new("CLUSTER", &[Bytes::from_static(b"SLOTS")]);
        for addr in candidates {
            let mut conn = match self.registry.get_conn(&addr).await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(addr = %addr, error = %err, "topology candidate unreachable");
                    continue;
                }
            };
            let reply = match conn.do_cmd(&command).await {
                Ok(reply) => reply,
                Err(err) => {
                    debug!(addr = %addr, error = %err, "CLUSTER SLOTS exchange failed");
                    continue;
                }
            };
            drop(conn);
            match parse_cluster_slots(&reply) {
                Ok(layout) => {
                    self.slots.install(layout);
                    info!(addr = %addr, "slot table refreshed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(addr = %addr, error = %err, "rejected CLUSTER SLOTS reply");
                }
            }
        }
        bail!("all nodes failed")
    }

    /// Apply a redirection hint and, when it changed the table, kick off a
    /// background refresh. Never blocks the operation that saw the redirect.
    pub(crate) fn on_redirect(&self, info: &RedirInfo) -> bool {
        if !self.slots.on_redirect(info) {
            return false;
        }
        let pool = self.shared();
        tokio::spawn(async move {
            if let Err(err) = pool.reload_slot_mapping().await {
                warn!(error = %err, "background slot reload failed");
            }
        });
        true
    }

    /// Diagnostic rendering of the current slot ranges.
    pub fn verbose_slot_mapping(&self) -> String {
        self.slots.verbose()
    }

    /// Resolve slots to node addresses. `None` entries pick a random slot.
    pub fn addrs_by_slots(&self, slots: &[Option<u16>], read_only: bool) -> Result<Vec<String>> {
        self.slots.addrs_by_slots(slots, read_only)
    }

    /// Per-node pool statistics.
    pub fn stats(&self) -> HashMap<String, PoolStats> {
        self.registry.stats()
    }

    /// Checked-out connections across all node pools.
    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Idle connections across all node pools.
    pub fn idle_count(&self) -> usize {
        self.registry.idle_count()
    }

    /// Close every node pool and clear the slot table. Outstanding facades
    /// keep their borrowed connections but cannot obtain new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.registry.close_all();
        self.slots.clear();
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("cluster pool is closed");
        }
        Ok(())
    }

    pub(crate) async fn conn_for_addr(&self, addr: &str) -> Result<PooledConn> {
        self.ensure_open()?;
        self.registry.get_conn(addr).await
    }

    /// Borrow a connection for a slot, refreshing the table once when the
    /// slot has no known owner yet.
    pub(crate) async fn conn_for_slot(&self, slot: Option<u16>) -> Result<PooledConn> {
        self.ensure_open()?;
        if let Ok(addr) = self.slots.addr_for(slot, false) {
            return self.conn_for_addr(&addr).await;
        }
        self.reload_slot_mapping().await?;
        let addr = self.slots.addr_for(slot, false)?;
        self.conn_for_addr(&addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_pool_rejects_new_work() {
        let pool = ClusterPool::new(ClusterConfig::new(["127.0.0.1:7000"])).expect("pool");
        pool.close();
        let err = pool.conn_for_addr("127.0.0.1:7000").await.unwrap_err();
        assert!(err.to_string().contains("closed"));
        let err = pool.reload_slot_mapping().await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn reload_reports_when_every_candidate_fails() {
        // port 1 refuses connections on loopback
        let pool = ClusterPool::new(ClusterConfig::new(["127.0.0.1:1"])).expect("pool");
        let err = pool.reload_slot_mapping().await.unwrap_err();
        assert_eq!(err.to_string(), "all nodes failed");
        // the single-flight flag must be released after a failed pass
        let err = pool.reload_slot_mapping().await.unwrap_err();
        assert_eq!(err.to_string(), "all nodes failed");
    }
}
