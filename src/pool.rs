use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use crate::config::{ClusterConfig, DialConfig, PoolConfig};
use crate::node::NodeConnection;
use crate::protocol::Command;

/// Predicate run against an idle connection before it is handed out.
#[async_trait]
pub trait BorrowCheck: Send + Sync {
    async fn check(&self, conn: &mut NodeConnection, idle_for: Duration) -> Result<()>;
}

/// Default borrow check: PING connections that sat idle longer than `after`.
pub struct PingOnBorrow {
    pub after: Duration,
}

impl Default for PingOnBorrow {
    fn default() -> Self {
        Self {
            after: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl BorrowCheck for PingOnBorrow {
    async fn check(&self, conn: &mut NodeConnection, idle_for: Duration) -> Result<()> {
        if idle_for < self.after {
            return Ok(());
        }
        let reply = conn.do_cmd(&Command::new("PING", &[])).await?;
        if reply.is_error() {
            bail!("borrow check ping rejected");
        }
        Ok(())
    }
}

/// Tuning for one node pool.
#[derive(Clone)]
pub struct PoolOptions {
    pub dial: DialConfig,
    pub max_idle: usize,
    pub max_active: usize,
    pub idle_timeout: Option<Duration>,
    pub borrow_check: Option<Arc<dyn BorrowCheck>>,
}

impl PoolOptions {
    pub fn from_config(dial: &DialConfig, pool: &PoolConfig) -> Self {
        let borrow_check = pool
            .test_on_borrow
            .then(|| Arc::new(PingOnBorrow::default()) as Arc<dyn BorrowCheck>);
        Self {
            dial: dial.clone(),
            max_idle: pool.max_idle,
            max_active: pool.max_active.max(1),
            idle_timeout: pool.idle_timeout(),
            borrow_check,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
}

/// Connection pool for a single node address.
///
/// Checkouts dial lazily; returned connections are recycled through an idle
/// queue unless they carry a sticky fault or the pool is already full.
pub struct NodePool {
    addr: String,
    options: PoolOptions,
    idle: Mutex<VecDeque<IdleEntry>>,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    closed: AtomicBool,
}

struct IdleEntry {
    conn: NodeConnection,
    since: Instant,
}

impl NodePool {
    pub fn new(addr: impl Into<String>, options: PoolOptions) -> Self {
        let max_active = options.max_active.max(1);
        Self {
            addr: addr.into(),
            options,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max_active)),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Borrow a connection, waiting for a free slot up to `deadline`.
    /// Takes an `Arc` because the returned guard keeps a handle to the pool
    /// for recycling.
    pub async fn checkout(self: Arc<Self>, deadline: Option<Duration>) -> Result<PooledConn> {
        if self.closed.load(Ordering::Acquire) {
            bail!("node pool for {} is closed", self.addr);
        }
        let acquired = match deadline {
            Some(limit) => timeout(limit, Arc::clone(&self.permits).acquire_owned())
                .await
                .map_err(|_| anyhow!("pool checkout for {} timed out", self.addr))?,
            None => Arc::clone(&self.permits).acquire_owned().await,
        };
        let permit = acquired.map_err(|_| anyhow!("node pool for {} is closed", self.addr))?;

        while let Some(mut entry) = self.pop_idle() {
            if let Some(limit) = self.options.idle_timeout {
                if entry.since.elapsed() > limit {
                    continue;
                }
            }
            if let Some(check) = &self.options.borrow_check {
                if let Err(err) = check.check(&mut entry.conn, entry.since.elapsed()).await {
                    debug!(addr = %self.addr, error = %err, "discarding idle connection");
                    continue;
                }
            }
            self.active.fetch_add(1, Ordering::AcqRel);
            return Ok(PooledConn::pooled(entry.conn, self, permit));
        }

        let conn = NodeConnection::connect(&self.addr, &self.options.dial).await?;
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(PooledConn::pooled(conn, self, permit))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::Acquire),
            idle: self.idle.lock().len(),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle.lock().clear();
    }

    fn pop_idle(&self) -> Option<IdleEntry> {
        self.idle.lock().pop_front()
    }

    fn give_back(&self, conn: NodeConnection) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) || !conn.is_recyclable() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.options.max_idle {
            idle.push_back(IdleEntry {
                conn,
                since: Instant::now(),
            });
        }
    }
}

/// A borrowed node connection.
///
/// Dropping the guard recycles healthy connections into their pool; faulted
/// connections and connections dialed without a pool are torn down instead.
pub struct PooledConn {
    conn: Option<NodeConnection>,
    home: Option<Arc<NodePool>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("conn", &self.conn.is_some())
            .field("home", &self.home.is_some())
            .finish()
    }
}

impl PooledConn {
    fn pooled(conn: NodeConnection, home: Arc<NodePool>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            home: Some(home),
            _permit: Some(permit),
        }
    }

    pub(crate) fn unpooled(conn: NodeConnection) -> Self {
        Self {
            conn: Some(conn),
            home: None,
            _permit: None,
        }
    }
}

impl Deref for PooledConn {
    type Target = NodeConnection;

    fn deref(&self) -> &NodeConnection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut NodeConnection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let (Some(conn), Some(home)) = (self.conn.take(), self.home.take()) {
            home.give_back(conn);
        }
    }
}

/// Hook for callers that want full control over pool construction.
pub trait PoolFactory: Send + Sync {
    /// Build the pool serving `addr`. Called once per address, the first
    /// time a connection for it is requested.
    fn create_pool(&self, addr: &str) -> Result<NodePool>;
}

/// Lazily instantiated pool-per-address map.
///
/// With neither a factory nor pool configuration, every checkout is a raw
/// dial and dropping the guard closes the socket for real.
pub struct NodePoolRegistry {
    pools: RwLock<HashMap<String, Arc<NodePool>>>,
    factory: Option<Arc<dyn PoolFactory>>,
    pool_options: Option<PoolOptions>,
    dial: DialConfig,
    checkout_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl NodePoolRegistry {
    pub fn new(config: &ClusterConfig, factory: Option<Arc<dyn PoolFactory>>) -> Self {
        let pool_options = config
            .pool
            .as_ref()
            .map(|pool| PoolOptions::from_config(&config.dial, pool));
        Self {
            pools: RwLock::new(HashMap::new()),
            factory,
            pool_options,
            dial: config.dial.clone(),
            checkout_timeout: config.pool_timeout(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn get_conn(&self, addr: &str) -> Result<PooledConn> {
        if addr.is_empty() {
            bail!("empty node address");
        }
        if self.closed.load(Ordering::Acquire) {
            bail!("pool registry is closed");
        }
        if self.factory.is_none() && self.pool_options.is_none() {
            let conn = NodeConnection::connect(addr, &self.dial).await?;
            return Ok(PooledConn::unpooled(conn));
        }
        let pool = self.pool_for(addr)?;
        pool.checkout(self.checkout_timeout).await
    }

    pub fn stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .read()
            .iter()
            .map(|(addr, pool)| (addr.clone(), pool.stats()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.pools.read().values().map(|p| p.stats().active).sum()
    }

    pub fn idle_count(&self) -> usize {
        self.pools.read().values().map(|p| p.stats().idle).sum()
    }

    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Arc<NodePool>> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in drained {
            pool.close();
        }
    }

    fn pool_for(&self, addr: &str) -> Result<Arc<NodePool>> {
        if let Some(pool) = self.pools.read().get(addr) {
            return Ok(Arc::clone(pool));
        }
        let mut pools = self.pools.write();
        // lost the race: another caller may have created it meanwhile
        if let Some(pool) = pools.get(addr) {
            return Ok(Arc::clone(pool));
        }
        let pool = match (&self.factory, &self.pool_options) {
            (Some(factory), _) => factory.create_pool(addr)?,
            (None, Some(options)) => NodePool::new(addr, options.clone()),
            (None, None) => unreachable!("raw dial handled before pool lookup"),
        };
        let pool = Arc::new(pool);
        pools.insert(addr.to_string(), Arc::clone(&pool));
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn accept_counting_server() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut socket, _)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            // hold the socket open; never reply
                            let _ = socket.write_all(b"").await;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
        (addr, accepted)
    }

    fn options() -> PoolOptions {
        PoolOptions {
            dial: DialConfig::default(),
            max_idle: 4,
            max_active: 4,
            idle_timeout: None,
            borrow_check: None,
        }
    }

    #[tokio::test]
    async fn checkout_recycles_idle_connections() {
        let (addr, accepted) = accept_counting_server().await;
        let pool = Arc::new(NodePool::new(addr.to_string(), options()));

        let conn = Arc::clone(&pool).checkout(None).await.expect("checkout");
        assert_eq!(pool.stats(), PoolStats { active: 1, idle: 0 });
        drop(conn);
        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 1 });

        let _conn = Arc::clone(&pool).checkout(None).await.expect("checkout");
        assert_eq!(accepted.load(Ordering::SeqCst), 1, "idle conn reused");
    }

    #[tokio::test]
    async fn max_active_bounds_concurrent_checkouts() {
        let (addr, _accepted) = accept_counting_server().await;
        let mut opts = options();
        opts.max_active = 1;
        let pool = Arc::new(NodePool::new(addr.to_string(), opts));

        let held = Arc::clone(&pool).checkout(None).await.expect("checkout");
        let err = Arc::clone(&pool)
            .checkout(Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        drop(held);
        pool.checkout(Some(Duration::from_millis(200)))
            .await
            .expect("slot freed by drop");
    }

    #[tokio::test]
    async fn registry_without_pool_config_dials_fresh_connections() {
        let (addr, accepted) = accept_counting_server().await;
        let config = ClusterConfig::new([addr.to_string()]);
        let registry = NodePoolRegistry::new(&config, None);

        let first = registry.get_conn(&addr.to_string()).await.expect("conn");
        drop(first);
        let _second = registry.get_conn(&addr.to_string()).await.expect("conn");
        assert_eq!(accepted.load(Ordering::SeqCst), 2, "no recycling without a pool");
        assert!(registry.stats().is_empty());
    }

    #[tokio::test]
    async fn close_all_rejects_further_checkouts() {
        let (addr, _accepted) = accept_counting_server().await;
        let mut config = ClusterConfig::new([addr.to_string()]);
        config.pool = Some(PoolConfig::default());
        let registry = NodePoolRegistry::new(&config, None);

        let conn = registry.get_conn(&addr.to_string()).await.expect("conn");
        drop(conn);
        registry.close_all();
        let err = registry.get_conn(&addr.to_string()).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
