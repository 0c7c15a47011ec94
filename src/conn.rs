use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use tokio::time::timeout;

use crate::cluster::{ClusterPool, RedirInfo};
use crate::multi;
use crate::pipeline::Pipeliner;
use crate::pool::PooledConn;
use crate::protocol::{Command, RespValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastOp {
    None,
    Do,
    Pipeline,
}

/// Connection facade over the cluster.
///
/// One facade serves both traffic shapes: [`do_cmd`] for single commands
/// with automatic redirect chasing, and [`send`]/[`flush`]/[`receive`] for
/// pipelines. The facade caches the connection of the last `do_cmd` target
/// and is deliberately `&mut self` everywhere: a facade belongs to one task,
/// clone cheap facades from the pool instead of sharing one.
///
/// [`do_cmd`]: Conn::do_cmd
/// [`send`]: Conn::send
/// [`flush`]: Conn::flush
/// [`receive`]: Conn::receive
pub struct Conn {
    pool: Arc<ClusterPool>,
    redirecting: bool,
    read_only: bool,
    last_op: LastOp,
    cached: Option<(String, PooledConn)>,
    pipeline: Option<Pipeliner>,
}

impl Conn {
    pub(crate) fn new(pool: Arc<ClusterPool>, redirecting: bool, read_only: bool) -> Self {
        Self {
            pool,
            redirecting,
            read_only,
            last_op: LastOp::None,
            cached: None,
            pipeline: None,
        }
    }

    /// Issue one command to the node owning its slot and return the reply.
    ///
    /// MSET/MGET are rewritten into per-slot sub-commands (non-atomic across
    /// slots). A MOVED or ASK reply is chased exactly once when the facade
    /// was created with redirection enabled; the ASK retry is issued without
    /// a preceding ASKING frame, which a resharding cluster may refuse.
    pub async fn do_cmd(&mut self, name: &str, args: &[Bytes]) -> Result<RespValue> {
        self.pool.ensure_open()?;
        self.last_op = LastOp::Do;
        if name.eq_ignore_ascii_case("MSET") {
            return multi::multiset(&self.pool, args).await;
        }
        if name.eq_ignore_ascii_case("MGET") {
            return multi::multiget(&self.pool, args).await;
        }

        let command = Command::new(name, args);
        let slot = command.slot();
        // keyless commands stick to the node used last, when there is one
        let addr = match slot {
            None => self.cached.as_ref().map(|(addr, _)| addr.clone()),
            Some(_) => None,
        };
        let addr = match addr {
            Some(addr) => addr,
            None => {
                let mut addrs = self.pool.addrs_by_slots(&[slot], self.read_only)?;
                addrs
                    .pop()
                    .filter(|addr| !addr.is_empty())
                    .ok_or_else(|| anyhow!("empty node address"))?
            }
        };
        self.ensure_cached(&addr).await?;
        let (_, conn) = self.cached.as_mut().expect("connection cached above");
        let reply = conn.do_cmd(&command).await?;

        if !self.redirecting {
            return Ok(reply);
        }
        let info = match RedirInfo::parse(&reply) {
            Some(info) => info,
            None => return Ok(reply),
        };
        // MOVED updates the table and schedules a refresh; ASK does neither
        self.pool.on_redirect(&info);
        match self.pool.conn_for_addr(&info.addr).await {
            Ok(conn) => {
                self.cached = Some((info.addr.clone(), conn));
                let (_, conn) = self.cached.as_mut().expect("connection cached above");
                conn.do_cmd(&command).await
            }
            // redirect target unreachable: hand back the redirect reply
            Err(_) => Ok(reply),
        }
    }

    /// [`do_cmd`] bounded by a deadline.
    ///
    /// A timeout abandons the exchange mid-flight, so the cached connection
    /// is poisoned rather than recycled with an unread reply in its pipe.
    ///
    /// [`do_cmd`]: Conn::do_cmd
    pub async fn do_with_timeout(
        &mut self,
        limit: Duration,
        name: &str,
        args: &[Bytes],
    ) -> Result<RespValue> {
        match timeout(limit, self.do_cmd(name, args)).await {
            Ok(result) => result,
            Err(_) => {
                if let Some((_, conn)) = self.cached.as_mut() {
                    conn.poison("abandoned by deadline");
                }
                self.cached = None;
                Err(anyhow!("command timed out"))
            }
        }
    }

    /// Queue a command on the facade's pipeliner. No I/O happens here.
    pub fn send(&mut self, name: &str, args: &[Bytes]) {
        self.last_op = LastOp::Pipeline;
        let pool = Arc::clone(&self.pool);
        let read_only = self.read_only;
        self.pipeline
            .get_or_insert_with(|| Pipeliner::new(pool, read_only))
            .send(Command::new(name, args));
    }

    /// Fan queued commands out to their nodes and buffer every reply.
    pub async fn flush(&mut self) -> Result<()> {
        self.last_op = LastOp::Pipeline;
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.flush().await,
            None => Ok(()),
        }
    }

    /// Next buffered reply, in the order the commands were sent.
    pub fn receive(&mut self) -> Result<RespValue> {
        self.last_op = LastOp::Pipeline;
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.receive(),
            None => bail!("no send request before"),
        }
    }

    /// Same as [`receive`]; the deadline is ignored because replies were
    /// already buffered by the flush.
    ///
    /// [`receive`]: Conn::receive
    pub fn receive_with_timeout(&mut self, _limit: Duration) -> Result<RespValue> {
        self.receive()
    }

    /// Release the cached connection and any pipeline state.
    pub fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.reset();
        }
        self.cached = None;
    }

    /// Error state of whichever path the facade used last.
    pub fn err(&self) -> Option<anyhow::Error> {
        match self.last_op {
            LastOp::Do => self.cached.as_ref().and_then(|(_, conn)| conn.fault()),
            LastOp::Pipeline => self.pipeline.as_ref().and_then(|p| p.fault()),
            LastOp::None => None,
        }
    }

    async fn ensure_cached(&mut self, addr: &str) -> Result<()> {
        let reusable = matches!(
            &self.cached,
            Some((cached_addr, conn)) if cached_addr == addr && conn.is_healthy()
        );
        if !reusable {
            let conn = self.pool.conn_for_addr(addr).await?;
            // the previous connection, if any, returns to its pool here
            self.cached = Some((addr.to_string(), conn));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn facade() -> Conn {
        let pool = ClusterPool::new(ClusterConfig::new(["127.0.0.1:7000"])).expect("pool");
        pool.conn()
    }

    #[tokio::test]
    async fn receive_without_send_is_a_usage_error() {
        let mut conn = facade();
        let err = conn.receive().unwrap_err();
        assert_eq!(err.to_string(), "no send request before");
    }

    #[tokio::test]
    async fn fresh_facade_reports_no_error() {
        let conn = facade();
        assert!(conn.err().is_none());
    }

    #[tokio::test]
    async fn routed_command_with_empty_table_reports_bad_mapping() {
        let mut conn = facade();
        let err = conn
            .do_cmd("GET", &[Bytes::from_static(b"k")])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad slot mapping");
    }
}
