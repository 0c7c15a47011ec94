use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use futures::future::join_all;
use hashbrown::HashMap;

use crate::cluster::{ClusterPool, RedirInfo, RedirKind};
use crate::pool::PooledConn;
use crate::protocol::{Command, RespValue};

/// Scatter/gather pipeline over a cluster.
///
/// Queued commands are grouped by destination node at flush time, each group
/// runs as one real pipeline on its node concurrently with the others, and
/// replies are read back in submission order regardless of how the fan-out
/// interleaved. Commands answered with MOVED/ASK get exactly one extra round
/// at the indicated node.
pub(crate) struct Pipeliner {
    pool: Arc<ClusterPool>,
    read_only: bool,
    commands: Vec<PipelinedCommand>,
    // batch connections, kept until the pipeline resets so a redirect round
    // can reuse them
    conns: HashMap<String, PooledConn>,
    flushed: bool,
    cursor: usize,
    fault: Option<String>,
}

struct PipelinedCommand {
    command: Command,
    reply: Option<RespValue>,
    error: Option<anyhow::Error>,
    redirect: Option<RedirInfo>,
}

struct BatchJob {
    addr: String,
    conn: Option<PooledConn>,
    items: Vec<(usize, Command)>,
}

impl Pipeliner {
    pub(crate) fn new(pool: Arc<ClusterPool>, read_only: bool) -> Self {
        Self {
            pool,
            read_only,
            commands: Vec::new(),
            conns: HashMap::new(),
            flushed: false,
            cursor: 0,
            fault: None,
        }
    }

    /// Queue a command. No I/O happens until [`flush`].
    ///
    /// [`flush`]: Pipeliner::flush
    pub(crate) fn send(&mut self, command: Command) {
        self.commands.push(PipelinedCommand {
            command,
            reply: None,
            error: None,
            redirect: None,
        });
    }

    /// Fan the queued commands out to their nodes and collect every reply.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        if self.flushed || self.commands.is_empty() {
            return Ok(());
        }

        let slots: Vec<Option<u16>> = self
            .commands
            .iter()
            .map(|entry| entry.command.slot())
            .collect();
        let addrs = match self.pool.addrs_by_slots(&slots, self.read_only) {
            Ok(addrs) => addrs,
            Err(err) => {
                self.fault = Some(format!("{err:#}"));
                return Err(err);
            }
        };

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, addr) in addrs.into_iter().enumerate() {
            groups
                .entry(addr.clone())
                .or_insert_with(|| {
                    order.push(addr);
                    Vec::new()
                })
                .push(index);
        }
        self.run_round(order, groups).await;

        // regroup everything that bounced; the round runs at most once
        let mut redirect_order: Vec<String> = Vec::new();
        let mut redirect_groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, entry) in self.commands.iter_mut().enumerate() {
            if let Some(info) = entry.redirect.take() {
                redirect_groups
                    .entry(info.addr.clone())
                    .or_insert_with(|| {
                        redirect_order.push(info.addr.clone());
                        Vec::new()
                    })
                    .push(index);
            }
        }
        if !redirect_groups.is_empty() {
            self.run_round(redirect_order, redirect_groups).await;
        }

        self.flushed = true;
        Ok(())
    }

    /// Hand out the next reply in submission order.
    ///
    /// Replies are already buffered, so this never touches the network;
    /// consuming the final reply resets the pipeline and returns its batch
    /// connections.
    pub(crate) fn receive(&mut self) -> Result<RespValue> {
        if !self.flushed {
            bail!("flush required before receive");
        }
        if self.cursor >= self.commands.len() {
            bail!("no more reply");
        }
        let entry = &mut self.commands[self.cursor];
        let outcome = match entry.error.take() {
            Some(err) => Err(err),
            None => Ok(entry.reply.take().unwrap_or(RespValue::NullBulk)),
        };
        self.cursor += 1;
        if self.cursor == self.commands.len() {
            self.reset();
        }
        outcome
    }

    /// Drop queued state and return every batch connection to its pool.
    pub(crate) fn reset(&mut self) {
        self.commands.clear();
        self.conns.clear();
        self.cursor = 0;
        self.flushed = false;
        self.fault = None;
    }

    pub(crate) fn fault(&self) -> Option<anyhow::Error> {
        self.fault.as_ref().map(|msg| anyhow!("{}", msg))
    }

    async fn run_round(&mut self, order: Vec<String>, mut groups: HashMap<String, Vec<usize>>) {
        let mut jobs = Vec::with_capacity(order.len());
        for addr in order {
            let indexes = groups.remove(&addr).unwrap_or_default();
            if indexes.is_empty() {
                continue;
            }
            let items: Vec<(usize, Command)> = indexes
                .into_iter()
                .map(|index| (index, self.commands[index].command.clone()))
                .collect();
            let conn = self.conns.remove(&addr);
            jobs.push(BatchJob { addr, conn, items });
        }

        let pool = Arc::clone(&self.pool);
        let outcomes = join_all(jobs.into_iter().map(|job| {
            let pool = Arc::clone(&pool);
            async move {
                let BatchJob { addr, conn, items } = job;
                let (conn, results) = run_batch(&pool, &addr, conn, items).await;
                (addr, conn, results)
            }
        }))
        .await;

        for (addr, conn, results) in outcomes {
            if let Some(conn) = conn {
                if conn.is_recyclable() {
                    self.conns.insert(addr, conn);
                }
            }
            for (index, outcome) in results {
                let entry = &mut self.commands[index];
                match outcome {
                    Ok(reply) => {
                        if let Some(info) = RedirInfo::parse(&reply) {
                            if info.kind == RedirKind::Moved {
                                self.pool.on_redirect(&info);
                            }
                            entry.redirect = Some(info);
                        }
                        entry.reply = Some(reply);
                        entry.error = None;
                    }
                    Err(err) => {
                        entry.reply = None;
                        entry.error = Some(err);
                        entry.redirect = None;
                    }
                }
            }
        }
    }
}

/// Run one batch as a real pipeline: send all, flush once, then one receive
/// per command in submission order. A transport failure before the replies
/// arrive marks every command of this batch and only this batch.
async fn run_batch(
    pool: &Arc<ClusterPool>,
    addr: &str,
    conn: Option<PooledConn>,
    items: Vec<(usize, Command)>,
) -> (Option<PooledConn>, Vec<(usize, Result<RespValue>)>) {
    let mut conn = match conn {
        Some(conn) => conn,
        None => match pool.conn_for_addr(addr).await {
            Ok(conn) => conn,
            Err(err) => return (None, fail_all(items, &format!("{err:#}"))),
        },
    };

    for (_, command) in &items {
        if let Err(err) = conn.send(command).await {
            return (Some(conn), fail_all(items, &format!("{err:#}")));
        }
    }
    if let Err(err) = conn.flush().await {
        return (Some(conn), fail_all(items, &format!("{err:#}")));
    }

    let mut results = Vec::with_capacity(items.len());
    for (index, _) in &items {
        results.push((*index, conn.receive().await));
    }
    (Some(conn), results)
}

fn fail_all(items: Vec<(usize, Command)>, msg: &str) -> Vec<(usize, Result<RespValue>)> {
    items
        .into_iter()
        .map(|(index, _)| (index, Err(anyhow!("{}", msg))))
        .collect()
}
