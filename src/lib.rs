//! Slot-aware Redis Cluster client.
//!
//! A [`ClusterPool`] keeps an eventually-consistent map of the cluster's
//! 16384 hash slots and one connection pool per node. The [`Conn`] facades
//! it hands out make the cluster feel like a single node: single commands
//! are routed by key slot and chase MOVED/ASK redirections once, pipelines
//! are split into per-node batches that run concurrently and are read back
//! in submission order, and MSET/MGET are rewritten into per-slot
//! sub-commands (without cross-slot atomicity).
//!
//! ```no_run
//! use bytes::Bytes;
//! use floret::{ClusterConfig, ClusterPool};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let pool = ClusterPool::new(ClusterConfig::new(["127.0.0.1:7000"]))?;
//! pool.reload_slot_mapping().await?;
//!
//! let mut conn = pool.conn();
//! conn.do_cmd("SET", &[Bytes::from("greeting"), Bytes::from("hi")])
//!     .await?;
//! let reply = conn.do_cmd("GET", &[Bytes::from("greeting")]).await?;
//! println!("{reply:?}");
//! # Ok(())
//! # }
//! ```

mod cluster;
mod config;
mod conn;
mod multi;
mod node;
mod pipeline;
mod pool;
mod protocol;
mod pubsub;
mod utils;

pub use cluster::{
    parse_cluster_slots, ClusterPool, RedirInfo, RedirKind, SlotLayout, SlotNode, SlotRange,
    SlotTable,
};
pub use config::{ClusterConfig, DialConfig, PoolConfig};
pub use conn::Conn;
pub use node::NodeConnection;
pub use pool::{
    BorrowCheck, NodePool, NodePoolRegistry, PingOnBorrow, PoolFactory, PoolOptions, PoolStats,
    PooledConn,
};
pub use protocol::{Command, RespCodec, RespValue};
pub use pubsub::{PubSubConn, PubSubMessage, ShardedPubSubConn, SubscriptionKind};
pub use utils::{crc16, hash_slot, hash_tag, SLOT_COUNT};
