use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use hashbrown::HashMap;

use crate::cluster::ClusterPool;
use crate::pipeline::Pipeliner;
use crate::protocol::{Command, RespValue};
use crate::utils::hash_slot;

// MSET/MGET span slots, which a cluster node refuses, so both are rewritten
// into one sub-command per slot and pushed through a private pipeliner.
// There is no cross-slot atomicity: a failed group does not undo the others.

/// `MSET k1 v1 … kn vn` split by key slot. The reply is the last group's
/// reply; an error reply from any group is returned as-is.
pub(crate) async fn multiset(pool: &Arc<ClusterPool>, args: &[Bytes]) -> Result<RespValue> {
    if args.is_empty() {
        return Ok(RespValue::NullBulk);
    }
    if args.len() % 2 != 0 {
        bail!("mset requires key-value pairs");
    }

    let mut order: Vec<u16> = Vec::new();
    let mut groups: HashMap<u16, Vec<Bytes>> = HashMap::new();
    for pair in args.chunks(2) {
        let slot = hash_slot(&pair[0]);
        groups
            .entry(slot)
            .or_insert_with(|| {
                order.push(slot);
                Vec::new()
            })
            .extend_from_slice(pair);
    }

    let mut pipeline = Pipeliner::new(Arc::clone(pool), false);
    for slot in &order {
        pipeline.send(Command::new("MSET", &groups[slot]));
    }
    pipeline.flush().await?;

    let mut last = RespValue::NullBulk;
    for _ in &order {
        let reply = pipeline.receive()?;
        if reply.is_error() {
            return Ok(reply);
        }
        last = reply;
    }
    Ok(last)
}

/// `MGET k1 … kn` split by key slot, with the per-slot reply arrays folded
/// back into one array in the original key order. A group whose reply does
/// not line up with its key count contributes nulls for its positions.
pub(crate) async fn multiget(pool: &Arc<ClusterPool>, args: &[Bytes]) -> Result<RespValue> {
    if args.is_empty() {
        return Ok(RespValue::NullArray);
    }

    let mut order: Vec<u16> = Vec::new();
    let mut keys: HashMap<u16, Vec<Bytes>> = HashMap::new();
    let mut positions: HashMap<u16, Vec<usize>> = HashMap::new();
    for (index, key) in args.iter().enumerate() {
        let slot = hash_slot(key);
        keys.entry(slot)
            .or_insert_with(|| {
                order.push(slot);
                Vec::new()
            })
            .push(key.clone());
        positions.entry(slot).or_default().push(index);
    }

    let mut pipeline = Pipeliner::new(Arc::clone(pool), false);
    for slot in &order {
        pipeline.send(Command::new("MGET", &keys[slot]));
    }
    pipeline.flush().await?;

    let mut results: Vec<RespValue> = vec![RespValue::NullBulk; args.len()];
    for slot in &order {
        let reply = pipeline.receive()?;
        if reply.is_error() {
            return Ok(reply);
        }
        let slot_positions = &positions[slot];
        if let Some(values) = reply.as_array() {
            if values.len() == slot_positions.len() {
                for (offset, &position) in slot_positions.iter().enumerate() {
                    results[position] = values[offset].clone();
                }
            }
        }
    }
    Ok(RespValue::Array(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn pool() -> Arc<ClusterPool> {
        ClusterPool::new(ClusterConfig::new(["127.0.0.1:7000"])).expect("pool")
    }

    #[tokio::test]
    async fn mset_rejects_odd_argument_counts() {
        let args = vec![Bytes::from_static(b"k1"), Bytes::from_static(b"v1"), Bytes::from_static(b"k2")];
        let err = multiset(&pool(), &args).await.unwrap_err();
        assert_eq!(err.to_string(), "mset requires key-value pairs");
    }

    #[tokio::test]
    async fn empty_argument_lists_short_circuit() {
        assert_eq!(multiset(&pool(), &[]).await.expect("mset"), RespValue::NullBulk);
        assert_eq!(multiget(&pool(), &[]).await.expect("mget"), RespValue::NullArray);
    }
}
