use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;

use crate::cluster::ClusterPool;
use crate::pool::PooledConn;
use crate::protocol::{Command, RespValue};
use crate::utils::hash_slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    SSubscribe,
    SUnsubscribe,
}

/// A decoded pub/sub push frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubMessage {
    /// `message` and `smessage` payloads.
    Message { channel: Bytes, payload: Bytes },
    /// `pmessage` payloads, carrying the matching pattern.
    PMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
    /// Subscription acknowledgements with the remaining subscription count.
    Subscription {
        kind: SubscriptionKind,
        channel: Bytes,
        count: i64,
    },
    Pong(Bytes),
}

/// Pub/sub wrapper around one real node connection.
///
/// Plain channels are cluster-global, so the connection may live on any
/// node; [`ClusterPool::pubsub_conn`] picks one at random.
pub struct PubSubConn {
    conn: PooledConn,
}

impl PubSubConn {
    pub(crate) fn new(conn: PooledConn) -> Self {
        Self { conn }
    }

    pub async fn subscribe(&mut self, channels: &[Bytes]) -> Result<()> {
        self.push("SUBSCRIBE", channels).await
    }

    pub async fn unsubscribe(&mut self, channels: &[Bytes]) -> Result<()> {
        self.push("UNSUBSCRIBE", channels).await
    }

    pub async fn psubscribe(&mut self, patterns: &[Bytes]) -> Result<()> {
        self.push("PSUBSCRIBE", patterns).await
    }

    pub async fn punsubscribe(&mut self, patterns: &[Bytes]) -> Result<()> {
        self.push("PUNSUBSCRIBE", patterns).await
    }

    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.push("PING", &[Bytes::copy_from_slice(payload)]).await
    }

    /// Wait for the next push frame.
    pub async fn receive(&mut self) -> Result<PubSubMessage> {
        let frame = self.conn.receive().await?;
        parse_push(frame)
    }

    pub async fn receive_with_timeout(&mut self, limit: Duration) -> Result<PubSubMessage> {
        let frame = self.conn.receive_timeout(limit).await?;
        parse_push(frame)
    }

    async fn push(&mut self, name: &str, args: &[Bytes]) -> Result<()> {
        let command = Command::new(name, args);
        self.conn.send(&command).await?;
        self.conn.flush().await
    }
}

/// Sharded pub/sub wrapper.
///
/// Sharded channels live on the node owning their slot, so `ssubscribe`
/// checks that all requested channels share one slot and holds a connection
/// to that slot's owner.
pub struct ShardedPubSubConn {
    pool: Arc<ClusterPool>,
    conn: Option<PooledConn>,
}

impl ShardedPubSubConn {
    pub(crate) fn new(pool: Arc<ClusterPool>) -> Self {
        Self { pool, conn: None }
    }

    /// Subscribe to sharded channels, all of which must map to one slot.
    /// Any previously held connection is dropped first.
    pub async fn ssubscribe(&mut self, channels: &[Bytes]) -> Result<()> {
        let slot = common_slot(channels)?;
        self.conn = None;
        let mut conn = self.pool.conn_for_slot(slot).await?;
        let command = Command::new("SSUBSCRIBE", channels);
        conn.send(&command).await?;
        conn.flush().await?;
        self.conn = Some(conn);
        Ok(())
    }

    pub async fn sunsubscribe(&mut self, channels: &[Bytes]) -> Result<()> {
        self.push("SUNSUBSCRIBE", channels).await
    }

    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.push("PING", &[Bytes::copy_from_slice(payload)]).await
    }

    pub async fn receive(&mut self) -> Result<PubSubMessage> {
        let conn = self.active()?;
        let frame = conn.receive().await?;
        parse_push(frame)
    }

    pub async fn receive_with_timeout(&mut self, limit: Duration) -> Result<PubSubMessage> {
        let conn = self.active()?;
        let frame = conn.receive_timeout(limit).await?;
        parse_push(frame)
    }

    pub fn close(&mut self) {
        self.conn = None;
    }

    async fn push(&mut self, name: &str, args: &[Bytes]) -> Result<()> {
        let command = Command::new(name, args);
        let conn = self.active()?;
        conn.send(&command).await?;
        conn.flush().await
    }

    fn active(&mut self) -> Result<&mut PooledConn> {
        self.conn
            .as_mut()
            .ok_or_else(|| anyhow!("no active subscription connection"))
    }
}

/// Single slot shared by all channels, or `None` when no channel names one.
pub(crate) fn common_slot(channels: &[Bytes]) -> Result<Option<u16>> {
    let mut slot = None;
    for channel in channels {
        if channel.is_empty() {
            continue;
        }
        let candidate = hash_slot(channel);
        match slot {
            None => slot = Some(candidate),
            Some(existing) if existing != candidate => {
                bail!("channels must be in the same slot")
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

fn parse_push(frame: RespValue) -> Result<PubSubMessage> {
    let items = frame
        .as_array()
        .ok_or_else(|| anyhow!("pubsub notification must be an array"))?;
    let kind = items
        .first()
        .and_then(|item| item.as_bytes())
        .ok_or_else(|| anyhow!("pubsub notification missing kind"))?;

    match kind.as_ref() {
        b"message" | b"smessage" if items.len() >= 3 => Ok(PubSubMessage::Message {
            channel: string_field(&items[1])?,
            payload: string_field(&items[2])?,
        }),
        b"pmessage" if items.len() >= 4 => Ok(PubSubMessage::PMessage {
            pattern: string_field(&items[1])?,
            channel: string_field(&items[2])?,
            payload: string_field(&items[3])?,
        }),
        b"subscribe" | b"unsubscribe" | b"psubscribe" | b"punsubscribe" | b"ssubscribe"
        | b"sunsubscribe"
            if items.len() >= 3 =>
        {
            let kind = match kind.as_ref() {
                b"subscribe" => SubscriptionKind::Subscribe,
                b"unsubscribe" => SubscriptionKind::Unsubscribe,
                b"psubscribe" => SubscriptionKind::PSubscribe,
                b"punsubscribe" => SubscriptionKind::PUnsubscribe,
                b"ssubscribe" => SubscriptionKind::SSubscribe,
                _ => SubscriptionKind::SUnsubscribe,
            };
            let count = items[2]
                .as_integer()
                .ok_or_else(|| anyhow!("subscription count must be an integer"))?;
            Ok(PubSubMessage::Subscription {
                kind,
                channel: string_field(&items[1])?,
                count,
            })
        }
        b"pong" => {
            let payload = items
                .get(1)
                .and_then(|item| item.as_bytes())
                .cloned()
                .unwrap_or_default();
            Ok(PubSubMessage::Pong(payload))
        }
        other => bail!(
            "unknown pubsub notification '{}'",
            String::from_utf8_lossy(other)
        ),
    }
}

fn string_field(value: &RespValue) -> Result<Bytes> {
    value
        .as_bytes()
        .cloned()
        .ok_or_else(|| anyhow!("pubsub field must be a string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_and_smessage_alike() {
        for kind in ["message", "smessage"] {
            let frame = RespValue::Array(vec![
                RespValue::bulk(kind),
                RespValue::bulk("news"),
                RespValue::bulk("hello"),
            ]);
            assert_eq!(
                parse_push(frame).expect("parse"),
                PubSubMessage::Message {
                    channel: Bytes::from_static(b"news"),
                    payload: Bytes::from_static(b"hello"),
                }
            );
        }
    }

    #[test]
    fn parses_pmessage_with_pattern() {
        let frame = RespValue::Array(vec![
            RespValue::bulk("pmessage"),
            RespValue::bulk("news.*"),
            RespValue::bulk("news.tech"),
            RespValue::bulk("hello"),
        ]);
        assert_eq!(
            parse_push(frame).expect("parse"),
            PubSubMessage::PMessage {
                pattern: Bytes::from_static(b"news.*"),
                channel: Bytes::from_static(b"news.tech"),
                payload: Bytes::from_static(b"hello"),
            }
        );
    }

    #[test]
    fn parses_subscription_acks() {
        let frame = RespValue::Array(vec![
            RespValue::bulk("ssubscribe"),
            RespValue::bulk("news"),
            RespValue::Integer(1),
        ]);
        assert_eq!(
            parse_push(frame).expect("parse"),
            PubSubMessage::Subscription {
                kind: SubscriptionKind::SSubscribe,
                channel: Bytes::from_static(b"news"),
                count: 1,
            }
        );
    }

    #[test]
    fn rejects_unknown_notifications() {
        let frame = RespValue::Array(vec![RespValue::bulk("invalidate"), RespValue::bulk("x")]);
        assert!(parse_push(frame).is_err());
    }

    #[test]
    fn common_slot_requires_one_slot() {
        let same = [Bytes::from_static(b"{tag}a"), Bytes::from_static(b"{tag}b")];
        assert_eq!(common_slot(&same).expect("slot"), Some(hash_slot(b"tag")));

        let mixed = [Bytes::from_static(b"foo"), Bytes::from_static(b"bar")];
        let err = common_slot(&mixed).unwrap_err();
        assert_eq!(err.to_string(), "channels must be in the same slot");

        assert_eq!(common_slot(&[]).expect("slot"), None);
    }
}
