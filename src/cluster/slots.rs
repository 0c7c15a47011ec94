use std::fmt::Write as _;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::protocol::RespValue;
use crate::utils::{random_index, random_slot, SLOT_COUNT};

use super::redirect::{RedirInfo, RedirKind};

/// One endpoint from a `CLUSTER SLOTS` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotNode {
    pub addr: String,
    pub id: String,
}

/// A contiguous slot range and its owners, primary first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub nodes: Vec<SlotNode>,
}

/// Parsed topology snapshot, ready to install into a [`SlotTable`].
#[derive(Debug, Clone)]
pub struct SlotLayout {
    owners: Vec<Vec<String>>,
    ranges: Vec<SlotRange>,
}

/// Parse the nested `CLUSTER SLOTS` reply:
/// an array of `[start, end, [host, port, id?], (replica endpoint)*]`.
pub fn parse_cluster_slots(reply: &RespValue) -> Result<SlotLayout> {
    let entries = match reply.as_array() {
        Some(entries) => entries,
        None => bail!("CLUSTER SLOTS reply must be an array"),
    };

    let mut owners = vec![Vec::new(); SLOT_COUNT as usize];
    let mut ranges = Vec::with_capacity(entries.len());

    for entry in entries {
        let fields = match entry.as_array() {
            Some(fields) if fields.len() >= 3 => fields,
            _ => bail!("slot entry must contain start, end and a primary endpoint"),
        };
        let start = extract_slot(&fields[0])?;
        let end = extract_slot(&fields[1])?;
        if start > end {
            bail!("slot range {}-{} is inverted", start, end);
        }

        let nodes = fields[2..]
            .iter()
            .map(extract_endpoint)
            .collect::<Result<Vec<_>>>()?;
        let addrs: Vec<String> = nodes.iter().map(|node| node.addr.clone()).collect();
        for slot in start..=end {
            owners[slot as usize] = addrs.clone();
        }
        ranges.push(SlotRange { start, end, nodes });
    }

    Ok(SlotLayout { owners, ranges })
}

fn extract_slot(value: &RespValue) -> Result<u16> {
    let raw = match value.as_integer() {
        Some(raw) if raw >= 0 => raw,
        _ => bail!("slot bound must be a non-negative integer"),
    };
    if raw >= i64::from(SLOT_COUNT) {
        bail!("slot {} out of range", raw);
    }
    Ok(raw as u16)
}

fn extract_endpoint(value: &RespValue) -> Result<SlotNode> {
    let fields = match value.as_array() {
        Some(fields) if fields.len() >= 2 => fields,
        _ => bail!("endpoint must be an array of host and port"),
    };
    let host = match fields[0].as_bytes() {
        Some(host) => std::str::from_utf8(host)?.to_string(),
        None => bail!("endpoint host must be a string"),
    };
    let port = match fields[1].as_integer() {
        Some(port) => port,
        None => bail!("endpoint port must be an integer"),
    };
    let id = fields
        .get(2)
        .and_then(|field| field.as_bytes())
        .map(|id| String::from_utf8_lossy(id).into_owned())
        .unwrap_or_default();
    Ok(SlotNode {
        addr: format!("{}:{}", host, port),
        id,
    })
}

struct TableState {
    owners: Vec<Vec<String>>,
    ranges: Vec<SlotRange>,
    reloading: bool,
}

/// The slot→owners routing table.
///
/// A snapshot stays readable while a replacement is being fetched; installs
/// swap the whole table under the lock. The `reloading` flag collapses
/// concurrent refresh attempts into one.
pub struct SlotTable {
    state: Mutex<TableState>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                owners: vec![Vec::new(); SLOT_COUNT as usize],
                ranges: Vec::new(),
                reloading: false,
            }),
        }
    }

    /// Atomically replace the table with a freshly parsed layout.
    pub fn install(&self, layout: SlotLayout) {
        let mut state = self.state.lock();
        state.owners = layout.owners;
        state.ranges = layout.ranges;
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.owners = vec![Vec::new(); SLOT_COUNT as usize];
        state.ranges.clear();
    }

    /// Claim the reload. `false` means another caller already holds it.
    pub fn begin_reload(&self) -> bool {
        let mut state = self.state.lock();
        if state.reloading {
            return false;
        }
        state.reloading = true;
        true
    }

    pub fn finish_reload(&self) {
        self.state.lock().reloading = false;
    }

    /// Resolve one slot to an address. `None` draws a random slot first.
    pub fn addr_for(&self, slot: Option<u16>, read_only: bool) -> Result<String> {
        self.addrs_by_slots(&[slot], read_only)
            .map(|mut addrs| addrs.remove(0))
    }

    /// Resolve a batch of slots in one locked pass.
    ///
    /// Writes go to the primary. Reads prefer a replica: the only one when a
    /// single replica exists, a uniformly random one otherwise, falling back
    /// to the primary for slots with no replica at all.
    pub fn addrs_by_slots(&self, slots: &[Option<u16>], read_only: bool) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut addrs = Vec::with_capacity(slots.len());
        for slot in slots {
            let slot = match slot {
                Some(slot) if *slot >= SLOT_COUNT => bail!("invalid slot"),
                Some(slot) => *slot,
                None => random_slot(),
            };
            let owners = &state.owners[slot as usize];
            if owners.is_empty() {
                bail!("bad slot mapping");
            }
            let addr = if read_only && owners.len() > 1 {
                match owners.len() {
                    2 => owners[1].clone(),
                    n => owners[1 + random_index(n - 1)].clone(),
                }
            } else {
                owners[0].clone()
            };
            addrs.push(addr);
        }
        Ok(addrs)
    }

    /// Apply a redirection hint.
    ///
    /// Only MOVED mutates: the slot's owners become just the indicated
    /// address until the next reload lands. Returns whether the caller
    /// should schedule that reload; a MOVED that merely confirms the current
    /// primary (a replica-to-primary bounce) changes nothing.
    pub fn on_redirect(&self, info: &RedirInfo) -> bool {
        if info.kind != RedirKind::Moved || info.slot >= SLOT_COUNT {
            return false;
        }
        let mut state = self.state.lock();
        let owners = &mut state.owners[info.slot as usize];
        if owners.first().map(String::as_str) == Some(info.addr.as_str()) {
            return false;
        }
        *owners = vec![info.addr.clone()];
        true
    }

    /// Every node the table currently knows, primaries first, deduplicated.
    pub fn known_nodes(&self, include_replicas: bool) -> Vec<String> {
        let state = self.state.lock();
        let mut nodes = Vec::new();
        for range in &state.ranges {
            for (index, node) in range.nodes.iter().enumerate() {
                if index > 0 && !include_replicas {
                    continue;
                }
                if !nodes.contains(&node.addr) {
                    nodes.push(node.addr.clone());
                }
            }
        }
        nodes
    }

    /// Human-readable dump of the current ranges, for diagnostics.
    pub fn verbose(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        for (index, range) in state.ranges.iter().enumerate() {
            let _ = writeln!(out, "{}) slots {} - {}", index + 1, range.start, range.end);
            for (position, node) in range.nodes.iter().enumerate() {
                let role = if position == 0 { " (primary)" } else { "" };
                let _ = writeln!(
                    out,
                    "   node {}: {} {}{}",
                    position + 1,
                    node.addr,
                    node.id,
                    role
                );
            }
        }
        out
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn endpoint(host: &str, port: i64, id: &str) -> RespValue {
        RespValue::Array(vec![
            RespValue::BulkString(Bytes::copy_from_slice(host.as_bytes())),
            RespValue::Integer(port),
            RespValue::BulkString(Bytes::copy_from_slice(id.as_bytes())),
        ])
    }

    fn sample_reply() -> RespValue {
        RespValue::Array(vec![
            RespValue::Array(vec![
                RespValue::Integer(0),
                RespValue::Integer(8191),
                endpoint("127.0.0.1", 7000, "aaa"),
                endpoint("127.0.0.1", 7001, "bbb"),
            ]),
            RespValue::Array(vec![
                RespValue::Integer(8192),
                RespValue::Integer(16383),
                endpoint("127.0.0.1", 7002, "ccc"),
            ]),
        ])
    }

    fn loaded_table() -> SlotTable {
        let table = SlotTable::new();
        table.install(parse_cluster_slots(&sample_reply()).expect("layout"));
        table
    }

    #[test]
    fn parses_ranges_and_owners() {
        let table = loaded_table();
        assert_eq!(
            table.addr_for(Some(100), false).expect("addr"),
            "127.0.0.1:7000"
        );
        assert_eq!(
            table.addr_for(Some(16383), false).expect("addr"),
            "127.0.0.1:7002"
        );
    }

    #[test]
    fn read_only_prefers_the_single_replica() {
        let table = loaded_table();
        assert_eq!(
            table.addr_for(Some(100), true).expect("addr"),
            "127.0.0.1:7001"
        );
        // no replica: fall back to the primary
        assert_eq!(
            table.addr_for(Some(9000), true).expect("addr"),
            "127.0.0.1:7002"
        );
    }

    #[test]
    fn unknown_slots_report_bad_mapping() {
        let table = SlotTable::new();
        let err = table.addr_for(Some(5), false).unwrap_err();
        assert_eq!(err.to_string(), "bad slot mapping");
    }

    #[test]
    fn moved_rewrites_owners_and_requests_reload() {
        let table = loaded_table();
        let info = RedirInfo {
            kind: RedirKind::Moved,
            slot: 100,
            addr: "127.0.0.1:7005".to_string(),
            raw: String::new(),
        };
        assert!(table.on_redirect(&info));
        assert_eq!(
            table.addr_for(Some(100), false).expect("addr"),
            "127.0.0.1:7005"
        );
        // the provisional entry has no replica either
        assert_eq!(
            table.addr_for(Some(100), true).expect("addr"),
            "127.0.0.1:7005"
        );
    }

    #[test]
    fn moved_to_current_primary_is_a_noop() {
        let table = loaded_table();
        let info = RedirInfo {
            kind: RedirKind::Moved,
            slot: 100,
            addr: "127.0.0.1:7000".to_string(),
            raw: String::new(),
        };
        assert!(!table.on_redirect(&info));
    }

    #[test]
    fn ask_never_mutates() {
        let table = loaded_table();
        let info = RedirInfo {
            kind: RedirKind::Ask,
            slot: 100,
            addr: "127.0.0.1:7005".to_string(),
            raw: String::new(),
        };
        assert!(!table.on_redirect(&info));
        assert_eq!(
            table.addr_for(Some(100), false).expect("addr"),
            "127.0.0.1:7000"
        );
    }

    #[test]
    fn reload_flag_is_single_flight() {
        let table = SlotTable::new();
        assert!(table.begin_reload());
        assert!(!table.begin_reload());
        table.finish_reload();
        assert!(table.begin_reload());
    }

    #[test]
    fn known_nodes_orders_primaries_first_within_ranges() {
        let table = loaded_table();
        assert_eq!(
            table.known_nodes(true),
            vec!["127.0.0.1:7000", "127.0.0.1:7001", "127.0.0.1:7002"]
        );
        assert_eq!(
            table.known_nodes(false),
            vec!["127.0.0.1:7000", "127.0.0.1:7002"]
        );
    }

    #[test]
    fn verbose_marks_the_primary() {
        let table = loaded_table();
        let dump = table.verbose();
        assert!(dump.contains("1) slots 0 - 8191"));
        assert!(dump.contains("127.0.0.1:7000 aaa (primary)"));
        assert!(dump.contains("node 2: 127.0.0.1:7001 bbb\n"));
    }

    #[test]
    fn rejects_out_of_range_entries() {
        let reply = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::Integer(0),
            RespValue::Integer(16384),
            endpoint("127.0.0.1", 7000, ""),
        ])]);
        assert!(parse_cluster_slots(&reply).is_err());
    }

    #[test]
    fn invalid_slot_is_rejected_at_lookup() {
        let table = loaded_table();
        let err = table.addr_for(Some(SLOT_COUNT), false).unwrap_err();
        assert_eq!(err.to_string(), "invalid slot");
    }
}
