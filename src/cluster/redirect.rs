use crate::protocol::RespValue;

/// Redirection flavor reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirKind {
    /// Slot ownership changed for good; the routing table should follow.
    Moved,
    /// Mid-migration hint: retry this one command elsewhere, nothing else.
    Ask,
}

/// Parsed `MOVED <slot> <host:port>` / `ASK <slot> <host:port>` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirInfo {
    pub kind: RedirKind,
    pub slot: u16,
    pub addr: String,
    /// Original error text, surfaced to callers that opt out of redirects.
    pub raw: String,
}

impl RedirInfo {
    /// Recognize a redirection in a reply frame.
    ///
    /// Only error frames qualify, and only when they split into exactly
    /// three whitespace tokens: the kind, a non-negative slot number and a
    /// target address. Anything else is some other server error.
    pub fn parse(reply: &RespValue) -> Option<RedirInfo> {
        let text = match reply {
            RespValue::Error(data) => String::from_utf8_lossy(data),
            _ => return None,
        };
        let parts: Vec<&str> = text.split_whitespace().collect();
        if parts.len() != 3 {
            return None;
        }
        let kind = match parts[0] {
            "MOVED" => RedirKind::Moved,
            "ASK" => RedirKind::Ask,
            _ => return None,
        };
        let slot = parts[1].parse::<u16>().ok()?;
        Some(RedirInfo {
            kind,
            slot,
            addr: parts[2].to_string(),
            raw: text.into_owned(),
        })
    }
}
