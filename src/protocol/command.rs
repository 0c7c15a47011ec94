use std::fmt;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::utils::hash_slot;

use super::types::RespValue;

/// A request frame: command name followed by its arguments.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &str, args: &[Bytes]) -> Self {
        let mut parts = Vec::with_capacity(args.len() + 1);
        parts.push(Bytes::copy_from_slice(name.as_bytes()));
        parts.extend_from_slice(args);
        Self { parts }
    }

    pub fn from_parts(parts: Vec<Bytes>) -> Result<Self> {
        if parts.is_empty() {
            bail!("command must contain at least a name");
        }
        Ok(Self { parts })
    }

    pub fn name(&self) -> &[u8] {
        &self.parts[0]
    }

    pub fn args(&self) -> &[Bytes] {
        &self.parts[1..]
    }

    /// Hash slot this command routes to, or `None` when the command carries
    /// no key and any node will do.
    ///
    /// Script-execution commands declare their first key after the script
    /// body and key count, so the key sits at argument index 2; everywhere
    /// else the first argument is the key. Scripts touching keys in more
    /// than one slot cannot be routed and are the caller's mistake.
    pub fn slot(&self) -> Option<u16> {
        let key_index = if is_script_command(self.name()) { 2 } else { 0 };
        self.args().get(key_index).map(|key| hash_slot(key))
    }

    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(
            self.parts
                .iter()
                .cloned()
                .map(RespValue::BulkString)
                .collect(),
        )
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        f.debug_tuple("Command").field(&parts.join(" ")).finish()
    }
}

fn is_script_command(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"EVAL")
        || name.eq_ignore_ascii_case(b"EVAL_RO")
        || name.eq_ignore_ascii_case(b"EVALSHA")
        || name.eq_ignore_ascii_case(b"EVALSHA_RO")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash_slot;

    fn args(values: &[&str]) -> Vec<Bytes> {
        values
            .iter()
            .map(|v| Bytes::copy_from_slice(v.as_bytes()))
            .collect()
    }

    #[test]
    fn first_argument_is_the_key() {
        let cmd = Command::new("SET", &args(&["balance", "10"]));
        assert_eq!(cmd.slot(), Some(hash_slot(b"balance")));
    }

    #[test]
    fn script_commands_key_after_numkeys() {
        let cmd = Command::new("EVALSHA", &args(&["ab12", "1", "queue", "extra"]));
        assert_eq!(cmd.slot(), Some(hash_slot(b"queue")));
        let lowercase = Command::new("eval_ro", &args(&["return 1", "1", "queue"]));
        assert_eq!(lowercase.slot(), Some(hash_slot(b"queue")));
    }

    #[test]
    fn keyless_commands_have_no_slot() {
        assert_eq!(Command::new("PING", &[]).slot(), None);
        // a script frame truncated before its first key
        assert_eq!(Command::new("EVAL", &args(&["return 1", "0"])).slot(), None);
    }

    #[test]
    fn to_resp_builds_bulk_array() {
        let cmd = Command::new("GET", &args(&["foo"]));
        assert_eq!(
            cmd.to_resp(),
            RespValue::Array(vec![RespValue::bulk("GET"), RespValue::bulk("foo")])
        );
    }

    #[test]
    fn from_parts_rejects_empty_frames() {
        assert!(Command::from_parts(Vec::new()).is_err());
    }
}
