use bytes::Bytes;

/// A RESP2 frame as exchanged with cluster nodes.
///
/// The driver only ever inspects three reply shapes itself (redirection
/// error strings, `CLUSTER SLOTS` arrays and pub/sub push frames); every
/// other value is handed to the caller untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    NullBulk,
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    pub fn simple<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::BulkString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Byte payload of string-like frames.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespValue::SimpleString(data)
            | RespValue::BulkString(data)
            | RespValue::Error(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    /// Integer payload, accepting the textual encodings some servers emit.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            RespValue::SimpleString(data) | RespValue::BulkString(data) => {
                std::str::from_utf8(data).ok()?.parse::<i64>().ok()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_integer_accepts_textual_frames() {
        assert_eq!(RespValue::Integer(7).as_integer(), Some(7));
        assert_eq!(RespValue::bulk("6379").as_integer(), Some(6379));
        assert_eq!(RespValue::NullBulk.as_integer(), None);
    }

    #[test]
    fn error_frames_are_string_like() {
        let err = RespValue::error("MOVED 1 127.0.0.1:7001");
        assert!(err.is_error());
        assert!(err.as_bytes().is_some());
    }
}
