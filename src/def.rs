use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a file entry in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        FileId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type PinRequestId = i64;
pub type SpaceToken = i64;

/// Either a namespace path or a resolved file id.
#[derive(Debug, Clone)]
pub enum PathOrId {
    Path(String),
    Id(FileId),
}

impl fmt::Display for PathOrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathOrId::Path(p) => write!(f, "{}", p),
            PathOrId::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Storage class information attached to a namespace entry. Opaque to this
/// service, carried between namespace lookups and pool selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage_class: String,
    pub file_size: u64,
}

/// Transfer protocol hint handed to pool selection.
#[derive(Debug, Clone)]
pub struct ProtocolHint {
    pub protocol: String,
    pub major: u32,
    pub minor: u32,
    pub host: String,
}

impl ProtocolHint {
    pub fn read_default() -> Self {
        ProtocolHint {
            protocol: "DCap".to_string(),
            major: 3,
            minor: 0,
            host: "localhost".to_string(),
        }
    }

    pub fn write_for_host(host: &str) -> Self {
        ProtocolHint {
            protocol: "GFtp".to_string(),
            major: 1,
            minor: 0,
            host: host.to_string(),
        }
    }
}

/// Durable projection of one pin lease claim.
#[derive(Debug, Clone, PartialEq)]
pub struct PinRequestRecord {
    pub pin_request_id: PinRequestId,
    pub file_id: FileId,
    /// Absolute unix-millis expiration.
    pub expiration: u64,
    /// Logical request id of the originating client, 0 if none.
    pub client_request_id: i64,
}

/// State of the per-file pin aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    Initial,
    Pinning,
    Pinned,
    Unpinning,
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PinState::Initial => "INITIAL",
            PinState::Pinning => "PINNING",
            PinState::Pinned => "PINNED",
            PinState::Unpinning => "UNPINNING",
        };
        write!(f, "{}", s)
    }
}

/// Durable row of one space reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceReservationRecord {
    pub token: SpaceToken,
    pub reserved: i64,
    pub locked: i64,
    pub creation_time: u64,
    pub lifetime: u64,
    pub pool_name: String,
    pub path: String,
    pub created_entry: bool,
    pub utilized: bool,
}

impl SpaceReservationRecord {
    pub fn expiration(&self) -> u64 {
        self.creation_time + self.lifetime
    }
}

/// Per-pool running totals, cached separately from the reservation rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolLedgerRecord {
    pub pool_name: String,
    pub reserved: i64,
    pub locked: i64,
}

/// Inbound pool availability notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Up,
    Down,
    Restart,
}

/// Collapse duplicate separators and trailing slash so the same file always
/// maps to the same reservation path.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Parent directory of a normalized path ("/" has itself as parent).
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a//b/c/"), "/a/b/c");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "/");
    }
}
