use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Records and snapshot
// ---------------------------------------------------------------------------

/// Opaque record identifier (a transaction id for the mempool check).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Metadata the authoritative source holds for one record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// When the source first observed the record (UTC epoch seconds).
    pub first_seen: i64,
    /// Full metadata object exactly as returned by the source.
    pub fields: Map<String, Value>,
}

impl RecordMeta {
    pub fn new(first_seen: i64, fields: Map<String, Value>) -> Self {
        Self { first_seen, fields }
    }

    /// Metadata with only a first-seen time.
    pub fn at(first_seen: i64) -> Self {
        let mut fields = Map::new();
        fields.insert("time".to_string(), Value::from(first_seen));
        Self { first_seen, fields }
    }
}

/// Authoritative view of the record set, fetched once per run.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub records: BTreeMap<RecordId, RecordMeta>,
    /// UTC epoch seconds at which the snapshot was taken. `0` when unknown.
    pub fetched_at: i64,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            records: BTreeMap::new(),
            fetched_at: 0,
        }
    }

    pub fn empty_at(fetched_at: i64) -> Self {
        Self {
            records: BTreeMap::new(),
            fetched_at,
        }
    }

    pub fn insert(&mut self, id: impl Into<RecordId>, meta: RecordMeta) {
        self.records.insert(id.into(), meta);
    }

    pub fn get(&self, id: &RecordId) -> Option<&RecordMeta> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.keys()
    }
}

// ---------------------------------------------------------------------------
// Verification outcome
// ---------------------------------------------------------------------------

/// Answer of a completed verification call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Presence {
    /// The second service knows the record.
    Found,
    /// The second service answered with a protocol-level error response.
    NotFound { code: Option<i64>, message: String },
}

impl Presence {
    pub fn is_found(&self) -> bool {
        matches!(self, Presence::Found)
    }
}

/// A verification call that did not produce an answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyError {
    /// `verify` was called before `connect` or after `close`.
    NotConnected,
    /// Network or transport failure (including the connection dropping
    /// while the call was outstanding).
    Transport(String),
    /// The response could not be decoded.
    Decode(String),
    /// Connection setup or version negotiation was rejected.
    Handshake(String),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::NotConnected => write!(f, "verification client is not connected"),
            VerifyError::Transport(msg) => write!(f, "transport error: {msg}"),
            VerifyError::Decode(msg) => write!(f, "decode error: {msg}"),
            VerifyError::Handshake(msg) => write!(f, "handshake error: {msg}"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Why a record ended up unverified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Error(VerifyError),
    TimedOut(Duration),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error(e) => write!(f, "{e}"),
            FailureKind::TimedOut(after) => {
                write!(f, "timed out after {}ms", after.as_millis())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot source errors
// ---------------------------------------------------------------------------

/// Errors a [`SnapshotSource`] may return. All of them are fatal to a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotError {
    /// Network or transport failure.
    Transport(String),
    /// The source rejected our credentials.
    Auth { status: u16 },
    /// The source returned an RPC-level error object.
    Rpc { code: Option<i64>, message: String },
    /// A response payload could not be decoded.
    Decode(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Transport(msg) => write!(f, "transport error: {msg}"),
            SnapshotError::Auth { status } => {
                write!(f, "snapshot source rejected credentials (http {status})")
            }
            SnapshotError::Rpc {
                code: Some(c),
                message,
            } => write!(f, "rpc error code={c}: {message}"),
            SnapshotError::Rpc {
                code: None,
                message,
            } => write!(f, "rpc error: {message}"),
            SnapshotError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Per-record existence check against the second service.
///
/// One connection is shared by every in-flight job, so `verify` must accept
/// concurrent callers (multiplexed requests over one connection).
#[async_trait::async_trait]
pub trait VerificationClient: Send + Sync {
    /// Short name for logs (e.g. `"electrum"`).
    fn name(&self) -> &'static str;

    /// Start the connection lifecycle. Idempotent.
    async fn connect(&self) -> Result<(), VerifyError>;

    /// Issue exactly one verification request for `record_id`.
    async fn verify(&self, record_id: &RecordId) -> Result<Presence, VerifyError>;

    /// End the connection lifecycle. Closing a closed client is a no-op.
    async fn close(&self) -> Result<(), VerifyError>;
}

/// Bulk fetch of the authoritative record set.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_snapshot(&self) -> Result<Snapshot, SnapshotError>;
}
