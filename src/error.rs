use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Error taxonomy for the cluster-map/routing layer, the binary KV protocol
/// engine, and the HTTP query stack. Grouped the way spec §7 groups them:
/// Transport, Protocol, Handshake, Routing, Domain, Query/HTTP.
#[derive(Debug, Error)]
pub enum Error {
    // --- Transport ---
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation timed out")]
    Timeout,

    #[error("TLS failure: {0}")]
    TlsFailure(String),

    #[error("no ready connection available in the node pool")]
    NoCapacity,

    #[error("frame of {size} bytes exceeds the configured maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // --- Protocol ---
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("response opaque {0:#x} did not match any pending request")]
    UnexpectedOpaque(u32),

    #[error("bad magic byte {0:#x}")]
    BadMagic(u8),

    // --- Handshake ---
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("feature unsupported by server: {0}")]
    FeatureUnsupported(String),

    // --- Routing ---
    #[error("no cluster map available yet")]
    NoMap,

    #[error("no node for the requested partition/service")]
    NoNode,

    #[error("not my vbucket")]
    NotMyVBucket { config: Option<Vec<u8>> },

    // --- Domain ---
    #[error("key not found")]
    KeyNotFound,

    #[error("key already exists")]
    KeyExists,

    #[error("CAS mismatch")]
    CasMismatch,

    #[error("delta on a non-numeric value")]
    DeltaBadVal,

    #[error("value too big")]
    TooBig,

    #[error("document is locked")]
    Locked,

    #[error("temporary failure, retry")]
    TmpFail,

    #[error("access denied")]
    AccessDenied,

    #[error("unknown server status {0:#x}")]
    Unknown(u16),

    // --- Query / HTTP ---
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("streaming result was already consumed")]
    StreamAlreadyRead,

    #[error("metadata is not available until the row stream is drained")]
    StreamNotDrained,

    #[error("malformed JSON in streamed response: {0}")]
    ParseError(String),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("bad connection string: {0}")]
    BadConnectionString(String),
}

impl Error {
    /// Whether this error, independent of opcode idempotence, is always
    /// worth retrying per spec §4.7 / §4.8.
    pub fn is_retryable_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::NoCapacity | Error::TmpFail
        )
    }
}
