//! Error types for the link core

use std::fmt;
use thiserror::Error;

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Closed taxonomy of link errors.
///
/// Every layer surfaces one of these upward; the dispatcher delivers the
/// terminal kind to the operation's callback. The poll loop itself never
/// stores error state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    // --- Parameter / usage ---
    /// Malformed or out-of-range argument
    #[error("bad parameters: {0}")]
    BadParms(String),
    /// Malformed object or channel name
    #[error("bad name: {0}")]
    BadName(String),
    /// Unknown drive letter
    #[error("bad drive")]
    BadDrive,

    // --- Resource ---
    /// Allocation failure (arena or queue capacity)
    #[error("out of buffers")]
    Buffer,
    /// Outgoing frame window exhausted
    #[error("frame buffer full")]
    BufferFull,
    /// Driver transmit buffer exhausted
    #[error("driver buffer full")]
    DriverFull,
    /// Per-channel write queue exhausted
    #[error("multiplexor queue full")]
    MuxFull,

    // --- Driver / link ---
    /// No byte-pipe driver is configured
    #[error("no driver")]
    NoDriver,
    /// The driver reported a fault
    #[error("driver error: {0}")]
    DriverError(String),
    /// Driver rejected a block of this size
    #[error("driver block size")]
    DriverSize,
    /// The link is already in use
    #[error("link busy")]
    LinkBusy,
    /// The link has not been enabled
    #[error("no link")]
    NoLink,

    // --- Protocol ---
    /// Framing layer not running
    #[error("no frame handler")]
    NoFrame,
    /// Peer negotiation failed
    #[error("no connection to remote")]
    NoConnect,
    /// Multiplexor not running
    #[error("no multiplexor")]
    NoMux,
    /// Operation requires a connected peer
    #[error("not connected")]
    NotConnected,
    /// Channel id or name already in use
    #[error("channel exists")]
    ChanExists,
    /// Framing layer in the wrong state for this request
    #[error("bad frame state")]
    BadFrameState,
    /// Connection manager in the wrong state for this request
    #[error("bad connection state")]
    BadConnectState,

    // --- Server channel ---
    /// Named server not present at the peer
    #[error("no such server")]
    SvrNone,
    /// Shared channel destroyed with operations pending
    #[error("server channel closed")]
    SvrClosed,
    /// Request deadline expired
    #[error("server timeout")]
    SvrTime,
    /// Another connection already owns this resource
    #[error("connection busy")]
    ConnectionBusy,
    /// Foreground request abandoned by the caller
    #[error("escape")]
    Escape,

    // --- Remote origin ---
    /// Failure reported by the peer
    #[error("remote error: {0}")]
    Remote(RemoteError),

    // --- File-system semantics (as reported over the link) ---
    /// Remote file-system failure
    #[error("file error: {0}")]
    Fs(FsError),

    // --- Timeout / comms ---
    /// Generic operation timeout
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// Persistent framing failure; the link is considered dead
    #[error("communications failure")]
    Comms,
    /// Metadata cache not running
    #[error("cache inactive")]
    CacheInactive,
    /// Metadata cache busy with another client
    #[error("cache busy")]
    CacheBusy,
}

/// Failure kinds reported by the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteError {
    /// Unclassified remote failure
    General,
    /// Remote operating-system error
    Os,
    /// Request not supported by this peer
    NotSupported,
    /// Object in use at the remote end
    InUse,
    /// Remote out of memory
    NoMemory,
    /// Remote file-server fault
    FileServer,
    /// Remote device not ready
    NotReady,
    /// Remote user cancelled the operation
    Cancelled,
    /// Remote closed the session
    Disconnected,
    /// Remote reports no connection
    NoConnection,
    /// Remote aborted mid-operation
    Aborted,
    /// Remote power failure
    PowerFail,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::General => write!(f, "general failure"),
            RemoteError::Os => write!(f, "operating system error"),
            RemoteError::NotSupported => write!(f, "not supported"),
            RemoteError::InUse => write!(f, "in use"),
            RemoteError::NoMemory => write!(f, "out of memory"),
            RemoteError::FileServer => write!(f, "file server fault"),
            RemoteError::NotReady => write!(f, "not ready"),
            RemoteError::Cancelled => write!(f, "cancelled"),
            RemoteError::Disconnected => write!(f, "disconnected"),
            RemoteError::NoConnection => write!(f, "no connection"),
            RemoteError::Aborted => write!(f, "aborted"),
            RemoteError::PowerFail => write!(f, "power failure"),
        }
    }
}

/// File-system failure kinds carried back over shared channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    Eof,
    NotFound,
    Exists,
    /// Object type mismatch (file where directory expected, or vice versa)
    Types,
    Access,
    Locked,
    WildCards,
    Open,
    InUse,
    Outside,
    DirFull,
    DirNotEmpty,
    DiscFull,
    WriteProtected,
    BadDisc,
    DiscNotFound,
    DriveEmpty,
    NotSupported,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Eof => write!(f, "end of file"),
            FsError::NotFound => write!(f, "not found"),
            FsError::Exists => write!(f, "already exists"),
            FsError::Types => write!(f, "object types differ"),
            FsError::Access => write!(f, "access denied"),
            FsError::Locked => write!(f, "locked"),
            FsError::WildCards => write!(f, "wildcards not allowed"),
            FsError::Open => write!(f, "object open"),
            FsError::InUse => write!(f, "in use"),
            FsError::Outside => write!(f, "outside file boundary"),
            FsError::DirFull => write!(f, "directory full"),
            FsError::DirNotEmpty => write!(f, "directory not empty"),
            FsError::DiscFull => write!(f, "disc full"),
            FsError::WriteProtected => write!(f, "disc write protected"),
            FsError::BadDisc => write!(f, "bad disc"),
            FsError::DiscNotFound => write!(f, "disc not found"),
            FsError::DriveEmpty => write!(f, "drive empty"),
            FsError::NotSupported => write!(f, "not supported"),
        }
    }
}

impl LinkError {
    /// Create a bad-parameters error
    pub fn bad_parms(message: impl Into<String>) -> Self {
        LinkError::BadParms(message.into())
    }

    /// Create a bad-name error
    pub fn bad_name(message: impl Into<String>) -> Self {
        LinkError::BadName(message.into())
    }

    /// Create a driver error
    pub fn driver(message: impl Into<String>) -> Self {
        LinkError::DriverError(message.into())
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        LinkError::Timeout { timeout_ms }
    }

    /// Decode a status word received from the peer into an error.
    ///
    /// Zero and positive words are success and must be handled by the
    /// caller before decoding; unknown negative words collapse to
    /// `Remote(General)`.
    pub fn from_remote_code(code: i32) -> Self {
        match code {
            -1 => LinkError::Remote(RemoteError::General),
            -2 => LinkError::Remote(RemoteError::Os),
            -3 => LinkError::Remote(RemoteError::NotSupported),
            -4 => LinkError::Remote(RemoteError::InUse),
            -5 => LinkError::Remote(RemoteError::NoMemory),
            -6 => LinkError::Remote(RemoteError::FileServer),
            -7 => LinkError::Remote(RemoteError::NotReady),
            -8 => LinkError::Remote(RemoteError::Cancelled),
            -9 => LinkError::Remote(RemoteError::Disconnected),
            -10 => LinkError::Remote(RemoteError::NoConnection),
            -11 => LinkError::Remote(RemoteError::Aborted),
            -12 => LinkError::Remote(RemoteError::PowerFail),
            -20 => LinkError::Fs(FsError::Eof),
            -21 => LinkError::Fs(FsError::NotFound),
            -22 => LinkError::Fs(FsError::Exists),
            -23 => LinkError::Fs(FsError::Types),
            -24 => LinkError::Fs(FsError::Access),
            -25 => LinkError::Fs(FsError::Locked),
            -26 => LinkError::Fs(FsError::WildCards),
            -27 => LinkError::Fs(FsError::Open),
            -28 => LinkError::Fs(FsError::InUse),
            -29 => LinkError::Fs(FsError::Outside),
            -30 => LinkError::Fs(FsError::DirFull),
            -31 => LinkError::Fs(FsError::DirNotEmpty),
            -32 => LinkError::Fs(FsError::DiscFull),
            -33 => LinkError::Fs(FsError::WriteProtected),
            -34 => LinkError::Fs(FsError::BadDisc),
            -35 => LinkError::Fs(FsError::DiscNotFound),
            -36 => LinkError::Fs(FsError::DriveEmpty),
            -37 => LinkError::Fs(FsError::NotSupported),
            _ => LinkError::Remote(RemoteError::General),
        }
    }

    /// Check whether retrying the request later could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::BufferFull
                | LinkError::DriverFull
                | LinkError::MuxFull
                | LinkError::LinkBusy
                | LinkError::ConnectionBusy
                | LinkError::CacheBusy
                | LinkError::Timeout { .. }
                | LinkError::SvrTime
                | LinkError::Remote(RemoteError::NotReady)
                | LinkError::Remote(RemoteError::InUse)
        )
    }

    /// Check whether this error means the link itself is down
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            LinkError::Comms
                | LinkError::NoLink
                | LinkError::NotConnected
                | LinkError::Remote(RemoteError::Disconnected)
                | LinkError::Remote(RemoteError::NoConnection)
                | LinkError::Remote(RemoteError::PowerFail)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_code_decoding() {
        assert_eq!(
            LinkError::from_remote_code(-3),
            LinkError::Remote(RemoteError::NotSupported)
        );
        assert_eq!(
            LinkError::from_remote_code(-21),
            LinkError::Fs(FsError::NotFound)
        );
        assert_eq!(
            LinkError::from_remote_code(-999),
            LinkError::Remote(RemoteError::General)
        );
    }

    #[test]
    fn test_classification() {
        assert!(LinkError::MuxFull.is_recoverable());
        assert!(!LinkError::Comms.is_recoverable());
        assert!(LinkError::Comms.is_disconnect());
        assert!(!LinkError::SvrTime.is_disconnect());
    }
}
