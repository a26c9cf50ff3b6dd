use crate::display::DisplayFrame;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy. Every fallible boundary in this
/// crate returns one of these variants; there are no panics on the
/// happy-failure path (malformed input from the pump, a dead socket, a
/// cancelled operation).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lost connection or a failed socket write. The current operation is
    /// aborted and the transport is marked failed; the caller must
    /// reconnect.
    #[error("bluetooth I/O error: {0}")]
    BluetoothIo(String),

    /// Bad STX/ETX sequence. The deframer resynchronizes by scanning for
    /// the next STX; this is logged but not fatal to the transport.
    #[error("framing error: {0}")]
    Framing(String),

    /// MAC verification failed. The packet is dropped; the transport is
    /// torn down only if failures exceed the configured threshold within
    /// the configured window.
    #[error("MAC mismatch")]
    MacMismatch,

    /// CRC verification failed for a pairing packet.
    #[error("CRC mismatch")]
    CrcMismatch,

    /// A received nonce was not strictly greater than the last nonce
    /// accepted from this pump. The packet is dropped.
    #[error("nonce replay detected")]
    NonceReplay,

    /// Unexpected command or invalid protocol state. Fatal to the current
    /// operation; tears down the transport.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A parsed RT screen held a value outside its documented range
    /// (e.g. a reservoir reading above 350 IU). Carries the offending
    /// bitmap so a caller can log or retry after the next redraw.
    #[error("frame parse error: {0}")]
    FrameParse(#[source] FrameParseError),

    /// One or more RT alert screens were auto-dismissed on the caller's
    /// behalf. The in-flight RT operation must be treated as aborted and
    /// the pump state re-checked.
    #[error("alert screen seen and dismissed")]
    AlertSeen {
        /// The parsed alert screens that were dismissed, oldest first.
        contents: Vec<crate::display::ParsedScreen>,
    },

    /// The PIN callback rejected pairing, returned an incorrect PIN, or
    /// the handshake otherwise failed; the store entry and OS-level
    /// Bluetooth pairing have been rolled back.
    #[error("pairing aborted: {0}")]
    PairingAborted(String),

    /// The persistent store failed. Unrecoverable for the affected pump;
    /// the caller must re-pair.
    #[error("store access error: {0}")]
    StoreAccess(String),

    /// Cooperative cancellation. Re-raised after operation-specific
    /// cleanup (bolus cancel, RT navigate-to-main) completes.
    #[error("operation cancelled")]
    Cancelled,

    /// The pump is not known to this process (no `PumpState` in the
    /// store under the given address).
    #[error("unknown pump address")]
    UnknownPump,

    /// A reliable send did not receive an ACK within the timeout after
    /// exhausting its retries.
    #[error("ack timeout after {0} retries")]
    AckTimeout(u8),
}

impl Error {
    /// True for errors that leave the transport usable; the controller
    /// treats everything else as fatal to the current connection.
    #[must_use]
    pub const fn is_transport_preserving(&self) -> bool {
        matches!(
            self,
            Self::MacMismatch | Self::CrcMismatch | Self::NonceReplay | Self::FrameParse(_)
        )
    }
}

/// A value parsed from an RT display frame failed validation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid value in display frame: {reason}")]
pub struct FrameParseError {
    pub reason: String,
    pub frame: DisplayFrame,
}

impl From<FrameParseError> for Error {
    fn from(e: FrameParseError) -> Self {
        Self::FrameParse(e)
    }
}
