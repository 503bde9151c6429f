//! # Error Codes
//!
//! Canopy operations report failure as values from a stable integer code
//! space so that errors can cross transports unchanged. `RpcError` is the
//! Rust-side view of that space; `code()` and `from_code()` convert to and
//! from the on-wire representation. Implementations must never let a panic
//! cross a transport boundary - local failures are converted to a code
//! before marshalling.

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type RpcResult<T> = Result<T, RpcError>;

/// The stable failure taxonomy of the runtime.
///
/// Codes fall into a few families:
/// - logic/data errors (`InvalidData`, `InvalidInterfaceId`,
///   `ReferenceCountError`) indicate a bug or protocol mismatch,
/// - version errors (`InvalidVersion`, `IncompatibleService`) are recovered
///   by the service proxy's downgrade loop,
/// - lifetime errors (`ObjectNotFound`, `ObjectGone`, `ZoneNotFound`) - of
///   which `ObjectGone` from an optimistic handle is expected behaviour,
/// - transport errors (`TransportError`, `CallCancelled`) which transition
///   the transport to its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RpcError {
    #[error("object not found in destination zone")]
    ObjectNotFound,
    #[error("object has gone away")]
    ObjectGone,
    #[error("invalid interface id")]
    InvalidInterfaceId,
    #[error("invalid data")]
    InvalidData,
    #[error("invalid protocol version")]
    InvalidVersion,
    #[error("incompatible service")]
    IncompatibleService,
    #[error("zone not found")]
    ZoneNotFound,
    #[error("zone not supported")]
    ZoneNotSupported,
    #[error("transport error")]
    TransportError,
    #[error("reference count error")]
    ReferenceCountError,
    #[error("buffer too small, retry with a larger one")]
    NeedMoreMemory,
    #[error("call cancelled")]
    CallCancelled,
    #[error("security error")]
    SecurityError,
    #[error("proxy deserialisation error")]
    ProxyDeserialisationError,
}

/// Wire value for a successful operation.
pub const OK: i32 = 0;

impl RpcError {
    /// The stable integer code carried on the wire.
    pub fn code(self) -> i32 {
        match self {
            RpcError::ObjectNotFound => 1,
            RpcError::ObjectGone => 2,
            RpcError::InvalidInterfaceId => 3,
            RpcError::InvalidData => 4,
            RpcError::InvalidVersion => 5,
            RpcError::IncompatibleService => 6,
            RpcError::ZoneNotFound => 7,
            RpcError::ZoneNotSupported => 8,
            RpcError::TransportError => 9,
            RpcError::ReferenceCountError => 10,
            RpcError::NeedMoreMemory => 11,
            RpcError::CallCancelled => 12,
            RpcError::SecurityError => 13,
            RpcError::ProxyDeserialisationError => 14,
        }
    }

    /// Recover an error from its wire code. `0` is not an error; unknown
    /// codes yield `None` and are treated as deserialisation failures by
    /// callers.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => RpcError::ObjectNotFound,
            2 => RpcError::ObjectGone,
            3 => RpcError::InvalidInterfaceId,
            4 => RpcError::InvalidData,
            5 => RpcError::InvalidVersion,
            6 => RpcError::IncompatibleService,
            7 => RpcError::ZoneNotFound,
            8 => RpcError::ZoneNotSupported,
            9 => RpcError::TransportError,
            10 => RpcError::ReferenceCountError,
            11 => RpcError::NeedMoreMemory,
            12 => RpcError::CallCancelled,
            13 => RpcError::SecurityError,
            14 => RpcError::ProxyDeserialisationError,
            _ => return None,
        })
    }
}

/// Convert a wire code back into a `RpcResult<()>`.
///
/// Unknown non-zero codes come from a peer speaking a newer dialect; they
/// surface as `ProxyDeserialisationError` rather than being silently
/// swallowed.
pub fn result_from_code(code: i32) -> RpcResult<()> {
    if code == OK {
        return Ok(());
    }
    Err(RpcError::from_code(code).unwrap_or(RpcError::ProxyDeserialisationError))
}

/// Convert a result into its wire code.
pub fn code_from_result<T>(result: &RpcResult<T>) -> i32 {
    match result {
        Ok(_) => OK,
        Err(e) => e.code(),
    }
}
