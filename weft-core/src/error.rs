//! The error surface of the application-facing API.

/// An error returned by an engine operation.
///
/// Operations that return an error leave all engine state exactly as it was
/// before the call. Protocol-level failures (bad checksums, unacceptable
/// segments) never surface here; they are consumed or answered on the wire,
/// and connection-ending conditions are reported through the
/// `disconnected` event instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// An argument was invalid: an unspecified address or zero port where one
    /// is required, an empty send extension, or a dead handle.
    #[error("invalid argument")]
    InvalidArgs,
    /// The operation is not allowed in the endpoint's or listener's current
    /// state, including double initialization and bind conflicts.
    #[error("operation not allowed in the current state")]
    InvalidState,
    /// The operation could not be carried out: datagram emission failed, no
    /// source address was available, or a transient resource ran out.
    #[error("operation failed")]
    Failed,
}
