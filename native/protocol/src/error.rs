use thiserror::Error;

/// Errors raised by the pure cryptography layer. `protocol` never touches the
/// network or a store, so this taxonomy is a strict subset of the core's
/// `CoreError` (see `client::error`) — callers map these into the broader
/// taxonomy at the I/O boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("signed prekey signature does not verify under the supplied identity key")]
    SignatureInvalid,
    #[error("unsupported crypto-version {0}")]
    UnsupportedVersion(u32),
}
