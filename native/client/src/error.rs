//! The core's error taxonomy, ordered from most to least recoverable.
//! Converts cleanly to `tonic::Status` at the RPC boundary in both
//! directions, and absorbs `protocol::ProtocolError`/`proto::ProtoConvertError`
//! at the crypto and wire boundaries respectively.

use thiserror::Error;
use tonic::{Code, Status};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transient directory error: {0}")]
    Transient(String),
    #[error("reconciler observed mismatched local/server state")]
    ReconcilerMismatch,
    #[error("cannot fetch a key bundle for one's own identity")]
    PeerIsSelf,
    #[error("peer has not provisioned a key bundle: {0}")]
    PeerNotProvisioned(String),
    #[error("peer bundle malformed: {0}")]
    BundleMalformed(String),
    #[error("signed prekey signature does not verify")]
    SignatureInvalid,
    #[error("local identity key material missing; call AuthGate::on_authenticated first")]
    LocalKeysMissing,
    #[error("secret store unavailable: {0}")]
    StorageUnavailable(String),
    #[error("unsupported crypto version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid client configuration: {0}")]
    ConfigError(String),
}

/// Helper for mapping any secret-store failure (a locked/corrupt SQLite
/// connection) onto the one `CoreError` variant the store is allowed to
/// produce.
pub(crate) fn storage_unavailable<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::StorageUnavailable(err.to_string())
}

impl From<Status> for CoreError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::NotFound => CoreError::PeerNotProvisioned(status.message().to_owned()),
            Code::InvalidArgument => CoreError::BundleMalformed(status.message().to_owned()),
            Code::Unauthenticated
            | Code::Unavailable
            | Code::Internal
            | Code::ResourceExhausted
            | Code::DeadlineExceeded => CoreError::Transient(status.message().to_owned()),
            _ => CoreError::Transient(status.message().to_owned()),
        }
    }
}

impl From<CoreError> for Status {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::PeerNotProvisioned(msg) => Status::not_found(msg),
            CoreError::BundleMalformed(msg) => Status::invalid_argument(msg),
            CoreError::SignatureInvalid => Status::invalid_argument("signature invalid"),
            CoreError::UnsupportedVersion(v) => {
                Status::invalid_argument(format!("unsupported crypto version {v}"))
            }
            CoreError::Transient(msg) => Status::unavailable(msg),
            CoreError::StorageUnavailable(msg) => Status::internal(msg),
            CoreError::ReconcilerMismatch => Status::internal("reconciler mismatch"),
            CoreError::PeerIsSelf => Status::invalid_argument("cannot fetch one's own key bundle"),
            CoreError::LocalKeysMissing => Status::failed_precondition("local key material missing"),
            CoreError::ConfigError(msg) => Status::failed_precondition(msg),
        }
    }
}

impl From<protocol::ProtocolError> for CoreError {
    fn from(err: protocol::ProtocolError) -> Self {
        match err {
            protocol::ProtocolError::SignatureInvalid => CoreError::SignatureInvalid,
            protocol::ProtocolError::UnsupportedVersion(v) => CoreError::UnsupportedVersion(v),
        }
    }
}

impl From<proto::ProtoConvertError> for CoreError {
    fn from(err: proto::ProtoConvertError) -> Self {
        CoreError::BundleMalformed(err.to_string())
    }
}
