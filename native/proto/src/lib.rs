//! Generated gRPC service definitions plus the conversion helpers that sit
//! at the protobuf boundary: protobuf's `bytes` fields already carry raw
//! bytes, so the conversions here just validate lengths and decode into
//! `protocol` types.

pub mod service {
    include!(concat!(env!("OUT_DIR"), "/brongnal.service.rs"));
}

/// Encoded `FileDescriptorSet` for `tonic_reflection`, so `grpcurl`/`grpcui`
/// can introspect the service without a local copy of the `.proto`.
pub const FILE_DESCRIPTOR_SET: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/brongnal_descriptor.bin"));

use ed25519_dalek::{Signature, VerifyingKey};
use protocol::bundle::SignedPreKey;
use thiserror::Error;
use x25519_dalek::PublicKey as X25519PublicKey;

#[derive(Debug, Error)]
pub enum ProtoConvertError {
    #[error("expected a {expected}-byte value, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("malformed ed25519 public key")]
    InvalidVerifyingKey,
    #[error("malformed ed25519 signature")]
    InvalidSignature,
    #[error("field `{0}` missing from wire message")]
    MissingField(&'static str),
}

pub fn parse_verifying_key(bytes: &[u8]) -> Result<VerifyingKey, ProtoConvertError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtoConvertError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
    VerifyingKey::from_bytes(&array).map_err(|_| ProtoConvertError::InvalidVerifyingKey)
}

pub fn parse_x25519_public(bytes: &[u8]) -> Result<X25519PublicKey, ProtoConvertError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtoConvertError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
    Ok(X25519PublicKey::from(array))
}

pub fn parse_signature(bytes: &[u8]) -> Result<Signature, ProtoConvertError> {
    let array: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ProtoConvertError::InvalidLength {
            expected: 64,
            actual: bytes.len(),
        })?;
    Ok(Signature::from_bytes(&array))
}

impl TryFrom<&service::SignedPreKeyProto> for SignedPreKey {
    type Error = ProtoConvertError;

    fn try_from(value: &service::SignedPreKeyProto) -> Result<Self, Self::Error> {
        Ok(SignedPreKey {
            public: parse_x25519_public(&value.public_key)?,
            signature: parse_signature(&value.signature)?,
            timestamp: value.timestamp.max(0) as u64,
        })
    }
}

impl From<&SignedPreKey> for service::SignedPreKeyProto {
    fn from(value: &SignedPreKey) -> Self {
        service::SignedPreKeyProto {
            public_key: value.public.as_bytes().to_vec(),
            signature: value.signature.to_bytes().to_vec(),
            timestamp: value.timestamp as i64,
        }
    }
}
