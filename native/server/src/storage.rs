//! The server-side storage contract: everything the directory RPC handlers
//! need from persistence, independent of which backing store implements it.

use ed25519_dalek::{Signature, VerifyingKey};
use x25519_dalek::PublicKey as X25519PublicKey;

/// The public bundle a client uploads via `RegisterPreKeyBundle`. Mirrors
/// `protocol::bundle::KeyBundle` but carries wire-shaped fields (key_id
/// paired with its public) since that's what the directory stores and
/// returns verbatim.
pub struct StoredBundle {
    pub crypto_version: u32,
    pub identity_key: VerifyingKey,
    pub identity_dh_key: X25519PublicKey,
    pub signed_prekey: X25519PublicKey,
    pub signed_prekey_signature: Signature,
    pub signed_prekey_timestamp: i64,
    pub one_time_prekeys: Vec<(u32, X25519PublicKey)>,
}

pub struct KeyCount {
    pub has_key_bundle: bool,
    pub available_prekeys: u32,
    pub signed_prekey_stale: bool,
    pub needs_replenish: bool,
}

/// What `RequestPreKeys` returns: the peer's four public halves, SPK
/// signature/timestamp, and at most one atomically-popped OTPK.
pub struct PeerKeys {
    pub crypto_version: u32,
    pub identity_key: VerifyingKey,
    pub identity_dh_key: X25519PublicKey,
    pub signed_prekey: X25519PublicKey,
    pub signed_prekey_signature: Signature,
    pub signed_prekey_timestamp: i64,
    pub one_time_prekey: Option<(u32, X25519PublicKey)>,
    pub prekeys_remaining: u32,
}

pub struct StoredMessage {
    pub sender_identity: String,
    pub sender_identity_key: Vec<u8>,
    pub sender_identity_dh_key: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
    pub one_time_key_id: Option<u32>,
    pub ciphertext: Vec<u8>,
}

#[tonic::async_trait]
pub trait Storage: Send + Sync {
    /// Upsert the user's bundle: identity/DH/SPK fields are overwritten
    /// unconditionally, one-time prekeys are upserted by `(identity,
    /// key_id)` so a replenishment call that resends the unchanged SPK is
    /// harmless.
    async fn register_pre_key_bundle(
        &self,
        identity: &str,
        bundle: StoredBundle,
    ) -> tonic::Result<()>;

    async fn get_key_count(&self, identity: &str) -> tonic::Result<KeyCount>;

    /// Atomically pops one OTPK for `peer_identity` (if any remain) and
    /// returns the peer's current bundle plus that OTPK.
    async fn request_pre_keys(&self, peer_identity: &str) -> tonic::Result<PeerKeys>;

    async fn add_message(&self, recipient: &str, message: StoredMessage) -> tonic::Result<()>;

    async fn take_messages(&self, identity: &str) -> tonic::Result<Vec<StoredMessage>>;
}
