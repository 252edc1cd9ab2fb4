//! Key Material Factory: sampling identity, signed-prekey, and one-time
//! prekey material. Pure generation only — persistence order and public
//! bundle assembly belong to the reconciler.

use protocol::bundle::{generate_one_time_prekeys, generate_signed_prekey, OneTimePreKey, SignedPreKeyMaterial};
use protocol::identity::{IdentityDhKeyPair, IdentityKeyPair};
use std::time::{SystemTime, UNIX_EPOCH};

/// Initial and replenishment batch size for one-time prekeys.
pub const OTPK_BATCH_SIZE: u32 = 100;

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_secs()
}

pub struct GeneratedIdentity {
    pub identity: IdentityKeyPair,
    pub identity_dh: IdentityDhKeyPair,
}

pub struct KeyMaterialFactory;

impl KeyMaterialFactory {
    /// Sample a fresh identity signing pair and an independently-sampled
    /// identity DH pair. Called only when the Secret Store has no identity
    /// private key at all.
    pub fn generate_identity() -> GeneratedIdentity {
        GeneratedIdentity {
            identity: IdentityKeyPair::generate(),
            identity_dh: IdentityDhKeyPair::generate(),
        }
    }

    /// Sample a signed prekey and sign it under the given identity with the
    /// current unix timestamp.
    pub fn generate_signed_prekey(identity: &IdentityKeyPair) -> SignedPreKeyMaterial {
        generate_signed_prekey(identity, now_unix())
    }

    /// Sample `count` one-time prekeys numbered from `start_id`.
    pub fn generate_one_time_prekeys(start_id: u32, count: u32) -> Vec<OneTimePreKey> {
        generate_one_time_prekeys(start_id, count)
    }
}
