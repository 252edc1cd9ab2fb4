use crate::error::ProtocolError;
use crate::identity::IdentityKeyPair;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

/// The only crypto-version this implementation produces. Version 1 (legacy,
/// longer X448/Ed448 keys) is recognized on ingest only, so peers mid-upgrade
/// can still be rejected cleanly rather than mis-parsed.
pub const CRYPTO_VERSION: u32 = 2;
pub const LEGACY_CRYPTO_VERSION: u32 = 1;

/// An X25519 signed prekey: its public half, the Ed25519 signature over
/// `public ‖ be64(timestamp)`, and the timestamp itself.
#[derive(Clone)]
pub struct SignedPreKey {
    pub public: X25519PublicKey,
    pub signature: Signature,
    pub timestamp: u64,
}

pub struct SignedPreKeyMaterial {
    pub secret: X25519StaticSecret,
    pub signed: SignedPreKey,
}

fn signed_prekey_payload(public: &X25519PublicKey, timestamp: u64) -> [u8; 40] {
    let mut payload = [0u8; 40];
    payload[..32].copy_from_slice(public.as_bytes());
    payload[32..].copy_from_slice(&timestamp.to_be_bytes());
    payload
}

/// Sample a fresh signed prekey and sign `public ‖ be64(timestamp)` with the
/// identity signing key.
pub fn generate_signed_prekey(identity: &IdentityKeyPair, timestamp: u64) -> SignedPreKeyMaterial {
    let secret = X25519StaticSecret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    let payload = signed_prekey_payload(&public, timestamp);
    let signature = identity.signing_key().sign(&payload);
    SignedPreKeyMaterial {
        secret,
        signed: SignedPreKey {
            public,
            signature,
            timestamp,
        },
    }
}

/// Reject a bundle declaring any crypto-version this implementation cannot
/// parse. Only version 2 is ever produced or accepted; version 1 (legacy
/// X448/Ed448 keys) is recognized by number only, so a mid-upgrade peer is
/// rejected cleanly rather than mis-parsed as version-2 key material.
pub fn check_crypto_version(crypto_version: u32) -> Result<(), ProtocolError> {
    if crypto_version == CRYPTO_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedVersion(crypto_version))
    }
}

/// Verify a signed prekey against the identity public key it claims to
/// belong to. This is the only signature check in the whole handshake;
/// callers decide (via `Config::fail_closed_on_signature_error`) whether a
/// failure aborts the handshake or is merely logged.
pub fn verify_signed_prekey(
    identity_public: &VerifyingKey,
    spk: &SignedPreKey,
) -> Result<(), ProtocolError> {
    let payload = signed_prekey_payload(&spk.public, spk.timestamp);
    identity_public
        .verify(&payload, &spk.signature)
        .map_err(|_| ProtocolError::SignatureInvalid)
}

/// One member of a one-time prekey batch: a small integer id plus an X25519
/// keypair. Generated in batches of 100; each private half is consumed at
/// most once by the directory.
pub struct OneTimePreKey {
    pub key_id: u32,
    pub secret: X25519StaticSecret,
    pub public: X25519PublicKey,
}

/// Sample `count` one-time prekeys, numbered `start_id..start_id+count`.
/// Callers never reuse an id within one generation; a from-scratch rebuild
/// restarts numbering at 0 (the directory upserts by id).
pub fn generate_one_time_prekeys(start_id: u32, count: u32) -> Vec<OneTimePreKey> {
    (start_id..start_id + count)
        .map(|key_id| {
            let secret = X25519StaticSecret::random_from_rng(OsRng);
            let public = X25519PublicKey::from(&secret);
            OneTimePreKey {
                key_id,
                secret,
                public,
            }
        })
        .collect()
}

/// The tuple a client uploads to the directory.
pub struct KeyBundle {
    pub crypto_version: u32,
    pub identity_public: VerifyingKey,
    pub identity_dh_public: X25519PublicKey,
    pub signed_prekey: SignedPreKey,
    pub one_time_prekeys: Vec<(u32, X25519PublicKey)>,
}

/// The tuple the directory returns for a peer lookup: four public halves,
/// the signed-prekey signature and timestamp, and at most one OTPK.
pub struct PeerBundle {
    pub crypto_version: u32,
    pub identity_public: VerifyingKey,
    pub identity_dh_public: X25519PublicKey,
    pub signed_prekey: SignedPreKey,
    pub one_time_prekey: Option<(u32, X25519PublicKey)>,
}
