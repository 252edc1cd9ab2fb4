//! The X3DH engine: a pure function from key material to a 32-byte shared
//! secret. No I/O, no async — the only fresh randomness is the ephemeral
//! keypair, which is returned to the caller alongside the secret.

use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha512;
use x25519_dalek::{
    PublicKey as X25519PublicKey, ReusableSecret as X25519ReusableSecret,
    StaticSecret as X25519StaticSecret,
};
use zeroize::Zeroize;

/// HKDF info string binding the derived secret to this protocol and version.
pub const SHARED_SECRET_INFO: &[u8] = b"SCP_X3DH_SharedSecret_v1";

/// 32 bytes of shared secret, zeroized on drop. Lives only long enough to
/// seed a `RatchetSeed`.
pub struct SharedSecret(pub [u8; 32]);

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn kdf(ikm: &[u8]) -> [u8; 32] {
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha512>::new(Some(&salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(SHARED_SECRET_INFO, &mut okm)
        .expect("32 is a valid HKDF-SHA512 output length");
    okm
}

/// Result of the initiator-side derivation: the shared secret, the freshly
/// sampled ephemeral public key (sent to the peer), and the OTPK id consumed
/// (if any), passed through unchanged so the caller can record it.
pub struct InitiatorOutput {
    pub shared_secret: SharedSecret,
    pub ephemeral_public: X25519PublicKey,
    pub otpk_id: Option<u32>,
}

/// Alice's side of X3DH: she holds her own identity DH private key and has
/// already fetched and verified Bob's bundle.
///
/// DH order (security-critical, MUST match `derive_responder`):
///   DH1 = DH(local_identity_dh_priv, peer_signed_prekey_pub)
///   DH2 = DH(ephemeral_priv,         peer_identity_dh_pub)
///   DH3 = DH(ephemeral_priv,         peer_signed_prekey_pub)
///   DH4 = DH(ephemeral_priv,         peer_otpk_pub)            [if present]
pub fn derive_initiator(
    local_identity_dh_priv: &X25519StaticSecret,
    peer_identity_dh_pub: &X25519PublicKey,
    peer_signed_prekey_pub: &X25519PublicKey,
    peer_otpk: Option<(u32, X25519PublicKey)>,
) -> InitiatorOutput {
    let ephemeral = X25519ReusableSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);

    let mut dh1 = local_identity_dh_priv
        .diffie_hellman(peer_signed_prekey_pub)
        .to_bytes();
    let mut dh2 = ephemeral.diffie_hellman(peer_identity_dh_pub).to_bytes();
    let mut dh3 = ephemeral.diffie_hellman(peer_signed_prekey_pub).to_bytes();

    let mut ikm = Vec::with_capacity(32 * 4);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();

    let otpk_id = match peer_otpk {
        Some((key_id, otpk_pub)) => {
            let mut dh4 = ephemeral.diffie_hellman(&otpk_pub).to_bytes();
            ikm.extend_from_slice(&dh4);
            dh4.zeroize();
            Some(key_id)
        }
        None => None,
    };

    let shared_secret = SharedSecret(kdf(&ikm));
    ikm.zeroize();

    InitiatorOutput {
        shared_secret,
        ephemeral_public,
        otpk_id,
    }
}

/// Bob's side of X3DH: he reconstructs the same DH set from his private
/// halves and Alice's two public values from the init header.
///
/// DH order mirrors `derive_initiator` with operands swapped (ECDH is
/// commutative across matching keypairs: `DH(a_priv, B_pub) == DH(b_priv,
/// A_pub)`):
///   DH1 = DH(local_signed_prekey_priv, peer_identity_dh_pub)
///   DH2 = DH(local_identity_dh_priv,   peer_ephemeral_pub)
///   DH3 = DH(local_signed_prekey_priv, peer_ephemeral_pub)
///   DH4 = DH(local_otpk_priv,          peer_ephemeral_pub)      [if present]
pub fn derive_responder(
    local_signed_prekey_priv: &X25519StaticSecret,
    local_identity_dh_priv: &X25519StaticSecret,
    peer_identity_dh_pub: &X25519PublicKey,
    peer_ephemeral_pub: &X25519PublicKey,
    local_otpk_priv: Option<&X25519StaticSecret>,
) -> SharedSecret {
    let mut dh1 = local_signed_prekey_priv
        .diffie_hellman(peer_identity_dh_pub)
        .to_bytes();
    let mut dh2 = local_identity_dh_priv
        .diffie_hellman(peer_ephemeral_pub)
        .to_bytes();
    let mut dh3 = local_signed_prekey_priv
        .diffie_hellman(peer_ephemeral_pub)
        .to_bytes();

    let mut ikm = Vec::with_capacity(32 * 4);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();

    if let Some(otpk_priv) = local_otpk_priv {
        let mut dh4 = otpk_priv.diffie_hellman(peer_ephemeral_pub).to_bytes();
        ikm.extend_from_slice(&dh4);
        dh4.zeroize();
    }

    let shared_secret = SharedSecret(kdf(&ikm));
    ikm.zeroize();
    shared_secret
}
