//! The handover contract between the key-agreement core and the (downstream,
//! not built here) Double Ratchet message-encryption component.

use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::ZeroizeOnDrop;

/// Everything a Double Ratchet implementation needs to seed an initial
/// sending chain. Constructed once per peer by the Session Manager when a
/// handshake completes; mutated only by the (downstream) ratchet itself.
#[derive(ZeroizeOnDrop)]
pub struct RatchetSeed {
    pub root_key: [u8; 32],
    #[zeroize(skip)]
    pub remote_public: X25519PublicKey,
    #[zeroize(skip)]
    pub ephemeral_public: X25519PublicKey,
    #[zeroize(skip)]
    pub local_identity_dh_public: X25519PublicKey,
    #[zeroize(skip)]
    pub otpk_id: Option<u32>,
}

impl RatchetSeed {
    pub fn new(
        root_key: [u8; 32],
        remote_public: X25519PublicKey,
        ephemeral_public: X25519PublicKey,
        local_identity_dh_public: X25519PublicKey,
        otpk_id: Option<u32>,
    ) -> Self {
        Self {
            root_key,
            remote_public,
            ephemeral_public,
            local_identity_dh_public,
            otpk_id,
        }
    }
}
