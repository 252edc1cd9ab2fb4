use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::ZeroizeOnDrop;

/// Long-term Ed25519 identity signing keypair.
///
/// Generated once per account and retained across logout; only an explicit
/// account reset destroys it. Used only to sign the signed prekey and to
/// verify peers' signed prekeys.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            verifying_key,
            signing_key,
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            verifying_key,
            signing_key,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Long-term X25519 identity DH keypair.
///
/// Sampled independently of the signing key's scalar. Some X3DH ports derive
/// the identity DH key by reinterpreting the Ed25519 signing scalar as an
/// X25519 scalar; this implementation does not take that shortcut (see
/// DESIGN.md) so the two keypairs never share secret material.
#[derive(ZeroizeOnDrop)]
pub struct IdentityDhKeyPair {
    #[zeroize(skip)]
    public: X25519PublicKey,
    secret: X25519StaticSecret,
}

impl IdentityDhKeyPair {
    pub fn generate() -> Self {
        let secret = X25519StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { public, secret }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = X25519StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self { public, secret }
    }

    pub fn public(&self) -> X25519PublicKey {
        self.public
    }

    pub fn secret(&self) -> &X25519StaticSecret {
        &self.secret
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}
