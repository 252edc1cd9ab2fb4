//! Pure cryptography for the end-to-end encryption key-agreement core:
//! identity/prekey generation, bundle signing and verification, and the
//! X3DH engine. No network or storage access lives in this crate — those
//! concerns belong to `client` and `server`.

pub mod bundle;
pub mod error;
pub mod identity;
pub mod ratchet_seed;
pub mod x3dh;

pub use error::ProtocolError;
