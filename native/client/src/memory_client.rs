//! An in-memory stand-in for the Secret Store plus Key Material Factory,
//! used by tests (both here and in `server`'s storage tests) that need a
//! quick source of valid key material without standing up a SQLite-backed
//! `BundleReconciler`.

use crate::key_material::now_unix;
use protocol::bundle::{generate_one_time_prekeys, generate_signed_prekey, SignedPreKey};
use protocol::identity::{IdentityDhKeyPair, IdentityKeyPair};
use std::collections::HashMap;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

pub struct MemoryClient {
    identity: IdentityKeyPair,
    identity_dh: IdentityDhKeyPair,
    signed_prekey: SignedPreKey,
    one_time_prekeys: HashMap<u32, X25519StaticSecret>,
    next_otpk_id: u32,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        let identity = IdentityKeyPair::generate();
        let identity_dh = IdentityDhKeyPair::generate();
        let material = generate_signed_prekey(&identity, now_unix());
        Self {
            identity,
            identity_dh,
            signed_prekey: material.signed,
            one_time_prekeys: HashMap::new(),
            next_otpk_id: 0,
        }
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn identity_dh(&self) -> &IdentityDhKeyPair {
        &self.identity_dh
    }

    pub fn signed_prekey(&self) -> SignedPreKey {
        self.signed_prekey.clone()
    }

    pub fn add_one_time_keys(&mut self, count: u32) -> Vec<(u32, X25519PublicKey)> {
        let batch = generate_one_time_prekeys(self.next_otpk_id, count);
        self.next_otpk_id += count;
        let publics = batch.iter().map(|k| (k.key_id, k.public)).collect();
        for otpk in batch {
            self.one_time_prekeys.insert(otpk.key_id, otpk.secret);
        }
        publics
    }

    pub fn take_one_time_secret(&mut self, key_id: u32) -> Option<X25519StaticSecret> {
        self.one_time_prekeys.remove(&key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_client_has_no_one_time_keys() {
        let client = MemoryClient::new();
        assert!(client.one_time_prekeys.is_empty());
    }

    #[test]
    fn one_time_keys_are_consumed_once() {
        let mut client = MemoryClient::new();
        let batch = client.add_one_time_keys(3);
        let (first_id, _) = batch[0];
        assert!(client.take_one_time_secret(first_id).is_some());
        assert!(client.take_one_time_secret(first_id).is_none());
    }
}
