//! Session Manager: an in-memory map of peer-id to `RatchetSeed`, backed
//! by the Secret Store, with per-peer single-flight bootstrap. The lock
//! table idiom — an outer mutex guarding only fetch-or-insert of an inner
//! per-peer mutex, never held across I/O — mirrors the peer-dedup pattern
//! used elsewhere in this codebase family for per-key serialization.

use crate::error::CoreError;
use crate::peer_fetch::PeerFetch;
use crate::secret_store::{Label, SqliteSecretStore};
use protocol::identity::IdentityDhKeyPair;
use protocol::ratchet_seed::RatchetSeed;
use protocol::x3dh::derive_initiator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;
use x25519_dalek::PublicKey as X25519PublicKey;

/// Leading version byte of the on-disk session encoding; an unrecognized
/// version causes the session to be discarded and re-bootstrapped rather
/// than failing hard.
const SESSION_WIRE_V1: u8 = 1;

pub struct SessionManager {
    store: SqliteSecretStore,
    fetcher: Arc<dyn PeerFetch>,
    own_id: String,
    sessions: Mutex<HashMap<String, Arc<RatchetSeed>>>,
    peer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: SqliteSecretStore, fetcher: Arc<dyn PeerFetch>, own_id: String) -> Self {
        Self {
            store,
            fetcher,
            own_id,
            sessions: Mutex::new(HashMap::new()),
            peer_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn peer_lock(&self, peer_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.peer_locks.lock().await;
        locks
            .entry(peer_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[instrument(skip(self), fields(peer = %peer_id))]
    pub async fn session_for(&self, peer_id: &str) -> Result<Arc<RatchetSeed>, CoreError> {
        if let Some(session) = self.sessions.lock().await.get(peer_id) {
            return Ok(session.clone());
        }

        let lock = self.peer_lock(peer_id).await;
        let _guard = lock.lock().await;

        // Another caller may have finished bootstrapping while we waited
        // for the per-peer lock.
        if let Some(session) = self.sessions.lock().await.get(peer_id) {
            return Ok(session.clone());
        }

        let session = match self.load(peer_id).await? {
            Some(session) => Arc::new(session),
            None => Arc::new(self.bootstrap(peer_id).await?),
        };
        self.sessions
            .lock()
            .await
            .insert(peer_id.to_owned(), session.clone());
        // Release the per-peer lock before persisting: the critical section
        // only needs to cover the in-memory insertion. A save failure here
        // does not unwind the insertion; it is retried lazily by the next
        // `save` call (e.g. after the first message is encrypted).
        drop(_guard);
        self.save(peer_id, &session).await?;
        Ok(session)
    }

    async fn bootstrap(&self, peer_id: &str) -> Result<RatchetSeed, CoreError> {
        let peer_bundle = self.fetcher.fetch(peer_id, &self.own_id).await?;

        let identity_dh_bytes = self
            .store
            .get(Label::IdentityDhPriv)
            .await?
            .ok_or(CoreError::LocalKeysMissing)?;
        let identity_dh_array: [u8; 32] = identity_dh_bytes
            .try_into()
            .map_err(|_| CoreError::StorageUnavailable("corrupt identity dh key".into()))?;
        let identity_dh = IdentityDhKeyPair::from_bytes(identity_dh_array);

        let output = derive_initiator(
            identity_dh.secret(),
            &peer_bundle.identity_dh_public,
            &peer_bundle.signed_prekey.public,
            peer_bundle.one_time_prekey,
        );

        Ok(RatchetSeed::new(
            output.shared_secret.0,
            peer_bundle.signed_prekey.public,
            output.ephemeral_public,
            identity_dh.public(),
            output.otpk_id,
        ))
    }

    async fn load(&self, peer_id: &str) -> Result<Option<RatchetSeed>, CoreError> {
        let Some(bytes) = self
            .store
            .get(Label::Session {
                peer_id: peer_id.to_owned(),
            })
            .await?
        else {
            return Ok(None);
        };

        const HEADER_LEN: usize = 1 + 32 * 4 + 1;
        if bytes.len() < HEADER_LEN || bytes[0] != SESSION_WIRE_V1 {
            return Ok(None);
        }

        let mut offset = 1;
        let root_key: [u8; 32] = bytes[offset..offset + 32].try_into().unwrap();
        offset += 32;
        let remote_public = X25519PublicKey::from(<[u8; 32]>::try_from(&bytes[offset..offset + 32]).unwrap());
        offset += 32;
        let ephemeral_public = X25519PublicKey::from(<[u8; 32]>::try_from(&bytes[offset..offset + 32]).unwrap());
        offset += 32;
        let local_identity_dh_public =
            X25519PublicKey::from(<[u8; 32]>::try_from(&bytes[offset..offset + 32]).unwrap());
        offset += 32;
        let has_otpk = bytes[offset];
        offset += 1;

        let otpk_id = if has_otpk == 1 {
            if bytes.len() < offset + 4 {
                return Ok(None);
            }
            Some(u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()))
        } else {
            None
        };

        Ok(Some(RatchetSeed::new(
            root_key,
            remote_public,
            ephemeral_public,
            local_identity_dh_public,
            otpk_id,
        )))
    }

    pub async fn save(&self, peer_id: &str, session: &RatchetSeed) -> Result<(), CoreError> {
        let mut wire = Vec::with_capacity(1 + 32 * 4 + 5);
        wire.push(SESSION_WIRE_V1);
        wire.extend_from_slice(&session.root_key);
        wire.extend_from_slice(session.remote_public.as_bytes());
        wire.extend_from_slice(session.ephemeral_public.as_bytes());
        wire.extend_from_slice(session.local_identity_dh_public.as_bytes());
        match session.otpk_id {
            Some(id) => {
                wire.push(1);
                wire.extend_from_slice(&id.to_be_bytes());
            }
            None => wire.push(0),
        }
        self.store
            .put(
                Label::Session {
                    peer_id: peer_id.to_owned(),
                },
                wire,
            )
            .await
    }

    /// Called on logout: drops the in-memory map and every persisted
    /// `session_*` entry, including ones bootstrapped by an earlier process
    /// instance that this session never loaded into memory. Identity
    /// material is deliberately untouched.
    pub async fn clear_all(&self) -> Result<(), CoreError> {
        self.sessions.lock().await.clear();
        self.store.delete_by_prefix("session_").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::directory_client::DirectoryClient;
    use crate::peer_fetch::PeerBundleFetcher;
    use protocol::bundle::{generate_signed_prekey, CRYPTO_VERSION};
    use protocol::identity::IdentityKeyPair;
    use proto::service::brongnal_client::BrongnalClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_rusqlite::Connection;
    use tonic::transport::Endpoint;

    async fn manager_with_undialed_directory(own_id: &str) -> SessionManager {
        let connection = Connection::open_in_memory().await.unwrap();
        let store = SqliteSecretStore::open(connection).await.unwrap();
        let channel = Endpoint::from_static("http://[::1]:0").connect_lazy();
        let stub = BrongnalClient::new(channel);
        let config = Config::default();
        let directory = DirectoryClient::new(stub, own_id.to_owned(), &config).unwrap();
        let fetcher = PeerBundleFetcher::new(directory, config);
        SessionManager::new(store, Arc::new(fetcher), own_id.to_owned())
    }

    fn sample_session() -> RatchetSeed {
        let dh = IdentityDhKeyPair::generate();
        RatchetSeed::new([7u8; 32], dh.public(), dh.public(), dh.public(), Some(3))
    }

    #[tokio::test]
    async fn save_then_load_round_trips_a_session() {
        let manager = manager_with_undialed_directory("alice").await;
        let session = sample_session();

        manager.save("bob", &session).await.unwrap();
        let loaded = manager.load("bob").await.unwrap().unwrap();

        assert_eq!(loaded.root_key, session.root_key);
        assert_eq!(loaded.otpk_id, session.otpk_id);
    }

    #[tokio::test]
    async fn load_rejects_an_unrecognized_wire_version() {
        let manager = manager_with_undialed_directory("alice").await;
        manager
            .store
            .put(
                Label::Session {
                    peer_id: "bob".to_owned(),
                },
                vec![99, 0, 0, 0],
            )
            .await
            .unwrap();

        assert!(manager.load("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_all_removes_sessions_never_loaded_into_memory_this_run() {
        let manager = manager_with_undialed_directory("alice").await;
        let session = sample_session();
        // Simulate a session persisted by an earlier process instance:
        // written straight to the store, never inserted into `sessions`.
        manager.save("bob", &session).await.unwrap();
        assert!(manager.sessions.lock().await.is_empty());

        manager.clear_all().await.unwrap();

        assert!(manager.load("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_for_returns_the_cached_copy_without_reloading() {
        let manager = manager_with_undialed_directory("alice").await;
        let session = Arc::new(sample_session());
        manager
            .sessions
            .lock()
            .await
            .insert("bob".to_owned(), session.clone());

        let returned = manager.session_for("bob").await.unwrap();
        assert!(Arc::ptr_eq(&returned, &session));
    }

    /// A `PeerFetch` double that counts invocations and sleeps long enough
    /// for two concurrent `session_for` calls to genuinely overlap inside
    /// the fetch, rather than happening to run back to back.
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl PeerFetch for CountingFetcher {
        fn fetch<'a>(
            &'a self,
            _peer_id: &'a str,
            _own_id: &'a str,
        ) -> futures::future::BoxFuture<'a, Result<protocol::bundle::PeerBundle, CoreError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                let identity = IdentityKeyPair::generate();
                let dh = IdentityDhKeyPair::generate();
                let signed_prekey = generate_signed_prekey(&identity, 0).signed;
                Ok(protocol::bundle::PeerBundle {
                    crypto_version: CRYPTO_VERSION,
                    identity_public: identity.verifying_key(),
                    identity_dh_public: dh.public(),
                    signed_prekey,
                    one_time_prekey: None,
                })
            })
        }
    }

    #[tokio::test]
    async fn concurrent_session_for_calls_bootstrap_at_most_once() {
        let connection = Connection::open_in_memory().await.unwrap();
        let store = SqliteSecretStore::open(connection).await.unwrap();
        let own_dh = IdentityDhKeyPair::generate();
        store
            .put(Label::IdentityDhPriv, own_dh.to_bytes().to_vec())
            .await
            .unwrap();

        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let manager = Arc::new(SessionManager::new(
            store,
            fetcher.clone(),
            "alice".to_owned(),
        ));

        let (m1, m2) = (manager.clone(), manager.clone());
        let (a, b) = tokio::join!(
            tokio::spawn(async move { m1.session_for("bob").await.unwrap() }),
            tokio::spawn(async move { m2.session_for("bob").await.unwrap() }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
