//! Peer Bundle Fetcher & Verifier.

use crate::config::Config;
use crate::directory_client::DirectoryClient;
use crate::error::CoreError;
use futures::future::BoxFuture;
use protocol::bundle::{check_crypto_version, verify_signed_prekey, PeerBundle};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

/// Abstraction the Session Manager bootstraps through, so its single-flight
/// locking can be exercised against a test double instead of a live
/// directory round trip.
pub trait PeerFetch: Send + Sync {
    fn fetch<'a>(
        &'a self,
        peer_id: &'a str,
        own_id: &'a str,
    ) -> BoxFuture<'a, Result<PeerBundle, CoreError>>;
}

#[derive(Clone)]
pub struct PeerBundleFetcher {
    directory: DirectoryClient,
    config: Config,
    /// OTPK ids already handed out per peer, so a directory bug or replay
    /// that repeats an id is caught client-side rather than silently
    /// reused. Each `key_id` is only unique within one peer's namespace.
    seen_otpk_ids: Arc<Mutex<HashMap<String, HashSet<u32>>>>,
}

impl PeerBundleFetcher {
    pub fn new(directory: DirectoryClient, config: Config) -> Self {
        Self {
            directory,
            config,
            seen_otpk_ids: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[instrument(skip(self), fields(peer = %peer_id))]
    pub async fn fetch(&self, peer_id: &str, own_id: &str) -> Result<PeerBundle, CoreError> {
        if peer_id == own_id {
            return Err(CoreError::PeerIsSelf);
        }

        let bundle = self.directory.request_pre_keys(peer_id).await?;

        check_crypto_version(bundle.crypto_version)?;

        if let Err(err) = verify_signed_prekey(&bundle.identity_public, &bundle.signed_prekey) {
            if self.config.fail_closed_on_signature_error {
                return Err(err.into());
            }
            warn!(
                peer = %peer_id,
                "signed prekey signature did not verify; continuing because \
                 fail_closed_on_signature_error is disabled"
            );
        }

        if let Some((key_id, _)) = bundle.one_time_prekey {
            self.record_otpk_id(peer_id, key_id).await?;
        }

        Ok(bundle)
    }

    /// Records that `peer_id` has handed out one-time prekey `key_id`;
    /// errors if this fetcher already saw that id for that peer.
    async fn record_otpk_id(&self, peer_id: &str, key_id: u32) -> Result<(), CoreError> {
        let mut seen = self.seen_otpk_ids.lock().await;
        if seen.entry(peer_id.to_owned()).or_default().insert(key_id) {
            Ok(())
        } else {
            Err(CoreError::BundleMalformed(format!(
                "one-time prekey id {key_id} was already consumed for peer {peer_id}"
            )))
        }
    }
}

impl PeerFetch for PeerBundleFetcher {
    fn fetch<'a>(
        &'a self,
        peer_id: &'a str,
        own_id: &'a str,
    ) -> BoxFuture<'a, Result<PeerBundle, CoreError>> {
        Box::pin(PeerBundleFetcher::fetch(self, peer_id, own_id))
    }
}
