//! Bundle Reconciler: a five-state machine, implemented as a plain enum
//! matched in a loop rather than a trait-object state pattern — this is
//! in-process control flow, not a persisted workflow.

use crate::config::Config;
use crate::directory_client::{DirectoryClient, ProbeResult};
use crate::error::CoreError;
use crate::key_material::{now_unix, KeyMaterialFactory, OTPK_BATCH_SIZE};
use crate::secret_store::{Label, SqliteSecretStore};
use ed25519_dalek::Signature;
use protocol::bundle::{KeyBundle, OneTimePreKey, SignedPreKey, SignedPreKeyMaterial, CRYPTO_VERSION};
use protocol::identity::{IdentityDhKeyPair, IdentityKeyPair};
use tracing::{info, instrument, warn};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

enum ReconcileState {
    Start,
    Probe,
    Decide { probe: ProbeResult },
    GenerateOrRebuild,
    Upload { bundle: KeyBundle },
}

pub struct BundleReconciler {
    store: SqliteSecretStore,
    directory: DirectoryClient,
    config: Config,
}

impl BundleReconciler {
    pub fn new(store: SqliteSecretStore, directory: DirectoryClient, config: Config) -> Self {
        Self {
            store,
            directory,
            config,
        }
    }

    /// Runs to completion or returns early; never panics, never blocks the
    /// caller past the directory's own deadline. Idempotent: a second call
    /// with no intervening server change performs zero writes.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), CoreError> {
        let mut state = ReconcileState::Start;
        loop {
            state = match state {
                ReconcileState::Start => ReconcileState::Probe,
                ReconcileState::Probe => match self.directory.get_key_count().await {
                    Ok(probe) => ReconcileState::Decide { probe },
                    Err(err) => {
                        warn!(error = %err, "bundle probe failed, will retry on next initialize()");
                        return Ok(());
                    }
                },
                ReconcileState::Decide { probe } => {
                    let flag_generated = self.store.get_bool(Label::FlagGenerated).await?;
                    let flag_uploaded = self.store.get_bool(Label::FlagUploaded).await?;
                    let identity_present = self.store.get(Label::IdentityPriv).await?.is_some();

                    if probe.has_key_bundle && flag_generated && flag_uploaded && identity_present {
                        info!("local state already consistent with the directory");
                        return Ok(());
                    }
                    if !probe.has_key_bundle {
                        // Server-side loss: the local flags are stale hints,
                        // not authority. Clear them before rebuilding so a
                        // crash between here and Upload leaves the next
                        // `initialize()` treating this account as
                        // not-yet-uploaded rather than falsely consistent.
                        self.store.put_bool(Label::FlagGenerated, false).await?;
                        self.store.put_bool(Label::FlagUploaded, false).await?;
                    }
                    ReconcileState::GenerateOrRebuild
                }
                ReconcileState::GenerateOrRebuild => {
                    let identity_present = self.store.get(Label::IdentityPriv).await?.is_some();
                    let bundle = if identity_present {
                        self.rebuild_from_store().await?
                    } else {
                        self.generate_fresh().await?
                    };
                    ReconcileState::Upload { bundle }
                }
                ReconcileState::Upload { bundle } => {
                    match self.directory.register_pre_key_bundle(&bundle).await {
                        Ok(()) => {
                            // Re-set both flags: the private material backing
                            // this bundle demonstrably exists (we just built
                            // it, fresh or from the store) and the directory
                            // has now accepted it.
                            self.store.put_bool(Label::FlagGenerated, true).await?;
                            self.store.put_bool(Label::FlagUploaded, true).await?;
                            info!("bundle uploaded");
                        }
                        Err(err) => {
                            warn!(error = %err, "bundle upload failed, will retry on next initialize()");
                        }
                    }
                    return Ok(());
                }
            };
        }
    }

    /// Replenishes one-time prekeys when the directory reports the pool
    /// below `Config::otpk_replenish_threshold`, and rotates the signed
    /// prekey when the directory reports it stale. Either, both, or
    /// neither may fire on a given call; when both fire they ride in the
    /// same upload. Untouched material is re-sent as-is (the directory
    /// upserts by id/identity), so this stays harmless to call repeatedly.
    #[instrument(skip(self))]
    pub async fn check_and_replenish(&self) -> Result<(), CoreError> {
        let probe = match self.directory.get_key_count().await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(error = %err, "replenish probe failed, will retry later");
                return Ok(());
            }
        };

        self.prune_expired_previous_spk().await?;

        let needs_otpk_replenish = probe.available_prekeys < self.config.otpk_replenish_threshold;
        let needs_spk_rotation = probe.signed_prekey_stale;
        if !needs_otpk_replenish && !needs_spk_rotation {
            return Ok(());
        }

        let identity = self.load_identity().await?;
        let identity_dh = self.load_identity_dh().await?;

        let spk = if needs_spk_rotation {
            self.rotate_signed_prekey(&identity).await?
        } else {
            self.load_signed_prekey().await?.signed
        };

        let fresh = if needs_otpk_replenish {
            let start_id = self.next_otpk_id().await?;
            let fresh = KeyMaterialFactory::generate_one_time_prekeys(start_id, OTPK_BATCH_SIZE);
            for otpk in &fresh {
                self.store
                    .put(
                        Label::OtpkPriv { index: otpk.key_id },
                        otpk.secret.to_bytes().to_vec(),
                    )
                    .await?;
            }
            for otpk in &fresh {
                self.store
                    .put(
                        Label::OtpkPub { index: otpk.key_id },
                        otpk.public.as_bytes().to_vec(),
                    )
                    .await?;
            }
            self.store
                .put(
                    Label::OtpkCount,
                    (start_id + fresh.len() as u32).to_be_bytes().to_vec(),
                )
                .await?;
            fresh
        } else {
            Vec::new()
        };

        let bundle = Self::build_public_bundle(&identity, &identity_dh, &spk, &fresh);
        match self.directory.register_pre_key_bundle(&bundle).await {
            Ok(()) => {
                if needs_otpk_replenish {
                    info!(count = fresh.len(), "replenished one-time prekeys");
                }
                if needs_spk_rotation {
                    info!("rotated signed prekey");
                }
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to upload replenished/rotated material, will retry later");
                Ok(())
            }
        }
    }

    /// Moves the outgoing signed prekey's private half to the grace-window
    /// slot (so an in-flight handshake addressed to it can still complete),
    /// then samples and persists a fresh one.
    async fn rotate_signed_prekey(&self, identity: &IdentityKeyPair) -> Result<SignedPreKey, CoreError> {
        if let Some(old_priv) = self.store.get(Label::SpkPriv).await? {
            self.store.put(Label::SpkPrivPrevious, old_priv).await?;
            self.store
                .put(
                    Label::SpkPrivPreviousRetiredAt,
                    now_unix().to_be_bytes().to_vec(),
                )
                .await?;
        }

        let fresh = KeyMaterialFactory::generate_signed_prekey(identity);
        self.store
            .put(Label::SpkPriv, fresh.secret.to_bytes().to_vec())
            .await?;
        self.store
            .put(Label::SpkPub, fresh.signed.public.as_bytes().to_vec())
            .await?;
        self.store
            .put(Label::SpkSig, fresh.signed.signature.to_bytes().to_vec())
            .await?;
        self.store
            .put(Label::SpkTs, fresh.signed.timestamp.to_be_bytes().to_vec())
            .await?;
        Ok(fresh.signed)
    }

    /// Deletes the grace-window signed prekey once `Config::spk_grace_window`
    /// has elapsed since it was retired; in-flight handshakes addressed to it
    /// are assumed complete or abandoned by then.
    async fn prune_expired_previous_spk(&self) -> Result<(), CoreError> {
        let Some(retired_at_bytes) = self.store.get(Label::SpkPrivPreviousRetiredAt).await? else {
            return Ok(());
        };
        let Ok(retired_at_array) = <[u8; 8]>::try_from(retired_at_bytes.as_slice()) else {
            return Ok(());
        };
        let retired_at = u64::from_be_bytes(retired_at_array);
        if now_unix().saturating_sub(retired_at) > self.config.spk_grace_window.as_secs() {
            self.store.delete(Label::SpkPrivPrevious).await?;
            self.store.delete(Label::SpkPrivPreviousRetiredAt).await?;
        }
        Ok(())
    }

    async fn generate_fresh(&self) -> Result<KeyBundle, CoreError> {
        let identity_material = KeyMaterialFactory::generate_identity();
        let spk = KeyMaterialFactory::generate_signed_prekey(&identity_material.identity);
        let otpks = KeyMaterialFactory::generate_one_time_prekeys(0, OTPK_BATCH_SIZE);

        self.persist_private_material(
            &identity_material.identity,
            &identity_material.identity_dh,
            &spk,
            &otpks,
        )
        .await?;
        self.store.put_bool(Label::FlagGenerated, true).await?;

        Ok(Self::build_public_bundle(
            &identity_material.identity,
            &identity_material.identity_dh,
            &spk.signed,
            &otpks,
        ))
    }

    async fn rebuild_from_store(&self) -> Result<KeyBundle, CoreError> {
        let identity = self.load_identity().await?;
        let identity_dh = self.load_identity_dh().await?;
        let spk = self.load_signed_prekey().await?;
        let otpks = self.load_one_time_prekeys().await?;
        Ok(Self::build_public_bundle(
            &identity,
            &identity_dh,
            &spk.signed,
            &otpks,
        ))
    }

    /// Private halves before public halves, so a crash mid-write is
    /// tolerated by the next `initialize()` re-reading.
    async fn persist_private_material(
        &self,
        identity: &IdentityKeyPair,
        identity_dh: &IdentityDhKeyPair,
        spk: &SignedPreKeyMaterial,
        otpks: &[OneTimePreKey],
    ) -> Result<(), CoreError> {
        self.store
            .put(Label::IdentityPriv, identity.to_bytes().to_vec())
            .await?;
        self.store
            .put(Label::IdentityDhPriv, identity_dh.to_bytes().to_vec())
            .await?;
        self.store
            .put(Label::SpkPriv, spk.secret.to_bytes().to_vec())
            .await?;
        for otpk in otpks {
            self.store
                .put(
                    Label::OtpkPriv { index: otpk.key_id },
                    otpk.secret.to_bytes().to_vec(),
                )
                .await?;
        }

        self.store
            .put(
                Label::IdentityPub,
                identity.verifying_key().to_bytes().to_vec(),
            )
            .await?;
        self.store
            .put(Label::IdentityDhPub, identity_dh.public().as_bytes().to_vec())
            .await?;
        self.store
            .put(Label::SpkPub, spk.signed.public.as_bytes().to_vec())
            .await?;
        self.store
            .put(Label::SpkSig, spk.signed.signature.to_bytes().to_vec())
            .await?;
        self.store
            .put(Label::SpkTs, spk.signed.timestamp.to_be_bytes().to_vec())
            .await?;
        self.store
            .put(
                Label::OtpkCount,
                (otpks.len() as u32).to_be_bytes().to_vec(),
            )
            .await?;
        for otpk in otpks {
            self.store
                .put(
                    Label::OtpkPub { index: otpk.key_id },
                    otpk.public.as_bytes().to_vec(),
                )
                .await?;
        }
        Ok(())
    }

    async fn load_identity(&self) -> Result<IdentityKeyPair, CoreError> {
        let bytes = self
            .store
            .get(Label::IdentityPriv)
            .await?
            .ok_or(CoreError::LocalKeysMissing)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::StorageUnavailable("corrupt identity key".into()))?;
        Ok(IdentityKeyPair::from_bytes(&array))
    }

    async fn load_identity_dh(&self) -> Result<IdentityDhKeyPair, CoreError> {
        let bytes = self
            .store
            .get(Label::IdentityDhPriv)
            .await?
            .ok_or(CoreError::LocalKeysMissing)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::StorageUnavailable("corrupt identity dh key".into()))?;
        Ok(IdentityDhKeyPair::from_bytes(array))
    }

    async fn load_signed_prekey(&self) -> Result<SignedPreKeyMaterial, CoreError> {
        let secret_bytes = self
            .store
            .get(Label::SpkPriv)
            .await?
            .ok_or(CoreError::LocalKeysMissing)?;
        let secret_array: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CoreError::StorageUnavailable("corrupt signed prekey".into()))?;
        let secret = X25519StaticSecret::from(secret_array);
        let public = X25519PublicKey::from(&secret);

        let sig_bytes = self
            .store
            .get(Label::SpkSig)
            .await?
            .ok_or(CoreError::LocalKeysMissing)?;
        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| CoreError::StorageUnavailable("corrupt signed prekey signature".into()))?;
        let signature = Signature::from_bytes(&sig_array);

        let ts_bytes = self
            .store
            .get(Label::SpkTs)
            .await?
            .ok_or(CoreError::LocalKeysMissing)?;
        let ts_array: [u8; 8] = ts_bytes
            .try_into()
            .map_err(|_| CoreError::StorageUnavailable("corrupt signed prekey timestamp".into()))?;
        let timestamp = u64::from_be_bytes(ts_array);

        Ok(SignedPreKeyMaterial {
            secret,
            signed: SignedPreKey {
                public,
                signature,
                timestamp,
            },
        })
    }

    async fn next_otpk_id(&self) -> Result<u32, CoreError> {
        let bytes = self.store.get(Label::OtpkCount).await?.unwrap_or_default();
        Ok(match <[u8; 4]>::try_from(bytes.as_slice()) {
            Ok(array) => u32::from_be_bytes(array),
            Err(_) => 0,
        })
    }

    async fn load_one_time_prekeys(&self) -> Result<Vec<OneTimePreKey>, CoreError> {
        let count = self.next_otpk_id().await?;
        let mut otpks = Vec::new();
        for key_id in 0..count {
            let Some(secret_bytes) = self.store.get(Label::OtpkPriv { index: key_id }).await? else {
                continue;
            };
            let secret_array: [u8; 32] = secret_bytes
                .try_into()
                .map_err(|_| CoreError::StorageUnavailable("corrupt one-time prekey".into()))?;
            let secret = X25519StaticSecret::from(secret_array);
            let public = X25519PublicKey::from(&secret);
            otpks.push(OneTimePreKey {
                key_id,
                secret,
                public,
            });
        }
        Ok(otpks)
    }

    fn build_public_bundle(
        identity: &IdentityKeyPair,
        identity_dh: &IdentityDhKeyPair,
        spk: &SignedPreKey,
        otpks: &[OneTimePreKey],
    ) -> KeyBundle {
        KeyBundle {
            crypto_version: CRYPTO_VERSION,
            identity_public: identity.verifying_key(),
            identity_dh_public: identity_dh.public(),
            signed_prekey: spk.clone(),
            one_time_prekeys: otpks.iter().map(|k| (k.key_id, k.public)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::service::brongnal_client::BrongnalClient;
    use tokio_rusqlite::Connection;
    use tonic::transport::Endpoint;

    fn otpk_keys(otpks: &[(u32, X25519PublicKey)]) -> Vec<(u32, [u8; 32])> {
        otpks.iter().map(|(id, pk)| (*id, *pk.as_bytes())).collect()
    }

    /// A `BundleReconciler` wired to a channel that is never actually dialed.
    /// Fine for exercising the store-only helpers below, which never issue
    /// an RPC; anything that calls through `self.directory` would hang or
    /// fail against this stub.
    async fn reconciler_with_undialed_directory(identity: &str) -> BundleReconciler {
        let connection = Connection::open_in_memory().await.unwrap();
        let store = SqliteSecretStore::open(connection).await.unwrap();
        let channel = Endpoint::from_static("http://[::1]:0").connect_lazy();
        let stub = BrongnalClient::new(channel);
        let config = Config::default();
        let directory = DirectoryClient::new(stub, identity.to_owned(), &config).unwrap();
        BundleReconciler::new(store, directory, config)
    }

    #[tokio::test]
    async fn rotate_signed_prekey_retains_old_private_under_grace_label() {
        let reconciler = reconciler_with_undialed_directory("alice").await;
        let identity = KeyMaterialFactory::generate_identity().identity;
        let initial = KeyMaterialFactory::generate_signed_prekey(&identity);
        reconciler
            .store
            .put(Label::SpkPriv, initial.secret.to_bytes().to_vec())
            .await
            .unwrap();

        let rotated = reconciler.rotate_signed_prekey(&identity).await.unwrap();

        assert_ne!(rotated.public.as_bytes(), initial.signed.public.as_bytes());
        assert_eq!(
            reconciler.store.get(Label::SpkPrivPrevious).await.unwrap(),
            Some(initial.secret.to_bytes().to_vec())
        );
        assert!(reconciler
            .store
            .get(Label::SpkPrivPreviousRetiredAt)
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            reconciler.store.get(Label::SpkPub).await.unwrap(),
            Some(rotated.public.as_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn rotate_signed_prekey_with_no_prior_spk_leaves_grace_slot_empty() {
        let reconciler = reconciler_with_undialed_directory("alice").await;
        let identity = KeyMaterialFactory::generate_identity().identity;

        reconciler.rotate_signed_prekey(&identity).await.unwrap();

        assert_eq!(
            reconciler.store.get(Label::SpkPrivPrevious).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn prune_expired_previous_spk_deletes_after_grace_window_elapses() {
        let mut reconciler = reconciler_with_undialed_directory("bob").await;
        reconciler.config.spk_grace_window = std::time::Duration::from_secs(0);
        reconciler
            .store
            .put(Label::SpkPrivPrevious, vec![1, 2, 3])
            .await
            .unwrap();
        reconciler
            .store
            .put(Label::SpkPrivPreviousRetiredAt, 0u64.to_be_bytes().to_vec())
            .await
            .unwrap();

        reconciler.prune_expired_previous_spk().await.unwrap();

        assert_eq!(
            reconciler.store.get(Label::SpkPrivPrevious).await.unwrap(),
            None
        );
        assert_eq!(
            reconciler
                .store
                .get(Label::SpkPrivPreviousRetiredAt)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn prune_expired_previous_spk_keeps_entry_within_grace_window() {
        let reconciler = reconciler_with_undialed_directory("bob").await;
        reconciler
            .store
            .put(Label::SpkPrivPrevious, vec![1, 2, 3])
            .await
            .unwrap();
        reconciler
            .store
            .put(
                Label::SpkPrivPreviousRetiredAt,
                now_unix().to_be_bytes().to_vec(),
            )
            .await
            .unwrap();

        reconciler.prune_expired_previous_spk().await.unwrap();

        assert_eq!(
            reconciler.store.get(Label::SpkPrivPrevious).await.unwrap(),
            Some(vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn prune_expired_previous_spk_is_a_no_op_without_a_retirement_timestamp() {
        let reconciler = reconciler_with_undialed_directory("bob").await;

        reconciler.prune_expired_previous_spk().await.unwrap();
    }

    #[tokio::test]
    async fn generate_fresh_persists_private_material_before_returning_the_bundle() {
        let reconciler = reconciler_with_undialed_directory("carol").await;

        let bundle = reconciler.generate_fresh().await.unwrap();

        assert_eq!(bundle.one_time_prekeys.len(), OTPK_BATCH_SIZE as usize);
        assert!(reconciler
            .store
            .get_bool(Label::FlagGenerated)
            .await
            .unwrap());
        assert!(reconciler
            .store
            .get(Label::IdentityPriv)
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            reconciler.store.get(Label::IdentityPub).await.unwrap(),
            Some(bundle.identity_public.to_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn rebuild_from_store_reuses_the_generated_keys_verbatim() {
        let reconciler = reconciler_with_undialed_directory("carol").await;

        let generated = reconciler.generate_fresh().await.unwrap();
        let rebuilt = reconciler.rebuild_from_store().await.unwrap();

        assert_eq!(
            generated.identity_public.to_bytes(),
            rebuilt.identity_public.to_bytes()
        );
        assert_eq!(
            generated.identity_dh_public.as_bytes(),
            rebuilt.identity_dh_public.as_bytes()
        );
        assert_eq!(
            generated.signed_prekey.public.as_bytes(),
            rebuilt.signed_prekey.public.as_bytes()
        );
        assert_eq!(
            otpk_keys(&generated.one_time_prekeys),
            otpk_keys(&rebuilt.one_time_prekeys)
        );
    }

    #[tokio::test]
    async fn next_otpk_id_starts_at_zero_and_tracks_the_stored_count() {
        let reconciler = reconciler_with_undialed_directory("dave").await;
        assert_eq!(reconciler.next_otpk_id().await.unwrap(), 0);

        reconciler.generate_fresh().await.unwrap();

        assert_eq!(reconciler.next_otpk_id().await.unwrap(), OTPK_BATCH_SIZE);
    }
}
