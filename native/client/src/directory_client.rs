//! Directory RPC transport: a thin wrapper over the generated
//! `BrongnalClient<Channel>` stub. Owns per-call deadlines and the
//! request/response <-> `protocol` type conversions; retries are the
//! caller's problem.

use crate::config::Config;
use crate::error::CoreError;
use proto::service::brongnal_client::BrongnalClient;
use proto::service::{
    GetKeyCountRequest, OneTimePreKey as OneTimePreKeyProto, RegisterPreKeyBundleRequest,
    RequestPreKeysRequest, RetrieveMessagesRequest, SendMessageRequest, X3dhMessage,
};
use protocol::bundle::{KeyBundle, PeerBundle, SignedPreKey};
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::Streaming;

/// The four-field probe result `GetKeyCount` returns.
pub struct ProbeResult {
    pub has_key_bundle: bool,
    pub available_prekeys: u32,
    pub signed_prekey_stale: bool,
    pub needs_replenish: bool,
}

#[derive(Clone)]
pub struct DirectoryClient {
    stub: BrongnalClient<Channel>,
    identity: String,
    deadline: Duration,
    bearer_token: Option<MetadataValue<Ascii>>,
}

impl DirectoryClient {
    /// Fails only if `config.bearer_token` contains bytes that aren't a
    /// legal HTTP header value (ASCII, no control characters); a token
    /// handed to us by the auth layer is expected to already meet that bar.
    pub fn new(
        stub: BrongnalClient<Channel>,
        identity: String,
        config: &Config,
    ) -> Result<Self, CoreError> {
        let bearer_token = config
            .bearer_token
            .as_ref()
            .map(|token| {
                format!("Bearer {token}")
                    .parse::<MetadataValue<Ascii>>()
                    .map_err(|_| CoreError::ConfigError("bearer token is not a valid header value".into()))
            })
            .transpose()?;
        Ok(Self {
            stub,
            identity,
            deadline: config.directory_deadline,
            bearer_token,
        })
    }

    pub fn own_identity(&self) -> &str {
        &self.identity
    }

    /// Attaches the per-RPC deadline and, when the auth layer has supplied
    /// one, a bearer token under the standard `authorization` metadata key.
    /// Every directory RPC flows through here, so there is no path that
    /// leaves the directory unauthenticated once a token is configured.
    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.deadline);
        if let Some(token) = &self.bearer_token {
            request
                .metadata_mut()
                .insert("authorization", token.clone());
        }
        request
    }

    pub async fn get_key_count(&self) -> Result<ProbeResult, CoreError> {
        let mut stub = self.stub.clone();
        let request = self.request(GetKeyCountRequest {
            identity: self.identity.clone(),
        });
        let response = stub.get_key_count(request).await?.into_inner();
        Ok(ProbeResult {
            has_key_bundle: response.has_key_bundle,
            available_prekeys: response.available_prekeys,
            signed_prekey_stale: response.signed_prekey_stale,
            needs_replenish: response.needs_replenish,
        })
    }

    pub async fn register_pre_key_bundle(&self, bundle: &KeyBundle) -> Result<(), CoreError> {
        let mut stub = self.stub.clone();
        let request = self.request(RegisterPreKeyBundleRequest {
            identity: self.identity.clone(),
            crypto_version: bundle.crypto_version,
            identity_key_public: bundle.identity_public.to_bytes().to_vec(),
            identity_dh_key_public: bundle.identity_dh_public.as_bytes().to_vec(),
            signed_prekey: Some((&bundle.signed_prekey).into()),
            one_time_prekeys: bundle
                .one_time_prekeys
                .iter()
                .map(|(key_id, public)| OneTimePreKeyProto {
                    key_id: *key_id,
                    public_key: public.as_bytes().to_vec(),
                })
                .collect(),
        });
        stub.register_pre_key_bundle(request).await?;
        Ok(())
    }

    pub async fn request_pre_keys(&self, peer_identity: &str) -> Result<PeerBundle, CoreError> {
        let mut stub = self.stub.clone();
        let request = self.request(RequestPreKeysRequest {
            identity: self.identity.clone(),
            peer_identity: peer_identity.to_owned(),
        });
        let response = stub.request_pre_keys(request).await?.into_inner();

        let identity_public = proto::parse_verifying_key(&response.identity_key)?;
        let identity_dh_public = proto::parse_x25519_public(&response.identity_dh_key)?;
        let signed_prekey_public = proto::parse_x25519_public(&response.signed_prekey)?;
        let signature = proto::parse_signature(&response.signed_prekey_signature)?;
        let timestamp = response.signed_prekey_timestamp.unwrap_or_default().max(0) as u64;

        let one_time_prekey = match (response.one_time_prekey, response.one_time_prekey_id) {
            (Some(bytes), Some(key_id)) => Some((key_id, proto::parse_x25519_public(&bytes)?)),
            _ => None,
        };

        Ok(PeerBundle {
            crypto_version: response.crypto_version,
            identity_public,
            identity_dh_public,
            signed_prekey: SignedPreKey {
                public: signed_prekey_public,
                signature,
                timestamp,
            },
            one_time_prekey,
        })
    }

    /// Demo mailbox RPC; external collaborator, not part of the
    /// key-agreement core proper.
    pub async fn send_message(
        &self,
        recipient_identity: &str,
        message: X3dhMessage,
    ) -> Result<(), CoreError> {
        let mut stub = self.stub.clone();
        let request = self.request(SendMessageRequest {
            recipient_identity: recipient_identity.to_owned(),
            message: Some(message),
        });
        stub.send_message(request).await?;
        Ok(())
    }

    pub async fn retrieve_messages(&self) -> Result<Streaming<X3dhMessage>, CoreError> {
        let mut stub = self.stub.clone();
        let request = self.request(RetrieveMessagesRequest {
            identity: self.identity.clone(),
        });
        Ok(stub.retrieve_messages(request).await?.into_inner())
    }
}
