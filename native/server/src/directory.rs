//! The generated `Brongnal` service trait (the four directory RPCs plus the
//! demo mailbox pair), wired to whatever `Storage` implementation the
//! caller plugs in.

use crate::storage::{KeyCount, PeerKeys, StoredBundle, StoredMessage, Storage};
use async_stream::try_stream;
use futures::Stream;
use proto::service::brongnal_server::Brongnal;
use proto::service::{
    GetKeyCountRequest, GetKeyCountResponse, PreKeyBundleResponse, RegisterPreKeyBundleRequest,
    RegisterPreKeyBundleResponse, RequestPreKeysRequest, RetrieveMessagesRequest,
    SendMessageRequest, SendMessageResponse, X3dhMessage,
};
use proto::{parse_signature, parse_verifying_key, parse_x25519_public, ProtoConvertError};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

/// Bounded so a recipient who never connects can't grow a mailbox without
/// limit; messages that don't fit are still recoverable from `take_messages`
/// on the next `RetrieveMessages` call (lagged subscribers just skip ahead).
const MAILBOX_CAPACITY: usize = 64;

fn invalid_argument<E: std::fmt::Display>(err: E) -> Status {
    Status::invalid_argument(err.to_string())
}

pub struct BrongnalController<S> {
    storage: S,
    mailboxes: Arc<Mutex<HashMap<String, broadcast::Sender<X3dhMessage>>>>,
}

impl<S: Storage> BrongnalController<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn mailbox(&self, identity: &str) -> broadcast::Sender<X3dhMessage> {
        let mut mailboxes = self.mailboxes.lock().await;
        mailboxes
            .entry(identity.to_owned())
            .or_insert_with(|| broadcast::channel(MAILBOX_CAPACITY).0)
            .clone()
    }
}

fn bundle_from_request(req: &RegisterPreKeyBundleRequest) -> Result<StoredBundle, ProtoConvertError> {
    let signed_prekey = req
        .signed_prekey
        .as_ref()
        .ok_or(ProtoConvertError::MissingField("signed_prekey"))?;
    Ok(StoredBundle {
        crypto_version: req.crypto_version,
        identity_key: parse_verifying_key(&req.identity_key_public)?,
        identity_dh_key: parse_x25519_public(&req.identity_dh_key_public)?,
        signed_prekey: parse_x25519_public(&signed_prekey.public_key)?,
        signed_prekey_signature: parse_signature(&signed_prekey.signature)?,
        signed_prekey_timestamp: signed_prekey.timestamp,
        one_time_prekeys: req
            .one_time_prekeys
            .iter()
            .map(|otpk| Ok((otpk.key_id, parse_x25519_public(&otpk.public_key)?)))
            .collect::<Result<Vec<_>, ProtoConvertError>>()?,
    })
}

fn key_count_response(count: KeyCount) -> GetKeyCountResponse {
    GetKeyCountResponse {
        has_key_bundle: count.has_key_bundle,
        available_prekeys: count.available_prekeys,
        signed_prekey_stale: count.signed_prekey_stale,
        needs_replenish: count.needs_replenish,
    }
}

fn peer_bundle_response(user_id: String, peer: PeerKeys) -> PreKeyBundleResponse {
    // The directory does not assign a separate id to the signed prekey
    // itself (only one-time prekeys carry an id); left at 0.
    let one_time_prekey_id = peer.one_time_prekey.as_ref().map(|(id, _)| *id);
    let one_time_prekey = peer
        .one_time_prekey
        .map(|(_, public)| public.as_bytes().to_vec());
    PreKeyBundleResponse {
        user_id,
        crypto_version: peer.crypto_version,
        identity_key: peer.identity_key.to_bytes().to_vec(),
        identity_dh_key: peer.identity_dh_key.as_bytes().to_vec(),
        signed_prekey: peer.signed_prekey.as_bytes().to_vec(),
        signed_prekey_signature: peer.signed_prekey_signature.to_bytes().to_vec(),
        signed_prekey_id: 0,
        signed_prekey_timestamp: Some(peer.signed_prekey_timestamp),
        one_time_prekey,
        one_time_prekey_id,
        prekeys_remaining: peer.prekeys_remaining,
    }
}

fn message_from_proto(message: X3dhMessage) -> StoredMessage {
    StoredMessage {
        sender_identity: message.sender_identity,
        sender_identity_key: message.sender_identity_key,
        sender_identity_dh_key: message.sender_identity_dh_key,
        ephemeral_key: message.ephemeral_key,
        one_time_key_id: message.one_time_key_id,
        ciphertext: message.ciphertext,
    }
}

fn message_to_proto(message: StoredMessage) -> X3dhMessage {
    X3dhMessage {
        sender_identity: message.sender_identity,
        sender_identity_key: message.sender_identity_key,
        sender_identity_dh_key: message.sender_identity_dh_key,
        ephemeral_key: message.ephemeral_key,
        one_time_key_id: message.one_time_key_id,
        ciphertext: message.ciphertext,
    }
}

#[tonic::async_trait]
impl<S: Storage + 'static> Brongnal for BrongnalController<S> {
    type RetrieveMessagesStream = Pin<Box<dyn Stream<Item = Result<X3dhMessage, Status>> + Send>>;

    #[instrument(skip(self, request))]
    async fn get_key_count(
        &self,
        request: Request<GetKeyCountRequest>,
    ) -> Result<Response<GetKeyCountResponse>, Status> {
        let identity = request.into_inner().identity;
        let count = self.storage.get_key_count(&identity).await?;
        Ok(Response::new(key_count_response(count)))
    }

    #[instrument(skip(self, request))]
    async fn register_pre_key_bundle(
        &self,
        request: Request<RegisterPreKeyBundleRequest>,
    ) -> Result<Response<RegisterPreKeyBundleResponse>, Status> {
        let req = request.into_inner();
        let bundle = bundle_from_request(&req).map_err(invalid_argument)?;
        let prekeys_created = bundle.one_time_prekeys.len() as u32;
        let crypto_version = bundle.crypto_version;
        self.storage
            .register_pre_key_bundle(&req.identity, bundle)
            .await?;
        let count = self.storage.get_key_count(&req.identity).await?;
        info!(identity = %req.identity, prekeys_created, "registered pre-key bundle");
        Ok(Response::new(RegisterPreKeyBundleResponse {
            prekeys_created,
            prekeys_available: count.available_prekeys,
            signed_prekey_id: 0,
            crypto_version,
        }))
    }

    #[instrument(skip(self, request))]
    async fn request_pre_keys(
        &self,
        request: Request<RequestPreKeysRequest>,
    ) -> Result<Response<PreKeyBundleResponse>, Status> {
        let req = request.into_inner();
        if req.peer_identity == req.identity {
            return Err(Status::invalid_argument(
                "cannot request one's own key bundle",
            ));
        }
        let peer = self.storage.request_pre_keys(&req.peer_identity).await?;
        Ok(Response::new(peer_bundle_response(req.peer_identity, peer)))
    }

    #[instrument(skip(self, request))]
    async fn send_message(
        &self,
        request: Request<SendMessageRequest>,
    ) -> Result<Response<SendMessageResponse>, Status> {
        let req = request.into_inner();
        let message = req
            .message
            .ok_or_else(|| Status::invalid_argument("missing message"))?;
        self.storage
            .add_message(&req.recipient_identity, message_from_proto(message.clone()))
            .await?;
        // Best-effort live delivery; a recipient with no active
        // `RetrieveMessages` stream simply finds it via the backlog drain.
        let _ = self.mailbox(&req.recipient_identity).await.send(message);
        Ok(Response::new(SendMessageResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn retrieve_messages(
        &self,
        request: Request<RetrieveMessagesRequest>,
    ) -> Result<Response<Self::RetrieveMessagesStream>, Status> {
        let identity = request.into_inner().identity;
        let backlog = self.storage.take_messages(&identity).await?;
        let live = self.mailbox(&identity).await.subscribe();
        Ok(Response::new(Box::pin(mailbox_stream(backlog, live))))
    }
}

/// Drains whatever was already stored, then forwards live deliveries until
/// the mailbox is dropped. A lagged subscriber just skips ahead; the
/// messages it missed are still durable in storage for the next connect.
fn mailbox_stream(
    backlog: Vec<StoredMessage>,
    mut live: broadcast::Receiver<X3dhMessage>,
) -> impl Stream<Item = Result<X3dhMessage, Status>> {
    try_stream! {
        for message in backlog {
            yield message_to_proto(message);
        }
        loop {
            match live.recv().await {
                Ok(message) => yield message,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_storage::SqliteStorage;
    use client::memory_client::MemoryClient;
    use tokio_rusqlite::Connection;

    async fn controller() -> BrongnalController<SqliteStorage> {
        let connection = Connection::open_in_memory().await.unwrap();
        BrongnalController::new(SqliteStorage::new(connection).await.unwrap())
    }

    fn register_request(identity: &str, client: &mut MemoryClient, otpk_count: u32) -> RegisterPreKeyBundleRequest {
        let spk = client.signed_prekey();
        let otpks = client.add_one_time_keys(otpk_count);
        RegisterPreKeyBundleRequest {
            identity: identity.to_owned(),
            crypto_version: protocol::bundle::CRYPTO_VERSION,
            identity_key_public: client.identity().verifying_key().to_bytes().to_vec(),
            identity_dh_key_public: client.identity_dh().public().as_bytes().to_vec(),
            signed_prekey: Some(proto::service::SignedPreKeyProto {
                public_key: spk.public.as_bytes().to_vec(),
                signature: spk.signature.to_bytes().to_vec(),
                timestamp: spk.timestamp as i64,
            }),
            one_time_prekeys: otpks
                .into_iter()
                .map(|(key_id, public)| proto::service::OneTimePreKey {
                    key_id,
                    public_key: public.as_bytes().to_vec(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn register_then_probe_reports_bundle_present() {
        let controller = controller().await;
        let mut alice = MemoryClient::new();
        controller
            .register_pre_key_bundle(Request::new(register_request("alice", &mut alice, 5)))
            .await
            .unwrap();

        let response = controller
            .get_key_count(Request::new(GetKeyCountRequest {
                identity: "alice".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.has_key_bundle);
        assert_eq!(response.available_prekeys, 5);
    }

    #[tokio::test]
    async fn request_pre_keys_rejects_self_lookup() {
        let controller = controller().await;
        let err = controller
            .request_pre_keys(Request::new(RequestPreKeysRequest {
                identity: "alice".into(),
                peer_identity: "alice".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn request_pre_keys_on_unprovisioned_peer_is_not_found() {
        let controller = controller().await;
        let err = controller
            .request_pre_keys(Request::new(RequestPreKeysRequest {
                identity: "alice".into(),
                peer_identity: "bob".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn send_then_retrieve_drains_backlog() {
        let controller = controller().await;
        let mut bob = MemoryClient::new();
        controller
            .register_pre_key_bundle(Request::new(register_request("bob", &mut bob, 0)))
            .await
            .unwrap();

        controller
            .send_message(Request::new(SendMessageRequest {
                recipient_identity: "bob".into(),
                message: Some(X3dhMessage {
                    sender_identity: "alice".into(),
                    sender_identity_key: vec![1; 32],
                    sender_identity_dh_key: vec![2; 32],
                    ephemeral_key: vec![3; 32],
                    one_time_key_id: None,
                    ciphertext: b"hi".to_vec(),
                }),
            }))
            .await
            .unwrap();

        use tokio_stream::StreamExt;
        let mut stream = controller
            .retrieve_messages(Request::new(RetrieveMessagesRequest {
                identity: "bob".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.ciphertext, b"hi");
    }
}
