//! `rusqlite` behind a `tokio_rusqlite::Connection`, the same pairing the
//! client's Secret Store uses. WAL journal mode, foreign keys on, and
//! one-time prekey consumption via an atomic `DELETE ... RETURNING`.

use crate::storage::{KeyCount, PeerKeys, StoredBundle, StoredMessage, Storage};
use ed25519_dalek::{Signature, VerifyingKey};
use proto::{parse_signature, parse_verifying_key, parse_x25519_public};
use rusqlite::{params, OptionalExtension};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_rusqlite::Connection;
use tonic::Status;
use x25519_dalek::PublicKey as X25519PublicKey;

/// Signed prekeys older than this are reported `signed_prekey_stale`.
const SPK_ROTATION_PERIOD_SECS: i64 = 7 * 24 * 60 * 60;
/// Below this many remaining OTPKs, `needs_replenish` is set. Matches the
/// client's own `Config::otpk_replenish_threshold` default.
const REPLENISH_THRESHOLD: u32 = 20;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_secs() as i64
}

fn internal<E: std::fmt::Display>(err: E) -> Status {
    Status::internal(err.to_string())
}

#[derive(Clone)]
pub struct SqliteStorage {
    connection: Connection,
}

impl SqliteStorage {
    pub async fn new(connection: Connection) -> Result<Self, Box<dyn std::error::Error>> {
        connection
            .call(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "synchronous", "normal")?;
                conn.pragma_update(None, "foreign_keys", "on")?;

                conn.execute(
                    "CREATE TABLE IF NOT EXISTS user (
                         identity STRING PRIMARY KEY,
                         crypto_version INTEGER NOT NULL,
                         identity_key BLOB NOT NULL,
                         identity_dh_key BLOB NOT NULL,
                         signed_prekey BLOB NOT NULL,
                         signed_prekey_signature BLOB NOT NULL,
                         signed_prekey_timestamp INTEGER NOT NULL
                     )",
                    (),
                )?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS one_time_prekey (
                         user_identity STRING NOT NULL,
                         key_id INTEGER NOT NULL,
                         public_key BLOB NOT NULL,
                         creation_time INTEGER NOT NULL,
                         PRIMARY KEY (user_identity, key_id),
                         FOREIGN KEY(user_identity) REFERENCES user(identity)
                     )",
                    (),
                )?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS message (
                         id INTEGER PRIMARY KEY AUTOINCREMENT,
                         recipient_identity STRING NOT NULL,
                         sender_identity STRING NOT NULL,
                         sender_identity_key BLOB NOT NULL,
                         sender_identity_dh_key BLOB NOT NULL,
                         ephemeral_key BLOB NOT NULL,
                         one_time_key_id INTEGER,
                         ciphertext BLOB NOT NULL,
                         creation_time INTEGER NOT NULL,
                         FOREIGN KEY(recipient_identity) REFERENCES user(identity)
                     )",
                    (),
                )?;
                Ok(())
            })
            .await?;
        Ok(Self { connection })
    }
}

#[tonic::async_trait]
impl Storage for SqliteStorage {
    async fn register_pre_key_bundle(
        &self,
        identity: &str,
        bundle: StoredBundle,
    ) -> tonic::Result<()> {
        let identity = identity.to_owned();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO user (identity, crypto_version, identity_key, identity_dh_key,
                         signed_prekey, signed_prekey_signature, signed_prekey_timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(identity) DO UPDATE SET
                         crypto_version = excluded.crypto_version,
                         identity_key = excluded.identity_key,
                         identity_dh_key = excluded.identity_dh_key,
                         signed_prekey = excluded.signed_prekey,
                         signed_prekey_signature = excluded.signed_prekey_signature,
                         signed_prekey_timestamp = excluded.signed_prekey_timestamp",
                    params![
                        identity,
                        bundle.crypto_version,
                        bundle.identity_key.to_bytes(),
                        bundle.identity_dh_key.as_bytes(),
                        bundle.signed_prekey.as_bytes(),
                        bundle.signed_prekey_signature.to_bytes(),
                        bundle.signed_prekey_timestamp,
                    ],
                )?;
                for (key_id, public) in &bundle.one_time_prekeys {
                    tx.execute(
                        "INSERT INTO one_time_prekey (user_identity, key_id, public_key, creation_time)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(user_identity, key_id) DO UPDATE SET
                             public_key = excluded.public_key,
                             creation_time = excluded.creation_time",
                        params![identity, key_id, public.as_bytes(), now_secs()],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(internal)
    }

    async fn get_key_count(&self, identity: &str) -> tonic::Result<KeyCount> {
        let identity = identity.to_owned();
        self.connection
            .call(move |conn| {
                let signed_prekey_timestamp: Option<i64> = conn
                    .query_row(
                        "SELECT signed_prekey_timestamp FROM user WHERE identity = ?1",
                        [&identity],
                        |row| row.get(0),
                    )
                    .optional()?;

                let Some(signed_prekey_timestamp) = signed_prekey_timestamp else {
                    return Ok(KeyCount {
                        has_key_bundle: false,
                        available_prekeys: 0,
                        signed_prekey_stale: false,
                        needs_replenish: false,
                    });
                };

                let available_prekeys: u32 = conn.query_row(
                    "SELECT COUNT(*) FROM one_time_prekey WHERE user_identity = ?1",
                    [&identity],
                    |row| row.get(0),
                )?;

                Ok(KeyCount {
                    has_key_bundle: true,
                    available_prekeys,
                    signed_prekey_stale: now_secs() - signed_prekey_timestamp > SPK_ROTATION_PERIOD_SECS,
                    needs_replenish: available_prekeys < REPLENISH_THRESHOLD,
                })
            })
            .await
            .map_err(internal)
    }

    async fn request_pre_keys(&self, peer_identity: &str) -> tonic::Result<PeerKeys> {
        let peer_identity = peer_identity.to_owned();
        self.connection
            .call(move |conn| {
                let (crypto_version, identity_key, identity_dh_key, signed_prekey, signed_prekey_signature, signed_prekey_timestamp):
                    (u32, Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>, i64) = conn
                    .query_row(
                        "SELECT crypto_version, identity_key, identity_dh_key, signed_prekey,
                             signed_prekey_signature, signed_prekey_timestamp
                         FROM user WHERE identity = ?1",
                        [&peer_identity],
                        |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                                row.get(5)?,
                            ))
                        },
                    )
                    .optional()?
                    .ok_or_else(|| rusqlite::Error::QueryReturnedNoRows)?;

                let popped: Option<(u32, Vec<u8>)> = conn
                    .query_row(
                        "DELETE FROM one_time_prekey
                         WHERE rowid = (
                             SELECT rowid FROM one_time_prekey
                             WHERE user_identity = ?1 ORDER BY creation_time LIMIT 1
                         )
                         RETURNING key_id, public_key",
                        [&peer_identity],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let prekeys_remaining: u32 = conn.query_row(
                    "SELECT COUNT(*) FROM one_time_prekey WHERE user_identity = ?1",
                    [&peer_identity],
                    |row| row.get(0),
                )?;

                Ok((
                    crypto_version,
                    identity_key,
                    identity_dh_key,
                    signed_prekey,
                    signed_prekey_signature,
                    signed_prekey_timestamp,
                    popped,
                    prekeys_remaining,
                ))
            })
            .await
            .map_err(|e| match e {
                tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows) => {
                    Status::not_found("peer has not provisioned a key bundle")
                }
                other => internal(other),
            })
            .and_then(
                |(
                    crypto_version,
                    identity_key,
                    identity_dh_key,
                    signed_prekey,
                    signed_prekey_signature,
                    signed_prekey_timestamp,
                    popped,
                    prekeys_remaining,
                )| {
                    Ok(PeerKeys {
                        crypto_version,
                        identity_key: parse_verifying_key(&identity_key).map_err(internal)?,
                        identity_dh_key: parse_x25519_public(&identity_dh_key).map_err(internal)?,
                        signed_prekey: parse_x25519_public(&signed_prekey).map_err(internal)?,
                        signed_prekey_signature: parse_signature(&signed_prekey_signature)
                            .map_err(internal)?,
                        signed_prekey_timestamp,
                        one_time_prekey: match popped {
                            Some((key_id, public)) => {
                                Some((key_id, parse_x25519_public(&public).map_err(internal)?))
                            }
                            None => None,
                        },
                        prekeys_remaining,
                    })
                },
            )
    }

    async fn add_message(&self, recipient: &str, message: StoredMessage) -> tonic::Result<()> {
        let recipient = recipient.to_owned();
        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO message (recipient_identity, sender_identity, sender_identity_key,
                         sender_identity_dh_key, ephemeral_key, one_time_key_id, ciphertext, creation_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        recipient,
                        message.sender_identity,
                        message.sender_identity_key,
                        message.sender_identity_dh_key,
                        message.ephemeral_key,
                        message.one_time_key_id,
                        message.ciphertext,
                        now_secs(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(internal)
    }

    async fn take_messages(&self, identity: &str) -> tonic::Result<Vec<StoredMessage>> {
        let identity = identity.to_owned();
        self.connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "DELETE FROM message WHERE recipient_identity = ?1
                     RETURNING sender_identity, sender_identity_key, sender_identity_dh_key,
                         ephemeral_key, one_time_key_id, ciphertext",
                )?;
                let rows = stmt.query_map([&identity], |row| {
                    Ok(StoredMessage {
                        sender_identity: row.get(0)?,
                        sender_identity_key: row.get(1)?,
                        sender_identity_dh_key: row.get(2)?,
                        ephemeral_key: row.get(3)?,
                        one_time_key_id: row.get(4)?,
                        ciphertext: row.get(5)?,
                    })
                })?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .await
            .map_err(internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::memory_client::MemoryClient;

    async fn storage() -> SqliteStorage {
        let connection = Connection::open_in_memory().await.unwrap();
        SqliteStorage::new(connection).await.unwrap()
    }

    fn bundle_from(client: &mut MemoryClient, otpk_count: u32) -> StoredBundle {
        let spk = client.signed_prekey();
        let otpks = client.add_one_time_keys(otpk_count);
        StoredBundle {
            crypto_version: protocol::bundle::CRYPTO_VERSION,
            identity_key: client.identity().verifying_key(),
            identity_dh_key: client.identity_dh().public(),
            signed_prekey: spk.public,
            signed_prekey_signature: spk.signature,
            signed_prekey_timestamp: spk.timestamp as i64,
            one_time_prekeys: otpks,
        }
    }

    #[tokio::test]
    async fn get_key_count_unknown_user_has_no_bundle() {
        let storage = storage().await;
        let count = storage.get_key_count("alice").await.unwrap();
        assert!(!count.has_key_bundle);
    }

    #[tokio::test]
    async fn register_then_get_key_count_reports_available_prekeys() {
        let storage = storage().await;
        let mut alice = MemoryClient::new();
        let bundle = bundle_from(&mut alice, 5);
        storage
            .register_pre_key_bundle("alice", bundle)
            .await
            .unwrap();

        let count = storage.get_key_count("alice").await.unwrap();
        assert!(count.has_key_bundle);
        assert_eq!(count.available_prekeys, 5);
        assert!(!count.signed_prekey_stale);
    }

    #[tokio::test]
    async fn request_pre_keys_on_unknown_peer_is_not_found() {
        let storage = storage().await;
        let err = storage.request_pre_keys("bob").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn request_pre_keys_pops_exactly_one_otpk() {
        let storage = storage().await;
        let mut bob = MemoryClient::new();
        let bundle = bundle_from(&mut bob, 2);
        storage.register_pre_key_bundle("bob", bundle).await.unwrap();

        let first = storage.request_pre_keys("bob").await.unwrap();
        assert!(first.one_time_prekey.is_some());
        assert_eq!(first.prekeys_remaining, 1);

        let second = storage.request_pre_keys("bob").await.unwrap();
        assert!(second.one_time_prekey.is_some());
        assert_eq!(second.prekeys_remaining, 0);

        let third = storage.request_pre_keys("bob").await.unwrap();
        assert!(third.one_time_prekey.is_none());
    }

    #[tokio::test]
    async fn replenish_upserts_without_disturbing_signed_prekey() {
        let storage = storage().await;
        let mut carol = MemoryClient::new();
        let first_bundle = bundle_from(&mut carol, 1);
        let spk = first_bundle.signed_prekey;
        storage
            .register_pre_key_bundle("carol", first_bundle)
            .await
            .unwrap();

        let replenished = StoredBundle {
            crypto_version: protocol::bundle::CRYPTO_VERSION,
            identity_key: carol.identity().verifying_key(),
            identity_dh_key: carol.identity_dh().public(),
            signed_prekey: spk,
            signed_prekey_signature: carol.signed_prekey().signature,
            signed_prekey_timestamp: carol.signed_prekey().timestamp as i64,
            one_time_prekeys: carol.add_one_time_keys(3),
        };
        storage
            .register_pre_key_bundle("carol", replenished)
            .await
            .unwrap();

        let count = storage.get_key_count("carol").await.unwrap();
        assert_eq!(count.available_prekeys, 4);
    }

    #[tokio::test]
    async fn add_and_take_messages_round_trip() {
        let storage = storage().await;
        let mut bob = MemoryClient::new();
        let bundle = bundle_from(&mut bob, 0);
        storage.register_pre_key_bundle("bob", bundle).await.unwrap();

        storage
            .add_message(
                "bob",
                StoredMessage {
                    sender_identity: "alice".into(),
                    sender_identity_key: vec![1; 32],
                    sender_identity_dh_key: vec![2; 32],
                    ephemeral_key: vec![3; 32],
                    one_time_key_id: Some(0),
                    ciphertext: b"hello".to_vec(),
                },
            )
            .await
            .unwrap();

        let messages = storage.take_messages("bob").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ciphertext, b"hello");

        let drained = storage.take_messages("bob").await.unwrap();
        assert!(drained.is_empty());
    }
}
