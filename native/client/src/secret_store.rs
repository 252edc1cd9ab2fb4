//! Secret Store: an opaque labelled persistent map from `Label` to byte
//! strings, backed by `rusqlite` behind a `tokio_rusqlite::Connection` — the
//! same pairing the directory server uses for its own tables.

use crate::error::{storage_unavailable, CoreError};
use rusqlite::params;
use strum_macros::Display;
use tokio_rusqlite::Connection;

/// Exhaustive label taxonomy. Rendered to the storage column via
/// `#[strum(to_string = ...)]` rather than ad-hoc string formatting
/// scattered across call sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum Label {
    #[strum(to_string = "identity_priv")]
    IdentityPriv,
    #[strum(to_string = "identity_pub")]
    IdentityPub,
    #[strum(to_string = "identity_dh_priv")]
    IdentityDhPriv,
    #[strum(to_string = "identity_dh_pub")]
    IdentityDhPub,
    #[strum(to_string = "spk_priv")]
    SpkPriv,
    #[strum(to_string = "spk_priv_previous")]
    SpkPrivPrevious,
    #[strum(to_string = "spk_priv_previous_retired_at")]
    SpkPrivPreviousRetiredAt,
    #[strum(to_string = "spk_pub")]
    SpkPub,
    #[strum(to_string = "spk_sig")]
    SpkSig,
    #[strum(to_string = "spk_ts")]
    SpkTs,
    #[strum(to_string = "otpk_count")]
    OtpkCount,
    #[strum(to_string = "otpk_{index}_priv")]
    OtpkPriv { index: u32 },
    #[strum(to_string = "otpk_{index}_pub")]
    OtpkPub { index: u32 },
    #[strum(to_string = "flag_generated")]
    FlagGenerated,
    #[strum(to_string = "flag_uploaded")]
    FlagUploaded,
    #[strum(to_string = "session_{peer_id}")]
    Session { peer_id: String },
}

impl Label {
    pub fn key(&self) -> String {
        self.to_string()
    }
}

#[derive(Clone)]
pub struct SqliteSecretStore {
    connection: Connection,
}

impl SqliteSecretStore {
    pub async fn open(connection: Connection) -> Result<Self, CoreError> {
        connection
            .call(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "synchronous", "normal")?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS secret (
                         label TEXT PRIMARY KEY,
                         value BLOB NOT NULL
                     )",
                    (),
                )?;
                Ok(())
            })
            .await
            .map_err(storage_unavailable)?;
        Ok(Self { connection })
    }

    pub async fn put(&self, label: Label, bytes: Vec<u8>) -> Result<(), CoreError> {
        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO secret (label, value) VALUES (?1, ?2)
                     ON CONFLICT(label) DO UPDATE SET value = excluded.value",
                    params![label.key(), bytes],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_unavailable)
    }

    pub async fn get(&self, label: Label) -> Result<Option<Vec<u8>>, CoreError> {
        self.connection
            .call(move |conn| {
                match conn.query_row(
                    "SELECT value FROM secret WHERE label = ?1",
                    params![label.key()],
                    |row| row.get(0),
                ) {
                    Ok(value) => Ok(Some(value)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(storage_unavailable)
    }

    pub async fn delete(&self, label: Label) -> Result<(), CoreError> {
        self.connection
            .call(move |conn| {
                conn.execute("DELETE FROM secret WHERE label = ?1", params![label.key()])?;
                Ok(())
            })
            .await
            .map_err(storage_unavailable)
    }

    /// Deletes every label whose rendered key starts with `prefix`. Used by
    /// `SessionManager::clear_all` to drop `session_*` entries that were
    /// never loaded into the in-memory map this process run (e.g. persisted
    /// by an earlier process instance).
    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<(), CoreError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.connection
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM secret WHERE label LIKE ?1 ESCAPE '\\'",
                    params![pattern],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_unavailable)
    }

    pub async fn put_bool(&self, label: Label, value: bool) -> Result<(), CoreError> {
        self.put(label, vec![value as u8]).await
    }

    pub async fn get_bool(&self, label: Label) -> Result<bool, CoreError> {
        Ok(self
            .get(label)
            .await?
            .map(|bytes| bytes.first() == Some(&1))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteSecretStore {
        let connection = Connection::open_in_memory().await.unwrap();
        SqliteSecretStore::open(connection).await.unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = memory_store().await;
        store
            .put(Label::IdentityPriv, vec![1, 2, 3, 4])
            .await
            .unwrap();
        assert_eq!(
            store.get(Label::IdentityPriv).await.unwrap(),
            Some(vec![1, 2, 3, 4])
        );
    }

    #[tokio::test]
    async fn get_absent_label_is_none() {
        let store = memory_store().await;
        assert_eq!(store.get(Label::FlagGenerated).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_existing_value() {
        let store = memory_store().await;
        store.put(Label::SpkPriv, vec![1]).await.unwrap();
        store.put(Label::SpkPriv, vec![2]).await.unwrap();
        assert_eq!(store.get(Label::SpkPriv).await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn delete_removes_value() {
        let store = memory_store().await;
        store.put(Label::FlagUploaded, vec![1]).await.unwrap();
        store.delete(Label::FlagUploaded).await.unwrap();
        assert_eq!(store.get(Label::FlagUploaded).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bool_helpers_round_trip() {
        let store = memory_store().await;
        assert!(!store.get_bool(Label::FlagGenerated).await.unwrap());
        store.put_bool(Label::FlagGenerated, true).await.unwrap();
        assert!(store.get_bool(Label::FlagGenerated).await.unwrap());
    }

    #[tokio::test]
    async fn contents_survive_reopening_the_same_database_file() {
        let dir = tempdir::TempDir::new("secret-store-test").unwrap();
        let db_path = dir.path().join("secrets.db3");

        {
            let connection = Connection::open(&db_path).await.unwrap();
            let store = SqliteSecretStore::open(connection).await.unwrap();
            store
                .put(Label::IdentityPriv, vec![9, 9, 9])
                .await
                .unwrap();
            store.put_bool(Label::FlagGenerated, true).await.unwrap();
        }

        let connection = Connection::open(&db_path).await.unwrap();
        let reopened = SqliteSecretStore::open(connection).await.unwrap();
        assert_eq!(
            reopened.get(Label::IdentityPriv).await.unwrap(),
            Some(vec![9, 9, 9])
        );
        assert!(reopened.get_bool(Label::FlagGenerated).await.unwrap());
    }

    #[tokio::test]
    async fn delete_by_prefix_removes_only_matching_labels() {
        let store = memory_store().await;
        store
            .put(Label::Session { peer_id: "bob".into() }, vec![1])
            .await
            .unwrap();
        store
            .put(Label::Session { peer_id: "carol".into() }, vec![2])
            .await
            .unwrap();
        store.put(Label::IdentityPriv, vec![3]).await.unwrap();

        store.delete_by_prefix("session_").await.unwrap();

        assert_eq!(
            store.get(Label::Session { peer_id: "bob".into() }).await.unwrap(),
            None
        );
        assert_eq!(
            store.get(Label::Session { peer_id: "carol".into() }).await.unwrap(),
            None
        );
        assert_eq!(store.get(Label::IdentityPriv).await.unwrap(), Some(vec![3]));
    }

    #[test]
    fn indexed_labels_render_distinct_keys() {
        assert_eq!(Label::OtpkPriv { index: 3 }.key(), "otpk_3_priv");
        assert_eq!(Label::OtpkPub { index: 3 }.key(), "otpk_3_pub");
        assert_eq!(
            Label::Session { peer_id: "bob".into() }.key(),
            "session_bob"
        );
    }
}
