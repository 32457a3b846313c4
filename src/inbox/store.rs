// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::errors::InboxStoreError;
use crate::identifiers::{ConvId, InboxVers, UserId};
use crate::remote::ServerCacheVersions;
use crate::types::{Conv, TeamType};

/// Persistent key/value store of conversation metadata, keyed by conv id.
///
/// Grounded on `coreclient`'s sqlx-backed persistence modules
/// (`chats/persistence.rs`, `chats/status.rs`'s `ON CONFLICT ... DO UPDATE`
/// upsert idiom), storing each [`Conv`] as a JSON blob the way
/// `utils/data_migrations.rs`'s `BlobEncoded`/`BlobDecoded` wrappers do,
/// rather than exploding every field into its own column.
pub struct InboxStore {
    pool: SqlitePool,
}

impl InboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run pending schema migrations. Call once at startup.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    /// Returns all stored convs for `uid`, or [`InboxStoreError::Miss`] if
    /// nothing is persisted.
    pub async fn read_all(&self, uid: UserId) -> Result<(InboxVers, Vec<Conv>), InboxStoreError> {
        let uuid = uid.uuid();
        let uuid_bytes = uuid.as_bytes().to_vec();

        let Some(vers_row) = sqlx::query(
            "SELECT inbox_vers FROM user_inbox_state WHERE user_uuid = ?",
        )
        .bind(&uuid_bytes)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Err(InboxStoreError::Miss);
        };
        let vers = InboxVers::new(vers_row.try_get::<i64, _>("inbox_vers")? as u64);

        let rows = sqlx::query("SELECT payload FROM conv WHERE user_uuid = ?")
            .bind(&uuid_bytes)
            .fetch_all(&self.pool)
            .await?;
        let convs = rows
            .into_iter()
            .map(|row| {
                let payload: Vec<u8> = row.try_get("payload")?;
                serde_json::from_slice::<Conv>(&payload).map_err(InboxStoreError::from)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((vers, convs))
    }

    /// Drops all rows for `uid`; subsequent [`Self::read_all`] fails with
    /// `Miss`. Server cache versions are a separate record ([`Self::server_version`])
    /// and are left untouched, since a capability bump must survive the very
    /// clear it triggered.
    pub async fn clear(&self, uid: UserId) -> Result<(), InboxStoreError> {
        let uuid_bytes = uid.uuid().as_bytes().to_vec();
        let mut txn = self.pool.begin().await?;
        sqlx::query("DELETE FROM conv WHERE user_uuid = ?")
            .bind(&uuid_bytes)
            .execute(&mut *txn)
            .await?;
        sqlx::query("DELETE FROM user_inbox_state WHERE user_uuid = ?")
            .bind(&uuid_bytes)
            .execute(&mut *txn)
            .await?;
        txn.commit().await?;
        debug!(%uid, "cleared inbox store");
        Ok(())
    }

    /// Upsert `convs` by conv id, advancing the stored version to
    /// `max(stored, vers)`.
    pub async fn merge(
        &self,
        uid: UserId,
        vers: InboxVers,
        convs: &[Conv],
    ) -> Result<(), InboxStoreError> {
        let mut txn = self.pool.begin().await?;
        self.merge_in_txn(&mut txn, uid, vers, convs).await?;
        txn.commit().await?;
        Ok(())
    }

    pub(crate) async fn merge_in_txn(
        &self,
        txn: &mut Transaction<'_, Sqlite>,
        uid: UserId,
        vers: InboxVers,
        convs: &[Conv],
    ) -> Result<(), InboxStoreError> {
        let uuid_bytes = uid.uuid().as_bytes().to_vec();

        for conv in convs {
            let payload = serde_json::to_vec(conv)?;
            let conv_id_bytes = conv.id.uuid().as_bytes().to_vec();
            sqlx::query(
                "INSERT INTO conv (user_uuid, conv_id, payload) VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_uuid, conv_id) DO UPDATE SET payload = ?3",
            )
            .bind(&uuid_bytes)
            .bind(&conv_id_bytes)
            .bind(&payload)
            .execute(&mut **txn)
            .await?;
        }

        let existing = sqlx::query("SELECT inbox_vers FROM user_inbox_state WHERE user_uuid = ?")
            .bind(&uuid_bytes)
            .fetch_optional(&mut **txn)
            .await?;

        let new_vers = match &existing {
            Some(row) => InboxVers::new(row.try_get::<i64, _>("inbox_vers")? as u64).max(vers),
            None => vers,
        };

        sqlx::query(
            "INSERT INTO user_inbox_state (user_uuid, inbox_vers) VALUES (?1, ?2)
             ON CONFLICT (user_uuid) DO UPDATE SET inbox_vers = ?2",
        )
        .bind(&uuid_bytes)
        .bind(new_vers.as_u64() as i64)
        .execute(&mut **txn)
        .await?;

        Ok(())
    }

    /// Convenience mutation used when a team's complex/simple classification
    /// changes without a full incremental payload; preserves version
    /// monotonicity.
    pub async fn team_type_changed(
        &self,
        uid: UserId,
        vers: InboxVers,
        conv_id: ConvId,
        new_team_type: TeamType,
    ) -> Result<(), InboxStoreError> {
        let (_, mut convs) = self.read_all(uid).await?;
        let Some(conv) = convs.iter_mut().find(|c| c.id == conv_id) else {
            return Ok(());
        };
        conv.team_type = new_team_type;
        let updated = vec![conv.clone()];
        self.merge(uid, vers, &updated).await
    }

    /// The server capability versions last recorded for `uid`. Zero for both
    /// fields if never set. Stored independently of `user_inbox_state` so a
    /// [`Self::clear`] never resets it: a capability bump's versions must be
    /// observable even though the clear it triggered wipes the inbox.
    pub async fn server_version(&self, uid: UserId) -> Result<ServerCacheVersions, InboxStoreError> {
        let uuid_bytes = uid.uuid().as_bytes().to_vec();
        let row = sqlx::query(
            "SELECT server_cache_inbox_vers, server_cache_bodies_vers
             FROM server_cache_version WHERE user_uuid = ?",
        )
        .bind(&uuid_bytes)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => ServerCacheVersions {
                inbox: row.try_get::<i64, _>("server_cache_inbox_vers")? as u32,
                bodies: row.try_get::<i64, _>("server_cache_bodies_vers")? as u32,
            },
            None => ServerCacheVersions::default(),
        })
    }

    /// Persist `versions` for `uid`. Lives in its own table, separate from
    /// `user_inbox_state`'s presence row, so that recording versions after a
    /// [`Self::clear`] cannot resurrect the row `read_all` uses to detect a
    /// miss.
    pub async fn set_server_version(
        &self,
        uid: UserId,
        versions: ServerCacheVersions,
    ) -> Result<(), InboxStoreError> {
        let uuid_bytes = uid.uuid().as_bytes().to_vec();
        sqlx::query(
            "INSERT INTO server_cache_version
                (user_uuid, server_cache_inbox_vers, server_cache_bodies_vers)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (user_uuid) DO UPDATE SET
                server_cache_inbox_vers = ?2, server_cache_bodies_vers = ?3",
        )
        .bind(&uuid_bytes)
        .bind(versions.inbox as i64)
        .bind(versions.bodies as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::MsgId;
    use crate::types::{Existence, MembersType, ReaderInfo, ReaderStatus};

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        InboxStore::migrate(&pool).await.unwrap();
        pool
    }

    fn test_conv(id: ConvId) -> Conv {
        Conv {
            id,
            tlf: "alice,bob".into(),
            topic_type: "chat".into(),
            topic_id: "0".into(),
            members_type: MembersType::Kbfs,
            status: crate::types::ConvStatus::Unfiled,
            existence: Existence::Active,
            reader_info: ReaderInfo {
                status: ReaderStatus::Active,
                max_msg_id: MsgId::new(1),
            },
            team_type: TeamType::None,
            expunge: Default::default(),
            max_msg_summaries: Vec::new(),
        }
    }

    #[tokio::test]
    async fn read_all_misses_when_empty() {
        let store = InboxStore::new(test_pool().await);
        let err = store.read_all(UserId::random()).await.unwrap_err();
        assert!(matches!(err, InboxStoreError::Miss));
    }

    #[tokio::test]
    async fn merge_then_read_all_round_trips() {
        let store = InboxStore::new(test_pool().await);
        let uid = UserId::random();
        let conv = test_conv(ConvId::random());
        store
            .merge(uid, InboxVers::new(5), std::slice::from_ref(&conv))
            .await
            .unwrap();

        let (vers, convs) = store.read_all(uid).await.unwrap();
        assert_eq!(vers, InboxVers::new(5));
        assert_eq!(convs, vec![conv]);
    }

    #[tokio::test]
    async fn merge_advances_version_monotonically() {
        let store = InboxStore::new(test_pool().await);
        let uid = UserId::random();
        let conv = test_conv(ConvId::random());
        store.merge(uid, InboxVers::new(10), &[conv.clone()]).await.unwrap();
        // A lower incoming version never regresses the stored one.
        store.merge(uid, InboxVers::new(3), &[conv]).await.unwrap();

        let (vers, _) = store.read_all(uid).await.unwrap();
        assert_eq!(vers, InboxVers::new(10));
    }

    #[tokio::test]
    async fn clear_misses_on_read_but_preserves_server_version() {
        let store = InboxStore::new(test_pool().await);
        let uid = UserId::random();
        let conv = test_conv(ConvId::random());
        store.merge(uid, InboxVers::new(1), &[conv]).await.unwrap();
        store
            .set_server_version(
                uid,
                ServerCacheVersions {
                    inbox: 5,
                    bodies: 5,
                },
            )
            .await
            .unwrap();

        store.clear(uid).await.unwrap();

        assert!(matches!(
            store.read_all(uid).await.unwrap_err(),
            InboxStoreError::Miss
        ));
        assert_eq!(
            store.server_version(uid).await.unwrap(),
            ServerCacheVersions {
                inbox: 5,
                bodies: 5,
            }
        );
    }
}
