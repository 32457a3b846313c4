// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use sqlx::{Row, SqlitePool};

use crate::errors::MessageStoreError;
use crate::identifiers::{ConvId, MsgId, UserId};

/// A single message envelope. Decryption/encoding of `body` is out of scope
/// here — it is stored and returned as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MsgId,
    /// `None` once expunged: the envelope survives, the body does not.
    pub body: Option<Vec<u8>>,
}

/// An ordered, possibly partially-expunged conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Thread {
    pub messages: Vec<Message>,
}

/// Persistent per-conversation message cache.
///
/// Grounded on the same sqlx persistence idiom as [`crate::inbox::InboxStore`];
/// expunge is applied by nulling `body` columns in place (an `UPDATE ...
/// WHERE msg_id < ?`) rather than deleting rows, so the message skeletons
/// remain valid for ordering/read-state purposes.
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    /// Store (or overwrite) a message envelope.
    pub async fn store_message(
        &self,
        conv_id: ConvId,
        uid: UserId,
        message: Message,
    ) -> Result<(), MessageStoreError> {
        let watermark = self.expunge_watermark(conv_id, uid).await?;
        let body = if watermark.is_some_and(|w| message.id < w) {
            None
        } else {
            message.body
        };
        sqlx::query(
            "INSERT INTO message (user_uuid, conv_id, msg_id, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_uuid, conv_id, msg_id) DO UPDATE SET body = ?4",
        )
        .bind(uid.uuid().as_bytes().to_vec())
        .bind(conv_id.uuid().as_bytes().to_vec())
        .bind(message.id.as_u32() as i64)
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The full stored thread for `conv_id`/`uid`, or
    /// [`MessageStoreError::Miss`] if nothing is stored.
    pub async fn fetch(&self, conv_id: ConvId, uid: UserId) -> Result<Thread, MessageStoreError> {
        let rows = sqlx::query(
            "SELECT msg_id, body FROM message WHERE user_uuid = ? AND conv_id = ? ORDER BY msg_id",
        )
        .bind(uid.uuid().as_bytes().to_vec())
        .bind(conv_id.uuid().as_bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(MessageStoreError::Miss);
        }

        let messages = rows
            .into_iter()
            .map(|row| {
                let msg_id = MsgId::new(row.try_get::<i64, _>("msg_id")? as u32);
                let body: Option<Vec<u8>> = row.try_get("body")?;
                Ok(Message { id: msg_id, body })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(Thread { messages })
    }

    /// Fetches specific message ids, preserving request order. Missing ids
    /// yield `None`.
    pub async fn fetch_messages(
        &self,
        conv_id: ConvId,
        uid: UserId,
        ids: &[MsgId],
    ) -> Result<Vec<Option<Message>>, MessageStoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let row = sqlx::query("SELECT body FROM message WHERE user_uuid = ? AND conv_id = ? AND msg_id = ?")
                .bind(uid.uuid().as_bytes().to_vec())
                .bind(conv_id.uuid().as_bytes().to_vec())
                .bind(id.as_u32() as i64)
                .fetch_optional(&self.pool)
                .await?;
            out.push(match row {
                Some(row) => {
                    let body: Option<Vec<u8>> = row.try_get("body")?;
                    Some(Message { id, body })
                }
                None => None,
            });
        }
        Ok(out)
    }

    /// Erase bodies of all messages with id < `upto` in `conv_id`, retaining
    /// their skeletons, and remember the watermark for future inserts.
    pub async fn apply_expunge(
        &self,
        conv_id: ConvId,
        uid: UserId,
        upto: MsgId,
    ) -> Result<(), MessageStoreError> {
        let uuid_bytes = uid.uuid().as_bytes().to_vec();
        let conv_id_bytes = conv_id.uuid().as_bytes().to_vec();

        sqlx::query(
            "UPDATE message SET body = NULL
             WHERE user_uuid = ? AND conv_id = ? AND msg_id < ?",
        )
        .bind(&uuid_bytes)
        .bind(&conv_id_bytes)
        .bind(upto.as_u32() as i64)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO expunge_watermark (user_uuid, conv_id, upto) VALUES (?1, ?2, ?3)
             ON CONFLICT (user_uuid, conv_id) DO UPDATE SET upto = MAX(upto, ?3)",
        )
        .bind(&uuid_bytes)
        .bind(&conv_id_bytes)
        .bind(upto.as_u32() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expunge_watermark(
        &self,
        conv_id: ConvId,
        uid: UserId,
    ) -> Result<Option<MsgId>, MessageStoreError> {
        let row = sqlx::query("SELECT upto FROM expunge_watermark WHERE user_uuid = ? AND conv_id = ?")
            .bind(uid.uuid().as_bytes().to_vec())
            .bind(conv_id.uuid().as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(MsgId::new(row.try_get::<i64, _>("upto")? as u32)),
            None => None,
        })
    }

    /// Drop all messages for a single conversation.
    pub async fn clear_all(&self, conv_id: ConvId, uid: UserId) -> Result<(), MessageStoreError> {
        let uuid_bytes = uid.uuid().as_bytes().to_vec();
        let conv_id_bytes = conv_id.uuid().as_bytes().to_vec();
        sqlx::query("DELETE FROM message WHERE user_uuid = ? AND conv_id = ?")
            .bind(&uuid_bytes)
            .bind(&conv_id_bytes)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM expunge_watermark WHERE user_uuid = ? AND conv_id = ?")
            .bind(&uuid_bytes)
            .bind(&conv_id_bytes)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop all messages for every conversation of `uid`.
    pub async fn clear_all_for_user(&self, uid: UserId) -> Result<(), MessageStoreError> {
        let uuid_bytes = uid.uuid().as_bytes().to_vec();
        sqlx::query("DELETE FROM message WHERE user_uuid = ?")
            .bind(&uuid_bytes)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM expunge_watermark WHERE user_uuid = ?")
            .bind(&uuid_bytes)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
