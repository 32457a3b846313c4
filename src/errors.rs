// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;

/// Errors surfaced by [`crate::inbox::InboxStore`].
#[derive(Debug, Error)]
pub enum InboxStoreError {
    #[error("no inbox stored for this user")]
    Miss,
    #[error("write attempted at a stale inbox version")]
    VersionMismatch,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to deserialize a stored conv: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by [`crate::messages::MessageStore`].
#[derive(Debug, Error)]
pub enum MessageStoreError {
    #[error("no thread stored for this conversation")]
    Miss,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to deserialize a stored message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The error surface of [`crate::sync::Syncer::sync`].
///
/// Only `Transport` ever propagates from a call to `sync`; store-level
/// failures encountered after classification are resolved internally by
/// degrading to `Clear` semantics and are never returned to the caller.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote sync call failed: {0}")]
    Transport(#[source] anyhow::Error),
}
