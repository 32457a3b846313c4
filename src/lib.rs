// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reconciles a client's local chat inbox and message caches with the
//! authoritative server state after reconnects or server-pushed sync events.
//!
//! Secure transport/RPC framing, message decryption and thread assembly,
//! identity/auth/TLF resolution, and any CLI/config/UI surface are all out of
//! scope; [`remote::RemoteInterface`] and [`background_loader::ConvSource`]
//! are the seams where those concerns plug in.

pub mod app_state;
pub mod background_loader;
pub mod errors;
pub mod identifiers;
pub mod inbox;
pub mod messages;
pub mod notifications;
pub mod remote;
pub mod sync;
pub mod types;

use std::sync::Arc;

use sqlx::SqlitePool;

use app_state::AppStateGate;
use background_loader::{BackgroundConvLoaderHandle, ConvSource};
use inbox::InboxStore;
use messages::MessageStore;
use notifications::NotificationBus;
use sync::Syncer;

/// Runs schema migrations for both [`InboxStore`] and [`MessageStore`]
/// against `pool`. Both stores share one set of migrations, so this only
/// needs to run once.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    InboxStore::migrate(pool).await
}

/// Owns every component of the sync engine and wires them together the way a
/// host application would: one [`NotificationBus`] feeding one
/// [`AppStateGate`], one [`BackgroundConvLoaderHandle`] pre-warming
/// [`MessageStore`], and a [`Syncer`] tying the stores, the bus and the
/// loader together behind a single [`RemoteInterface`](remote::RemoteInterface).
pub struct ChatSyncEngine {
    pub inbox: Arc<InboxStore>,
    pub messages: Arc<MessageStore>,
    pub notifications: NotificationBus,
    pub app_state: Arc<AppStateGate>,
    pub background: BackgroundConvLoaderHandle,
    pub syncer: Arc<Syncer>,
}

impl ChatSyncEngine {
    /// Assemble the engine over `pool` (already migrated) and `conv_source`
    /// (the caller's thread-hydration implementation).
    pub fn new<S>(pool: SqlitePool, conv_source: Arc<S>) -> Self
    where
        S: ConvSource + 'static,
    {
        let inbox = Arc::new(InboxStore::new(pool.clone()));
        let messages = Arc::new(MessageStore::new(pool));
        let notifications = NotificationBus::new();
        let app_state = Arc::new(AppStateGate::new(notifications.clone()));
        let background = background_loader::spawn(conv_source);
        let syncer = Arc::new(Syncer::new(
            inbox.clone(),
            messages.clone(),
            notifications.clone(),
            app_state.clone(),
            background.clone(),
        ));

        Self {
            inbox,
            messages,
            notifications,
            app_state,
            background,
            syncer,
        }
    }
}
