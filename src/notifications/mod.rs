// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fan-out of user-visible sync events.

use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::error;

use crate::identifiers::{ConvId, UserId};
use crate::types::MembersType;

// 1024 * size_of::<Arc<ChatNotification>>() is a handful of KiB; plenty of
// headroom for a slow subscriber without unbounded growth.
const NOTIFICATION_CHANNEL_SIZE: usize = 1024;

/// One conv-level update reported inside an `InboxSynced{Incremental}` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalItem {
    pub conv_id: ConvId,
    pub members_type: MembersType,
}

/// The user-visible classification of a completed sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncType {
    Current,
    Clear,
    Incremental { items: Vec<IncrementalItem> },
}

/// The kind of staleness a particular conversation experienced.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StaleUpdateType {
    NewActivity,
    Clear,
    NewMessages,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStaleUpdate {
    pub conv_id: ConvId,
    pub update_type: StaleUpdateType,
}

/// A user-visible event emitted through the [`NotificationBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatNotification {
    /// Emitted after every completed `Sync` call, never gated by app state.
    InboxSynced { uid: UserId, result: SyncType },
    /// Emitted for non-empty `SendChatStaleNotifications` calls while in the
    /// foreground.
    ThreadsStale {
        uid: UserId,
        updates: Vec<ThreadStaleUpdate>,
    },
    /// Emitted for empty-updates `SendChatStaleNotifications` calls while in
    /// the foreground.
    InboxStale { uid: UserId },
}

/// Broadcast fan-out of [`ChatNotification`]s.
///
/// Grounded on `coreclient`'s `store::notification::StoreNotificationsSender`:
/// a `tokio::sync::broadcast` channel, where a lagging subscriber is logged
/// and skips forward rather than panicking.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: tokio::sync::broadcast::Sender<Arc<ChatNotification>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(NOTIFICATION_CHANNEL_SIZE);
        Self { tx }
    }

    pub fn emit(&self, notification: ChatNotification) {
        let _no_receivers = self.tx.send(Arc::new(notification));
    }

    pub fn subscribe(&self) -> impl tokio_stream::Stream<Item = Arc<ChatNotification>> + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|res| match res {
            Ok(notification) => Some(notification),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                error!(lagged = n, "chat notification bus lagged, dropping notifications");
                None
            }
        })
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_notification() {
        let bus = NotificationBus::new();
        let mut stream = Box::pin(bus.subscribe());

        let uid = UserId::random();
        bus.emit(ChatNotification::InboxStale { uid });

        let received = stream.next().await.expect("notification");
        assert_eq!(*received, ChatNotification::InboxStale { uid });
    }
}
