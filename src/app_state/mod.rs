// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreground/background gating of user-visible staleness notifications.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::identifiers::UserId;
use crate::notifications::{ChatNotification, NotificationBus, ThreadStaleUpdate};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AppState {
    Foreground,
    Background,
}

struct PendingUpdates {
    /// Accumulated per-conv updates, flushed as `ThreadsStale`.
    per_conv: Vec<ThreadStaleUpdate>,
    /// Set by a buffered call with no per-conv updates, flushed as
    /// `InboxStale`.
    inbox_stale: bool,
}

impl PendingUpdates {
    fn new() -> Self {
        Self {
            per_conv: Vec::new(),
            inbox_stale: false,
        }
    }
}

struct Inner {
    state: AppState,
    pending: HashMap<UserId, PendingUpdates>,
}

/// Tracks foreground/background app state and buffers stale notifications
/// raised while backgrounded until the next foreground transition.
///
/// Guards `{state, pendingBuffer}` with a single mutex; the transition into
/// the foreground flushes the buffer under the lock and releases it before
/// delivering, so subscribers never get called back while the lock is held.
pub struct AppStateGate {
    inner: Mutex<Inner>,
    bus: NotificationBus,
}

impl AppStateGate {
    pub fn new(bus: NotificationBus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: AppState::Foreground,
                pending: HashMap::new(),
            }),
            bus,
        }
    }

    pub fn state(&self) -> AppState {
        self.inner.lock().expect("app state mutex poisoned").state
    }

    /// Queue (or immediately deliver) stale signals for `uid`.
    ///
    /// `immediate` only matters while foregrounded, where it has no effect:
    /// foreground delivery is always immediate, and background delivery is
    /// always buffered regardless of `immediate` ("the only transition that
    /// flushes is FOREGROUND").
    pub fn send_chat_stale_notifications(
        &self,
        uid: UserId,
        updates: Vec<ThreadStaleUpdate>,
        _immediate: bool,
    ) {
        let deliver_now = {
            let mut inner = self.inner.lock().expect("app state mutex poisoned");
            match inner.state {
                AppState::Foreground => true,
                AppState::Background => {
                    let pending = inner.pending.entry(uid).or_insert_with(PendingUpdates::new);
                    if updates.is_empty() {
                        pending.inbox_stale = true;
                    } else {
                        pending.per_conv.extend(updates.iter().cloned());
                    }
                    false
                }
            }
        };
        if deliver_now {
            self.deliver(uid, updates);
        }
    }

    /// Transition the app state, flushing any buffered notifications on a
    /// transition into the foreground.
    pub fn set_state(&self, new_state: AppState) {
        let flushed: Vec<(UserId, PendingUpdates)> = {
            let mut inner = self.inner.lock().expect("app state mutex poisoned");
            inner.state = new_state;
            if new_state != AppState::Foreground {
                return;
            }
            inner.pending.drain().collect()
        };
        for (uid, pending) in flushed {
            if !pending.per_conv.is_empty() {
                self.deliver(uid, pending.per_conv);
            }
            if pending.inbox_stale {
                self.deliver(uid, Vec::new());
            }
        }
    }

    fn deliver(&self, uid: UserId, updates: Vec<ThreadStaleUpdate>) {
        let notification = if updates.is_empty() {
            ChatNotification::InboxStale { uid }
        } else {
            ChatNotification::ThreadsStale { uid, updates }
        };
        self.bus.emit(notification);
    }
}
