// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The core reconciliation engine: [`Syncer`].

mod team_filter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::app_state::AppStateGate;
use crate::background_loader::BackgroundConvLoaderHandle;
use crate::errors::{InboxStoreError, SyncError};
use crate::identifiers::{ConvId, InboxVers, UserId};
use crate::inbox::InboxStore;
use crate::messages::MessageStore;
use crate::notifications::{ChatNotification, IncrementalItem, NotificationBus, SyncType};
use crate::remote::{RemoteInterface, ServerCacheVersions, SyncInboxRes};
use crate::types::{Conv, MembersType};

/// A component that needs to observe connectivity transitions, registered via
/// [`Syncer::register_offlinable`]. The concrete offlinable components (e.g.
/// outbox senders) are out of scope here.
pub trait Offlinable: Send + Sync {
    fn connected(&self);
    fn disconnected(&self);
}

/// Reconciles the local inbox and message caches against the server.
///
/// The per-uid lock map follows `coreclient`'s general `Arc<Mutex<..>>`-per-key
/// handle style, adapted to `tokio::sync::Mutex` so the guard can be held
/// across the `await`s of a whole sync call. The destructive pre-filter, team
/// shallow-change filter and expunge propagation are grounded on the original
/// Keybase syncer tests (`TestSyncerAdHocFullReload`, `TestSyncerTeamFilter`,
/// `TestSyncerRetentionExpunge`, `TestSyncerMembersTypeChanged`).
pub struct Syncer {
    inbox: Arc<InboxStore>,
    messages: Arc<MessageStore>,
    bus: NotificationBus,
    app_state: Arc<AppStateGate>,
    background: BackgroundConvLoaderHandle,
    is_connected: AtomicBool,
    uid_locks: StdMutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
    offlinables: StdMutex<Vec<Arc<dyn Offlinable>>>,
}

impl Syncer {
    pub fn new(
        inbox: Arc<InboxStore>,
        messages: Arc<MessageStore>,
        bus: NotificationBus,
        app_state: Arc<AppStateGate>,
        background: BackgroundConvLoaderHandle,
    ) -> Self {
        Self {
            inbox,
            messages,
            bus,
            app_state,
            background,
            is_connected: AtomicBool::new(false),
            uid_locks: StdMutex::new(HashMap::new()),
            offlinables: StdMutex::new(Vec::new()),
        }
    }

    /// Register a component to be notified of connectivity transitions.
    pub fn register_offlinable(&self, offlinable: Arc<dyn Offlinable>) {
        self.offlinables.lock().expect("offlinables mutex poisoned").push(offlinable);
    }

    pub fn connected(&self) {
        self.is_connected.store(true, Ordering::SeqCst);
        for offlinable in self.offlinables.lock().expect("offlinables mutex poisoned").iter() {
            offlinable.connected();
        }
    }

    pub fn disconnected(&self) {
        self.is_connected.store(false, Ordering::SeqCst);
        for offlinable in self.offlinables.lock().expect("offlinables mutex poisoned").iter() {
            offlinable.disconnected();
        }
    }

    /// Forward stale-thread notifications through the app-state gate.
    pub fn send_chat_stale_notifications(
        &self,
        uid: UserId,
        updates: Vec<crate::notifications::ThreadStaleUpdate>,
        immediate: bool,
    ) {
        self.app_state.send_chat_stale_notifications(uid, updates, immediate);
    }

    fn lock_for_uid(&self, uid: UserId) -> Arc<AsyncMutex<()>> {
        self.uid_locks
            .lock()
            .expect("uid lock map poisoned")
            .entry(uid)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Reconcile `uid`'s local caches against the server.
    ///
    /// A no-op (`Ok(None)`) while disconnected: `Sync` checks the flag before
    /// ever touching `remote`. Pass `sync_result` to feed an already-received
    /// `SyncAll` reply (e.g. off a push notification); `None` triggers a
    /// fresh `sync_all` RPC.
    ///
    /// Only [`SyncError::Transport`] ever escapes: any failure of the local
    /// stores during the post-classification phase is logged once and
    /// resolved by degrading to `Clear` semantics.
    pub async fn sync<R: RemoteInterface>(
        &self,
        remote: &R,
        uid: UserId,
        sync_result: Option<SyncInboxRes>,
    ) -> Result<Option<SyncType>, SyncError> {
        if !self.is_connected.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let lock = self.lock_for_uid(uid);
        let _guard = lock.lock().await;

        let reply = match sync_result {
            Some(reply) => reply,
            None => remote.sync_all(uid).await.map_err(SyncError::Transport)?,
        };

        let server_versions = remote.cache_versions();
        let stored_versions = self.inbox.server_version(uid).await.unwrap_or_else(|error| {
            warn!(%uid, %error, "failed to read stored server cache versions, treating as zero");
            ServerCacheVersions::default()
        });
        let capability_bump =
            server_versions.inbox > stored_versions.inbox || server_versions.bodies > stored_versions.bodies;

        let sync_type = if capability_bump {
            self.force_clear(uid, server_versions).await
        } else {
            match reply {
                SyncInboxRes::Current => {
                    self.persist_server_versions(uid, server_versions).await;
                    SyncType::Current
                }
                SyncInboxRes::Clear => self.force_clear(uid, server_versions).await,
                SyncInboxRes::Incremental { vers, convs } => match self.apply_incremental(uid, vers, convs).await {
                    Ok(items) => {
                        self.persist_server_versions(uid, server_versions).await;
                        SyncType::Incremental { items }
                    }
                    Err(()) => self.force_clear(uid, server_versions).await,
                },
            }
        };

        self.bus.emit(ChatNotification::InboxSynced {
            uid,
            result: sync_type.clone(),
        });

        Ok(Some(sync_type))
    }

    async fn persist_server_versions(&self, uid: UserId, versions: ServerCacheVersions) {
        if let Err(error) = self.inbox.set_server_version(uid, versions).await {
            warn!(%uid, %error, "failed to persist server cache versions");
        }
    }

    /// Degrade to a full reload: drop the local inbox and message caches for
    /// `uid`, then record the server's current capability versions.
    async fn force_clear(&self, uid: UserId, server_versions: ServerCacheVersions) -> SyncType {
        if let Err(error) = self.inbox.clear(uid).await {
            warn!(%uid, %error, "failed to clear inbox store");
        }
        if let Err(error) = self.messages.clear_all_for_user(uid).await {
            warn!(%uid, %error, "failed to clear message store");
        }
        self.persist_server_versions(uid, server_versions).await;
        SyncType::Clear
    }

    /// The incremental algorithm (emitting the notification is the caller's
    /// job). `Err(())` means "abandon this incremental update and degrade to
    /// Clear".
    async fn apply_incremental(
        &self,
        uid: UserId,
        vers: InboxVers,
        convs: Vec<Conv>,
    ) -> Result<Vec<IncrementalItem>, ()> {
        let stored: HashMap<ConvId, Conv> = match self.inbox.read_all(uid).await {
            Ok((_, convs)) => convs.into_iter().map(|c| (c.id, c)).collect(),
            Err(InboxStoreError::Miss) => HashMap::new(),
            Err(error) => {
                warn!(%uid, %error, "failed to read stored inbox during incremental sync");
                return Err(());
            }
        };

        // Step 1: an ad-hoc (non-team) conv leaving/being removed/reset, or
        // being deleted/abandoned, or upgrading to a complex team, abandons
        // the whole incremental update.
        for conv in &convs {
            if let Some(stored_conv) = stored.get(&conv.id) {
                if stored_conv.members_type != MembersType::Team && conv.is_destructive_change_from(stored_conv) {
                    return Err(());
                }
            }
        }

        // Step 2: drop conversations whose only change is team-management
        // bookkeeping a user doesn't need to see.
        let mut update_set = Vec::with_capacity(convs.len());
        for conv in convs {
            let shallow = stored
                .get(&conv.id)
                .is_some_and(|stored_conv| team_filter::is_shallow_team_change(stored_conv, &conv));
            if !shallow {
                update_set.push(conv);
            }
        }

        // Step 3: a membersType upgrade invalidates previously cached
        // messages before the new metadata lands.
        for conv in &update_set {
            if let Some(stored_conv) = stored.get(&conv.id) {
                if stored_conv.members_type != conv.members_type {
                    if let Err(error) = self.messages.clear_all(conv.id, uid).await {
                        warn!(%uid, conv_id = %conv.id, %error, "failed to clear messages on membersType change");
                        return Err(());
                    }
                }
            }
        }

        // Step 4: persist the surviving conv updates.
        if let Err(error) = self.inbox.merge(uid, vers, &update_set).await {
            warn!(%uid, %error, "failed to persist incremental inbox update");
            return Err(());
        }

        // Step 6: an advanced expunge watermark is applied to the message
        // store right away rather than waiting for the background loader's
        // next pull, so retention takes effect even for threads that are
        // never re-prefetched.
        for conv in &update_set {
            let previous_upto = stored.get(&conv.id).map(|c| c.expunge.upto).unwrap_or_default();
            if conv.expunge.upto > previous_upto {
                if let Err(error) = self.messages.apply_expunge(conv.id, uid, conv.expunge.upto).await {
                    warn!(%uid, conv_id = %conv.id, %error, "failed to apply expunge");
                }
            }
        }

        // Step 5: warm the message cache for conversations the user can
        // actually read.
        for conv in &update_set {
            if conv.is_prefetchable() {
                self.background.enqueue(uid, conv.id).await;
            }
        }

        Ok(update_set
            .iter()
            .map(|conv| IncrementalItem {
                conv_id: conv.id,
                members_type: conv.members_type,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::background_loader;
    use crate::identifiers::MsgId;
    use crate::types::{ConvStatus, Existence, MaxMsgSummary, MessageType, ReaderInfo, ReaderStatus, TeamType};

    struct ScriptedRemote {
        replies: StdMutex<VecDeque<SyncInboxRes>>,
        versions: StdMutex<ServerCacheVersions>,
    }

    impl ScriptedRemote {
        fn new(reply: SyncInboxRes) -> Self {
            Self {
                replies: StdMutex::new(VecDeque::from([reply])),
                versions: StdMutex::new(ServerCacheVersions::default()),
            }
        }

        fn with_versions(reply: SyncInboxRes, versions: ServerCacheVersions) -> Self {
            Self {
                replies: StdMutex::new(VecDeque::from([reply])),
                versions: StdMutex::new(versions),
            }
        }
    }

    impl crate::remote::LocalRemoteInterface for ScriptedRemote {
        async fn sync_all(&self, _uid: UserId) -> anyhow::Result<SyncInboxRes> {
            Ok(self.replies.lock().unwrap().pop_front().expect("scripted reply"))
        }

        async fn sync_inbox(&self, _uid: UserId, _vers: InboxVers) -> anyhow::Result<SyncInboxRes> {
            Ok(self.replies.lock().unwrap().pop_front().expect("scripted reply"))
        }

        fn cache_versions(&self) -> ServerCacheVersions {
            *self.versions.lock().unwrap()
        }
    }

    struct NoopSource;

    impl background_loader::LocalConvSource for NoopSource {
        async fn pull(&self, _uid: UserId, _conv_id: ConvId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn test_syncer() -> (Syncer, Arc<InboxStore>, Arc<MessageStore>, NotificationBus) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        InboxStore::migrate(&pool).await.unwrap();
        let inbox = Arc::new(InboxStore::new(pool.clone()));
        let messages = Arc::new(MessageStore::new(pool));
        let bus = NotificationBus::new();
        let app_state = Arc::new(AppStateGate::new(bus.clone()));
        let background = background_loader::spawn(Arc::new(NoopSource));
        let syncer = Syncer::new(inbox.clone(), messages.clone(), bus.clone(), app_state, background);
        syncer.connected();
        (syncer, inbox, messages, bus)
    }

    fn conv(id: ConvId, members_type: MembersType, team_type: TeamType) -> Conv {
        Conv {
            id,
            tlf: "alice,bob".into(),
            topic_type: "chat".into(),
            topic_id: "0".into(),
            members_type,
            status: ConvStatus::Unfiled,
            existence: Existence::Active,
            reader_info: ReaderInfo {
                status: ReaderStatus::Active,
                max_msg_id: MsgId::new(1),
            },
            team_type,
            expunge: Default::default(),
            max_msg_summaries: Vec::new(),
        }
    }

    #[tokio::test]
    async fn disconnected_sync_is_a_noop() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        InboxStore::migrate(&pool).await.unwrap();
        let inbox = Arc::new(InboxStore::new(pool.clone()));
        let messages = Arc::new(MessageStore::new(pool));
        let bus = NotificationBus::new();
        let app_state = Arc::new(AppStateGate::new(bus.clone()));
        let background = background_loader::spawn(Arc::new(NoopSource));
        let syncer = Syncer::new(inbox, messages, bus, app_state, background);

        let remote = ScriptedRemote::new(SyncInboxRes::Current);
        let result = syncer.sync(&remote, UserId::random(), None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn current_sync_is_a_noop_on_the_stores() {
        let (syncer, inbox, _messages, bus) = test_syncer().await;
        let mut stream = Box::pin(bus.subscribe());
        let uid = UserId::random();
        let c = conv(ConvId::random(), MembersType::Kbfs, TeamType::None);
        inbox.merge(uid, InboxVers::new(3), &[c.clone()]).await.unwrap();

        let remote = ScriptedRemote::new(SyncInboxRes::Current);
        let result = syncer.sync(&remote, uid, None).await.unwrap().unwrap();
        assert_eq!(result, SyncType::Current);

        let (vers, convs) = inbox.read_all(uid).await.unwrap();
        assert_eq!(vers, InboxVers::new(3));
        assert_eq!(convs, vec![c]);

        let notification = stream.next().await.unwrap();
        assert_eq!(
            *notification,
            ChatNotification::InboxSynced {
                uid,
                result: SyncType::Current
            }
        );
    }

    #[tokio::test]
    async fn clear_sync_empties_the_store() {
        let (syncer, inbox, messages, _bus) = test_syncer().await;
        let uid = UserId::random();
        let conv_id = ConvId::random();
        let c = conv(conv_id, MembersType::Kbfs, TeamType::None);
        inbox.merge(uid, InboxVers::new(1), &[c]).await.unwrap();
        messages
            .store_message(
                conv_id,
                uid,
                crate::messages::Message {
                    id: MsgId::new(1),
                    body: Some(b"hi".to_vec()),
                },
            )
            .await
            .unwrap();

        let remote = ScriptedRemote::new(SyncInboxRes::Clear);
        let result = syncer.sync(&remote, uid, None).await.unwrap().unwrap();
        assert_eq!(result, SyncType::Clear);

        assert!(matches!(
            inbox.read_all(uid).await.unwrap_err(),
            InboxStoreError::Miss
        ));
        assert!(matches!(
            messages.fetch(conv_id, uid).await.unwrap_err(),
            crate::errors::MessageStoreError::Miss
        ));
    }

    #[tokio::test]
    async fn capability_bump_forces_clear_and_persists_versions() {
        let (syncer, inbox, _messages, _bus) = test_syncer().await;
        let uid = UserId::random();
        let c = conv(ConvId::random(), MembersType::Kbfs, TeamType::None);
        inbox.merge(uid, InboxVers::new(1), &[c]).await.unwrap();

        let remote = ScriptedRemote::with_versions(
            SyncInboxRes::Current,
            ServerCacheVersions { inbox: 0, bodies: 5 },
        );
        let result = syncer.sync(&remote, uid, None).await.unwrap().unwrap();
        assert_eq!(result, SyncType::Clear);

        assert!(matches!(
            inbox.read_all(uid).await.unwrap_err(),
            InboxStoreError::Miss
        ));
        assert_eq!(
            inbox.server_version(uid).await.unwrap(),
            ServerCacheVersions { inbox: 0, bodies: 5 }
        );
    }

    #[tokio::test]
    async fn destructive_ad_hoc_change_degrades_to_clear() {
        let (syncer, inbox, _messages, _bus) = test_syncer().await;
        let uid = UserId::random();
        let conv_id = ConvId::random();
        let stored = conv(conv_id, MembersType::Kbfs, TeamType::None);
        inbox.merge(uid, InboxVers::new(1), &[stored.clone()]).await.unwrap();

        let mut incoming = stored.clone();
        incoming.reader_info.status = ReaderStatus::Removed;

        let remote = ScriptedRemote::new(SyncInboxRes::Incremental {
            vers: InboxVers::new(2),
            convs: vec![incoming],
        });
        let result = syncer.sync(&remote, uid, None).await.unwrap().unwrap();
        assert_eq!(result, SyncType::Clear);
        assert!(matches!(
            inbox.read_all(uid).await.unwrap_err(),
            InboxStoreError::Miss
        ));
    }

    #[tokio::test]
    async fn team_shallow_change_drops_conv_from_update_set() {
        let (syncer, inbox, _messages, _bus) = test_syncer().await;
        let uid = UserId::random();
        let conv_id = ConvId::random();
        let mut stored = conv(conv_id, MembersType::Team, TeamType::Complex);
        stored.max_msg_summaries = vec![MaxMsgSummary {
            msg_type: MessageType::Metadata,
            msg_id: MsgId::new(5),
        }];
        inbox.merge(uid, InboxVers::new(1), &[stored.clone()]).await.unwrap();

        let mut incoming = stored.clone();
        incoming.max_msg_summaries.push(MaxMsgSummary {
            msg_type: MessageType::TeamMembershipChange,
            msg_id: MsgId::new(7),
        });

        let remote = ScriptedRemote::new(SyncInboxRes::Incremental {
            vers: InboxVers::new(2),
            convs: vec![incoming],
        });
        let result = syncer.sync(&remote, uid, None).await.unwrap().unwrap();
        assert_eq!(result, SyncType::Incremental { items: vec![] });

        let (vers, convs) = inbox.read_all(uid).await.unwrap();
        assert_eq!(vers, InboxVers::new(2));
        assert_eq!(convs, vec![stored]);
    }

    #[tokio::test]
    async fn non_shallow_team_change_surfaces_in_update_set() {
        let (syncer, inbox, _messages, _bus) = test_syncer().await;
        let uid = UserId::random();
        let conv_id = ConvId::random();
        let mut stored = conv(conv_id, MembersType::Team, TeamType::Complex);
        stored.max_msg_summaries = vec![MaxMsgSummary {
            msg_type: MessageType::Metadata,
            msg_id: MsgId::new(5),
        }];
        inbox.merge(uid, InboxVers::new(1), &[stored.clone()]).await.unwrap();

        let mut incoming = stored.clone();
        incoming.max_msg_summaries[0].msg_id = MsgId::new(10);

        let remote = ScriptedRemote::new(SyncInboxRes::Incremental {
            vers: InboxVers::new(2),
            convs: vec![incoming],
        });
        let result = syncer.sync(&remote, uid, None).await.unwrap().unwrap();
        match result {
            SyncType::Incremental { items } => assert_eq!(items.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn members_type_upgrade_clears_cached_messages() {
        let (syncer, inbox, messages, _bus) = test_syncer().await;
        let uid = UserId::random();
        let conv_id = ConvId::random();
        let stored = conv(conv_id, MembersType::Kbfs, TeamType::None);
        inbox.merge(uid, InboxVers::new(1), &[stored.clone()]).await.unwrap();
        messages
            .store_message(
                conv_id,
                uid,
                crate::messages::Message {
                    id: MsgId::new(1),
                    body: Some(b"hi".to_vec()),
                },
            )
            .await
            .unwrap();

        let mut incoming = stored.clone();
        incoming.members_type = MembersType::Impteam;

        let remote = ScriptedRemote::new(SyncInboxRes::Incremental {
            vers: InboxVers::new(2),
            convs: vec![incoming],
        });
        syncer.sync(&remote, uid, None).await.unwrap();

        assert!(matches!(
            messages.fetch(conv_id, uid).await.unwrap_err(),
            crate::errors::MessageStoreError::Miss
        ));
    }

    #[tokio::test]
    async fn expunge_advance_nulls_bodies_immediately() {
        let (syncer, inbox, messages, _bus) = test_syncer().await;
        let uid = UserId::random();
        let conv_id = ConvId::random();
        let stored = conv(conv_id, MembersType::Kbfs, TeamType::None);
        inbox.merge(uid, InboxVers::new(1), &[stored.clone()]).await.unwrap();
        for id in 1..=3u32 {
            messages
                .store_message(
                    conv_id,
                    uid,
                    crate::messages::Message {
                        id: MsgId::new(id),
                        body: Some(format!("msg {id}").into_bytes()),
                    },
                )
                .await
                .unwrap();
        }

        let mut incoming = stored.clone();
        incoming.expunge.upto = MsgId::new(3);

        let remote = ScriptedRemote::new(SyncInboxRes::Incremental {
            vers: InboxVers::new(2),
            convs: vec![incoming],
        });
        syncer.sync(&remote, uid, None).await.unwrap();

        let thread = messages.fetch(conv_id, uid).await.unwrap();
        assert!(thread.messages[0].body.is_none());
        assert!(thread.messages[1].body.is_none());
        assert!(thread.messages[2].body.is_some());
    }
}
