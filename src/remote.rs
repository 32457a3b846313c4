// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The server protocol surface the sync engine consumes.
//!
//! The secure transport/RPC framing that implements this trait against the
//! real server lives elsewhere; this module only pins down the shape of the
//! contract so `Syncer` can be written and tested against a double.

use crate::identifiers::InboxVers;
use crate::types::Conv;

/// The tagged reply to `SyncInbox`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncInboxRes {
    /// The client's inbox version already matches the server's.
    Current,
    /// The server can't (or won't) compute a delta; the client must reload.
    Clear,
    /// Zero or more conv updates since the client's version.
    Incremental { vers: InboxVers, convs: Vec<Conv> },
}

/// Server-advertised session attributes.
///
/// If either exceeds the locally recorded value, the corresponding cache is
/// discarded regardless of what `SyncInbox` itself returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct ServerCacheVersions {
    pub inbox: u32,
    pub bodies: u32,
}

/// The server protocol surface consumed by [`crate::sync::Syncer`].
///
/// Modeled with [`trait_variant::make`] the way `coreclient`'s
/// `store::LocalStore` is, so the public alias (`RemoteInterface`) is
/// `Send`-bound and can be implemented by both a real async transport and an
/// in-memory test double.
#[allow(async_fn_in_trait, reason = "public alias below is Send-bound")]
#[trait_variant::make(RemoteInterface: Send)]
pub trait LocalRemoteInterface {
    /// Perform a full sync for `uid`, combining the chat inbox sync payload
    /// with whatever other top-level sync domains the server embeds
    /// (`SyncAll`). Those other domains are out of scope here.
    async fn sync_all(&self, uid: crate::identifiers::UserId) -> anyhow::Result<SyncInboxRes>;

    /// Delta-sync the inbox against the client's last-known version.
    async fn sync_inbox(
        &self,
        uid: crate::identifiers::UserId,
        vers: InboxVers,
    ) -> anyhow::Result<SyncInboxRes>;

    /// The server's currently advertised cache capability versions.
    fn cache_versions(&self) -> ServerCacheVersions;
}
