// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The conversation metadata data model.

use serde::{Deserialize, Serialize};

use crate::identifiers::{ConvId, MsgId};

/// How the members of a conversation are represented/authenticated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MembersType {
    Kbfs,
    Team,
    Impteam,
    ImpteamUpgrade,
}

/// User-set status of a conversation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ConvStatus {
    Unfiled,
    Muted,
    Archived,
    Reported,
    Blocked,
    Ignored,
}

/// Server-side lifecycle state of a conversation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Existence {
    Active,
    Archived,
    Deleted,
    Abandoned,
}

/// The calling user's membership status in a conversation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ReaderStatus {
    Active,
    Removed,
    Left,
    Preview,
    Reset,
}

impl ReaderStatus {
    /// Transitions into one of these are "destructive" for a non-team conv.
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Removed | Self::Left | Self::Reset)
    }
}

impl Existence {
    /// Transitions into one of these are "destructive" for a non-team conv.
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Deleted | Self::Abandoned)
    }

    /// Whether a conv in this state is eligible for background prefetch.
    pub fn is_prefetchable(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl ReaderStatus {
    /// Whether a conv with this reader status is eligible for background
    /// prefetch.
    pub fn is_prefetchable(self) -> bool {
        matches!(self, Self::Active | Self::Preview)
    }
}

/// Reader-scoped bookkeeping: the calling user's membership state plus the
/// highest message id they have observed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReaderInfo {
    pub status: ReaderStatus,
    pub max_msg_id: MsgId,
}

/// Whether (and how) a conversation is backed by a cryptographic team.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TeamType {
    None,
    Simple,
    Complex,
}

/// A retention-policy directive: bodies of messages with id < `upto` have
/// been (or should be) erased, while the message skeletons remain.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
pub struct Expunge {
    pub upto: MsgId,
}

impl Default for MsgId {
    fn default() -> Self {
        Self::new(0)
    }
}

/// The message type a [`MaxMsgSummary`] summarizes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Metadata,
    Text,
    Delete,
    Attachment,
    Edit,
    Reaction,
    Join,
    Leave,
    TeamMembershipChange,
}

impl MessageType {
    /// Team-management bookkeeping that the shallow-change filter ignores on
    /// its own.
    pub fn is_team_administrative(self) -> bool {
        matches!(self, Self::Join | Self::Leave | Self::TeamMembershipChange)
    }
}

/// The most recent message of a given type in a conversation, as summarized
/// by the server for inbox display purposes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MaxMsgSummary {
    pub msg_type: MessageType,
    pub msg_id: MsgId,
}

/// Conversation metadata, as stored by [`crate::inbox::InboxStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv {
    pub id: ConvId,
    pub tlf: String,
    pub topic_type: String,
    pub topic_id: String,
    pub members_type: MembersType,
    pub status: ConvStatus,
    pub existence: Existence,
    pub reader_info: ReaderInfo,
    pub team_type: TeamType,
    pub expunge: Expunge,
    pub max_msg_summaries: Vec<MaxMsgSummary>,
}

impl Conv {
    /// Eligible for background prefetch.
    pub fn is_prefetchable(&self) -> bool {
        self.reader_info.status.is_prefetchable() && self.existence.is_prefetchable()
    }

    /// Whether `self` (the incoming conv) represents a destructive change
    /// relative to `stored`.
    pub fn is_destructive_change_from(&self, stored: &Conv) -> bool {
        (self.reader_info.status.is_destructive() && self.reader_info.status != stored.reader_info.status)
            || (self.existence.is_destructive() && self.existence != stored.existence)
            || (self.team_type == TeamType::Complex && stored.team_type != TeamType::Complex)
    }

    pub fn max_msg_summary(&self, msg_type: MessageType) -> Option<MaxMsgSummary> {
        self.max_msg_summaries
            .iter()
            .copied()
            .find(|s| s.msg_type == msg_type)
    }
}
