// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The team shallow-change filter.
//!
//! Decides which `maxMsgSummaries` differences count as "shallow": a change
//! is shallow, and the conv is dropped from the incremental update set, iff
//! the `METADATA` summary's `msgId` is unchanged *and* no
//! non-team-administrative summary type changed. See `DESIGN.md` for the
//! full rationale.

use std::collections::HashMap;

use crate::types::{Conv, MaxMsgSummary, MessageType, TeamType};

/// True if `incoming`'s change relative to `stored` is pure team-management
/// bookkeeping that should not surface to the user.
///
/// Only applies to convs whose *stored* `teamType` is [`TeamType::Complex`];
/// callers should not drop a conv this function wasn't meant to judge.
pub(crate) fn is_shallow_team_change(stored: &Conv, incoming: &Conv) -> bool {
    if stored.team_type != TeamType::Complex {
        return false;
    }

    let stored_metadata_id = stored.max_msg_summary(MessageType::Metadata).map(|s| s.msg_id);
    let incoming_metadata_id = incoming.max_msg_summary(MessageType::Metadata).map(|s| s.msg_id);
    if stored_metadata_id != incoming_metadata_id {
        return false;
    }

    non_administrative_summaries(&stored.max_msg_summaries)
        == non_administrative_summaries(&incoming.max_msg_summaries)
}

fn non_administrative_summaries(summaries: &[MaxMsgSummary]) -> HashMap<MessageType, crate::identifiers::MsgId> {
    summaries
        .iter()
        .filter(|s| !s.msg_type.is_team_administrative())
        .map(|s| (s.msg_type, s.msg_id))
        .collect()
}
