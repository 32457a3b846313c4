// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent per-conversation message cache.

mod store;

pub use store::{Message, MessageStore, Thread};
