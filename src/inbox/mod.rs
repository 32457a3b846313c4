// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent key/value store of conversation metadata.

mod store;

pub use store::InboxStore;
