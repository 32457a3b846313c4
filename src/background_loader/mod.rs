// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A de-duplicating background queue that pre-warms message storage for
//! conversations touched by sync.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::identifiers::{ConvId, UserId};

/// Pulls (hydrates) a conversation's thread into message storage.
///
/// The per-conversation message decryption/download/thread-assembly logic
/// itself is out of scope here; this crate only needs the pull entrypoint.
#[trait_variant::make(ConvSource: Send)]
pub trait LocalConvSource {
    async fn pull(&self, uid: UserId, conv_id: ConvId) -> anyhow::Result<()>;
}

enum Command {
    Enqueue(UserId, ConvId),
}

/// A handle to the running background loader task.
///
/// Grounded on `backend/src/pg_listen.rs`'s `PgListenerTaskHandle`: a single
/// spawned task owns the dedup state, reached over an `mpsc` channel. The
/// task stops when the last handle is dropped.
#[derive(Clone)]
pub struct BackgroundConvLoaderHandle {
    tx: mpsc::Sender<Command>,
}

impl BackgroundConvLoaderHandle {
    /// Enqueue `conv_id` for `uid`. A no-op if the same pair is already
    /// queued or currently loading.
    pub async fn enqueue(&self, uid: UserId, conv_id: ConvId) {
        if let Err(error) = self.tx.send(Command::Enqueue(uid, conv_id)).await {
            error!(%error, "background conv loader task is gone");
        }
    }
}

/// Spawns the single background-loader worker task.
///
/// There is exactly one worker per process: queue ordering would otherwise be
/// unobservable, and only "one load per distinct convId" after a burst is
/// required, not bounded parallelism.
pub fn spawn<S>(source: Arc<S>) -> BackgroundConvLoaderHandle
where
    S: ConvSource + 'static,
{
    let (tx, mut rx) = mpsc::channel(1024);

    tokio::spawn(async move {
        let mut pending_or_loading: HashSet<(UserId, ConvId)> = HashSet::new();
        let mut queue: std::collections::VecDeque<(UserId, ConvId)> = std::collections::VecDeque::new();

        let mut enqueue = |pending_or_loading: &mut HashSet<(UserId, ConvId)>,
                           queue: &mut std::collections::VecDeque<(UserId, ConvId)>,
                           uid: UserId,
                           conv_id: ConvId| {
            if pending_or_loading.insert((uid, conv_id)) {
                queue.push_back((uid, conv_id));
            }
        };

        loop {
            let Some((uid, conv_id)) = queue.pop_front() else {
                // Nothing queued: block for the next command.
                match rx.recv().await {
                    Some(Command::Enqueue(uid, conv_id)) => {
                        enqueue(&mut pending_or_loading, &mut queue, uid, conv_id);
                    }
                    None => return, // last handle dropped, stop the task
                }
                continue;
            };

            // Drain any commands that arrived without blocking, so a burst
            // of enqueues dedups against the whole burst rather than one at
            // a time.
            while let Ok(Command::Enqueue(uid, conv_id)) = rx.try_recv() {
                enqueue(&mut pending_or_loading, &mut queue, uid, conv_id);
            }

            // (uid, conv_id) stays in `pending_or_loading` for the whole pull,
            // not just until it starts: keep draining the channel while the
            // pull is in flight, so an enqueue of the same key arriving mid-load
            // is deduped against the still-pending entry rather than being
            // replayed as a fresh request once the key is removed below.
            let pull = source.pull(uid, conv_id);
            tokio::pin!(pull);
            let mut channel_closed = false;
            let result = loop {
                tokio::select! {
                    result = &mut pull => break result,
                    cmd = rx.recv(), if !channel_closed => {
                        match cmd {
                            Some(Command::Enqueue(u, c)) => enqueue(&mut pending_or_loading, &mut queue, u, c),
                            None => channel_closed = true,
                        }
                    }
                }
            };
            if let Err(error) = result {
                warn!(%uid, %conv_id, %error, "background conv load failed");
            }
            pending_or_loading.remove(&(uid, conv_id));
        }
    });

    BackgroundConvLoaderHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct CountingSource {
        calls: AtomicUsize,
        notify: Notify,
    }

    impl ConvSource for CountingSource {
        async fn pull(&self, _uid: UserId, _conv_id: ConvId) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_enqueue_while_pending_dispatches_once() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        let handle = spawn(source.clone());
        let uid = UserId::random();
        let conv_id = ConvId::random();

        handle.enqueue(uid, conv_id).await;
        handle.enqueue(uid, conv_id).await;
        handle.enqueue(uid, conv_id).await;

        source.notify.notified().await;
        // Give the task a moment in case dedup failed and a second pull is
        // about to fire.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    struct BlockingSource {
        calls: AtomicUsize,
        started: Notify,
        proceed: Notify,
    }

    impl ConvSource for BlockingSource {
        async fn pull(&self, _uid: UserId, _conv_id: ConvId) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.proceed.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_enqueue_while_pull_in_flight_is_a_noop() {
        let source = Arc::new(BlockingSource {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            proceed: Notify::new(),
        });
        let handle = spawn(source.clone());
        let uid = UserId::random();
        let conv_id = ConvId::random();

        handle.enqueue(uid, conv_id).await;
        source.started.notified().await;

        // Arrives while the first pull is still in flight.
        handle.enqueue(uid, conv_id).await;
        handle.enqueue(uid, conv_id).await;

        // Give the worker a chance to drain the duplicates before it unblocks.
        tokio::time::sleep(Duration::from_millis(100)).await;
        source.proceed.notify_one();

        // Allow time for a spurious second dispatch to start, if the bug
        // were present.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_convs_each_dispatch_once() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        let handle = spawn(source.clone());
        let uid = UserId::random();

        for _ in 0..5 {
            handle.enqueue(uid, ConvId::random()).await;
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
    }
}
