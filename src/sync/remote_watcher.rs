use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::remote::RemoteClient;

use super::SyncEngine;

const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Start the remote long-poll watcher.
///
/// The task waits on the change feed behind the stored cursor. When the
/// server reports changes it pulls them through [`SyncEngine::notify_change`]
/// and wakes the workers if anything was queued.
///
/// The watcher runs until the cancellation token is cancelled.
pub fn start_remote_watcher(
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteClient>,
    timeout: Duration,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    spawn_watcher(engine, remote, timeout, RETRY_DELAY, wake, cancel)
}

fn spawn_watcher(
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteClient>,
    timeout: Duration,
    retry_delay: Duration,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        long_poll_loop(engine, remote, timeout, retry_delay, wake, cancel).await;
        tracing::debug!("remote watcher cancelled");
    })
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Flow:
/// 1. Read the stored cursor, initializing it on first run
/// 2. Long-poll (blocks until changes or timeout)
/// 3. On change: pull and reconcile the feed, wake the workers
/// 4. Honor any backoff the server asked for, then repeat
async fn long_poll_loop(
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteClient>,
    timeout: Duration,
    retry_delay: Duration,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let cursor = match engine.cursor().await {
            Ok(Some(c)) => c.cursor,
            Ok(None) => {
                if let Err(e) = engine.notify_change().await {
                    tracing::warn!(error = %e, "failed to initialize the change cursor, retrying");
                    if !pause(&cancel, retry_delay).await {
                        return;
                    }
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read the change cursor, retrying");
                if !pause(&cancel, retry_delay).await {
                    return;
                }
                continue;
            }
        };

        tracing::debug!("long-polling for remote changes");
        let poll = tokio::select! {
            _ = cancel.cancelled() => return,
            result = remote.longpoll(&cursor, timeout) => result,
        };

        let poll = match poll {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "long-poll failed, retrying");
                if !pause(&cancel, retry_delay).await {
                    return;
                }
                continue;
            }
        };

        if poll.changes {
            match engine.notify_change().await {
                Ok(report) if report.enqueued() > 0 => wake.notify_waiters(),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to pull remote changes, retrying");
                    if !pause(&cancel, retry_delay).await {
                        return;
                    }
                    continue;
                }
            }
        }

        if let Some(secs) = poll.backoff {
            tracing::debug!(secs, "server asked for backoff");
            if !pause(&cancel, Duration::from_secs(secs)).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::local::FsLocalStore;
    use crate::sync::queue::Status;
    use crate::sync::state;
    use crate::testing::{MemoryRemote, memory_pool};

    #[tokio::test]
    async fn change_on_remote_queues_task_and_wakes_workers() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[local]\nroot = \"{}\"\n[remote]\nroot = \"/root\"\napp_key = \"k\"\n",
            dir.path().display()
        );
        let config = parse_config(&toml).unwrap();
        let pool = memory_pool().await;
        let local = Arc::new(FsLocalStore::open(dir.path(), ".").await.unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let engine = Arc::new(SyncEngine::new(
            pool.clone(),
            &config,
            local,
            remote.clone(),
        ));
        state::set_cursor(&pool, "/root", "c:0", false)
            .await
            .unwrap();
        remote.put_file("/root/a.txt", b"a");

        let wake = Arc::new(Notify::new());
        let woken = wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();

        let cancel = CancellationToken::new();
        let handle = start_remote_watcher(
            engine.clone(),
            remote,
            Duration::from_millis(10),
            wake.clone(),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), woken)
            .await
            .expect("workers were not woken");
        cancel.cancel();
        handle.await.unwrap();

        let pending = engine.queue().list(Status::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_id, "/root/a.txt");
    }

    #[tokio::test]
    async fn cursor_failure_at_startup_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[local]\nroot = \"{}\"\n[remote]\nroot = \"/root\"\napp_key = \"k\"\n",
            dir.path().display()
        );
        let config = parse_config(&toml).unwrap();
        let pool = memory_pool().await;
        let local = Arc::new(FsLocalStore::open(dir.path(), ".").await.unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let engine = Arc::new(SyncEngine::new(
            pool.clone(),
            &config,
            local,
            remote.clone(),
        ));
        remote.fail_next_cursors(2);

        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let handle = spawn_watcher(
            engine.clone(),
            remote.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            wake.clone(),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.cursor().await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cursor was never initialized");
        assert!(!handle.is_finished());

        let woken = wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        remote.put_file("/root/a.txt", b"a");
        tokio::time::timeout(Duration::from_secs(5), woken)
            .await
            .expect("workers were not woken");

        cancel.cancel();
        handle.await.unwrap();
    }
}
