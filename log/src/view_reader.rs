//! Background refresh of the latest view.
//!
//! One worker task per log handle polls the head object with a bounded,
//! doubling backoff. Any operation that fails an epoch fence demands an
//! immediate refresh through [`ViewReader::wait_for_newer_view`], which
//! resets the backoff to its floor, wakes the worker, and suspends the
//! caller until a strictly newer view is published (or the handle shuts
//! down). Published views are immutable snapshots behind `Arc`s; the watch
//! channel is what wakes every waiter whose target epoch has been passed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::LogBackend;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::sequencer::Sequencer;
use crate::view::{VersionedView, View};

/// Views fetched per head read while paging toward the latest epoch.
const VIEW_READ_BATCH: u32 = 128;

struct RefreshState {
    /// Callers currently blocked in `wait_for_newer_view`.
    waiters: usize,
    /// Current polling delay; doubles on idle timeouts, reset to the floor
    /// by demand wakeups.
    backoff: Duration,
}

struct ReaderInner {
    backend: Arc<LogBackend>,
    min_refresh_timeout: Duration,
    max_refresh_timeout: Duration,
    state: Mutex<RefreshState>,
    view_tx: watch::Sender<Option<Arc<VersionedView>>>,
    wake: Notify,
    stop: CancellationToken,
    /// Serializes refreshes between the worker and demand callers, so the
    /// published epoch never regresses and one appointment never yields two
    /// sequencer instances.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ReaderInner {
    /// Reads forward from the last known epoch and publishes the newest
    /// view, if any. Failures are logged and retried on the next cycle.
    async fn refresh_view(&self) {
        let _serial = self.refresh_lock.lock().await;
        let current = self.view_tx.borrow().clone();
        let mut from = current.as_ref().map(|view| view.epoch + 1).unwrap_or(1);

        let mut latest = None;
        loop {
            let views = match self.backend.view_read(from, VIEW_READ_BATCH).await {
                Ok(views) => views,
                Err(status) => {
                    tracing::warn!(%status, "failed to read views during refresh");
                    return;
                }
            };
            let Some((epoch, blob)) = views.latest() else {
                break;
            };
            latest = Some((epoch, blob.clone()));
            from = epoch + 1;
        }

        let Some((epoch, blob)) = latest else {
            return;
        };
        let view = match View::decode(&blob) {
            Ok(view) => view,
            Err(err) => {
                tracing::warn!(epoch, error = %err, "undecodable view blob");
                return;
            }
        };

        let seq = self.resolve_sequencer(current.as_deref(), &view);
        tracing::debug!(
            epoch,
            seq_epoch = seq.as_ref().map(|seq| seq.init_epoch()),
            "installed newer view"
        );
        self.view_tx
            .send_replace(Some(Arc::new(VersionedView { epoch, view, seq })));
    }

    /// Builds (or carries over) the sequencer handle for a freshly read view.
    ///
    /// The previous instance is reused only when the previous view carried
    /// the same appointment: same token and same appointment epoch. That
    /// preserves in-flight allocations across view changes that merely copy
    /// the sequencer config (for example map expansion). Any other
    /// appointment naming this client starts a fresh counter from the
    /// recovered tail in the config.
    fn resolve_sequencer(
        &self,
        current: Option<&VersionedView>,
        view: &View,
    ) -> Option<Arc<Sequencer>> {
        let seq_config = view.seq_config.as_ref()?;
        if seq_config.token != self.backend.token() {
            return None;
        }
        if let Some(current) = current {
            if let (Some(cur_config), Some(cur_seq)) =
                (current.view.seq_config.as_ref(), current.seq.as_ref())
            {
                if cur_config.token == seq_config.token && cur_config.epoch == seq_config.epoch {
                    return Some(Arc::clone(cur_seq));
                }
            }
        }
        Some(Arc::new(Sequencer::new(
            seq_config.epoch,
            seq_config.position,
        )))
    }

    async fn run(self: Arc<Self>) {
        loop {
            let timeout = {
                let state = self.state.lock().expect("refresh state mutex poisoned");
                if state.waiters == 0 {
                    self.max_refresh_timeout
                } else {
                    state.backoff.min(self.max_refresh_timeout)
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(timeout) => {
                    let mut state = self.state.lock().expect("refresh state mutex poisoned");
                    state.backoff = state.backoff.saturating_mul(2);
                }
            }

            if self.stop.is_cancelled() {
                break;
            }
            self.refresh_view().await;
        }
    }
}

/// Unregisters a waiter when its future completes or is dropped.
struct WaiterGuard<'a> {
    inner: &'a ReaderInner,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .inner
            .state
            .lock()
            .expect("refresh state mutex poisoned");
        state.waiters -= 1;
    }
}

/// Holder of the current view and owner of the refresh worker.
pub(crate) struct ViewReader {
    inner: Arc<ReaderInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ViewReader {
    /// Performs one synchronous refresh (a freshly opened log has no waiters
    /// to trigger one) and starts the background worker.
    pub async fn open(backend: Arc<LogBackend>, options: &Options) -> Result<Self> {
        let inner = Arc::new(ReaderInner {
            backend,
            min_refresh_timeout: options.min_refresh_timeout,
            max_refresh_timeout: options.max_refresh_timeout,
            state: Mutex::new(RefreshState {
                waiters: 0,
                backoff: options.max_refresh_timeout,
            }),
            view_tx: watch::Sender::new(None),
            wake: Notify::new(),
            stop: CancellationToken::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
        });

        inner.refresh_view().await;
        if inner.view_tx.borrow().is_none() {
            return Err(Error::NotFound);
        }

        let worker = tokio::spawn(Arc::clone(&inner).run());
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The current view snapshot.
    pub fn view(&self) -> Option<Arc<VersionedView>> {
        self.inner.view_tx.borrow().clone()
    }

    /// Blocks until a view with an epoch strictly greater than `epoch` is
    /// published, or the handle shuts down.
    ///
    /// `wakeup` is the demand-refresh hint set by callers that just observed
    /// an epoch fence; it (and the arrival of a first waiter) resets the
    /// polling backoff to its floor and wakes the worker immediately.
    pub async fn wait_for_newer_view(
        &self,
        epoch: u64,
        wakeup: bool,
    ) -> Result<Arc<VersionedView>> {
        let inner = self.inner.as_ref();
        if inner.stop.is_cancelled() {
            return Err(Error::Shutdown);
        }

        {
            let mut state = inner.state.lock().expect("refresh state mutex poisoned");
            let first_waiter = state.waiters == 0;
            state.waiters += 1;
            if first_waiter || wakeup {
                state.backoff = inner.min_refresh_timeout;
                inner.wake.notify_one();
            }
        }
        // unregisters even when the waiting future is dropped mid-flight
        let _guard = WaiterGuard { inner };

        let mut rx = inner.view_tx.subscribe();
        tokio::select! {
            _ = inner.stop.cancelled() => Err(Error::Shutdown),
            newer = rx.wait_for(|view| {
                view.as_ref().is_some_and(|view| view.epoch > epoch)
            }) => match newer {
                Ok(view) => Ok(Arc::clone(view.as_ref().expect("matched view is present"))),
                Err(_) => Err(Error::Shutdown),
            },
        }
    }

    /// Runs one refresh cycle immediately, without requiring the latest
    /// epoch to advance. Used by proposal loops that must re-examine the
    /// head even when their own proposal went nowhere.
    pub async fn refresh_now(&self) {
        self.inner.refresh_view().await;
    }

    /// Whether the handle has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Stops the worker and waits for it to exit. All pending waiters are
    /// released with [`Error::Shutdown`] and no view change.
    pub async fn close(&self) {
        self.inner.stop.cancel();
        let worker = self
            .worker
            .lock()
            .expect("worker handle mutex poisoned")
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Drop for ViewReader {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use zlog_common::{MemStore, ObjectStore};

    use crate::config::StripeOptions;
    use crate::view::SequencerConfig;

    const TOKEN: &str = "zlog.token.test.head.host.1";

    fn fast_options() -> Options {
        Options {
            min_refresh_timeout: Duration::from_millis(10),
            max_refresh_timeout: Duration::from_millis(50),
            ..Options::default()
        }
    }

    fn stripe() -> StripeOptions {
        StripeOptions { width: 1, slots: 8 }
    }

    async fn setup() -> Arc<LogBackend> {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let backend = Arc::new(LogBackend::new(
            store,
            "head".to_string(),
            "prefix".to_string(),
            TOKEN.to_string(),
        ));
        backend.view_init("prefix").await.unwrap();
        backend
            .view_create(1, View::initial(stripe()).encode())
            .await
            .unwrap();
        backend
    }

    fn appointed_view(seq_epoch: u64, position: u64, token: &str) -> View {
        let mut view = View::initial(stripe());
        view.seq_config = Some(SequencerConfig {
            epoch: seq_epoch,
            position,
            token: token.to_string(),
        });
        view
    }

    #[tokio::test]
    async fn should_observe_initial_view_at_open() {
        // given
        let backend = setup().await;

        // when
        let reader = ViewReader::open(backend, &fast_options()).await.unwrap();

        // then
        let view = reader.view().unwrap();
        assert_eq!(view.epoch, 1);
        assert!(view.seq.is_none());
        reader.close().await;
    }

    #[tokio::test]
    async fn should_fail_open_when_head_has_no_views() {
        // given: a head with no views at all
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let backend = Arc::new(LogBackend::new(
            store,
            "head".to_string(),
            "prefix".to_string(),
            TOKEN.to_string(),
        ));
        backend.view_init("prefix").await.unwrap();

        // when/then
        assert!(ViewReader::open(backend, &fast_options()).await.is_err());
    }

    #[tokio::test]
    async fn should_wake_waiter_when_newer_view_appears() {
        // given: a reader at epoch 1 with a registered waiter
        let backend = setup().await;
        let reader = Arc::new(ViewReader::open(Arc::clone(&backend), &fast_options()).await.unwrap());
        let waiter = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.wait_for_newer_view(1, false).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // when: a new view lands on the head from outside
        backend
            .view_create(2, View::initial(stripe()).encode())
            .await
            .unwrap();

        // then: the waiter unblocks within a refresh cycle
        let view = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter timed out")
            .unwrap()
            .unwrap();
        assert!(view.epoch > 1);
        reader.close().await;
    }

    #[tokio::test]
    async fn should_release_waiters_on_close_without_view_change() {
        // given
        let backend = setup().await;
        let reader = Arc::new(ViewReader::open(backend, &fast_options()).await.unwrap());
        let waiter = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.wait_for_newer_view(1, false).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // when
        reader.close().await;

        // then
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert!(matches!(result, Err(Error::Shutdown)));
        assert_eq!(reader.view().unwrap().epoch, 1);
    }

    #[tokio::test]
    async fn should_create_sequencer_when_view_names_this_client() {
        // given
        let backend = setup().await;
        let reader = ViewReader::open(Arc::clone(&backend), &fast_options()).await.unwrap();

        // when
        backend
            .view_create(2, appointed_view(2, 5, TOKEN).encode())
            .await
            .unwrap();
        let view = reader.wait_for_newer_view(1, true).await.unwrap();

        // then
        let seq = view.seq.as_ref().expect("sequencer appointed");
        assert_eq!(seq.tail(), 5);
        assert_eq!(seq.init_epoch(), 2);
        reader.close().await;
    }

    #[tokio::test]
    async fn should_not_create_sequencer_for_other_tokens() {
        // given
        let backend = setup().await;
        let reader = ViewReader::open(Arc::clone(&backend), &fast_options()).await.unwrap();

        // when
        backend
            .view_create(2, appointed_view(2, 5, "zlog.token.other").encode())
            .await
            .unwrap();
        let view = reader.wait_for_newer_view(1, true).await.unwrap();

        // then
        assert!(view.seq.is_none());
        reader.close().await;
    }

    #[tokio::test]
    async fn should_reuse_sequencer_across_copied_appointments() {
        // given: this client is the sequencer and has allocated positions
        let backend = setup().await;
        let reader = ViewReader::open(Arc::clone(&backend), &fast_options()).await.unwrap();
        backend
            .view_create(2, appointed_view(2, 5, TOKEN).encode())
            .await
            .unwrap();
        let view2 = reader.wait_for_newer_view(1, true).await.unwrap();
        let seq2 = view2.seq.clone().unwrap();
        assert_eq!(seq2.allocate(), 5);

        // when: a newer view copies the appointment unchanged
        backend
            .view_create(3, appointed_view(2, 5, TOKEN).encode())
            .await
            .unwrap();
        let view3 = reader.wait_for_newer_view(2, true).await.unwrap();

        // then: the instance is reused and in-flight allocations survive
        let seq3 = view3.seq.clone().unwrap();
        assert!(Arc::ptr_eq(&seq2, &seq3));
        assert_eq!(seq3.tail(), 6);

        // and a re-appointment with a new epoch starts a fresh counter
        backend
            .view_create(4, appointed_view(4, 9, TOKEN).encode())
            .await
            .unwrap();
        let view4 = reader.wait_for_newer_view(3, true).await.unwrap();
        let seq4 = view4.seq.clone().unwrap();
        assert!(!Arc::ptr_eq(&seq3, &seq4));
        assert_eq!(seq4.tail(), 9);
        reader.close().await;
    }
}
