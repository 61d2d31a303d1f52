//! The log façade: open/create, append, read, fill, trim, tail.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use zlog_common::{create_store, ObjectStore, Status};

use crate::backend::LogBackend;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::striper::Striper;
use crate::view::View;
use crate::view_reader::ViewReader;
use crate::Position;

/// An open handle to one shared log.
///
/// All methods take `&self`; the handle is cheap to share across tasks.
/// Every operation is an epoch-fenced loop: an operation that trips an
/// object's fence triggers an immediate view refresh and retries under the
/// fresh view, so callers only ever see terminal outcomes.
///
/// # Example
///
/// ```ignore
/// use zlog::{Log, Options};
///
/// let log = Log::open(Options::default(), "mylog").await?;
/// let pos = log.append(Bytes::from("payload")).await?;
/// assert_eq!(log.read(pos).await?, Bytes::from("payload"));
/// ```
pub struct Log {
    inner: Arc<LogInner>,
}

/// Handle to an append running in the background.
///
/// Returned by [`Log::append_background`]; resolve it with
/// [`AppendHandle::wait`] to learn the assigned position.
pub struct AppendHandle {
    rx: oneshot::Receiver<Result<Position>>,
}

impl AppendHandle {
    /// Waits for the append to complete and returns its position.
    pub async fn wait(self) -> Result<Position> {
        self.rx.await.map_err(|_| Error::Shutdown)?
    }
}

struct LogInner {
    backend: Arc<LogBackend>,
    striper: Striper,
}

impl Log {
    /// Opens (or creates, per the options) the named log, building the
    /// object store from `options.store`.
    pub async fn open(options: Options, name: &str) -> Result<Log> {
        let store = create_store(&options.store).map_err(Error::from)?;
        Self::open_with_store(options, name, store).await
    }

    /// Opens (or creates) the named log on an existing store instance.
    ///
    /// This is how several handles — typically in different processes —
    /// share one log.
    pub async fn open_with_store(
        options: Options,
        name: &str,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Log> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("log name is empty".into()));
        }

        let hoid = format!("zlog.head.{}", name);
        let prefix = format!("zlog.log.{}", name);

        let unique_id = store.unique_id(&hoid).await.map_err(Error::from)?;
        let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());
        let token = format!("zlog.token.{}.{}.{}.{}", name, hoid, hostname, unique_id);

        let backend = Arc::new(LogBackend::new(store, hoid, prefix.clone(), token));
        let created = create_or_open(&options, &backend, &prefix).await?;

        let view_reader = ViewReader::open(Arc::clone(&backend), &options).await?;
        let striper = Striper::new(Arc::clone(&backend), view_reader, options.stripe);

        if created && options.init_stripe_on_create {
            striper.init_stripe(0)?;
        }

        Ok(Log {
            inner: Arc::new(LogInner { backend, striper }),
        })
    }

    /// Appends a payload and returns its position.
    pub async fn append(&self, payload: Bytes) -> Result<Position> {
        self.inner.append(payload).await
    }

    /// Reads the payload at a position.
    pub async fn read(&self, position: Position) -> Result<Bytes> {
        self.inner.read(position).await
    }

    /// Marks an unwritten position as unusable so readers see a hole
    /// instead of waiting forever. Fails [`Error::ReadOnly`] if the
    /// position holds data.
    pub async fn fill(&self, position: Position) -> Result<()> {
        self.inner.invalidate(position, false).await
    }

    /// Invalidates a position unconditionally, releasing its payload.
    pub async fn trim(&self, position: Position) -> Result<()> {
        self.inner.invalidate(position, true).await
    }

    /// The next position the log will assign.
    pub async fn check_tail(&self) -> Result<Position> {
        let (_view, seq) = self.inner.striper.ensure_sequencer().await?;
        Ok(seq.tail())
    }

    /// Starts an append without waiting for it.
    pub fn append_background(&self, payload: Bytes) -> AppendHandle {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _ = tx.send(inner.append(payload).await);
        });
        AppendHandle { rx }
    }

    /// Shuts the handle down: stops the view-refresh worker and releases
    /// every pending waiter with [`Error::Shutdown`].
    pub async fn close(&self) {
        self.inner.striper.close().await;
    }
}

/// Runs the create-or-open handshake against the head object.
///
/// Returns whether this call created the log. The loop shape absorbs every
/// race: losing `view_init` to another creator falls through to the open
/// path, and losing the initial `view_create` just means someone else's
/// epoch-1 view is already in place.
async fn create_or_open(options: &Options, backend: &LogBackend, prefix: &str) -> Result<bool> {
    let mut created = false;
    loop {
        match backend.view_read(1, 1).await {
            Ok(views) if !views.views.is_empty() => {
                if options.error_if_exists && !created {
                    return Err(Error::AlreadyExists);
                }
                return Ok(created);
            }
            // head exists but holds no views yet: install the initial view
            Ok(_) => {
                let initial = View::initial(options.stripe);
                match backend.view_create(1, initial.encode()).await {
                    Ok(()) => continue,
                    Err(Status::InvalidArgument) => continue,
                    Err(status) => return Err(status.into()),
                }
            }
            Err(Status::NotFound) => {
                if !options.create_if_missing {
                    return Err(Error::NotFound);
                }
                match backend.view_init(prefix).await {
                    Ok(()) => {
                        created = true;
                        continue;
                    }
                    Err(Status::Exists) => {
                        if options.error_if_exists {
                            return Err(Error::AlreadyExists);
                        }
                        continue;
                    }
                    Err(status) => return Err(status.into()),
                }
            }
            Err(Status::Corrupt) => {
                return Err(Error::Corruption("head object is corrupt".into()))
            }
            Err(status) => return Err(status.into()),
        }
    }
}

impl LogInner {
    async fn append(&self, payload: Bytes) -> Result<Position> {
        loop {
            let (_view, seq) = self.striper.ensure_sequencer().await?;
            let position = seq.allocate();
            match self.write_at(position, payload.clone()).await {
                Ok(()) => return Ok(position),
                // the position was consumed under an older regime (filled or
                // written before a hand-off); allocate a fresh one
                Err(Error::ReadOnly) => {
                    tracing::debug!(position, "append position already consumed, reallocating");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_at(&self, position: Position, payload: Bytes) -> Result<()> {
        let mut initialized = false;
        loop {
            let view = self.striper.ensure_mapping(position).await?;
            let Some(stripe) = view.map(position).copied() else {
                return Err(Error::Corruption(
                    "expanded object map does not cover position".into(),
                ));
            };
            let oid = stripe.object_id(self.backend.prefix(), position);
            match self
                .backend
                .entry_write(
                    &oid,
                    view.epoch,
                    position,
                    stripe.slots,
                    stripe.width,
                    payload.clone(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(Status::StaleEpoch) => {
                    self.striper.wait_for_newer_view(view.epoch, true).await?;
                }
                Err(Status::NotFound) if !initialized => {
                    initialized = true;
                    self.init_object(&oid, view.epoch).await?;
                }
                Err(status) => return Err(status.into()),
            }
        }
    }

    async fn read(&self, position: Position) -> Result<Bytes> {
        let mut initialized = false;
        loop {
            let view = self.striper.current_view()?;
            let Some(stripe) = view.map(position).copied() else {
                // the position lies past every stripe, so nothing wrote it
                return Err(Error::NotWritten);
            };
            let oid = stripe.object_id(self.backend.prefix(), position);
            match self
                .backend
                .entry_read(&oid, view.epoch, position, stripe.slots, stripe.width)
                .await
            {
                Ok(payload) => return Ok(payload),
                Err(Status::StaleEpoch) => {
                    self.striper.wait_for_newer_view(view.epoch, true).await?;
                }
                Err(Status::NotFound) if !initialized => {
                    initialized = true;
                    self.init_object(&oid, view.epoch).await?;
                }
                Err(Status::OutOfRange) => return Err(Error::NotWritten),
                Err(Status::Invalidated) => return Err(Error::Invalidated),
                Err(status) => return Err(status.into()),
            }
        }
    }

    async fn invalidate(&self, position: Position, force: bool) -> Result<()> {
        let mut initialized = false;
        loop {
            let view = self.striper.ensure_mapping(position).await?;
            let Some(stripe) = view.map(position).copied() else {
                return Err(Error::Corruption(
                    "expanded object map does not cover position".into(),
                ));
            };
            let oid = stripe.object_id(self.backend.prefix(), position);
            match self
                .backend
                .entry_invalidate(&oid, view.epoch, position, stripe.slots, stripe.width, force)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Status::StaleEpoch) => {
                    self.striper.wait_for_newer_view(view.epoch, true).await?;
                }
                Err(Status::NotFound) if !initialized => {
                    initialized = true;
                    self.init_object(&oid, view.epoch).await?;
                }
                Err(status) => return Err(status.into()),
            }
        }
    }

    async fn init_object(&self, oid: &str, epoch: u64) -> Result<()> {
        match self.backend.entry_init(oid, epoch).await {
            Ok(()) | Err(Status::Exists) => Ok(()),
            Err(status) => Err(status.into()),
        }
    }
}
