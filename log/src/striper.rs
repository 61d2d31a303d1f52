//! View management: position resolution, sequencer proposals, map expansion.
//!
//! The striper turns per-object primitives into log-wide behavior. It owns
//! the [`ViewReader`] and implements the two view-change flows:
//!
//! - **Sequencer hand-off**: seal every mapped object at the next epoch,
//!   harvest each object's max position to recover the tail, then propose a
//!   view appointing this client. Losing any race along the way is not an
//!   error; the caller waits for a newer view and re-evaluates.
//! - **Map expansion**: when a position falls past the last stripe, propose
//!   a view whose object map covers it, copying the sequencer config
//!   unchanged so the in-memory sequencer survives the change.

use std::sync::Arc;

use zlog_common::Status;

use crate::backend::LogBackend;
use crate::config::StripeOptions;
use crate::error::{Error, Result};
use crate::sequencer::Sequencer;
use crate::view::{SequencerConfig, Stripe, VersionedView, View};
use crate::view_reader::ViewReader;
use crate::Position;

pub(crate) struct Striper {
    backend: Arc<LogBackend>,
    view_reader: ViewReader,
    stripe_options: StripeOptions,
}

impl Striper {
    pub fn new(backend: Arc<LogBackend>, view_reader: ViewReader, stripe_options: StripeOptions) -> Self {
        Self {
            backend,
            view_reader,
            stripe_options,
        }
    }

    /// The current view snapshot.
    pub fn current_view(&self) -> Result<Arc<VersionedView>> {
        self.view_reader.view().ok_or(Error::NotFound)
    }

    /// Suspends until a view newer than `epoch` is installed.
    pub async fn wait_for_newer_view(&self, epoch: u64, wakeup: bool) -> Result<Arc<VersionedView>> {
        self.view_reader.wait_for_newer_view(epoch, wakeup).await
    }

    /// Returns the current view and its sequencer, proposing this client as
    /// the sequencer until some view appoints it.
    ///
    /// A refresh (not a wait for a newer epoch) follows each proposal: when
    /// two proposers fence each other mid-seal, neither installs a view, and
    /// the loop must come back around to propose again rather than wait for
    /// an epoch nobody will create.
    pub async fn ensure_sequencer(&self) -> Result<(Arc<VersionedView>, Arc<Sequencer>)> {
        loop {
            if self.view_reader.is_shutdown() {
                return Err(Error::Shutdown);
            }
            let view = self.current_view()?;
            if let Some(seq) = view.seq.clone() {
                return Ok((view, seq));
            }
            self.propose_sequencer(&view).await?;
            self.view_reader.refresh_now().await;
        }
    }

    /// Returns a view whose object map covers `position`, proposing
    /// expansions as needed.
    pub async fn ensure_mapping(&self, position: Position) -> Result<Arc<VersionedView>> {
        loop {
            let view = self.current_view()?;
            if view.map(position).is_some() {
                return Ok(view);
            }

            let next_epoch = view.epoch + 1;
            let mut object_map = view.view.object_map.clone();
            let added = object_map.expand(position, self.stripe_options);
            let proposal = View {
                object_map,
                seq_config: view.view.seq_config.clone(),
            };
            match self.backend.view_create(next_epoch, proposal.encode()).await {
                Ok(()) => {
                    tracing::debug!(epoch = next_epoch, position, "expanded object map");
                    for stripe in added {
                        self.init_stripe_objects(stripe, next_epoch);
                    }
                }
                Err(Status::InvalidArgument) => {
                    tracing::debug!(epoch = next_epoch, "lost map expansion race");
                }
                Err(status) => return Err(status.into()),
            }
            self.view_reader.wait_for_newer_view(view.epoch, true).await?;
        }
    }

    /// Proposes this client as the sequencer of `view.epoch + 1`.
    ///
    /// Sealing runs before the proposal: once every mapped object is at the
    /// new epoch, any laggard writer from the old view fails its fence, and
    /// the harvested max positions are a stable tail. A proposal that loses
    /// any race returns `Ok` and leaves the retry to the caller.
    async fn propose_sequencer(&self, view: &VersionedView) -> Result<()> {
        let next_epoch = view.epoch + 1;

        let mut max_pos: Option<Position> = None;
        for stripe in view.view.object_map.stripes() {
            for oid in stripe.object_ids(self.backend.prefix()) {
                match self.seal_and_harvest(&oid, next_epoch).await {
                    Ok(Some(pos)) => max_pos = Some(max_pos.map_or(pos, |max| max.max(pos))),
                    Ok(None) => {}
                    Err(Error::StaleView) => {
                        tracing::debug!(epoch = next_epoch, "sequencer proposal lost a sealing race");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // all objects empty: fall back to the previous appointment's tail so
        // positions stay monotonic across hand-offs
        let position = max_pos.map(|pos| pos + 1).unwrap_or_else(|| {
            view.view
                .seq_config
                .as_ref()
                .map(|seq| seq.position)
                .unwrap_or(0)
        });

        let proposal = View {
            object_map: view.view.object_map.clone(),
            seq_config: Some(SequencerConfig {
                epoch: next_epoch,
                position,
                token: self.backend.token().to_string(),
            }),
        };
        match self.backend.view_create(next_epoch, proposal.encode()).await {
            Ok(()) => {
                tracing::debug!(epoch = next_epoch, position, "proposed self as sequencer");
                Ok(())
            }
            Err(Status::InvalidArgument) => {
                tracing::debug!(epoch = next_epoch, "lost sequencer proposal race");
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Seals one object at `epoch` (initializing it if absent) and returns
    /// its max position, or `None` when empty.
    async fn seal_and_harvest(&self, oid: &str, epoch: u64) -> Result<Option<Position>> {
        let mut attempted_init = false;
        loop {
            match self.backend.entry_seal(oid, epoch).await {
                Ok(()) => break,
                Err(Status::NotFound) if !attempted_init => {
                    attempted_init = true;
                    match self.backend.entry_init(oid, epoch).await {
                        // a fresh object starts at the target epoch
                        Ok(()) => break,
                        Err(Status::Exists) => continue,
                        Err(status) => return Err(status.into()),
                    }
                }
                Err(Status::StaleEpoch) => return Err(Error::StaleView),
                Err(status) => return Err(status.into()),
            }
        }

        match self.backend.entry_max_position(oid, epoch).await {
            Ok(max) if max.empty => Ok(None),
            Ok(max) => Ok(Some(max.pos)),
            Err(Status::StaleEpoch) => Err(Error::StaleView),
            Err(status) => Err(status.into()),
        }
    }

    /// Kicks off background initialization of stripe `index` of the current
    /// view. Used right after log creation to take the initialization cost
    /// off the first append.
    pub fn init_stripe(&self, index: usize) -> Result<()> {
        let view = self.current_view()?;
        if let Some(stripe) = view.view.object_map.stripes().get(index) {
            self.init_stripe_objects(*stripe, view.epoch);
        }
        Ok(())
    }

    /// Initializes every object of a stripe in the background, tolerating
    /// objects that already exist.
    fn init_stripe_objects(&self, stripe: Stripe, epoch: u64) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            for oid in stripe.object_ids(backend.prefix()) {
                match backend.entry_init(&oid, epoch).await {
                    Ok(()) | Err(Status::Exists) => {}
                    Err(status) => {
                        tracing::warn!(%status, oid, "stripe object init failed");
                    }
                }
            }
        });
    }

    /// Shuts the view reader down, releasing all waiters.
    pub async fn close(&self) {
        self.view_reader.close().await;
    }
}
