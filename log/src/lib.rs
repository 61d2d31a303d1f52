//! Client library for an append-only shared log striped over an object
//! store.
//!
//! Log entries are identified by monotonically increasing 64-bit positions
//! and striped across a pool of entry objects. A *view* — stored in the
//! log's head object and versioned by a strictly monotonic epoch — describes
//! the striping layout and, optionally, appoints one client as the
//! exclusive sequencer. Every object enforces epoch fencing server-side, so
//! a client operating under a superseded view fails fast, refreshes, and
//! retries; that loop is what makes the log linearizable without a
//! consensus engine.
//!
//! # Architecture
//!
//! - [`Log`]: the façade (`append`/`read`/`fill`/`trim`/`check_tail`).
//! - A background view reader per handle refreshes the latest view with
//!   bounded backoff and wakes any operation waiting out an epoch fence.
//! - The striper resolves positions to objects, proposes new views for
//!   sequencer hand-off and map expansion, and seals objects at view
//!   changes to recover the tail.
//! - The storage side (object-store capability, server-side protocols, the
//!   in-memory and LMDB backends) lives in the `zlog-common` crate.
//!
//! # Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use zlog::{Log, Options};
//!
//! let log = Log::open(Options::default(), "mylog").await?;
//! let pos = log.append(Bytes::from("payload")).await?;
//! assert_eq!(log.read(pos).await?, Bytes::from("payload"));
//! log.close().await;
//! ```

mod backend;
mod config;
mod error;
mod log;
mod sequencer;
mod striper;
mod view;
mod view_reader;

/// Position of one entry in the log.
pub type Position = u64;

pub use config::{Options, StripeOptions};
pub use error::{Error, Result};
pub use log::{AppendHandle, Log};

// store selection is part of the public options surface
pub use zlog_common::{LmdbStoreConfig, StoreConfig};
