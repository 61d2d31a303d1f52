//! Configuration for opening a [`Log`](crate::Log).

use std::time::Duration;

use zlog_common::StoreConfig;

/// Options controlling log open/create behavior and the client's refresh
/// policy.
///
/// # Example
///
/// ```ignore
/// use zlog::{Log, Options};
///
/// let mut options = Options::default();
/// options.create_if_missing = true;
/// let log = Log::open(options, "mylog").await?;
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Object-store backend configuration.
    ///
    /// Ignored by [`Log::open_with_store`](crate::Log::open_with_store),
    /// which receives a store instance directly.
    pub store: StoreConfig,

    /// Create the log if it does not exist.
    pub create_if_missing: bool,

    /// Fail with [`AlreadyExists`](crate::Error::AlreadyExists) if the log
    /// exists.
    pub error_if_exists: bool,

    /// On log creation, initialize the objects of the first stripe in the
    /// background so the first append does not pay the initialization cost.
    pub init_stripe_on_create: bool,

    /// Stripe geometry for newly created stripes.
    pub stripe: StripeOptions,

    /// Floor for the view-refresh backoff. Applied whenever a failed
    /// operation demands an immediate refresh.
    pub min_refresh_timeout: Duration,

    /// Ceiling for the view-refresh backoff; also the idle polling interval
    /// while nobody is waiting for a newer view.
    pub max_refresh_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            create_if_missing: true,
            error_if_exists: false,
            init_stripe_on_create: true,
            stripe: StripeOptions::default(),
            min_refresh_timeout: Duration::from_millis(250),
            max_refresh_timeout: Duration::from_secs(2),
        }
    }
}

/// Geometry of a stripe: `width` objects, each holding `slots` positions,
/// for a capacity of `width * slots` contiguous positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeOptions {
    /// Number of objects backing the stripe.
    pub width: u32,

    /// Number of positions mapped to each object.
    pub slots: u32,
}

impl Default for StripeOptions {
    fn default() -> Self {
        Self {
            width: 10,
            slots: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_to_memory_store_and_creation() {
        // given/when
        let options = Options::default();

        // then
        assert_eq!(options.store, StoreConfig::Memory);
        assert!(options.create_if_missing);
        assert!(!options.error_if_exists);
        assert!(options.min_refresh_timeout < options.max_refresh_timeout);
    }
}
