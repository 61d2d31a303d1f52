//! In-memory representation of a view and the striped object map.
//!
//! A view is immutable once observed: refreshes swap in a whole new
//! [`VersionedView`] behind an `Arc`, and readers keep their snapshot alive
//! for as long as they hold the reference. Views travel through the head
//! object as opaque blobs; the codec here is private to the client.

use std::sync::Arc;

use bytes::Bytes;

use zlog_common::wire::{DecodeError, Reader, Writer};

use crate::config::StripeOptions;
use crate::sequencer::Sequencer;
use crate::Position;

const VIEW_VERSION: u8 = 1;

/// A contiguous range of positions striped over `width` objects.
///
/// Object `base_id + k` holds the positions of the range congruent to `k`
/// modulo `width`; each object holds `slots` of them. `stride` passed to the
/// entry ops is the slot count, so an object can reject writes from a client
/// whose view carries a different geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stripe {
    /// Object number of the stripe's first object.
    pub base_id: u64,
    /// Number of objects in the stripe.
    pub width: u32,
    /// Positions per object.
    pub slots: u32,
    /// First position covered by the stripe.
    pub min_position: Position,
}

impl Stripe {
    pub fn capacity(&self) -> u64 {
        self.width as u64 * self.slots as u64
    }

    pub fn max_position(&self) -> Position {
        self.min_position + self.capacity() - 1
    }

    pub fn contains(&self, position: Position) -> bool {
        position >= self.min_position && position <= self.max_position()
    }

    /// Object id backing the given position.
    pub fn object_id(&self, prefix: &str, position: Position) -> String {
        let index = (position - self.min_position) % self.width as u64;
        format!("{}.data.{}", prefix, self.base_id + index)
    }

    /// All object ids of the stripe, in object-number order.
    pub fn object_ids(&self, prefix: &str) -> Vec<String> {
        (0..self.width as u64)
            .map(|index| format!("{}.data.{}", prefix, self.base_id + index))
            .collect()
    }
}

/// Ordered set of stripes resolving positions to objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ObjectMap {
    /// Object number the next stripe will start from.
    next_base_id: u64,
    /// Stripes in ascending position order, contiguous from position 0.
    stripes: Vec<Stripe>,
}

impl ObjectMap {
    /// Map with a single stripe covering positions from 0.
    pub fn initial(stripe: StripeOptions) -> Self {
        let mut map = Self::default();
        map.push_stripe(stripe);
        map
    }

    pub fn stripes(&self) -> &[Stripe] {
        &self.stripes
    }

    /// Resolves the stripe covering a position.
    pub fn map(&self, position: Position) -> Option<&Stripe> {
        self.stripes.iter().find(|stripe| stripe.contains(position))
    }

    fn push_stripe(&mut self, options: StripeOptions) -> Stripe {
        let min_position = self
            .stripes
            .last()
            .map(|last| last.max_position() + 1)
            .unwrap_or(0);
        let stripe = Stripe {
            base_id: self.next_base_id,
            width: options.width,
            slots: options.slots,
            min_position,
        };
        self.next_base_id += options.width as u64;
        self.stripes.push(stripe);
        stripe
    }

    /// Appends stripes until the position is covered. Returns the stripes
    /// that were added.
    pub fn expand(&mut self, position: Position, options: StripeOptions) -> Vec<Stripe> {
        let mut added = Vec::new();
        while self.map(position).is_none() {
            added.push(self.push_stripe(options));
        }
        added
    }

    fn encode_into(&self, mut w: Writer) -> Writer {
        w = w.u64(self.next_base_id).u32(self.stripes.len() as u32);
        for stripe in &self.stripes {
            w = w
                .u64(stripe.base_id)
                .u32(stripe.width)
                .u32(stripe.slots)
                .u64(stripe.min_position);
        }
        w
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let next_base_id = r.u64()?;
        let count = r.u32()?;
        let mut stripes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            stripes.push(Stripe {
                base_id: r.u64()?,
                width: r.u32()?,
                slots: r.u32()?,
                min_position: r.u64()?,
            });
        }
        Ok(Self {
            next_base_id,
            stripes,
        })
    }
}

/// Sequencer appointment carried by a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SequencerConfig {
    /// Epoch of the view whose proposal appointed this sequencer. Unique per
    /// successful proposal, so token + epoch identifies one appointment.
    pub epoch: u64,
    /// First position the sequencer will allocate (the recovered tail).
    pub position: Position,
    /// Token of the appointed client.
    pub token: String,
}

/// Decoded view payload: the striping layout and the optional sequencer
/// appointment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct View {
    pub object_map: ObjectMap,
    pub seq_config: Option<SequencerConfig>,
}

impl View {
    /// The view installed at epoch 1 when a log is created.
    pub fn initial(stripe: StripeOptions) -> Self {
        Self {
            object_map: ObjectMap::initial(stripe),
            seq_config: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = self.object_map.encode_into(Writer::new(VIEW_VERSION));
        w = w.bool(self.seq_config.is_some());
        if let Some(seq) = &self.seq_config {
            w = w.u64(seq.epoch).u64(seq.position).string(&seq.token);
        }
        w.build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(VIEW_VERSION)?;
        let object_map = ObjectMap::decode_from(&mut r)?;
        let seq_config = if r.bool()? {
            Some(SequencerConfig {
                epoch: r.u64()?,
                position: r.u64()?,
                token: r.string()?,
            })
        } else {
            None
        };
        r.finish()?;
        Ok(Self {
            object_map,
            seq_config,
        })
    }
}

/// A view bound to the epoch it was read at, plus the in-memory sequencer
/// when this client is the appointed one.
#[derive(Debug)]
pub(crate) struct VersionedView {
    pub epoch: u64,
    pub view: View,
    pub seq: Option<Arc<Sequencer>>,
}

impl VersionedView {
    /// Resolves a position to its stripe under this view.
    pub fn map(&self, position: Position) -> Option<&Stripe> {
        self.view.object_map.map(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(width: u32, slots: u32) -> StripeOptions {
        StripeOptions { width, slots }
    }

    #[test]
    fn should_stripe_positions_round_robin() {
        // given
        let map = ObjectMap::initial(geometry(3, 2));
        let stripe = map.map(0).unwrap();

        // then: positions rotate over the three objects
        assert_eq!(stripe.object_id("p", 0), "p.data.0");
        assert_eq!(stripe.object_id("p", 1), "p.data.1");
        assert_eq!(stripe.object_id("p", 2), "p.data.2");
        assert_eq!(stripe.object_id("p", 3), "p.data.0");
        assert_eq!(stripe.max_position(), 5);
        assert!(map.map(6).is_none());
    }

    #[test]
    fn should_expand_with_fresh_object_ids() {
        // given
        let mut map = ObjectMap::initial(geometry(2, 2));

        // when: position 9 needs two more stripes
        let added = map.expand(9, geometry(2, 3));

        // then
        assert_eq!(added.len(), 1);
        let stripe = map.map(9).unwrap();
        assert_eq!(stripe.base_id, 2);
        assert_eq!(stripe.min_position, 4);
        assert_eq!(stripe.object_id("p", 9), "p.data.3");
        assert!(map.map(10).is_none());
    }

    #[test]
    fn should_round_trip_view_blob() {
        // given
        let mut view = View::initial(geometry(10, 1024));
        view.object_map.expand(20_000, geometry(5, 100));
        view.seq_config = Some(SequencerConfig {
            epoch: 7,
            position: 42,
            token: "zlog.token.mylog.head.host.1".to_string(),
        });

        // when
        let decoded = View::decode(&view.encode()).unwrap();

        // then
        assert_eq!(decoded, view);
    }

    #[test]
    fn should_round_trip_view_without_sequencer() {
        let view = View::initial(geometry(1, 1));
        assert_eq!(View::decode(&view.encode()).unwrap(), view);
    }

    #[test]
    fn should_reject_garbage_view_blob() {
        assert!(View::decode(b"foo1").is_err());
    }
}
