//! Entry-object state machine.
//!
//! An entry object stores a slice of the log: a header xattr carrying the
//! object's epoch and max-position record, and one write-once cell per
//! position. Epoch fencing is enforced here, at the object: data ops
//! (`read`/`write`/`invalidate`) fail [`Status::StaleEpoch`] when the
//! caller's epoch is behind the object's, `seal` requires a strictly newer
//! epoch, and `max_position` requires an exact match.
//!
//! A successful write or invalidate, and a successful read of a written
//! cell, advance the object's epoch to the caller's when the caller's is
//! newer. Error returns never mutate the object.

use bytes::Bytes;

use super::{entry_key, ObjectOps, DATA_HEADER_XATTR};
use crate::status::{Status, StoreResult};
use crate::wire::{DecodeError, Reader, Writer};

const HEADER_VERSION: u8 = 1;
const CELL_VERSION: u8 = 1;
const REQUEST_VERSION: u8 = 1;

const CELL_WRITTEN: u8 = 1;
const CELL_INVALID: u8 = 2;

/// Stripe geometry recorded on an entry object by its first mutating op.
///
/// Subsequent writes and invalidates carrying different geometry are
/// rejected, so one object can never hold cells from two stripe layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeParams {
    pub stride: u32,
    pub width: u32,
}

/// Persistent header of an entry object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    /// Highest epoch this object has observed. Monotonically non-decreasing.
    pub epoch: u64,
    /// Highest position ever written or invalidated, `None` while empty.
    pub max_pos: Option<u64>,
    /// Geometry recorded by the first write/invalidate.
    pub stripe: Option<StripeParams>,
}

impl EntryHeader {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            max_pos: None,
            stripe: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new(HEADER_VERSION)
            .u64(self.epoch)
            .bool(self.max_pos.is_some())
            .u64(self.max_pos.unwrap_or(0))
            .bool(self.stripe.is_some());
        let stripe = self.stripe.unwrap_or(StripeParams {
            stride: 0,
            width: 0,
        });
        w = w.u32(stripe.stride).u32(stripe.width);
        w.build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(HEADER_VERSION)?;
        let epoch = r.u64()?;
        let has_max = r.bool()?;
        let max_raw = r.u64()?;
        let has_stripe = r.bool()?;
        let stride = r.u32()?;
        let width = r.u32()?;
        r.finish()?;
        Ok(Self {
            epoch,
            max_pos: has_max.then_some(max_raw),
            stripe: has_stripe.then_some(StripeParams { stride, width }),
        })
    }
}

/// A single log cell: payload bytes, or an invalidated marker.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryCell {
    Written(Bytes),
    Invalid,
}

impl EntryCell {
    fn encode(&self) -> Bytes {
        match self {
            EntryCell::Written(data) => Writer::new(CELL_VERSION).u8(CELL_WRITTEN).bytes(data),
            EntryCell::Invalid => Writer::new(CELL_VERSION).u8(CELL_INVALID),
        }
        .build()
    }

    fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(CELL_VERSION)?;
        let tag = r.u8()?;
        let cell = match tag {
            CELL_WRITTEN => EntryCell::Written(r.bytes()?),
            CELL_INVALID => EntryCell::Invalid,
            other => return Err(DecodeError::new(format!("invalid cell tag: {}", other))),
        };
        r.finish()?;
        Ok(cell)
    }
}

/// Max-position record returned by `entry_max_position`.
///
/// `pos` is undefined while `empty` is true; callers must check `empty`
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPos {
    pub empty: bool,
    pub pos: u64,
}

impl MaxPos {
    pub fn encode(&self) -> Bytes {
        Writer::new(REQUEST_VERSION)
            .bool(self.empty)
            .u64(self.pos)
            .build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let empty = r.bool()?;
        let pos = r.u64()?;
        r.finish()?;
        Ok(Self { empty, pos })
    }
}

/// Request carrying only an epoch (`entry_init`, `entry_seal`,
/// `entry_max_position`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochRequest {
    pub epoch: u64,
}

impl EpochRequest {
    pub fn encode(&self) -> Bytes {
        Writer::new(REQUEST_VERSION).u64(self.epoch).build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let epoch = r.u64()?;
        r.finish()?;
        Ok(Self { epoch })
    }
}

/// Request for `entry_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub epoch: u64,
    pub position: u64,
    pub stride: u32,
    pub width: u32,
}

impl ReadRequest {
    pub fn encode(&self) -> Bytes {
        Writer::new(REQUEST_VERSION)
            .u64(self.epoch)
            .u64(self.position)
            .u32(self.stride)
            .u32(self.width)
            .build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let req = Self {
            epoch: r.u64()?,
            position: r.u64()?,
            stride: r.u32()?,
            width: r.u32()?,
        };
        r.finish()?;
        Ok(req)
    }
}

/// Request for `entry_write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub epoch: u64,
    pub position: u64,
    pub stride: u32,
    pub width: u32,
    pub payload: Bytes,
}

impl WriteRequest {
    pub fn encode(&self) -> Bytes {
        Writer::new(REQUEST_VERSION)
            .u64(self.epoch)
            .u64(self.position)
            .u32(self.stride)
            .u32(self.width)
            .bytes(&self.payload)
            .build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let req = Self {
            epoch: r.u64()?,
            position: r.u64()?,
            stride: r.u32()?,
            width: r.u32()?,
            payload: r.bytes()?,
        };
        r.finish()?;
        Ok(req)
    }
}

/// Request for `entry_invalidate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateRequest {
    pub epoch: u64,
    pub position: u64,
    pub stride: u32,
    pub width: u32,
    pub force: bool,
}

impl InvalidateRequest {
    pub fn encode(&self) -> Bytes {
        Writer::new(REQUEST_VERSION)
            .u64(self.epoch)
            .u64(self.position)
            .u32(self.stride)
            .u32(self.width)
            .bool(self.force)
            .build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let req = Self {
            epoch: r.u64()?,
            position: r.u64()?,
            stride: r.u32()?,
            width: r.u32()?,
            force: r.bool()?,
        };
        r.finish()?;
        Ok(req)
    }
}

/// Decodes the header of an existing entry object.
///
/// Missing object is [`Status::NotFound`]; an object without a header, or
/// with an undecodable one, is [`Status::Corrupt`].
fn read_header(obj: &dyn ObjectOps) -> StoreResult<EntryHeader> {
    if !obj.exists() {
        return Err(Status::NotFound);
    }
    let raw = obj.get_xattr(DATA_HEADER_XATTR)?.ok_or(Status::Corrupt)?;
    EntryHeader::decode(&raw).map_err(|err| {
        tracing::warn!(error = %err, "undecodable entry header");
        Status::Corrupt
    })
}

fn write_header(obj: &mut dyn ObjectOps, header: &EntryHeader) -> StoreResult<()> {
    obj.set_xattr(DATA_HEADER_XATTR, header.encode())
}

/// Records the stripe geometry on first use and rejects mismatches after.
fn check_stripe(header: &mut EntryHeader, stride: u32, width: u32) -> StoreResult<()> {
    match header.stripe {
        None => {
            header.stripe = Some(StripeParams { stride, width });
            Ok(())
        }
        Some(recorded) if recorded.stride == stride && recorded.width == width => Ok(()),
        Some(_) => Err(Status::InvalidArgument),
    }
}

fn read_cell(obj: &dyn ObjectOps, position: u64) -> StoreResult<Option<EntryCell>> {
    match obj.omap_get(&entry_key(position))? {
        None => Ok(None),
        Some(raw) => EntryCell::decode(&raw).map(Some).map_err(|err| {
            tracing::warn!(position, error = %err, "undecodable entry cell");
            Status::Corrupt
        }),
    }
}

/// `entry_init`: creates an entry object at the given epoch.
pub(super) fn init(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<()> {
    let req = EpochRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    if req.epoch == 0 {
        return Err(Status::InvalidArgument);
    }
    obj.create(true)?;
    write_header(obj, &EntryHeader::new(req.epoch))
}

/// `entry_read`: returns the payload at a position.
pub(super) fn read(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<Bytes> {
    let req = ReadRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    if req.epoch == 0 {
        return Err(Status::InvalidArgument);
    }
    let mut header = read_header(obj)?;
    if req.epoch < header.epoch {
        return Err(Status::StaleEpoch);
    }
    match read_cell(obj, req.position)? {
        None => Err(Status::OutOfRange),
        Some(EntryCell::Invalid) => Err(Status::Invalidated),
        Some(EntryCell::Written(payload)) => {
            // the caller has proven knowledge of a newer epoch
            if req.epoch > header.epoch {
                header.epoch = req.epoch;
                write_header(obj, &header)?;
            }
            Ok(payload)
        }
    }
}

/// `entry_write`: writes a cell, once.
pub(super) fn write(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<()> {
    let req = WriteRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    if req.epoch == 0 {
        return Err(Status::InvalidArgument);
    }
    let mut header = read_header(obj)?;
    if req.epoch < header.epoch {
        return Err(Status::StaleEpoch);
    }
    check_stripe(&mut header, req.stride, req.width)?;
    if read_cell(obj, req.position)?.is_some() {
        return Err(Status::ReadOnly);
    }
    obj.omap_set(
        &entry_key(req.position),
        EntryCell::Written(req.payload).encode(),
    )?;
    header.max_pos = Some(header.max_pos.map_or(req.position, |m| m.max(req.position)));
    header.epoch = header.epoch.max(req.epoch);
    write_header(obj, &header)
}

/// `entry_invalidate`: marks a cell invalid (fill), or force-replaces a
/// written cell (trim).
pub(super) fn invalidate(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<()> {
    let req = InvalidateRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    if req.epoch == 0 {
        return Err(Status::InvalidArgument);
    }
    let mut header = read_header(obj)?;
    if req.epoch < header.epoch {
        return Err(Status::StaleEpoch);
    }
    match read_cell(obj, req.position)? {
        // absorbing: invalid stays invalid, with or without force
        Some(EntryCell::Invalid) => return Ok(()),
        Some(EntryCell::Written(_)) if !req.force => return Err(Status::ReadOnly),
        Some(EntryCell::Written(_)) | None => {}
    }
    check_stripe(&mut header, req.stride, req.width)?;
    obj.omap_set(&entry_key(req.position), EntryCell::Invalid.encode())?;
    header.max_pos = Some(header.max_pos.map_or(req.position, |m| m.max(req.position)));
    header.epoch = header.epoch.max(req.epoch);
    write_header(obj, &header)
}

/// `entry_seal`: advances the object's epoch, fencing every older epoch.
pub(super) fn seal(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<()> {
    let req = EpochRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    if req.epoch == 0 {
        return Err(Status::InvalidArgument);
    }
    let mut header = read_header(obj)?;
    if req.epoch <= header.epoch {
        return Err(Status::StaleEpoch);
    }
    header.epoch = req.epoch;
    write_header(obj, &header)
}

/// `entry_max_position`: reports the max-position record. Exact-epoch only.
pub(super) fn max_position(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<Bytes> {
    let req = EpochRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    if req.epoch == 0 {
        return Err(Status::InvalidArgument);
    }
    let header = read_header(obj)?;
    if req.epoch != header.epoch {
        return Err(Status::StaleEpoch);
    }
    let max = MaxPos {
        empty: header.max_pos.is_none(),
        pos: header.max_pos.unwrap_or(0),
    };
    Ok(max.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_entry_header() {
        // given
        let header = EntryHeader {
            epoch: 42,
            max_pos: Some(160),
            stripe: Some(StripeParams {
                stride: 10,
                width: 1024,
            }),
        };

        // when
        let decoded = EntryHeader::decode(&header.encode()).unwrap();

        // then
        assert_eq!(decoded, header);
    }

    #[test]
    fn should_round_trip_empty_header() {
        let header = EntryHeader::new(1);
        let decoded = EntryHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.epoch, 1);
        assert!(decoded.max_pos.is_none());
        assert!(decoded.stripe.is_none());
    }

    #[test]
    fn should_reject_garbage_header() {
        assert!(EntryHeader::decode(b"foo").is_err());
    }

    #[test]
    fn should_round_trip_cells() {
        let written = EntryCell::Written(Bytes::from_static(b"payload"));
        assert_eq!(EntryCell::decode(&written.encode()).unwrap(), written);

        let invalid = EntryCell::Invalid;
        assert_eq!(EntryCell::decode(&invalid.encode()).unwrap(), invalid);
    }

    #[test]
    fn should_reject_garbage_cell() {
        assert!(EntryCell::decode(b"foo").is_err());
    }

    #[test]
    fn should_round_trip_requests() {
        let write = WriteRequest {
            epoch: 3,
            position: 160,
            stride: 10,
            width: 1024,
            payload: Bytes::from_static(b"foo"),
        };
        assert_eq!(WriteRequest::decode(&write.encode()).unwrap(), write);

        let inval = InvalidateRequest {
            epoch: 3,
            position: 160,
            stride: 10,
            width: 1024,
            force: true,
        };
        assert_eq!(InvalidateRequest::decode(&inval.encode()).unwrap(), inval);

        let max = MaxPos {
            empty: false,
            pos: 7,
        };
        assert_eq!(MaxPos::decode(&max.encode()).unwrap(), max);
    }
}
