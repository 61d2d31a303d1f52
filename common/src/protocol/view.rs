//! Head-object state machine: the strictly-ordered view log.
//!
//! A head object stores one opaque view blob per epoch, dense from 1. The
//! header tracks the log's object-name prefix and the next epoch the head
//! will accept; any `view_create` with a different epoch is rejected, which
//! is what serializes concurrent view proposals.

use bytes::Bytes;

use super::{view_key, ObjectOps, HEAD_HEADER_XATTR, VIEW_KEY_PREFIX};
use crate::status::{Status, StoreResult};
use crate::wire::{DecodeError, Reader, Writer};

const HEADER_VERSION: u8 = 1;
const REQUEST_VERSION: u8 = 1;

/// Persistent header of a head object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadHeader {
    /// Object-name prefix for the log this head describes.
    pub prefix: String,
    /// The only epoch the next `view_create` will accept. Starts at 1.
    pub next_epoch: u64,
}

impl HeadHeader {
    pub fn encode(&self) -> Bytes {
        Writer::new(HEADER_VERSION)
            .string(&self.prefix)
            .u64(self.next_epoch)
            .build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(HEADER_VERSION)?;
        let header = Self {
            prefix: r.string()?,
            next_epoch: r.u64()?,
        };
        r.finish()?;
        Ok(header)
    }
}

/// Request for `view_init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewInitRequest {
    pub prefix: String,
}

impl ViewInitRequest {
    pub fn encode(&self) -> Bytes {
        Writer::new(REQUEST_VERSION).string(&self.prefix).build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let req = Self {
            prefix: r.string()?,
        };
        r.finish()?;
        Ok(req)
    }
}

/// Request for `view_create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewCreateRequest {
    pub epoch: u64,
    pub blob: Bytes,
}

impl ViewCreateRequest {
    pub fn encode(&self) -> Bytes {
        Writer::new(REQUEST_VERSION)
            .u64(self.epoch)
            .bytes(&self.blob)
            .build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let req = Self {
            epoch: r.u64()?,
            blob: r.bytes()?,
        };
        r.finish()?;
        Ok(req)
    }
}

/// Request for `view_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewReadRequest {
    pub start_epoch: u64,
    pub max_views: u32,
}

impl ViewReadRequest {
    pub fn encode(&self) -> Bytes {
        Writer::new(REQUEST_VERSION)
            .u64(self.start_epoch)
            .u32(self.max_views)
            .build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let req = Self {
            start_epoch: r.u64()?,
            max_views: r.u32()?,
        };
        r.finish()?;
        Ok(req)
    }
}

/// Response of `view_read`: (epoch, blob) pairs in ascending epoch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Views {
    pub views: Vec<(u64, Bytes)>,
}

impl Views {
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new(REQUEST_VERSION).u32(self.views.len() as u32);
        for (epoch, blob) in &self.views {
            w = w.u64(*epoch).bytes(blob);
        }
        w.build()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        r.version(REQUEST_VERSION)?;
        let count = r.u32()?;
        let mut views = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let epoch = r.u64()?;
            let blob = r.bytes()?;
            views.push((epoch, blob));
        }
        r.finish()?;
        Ok(Self { views })
    }

    /// The highest-epoch view in the response, if any.
    pub fn latest(&self) -> Option<(u64, &Bytes)> {
        self.views.last().map(|(epoch, blob)| (*epoch, blob))
    }
}

fn read_header(obj: &dyn ObjectOps) -> StoreResult<HeadHeader> {
    if !obj.exists() {
        return Err(Status::NotFound);
    }
    let raw = obj.get_xattr(HEAD_HEADER_XATTR)?.ok_or(Status::Corrupt)?;
    HeadHeader::decode(&raw).map_err(|err| {
        tracing::warn!(error = %err, "undecodable head header");
        Status::Corrupt
    })
}

/// `view_init`: creates a head object with an empty view log.
pub(super) fn init(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<()> {
    let req = ViewInitRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    if req.prefix.is_empty() {
        return Err(Status::InvalidArgument);
    }
    obj.create(true)?;
    obj.set_xattr(
        HEAD_HEADER_XATTR,
        HeadHeader {
            prefix: req.prefix,
            next_epoch: 1,
        }
        .encode(),
    )
}

/// `view_create`: appends a view blob at exactly the next epoch.
pub(super) fn create(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<()> {
    let req = ViewCreateRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    let mut header = read_header(obj)?;
    if req.epoch != header.next_epoch {
        return Err(Status::InvalidArgument);
    }
    obj.omap_set(&view_key(req.epoch), req.blob)?;
    header.next_epoch += 1;
    obj.set_xattr(HEAD_HEADER_XATTR, header.encode())
}

/// `view_read`: returns up to `max_views` views with epoch `>= start_epoch`,
/// ascending. Reading past the end yields an empty set, not an error.
pub(super) fn read(obj: &mut dyn ObjectOps, input: &[u8]) -> StoreResult<Bytes> {
    let req = ViewReadRequest::decode(input).map_err(|_| Status::InvalidArgument)?;
    let _ = read_header(obj)?;
    if req.start_epoch == 0 {
        return Err(Status::InvalidArgument);
    }
    if req.max_views == 0 {
        return Ok(Views::default().encode());
    }
    let pairs = obj.omap_scan(&view_key(req.start_epoch), VIEW_KEY_PREFIX, req.max_views)?;
    let mut views = Vec::with_capacity(pairs.len());
    for (key, blob) in pairs {
        let epoch = key
            .strip_prefix(VIEW_KEY_PREFIX)
            .and_then(|digits| digits.parse::<u64>().ok())
            .ok_or(Status::Corrupt)?;
        views.push((epoch, blob));
    }
    Ok(Views { views }.encode())
}
