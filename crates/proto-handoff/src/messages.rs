//! Wire bodies for the five bus messages named in spec.md §6. Each type owns
//! hand-written `encode`/`decode` over the primitives in [`crate::codec`];
//! there is no IDL, mirroring the fact that spec.md specifies field lists
//! and framing rules directly rather than through protobuf or similar.

use crate::codec::{self, Result};
use bytes::{Bytes, BytesMut};

/// A destination-opaque reference to a segment's locally-stored bytes:
/// either inlined (small segments) or a handle into local segment storage.
/// Never interpreted by this crate -- see spec.md §2.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadRef {
    Inline(Bytes),
    Handle(String),
}

impl PayloadRef {
    fn encode(&self, out: &mut BytesMut) {
        match self {
            PayloadRef::Inline(bytes) => {
                codec::put_u8(out, 0);
                codec::put_blob(out, bytes);
            }
            PayloadRef::Handle(handle) => {
                codec::put_u8(out, 1);
                codec::put_str(out, handle);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        match codec::get_u8(buf)? {
            0 => Ok(PayloadRef::Inline(codec::get_blob(buf)?)),
            1 => Ok(PayloadRef::Handle(codec::get_str(buf)?)),
            other => Err(codec::Error::UnknownTag(other)),
        }
    }
}

/// Natural key fields shared by [`HintedHandoff`] and [`ArchiveSegment`];
/// see spec.md's "Natural key" glossary entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    pub avatar_id: u32,
    pub key: String,
    pub version_number: u64,
    pub segment_number: u8,
}

impl SegmentKey {
    fn encode(&self, out: &mut BytesMut) {
        codec::put_u32(out, self.avatar_id);
        codec::put_str(out, &self.key);
        codec::put_u64(out, self.version_number);
        codec::put_u8(out, self.segment_number);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(SegmentKey {
            avatar_id: codec::get_u32(buf)?,
            key: codec::get_str(buf)?,
            version_number: codec::get_u64(buf)?,
            segment_number: codec::get_u8(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintedHandoff {
    pub request_id: u128,
    pub reply_topic: String,
    pub dest_peer: String,
    pub timestamp: OrderedF64,
    pub segment: SegmentKey,
    pub payload_ref: PayloadRef,
}

impl HintedHandoff {
    pub const ROUTING_KEY: &'static str = "handoff_server.request";

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        codec::put_u128(&mut out, self.request_id);
        codec::put_str(&mut out, &self.reply_topic);
        codec::put_str(&mut out, &self.dest_peer);
        codec::put_f64(&mut out, self.timestamp.0);
        self.segment.encode(&mut out);
        self.payload_ref.encode(&mut out);
        out.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(HintedHandoff {
            request_id: codec::get_u128(&mut buf)?,
            reply_topic: codec::get_str(&mut buf)?,
            dest_peer: codec::get_str(&mut buf)?,
            timestamp: OrderedF64(codec::get_f64(&mut buf)?),
            segment: SegmentKey::decode(&mut buf)?,
            payload_ref: PayloadRef::decode(&mut buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintedHandoffResult {
    Successful,
    ErrorException,
    ErrorStorageFull,
}

impl HintedHandoffResult {
    fn tag(self) -> u8 {
        match self {
            HintedHandoffResult::Successful => 0,
            HintedHandoffResult::ErrorException => 1,
            HintedHandoffResult::ErrorStorageFull => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => HintedHandoffResult::Successful,
            1 => HintedHandoffResult::ErrorException,
            2 => HintedHandoffResult::ErrorStorageFull,
            other => return Err(codec::Error::UnknownTag(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintedHandoffReply {
    pub request_id: u128,
    pub result: HintedHandoffResult,
    pub error_message: Option<String>,
}

impl HintedHandoffReply {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        codec::put_u128(&mut out, self.request_id);
        codec::put_u8(&mut out, self.result.tag());
        codec::put_opt_str(&mut out, self.error_message.as_deref());
        out.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(HintedHandoffReply {
            request_id: codec::get_u128(&mut buf)?,
            result: HintedHandoffResult::from_tag(codec::get_u8(&mut buf)?)?,
            error_message: codec::get_opt_str(&mut buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSegment {
    pub request_id: u128,
    pub dest_peer: String,
    pub timestamp: OrderedF64,
    pub segment: SegmentKey,
    pub payload_ref: PayloadRef,
    pub reply_topic: String,
}

impl ArchiveSegment {
    pub fn routing_key(peer: &str) -> String {
        format!("data_writer.{peer}.request")
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        codec::put_u128(&mut out, self.request_id);
        codec::put_str(&mut out, &self.dest_peer);
        codec::put_f64(&mut out, self.timestamp.0);
        self.segment.encode(&mut out);
        self.payload_ref.encode(&mut out);
        codec::put_str(&mut out, &self.reply_topic);
        out.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(ArchiveSegment {
            request_id: codec::get_u128(&mut buf)?,
            dest_peer: codec::get_str(&mut buf)?,
            timestamp: OrderedF64(codec::get_f64(&mut buf)?),
            segment: SegmentKey::decode(&mut buf)?,
            payload_ref: PayloadRef::decode(&mut buf)?,
            reply_topic: codec::get_str(&mut buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveSegmentResult {
    Successful,
    ErrorNotReady,
    ErrorPermanent,
    ErrorTransient,
}

impl ArchiveSegmentResult {
    fn tag(self) -> u8 {
        match self {
            ArchiveSegmentResult::Successful => 0,
            ArchiveSegmentResult::ErrorNotReady => 1,
            ArchiveSegmentResult::ErrorPermanent => 2,
            ArchiveSegmentResult::ErrorTransient => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => ArchiveSegmentResult::Successful,
            1 => ArchiveSegmentResult::ErrorNotReady,
            2 => ArchiveSegmentResult::ErrorPermanent,
            3 => ArchiveSegmentResult::ErrorTransient,
            other => return Err(codec::Error::UnknownTag(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSegmentReply {
    pub request_id: u128,
    pub result: ArchiveSegmentResult,
    pub error_message: Option<String>,
}

impl ArchiveSegmentReply {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        codec::put_u128(&mut out, self.request_id);
        codec::put_u8(&mut out, self.result.tag());
        codec::put_opt_str(&mut out, self.error_message.as_deref());
        out.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(ArchiveSegmentReply {
            request_id: codec::get_u128(&mut buf)?,
            result: ArchiveSegmentResult::from_tag(codec::get_u8(&mut buf)?)?,
            error_message: codec::get_opt_str(&mut buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatusKind {
    Startup,
    Shutdown,
    Heartbeat,
}

impl ProcessStatusKind {
    fn tag(self) -> u8 {
        match self {
            ProcessStatusKind::Startup => 0,
            ProcessStatusKind::Shutdown => 1,
            ProcessStatusKind::Heartbeat => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => ProcessStatusKind::Startup,
            1 => ProcessStatusKind::Shutdown,
            2 => ProcessStatusKind::Heartbeat,
            other => return Err(codec::Error::UnknownTag(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub source_topic: String,
    pub routing_header: String,
    pub status: ProcessStatusKind,
    pub timestamp: OrderedF64,
}

impl ProcessStatus {
    pub const ROUTING_KEY: &'static str = "process_status.broadcast";

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        codec::put_str(&mut out, &self.source_topic);
        codec::put_str(&mut out, &self.routing_header);
        codec::put_u8(&mut out, self.status.tag());
        codec::put_f64(&mut out, self.timestamp.0);
        out.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(ProcessStatus {
            source_topic: codec::get_str(&mut buf)?,
            routing_header: codec::get_str(&mut buf)?,
            status: ProcessStatusKind::from_tag(codec::get_u8(&mut buf)?)?,
            timestamp: OrderedF64(codec::get_f64(&mut buf)?),
        })
    }
}

/// Wraps an `f64` timestamp with a total order so it can be used as a sort
/// and tiebreak key (spec.md §3, §8's "oldest-first" invariant). Wall-clock
/// timestamps from a healthy clock are never NaN; we treat NaN as greater
/// than everything so a malformed timestamp sorts to the back of the queue
/// rather than panicking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedF64(pub f64);

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}
