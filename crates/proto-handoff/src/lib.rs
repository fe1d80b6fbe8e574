pub mod codec;
pub mod envelope;
pub mod messages;

pub use codec::Error;
pub use envelope::{Envelope, EnvelopeCodec};
pub use messages::{
    ArchiveSegment, ArchiveSegmentReply, ArchiveSegmentResult, HintedHandoff, HintedHandoffReply,
    HintedHandoffResult, OrderedF64, PayloadRef, ProcessStatus, ProcessStatusKind, SegmentKey,
};
