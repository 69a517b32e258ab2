//! Wire protocol messages
//!
//! Two disjoint message families share one frame layout:
//! `[magic u32][version u8][opcode u8][payload_len u32]` + payload, all
//! little-endian. Payloads are bincode-encoded, except the chunk report whose
//! bulk data is appended raw after the encoded offset.
//!
//! A truncated frame, bad magic/version, or unknown opcode is a protocol
//! error; the receiving side treats it as a remote death for that session.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::range::{Range, RangeSet};
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// Frame header length: magic(4) + version(1) + opcode(1) + payload_len(4)
pub const HEADER_LEN: usize = 10;

/// Master -> slave order opcodes
mod order_op {
    pub const REPORT_RESOURCE_LENGTH: u8 = 1;
    pub const REPORT_AVAILABLE_SEGMENTS: u8 = 2;
    pub const REPORT_ASSIGNED_SEGMENTS: u8 = 3;
    pub const ERASE_SEGMENTS: u8 = 4;
    pub const ADD_NEW_SEGMENT: u8 = 5;
    pub const HARD_THROTTLE: u8 = 6;
    pub const SOFT_THROTTLE: u8 = 7;
    pub const PING: u8 = 8;
    pub const DIED: u8 = 9;
}

/// Slave -> master report opcodes
mod report_op {
    pub const RESOURCE_CHUNK: u8 = 1;
    pub const RESOURCE_SIZE_REPORT: u8 = 2;
    pub const SEGMENT_AVAILABILITY_REPORT: u8 = 3;
    pub const SEGMENT_ASSIGNATION_REPORT: u8 = 4;
    pub const UNAVAILABLE_SEGMENT_WARNING: u8 = 5;
    pub const DIED: u8 = 6;
}

/// Range as carried on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WireRange {
    min: i64,
    max: i64,
}

impl From<Range> for WireRange {
    fn from(range: Range) -> Self {
        Self {
            min: range.min as i64,
            max: range.max as i64,
        }
    }
}

impl TryFrom<WireRange> for Range {
    type Error = Error;

    fn try_from(wire: WireRange) -> Result<Range> {
        if wire.min < 0 || wire.max < wire.min {
            return Err(Error::InvalidRange {
                min: wire.min,
                max: wire.max,
            });
        }
        Ok(Range::new(wire.min as u64, wire.max as u64))
    }
}

fn wire_ranges(set: &RangeSet) -> Vec<WireRange> {
    set.iter().map(WireRange::from).collect()
}

fn range_set(wire: Vec<WireRange>) -> Result<RangeSet> {
    let mut set = RangeSet::new();
    for range in wire {
        set.add(Range::try_from(range)?);
    }
    Ok(set)
}

/// Order issued by the master over a provider link
#[derive(Debug, Clone, PartialEq)]
pub enum MasterOrder {
    /// Ask the slave for the total resource length
    ReportResourceLength,

    /// Ask the slave for its reader's owned segments
    ReportAvailableSegments,

    /// Ask the slave for its current segment queue
    ReportAssignedSegments,

    /// Clear the slave's segment queue
    EraseSegments,

    /// Enqueue a range for streaming
    AddNewSegment(Range),

    /// Multiply the slave's block size by `variation` and restart its climb
    HardThrottle(f32),

    /// Gentle block-size reduction, climb counter untouched
    SoftThrottle,

    /// Liveness only, no reply
    Ping,

    /// The master is gone; the slave tears down without echoing a death
    Died,
}

impl MasterOrder {
    fn opcode(&self) -> u8 {
        match self {
            MasterOrder::ReportResourceLength => order_op::REPORT_RESOURCE_LENGTH,
            MasterOrder::ReportAvailableSegments => order_op::REPORT_AVAILABLE_SEGMENTS,
            MasterOrder::ReportAssignedSegments => order_op::REPORT_ASSIGNED_SEGMENTS,
            MasterOrder::EraseSegments => order_op::ERASE_SEGMENTS,
            MasterOrder::AddNewSegment(_) => order_op::ADD_NEW_SEGMENT,
            MasterOrder::HardThrottle(_) => order_op::HARD_THROTTLE,
            MasterOrder::SoftThrottle => order_op::SOFT_THROTTLE,
            MasterOrder::Ping => order_op::PING,
            MasterOrder::Died => order_op::DIED,
        }
    }

    /// Serialize to a wire frame
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = match self {
            MasterOrder::AddNewSegment(range) => {
                bincode::serialize(&WireRange::from(*range)).unwrap_or_default()
            }
            MasterOrder::HardThrottle(variation) => {
                bincode::serialize(variation).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        encode_frame(self.opcode(), &payload)
    }

    /// Deserialize from a wire frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (opcode, payload) = decode_frame(bytes)?;
        match opcode {
            order_op::REPORT_RESOURCE_LENGTH => Ok(MasterOrder::ReportResourceLength),
            order_op::REPORT_AVAILABLE_SEGMENTS => Ok(MasterOrder::ReportAvailableSegments),
            order_op::REPORT_ASSIGNED_SEGMENTS => Ok(MasterOrder::ReportAssignedSegments),
            order_op::ERASE_SEGMENTS => Ok(MasterOrder::EraseSegments),
            order_op::ADD_NEW_SEGMENT => {
                let wire: WireRange = bincode::deserialize(payload)?;
                Ok(MasterOrder::AddNewSegment(Range::try_from(wire)?))
            }
            order_op::HARD_THROTTLE => Ok(MasterOrder::HardThrottle(bincode::deserialize(payload)?)),
            order_op::SOFT_THROTTLE => Ok(MasterOrder::SoftThrottle),
            order_op::PING => Ok(MasterOrder::Ping),
            order_op::DIED => Ok(MasterOrder::Died),
            opcode => Err(Error::UnknownOpcode {
                family: "order",
                opcode,
            }),
        }
    }
}

/// Report sent by the slave back over the session subchannel
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveReport {
    /// A block of resource data at an absolute offset
    ResourceChunk { first_byte: u64, data: Bytes },

    /// Total resource length
    ResourceSize(u64),

    /// Segments the slave's reader owns
    SegmentAvailability(RangeSet),

    /// Segments currently queued for streaming
    SegmentAssignation(RangeSet),

    /// The last `ADD_NEW_SEGMENT` asked for bytes the reader does not own;
    /// the range was dropped, not queued
    UnavailableSegment,

    /// The slave session is gone
    Died,
}

impl SlaveReport {
    fn opcode(&self) -> u8 {
        match self {
            SlaveReport::ResourceChunk { .. } => report_op::RESOURCE_CHUNK,
            SlaveReport::ResourceSize(_) => report_op::RESOURCE_SIZE_REPORT,
            SlaveReport::SegmentAvailability(_) => report_op::SEGMENT_AVAILABILITY_REPORT,
            SlaveReport::SegmentAssignation(_) => report_op::SEGMENT_ASSIGNATION_REPORT,
            SlaveReport::UnavailableSegment => report_op::UNAVAILABLE_SEGMENT_WARNING,
            SlaveReport::Died => report_op::DIED,
        }
    }

    /// Serialize to a wire frame
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = match self {
            SlaveReport::ResourceChunk { first_byte, data } => {
                let mut payload = bincode::serialize(&(*first_byte as i64)).unwrap_or_default();
                payload.extend_from_slice(data);
                payload
            }
            SlaveReport::ResourceSize(size) => {
                bincode::serialize(&(*size as i64)).unwrap_or_default()
            }
            SlaveReport::SegmentAvailability(set) | SlaveReport::SegmentAssignation(set) => {
                bincode::serialize(&wire_ranges(set)).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        encode_frame(self.opcode(), &payload)
    }

    /// Deserialize from a wire frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (opcode, payload) = decode_frame(bytes)?;
        match opcode {
            report_op::RESOURCE_CHUNK => {
                if payload.len() < 8 {
                    return Err(Error::TruncatedMessage {
                        need: 8,
                        got: payload.len(),
                    });
                }
                let first_byte: i64 = bincode::deserialize(&payload[..8])?;
                if first_byte < 0 {
                    return Err(Error::InvalidRange {
                        min: first_byte,
                        max: first_byte,
                    });
                }
                Ok(SlaveReport::ResourceChunk {
                    first_byte: first_byte as u64,
                    data: Bytes::copy_from_slice(&payload[8..]),
                })
            }
            report_op::RESOURCE_SIZE_REPORT => {
                let size: i64 = bincode::deserialize(payload)?;
                if size < 0 {
                    return Err(Error::InvalidRange {
                        min: size,
                        max: size,
                    });
                }
                Ok(SlaveReport::ResourceSize(size as u64))
            }
            report_op::SEGMENT_AVAILABILITY_REPORT => Ok(SlaveReport::SegmentAvailability(
                range_set(bincode::deserialize(payload)?)?,
            )),
            report_op::SEGMENT_ASSIGNATION_REPORT => Ok(SlaveReport::SegmentAssignation(
                range_set(bincode::deserialize(payload)?)?,
            )),
            report_op::UNAVAILABLE_SEGMENT_WARNING => Ok(SlaveReport::UnavailableSegment),
            report_op::DIED => Ok(SlaveReport::Died),
            opcode => Err(Error::UnknownOpcode {
                family: "report",
                opcode,
            }),
        }
    }
}

/// Build a frame from opcode and payload
fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC_NUMBER.to_le_bytes());
    buf.push(PROTOCOL_VERSION);
    buf.push(opcode);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a frame into opcode and payload, validating header and length
fn decode_frame(bytes: &[u8]) -> Result<(u8, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::TruncatedMessage {
            need: HEADER_LEN,
            got: bytes.len(),
        });
    }

    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != MAGIC_NUMBER {
        return Err(Error::InvalidMagicNumber {
            expected: MAGIC_NUMBER,
            got: magic,
        });
    }

    let version = bytes[4];
    if version != PROTOCOL_VERSION {
        return Err(Error::InvalidVersion {
            expected: PROTOCOL_VERSION,
            got: version,
        });
    }

    let opcode = bytes[5];
    let payload_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    if bytes.len() < HEADER_LEN + payload_len {
        return Err(Error::TruncatedMessage {
            need: HEADER_LEN + payload_len,
            got: bytes.len(),
        });
    }

    Ok((opcode, &bytes[HEADER_LEN..HEADER_LEN + payload_len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_roundtrip() {
        let orders = [
            MasterOrder::ReportResourceLength,
            MasterOrder::ReportAvailableSegments,
            MasterOrder::ReportAssignedSegments,
            MasterOrder::EraseSegments,
            MasterOrder::AddNewSegment(Range::new(1024, 2047)),
            MasterOrder::HardThrottle(0.5),
            MasterOrder::SoftThrottle,
            MasterOrder::Ping,
            MasterOrder::Died,
        ];

        for order in orders {
            let bytes = order.to_bytes();
            let restored = MasterOrder::from_bytes(&bytes).unwrap();
            assert_eq!(order, restored);
        }
    }

    #[test]
    fn test_report_roundtrip() {
        let mut segments = RangeSet::new();
        segments.add(Range::new(0, 499));
        segments.add(Range::new(600, 999));

        let reports = [
            SlaveReport::ResourceChunk {
                first_byte: 4096,
                data: Bytes::from(vec![1, 2, 3, 4, 5]),
            },
            SlaveReport::ResourceSize(1_000_000),
            SlaveReport::SegmentAvailability(segments.clone()),
            SlaveReport::SegmentAssignation(segments),
            SlaveReport::UnavailableSegment,
            SlaveReport::Died,
        ];

        for report in reports {
            let bytes = report.to_bytes();
            let restored = SlaveReport::from_bytes(&bytes).unwrap();
            assert_eq!(report, restored);
        }
    }

    #[test]
    fn test_empty_chunk_roundtrip() {
        let report = SlaveReport::ResourceChunk {
            first_byte: 0,
            data: Bytes::new(),
        };
        let restored = SlaveReport::from_bytes(&report.to_bytes()).unwrap();
        assert_eq!(report, restored);
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = MasterOrder::AddNewSegment(Range::new(0, 99)).to_bytes();
        assert!(matches!(
            MasterOrder::from_bytes(&bytes[..HEADER_LEN + 3]),
            Err(Error::TruncatedMessage { .. })
        ));
        assert!(matches!(
            MasterOrder::from_bytes(&bytes[..4]),
            Err(Error::TruncatedMessage { .. })
        ));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bytes = MasterOrder::Ping.to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            MasterOrder::from_bytes(&bytes),
            Err(Error::InvalidMagicNumber { .. })
        ));

        let mut bytes = MasterOrder::Ping.to_bytes();
        bytes[4] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            MasterOrder::from_bytes(&bytes),
            Err(Error::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let mut bytes = MasterOrder::Ping.to_bytes();
        bytes[5] = 200;
        assert!(matches!(
            MasterOrder::from_bytes(&bytes),
            Err(Error::UnknownOpcode { family: "order", opcode: 200 })
        ));
        assert!(matches!(
            SlaveReport::from_bytes(&bytes),
            Err(Error::UnknownOpcode { family: "report", .. })
        ));
    }

    #[test]
    fn test_negative_range_rejected() {
        let wire = WireRange { min: -1, max: 10 };
        let payload = bincode::serialize(&wire).unwrap();
        let bytes = encode_frame(order_op::ADD_NEW_SEGMENT, &payload);
        assert!(matches!(
            MasterOrder::from_bytes(&bytes),
            Err(Error::InvalidRange { .. })
        ));
    }
}
