//! Byte encoding of partial-slice messages.
//!
//! The transport decides how bytes move; this module only fixes their
//! shape. States archive via `rkyv`, so the built-in aggregate states and
//! any user state with the derives ship without a hand-written format.
//! The heavy serializer bounds stay contained here; the rest of the crate
//! never sees them.

use super::{PartialSliceMessage, PipelineError};
use crate::time::OriginId;
use crate::window::SliceRange;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};

/// Archived form of a partial slice. Keys and states are parallel columns.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct WirePartialSlice<S> {
    /// Range start, inclusive
    pub start: i64,
    /// Range end, exclusive
    pub end: i64,
    /// Per-source sequence number
    pub sequence_number: u64,
    /// Shipping source id
    pub source: u32,
    /// Records folded into this partial
    pub record_count: u64,
    /// Grouping keys
    pub keys: Vec<i64>,
    /// Partial states, parallel to `keys`
    pub states: Vec<S>,
}

/// Encodes a message to its byte form.
///
/// # Errors
///
/// Returns [`PipelineError::Codec`] on serialization failure.
pub fn encode<S>(message: PartialSliceMessage<S>) -> Result<AlignedVec, PipelineError>
where
    S: Archive + for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    let (keys, states): (Vec<i64>, Vec<S>) = message.entries.into_iter().unzip();
    let wire = WirePartialSlice {
        start: message.range.start,
        end: message.range.end,
        sequence_number: message.sequence_number,
        source: message.source.0,
        record_count: message.record_count,
        keys,
        states,
    };
    rkyv::to_bytes::<RkyvError>(&wire).map_err(|e| PipelineError::Codec(e.to_string()))
}

/// Decodes a message from its byte form, validating the archive.
///
/// # Errors
///
/// Returns [`PipelineError::Codec`] for malformed bytes or mismatched
/// key/state columns.
pub fn decode<S>(bytes: &[u8]) -> Result<PartialSliceMessage<S>, PipelineError>
where
    S: Archive,
    S::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<S, HighDeserializer<RkyvError>>,
{
    let wire = rkyv::from_bytes::<WirePartialSlice<S>, RkyvError>(bytes)
        .map_err(|e| PipelineError::Codec(e.to_string()))?;
    if wire.keys.len() != wire.states.len() {
        return Err(PipelineError::Codec(format!(
            "key/state column length mismatch: {} vs {}",
            wire.keys.len(),
            wire.states.len()
        )));
    }
    Ok(PartialSliceMessage {
        range: SliceRange::new(wire.start, wire.end),
        sequence_number: wire.sequence_number,
        source: OriginId(wire.source),
        record_count: wire.record_count,
        entries: wire.keys.into_iter().zip(wire.states).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AvgState, SumState};

    #[test]
    fn test_encode_decode_sum_partial() {
        let message = PartialSliceMessage {
            range: SliceRange::new(0, 10),
            sequence_number: 7,
            source: OriginId(3),
            record_count: 4,
            entries: vec![(1, SumState(42)), (-5, SumState(i128::from(i64::MAX)))],
        };
        let bytes = encode(message.clone()).unwrap();
        let decoded: PartialSliceMessage<SumState> = decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_encode_decode_avg_partial() {
        let message = PartialSliceMessage {
            range: SliceRange::new(-20, -10),
            sequence_number: 0,
            source: OriginId(0),
            record_count: 2,
            entries: vec![(9, AvgState { sum: 15, count: 2 })],
        };
        let bytes = encode(message.clone()).unwrap();
        let decoded: PartialSliceMessage<AvgState> = decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode::<SumState>(&[0u8; 7]).unwrap_err();
        assert!(matches!(err, PipelineError::Codec(_)));
    }
}
