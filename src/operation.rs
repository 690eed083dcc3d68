//! Consensus operation parsing
//!
//! A signing payload starts with a magic byte naming the operation kind.
//! Only the three consensus operations are accepted; for each one the level
//! and round are read from fixed big-endian offsets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset of the level in a block header payload
const BLOCK_LEVEL_OFFSET: usize = 5;
/// Offset of the fitness length in a block header payload
const BLOCK_FITNESS_LENGTH_OFFSET: usize = 83;
/// First byte of the fitness field
const BLOCK_FITNESS_OFFSET: usize = 87;

const ATTESTATION_LEVEL_OFFSET: usize = 40;
const ATTESTATION_ROUND_OFFSET: usize = 44;

const MIN_PAYLOAD_LENGTH: usize = 4;

/// Errors produced while classifying a payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("Data Too Short")]
    PayloadTooShort { needed: usize, actual: usize },

    #[error("Invalid Magic Byte")]
    UnknownDiscriminator(u8),
}

/// Kind of consensus operation, selected by the payload's magic byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Block,
    Preattestation,
    Attestation,
}

impl OperationKind {
    pub const fn magic_byte(self) -> u8 {
        match self {
            Self::Block => 0x11,
            Self::Preattestation => 0x12,
            Self::Attestation => 0x13,
        }
    }

    pub const fn from_magic_byte(byte: u8) -> Option<Self> {
        match byte {
            0x11 => Some(Self::Block),
            0x12 => Some(Self::Preattestation),
            0x13 => Some(Self::Attestation),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "Block",
            Self::Preattestation => "Preattestation",
            Self::Attestation => "Attestation",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (level, round) slot in consensus
///
/// Ordered by level first, then round; the derived `Ord` relies on the field
/// order below.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConsensusPosition {
    pub level: u32,
    pub round: u32,
}

impl ConsensusPosition {
    /// Position of a key that has never signed
    pub const ZERO: Self = Self { level: 0, round: 0 };

    pub const fn new(level: u32, round: u32) -> Self {
        Self { level, round }
    }
}

impl fmt::Display for ConsensusPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {}, round {}", self.level, self.round)
    }
}

/// Kind and position of a parsed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedOperation {
    pub kind: OperationKind,
    pub position: ConsensusPosition,
}

fn read_u32_be(data: &[u8], offset: usize) -> Result<u32, OperationError> {
    let end = offset.checked_add(4).ok_or(OperationError::PayloadTooShort {
        needed: usize::MAX,
        actual: data.len(),
    })?;
    let bytes = data.get(offset..end).ok_or(OperationError::PayloadTooShort {
        needed: end,
        actual: data.len(),
    })?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Classify a payload by its magic byte
pub fn classify(data: &[u8]) -> Result<OperationKind, OperationError> {
    if data.len() < MIN_PAYLOAD_LENGTH {
        return Err(OperationError::PayloadTooShort {
            needed: MIN_PAYLOAD_LENGTH,
            actual: data.len(),
        });
    }
    OperationKind::from_magic_byte(data[0]).ok_or(OperationError::UnknownDiscriminator(data[0]))
}

/// Read the level and round of an already classified payload
///
/// Block headers carry a variable-length fitness field whose last four bytes
/// are the round, so its length has to be read first.
pub fn extract_position(
    data: &[u8],
    kind: OperationKind,
) -> Result<ConsensusPosition, OperationError> {
    match kind {
        OperationKind::Block => {
            let level = read_u32_be(data, BLOCK_LEVEL_OFFSET)?;
            let fitness_length = read_u32_be(data, BLOCK_FITNESS_LENGTH_OFFSET)? as usize;
            let round_offset = BLOCK_FITNESS_OFFSET
                .checked_add(fitness_length)
                .and_then(|end| end.checked_sub(4))
                .ok_or(OperationError::PayloadTooShort {
                    needed: BLOCK_FITNESS_OFFSET,
                    actual: data.len(),
                })?;
            let round = read_u32_be(data, round_offset)?;
            Ok(ConsensusPosition::new(level, round))
        }
        OperationKind::Preattestation | OperationKind::Attestation => Ok(ConsensusPosition::new(
            read_u32_be(data, ATTESTATION_LEVEL_OFFSET)?,
            read_u32_be(data, ATTESTATION_ROUND_OFFSET)?,
        )),
    }
}

/// Classify a payload and read its position
pub fn parse_operation(data: &[u8]) -> Result<ParsedOperation, OperationError> {
    let kind = classify(data)?;
    let position = extract_position(data, kind)?;
    Ok(ParsedOperation { kind, position })
}
