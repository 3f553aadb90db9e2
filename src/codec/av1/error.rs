// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::bitstream_utils::BitReaderError;

/// Every way parsing an OBU can fail. None of them are recoverable inside the
/// parser: the caller drops the OBU and resumes at the next OBU boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("bitstream ended before the requested bits were available")]
    BufferUnderrun,
    #[error("{0} bits were requested, expected 1 to 32")]
    InvalidBitCount(usize),
    #[error("invalid {0} code")]
    InvalidCode(&'static str),
    #[error("leb128 value does not fit in 32 bits")]
    Overflow,
    #[error("invalid OBU type {0}")]
    InvalidObuType(u32),
    #[error("OBU declares {size} bytes but only {available} are left")]
    TruncatedObu { size: usize, available: usize },
    #[error("show_existing_frame without a previous frame header")]
    MissingPreviousHeader,
    #[error("no sequence header has been parsed yet")]
    MissingSequenceHeader,
    #[error("frame id mismatch: expected {expected}, got {actual}")]
    FrameIdMismatch { expected: u32, actual: u32 },
    #[error("tile declares {size} bytes but only {available} are left")]
    TruncatedTileData { size: usize, available: usize },
    #[error("tile list needs {needed} bytes but only {available} are left")]
    TruncatedTileList { needed: usize, available: usize },
    #[error("invalid metadata type {0}")]
    InvalidMetadataType(u32),
    #[error("invalid value {value} for {name}")]
    InvalidValue { name: &'static str, value: u32 },
    #[error("reference slot {0} does not hold a valid frame")]
    InvalidReference(usize),
    #[error("conformance violation: {0}")]
    Conformance(&'static str),
}

impl From<BitReaderError> for ParseError {
    fn from(err: BitReaderError) -> Self {
        match err {
            BitReaderError::BufferUnderrun => ParseError::BufferUnderrun,
            BitReaderError::InvalidBitCount(n) => ParseError::InvalidBitCount(n),
        }
    }
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

impl ParseError {
    pub(crate) fn invalid(name: &'static str, value: u32) -> Self {
        ParseError::InvalidValue { name, value }
    }
}
