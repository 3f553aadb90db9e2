// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OBU framing: the OBU header, delimiting OBUs inside a buffer and the RTP
//! aggregation header that precedes OBU elements in RTP payloads.

use std::borrow::Cow;

use enumn::N;

use crate::codec::av1::error::ParseError;
use crate::codec::av1::error::ParseResult;
use crate::codec::av1::reader::leb128_decode;
use crate::codec::av1::reader::Reader;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObuType {
    SequenceHeader = 1,
    TemporalDelimiter = 2,
    FrameHeader = 3,
    TileGroup = 4,
    Metadata = 5,
    Frame = 6,
    RedundantFrameHeader = 7,
    TileList = 8,
    Padding = 15,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObuHeader {
    pub obu_type: ObuType,
    pub extension_flag: bool,
    pub has_size_field: bool,
    pub temporal_id: u32,
    pub spatial_id: u32,
}

impl ObuHeader {
    /// Parses the 1 or 2 byte OBU header at the start of `data`.
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        Self::read(&mut Reader::new(data))
    }

    pub(crate) fn read(r: &mut Reader) -> ParseResult<Self> {
        let _obu_forbidden_bit = r.read_bit()?;

        let obu_type = r.read_bits(4)?;
        let mut header = ObuHeader {
            obu_type: ObuType::n(obu_type).ok_or(ParseError::InvalidObuType(obu_type))?,
            extension_flag: r.read_bit()?,
            has_size_field: r.read_bit()?,
            temporal_id: 0,
            spatial_id: 0,
        };

        let _obu_reserved_1bit = r.read_bit()?;

        if header.extension_flag {
            header.temporal_id = r.read_bits(3)?;
            header.spatial_id = r.read_bits(2)?;
            let _extension_header_reserved_3bits = r.read_bits(3)?;
        }

        Ok(header)
    }

    /// Length in bytes
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        if self.extension_flag {
            2
        } else {
            1
        }
    }
}

/// One delimited OBU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Obu<'a> {
    /// The OBU header.
    pub header: ObuHeader,
    /// The bytes of the OBU, from the header up to the end of the payload.
    pub data: Cow<'a, [u8]>,
    /// Where the payload starts in `data`, after the header and the size
    /// field.
    pub start_offset: usize,
    /// The payload size, i.e. obu_size.
    pub size: usize,
}

impl<'a> Obu<'a> {
    pub fn obu_type(&self) -> ObuType {
        self.header.obu_type
    }

    /// The header and size field bytes.
    pub fn header_bytes(&self) -> &[u8] {
        self.data.get(..self.start_offset).unwrap_or_default()
    }

    /// Total number of bytes this OBU takes in the buffer it was read from.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.start_offset + self.size
    }

    /// Detaches the OBU from the buffer it was read from.
    pub fn into_owned(self) -> Obu<'static> {
        Obu {
            header: self.header,
            data: Cow::Owned(self.data.into_owned()),
            start_offset: self.start_offset,
            size: self.size,
        }
    }
}

impl<'a> AsRef<[u8]> for Obu<'a> {
    /// The OBU payload.
    fn as_ref(&self) -> &[u8] {
        self.data
            .get(self.start_offset..self.start_offset + self.size)
            .unwrap_or_default()
    }
}

/// Delimits the OBU starting at `offset` in `data`.
///
/// OBUs without a size field extend to the end of `data`. The caller advances
/// to the next OBU with `offset + obu.len()`.
pub fn next_obu(data: &[u8], offset: usize) -> ParseResult<Obu<'_>> {
    let buf = data.get(offset..).ok_or(ParseError::BufferUnderrun)?;
    if buf.is_empty() {
        return Err(ParseError::BufferUnderrun);
    }

    let header = ObuHeader::parse(buf)?;
    let after_header = buf.get(header.len()..).ok_or(ParseError::BufferUnderrun)?;

    let (size, size_len) = if header.has_size_field {
        let (size, size_len) = leb128_decode(after_header)?;
        (size as usize, size_len)
    } else {
        (after_header.len(), 0)
    };

    let start_offset = header.len() + size_len;
    let available = buf.len() - start_offset;
    if size > available {
        return Err(ParseError::TruncatedObu { size, available });
    }

    log::trace!(
        "OBU {:?} at offset {}, header {} bytes, size {}",
        header.obu_type,
        offset,
        start_offset,
        size
    );

    Ok(Obu {
        header,
        data: Cow::Borrowed(&buf[..start_offset + size]),
        start_offset,
        size,
    })
}

/// Iterates over the OBUs of a buffer holding several concatenated OBUs.
/// Iteration stops after the first error.
pub struct ObuIterator<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> ObuIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }

    /// Offset of the next OBU in the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for ObuIterator<'a> {
    type Item = ParseResult<Obu<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        match next_obu(self.data, self.offset) {
            Ok(obu) => {
                self.offset += obu.len();
                Some(Ok(obu))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// The one byte aggregation header at the start of an AV1 RTP payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregationHeader {
    /// Z: the first OBU element is the continuation of an OBU fragment from
    /// the previous packet.
    pub continues_fragment: bool,
    /// Y: the last OBU element will continue in the next packet.
    pub will_continue: bool,
    /// W: number of OBU elements in the packet. 0 means every element is
    /// preceded by its length.
    pub obu_count: u8,
    /// N: the packet is the first of a coded video sequence.
    pub new_coded_video_sequence: bool,
}

impl AggregationHeader {
    pub fn parse(byte: u8) -> Self {
        Self {
            continues_fragment: byte & 0x80 != 0,
            will_continue: byte & 0x40 != 0,
            obu_count: (byte >> 4) & 0x3,
            new_coded_video_sequence: byte & 0x08 != 0,
        }
    }

    /// Splits the payload following the aggregation header into OBU
    /// elements. When `obu_count` is set, the last element carries no length
    /// and takes the rest of the payload.
    pub fn elements<'a>(&self, payload: &'a [u8]) -> ParseResult<Vec<&'a [u8]>> {
        let mut elements = vec![];
        let mut rest = payload;

        while !rest.is_empty() {
            let is_last = self.obu_count != 0 && elements.len() + 1 == usize::from(self.obu_count);
            if is_last {
                elements.push(rest);
                break;
            }

            let (len, len_size) = leb128_decode(rest)?;
            let len = len as usize;
            let available = rest.len() - len_size;
            if len > available {
                return Err(ParseError::TruncatedObu {
                    size: len,
                    available,
                });
            }

            elements.push(&rest[len_size..len_size + len]);
            rest = &rest[len_size + len..];
        }

        Ok(elements)
    }
}
