// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bytes::Buf;

use crate::bitstream_utils::BitReader;
use crate::codec::av1::error::ParseError;
use crate::codec::av1::error::ParseResult;
use crate::codec::av1::helpers;

/// Upper bound on the number of buckets `decode_subexp` walks through. The
/// bucket width grows by one bit per round, so anything past this could not
/// be read with a 32 bit `f(n)` anyway.
const MAX_SUBEXP_BUCKET_BITS: i64 = 31;

/// Decodes a `leb128()` value from the start of `data`. Returns the value and
/// the number of bytes it took.
///
/// At most 8 bytes are read. Values that do not fit in 32 bits, or a
/// continuation bit on the 8th byte, are rejected with `Overflow`.
pub fn leb128_decode(data: &[u8]) -> ParseResult<(u32, usize)> {
    let mut buf = data;
    let mut value = 0u64;

    for i in 0..8 {
        if !buf.has_remaining() {
            return Err(ParseError::BufferUnderrun);
        }

        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << (i * 7);

        if byte & 0x80 == 0 {
            let value = u32::try_from(value).map_err(|_| ParseError::Overflow)?;
            return Ok((value, i + 1));
        }
    }

    Err(ParseError::Overflow)
}

pub(crate) struct Reader<'a>(BitReader<'a>);

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self(BitReader::new(data))
    }

    /// Implements f(n). Reading 0 bits is valid and yields 0.
    pub fn read_bits(&mut self, num_bits: u32) -> ParseResult<u32> {
        if num_bits == 0 {
            return Ok(0);
        }

        Ok(self.0.read_bits(num_bits as usize)?)
    }

    pub fn read_bit(&mut self) -> ParseResult<bool> {
        Ok(self.0.read_bit()?)
    }

    /// Reads an 8-bit value. Used for the byte-sized metadata fields.
    pub fn read_u8(&mut self) -> ParseResult<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> ParseResult<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    /// Implements uvlc(): Variable length unsigned n-bit number appearing
    /// directly in the bitstream. See 4.10.3
    pub fn read_uvlc(&mut self) -> ParseResult<u32> {
        let mut leading_zeroes = 0u32;

        while !self.read_bit()? {
            leading_zeroes += 1;

            if leading_zeroes >= 32 {
                return Err(ParseError::InvalidCode("uvlc"));
            }
        }

        let value = u64::from(self.read_bits(leading_zeroes)?);
        Ok((value + (1u64 << leading_zeroes) - 1) as u32)
    }

    /// Implements leb128() for a byte aligned position of the bitstream. See
    /// 4.10.5
    pub fn read_leb128(&mut self) -> ParseResult<u32> {
        let mut value = 0u64;

        for i in 0..8 {
            let byte = self.read_bits(8)?;
            value |= u64::from(byte & 0x7f) << (i * 7);

            if byte & 0x80 == 0 {
                return u32::try_from(value).map_err(|_| ParseError::Overflow);
            }
        }

        Err(ParseError::Overflow)
    }

    /// Implements su(n): Signed integer converted from an n bits unsigned
    /// integer in the bitstream. (The unsigned integer corresponds to the
    /// bottom n bits of the signed integer.). See 4.10.6
    pub fn read_su(&mut self, num_bits: u32) -> ParseResult<i32> {
        if num_bits == 0 {
            return Err(ParseError::InvalidBitCount(0));
        }

        let mut value = i64::from(self.read_bits(num_bits)?);
        let sign_mask = 1i64 << (num_bits - 1);

        if (value & sign_mask) != 0 {
            value -= 2 * sign_mask;
        }

        Ok(value as i32)
    }

    /// Implements ns(n): Unsigned encoded integer with maximum number of values
    /// n (i.e. output in range 0..n-1). See 4.10.7
    pub fn read_ns(&mut self, n: u32) -> ParseResult<u32> {
        if n == 0 {
            return Err(ParseError::invalid("ns range", n));
        }

        let w = helpers::floor_log2(n) + 1;
        let m = (1u64 << w) - u64::from(n);
        let v = u64::from(self.read_bits(w - 1)?);

        if v < m {
            return Ok(v as u32);
        }

        let extra_bit = u64::from(self.read_bit()?);
        Ok(((v << 1) - m + extra_bit) as u32)
    }

    /// Implements 5.9.13: Delta quantizer syntax.
    pub fn read_delta_q(&mut self) -> ParseResult<i32> {
        if self.read_bit()? {
            self.read_su(7)
        } else {
            Ok(0)
        }
    }

    /// Implements 5.9.26.
    fn decode_subexp(&mut self, num_syms: i32) -> ParseResult<i32> {
        let num_syms = i64::from(num_syms);
        let k = 3i64;
        let mut i = 0i64;
        let mut mk = 0i64;

        loop {
            let b2 = if i != 0 { k + i - 1 } else { k };
            if b2 > MAX_SUBEXP_BUCKET_BITS {
                return Err(ParseError::InvalidCode("subexp"));
            }

            let a = 1i64 << b2;
            if num_syms <= mk + 3 * a {
                let range = u32::try_from(num_syms - mk)
                    .map_err(|_| ParseError::InvalidCode("subexp"))?;
                let subexp_final_bits = i64::from(self.read_ns(range)?);
                return Ok((subexp_final_bits + mk) as i32);
            }

            let subexp_more_bits = self.read_bit()?;
            if subexp_more_bits {
                i += 1;
                mk += a;
            } else {
                let subexp_bits = i64::from(self.read_bits(b2 as u32)?);
                return Ok((subexp_bits + mk) as i32);
            }
        }
    }

    /// Implements 5.9.27.
    pub fn decode_unsigned_subexp_with_ref(&mut self, mx: i32, r: i32) -> ParseResult<i32> {
        let v = self.decode_subexp(mx)?;

        if (r << 1) <= mx {
            Ok(helpers::inverse_recenter(r, v))
        } else {
            Ok(mx - 1 - helpers::inverse_recenter(mx - 1 - r, v))
        }
    }

    /// Implements 5.9.26.
    pub fn decode_signed_subexp_with_ref(&mut self, low: i32, high: i32, r: i32) -> ParseResult<i32> {
        let x = self.decode_unsigned_subexp_with_ref(high - low, r - low)?;
        Ok(x + low)
    }

    /// Implements 5.3.5 Byte alignment syntax
    pub fn byte_alignment(&mut self) {
        self.0.byte_align();
    }

    /// Bit position since the start of the reader.
    pub fn position(&self) -> u64 {
        self.0.position()
    }

    pub fn num_bits_left(&self) -> u64 {
        self.0.num_bits_left()
    }
}

impl<'a> Clone for Reader<'a> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
