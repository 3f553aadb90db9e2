// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::av1::helpers;
use crate::codec::av1::obu::ObuHeader;

#[derive(Error, Debug)]
pub enum ObuWriterError {
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),

    #[error("attemped to write leb128 on unaligned position")]
    UnalignedLeb128,

    #[error("value {value} cannot be coded as {code}")]
    InvalidValue { code: &'static str, value: i64 },
}

pub type ObuWriterResult<T> = std::result::Result<T, ObuWriterError>;

pub struct ObuWriter<W: Write>(BitWriter<W>);

impl<W: Write> ObuWriter<W> {
    pub fn new(writer: W) -> Self {
        Self(BitWriter::new(writer))
    }

    /// Writes fixed bit size integer. Corresponds to `f(n)` in AV1 spec defined in 4.10.2.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> ObuWriterResult<usize> {
        self.0
            .write_f(bits, value)
            .map_err(ObuWriterError::BitWriterError)
    }

    pub fn write_bit(&mut self, bit: bool) -> ObuWriterResult<usize> {
        self.0.write_bit(bit)?;
        Ok(1)
    }

    /// Writes variable length unsigned n-bit number. Corresponds to `uvlc()` in AV1 spec
    /// defined in 4.10.3. `u32::MAX` needs 32 leading zeroes, which the parser rejects, so it
    /// cannot be written.
    pub fn write_uvlc<T: Into<u32>>(&mut self, value: T) -> ObuWriterResult<usize> {
        let value: u32 = value.into();
        let value = value.checked_add(1).ok_or(ObuWriterError::InvalidValue {
            code: "uvlc",
            value: i64::from(value),
        })?;

        let leading_zeros = helpers::floor_log2(value) as usize;

        Ok(self.write_f(leading_zeros, 0u32)? + self.write_f(leading_zeros + 1, value)?)
    }

    /// Writes unsigned little-endian n-byte integer. Corresponds to `le(n)` in AV1 spec
    /// defined in 4.10.4.
    pub fn write_le<T: Into<u32>>(&mut self, n: usize, value: T) -> ObuWriterResult<usize> {
        let mut value: u32 = value.into();

        for _ in 0..n {
            self.write_f(8, value & 0xff)?;
            value >>= 8;
        }

        Ok(n)
    }

    /// Writes unsigned integer represented by a variable number of little-endian bytes.
    /// Corresponds to `leb128()` in AV1 spec defined in 4.10.5.
    ///
    /// Note: Despite the name, the AV1 4.10.5 limits the value to [`u32::MAX`] = (1 << 32) - 1.
    pub fn write_leb128<T: Into<u32>>(
        &mut self,
        value: T,
        min_bytes: usize,
    ) -> ObuWriterResult<usize> {
        if !self.aligned() {
            return Err(ObuWriterError::UnalignedLeb128);
        }

        let mut value: u32 = value.into();
        let mut bytes = 0;

        for _ in 0..8 {
            bytes += 1;

            if value > 0x7f || bytes < min_bytes {
                self.write_f(8, 0x80 | (value & 0x7f))?;
                value >>= 7;
            } else {
                self.write_f(8, value & 0x7f)?;
                break;
            }
        }

        Ok(bytes)
    }

    /// Writes signed integer. Corresponds to `su(n)` in AV1 spec defined in 4.10.6.
    pub fn write_su<T: Into<i32>>(&mut self, bits: usize, value: T) -> ObuWriterResult<usize> {
        let value = i64::from(value.into());
        let half = 1i64 << bits.saturating_sub(1);
        if bits == 0 || bits > 32 || value < -half || value >= half {
            return Err(ObuWriterError::InvalidValue { code: "su", value });
        }

        let value = if value < 0 { value + (1 << bits) } else { value };
        self.write_f(bits, value as u32)
    }

    /// Writes non-symmetric unsigned encoded integer with maximum number of values `n`.
    /// Corresponds to `ns(n)` in AV1 spec defined in 4.10.7.
    pub fn write_ns(&mut self, n: u32, value: u32) -> ObuWriterResult<usize> {
        if value >= n {
            return Err(ObuWriterError::InvalidValue {
                code: "ns",
                value: i64::from(value),
            });
        }

        let w = helpers::floor_log2(n) as usize + 1;
        let m = ((1u64 << w) - u64::from(n)) as u32;

        if value < m {
            return self.write_f(w - 1, value);
        }

        let extra_bit = (value - m) & 1;
        Ok(self.write_f(w - 1, m + ((value - m) >> 1))? + self.write_f(1, extra_bit)?)
    }

    /// Writes `trailing_bits()` up to the next byte boundary. See 5.3.4.
    pub fn write_trailing_bits(&mut self) -> ObuWriterResult<usize> {
        let mut written = self.write_bit(true)?;
        while !self.aligned() {
            written += self.write_bit(false)?;
        }

        Ok(written)
    }

    /// Writes `obu_header()`, and the extension header when present. See 5.3.2.
    pub fn write_obu_header(&mut self, header: &ObuHeader) -> ObuWriterResult<usize> {
        let mut written = self.write_bit(false)?;
        written += self.write_f(4, header.obu_type as u32)?;
        written += self.write_bit(header.extension_flag)?;
        written += self.write_bit(header.has_size_field)?;
        written += self.write_bit(false)?;

        if header.extension_flag {
            written += self.write_f(3, header.temporal_id)?;
            written += self.write_f(2, header.spatial_id)?;
            written += self.write_f(3, 0u32)?;
        }

        Ok(written)
    }

    pub fn aligned(&self) -> bool {
        !self.0.has_data_pending()
    }
}

/// Returns the `leb128()` coding of `value` using the fewest bytes.
pub fn leb128_encode(value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    let mut value = value;

    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            out.push(byte);
            return out;
        }

        out.push(byte | 0x80);
    }
}

/// Builds a complete OBU: header, size field when `header.has_size_field` is
/// set, then `payload`.
pub fn encapsulate_obu(header: &ObuHeader, payload: &[u8]) -> ObuWriterResult<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len() + 8);

    ObuWriter::new(&mut out).write_obu_header(header)?;

    if header.has_size_field {
        let size = u32::try_from(payload.len()).map_err(|_| ObuWriterError::InvalidValue {
            code: "leb128",
            value: payload.len() as i64,
        })?;
        out.extend(leb128_encode(size));
    }

    out.extend_from_slice(payload);
    Ok(out)
}
