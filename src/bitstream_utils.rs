// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use bytes::Buf;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BitReaderError {
    #[error("reader ran out of bits")]
    BufferUnderrun,
    #[error("{0} bits were requested, expected 1 to 32")]
    InvalidBitCount(usize),
}

/// A MSB-first bit reader over a byte slice. Bytes are loaded into the
/// accumulator one at a time, as they are needed.
#[derive(Clone)]
pub struct BitReader<'a> {
    /// The bytes that have not been loaded into `curr_byte` yet.
    data: &'a [u8],
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_byte.
    curr_byte: u8,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// How many bits have been read so far.
    position: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            position: 0,
        }
    }

    /// Creates a reader over the `length` bytes of `data` starting at
    /// `offset`. Fails if the window does not fit in `data`.
    pub fn with_range(data: &'a [u8], offset: usize, length: usize) -> Result<Self, BitReaderError> {
        let end = offset
            .checked_add(length)
            .ok_or(BitReaderError::BufferUnderrun)?;
        let window = data
            .get(offset..end)
            .ok_or(BitReaderError::BufferUnderrun)?;

        Ok(Self::new(window))
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, BitReaderError> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Read `num_bits` bits from the stream, most significant bit first.
    /// `num_bits` must be within 1..=32. Nothing is consumed if the stream
    /// holds fewer than `num_bits` bits.
    pub fn read_bits(&mut self, num_bits: usize) -> Result<u32, BitReaderError> {
        if num_bits == 0 || num_bits > 32 {
            return Err(BitReaderError::InvalidBitCount(num_bits));
        }

        if num_bits as u64 > self.num_bits_left() {
            return Err(BitReaderError::BufferUnderrun);
        }

        let mut bits_left = num_bits;
        let mut out = 0u64;

        while bits_left > 0 {
            if self.num_remaining_bits_in_curr_byte == 0 {
                self.move_to_next_byte()?;
            }

            let n = std::cmp::min(bits_left, self.num_remaining_bits_in_curr_byte);
            let shift = self.num_remaining_bits_in_curr_byte - n;
            let bits = (u64::from(self.curr_byte) >> shift) & ((1u64 << n) - 1);

            out = (out << n) | bits;
            self.num_remaining_bits_in_curr_byte -= n;
            bits_left -= n;
        }

        self.position += num_bits as u64;
        Ok(out as u32)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: u64) -> Result<(), BitReaderError> {
        if num_bits > self.num_bits_left() {
            return Err(BitReaderError::BufferUnderrun);
        }

        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits(n as usize)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Discards the bits left in the current byte, if any.
    pub fn byte_align(&mut self) {
        self.position += self.num_remaining_bits_in_curr_byte as u64;
        self.num_remaining_bits_in_curr_byte = 0;
    }

    /// Whether the next bit to be read starts a byte.
    pub fn is_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte == 0
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> u64 {
        self.data.remaining() as u64 * 8 + self.num_remaining_bits_in_curr_byte as u64
    }

    /// Return the position of this bitstream in bits.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn move_to_next_byte(&mut self) -> Result<(), BitReaderError> {
        if !self.data.has_remaining() {
            return Err(BitReaderError::BufferUnderrun);
        }

        self.curr_byte = self.data.get_u8();
        self.num_remaining_bits_in_curr_byte = 8;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mut written = 0;
        for bit in (0..bits).rev() {
            let bit = 1u32 << bit;

            self.write_bit((value & bit) == bit)?;
            written += 1;
        }

        Ok(written)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}
