// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of AV1 Open Bitstream Units (OBUs).
//!
//! The entry points live in [`codec::av1`]: [`codec::av1::obu::next_obu`]
//! delimits OBUs, the free functions of [`codec::av1::parser`] parse sequence
//! headers, frame headers and tile groups, and [`codec::av1::parser::Parser`]
//! drives them over a whole stream.

pub mod bitstream_utils;
pub mod codec;
