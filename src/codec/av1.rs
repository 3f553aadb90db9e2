// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! AV1 OBU parsing, down to the frame header and tile layout.

pub mod error;
mod helpers;
pub mod metadata;
pub mod obu;
pub mod parser;
pub(crate) mod reader;
pub mod state;
pub mod tile_list;
pub mod writer;

pub use reader::leb128_decode;
