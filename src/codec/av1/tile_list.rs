// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of tile list OBUs, used by large scale tile decoding. See 5.12

use bytes::Buf;

use crate::codec::av1::error::ParseError;
use crate::codec::av1::error::ParseResult;

const TILE_LIST_HEADER_SIZE: usize = 4;
const TILE_LIST_ENTRY_HEADER_SIZE: usize = 5;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TileListEntry<'a> {
    /// Slot of the anchor frame the tile predicts from.
    pub anchor_frame_idx: u8,
    pub anchor_tile_row: u8,
    pub anchor_tile_col: u8,
    pub tile_data_size_minus_1: u16,
    /// tile_data_size_minus_1 + 1 bytes of coded tile data.
    pub coded_tile_data: &'a [u8],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TileListObu<'a> {
    pub output_frame_width_in_tiles_minus_1: u8,
    pub output_frame_height_in_tiles_minus_1: u8,
    pub tile_count_minus_1: u16,
    pub entries: Vec<TileListEntry<'a>>,
}

fn take<'a>(buf: &mut &'a [u8], needed: usize) -> ParseResult<&'a [u8]> {
    if buf.len() < needed {
        return Err(ParseError::TruncatedTileList {
            needed,
            available: buf.len(),
        });
    }

    let (head, tail) = buf.split_at(needed);
    *buf = tail;
    Ok(head)
}

/// Parses the payload of a tile list OBU. The coded tile data of each entry
/// borrows from `data`.
pub fn parse_tile_list(data: &[u8]) -> ParseResult<TileListObu<'_>> {
    let mut buf = data;
    let mut header = take(&mut buf, TILE_LIST_HEADER_SIZE)?;

    let mut tl = TileListObu {
        output_frame_width_in_tiles_minus_1: header.get_u8(),
        output_frame_height_in_tiles_minus_1: header.get_u8(),
        tile_count_minus_1: header.get_u16(),
        entries: vec![],
    };

    let tile_count = usize::from(tl.tile_count_minus_1) + 1;
    // Every entry takes at least 6 bytes, don't trust the declared count.
    tl.entries
        .reserve(tile_count.min(buf.len() / (TILE_LIST_ENTRY_HEADER_SIZE + 1)));

    for _ in 0..tile_count {
        let mut entry_header = take(&mut buf, TILE_LIST_ENTRY_HEADER_SIZE)?;
        let anchor_frame_idx = entry_header.get_u8();
        let anchor_tile_row = entry_header.get_u8();
        let anchor_tile_col = entry_header.get_u8();
        let tile_data_size_minus_1 = entry_header.get_u16();

        // coded_tile_data is f(tileSize * 8), tileSize = tile_data_size_minus_1 + 1
        let coded_tile_data = take(&mut buf, usize::from(tile_data_size_minus_1) + 1)?;

        tl.entries.push(TileListEntry {
            anchor_frame_idx,
            anchor_tile_row,
            anchor_tile_col,
            tile_data_size_minus_1,
            coded_tile_data,
        });
    }

    log::trace!(
        "Tile list: {}x{} tiles output, {} entries",
        u32::from(tl.output_frame_width_in_tiles_minus_1) + 1,
        u32::from(tl.output_frame_height_in_tiles_minus_1) + 1,
        tl.entries.len()
    );

    Ok(tl)
}
