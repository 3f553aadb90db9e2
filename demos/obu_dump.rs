// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! obu_dump, walks a low overhead AV1 bitstream (a file of concatenated OBUs)
//! and logs every structure the parser extracts from it.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use argh::FromArgs;

use av1_obu::codec::av1::obu::ObuType;
use av1_obu::codec::av1::parser::ParsedObu;
use av1_obu::codec::av1::parser::Parser;

#[derive(Debug, FromArgs)]
/// Dump the OBUs of an AV1 bitstream.
struct Args {
    /// input file, in the low overhead bitstream format
    #[argh(positional)]
    input: PathBuf,

    /// operating point to select after each sequence header. Default: 0
    #[argh(option, default = "0")]
    operating_point: u32,

    /// stop after this many OBUs
    #[argh(option)]
    max_obus: Option<usize>,
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = {
        let mut buf = Vec::new();
        File::open(&args.input)
            .expect("error opening input file")
            .read_to_end(&mut buf)
            .expect("error reading input file");
        buf
    };

    let mut parser = Parser::default();
    let mut data = &input[..];
    let mut count = 0;

    while !data.is_empty() && args.max_obus.map_or(true, |max| count < max) {
        let obu = match parser.parse_obu(data) {
            Ok(ParsedObu::Process(obu)) => obu,
            Ok(ParsedObu::Drop(length)) => {
                println!("dropped {} bytes outside of the operating point", length);
                data = &data[length as usize..];
                continue;
            }
            Err(e) => {
                log::error!("Cannot delimit OBU: {:#}", e);
                break;
            }
        };

        count += 1;
        println!(
            "OBU #{}: {:?}, {} bytes, temporal id {}, spatial id {}",
            count,
            obu.obu_type(),
            obu.len(),
            obu.header.temporal_id,
            obu.header.spatial_id
        );

        let res = match obu.obu_type() {
            ObuType::TemporalDelimiter => parser.parse_temporal_delimiter_obu(&obu),
            ObuType::SequenceHeader => parser.parse_sequence_header_obu(&obu).and_then(|seq| {
                println!("{:#?}", seq);
                parser.choose_operating_point(args.operating_point)
            }),
            ObuType::FrameHeader | ObuType::RedundantFrameHeader => {
                parser.parse_frame_header_obu(&obu).map(|fh| {
                    println!(
                        "  {:?} {}x{}, show_frame {}, show_existing_frame {}, order hint {}",
                        fh.frame_type,
                        fh.upscaled_width,
                        fh.frame_height,
                        fh.show_frame,
                        fh.show_existing_frame,
                        fh.order_hint
                    );
                })
            }
            ObuType::TileGroup => parser.parse_tile_group_obu(&obu).map(|tg| {
                println!("  tiles {} to {}", tg.tg_start, tg.tg_end);
            }),
            ObuType::Frame => parser.parse_frame_obu(&obu).map(|frame| {
                println!(
                    "  {:?} {}x{}, order hint {}, tiles {} to {}",
                    frame.header.frame_type,
                    frame.header.upscaled_width,
                    frame.header.frame_height,
                    frame.header.order_hint,
                    frame.tile_group.tg_start,
                    frame.tile_group.tg_end
                );
            }),
            ObuType::Metadata => parser.parse_metadata_obu(&obu).map(|md| {
                println!("  {:?}", md);
            }),
            ObuType::TileList => parser.parse_tile_list_obu(&obu).map(|tl| {
                println!("  {} tile list entries", tl.entries.len());
            }),
            ObuType::Padding => Ok(()),
        };

        if let Err(e) = res {
            log::error!("Error parsing OBU #{}: {:#}", count, e);
        }

        data = &data[obu.len()..];
    }
}
