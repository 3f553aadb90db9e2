#![no_main]

use av1_obu::codec::av1::obu::ObuType;
use av1_obu::codec::av1::parser::ParsedObu;
use av1_obu::codec::av1::parser::Parser;
use libfuzzer_sys::fuzz_target;

fn parse_stream(mut data: &[u8]) -> anyhow::Result<()> {
    let mut parser = Parser::default();

    while !data.is_empty() {
        let obu = match parser.parse_obu(data)? {
            ParsedObu::Process(obu) => obu,
            ParsedObu::Drop(length) => {
                data = &data[length as usize..];
                continue;
            }
        };

        // Errors only end the current OBU, keep walking the stream.
        let _ = match obu.obu_type() {
            ObuType::TemporalDelimiter => parser.parse_temporal_delimiter_obu(&obu),
            ObuType::SequenceHeader => parser.parse_sequence_header_obu(&obu).map(|_| ()),
            ObuType::FrameHeader | ObuType::RedundantFrameHeader => {
                parser.parse_frame_header_obu(&obu).map(|_| ())
            }
            ObuType::TileGroup => parser.parse_tile_group_obu(&obu).map(|_| ()),
            ObuType::Frame => parser.parse_frame_obu(&obu).map(|_| ()),
            ObuType::Metadata => parser.parse_metadata_obu(&obu).map(|_| ()),
            ObuType::TileList => parser.parse_tile_list_obu(&obu).map(|_| ()),
            ObuType::Padding => Ok(()),
        };

        data = &data[obu.len()..];
    }

    Ok(())
}

fuzz_target!(|data: &[u8]| {
    let _ = parse_stream(data);
});
