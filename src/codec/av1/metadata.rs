// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of metadata OBUs. See 5.8

use bytes::Buf;
use enumn::N;

use crate::codec::av1::error::ParseError;
use crate::codec::av1::error::ParseResult;
use crate::codec::av1::reader::leb128_decode;
use crate::codec::av1::reader::Reader;

/// scalability_mode_idc announcing an explicit scalability structure.
pub const SCALABILITY_SS: u32 = 14;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataType {
    HdrCll = 1,
    HdrMdcv = 2,
    Scalability = 3,
    ItutT35 = 4,
    Timecode = 5,
}

/// Content light level. See 5.8.3
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HdrCll {
    pub max_cll: u16,
    pub max_fall: u16,
}

/// Mastering display color volume. See 5.8.4
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HdrMdcv {
    /// x and y of the red, green and blue primaries, 0.16 fixed point.
    pub primary_chromaticity_x: [u16; 3],
    pub primary_chromaticity_y: [u16; 3],
    pub white_point_chromaticity_x: u16,
    pub white_point_chromaticity_y: u16,
    /// 24.8 fixed point, in candelas per square meter.
    pub luminance_max: u32,
    /// 18.14 fixed point, in candelas per square meter.
    pub luminance_min: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemporalGroupEntry {
    pub temporal_id: u8,
    pub temporal_switching_up_point_flag: bool,
    pub spatial_switching_up_point_flag: bool,
    /// temporal_group_ref_pic_diff. Holds temporal_group_ref_cnt entries.
    pub ref_pic_diff: Vec<u8>,
}

/// See 5.8.6
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalabilityStructure {
    pub spatial_layers_cnt_minus_1: u8,
    pub spatial_layer_dimensions_present_flag: bool,
    pub spatial_layer_description_present_flag: bool,
    pub temporal_group_description_present_flag: bool,
    pub spatial_layer_max_width: [u16; 4],
    pub spatial_layer_max_height: [u16; 4],
    pub spatial_layer_ref_id: [u8; 4],
    /// One entry per temporal_group_size.
    pub temporal_group: Vec<TemporalGroupEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scalability {
    pub scalability_mode_idc: u8,
    /// Only present when `scalability_mode_idc` is [`SCALABILITY_SS`].
    pub structure: Option<ScalabilityStructure>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItutT35<'a> {
    pub itu_t_t35_country_code: u8,
    /// Only present when the country code is 0xff.
    pub itu_t_t35_country_code_extension_byte: Option<u8>,
    pub payload: &'a [u8],
}

/// See 5.8.7
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timecode {
    pub counting_type: u8,
    pub full_timestamp_flag: bool,
    pub discontinuity_flag: bool,
    pub cnt_dropped_flag: bool,
    pub n_frames: u16,
    pub seconds_value: Option<u8>,
    pub minutes_value: Option<u8>,
    pub hours_value: Option<u8>,
    pub time_offset_length: u8,
    pub time_offset_value: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataObu<'a> {
    HdrCll(HdrCll),
    HdrMdcv(HdrMdcv),
    Scalability(Scalability),
    ItutT35(ItutT35<'a>),
    Timecode(Timecode),
    /// Types 6 to 31, which are unregistered. `payload` is every byte after
    /// the type.
    Unregistered { metadata_type: u32, payload: &'a [u8] },
}

impl MetadataObu<'_> {
    pub fn metadata_type(&self) -> u32 {
        match self {
            MetadataObu::HdrCll(_) => MetadataType::HdrCll as u32,
            MetadataObu::HdrMdcv(_) => MetadataType::HdrMdcv as u32,
            MetadataObu::Scalability(_) => MetadataType::Scalability as u32,
            MetadataObu::ItutT35(_) => MetadataType::ItutT35 as u32,
            MetadataObu::Timecode(_) => MetadataType::Timecode as u32,
            MetadataObu::Unregistered { metadata_type, .. } => *metadata_type,
        }
    }
}

fn ensure_remaining(buf: &[u8], needed: usize) -> ParseResult<()> {
    if buf.remaining() < needed {
        Err(ParseError::BufferUnderrun)
    } else {
        Ok(())
    }
}

/// Parses the payload of a metadata OBU.
pub fn parse_metadata(data: &[u8]) -> ParseResult<MetadataObu<'_>> {
    let (metadata_type, len) = leb128_decode(data)?;
    let payload = &data[len..];

    log::trace!("Metadata type {}, {} bytes", metadata_type, payload.len());

    match MetadataType::n(metadata_type) {
        Some(MetadataType::HdrCll) => parse_hdr_cll(payload).map(MetadataObu::HdrCll),
        Some(MetadataType::HdrMdcv) => parse_hdr_mdcv(payload).map(MetadataObu::HdrMdcv),
        Some(MetadataType::Scalability) => {
            parse_scalability(payload).map(MetadataObu::Scalability)
        }
        Some(MetadataType::ItutT35) => parse_itut_t35(payload).map(MetadataObu::ItutT35),
        Some(MetadataType::Timecode) => parse_timecode(payload).map(MetadataObu::Timecode),
        None if (6..=31).contains(&metadata_type) => Ok(MetadataObu::Unregistered {
            metadata_type,
            payload,
        }),
        None => Err(ParseError::InvalidMetadataType(metadata_type)),
    }
}

fn parse_hdr_cll(mut buf: &[u8]) -> ParseResult<HdrCll> {
    ensure_remaining(buf, 4)?;

    Ok(HdrCll {
        max_cll: buf.get_u16(),
        max_fall: buf.get_u16(),
    })
}

fn parse_hdr_mdcv(mut buf: &[u8]) -> ParseResult<HdrMdcv> {
    ensure_remaining(buf, 24)?;

    let mut mdcv = HdrMdcv::default();
    for i in 0..3 {
        mdcv.primary_chromaticity_x[i] = buf.get_u16();
        mdcv.primary_chromaticity_y[i] = buf.get_u16();
    }

    mdcv.white_point_chromaticity_x = buf.get_u16();
    mdcv.white_point_chromaticity_y = buf.get_u16();
    mdcv.luminance_max = buf.get_u32();
    mdcv.luminance_min = buf.get_u32();

    Ok(mdcv)
}

fn parse_scalability(data: &[u8]) -> ParseResult<Scalability> {
    let mut r = Reader::new(data);
    let mut scalability = Scalability {
        scalability_mode_idc: r.read_u8()?,
        structure: None,
    };

    if u32::from(scalability.scalability_mode_idc) == SCALABILITY_SS {
        scalability.structure = Some(parse_scalability_structure(&mut r)?);
    }

    Ok(scalability)
}

fn parse_scalability_structure(r: &mut Reader) -> ParseResult<ScalabilityStructure> {
    let mut ss = ScalabilityStructure {
        spatial_layers_cnt_minus_1: r.read_bits(2)? as u8,
        spatial_layer_dimensions_present_flag: r.read_bit()?,
        spatial_layer_description_present_flag: r.read_bit()?,
        temporal_group_description_present_flag: r.read_bit()?,
        ..Default::default()
    };

    // scalability_structure_reserved_3bits
    r.read_bits(3)?;

    let layers = usize::from(ss.spatial_layers_cnt_minus_1) + 1;

    if ss.spatial_layer_dimensions_present_flag {
        for i in 0..layers {
            ss.spatial_layer_max_width[i] = r.read_u16()?;
            ss.spatial_layer_max_height[i] = r.read_u16()?;
        }
    }

    if ss.spatial_layer_description_present_flag {
        for i in 0..layers {
            ss.spatial_layer_ref_id[i] = r.read_u8()?;
        }
    }

    if ss.temporal_group_description_present_flag {
        let temporal_group_size = r.read_u8()?;
        ss.temporal_group.reserve(usize::from(temporal_group_size));

        for _ in 0..temporal_group_size {
            let temporal_id = r.read_bits(3)? as u8;
            let temporal_switching_up_point_flag = r.read_bit()?;
            let spatial_switching_up_point_flag = r.read_bit()?;
            let ref_cnt = r.read_bits(3)?;

            let ref_pic_diff = (0..ref_cnt)
                .map(|_| r.read_u8())
                .collect::<ParseResult<Vec<_>>>()?;

            ss.temporal_group.push(TemporalGroupEntry {
                temporal_id,
                temporal_switching_up_point_flag,
                spatial_switching_up_point_flag,
                ref_pic_diff,
            });
        }
    }

    Ok(ss)
}

fn parse_itut_t35(data: &[u8]) -> ParseResult<ItutT35<'_>> {
    let mut buf = data;
    ensure_remaining(buf, 1)?;

    let itu_t_t35_country_code = buf.get_u8();
    let itu_t_t35_country_code_extension_byte = if itu_t_t35_country_code == 0xff {
        ensure_remaining(buf, 1)?;
        Some(buf.get_u8())
    } else {
        None
    };

    // The payload ends with trailing_bits(). Its last byte of data is the
    // second to last non-zero byte of the OBU.
    let mut non_zero = buf.iter().rposition(|&b| b != 0);
    if let Some(last) = non_zero {
        non_zero = buf[..last].iter().rposition(|&b| b != 0);
    }

    let payload: &[u8] = match non_zero {
        Some(end) => &buf[..=end],
        None => &[],
    };

    log::trace!(
        "ITU-T T.35 metadata, country code {:#04x}, {} payload bytes",
        itu_t_t35_country_code,
        payload.len()
    );

    Ok(ItutT35 {
        itu_t_t35_country_code,
        itu_t_t35_country_code_extension_byte,
        payload,
    })
}

fn parse_timecode(data: &[u8]) -> ParseResult<Timecode> {
    let mut r = Reader::new(data);
    let mut tc = Timecode {
        counting_type: r.read_bits(5)? as u8,
        full_timestamp_flag: r.read_bit()?,
        discontinuity_flag: r.read_bit()?,
        cnt_dropped_flag: r.read_bit()?,
        n_frames: r.read_bits(9)? as u16,
        ..Default::default()
    };

    if tc.full_timestamp_flag {
        tc.seconds_value = Some(r.read_bits(6)? as u8);
        tc.minutes_value = Some(r.read_bits(6)? as u8);
        tc.hours_value = Some(r.read_bits(5)? as u8);
    } else if r.read_bit()? {
        tc.seconds_value = Some(r.read_bits(6)? as u8);
        if r.read_bit()? {
            tc.minutes_value = Some(r.read_bits(6)? as u8);
            if r.read_bit()? {
                tc.hours_value = Some(r.read_bits(5)? as u8);
            }
        }
    }

    tc.time_offset_length = r.read_bits(5)? as u8;
    if tc.time_offset_length > 0 {
        tc.time_offset_value = Some(r.read_bits(u32::from(tc.time_offset_length))?);
    }

    Ok(tc)
}
