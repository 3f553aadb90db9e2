// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The state carried from one frame header to the next: the eight reference
//! slots and the frame header bookkeeping of a temporal unit.

use crate::codec::av1::error::ParseError;
use crate::codec::av1::error::ParseResult;
use crate::codec::av1::parser::BitDepth;
use crate::codec::av1::parser::FilmGrainParams;
use crate::codec::av1::parser::FrameHeaderObu;
use crate::codec::av1::parser::FrameType;
use crate::codec::av1::parser::GlobalMotionParams;
use crate::codec::av1::parser::SegmentationParams;
use crate::codec::av1::parser::SequenceHeaderObu;
use crate::codec::av1::parser::NUM_REF_FRAMES;
use crate::codec::av1::parser::TOTAL_REFS_PER_FRAME;

/// What a reference slot remembers about the frame last stored in it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceFrameInfo {
    pub ref_valid: bool,
    pub ref_frame_id: u32,
    pub ref_upscaled_width: u32,
    pub ref_frame_width: u32,
    pub ref_frame_height: u32,
    pub ref_render_width: u32,
    pub ref_render_height: u32,
    pub ref_mi_cols: u32,
    pub ref_mi_rows: u32,
    pub ref_frame_type: FrameType,
    pub ref_subsampling_x: bool,
    pub ref_subsampling_y: bool,
    pub ref_bit_depth: BitDepth,
    pub ref_order_hint: u32,
    /// OrderHints of the stored frame, per reference frame.
    pub saved_order_hints: [u32; NUM_REF_FRAMES],
    /// RefFrameSignBias of the stored frame, per reference frame. Frame
    /// headers derive their own from the order hints of their references.
    pub saved_sign_bias: [bool; NUM_REF_FRAMES],
    pub showable_frame: bool,
    /// Frame id a show_existing_frame of this slot displayed, or the frame
    /// id of the stored frame.
    pub display_frame_id: u32,
    pub global_motion_params: GlobalMotionParams,
    pub loop_filter_ref_deltas: [i8; TOTAL_REFS_PER_FRAME],
    pub loop_filter_mode_deltas: [i8; 2],
    pub segmentation_params: SegmentationParams,
    pub film_grain_params: FilmGrainParams,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeState {
    pub ref_info: [ReferenceFrameInfo; NUM_REF_FRAMES],
    /// The last frame header parsed, repeated by later frame header OBUs of
    /// the same frame. Only meaningful when `prev_filled` is set.
    pub prev_frame_header: FrameHeaderObu,
    pub prev_filled: bool,
    /// Set between the first frame header of a frame and the end of that
    /// frame.
    pub seen_frame_header: bool,
    pub current_frame_id: u32,
    pub prev_frame_id: u32,
    /// No frame header has been parsed yet.
    pub is_first_frame: bool,
}

impl Default for DecodeState {
    fn default() -> Self {
        Self {
            ref_info: Default::default(),
            prev_frame_header: Default::default(),
            prev_filled: false,
            seen_frame_header: false,
            current_frame_id: 0,
            prev_frame_id: 0,
            is_first_frame: true,
        }
    }
}

impl DecodeState {
    pub fn new() -> Self {
        Default::default()
    }

    /// The frame stored in `slot`, if the slot holds a valid frame.
    pub fn reference(&self, slot: usize) -> ParseResult<&ReferenceFrameInfo> {
        match self.ref_info.get(slot) {
            Some(rf) if rf.ref_valid => Ok(rf),
            _ => Err(ParseError::InvalidReference(slot)),
        }
    }

    /// Stores the frame described by `fh` in every slot flagged by its
    /// refresh_frame_flags. See 7.20
    pub fn update_reference_frames(
        &mut self,
        fh: &FrameHeaderObu,
        seq: &SequenceHeaderObu,
    ) -> ParseResult<()> {
        if fh.show_existing_frame && fh.frame_type != FrameType::KeyFrame {
            return Ok(());
        }

        if fh.frame_type == FrameType::IntraOnlyFrame && fh.refresh_frame_flags == 0xff {
            return Err(ParseError::Conformance(
                "intra-only frames cannot refresh every reference slot",
            ));
        }

        for (i, rf) in self.ref_info.iter_mut().enumerate() {
            if (fh.refresh_frame_flags >> i) & 1 == 0 {
                continue;
            }

            *rf = ReferenceFrameInfo {
                ref_valid: true,
                ref_frame_id: fh.current_frame_id,
                ref_upscaled_width: fh.upscaled_width,
                ref_frame_width: fh.frame_width,
                ref_frame_height: fh.frame_height,
                ref_render_width: fh.render_width,
                ref_render_height: fh.render_height,
                ref_mi_cols: fh.mi_cols,
                ref_mi_rows: fh.mi_rows,
                ref_frame_type: fh.frame_type,
                ref_subsampling_x: seq.color_config.subsampling_x,
                ref_subsampling_y: seq.color_config.subsampling_y,
                ref_bit_depth: seq.color_config.bit_depth,
                ref_order_hint: fh.order_hint,
                saved_order_hints: fh.order_hints,
                saved_sign_bias: fh.ref_frame_sign_bias,
                showable_frame: fh.showable_frame,
                display_frame_id: if fh.show_existing_frame {
                    fh.display_frame_id
                } else {
                    fh.current_frame_id
                },
                global_motion_params: fh.global_motion_params.clone(),
                loop_filter_ref_deltas: fh.loop_filter_params.loop_filter_ref_deltas,
                loop_filter_mode_deltas: fh.loop_filter_params.loop_filter_mode_deltas,
                segmentation_params: fh.segmentation_params.clone(),
                film_grain_params: fh.film_grain_params.clone(),
            };

            log::trace!("Reference slot {} now holds order hint {}", i, fh.order_hint);
        }

        Ok(())
    }

    /// Makes the frame in slot `frame_to_show_map_idx` the current frame. See
    /// 7.21
    pub fn load_reference_frame(&mut self, fh: &mut FrameHeaderObu) -> ParseResult<()> {
        let slot = fh.frame_to_show_map_idx as usize;
        let rf = self.reference(slot)?.clone();

        self.current_frame_id = rf.ref_frame_id;
        fh.current_frame_id = rf.ref_frame_id;
        fh.upscaled_width = rf.ref_upscaled_width;
        fh.frame_width = rf.ref_frame_width;
        fh.frame_height = rf.ref_frame_height;
        fh.render_width = rf.ref_render_width;
        fh.render_height = rf.ref_render_height;
        fh.mi_cols = rf.ref_mi_cols;
        fh.mi_rows = rf.ref_mi_rows;
        fh.order_hint = rf.ref_order_hint;
        fh.order_hints = rf.saved_order_hints;
        fh.global_motion_params = rf.global_motion_params;
        fh.loop_filter_params.loop_filter_ref_deltas = rf.loop_filter_ref_deltas;
        fh.loop_filter_params.loop_filter_mode_deltas = rf.loop_filter_mode_deltas;
        fh.segmentation_params = rf.segmentation_params;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_frame_header() -> FrameHeaderObu {
        FrameHeaderObu {
            frame_type: FrameType::KeyFrame,
            show_frame: true,
            refresh_frame_flags: 0xff,
            current_frame_id: 3,
            upscaled_width: 320,
            frame_width: 320,
            frame_height: 240,
            render_width: 320,
            render_height: 240,
            mi_cols: 80,
            mi_rows: 60,
            order_hint: 0,
            ..Default::default()
        }
    }

    #[test]
    fn starts_empty() {
        let state = DecodeState::new();
        assert!(state.is_first_frame);
        assert!(!state.seen_frame_header);
        assert!(state.ref_info.iter().all(|rf| !rf.ref_valid));
        assert_eq!(
            state.reference(0).unwrap_err(),
            ParseError::InvalidReference(0)
        );
    }

    #[test]
    fn refresh_follows_flags() {
        let seq = SequenceHeaderObu::default();
        let mut state = DecodeState::new();

        state
            .update_reference_frames(&key_frame_header(), &seq)
            .unwrap();
        assert!(state.ref_info.iter().all(|rf| rf.ref_valid));
        assert!(state.ref_info.iter().all(|rf| rf.ref_frame_width == 320));

        let inter = FrameHeaderObu {
            frame_type: FrameType::InterFrame,
            show_frame: true,
            refresh_frame_flags: 0b0000_0101,
            upscaled_width: 160,
            frame_width: 160,
            order_hint: 4,
            showable_frame: true,
            ref_frame_sign_bias: [false, false, false, false, false, true, true, true],
            ..Default::default()
        };
        state.update_reference_frames(&inter, &seq).unwrap();

        for (i, rf) in state.ref_info.iter().enumerate() {
            if i == 0 || i == 2 {
                assert_eq!(rf.ref_order_hint, 4);
                assert_eq!(rf.ref_frame_width, 160);
                assert_eq!(rf.ref_frame_type, FrameType::InterFrame);
                assert!(rf.showable_frame);
                assert_eq!(rf.saved_sign_bias, inter.ref_frame_sign_bias);
            } else {
                assert_eq!(rf.ref_order_hint, 0);
                assert_eq!(rf.saved_sign_bias, [false; NUM_REF_FRAMES]);
                assert_eq!(rf.ref_frame_type, FrameType::KeyFrame);
            }
        }
    }

    #[test]
    fn intra_only_cannot_refresh_all() {
        let seq = SequenceHeaderObu::default();
        let mut state = DecodeState::new();
        let fh = FrameHeaderObu {
            frame_type: FrameType::IntraOnlyFrame,
            refresh_frame_flags: 0xff,
            ..Default::default()
        };

        assert!(matches!(
            state.update_reference_frames(&fh, &seq),
            Err(ParseError::Conformance(_))
        ));
        assert!(state.ref_info.iter().all(|rf| !rf.ref_valid));
    }

    #[test]
    fn show_existing_inter_frame_keeps_slots() {
        let seq = SequenceHeaderObu::default();
        let mut state = DecodeState::new();
        let fh = FrameHeaderObu {
            show_existing_frame: true,
            frame_type: FrameType::InterFrame,
            refresh_frame_flags: 0xff,
            ..Default::default()
        };

        state.update_reference_frames(&fh, &seq).unwrap();
        assert!(state.ref_info.iter().all(|rf| !rf.ref_valid));
    }

    #[test]
    fn load_copies_slot() {
        let seq = SequenceHeaderObu::default();
        let mut state = DecodeState::new();
        let mut key = key_frame_header();
        key.loop_filter_params.loop_filter_ref_deltas = [2, 1, 0, 0, 0, -2, -1, -1];
        key.order_hints[1] = 9;
        state.update_reference_frames(&key, &seq).unwrap();

        let mut fh = FrameHeaderObu {
            show_existing_frame: true,
            frame_to_show_map_idx: 5,
            ..Default::default()
        };
        state.load_reference_frame(&mut fh).unwrap();

        assert_eq!(state.current_frame_id, 3);
        assert_eq!(fh.current_frame_id, 3);
        assert_eq!(fh.upscaled_width, 320);
        assert_eq!(fh.frame_height, 240);
        assert_eq!(fh.mi_cols, 80);
        assert_eq!(fh.order_hints[1], 9);
        assert_eq!(
            fh.loop_filter_params.loop_filter_ref_deltas,
            [2, 1, 0, 0, 0, -2, -1, -1]
        );
    }
}
