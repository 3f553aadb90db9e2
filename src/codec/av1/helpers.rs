// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mathematical helpers from the AV1 specification (sections 4.7, 5.9 and 7).

use crate::codec::av1::parser::NUM_REF_FRAMES;
use crate::codec::av1::parser::WARPEDMODEL_PREC_BITS;
use crate::codec::av1::parser::WARP_PARAM_REDUCE_BITS;

const DIV_LUT: [i32; 257] = [
    16384, 16320, 16257, 16194, 16132, 16070, 16009, 15948, 15888, 15828, 15768, 15709, 15650,
    15592, 15534, 15477, 15420, 15364, 15308, 15252, 15197, 15142, 15087, 15033, 14980, 14926,
    14873, 14821, 14769, 14717, 14665, 14614, 14564, 14513, 14463, 14413, 14364, 14315, 14266,
    14218, 14170, 14122, 14075, 14028, 13981, 13935, 13888, 13843, 13797, 13752, 13707, 13662,
    13618, 13574, 13530, 13487, 13443, 13400, 13358, 13315, 13273, 13231, 13190, 13148, 13107,
    13066, 13026, 12985, 12945, 12906, 12866, 12827, 12788, 12749, 12710, 12672, 12633, 12596,
    12558, 12520, 12483, 12446, 12409, 12373, 12336, 12300, 12264, 12228, 12193, 12157, 12122,
    12087, 12053, 12018, 11984, 11950, 11916, 11882, 11848, 11815, 11782, 11749, 11716, 11683,
    11651, 11619, 11586, 11555, 11523, 11491, 11460, 11429, 11398, 11367, 11336, 11305, 11275,
    11245, 11215, 11185, 11155, 11125, 11096, 11067, 11038, 11009, 10980, 10951, 10923, 10894,
    10866, 10838, 10810, 10782, 10755, 10727, 10700, 10673, 10645, 10618, 10592, 10565, 10538,
    10512, 10486, 10460, 10434, 10408, 10382, 10356, 10331, 10305, 10280, 10255, 10230, 10205,
    10180, 10156, 10131, 10107, 10082, 10058, 10034, 10010, 9986, 9963, 9939, 9916, 9892, 9869,
    9846, 9823, 9800, 9777, 9754, 9732, 9709, 9687, 9664, 9642, 9620, 9598, 9576, 9554, 9533, 9511,
    9489, 9468, 9447, 9425, 9404, 9383, 9362, 9341, 9321, 9300, 9279, 9259, 9239, 9218, 9198, 9178,
    9158, 9138, 9118, 9098, 9079, 9059, 9039, 9020, 9001, 8981, 8962, 8943, 8924, 8905, 8886, 8867,
    8849, 8830, 8812, 8793, 8775, 8756, 8738, 8720, 8702, 8684, 8666, 8648, 8630, 8613, 8595, 8577,
    8560, 8542, 8525, 8508, 8490, 8473, 8456, 8439, 8422, 8405, 8389, 8372, 8355, 8339, 8322, 8306,
    8289, 8273, 8257, 8240, 8224, 8208, 8192,
];

const DIV_LUT_BITS: u32 = 8;
const DIV_LUT_PREC_BITS: u32 = 14;

/// Implements FloorLog2(x), the position of the most significant bit in x.
///
/// The specification only calls this with x >= 1. Returns 0 for x == 0.
pub fn floor_log2(x: u32) -> u32 {
    if x == 0 {
        0
    } else {
        31 - x.leading_zeros()
    }
}

/// Implements 5.9.3. Get relative distance function
///
/// Returns the signed distance between order hints `a` and `b`, wrapped to
/// `order_hint_bits`. Always 0 when order hints are disabled.
pub fn get_relative_dist(enable_order_hint: bool, order_hint_bits: u32, a: i32, b: i32) -> i32 {
    if !enable_order_hint || order_hint_bits == 0 {
        return 0;
    }

    let diff = a.wrapping_sub(b);
    let m = 1i32 << (order_hint_bits - 1);
    (diff & (m - 1)) - (diff & m)
}

/// Implements find_latest_backward from section 7.8. Returns the slot and its
/// shifted order hint.
pub fn find_latest_backward(
    shifted_order_hints: &[i32; NUM_REF_FRAMES],
    used_frame: &[bool; NUM_REF_FRAMES],
    cur_frame_hint: i32,
) -> Option<(usize, i32)> {
    let mut found: Option<(usize, i32)> = None;

    for (i, &hint) in shifted_order_hints.iter().enumerate() {
        if used_frame[i] || hint < cur_frame_hint {
            continue;
        }

        if found.map_or(true, |(_, latest)| hint >= latest) {
            found = Some((i, hint));
        }
    }

    found
}

/// Implements find_earliest_backward from section 7.8.
pub fn find_earliest_backward(
    shifted_order_hints: &[i32; NUM_REF_FRAMES],
    used_frame: &[bool; NUM_REF_FRAMES],
    cur_frame_hint: i32,
) -> Option<(usize, i32)> {
    let mut found: Option<(usize, i32)> = None;

    for (i, &hint) in shifted_order_hints.iter().enumerate() {
        if used_frame[i] || hint < cur_frame_hint {
            continue;
        }

        if found.map_or(true, |(_, earliest)| hint < earliest) {
            found = Some((i, hint));
        }
    }

    found
}

/// Implements find_latest_forward from section 7.8.
pub fn find_latest_forward(
    shifted_order_hints: &[i32; NUM_REF_FRAMES],
    used_frame: &[bool; NUM_REF_FRAMES],
    cur_frame_hint: i32,
) -> Option<(usize, i32)> {
    let mut found: Option<(usize, i32)> = None;

    for (i, &hint) in shifted_order_hints.iter().enumerate() {
        if used_frame[i] || hint >= cur_frame_hint {
            continue;
        }

        if found.map_or(true, |(_, latest)| hint >= latest) {
            found = Some((i, hint));
        }
    }

    found
}

/// The final step of section 7.8: the slot with the smallest shifted order
/// hint, regardless of whether it is already in use.
pub fn find_earliest(shifted_order_hints: &[i32; NUM_REF_FRAMES]) -> Option<(usize, i32)> {
    let mut found: Option<(usize, i32)> = None;

    for (i, &hint) in shifted_order_hints.iter().enumerate() {
        if found.map_or(true, |(_, earliest)| hint < earliest) {
            found = Some((i, hint));
        }
    }

    found
}

/// Implements tile_log2 from 5.9.15: the smallest k such that
/// `blk_size << k >= target`. The search stops at 32.
pub fn tile_log2(blk_size: u32, target: u32) -> u32 {
    let mut k = 0;

    while k < 32 && (u64::from(blk_size) << k) < u64::from(target) {
        k += 1;
    }

    k
}

pub fn clip3<T: PartialOrd>(x: T, y: T, z: T) -> T {
    if z < x {
        x
    } else if z > y {
        y
    } else {
        z
    }
}

/// 5.9.28
pub fn inverse_recenter(r: i32, v: i32) -> i32 {
    if v > 2 * r {
        v
    } else if v & 1 != 0 {
        r - ((v + 1) >> 1)
    } else {
        r + (v >> 1)
    }
}

/// Implements Round2. See 4.7: mathematical functions.
pub fn round2(x: u64, n: u32) -> u64 {
    if n == 0 {
        return x;
    }

    (x + (1 << (n - 1))) >> n
}

/// Implements Round2Signed. See 4.7: mathematical functions.
pub fn round2signed(x: i64, n: u32) -> i64 {
    if x >= 0 {
        round2(x as u64, n) as i64
    } else {
        -(round2(x.unsigned_abs(), n) as i64)
    }
}

/// Implements 7.11.3.7. Resolve divisor process. `d` must be non-zero.
pub fn resolve_divisor(d: i64) -> (u32, i64) {
    let abs_d = d.unsigned_abs().max(1);
    let n = 63 - abs_d.leading_zeros();
    let e = abs_d - (1 << n);

    let f = if n > DIV_LUT_BITS {
        round2(e, n - DIV_LUT_BITS)
    } else {
        e << (DIV_LUT_BITS - n)
    };

    let div_shift = n + DIV_LUT_PREC_BITS;
    let factor = i64::from(DIV_LUT[f as usize]);
    let div_factor = if d < 0 { -factor } else { factor };

    (div_shift, div_factor)
}

/// Implements 7.11.3.6. Setup shear process, returning whether the warp
/// parameters are valid.
pub fn setup_shear(warp_params: &[i32; 6]) -> bool {
    if warp_params[2] <= 0 {
        return false;
    }

    let params = warp_params.map(i64::from);
    let one = 1i64 << WARPEDMODEL_PREC_BITS;

    let alpha0 = clip3(-32768, 32767, params[2] - one);
    let beta0 = clip3(-32768, 32767, params[3]);

    let (div_shift, div_factor) = resolve_divisor(params[2]);

    let v = params[4] << WARPEDMODEL_PREC_BITS;
    let gamma0 = clip3(-32768, 32767, round2signed(v * div_factor, div_shift));

    let w = params[3] * params[4];
    let delta0 = clip3(
        -32768,
        32767,
        params[5] - round2signed(w * div_factor, div_shift) - one,
    );

    let reduce = |x: i64| round2signed(x, WARP_PARAM_REDUCE_BITS) << WARP_PARAM_REDUCE_BITS;
    let alpha = reduce(alpha0);
    let beta = reduce(beta0);
    let gamma = reduce(gamma0);
    let delta = reduce(delta0);

    4 * alpha.abs() + 7 * beta.abs() < one && 4 * gamma.abs() + 4 * delta.abs() < one
}
