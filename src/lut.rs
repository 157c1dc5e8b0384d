//! Depth look-up tables and the fixed-point pixel/world coordinate projection.
//!
//! The camera reports depth as an 11-bit sample in `[0, 2047]`; 2047 means "out
//! of range". `DEPTH_LUT` turns a sample into world-space millimetres, and
//! `SURFACE_LUT` turns it into the world-space area (mm^2) a single pixel
//! covers at that distance. Both are filled once at startup and never change.

use lazy_static::lazy_static;

/// Horizontal/vertical frame size the whole daemon assumes.
pub const FRAME_W: usize = 640;
pub const FRAME_H: usize = 480;
pub const FRAME_PIXELS: usize = FRAME_W * FRAME_H;

/// Raw depth value meaning "no return".
pub const OUT_OF_RANGE: u16 = 2047;

/// Largest meaningful entry in the depth LUT; also the max of px_zmin/px_zmax.
pub const PXZMAX: usize = 1092;

/// Packed 11-bit depth frame size in bytes (640*480*11/8).
pub const DEPTH_FRAME_BYTES: usize = FRAME_PIXELS * 11 / 8;

/// Raw Bayer video frame size in bytes.
pub const VIDEO_FRAME_BYTES: usize = FRAME_PIXELS;

struct Tables {
    depth: [i32; 2048],
    surface: [f32; 2048],
}

fn build_tables() -> Tables {
    let mut depth = [0i32; 2048];
    let mut surface = [0f32; 2048];
    for (i, (d, s)) in depth.iter_mut().zip(surface.iter_mut()).enumerate() {
        let mm = 1000.0_f32 * 0.1236 * (i as f32 / 2842.5 + 1.1863).tan();
        *d = mm as i32;
        *s = surface_area(mm);
    }
    Tables { depth, surface }
}

lazy_static! {
    static ref TABLES: Tables = build_tables();
}

/// World-space millimetres for raw depth sample `d` (d is clamped to 0..2047).
pub fn depth_lut(d: u16) -> i32 {
    TABLES.depth[d.min(2047) as usize]
}

/// World-space mm^2 a single pixel covers at the distance raw sample `d` maps to.
pub fn surface_lut(d: u16) -> f32 {
    TABLES.surface[d.min(2047) as usize]
}

/// Area in mm^2 of a single pixel at distance `z` millimetres. Same formula
/// used to fill `SURFACE_LUT`, exposed separately since the scanner needs it
/// for an already-averaged world-space z rather than a raw sample.
pub fn surface_area(z: f32) -> f32 {
    // 2.760888e-6 ~= (tan(28 deg) / 320)^2
    z * z * 2.760888e-6
}

/// tan(28 degrees) expressed as a 2048ths fixed-point fraction, used for the
/// integer projection formulas below so the scan's inner loop never touches
/// floating point.
const TAN28_NUM: i64 = 1089;
const TAN28_DEN: i64 = 2048;

/// x_px to y_px axis offset: (640-480)/2, lets yworld reuse xworld's formula.
const Y_OFFSET: i32 = 80;

/// World-space X (mm) of pixel column `x_px` at world depth `z_mm`.
///
/// `xworld(x, z) = round(z * (320 - x) * tan28 / 320)`. Matches the reference
/// daemon's fixed-point formula to within +-1mm.
pub fn xworld(x_px: i32, z_mm: i32) -> i32 {
    let num = (z_mm as i64) * ((320 - x_px) as i64) * TAN28_NUM;
    round_div(num, 320 * TAN28_DEN)
}

pub fn yworld(y_px: i32, z_mm: i32) -> i32 {
    xworld(y_px + Y_OFFSET, z_mm)
}

/// Inverse of `xworld`: screen column for world X at world depth `z_mm`.
pub fn xscreen(x_mm: i32, z_mm: i32) -> i32 {
    if z_mm == 0 {
        return 320;
    }
    let num = (x_mm as i64) * 320 * TAN28_DEN;
    320 - round_div(num, (z_mm as i64) * TAN28_NUM)
}

pub fn yscreen(y_mm: i32, z_mm: i32) -> i32 {
    xscreen(y_mm, z_mm) - Y_OFFSET
}

fn round_div(num: i64, den: i64) -> i32 {
    if (num < 0) != (den < 0) {
        ((num - den / 2) / den) as i32
    } else {
        ((num + den / 2) / den) as i32
    }
}

/// Largest raw index `d` with `depth_lut(d) <= zw`. Binary search seeded at
/// the table's midpoint (546, with the valid range capped at PXZMAX), then a
/// single-step correction for the truncation binary search alone can't fix.
pub fn reverse_lut(zw: i32) -> u16 {
    let mut idx: i32 = 546;
    let mut off: i32 = 273;

    while off > 0 && TABLES.depth[idx as usize] != zw {
        if TABLES.depth[idx as usize] > zw {
            idx -= off;
        } else {
            idx += off;
        }
        off >>= 1;
    }

    while idx > 0 && TABLES.depth[idx as usize] > zw {
        idx -= 1;
    }
    while (idx as usize) <= PXZMAX && TABLES.depth[(idx + 1) as usize] < zw {
        idx += 1;
    }

    idx as u16
}

/// Unpacks the `p`-th 11-bit sample from a packed-11-bit depth frame.
///
/// Eleven bits per pixel, MSB-first, read through a sliding big-endian
/// 32-bit window starting at byte `p*11/8`.
pub fn pxval_11(buf: &[u8], p: usize) -> u16 {
    let byte_off = p * 11 / 8;
    let word = u32::from_be_bytes([buf[byte_off], buf[byte_off + 1], buf[byte_off + 2], buf[byte_off + 3]]);
    let shift = (7 + p * 5) & 7;
    ((word >> (shift + 14)) & 0x7FF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_lut_is_left_inverse_of_depth_lut() {
        for d in 0..=PXZMAX as u16 {
            let zw = depth_lut(d);
            assert_eq!(reverse_lut(zw), d, "round-trip failed for raw index {d}");
        }
    }

    #[test]
    fn depth_lut_is_monotonic() {
        for d in 1..2048u16 {
            assert!(depth_lut(d) >= depth_lut(d - 1));
        }
    }

    #[test]
    fn xworld_matches_reference_within_one_mm() {
        // Reference float formula for comparison.
        let reference = |x: i32, z: i32| -> i32 {
            let tan28 = (28.0_f32).to_radians().tan();
            (z as f32 * (320.0 - x as f32) * tan28 / 320.0).round() as i32
        };
        for &z in &[200, 1000, 4000, 10000] {
            for x in (0..640).step_by(37) {
                let got = xworld(x, z);
                let want = reference(x, z);
                assert!((got - want).abs() <= 1, "x={x} z={z} got={got} want={want}");
            }
        }
    }

    #[test]
    fn yworld_reuses_xworld_with_axis_offset() {
        assert_eq!(yworld(10, 2000), xworld(90, 2000));
    }

    #[test]
    fn pxval_11_unpacks_packed_samples() {
        // All-1s buffer -> every 11-bit field reads as 0x7FF regardless of alignment.
        let buf = [0xFFu8; DEPTH_FRAME_BYTES];
        for p in [0usize, 1, 7, 8, 639, 4000] {
            assert_eq!(pxval_11(&buf, p), 0x7FF);
        }

        // All-zero buffer decodes to zero everywhere.
        let buf = [0u8; DEPTH_FRAME_BYTES];
        assert_eq!(pxval_11(&buf, 100), 0);
    }
}
