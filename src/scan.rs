//! Per-frame zone scanning: turns a raw depth or video frame into updated
//! per-zone statistics, using the zone list's cached screen bounds and
//! per-pixel depth-range map to skip work for pixels no zone can see.

use crate::lut::{self, FRAME_H, FRAME_W, OUT_OF_RANGE};
use crate::zone::ZoneList;

/// Outcome of a depth scan: which zones flipped occupancy and how many
/// decimated samples this frame fell entirely outside every zone's depth
/// range (counted whether or not the pixel also falls inside a zone's
/// screen rectangle).
pub struct DepthScanResult {
    pub flipped: Vec<usize>,
    pub oor_this_frame: i64,
}

/// Walks the depth frame at the zone list's x/y decimation stride, accumulates
/// per-zone pop/xsum/ysum/zsum, then runs the occupancy hysteresis for every
/// zone. `buf` must be a packed-11-bit frame of `lut::DEPTH_FRAME_BYTES`.
pub fn update_zonelist_depth(zones: &mut ZoneList, buf: &[u8]) -> DepthScanResult {
    if zones.zone_map_dirty {
        zones.rebuild_depth_map();
    }

    for z in zones.zones_mut() {
        z.pop = 0;
        z.xsum = 0;
        z.ysum = 0;
        z.zsum = 0;
    }

    let xskip = zones.xskip.max(1);
    let yskip = zones.yskip.max(1);
    let skip = xskip * yskip;
    let skip64 = skip as i64;
    let mut oor_this_frame = 0i64;

    let mut y = 0i32;
    while (y as usize) < FRAME_H {
        let row = y as usize * FRAME_W;
        let mut x = 0i32;
        while (x as usize) < FRAME_W {
            let p = row + x as usize;
            let (lo, hi) = zones.depth_bounds(p);
            if lo > hi {
                x += xskip;
                continue;
            }

            let raw = lut::pxval_11(buf, p);
            if raw >= OUT_OF_RANGE {
                oor_this_frame += skip64;
                x += xskip;
                continue;
            }
            if raw < lo || raw > hi {
                x += xskip;
                continue;
            }

            let z_mm = lut::depth_lut(raw);
            let x_mm = lut::xworld(x, z_mm);
            let y_mm = lut::yworld(y, z_mm);

            for zone in zones.zones_mut() {
                if x < zone.px_xmin || x > zone.px_xmax || y < zone.px_ymin || y > zone.px_ymax {
                    continue;
                }
                if (raw as i32) < zone.px_zmin || (raw as i32) > zone.px_zmax {
                    continue;
                }
                if x_mm < zone.xmin || x_mm > zone.xmax || y_mm < zone.ymin || y_mm > zone.ymax {
                    continue;
                }
                zone.pop += skip;
                zone.xsum += skip64 * x_mm as i64;
                zone.ysum += skip64 * y_mm as i64;
                zone.zsum += skip64 * z_mm as i64;
            }

            x += xskip;
        }
        y += yskip;
    }

    zones.oor_total += oor_this_frame;

    let mut flipped = Vec::new();
    let mut max_zone = None;
    let mut max_sa = 0i32;
    for (idx, z) in zones.zones_mut().iter_mut().enumerate() {
        if z.update_occupancy() {
            flipped.push(idx);
        }
        let sa = z.surface_area();
        if sa > max_sa {
            max_sa = sa;
            max_zone = Some(idx);
        }
    }
    zones.max_zone = max_zone;
    zones.occupied = zones.occupied_count() as i32;

    DepthScanResult { flipped, oor_this_frame }
}

/// Accumulates brightness (green Bayer samples) over each zone's screen
/// rectangle. `buf` must be a raw Bayer frame of `lut::VIDEO_FRAME_BYTES`.
pub fn update_zonelist_video(zones: &mut ZoneList, buf: &[u8]) {
    for z in zones.zones_mut() {
        z.bsum = 0;
    }

    // GRBG Bayer: green samples sit at (even row, odd col) and (odd row, even col).
    for z in zones.zones_mut() {
        let mut sum = 0i64;
        for y in z.px_ymin..=z.px_ymax {
            if y < 0 || y as usize >= FRAME_H {
                continue;
            }
            let row = y as usize * FRAME_W;
            for x in z.px_xmin..=z.px_xmax {
                if x < 0 || x as usize >= FRAME_W {
                    continue;
                }
                let is_green = (y % 2 == 0 && x % 2 == 1) || (y % 2 == 1 && x % 2 == 0);
                if is_green {
                    sum += buf[row + x as usize] as i64;
                }
            }
        }
        z.bsum = sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ZoneList;

    fn flat_depth_buf(raw: u16) -> Vec<u8> {
        // Packs the same 11-bit value into every pixel slot.
        let mut buf = vec![0u8; lut::DEPTH_FRAME_BYTES];
        for p in 0..lut::FRAME_PIXELS {
            let bit_off = p * 11;
            for b in 0..11 {
                let bit = (raw >> (10 - b)) & 1;
                if bit == 1 {
                    let abs_bit = bit_off + b;
                    buf[abs_bit / 8] |= 1 << (7 - (abs_bit % 8));
                }
            }
        }
        buf
    }

    #[test]
    fn uniform_depth_frame_fills_zone_fully_when_in_range() {
        let mut zones = ZoneList::new(1, 1);
        // A zone straddling the centre at a depth whose raw encoding we control.
        let raw = 500u16;
        let z_mm = lut::depth_lut(raw);
        zones.add("z", -5000, -5000, (z_mm - 500).max(1), 5000, 5000, z_mm + 500).unwrap();

        let buf = flat_depth_buf(raw);
        let result = update_zonelist_depth(&mut zones, &buf);
        assert!(result.oor_this_frame == 0);
        let z = zones.find("z").unwrap();
        assert!(z.pop > 0, "expected nonzero population, got {}", z.pop);
    }

    #[test]
    fn out_of_range_samples_are_not_counted_in_any_zone() {
        let mut zones = ZoneList::new(1, 1);
        zones.add("z", -5000, -5000, 1, 5000, 5000, 8000).unwrap();
        let buf = flat_depth_buf(OUT_OF_RANGE);
        let result = update_zonelist_depth(&mut zones, &buf);
        assert!(result.oor_this_frame > 0);
        assert_eq!(zones.find("z").unwrap().pop, 0);
    }

    #[test]
    fn video_scan_accumulates_only_green_samples_in_zone_rect() {
        let mut zones = ZoneList::new(1, 1);
        zones.add("z", -100, -100, 500, 100, 100, 1500).unwrap();
        let buf = vec![10u8; lut::VIDEO_FRAME_BYTES];
        update_zonelist_video(&mut zones, &buf);
        let z = zones.find("z").unwrap();
        assert!(z.bsum > 0);
    }

    #[test]
    fn decimated_scan_scales_population_by_skip_factor() {
        let mut zones = ZoneList::new(2, 2);
        let raw = 500u16;
        let z_mm = lut::depth_lut(raw);
        zones.add("z", -5000, -5000, (z_mm - 500).max(1), 5000, 5000, z_mm + 500).unwrap();

        let buf = flat_depth_buf(raw);
        update_zonelist_depth(&mut zones, &buf);
        let z = zones.find("z").unwrap();
        // Every decimated sample stands in for xskip*yskip = 4 actual pixels.
        assert_eq!(z.pop % 4, 0);
        assert!(z.pop > 0);
    }

    #[test]
    fn max_zone_tracks_greatest_surface_area() {
        let mut zones = ZoneList::new(1, 1);
        let raw = 500u16;
        let z_mm = lut::depth_lut(raw);
        // A small zone and a much larger one at the same depth; the larger
        // one should become the tracked max_zone regardless of occupancy
        // thresholds.
        zones.add("small", -100, -100, (z_mm - 500).max(1), 100, 100, z_mm + 500).unwrap();
        zones.add("big", -5000, -5000, (z_mm - 500).max(1), 5000, 5000, z_mm + 500).unwrap();

        let buf = flat_depth_buf(raw);
        update_zonelist_depth(&mut zones, &buf);
        assert_eq!(zones.max_zone, Some(1));
    }

    #[test]
    fn depth_map_rebuild_is_skipped_when_clean() {
        let mut zones = ZoneList::new(1, 1);
        zones.add("z", -100, -100, 500, 100, 100, 1500).unwrap();
        let buf = flat_depth_buf(OUT_OF_RANGE);
        update_zonelist_depth(&mut zones, &buf);
        assert!(!zones.zone_map_dirty);
    }
}
