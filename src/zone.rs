//! The zone list: a shared, lock-guarded collection of world-space boxes plus
//! the per-pixel depth-bounds cache the scanner uses to prune zone checks.
//!
//! Callers take the list's mutex once and drive every mutation or scan
//! through the guard; there is no separate "_nolock" family here the way the
//! reference C daemon needed one; a `MutexGuard<ZoneList>` already gives
//! exclusive access for as long as it's held.

use crate::lut::{FRAME_H, FRAME_W, PXZMAX};
use std::fmt;

pub const ZONE_NAME_MAX: usize = 127;

/// Which per-frame quantity drives a zone's occupancy hysteresis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Param {
    Pop,
    Sa,
    Bright,
    Xc,
    Yc,
    Zc,
}

impl Param {
    pub const ALL: [Param; 6] = [Param::Pop, Param::Sa, Param::Bright, Param::Xc, Param::Yc, Param::Zc];

    pub fn as_str(self) -> &'static str {
        match self {
            Param::Pop => "pop",
            Param::Sa => "sa",
            Param::Bright => "bright",
            Param::Xc => "xc",
            Param::Yc => "yc",
            Param::Zc => "zc",
        }
    }

    pub fn parse(s: &str) -> Option<Param> {
        Param::ALL.into_iter().find(|p| p.as_str() == s)
    }

    /// (min, max, default rising threshold, default falling threshold).
    fn range(self) -> ParamRange {
        match self {
            Param::Pop => ParamRange { min: 0, max: (FRAME_W * FRAME_H) as i32, def_rising: 160, def_falling: 140 },
            Param::Sa => ParamRange { min: 0, max: (FRAME_W * FRAME_H * 150) as i32, def_rising: 3000, def_falling: 1000 },
            Param::Bright => ParamRange { min: 0, max: 1000, def_rising: 350, def_falling: 150 },
            Param::Xc | Param::Yc | Param::Zc => ParamRange { min: 0, max: 1000, def_rising: 600, def_falling: 400 },
        }
    }
}

struct ParamRange {
    min: i32,
    max: i32,
    def_rising: i32,
    def_falling: i32,
}

/// An axis-aligned box in world-space millimetres, its cached screen-space
/// projection, and the transient statistics the scanner refreshes every frame.
#[derive(Clone, Debug)]
pub struct Zone {
    pub name: String,

    pub xmin: i32,
    pub xmax: i32,
    pub ymin: i32,
    pub ymax: i32,
    pub zmin: i32,
    pub zmax: i32,

    pub px_xmin: i32,
    pub px_xmax: i32,
    pub px_ymin: i32,
    pub px_ymax: i32,
    pub px_zmin: i32,
    pub px_zmax: i32,

    pub param: Param,
    pub rising_threshold: i32,
    pub falling_threshold: i32,
    pub rising_delay: i32,
    pub falling_delay: i32,
    pub negate: bool,

    pub pop: i32,
    pub xsum: i64,
    pub ysum: i64,
    pub zsum: i64,
    pub bsum: i64,
    pub maxpop: i32,

    pub lastpop: i32,
    pub lastoccupied: bool,
    pub occupied: bool,
    pub count: i32,
    pub new_zone: bool,
}

/// Errors reported back to a zone-protocol client as `ERR - ...` text.
#[derive(Debug, Clone)]
pub enum ZoneError {
    InvalidName(String),
    DuplicateName(String),
    NotFound(String),
    InvertedBounds,
    NonPositiveZ,
    Message(String),
}

impl fmt::Display for ZoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneError::InvalidName(n) => write!(f, "Invalid zone name: {n:?}."),
            ZoneError::DuplicateName(n) => write!(f, "A zone named \"{n}\" already exists."),
            ZoneError::NotFound(n) => write!(f, "No zone named \"{n}\" was found."),
            ZoneError::InvertedBounds => write!(f, "Minimum must be < maximum."),
            ZoneError::NonPositiveZ => write!(f, "Z must be > 0.0."),
            ZoneError::Message(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for ZoneError {}

fn validate_name(name: &str) -> Result<(), ZoneError> {
    if name.is_empty() || name.len() > ZONE_NAME_MAX {
        return Err(ZoneError::InvalidName(name.to_string()));
    }
    if name.contains(['\r', '\n', '\t', ',']) {
        return Err(ZoneError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn clamp(v: i32, min: i32, max: i32) -> i32 {
    v.max(min).min(max)
}

impl Zone {
    fn new(name: String, xmin: i32, ymin: i32, zmin: i32, xmax: i32, ymax: i32, zmax: i32) -> Zone {
        let mut z = Zone {
            name,
            xmin,
            xmax,
            ymin,
            ymax,
            zmin,
            zmax,
            px_xmin: 0,
            px_xmax: 0,
            px_ymin: 0,
            px_ymax: 0,
            px_zmin: 0,
            px_zmax: 0,
            param: Param::Pop,
            rising_threshold: Param::Pop.range().def_rising,
            falling_threshold: Param::Pop.range().def_falling,
            rising_delay: 1,
            falling_delay: 1,
            negate: false,
            pop: 0,
            xsum: 0,
            ysum: 0,
            zsum: 0,
            bsum: 0,
            maxpop: 1,
            lastpop: -1,
            lastoccupied: false,
            occupied: false,
            count: 0,
            new_zone: true,
        };
        z.recalc_screen_from_world();
        z.reset_transient();
        z
    }

    /// Published occupancy, inverted by `negate` without touching the
    /// internal state the hysteresis machinery uses.
    pub fn published_occupied(&self) -> bool {
        self.occupied ^ self.negate
    }

    fn reset_transient(&mut self) {
        self.pop = 0;
        self.xsum = 0;
        self.ysum = 0;
        self.zsum = 0;
        self.bsum = 0;
        self.lastpop = -1;
        self.occupied = false;
        self.count = 0;
        self.new_zone = true;
        self.recalc_maxpop();
    }

    fn recalc_maxpop(&mut self) {
        let area = (self.px_xmax - self.px_xmin) * (self.px_ymax - self.px_ymin);
        self.maxpop = area.max(1);
    }

    /// World bounds changed: recompute the cached screen bounds.
    pub fn recalc_screen_from_world(&mut self) {
        let x0 = crate::lut::xscreen(self.xmin, self.zmin);
        let x1 = crate::lut::xscreen(self.xmax, self.zmin);
        self.px_xmin = clamp(x0.min(x1), 0, FRAME_W as i32 - 1);
        self.px_xmax = clamp(x0.max(x1), 0, FRAME_W as i32 - 1);

        let y0 = crate::lut::yscreen(self.ymin, self.zmin);
        let y1 = crate::lut::yscreen(self.ymax, self.zmin);
        self.px_ymin = clamp(y0.min(y1), 0, FRAME_H as i32 - 1);
        self.px_ymax = clamp(y0.max(y1), 0, FRAME_H as i32 - 1);

        self.px_zmin = clamp(crate::lut::reverse_lut(self.zmin) as i32, 0, PXZMAX as i32);
        self.px_zmax = clamp(crate::lut::reverse_lut(self.zmax) as i32, 0, PXZMAX as i32);
        self.recalc_maxpop();
    }

    /// Screen bounds changed: recompute the cached world bounds.
    pub fn recalc_world_from_screen(&mut self) {
        let zmin = crate::lut::depth_lut(self.px_zmin as u16);
        let zmax = crate::lut::depth_lut(self.px_zmax as u16);
        self.zmin = zmin;
        self.zmax = zmax;

        self.xmin = crate::lut::xworld(self.px_xmax, zmin).min(crate::lut::xworld(self.px_xmin, zmin));
        self.xmax = crate::lut::xworld(self.px_xmin, zmin).max(crate::lut::xworld(self.px_xmax, zmin));
        self.ymin = crate::lut::yworld(self.px_ymax, zmin).min(crate::lut::yworld(self.px_ymin, zmin));
        self.ymax = crate::lut::yworld(self.px_ymin, zmin).max(crate::lut::yworld(self.px_ymax, zmin));
        self.recalc_maxpop();
    }

    /// Centre of gravity along one axis, 0..1000, or -1 when unpopulated.
    fn cog(sum: i64, pop: i32, min: i32, max: i32) -> i32 {
        if pop <= 0 {
            return -1;
        }
        let avg = sum / pop as i64;
        (((avg - min as i64) * 1000) / (max - min) as i64) as i32
    }

    pub fn xc(&self) -> i32 {
        Zone::cog(self.xsum, self.pop, self.xmin, self.xmax)
    }
    pub fn yc(&self) -> i32 {
        Zone::cog(self.ysum, self.pop, self.ymin, self.ymax)
    }
    pub fn zc(&self) -> i32 {
        Zone::cog(self.zsum, self.pop, self.zmin, self.zmax)
    }

    pub fn surface_area(&self) -> i32 {
        if self.pop <= 0 {
            return 0;
        }
        let avg_z = (self.zsum / self.pop as i64) as f32;
        (self.pop as f32 * crate::lut::surface_area(avg_z)) as i32
    }

    pub fn bright(&self) -> i32 {
        ((self.bsum * 256) / self.maxpop.max(1) as i64) as i32
    }

    /// The value that drives this zone's occupancy hysteresis this frame.
    pub fn param_value(&self) -> i32 {
        match self.param {
            Param::Pop => self.pop,
            Param::Sa => self.surface_area(),
            Param::Bright => self.bright() as i32,
            Param::Xc => self.xc(),
            Param::Yc => self.yc(),
            Param::Zc => self.zc(),
        }
    }

    /// Advances the hysteresis state machine for the value computed this
    /// frame. Returns true if `occupied` flipped.
    pub fn update_occupancy(&mut self) -> bool {
        let allow_when_unpopulated = matches!(self.param, Param::Bright);
        let populated = self.pop > 0 || allow_when_unpopulated;

        let value = self.param_value();
        let candidate = populated
            && if self.occupied {
                value >= self.falling_threshold
            } else {
                value >= self.rising_threshold
            };

        if candidate == self.occupied {
            self.count = 0;
            return false;
        }

        self.count += 1;
        let delay = if self.occupied { self.falling_delay } else { self.rising_delay };
        if self.count > delay {
            self.occupied = candidate;
            self.count = 0;
            return true;
        }
        false
    }

    fn set_param(&mut self, param: Param) {
        self.param = param;
        let r = param.range();
        self.rising_threshold = r.def_rising;
        self.falling_threshold = r.def_falling;
        self.occupied = false;
        self.count = 0;
    }
}

/// Mutable attribute addressed by `setzone name,attr,value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attr {
    Xmin,
    Xmax,
    Ymin,
    Ymax,
    Zmin,
    Zmax,
    PxXmin,
    PxXmax,
    PxYmin,
    PxYmax,
    PxZmin,
    PxZmax,
    Negate,
    Param,
    OnLevel,
    OffLevel,
    OnDelay,
    OffDelay,
}

impl Attr {
    pub fn parse(s: &str) -> Option<Attr> {
        Some(match s {
            "xmin" => Attr::Xmin,
            "xmax" => Attr::Xmax,
            "ymin" => Attr::Ymin,
            "ymax" => Attr::Ymax,
            "zmin" => Attr::Zmin,
            "zmax" => Attr::Zmax,
            "px_xmin" => Attr::PxXmin,
            "px_xmax" => Attr::PxXmax,
            "px_ymin" => Attr::PxYmin,
            "px_ymax" => Attr::PxYmax,
            "px_zmin" => Attr::PxZmin,
            "px_zmax" => Attr::PxZmax,
            "negate" => Attr::Negate,
            "param" => Attr::Param,
            "on_level" => Attr::OnLevel,
            "off_level" => Attr::OffLevel,
            "on_delay" => Attr::OnDelay,
            "off_delay" => Attr::OffDelay,
            _ => return None,
        })
    }
}

enum Recalc {
    Screen,
    World,
    None,
}

/// Summary returned by `peak()`.
pub struct PeakZone {
    pub name: String,
    pub index: usize,
    pub pop: i32,
    pub maxpop: i32,
}

/// The shared collection of zones plus the cached per-pixel depth-bounds map
/// the scanner uses to skip zone checks for pixels no zone could cover.
pub struct ZoneList {
    zones: Vec<Zone>,
    version: u32,
    pub xskip: i32,
    pub yskip: i32,
    depth_map_min: Vec<u16>,
    depth_map_max: Vec<u16>,
    pub zone_map_dirty: bool,
    pub max_zone: Option<usize>,
    pub occupied: i32,
    pub oor_total: i64,
}

impl ZoneList {
    pub fn new(xskip: i32, yskip: i32) -> ZoneList {
        ZoneList {
            zones: Vec::new(),
            version: 0,
            xskip,
            yskip,
            depth_map_min: vec![u16::MAX; FRAME_W * FRAME_H],
            depth_map_max: vec![0; FRAME_W * FRAME_H],
            zone_map_dirty: true,
            max_zone: None,
            occupied: 0,
            oor_total: 0,
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zones_mut(&mut self) -> &mut [Zone] {
        &mut self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn bump(&mut self) {
        self.zone_map_dirty = true;
        if self.version == 0xFFFFFFFF {
            self.version = 0;
        } else {
            self.version += 1;
        }
    }

    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.zones.iter().position(|z| z.name == name)
    }

    pub fn find(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name == name)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.zones.iter().any(|z| z.name.eq_ignore_ascii_case(name))
    }

    pub fn add(
        &mut self,
        name: &str,
        xmin: i32,
        ymin: i32,
        zmin: i32,
        xmax: i32,
        ymax: i32,
        zmax: i32,
    ) -> Result<(), ZoneError> {
        validate_name(name)?;
        if xmin >= xmax || ymin >= ymax || zmin >= zmax {
            return Err(ZoneError::InvertedBounds);
        }
        if zmin <= 0 || zmax <= 0 {
            return Err(ZoneError::NonPositiveZ);
        }
        if self.name_taken(name) {
            return Err(ZoneError::DuplicateName(name.to_string()));
        }

        self.zones.push(Zone::new(name.to_string(), xmin, ymin, zmin, xmax, ymax, zmax));
        self.bump();
        Ok(())
    }

    pub fn set(
        &mut self,
        name: &str,
        xmin: i32,
        ymin: i32,
        zmin: i32,
        xmax: i32,
        ymax: i32,
        zmax: i32,
    ) -> Result<(), ZoneError> {
        if xmin >= xmax || ymin >= ymax || zmin >= zmax {
            return Err(ZoneError::InvertedBounds);
        }
        if zmin <= 0 || zmax <= 0 {
            return Err(ZoneError::NonPositiveZ);
        }
        let idx = self.find_index(name).ok_or_else(|| ZoneError::NotFound(name.to_string()))?;
        let z = &mut self.zones[idx];
        z.xmin = xmin;
        z.xmax = xmax;
        z.ymin = ymin;
        z.ymax = ymax;
        z.zmin = zmin;
        z.zmax = zmax;
        z.recalc_screen_from_world();
        z.reset_transient();
        self.bump();
        Ok(())
    }

    pub fn set_attr(&mut self, name: &str, attr: Attr, value: &str) -> Result<(), ZoneError> {
        let idx = self.find_index(name).ok_or_else(|| ZoneError::NotFound(name.to_string()))?;
        let z = &mut self.zones[idx];

        let recalc = Self::apply_attr(z, attr, value)?;
        match recalc {
            Recalc::Screen => z.recalc_screen_from_world(),
            Recalc::World => z.recalc_world_from_screen(),
            Recalc::None => {}
        }
        z.recalc_maxpop();
        z.new_zone = true;
        self.bump();
        Ok(())
    }

    fn apply_attr(z: &mut Zone, attr: Attr, value: &str) -> Result<Recalc, ZoneError> {
        let int_val = || value.trim().parse::<i32>().map_err(|_| ZoneError::Message(format!("Invalid integer: {value:?}")));

        Ok(match attr {
            Attr::Xmin => {
                z.xmin = int_val()?;
                if z.xmin >= z.xmax {
                    z.xmax = z.xmin + 1;
                }
                Recalc::Screen
            }
            Attr::Xmax => {
                z.xmax = int_val()?;
                if z.xmax <= z.xmin {
                    z.xmin = z.xmax - 1;
                }
                Recalc::Screen
            }
            Attr::Ymin => {
                z.ymin = int_val()?;
                if z.ymin >= z.ymax {
                    z.ymax = z.ymin + 1;
                }
                Recalc::Screen
            }
            Attr::Ymax => {
                z.ymax = int_val()?;
                if z.ymax <= z.ymin {
                    z.ymin = z.ymax - 1;
                }
                Recalc::Screen
            }
            Attr::Zmin => {
                let v = int_val()?;
                if v <= 0 {
                    return Err(ZoneError::Message("Zmin must be > 0.0.".to_string()));
                }
                z.zmin = v;
                if z.zmin >= z.zmax {
                    z.zmax = z.zmin + 1;
                }
                Recalc::Screen
            }
            Attr::Zmax => {
                let v = int_val()?;
                if v <= 1 {
                    return Err(ZoneError::Message("Zmax must be > 0.001.".to_string()));
                }
                z.zmax = v;
                if z.zmax <= z.zmin {
                    z.zmin = z.zmax - 1;
                }
                Recalc::Screen
            }
            Attr::PxXmin => {
                let v = int_val()?;
                if !(0..=(FRAME_W as i32 - 2)).contains(&v) {
                    return Err(ZoneError::Message(format!("px_xmin must be between 0 and {}", FRAME_W - 2)));
                }
                z.px_xmin = v;
                if z.px_xmin >= z.px_xmax {
                    z.px_xmax = z.px_xmin + 1;
                }
                Recalc::World
            }
            Attr::PxXmax => {
                let v = int_val()?;
                if !(1..=(FRAME_W as i32 - 1)).contains(&v) {
                    return Err(ZoneError::Message(format!("px_xmax must be between 1 and {}", FRAME_W - 1)));
                }
                z.px_xmax = v;
                if z.px_xmax <= z.px_xmin {
                    z.px_xmin = z.px_xmax - 1;
                }
                Recalc::World
            }
            Attr::PxYmin => {
                let v = int_val()?;
                if !(0..=(FRAME_H as i32 - 2)).contains(&v) {
                    return Err(ZoneError::Message(format!("px_ymin must be between 0 and {}", FRAME_H - 2)));
                }
                z.px_ymin = v;
                if z.px_ymin >= z.px_ymax {
                    z.px_ymax = z.px_ymin + 1;
                }
                Recalc::World
            }
            Attr::PxYmax => {
                let v = int_val()?;
                if !(1..=(FRAME_H as i32 - 1)).contains(&v) {
                    return Err(ZoneError::Message(format!("px_ymax must be between 1 and {}", FRAME_H - 1)));
                }
                z.px_ymax = v;
                if z.px_ymax <= z.px_ymin {
                    z.px_ymin = z.px_ymax - 1;
                }
                Recalc::World
            }
            Attr::PxZmin => {
                let v = int_val()?;
                if !(0..=PXZMAX as i32).contains(&v) {
                    return Err(ZoneError::Message(format!("px_zmin must be between 0 and {PXZMAX}")));
                }
                z.px_zmin = v;
                if z.px_zmin >= z.px_zmax {
                    z.px_zmax = (z.px_zmin + 1).min(PXZMAX as i32);
                }
                Recalc::World
            }
            Attr::PxZmax => {
                let v = int_val()?;
                if !(0..=PXZMAX as i32).contains(&v) {
                    return Err(ZoneError::Message(format!("px_zmax must be between 0 and {PXZMAX}")));
                }
                z.px_zmax = v;
                if z.px_zmax <= z.px_zmin {
                    z.px_zmin = (z.px_zmax - 1).max(0);
                }
                Recalc::World
            }
            Attr::Negate => {
                let v = int_val()?;
                if v != 0 && v != 1 {
                    return Err(ZoneError::Message("negate must be 0 or 1".to_string()));
                }
                z.negate = v == 1;
                z.occupied = z.negate;
                Recalc::None
            }
            Attr::Param => {
                let p = Param::parse(value.trim()).ok_or_else(|| ZoneError::Message(format!("Unknown param: {value:?}")))?;
                z.set_param(p);
                Recalc::None
            }
            Attr::OnLevel => {
                let r = z.param.range();
                z.rising_threshold = clamp(int_val()?, r.min, r.max);
                if z.falling_threshold > z.rising_threshold {
                    z.falling_threshold = z.rising_threshold;
                }
                Recalc::None
            }
            Attr::OffLevel => {
                let r = z.param.range();
                z.falling_threshold = clamp(int_val()?, r.min, r.max);
                if z.rising_threshold < z.falling_threshold {
                    z.rising_threshold = z.falling_threshold;
                }
                Recalc::None
            }
            Attr::OnDelay => {
                z.rising_delay = int_val()?.max(0);
                Recalc::None
            }
            Attr::OffDelay => {
                z.falling_delay = int_val()?.max(0);
                Recalc::None
            }
        })
    }

    pub fn rm(&mut self, name: &str) -> Result<Zone, ZoneError> {
        let idx = self.find_index(name).ok_or_else(|| ZoneError::NotFound(name.to_string()))?;
        let z = self.zones.remove(idx);
        self.bump();
        Ok(z)
    }

    pub fn clear(&mut self) {
        self.zones.clear();
        self.bump();
    }

    /// Resets `lastpop`/`lastoccupied`/`new_zone` after fan-out has seen the
    /// current frame's deltas.
    pub fn touch(&mut self) {
        for z in &mut self.zones {
            z.lastpop = z.pop;
            z.lastoccupied = z.occupied;
            z.new_zone = false;
        }
    }

    pub fn occupied_count(&self) -> usize {
        self.zones.iter().filter(|z| z.occupied).count()
    }

    pub fn peak(&self) -> Option<PeakZone> {
        let idx = self.max_zone?;
        let z = self.zones.get(idx)?;
        Some(PeakZone { name: z.name.clone(), index: idx, pop: z.pop, maxpop: z.maxpop })
    }

    /// Rebuilds the per-pixel [min(px_zmin), max(px_zmax)] cache from the
    /// current zone set. Pixels no zone covers get `[u16::MAX, 0]`, which
    /// fails every depth-sample range test in the scanner.
    pub fn rebuild_depth_map(&mut self) {
        self.depth_map_min.fill(u16::MAX);
        self.depth_map_max.fill(0);

        for z in &self.zones {
            for y in z.px_ymin..=z.px_ymax {
                let row = y as usize * FRAME_W;
                for x in z.px_xmin..=z.px_xmax {
                    let p = row + x as usize;
                    let min_cell = &mut self.depth_map_min[p];
                    if (z.px_zmin as u16) < *min_cell {
                        *min_cell = z.px_zmin as u16;
                    }
                    let max_cell = &mut self.depth_map_max[p];
                    if (z.px_zmax as u16) > *max_cell {
                        *max_cell = z.px_zmax as u16;
                    }
                }
            }
        }
        self.zone_map_dirty = false;
    }

    /// `[min, max]` raw-depth bound covering pixel `p`, or `None` if no zone
    /// covers it at all.
    pub fn depth_bounds(&self, p: usize) -> (u16, u16) {
        (self.depth_map_min[p], self.depth_map_max[p])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> ZoneList {
        ZoneList::new(2, 2)
    }

    #[test]
    fn add_rejects_inverted_bounds() {
        let mut l = list();
        let err = l.add("a", 100, 0, 500, -100, 100, 1500).unwrap_err();
        assert!(matches!(err, ZoneError::InvertedBounds));
    }

    #[test]
    fn add_rejects_non_positive_z() {
        let mut l = list();
        let err = l.add("a", -100, -100, 0, 100, 100, 1500).unwrap_err();
        assert!(matches!(err, ZoneError::NonPositiveZ));
    }

    #[test]
    fn add_rejects_duplicate_name_case_insensitive() {
        let mut l = list();
        l.add("Foo", -100, -100, 500, 100, 100, 1500).unwrap();
        let err = l.add("foo", -100, -100, 500, 100, 100, 1500).unwrap_err();
        assert!(matches!(err, ZoneError::DuplicateName(_)));
    }

    #[test]
    fn find_is_case_sensitive_despite_case_insensitive_uniqueness() {
        let mut l = list();
        l.add("Foo", -100, -100, 500, 100, 100, 1500).unwrap();
        assert!(l.find("Foo").is_some());
        assert!(l.find("foo").is_none());
    }

    #[test]
    fn add_rejects_bad_characters_and_overlong_names() {
        let mut l = list();
        assert!(l.add("bad,name", -100, -100, 500, 100, 100, 1500).is_err());
        let long = "x".repeat(200);
        assert!(l.add(&long, -100, -100, 500, 100, 100, 1500).is_err());
    }

    #[test]
    fn version_bumps_on_every_mutation_and_wraps() {
        let mut l = list();
        assert_eq!(l.version(), 0);
        l.add("a", -100, -100, 500, 100, 100, 1500).unwrap();
        assert_eq!(l.version(), 1);
        l.version = 0xFFFFFFFF;
        l.add("b", -100, -100, 500, 100, 100, 1500).unwrap();
        assert_eq!(l.version(), 0);
    }

    #[test]
    fn negate_inverts_published_occupied_without_changing_internal_state() {
        let mut l = list();
        l.add("a", -100, -100, 500, 100, 100, 1500).unwrap();
        l.set_attr("a", Attr::Negate, "1").unwrap();
        let z = l.find("a").unwrap();
        assert!(z.occupied);
        assert!(!z.published_occupied());
    }

    #[test]
    fn on_level_below_off_level_drags_off_level_down() {
        let mut l = list();
        l.add("a", -100, -100, 500, 100, 100, 1500).unwrap();
        l.set_attr("a", Attr::OffLevel, "150").unwrap();
        l.set_attr("a", Attr::OnLevel, "100").unwrap();
        let z = l.find("a").unwrap();
        assert_eq!(z.rising_threshold, 100);
        assert_eq!(z.falling_threshold, 100);
    }

    #[test]
    fn set_attr_on_missing_zone_reports_not_found() {
        let mut l = list();
        let err = l.set_attr("ghost", Attr::Xmin, "0").unwrap_err();
        assert!(matches!(err, ZoneError::NotFound(_)));
    }

    #[test]
    fn touch_resets_deltas() {
        let mut l = list();
        l.add("a", -100, -100, 500, 100, 100, 1500).unwrap();
        l.zones_mut()[0].pop = 42;
        l.zones_mut()[0].occupied = true;
        l.touch();
        let z = l.find("a").unwrap();
        assert_eq!(z.lastpop, 42);
        assert!(z.lastoccupied);
        assert!(!z.new_zone);
    }

    #[test]
    fn rm_removes_and_shifts() {
        let mut l = list();
        l.add("a", -100, -100, 500, 100, 100, 1500).unwrap();
        l.add("b", -100, -100, 500, 100, 100, 1500).unwrap();
        l.rm("a").unwrap();
        assert_eq!(l.len(), 1);
        assert_eq!(l.zones()[0].name, "b");
    }

    #[test]
    fn occupied_zone_deoccupies_once_the_subject_leaves() {
        let mut l = list();
        l.add("a", -100, -100, 500, 100, 100, 1500).unwrap();
        let z = &mut l.zones_mut()[0];
        z.rising_delay = 0;
        z.falling_delay = 0;
        z.pop = z.rising_threshold + 10;
        assert!(z.update_occupancy());
        assert!(z.occupied);

        // The subject leaves: pop drops to zero for a non-bright param.
        z.pop = 0;
        assert!(z.update_occupancy());
        assert!(!z.occupied);
    }
}
