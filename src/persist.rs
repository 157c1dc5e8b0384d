//! Zone list persistence: loads and saves `zones.knd`, and runs a background
//! thread that periodically flushes the current zone set so a restart picks
//! up where the daemon left off.

use crate::zone::{Attr, Param, ZoneList};
use anyhow::{bail, Context};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ZONE_FORMAT: u32 = 5;
pub const ZONE_FILENAME: &str = "zones.knd";

/// 35-degree to 28-degree field-of-view rescale factor for X/Y bounds saved
/// by format versions older than 3: tan(28)/tan(35).
const FOV_RESCALE_35_TO_28: f64 = 0.759359765;

pub fn validate_save_dir(dir: &Path) -> anyhow::Result<()> {
    let meta = fs::metadata(dir).with_context(|| format!("{} does not exist", dir.display()))?;
    if !meta.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let probe = dir.join(".knd-write-probe");
    fs::write(&probe, b"").with_context(|| format!("{} is not writable", dir.display()))?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Atomically writes the current zone set: a versioned header line followed
/// by one CSV line per zone, written to a `.tmp` file, fsynced, then renamed
/// into place so a crash mid-write never corrupts the previous save.
pub fn save_zones(dir: &Path, zones: &ZoneList, tilt: i32) -> anyhow::Result<()> {
    let final_path = dir.join(ZONE_FILENAME);
    let tmp_path = dir.join(format!("{ZONE_FILENAME}.tmp"));

    let mut file = fs::File::create(&tmp_path).with_context(|| format!("creating {}", tmp_path.display()))?;
    writeln!(file, "{} {} {}", ZONE_FORMAT, tilt, zones.len())?;
    for z in zones.zones() {
        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            z.name,
            z.xmin,
            z.ymin,
            z.zmin,
            z.xmax,
            z.ymax,
            z.zmax,
            z.param.as_str(),
            z.rising_threshold,
            z.falling_threshold,
            z.rising_delay,
            z.falling_delay,
        )?;
    }
    file.flush()?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, &final_path).with_context(|| format!("renaming {} to {}", tmp_path.display(), final_path.display()))?;
    Ok(())
}

/// Loads a `zones.knd` file, dispatching on its header's format version for
/// backward compatibility with files written by older code. Returns the
/// saved tilt angle.
pub fn load_zones(path: &Path, zones: &mut ZoneList) -> anyhow::Result<i32> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut lines = text.lines();
    let header = lines.next().context("empty zones file")?;
    let mut header_fields = header.split_whitespace();
    let version: u32 = header_fields.next().context("missing version field")?.parse().context("invalid version field")?;
    let tilt: i32 = header_fields.next().unwrap_or("0").parse().unwrap_or(0);
    let _count: usize = header_fields.next().unwrap_or("0").parse().unwrap_or(0);

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = load_zone_line(zones, version, line) {
            log::warn!("skipping malformed zone line in {}: {e}", path.display());
        }
    }

    Ok(tilt)
}

fn load_zone_line(zones: &mut ZoneList, version: u32, line: &str) -> anyhow::Result<()> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.is_empty() {
        bail!("empty line");
    }
    let name = fields[0];

    if version >= 5 {
        if fields.len() < 12 {
            bail!("expected 12 fields for format version 5, got {}", fields.len());
        }
        let [xmin, ymin, zmin, xmax, ymax, zmax] = parse_ints(&fields[1..7])?;
        zones.add(name, xmin, ymin, zmin, xmax, ymax, zmax)?;
        apply_hysteresis_fields(zones, name, &fields[7..12])?;
        return Ok(());
    }

    // Versions 1-4 stored bounds as metres (float) rather than millimetres
    // (int), and versions before 3 assumed a 35-degree field of view for the
    // X/Y axes rather than 28 degrees.
    if fields.len() < 7 {
        bail!("expected at least 7 fields for format version {version}, got {}", fields.len());
    }
    let raw: Vec<f64> = fields[1..7].iter().map(|s| s.trim().parse::<f64>()).collect::<Result<_, _>>().context("non-numeric bound field")?;
    let rescale = if version < 3 { FOV_RESCALE_35_TO_28 } else { 1.0 };

    let mut xmin = (raw[0] * 1000.0 * rescale) as i32;
    let mut xmax = (raw[3] * 1000.0 * rescale) as i32;
    let mut ymin = (raw[1] * 1000.0 * rescale) as i32;
    let mut ymax = (raw[4] * 1000.0 * rescale) as i32;
    let zmin = (raw[2] * 1000.0) as i32;
    let zmax = (raw[5] * 1000.0) as i32;

    if xmin == xmax {
        xmax = xmin + 100;
    }
    if ymin == ymax {
        ymax = ymin + 100;
    }
    if xmin > xmax {
        std::mem::swap(&mut xmin, &mut xmax);
    }
    if ymin > ymax {
        std::mem::swap(&mut ymin, &mut ymax);
    }

    zones.add(name, xmin, ymin, zmin.max(1), xmax, ymax, zmax.max(zmin.max(1) + 1))?;
    if fields.len() >= 12 {
        apply_hysteresis_fields(zones, name, &fields[7..12])?;
    }
    Ok(())
}

fn parse_ints(fields: &[&str]) -> anyhow::Result<[i32; 6]> {
    let mut out = [0i32; 6];
    for (i, f) in fields.iter().enumerate() {
        out[i] = f.trim().parse().with_context(|| format!("invalid integer field: {f:?}"))?;
    }
    Ok(out)
}

fn apply_hysteresis_fields(zones: &mut ZoneList, name: &str, fields: &[&str]) -> anyhow::Result<()> {
    if Param::parse(fields[0].trim()).is_some() {
        zones.set_attr(name, Attr::Param, fields[0].trim())?;
    }
    zones.set_attr(name, Attr::OnLevel, fields[1].trim())?;
    zones.set_attr(name, Attr::OffLevel, fields[2].trim())?;
    zones.set_attr(name, Attr::OnDelay, fields[3].trim())?;
    zones.set_attr(name, Attr::OffDelay, fields[4].trim())?;
    Ok(())
}

/// Background thread that saves the zone list whenever its version has
/// changed since the last save, polling on a jittered interval so many
/// daemons restarted at once don't all hit disk in lockstep.
pub struct SaveThread {
    stop: AtomicBool,
    last_saved_version: AtomicU32,
}

impl SaveThread {
    pub fn new() -> Arc<SaveThread> {
        Arc::new(SaveThread { stop: AtomicBool::new(false), last_saved_version: AtomicU32::new(u32::MAX) })
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn spawn(self: &Arc<Self>, dir: PathBuf, zones: Arc<Mutex<ZoneList>>, tilt: Arc<Mutex<i32>>) -> std::io::Result<std::thread::JoinHandle<()>> {
        let me = Arc::clone(self);
        std::thread::Builder::new().name("zone-save".into()).spawn(move || me.run(dir, zones, tilt))
    }

    fn run(&self, dir: PathBuf, zones: Arc<Mutex<ZoneList>>, tilt: Arc<Mutex<i32>>) {
        while !self.stop.load(Ordering::Acquire) {
            self.check_save(&dir, &zones, &tilt);
            let jitter = 500 + (pseudo_jitter() % 100);
            std::thread::sleep(Duration::from_millis(jitter));
        }
        self.check_save(&dir, &zones, &tilt);
    }

    fn check_save(&self, dir: &Path, zones: &Arc<Mutex<ZoneList>>, tilt: &Arc<Mutex<i32>>) {
        let (version, tilt_val) = {
            let z = zones.lock().unwrap();
            (z.version(), *tilt.lock().unwrap())
        };
        if version == self.last_saved_version.load(Ordering::Acquire) {
            return;
        }
        let result = {
            let z = zones.lock().unwrap();
            save_zones(dir, &z, tilt_val)
        };
        match result {
            Ok(()) => self.last_saved_version.store(version, Ordering::Release),
            Err(e) => log::error!("failed to save zones to {}: {e}", dir.display()),
        }
    }
}

/// Small thread/time-derived jitter source; this is not used for anything
/// security sensitive, only to desynchronize save polling.
fn pseudo_jitter() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ZoneList;

    #[test]
    fn save_then_load_round_trips_zone_bounds_and_params() {
        let dir = std::env::temp_dir().join(format!("knd-persist-test-{}", pseudo_jitter()));
        fs::create_dir_all(&dir).unwrap();

        let mut zones = ZoneList::new(2, 2);
        zones.add("doorway", -500, -500, 400, 500, 500, 2000).unwrap();
        zones.set_attr("doorway", Attr::OnLevel, "200").unwrap();
        save_zones(&dir, &zones, 5).unwrap();

        let mut loaded = ZoneList::new(2, 2);
        let tilt = load_zones(&dir.join(ZONE_FILENAME), &mut loaded).unwrap();
        assert_eq!(tilt, 5);
        let z = loaded.find("doorway").unwrap();
        assert_eq!(z.xmin, -500);
        assert_eq!(z.zmax, 2000);
        assert_eq!(z.rising_threshold, 200);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_rescales_v1_bounds_from_metres_and_35_degree_fov() {
        let dir = std::env::temp_dir().join(format!("knd-persist-v1-test-{}", pseudo_jitter()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(ZONE_FILENAME);
        fs::write(&path, "1 0 1\nfront,-0.5,-0.5,0.4,0.5,0.5,2.0\n").unwrap();

        let mut zones = ZoneList::new(2, 2);
        load_zones(&path, &mut zones).unwrap();
        let z = zones.find("front").unwrap();
        assert_eq!(z.zmin, 400);
        assert!((z.xmin as f64 - (-500.0 * FOV_RESCALE_35_TO_28)).abs() < 1.0);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn validate_save_dir_rejects_missing_directory() {
        let dir = std::env::temp_dir().join("knd-persist-does-not-exist-xyz");
        assert!(validate_save_dir(&dir).is_err());
    }
}
