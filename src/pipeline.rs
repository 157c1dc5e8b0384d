//! Frame pipeline: two worker threads hand depth/video frames from the
//! camera driver's callback threads to the zone scanner through a
//! single-slot buffer guarded by a counting semaphore pair, the same
//! full/empty handshake a double-buffered producer/consumer setup uses to
//! avoid the scanner ever reading a frame the driver is still writing.

use crate::camera::{CameraDriver, Led};
use crate::lut::{DEPTH_FRAME_BYTES, VIDEO_FRAME_BYTES};
use crate::scan;
use crate::zone::ZoneList;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting semaphore built from a mutex and a condvar; the standard
/// library doesn't have one, and nothing in the dependency stack supplies
/// it either.
struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new(initial: usize) -> Semaphore {
        Semaphore { count: Mutex::new(initial), cv: Condvar::new() }
    }

    fn post(&self) {
        let mut c = self.count.lock().unwrap();
        *c += 1;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut c = self.count.lock().unwrap();
        while *c == 0 {
            c = self.cv.wait(c).unwrap();
        }
        *c -= 1;
    }

    /// Returns true if it acquired within `timeout`, false if it timed out.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut c = self.count.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while *c == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cv.wait_timeout(c, deadline - now).unwrap();
            c = guard;
            if result.timed_out() && *c == 0 {
                return false;
            }
        }
        *c -= 1;
        true
    }
}

struct LedInner {
    depth_until: Instant,
    video_until: Instant,
    error_until: Instant,
}

/// Tracks which LED colour should be showing, with green/yellow "kicked on
/// every frame" hold windows and red overriding both whenever a frame gets
/// dropped for running behind.
struct LedController {
    inner: Mutex<LedInner>,
}

const DEPTH_HOLD: Duration = Duration::from_secs(2);
const VIDEO_HOLD: Duration = Duration::from_secs(3);
const ERROR_HOLD: Duration = Duration::from_secs(2);

impl LedController {
    fn new() -> LedController {
        let past = Instant::now() - Duration::from_secs(3600);
        LedController { inner: Mutex::new(LedInner { depth_until: past, video_until: past, error_until: past }) }
    }

    fn kick_depth(&self) {
        self.inner.lock().unwrap().depth_until = Instant::now() + DEPTH_HOLD;
    }

    fn kick_video(&self) {
        self.inner.lock().unwrap().video_until = Instant::now() + VIDEO_HOLD;
    }

    fn kick_error(&self) {
        self.inner.lock().unwrap().error_until = Instant::now() + ERROR_HOLD;
    }

    fn current(&self) -> Led {
        let now = Instant::now();
        let s = self.inner.lock().unwrap();
        if s.error_until > now {
            Led::Red
        } else if s.video_until > now {
            Led::Yellow
        } else if s.depth_until > now {
            Led::Green
        } else {
            Led::Off
        }
    }
}

/// Exponential-ish moving measure of frames-per-second, refreshed once per
/// completed frame.
struct FpsCounter {
    last: Option<Instant>,
    fps: f64,
}

impl FpsCounter {
    fn new() -> FpsCounter {
        FpsCounter { last: None, fps: 0.0 }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last {
            let dt = now.duration_since(prev).as_secs_f64();
            if dt > 0.0 {
                let instantaneous = 1.0 / dt;
                self.fps = self.fps * 0.8 + instantaneous * 0.2;
            }
        }
        self.last = Some(now);
    }
}

struct FrameBuffer {
    data: Mutex<Vec<u8>>,
    counter: AtomicU64,
}

impl FrameBuffer {
    fn new(size: usize) -> FrameBuffer {
        FrameBuffer { data: Mutex::new(vec![0u8; size]), counter: AtomicU64::new(0) }
    }

    fn snapshot(&self) -> (u64, Vec<u8>) {
        let g = self.data.lock().unwrap();
        (self.counter.load(Ordering::Acquire), g.clone())
    }
}

/// Wires a [`CameraDriver`] to the zone scanner. Owns the depth/video
/// worker threads and the buffers/semaphores they hand frames through.
pub struct Pipeline {
    camera: Arc<dyn CameraDriver>,
    zones: Arc<Mutex<ZoneList>>,

    depth_buf: Arc<FrameBuffer>,
    depth_full: Arc<Semaphore>,
    depth_empty: Arc<Semaphore>,

    video_buf: Arc<FrameBuffer>,
    video_full: Arc<Semaphore>,
    video_empty: Arc<Semaphore>,
    video_requested: Arc<AtomicBool>,
    video_started: Arc<AtomicBool>,

    led: Arc<LedController>,
    busy_count: Arc<AtomicU64>,
    depth_fps: Arc<Mutex<FpsCounter>>,
    video_fps: Arc<Mutex<FpsCounter>>,

    stopping: Arc<AtomicBool>,
    depth_worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    video_worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(camera: Arc<dyn CameraDriver>, zones: Arc<Mutex<ZoneList>>) -> Pipeline {
        Pipeline {
            camera,
            zones,
            depth_buf: Arc::new(FrameBuffer::new(DEPTH_FRAME_BYTES)),
            depth_full: Arc::new(Semaphore::new(0)),
            depth_empty: Arc::new(Semaphore::new(1)),
            video_buf: Arc::new(FrameBuffer::new(VIDEO_FRAME_BYTES)),
            video_full: Arc::new(Semaphore::new(0)),
            video_empty: Arc::new(Semaphore::new(1)),
            video_requested: Arc::new(AtomicBool::new(false)),
            video_started: Arc::new(AtomicBool::new(false)),
            led: Arc::new(LedController::new()),
            busy_count: Arc::new(AtomicU64::new(0)),
            depth_fps: Arc::new(Mutex::new(FpsCounter::new())),
            video_fps: Arc::new(Mutex::new(FpsCounter::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            depth_worker: Mutex::new(None),
            video_worker: Mutex::new(None),
        }
    }

    /// Registers the camera callbacks and spawns the depth/video worker
    /// threads. Video stays off until [`Pipeline::request_video`] is called.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let depth_buf = Arc::clone(&self.depth_buf);
        let depth_empty = Arc::clone(&self.depth_empty);
        let depth_full = Arc::clone(&self.depth_full);
        let busy_count = Arc::clone(&self.busy_count);

        self.camera.start_depth(Arc::new(move |frame: &[u8]| {
            if !depth_empty.wait_timeout(Duration::from_millis(1)) {
                busy_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            {
                let mut buf = depth_buf.data.lock().unwrap();
                let n = buf.len().min(frame.len());
                buf[..n].copy_from_slice(&frame[..n]);
            }
            depth_buf.counter.fetch_add(1, Ordering::Release);
            depth_full.post();
        }))?;

        let pipeline = Arc::clone(self);
        let depth_handle = std::thread::Builder::new().name("depth-worker".into()).spawn(move || {
            pipeline.depth_worker_loop();
        })?;
        *self.depth_worker.lock().unwrap() = Some(depth_handle);

        let pipeline = Arc::clone(self);
        let video_handle = std::thread::Builder::new().name("video-worker".into()).spawn(move || {
            pipeline.video_worker_loop();
        })?;
        *self.video_worker.lock().unwrap() = Some(video_handle);

        Ok(())
    }

    fn depth_worker_loop(self: Arc<Self>) {
        loop {
            self.depth_full.wait();
            if self.stopping.load(Ordering::Acquire) {
                self.depth_empty.post();
                return;
            }

            {
                let buf = self.depth_buf.data.lock().unwrap();
                let mut zones = self.zones.lock().unwrap();
                let result = scan::update_zonelist_depth(&mut zones, &buf);
                for idx in result.flipped {
                    if let Some(z) = zones.zones().get(idx) {
                        log::debug!("zone \"{}\" occupancy changed to {}", z.name, z.published_occupied());
                    }
                }
            }
            self.depth_empty.post();
            self.led.kick_depth();
            self.depth_fps.lock().unwrap().tick();

            let led = self.led.current();
            let _ = self.camera.set_led(led);
        }
    }

    fn video_worker_loop(self: Arc<Self>) {
        loop {
            if !self.video_requested.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(50));
                if self.stopping.load(Ordering::Acquire) {
                    return;
                }
                continue;
            }
            if !self.video_started.swap(true, Ordering::AcqRel) {
                let buf = Arc::clone(&self.video_buf);
                let empty = Arc::clone(&self.video_empty);
                let full = Arc::clone(&self.video_full);
                if self
                    .camera
                    .start_video(Arc::new(move |frame: &[u8]| {
                        empty.wait();
                        {
                            let mut b = buf.data.lock().unwrap();
                            let n = b.len().min(frame.len());
                            b[..n].copy_from_slice(&frame[..n]);
                        }
                        buf.counter.fetch_add(1, Ordering::Release);
                        full.post();
                    }))
                    .is_err()
                {
                    self.video_started.store(false, Ordering::Release);
                }
            }

            self.video_full.wait();
            if self.stopping.load(Ordering::Acquire) {
                self.video_empty.post();
                return;
            }
            {
                let buf = self.video_buf.data.lock().unwrap();
                let mut zones = self.zones.lock().unwrap();
                scan::update_zonelist_video(&mut zones, &buf);
            }
            self.video_empty.post();
            self.led.kick_video();
            self.video_fps.lock().unwrap().tick();

            if !self.video_requested.load(Ordering::Acquire) && self.video_started.swap(false, Ordering::AcqRel) {
                let _ = self.camera.stop_video();
            }
        }
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.camera.stop_depth();
        let _ = self.camera.stop_video();
        self.depth_full.post();
        self.video_full.post();

        if let Some(h) = self.depth_worker.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.video_worker.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    /// Client wants (or no longer wants) a live video feed. Mirrors the
    /// request/started split the driver boundary uses so video only runs
    /// while at least one subscriber cares.
    pub fn request_video(&self, want: bool) {
        self.video_requested.store(want, Ordering::Release);
    }

    pub fn get_depth(&self) -> (u64, Vec<u8>) {
        self.depth_buf.snapshot()
    }

    pub fn get_video(&self) -> (u64, Vec<u8>) {
        self.video_buf.snapshot()
    }

    pub fn depth_fps(&self) -> f64 {
        self.depth_fps.lock().unwrap().fps
    }

    pub fn video_fps(&self) -> f64 {
        self.video_fps.lock().unwrap().fps
    }

    pub fn busy_count(&self) -> u64 {
        self.busy_count.load(Ordering::Relaxed)
    }

    pub fn set_tilt(&self, degrees: i32) -> anyhow::Result<()> {
        self.camera.set_tilt(degrees)
    }

    pub fn tilt_degrees(&self) -> i32 {
        self.camera.tilt_degrees()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedCameraDriver;
    use crate::zone::ZoneList;

    #[test]
    fn pipeline_scans_depth_frames_into_zone_occupancy() {
        let camera: Arc<dyn CameraDriver> = Arc::new(SimulatedCameraDriver::new());
        let zones = Arc::new(Mutex::new(ZoneList::new(2, 2)));
        {
            let mut z = zones.lock().unwrap();
            // Wide-open zone near the synthetic blob's depth band.
            z.add("center", -10000, -10000, 1, 10000, 10000, 20000).unwrap();
        }
        let pipeline = Arc::new(Pipeline::new(camera, Arc::clone(&zones)));
        pipeline.start().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        pipeline.stop();

        let (counter, _) = pipeline.get_depth();
        assert!(counter > 0, "expected at least one depth frame to be processed");
    }

    #[test]
    fn led_controller_prioritizes_red_over_yellow_over_green() {
        let led = LedController::new();
        led.kick_depth();
        assert_eq!(led.current(), Led::Green);
        led.kick_video();
        assert_eq!(led.current(), Led::Yellow);
        led.kick_error();
        assert_eq!(led.current(), Led::Red);
    }

    #[test]
    fn semaphore_wait_timeout_reports_failure_when_starved() {
        let sem = Semaphore::new(0);
        assert!(!sem.wait_timeout(Duration::from_millis(5)));
        sem.post();
        assert!(sem.wait_timeout(Duration::from_millis(5)));
    }
}
