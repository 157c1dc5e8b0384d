//! Boundary between the frame pipeline and whatever actually talks to the
//! sensor. A real implementation would drive the device over USB; tests and
//! local development run against `SimulatedCameraDriver` instead.

use crate::lut::{DEPTH_FRAME_BYTES, VIDEO_FRAME_BYTES};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub type FrameCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// LED state the driver is asked to display. Priority between simultaneous
/// requests is resolved by the pipeline before `set_led` is called, so the
/// driver itself stays dumb.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Led {
    Off,
    Green,
    Yellow,
    Red,
    BlinkGreen,
    BlinkRedYellow,
}

/// Operations the frame pipeline, watchdog, and zone-protocol server need
/// from the sensor, independent of any particular transport.
pub trait CameraDriver: Send + Sync {
    fn start_depth(&self, cb: FrameCallback) -> anyhow::Result<()>;
    fn stop_depth(&self) -> anyhow::Result<()>;
    fn start_video(&self, cb: FrameCallback) -> anyhow::Result<()>;
    fn stop_video(&self) -> anyhow::Result<()>;
    fn set_led(&self, led: Led) -> anyhow::Result<()>;
    fn set_tilt(&self, degrees: i32) -> anyhow::Result<()>;
    fn tilt_degrees(&self) -> i32;
    /// Services USB/device events; called from the pipeline's poll loop.
    fn process_events(&self, timeout: Duration) -> anyhow::Result<()>;
}

struct GeneratorState {
    depth_running: bool,
    video_running: bool,
    depth_cb: Option<FrameCallback>,
    video_cb: Option<FrameCallback>,
    tilt: i32,
    led: Led,
    frame_counter: u64,
}

/// Generates synthetic depth/video frames on background threads so the rest
/// of the daemon can run without real hardware attached. Depth frames
/// describe a single rectangular blob whose distance and position drift
/// slowly, which is enough to exercise zone occupancy end to end.
pub struct SimulatedCameraDriver {
    state: Arc<Mutex<GeneratorState>>,
    depth_period: Duration,
    video_period: Duration,
}

impl SimulatedCameraDriver {
    pub fn new() -> SimulatedCameraDriver {
        SimulatedCameraDriver {
            state: Arc::new(Mutex::new(GeneratorState {
                depth_running: false,
                video_running: false,
                depth_cb: None,
                video_cb: None,
                tilt: 0,
                led: Led::Off,
                frame_counter: 0,
            })),
            depth_period: Duration::from_millis(33),
            video_period: Duration::from_millis(33),
        }
    }

    fn synth_depth_frame(counter: u64) -> Vec<u8> {
        use crate::lut::{FRAME_H, FRAME_W};
        let mut buf = vec![0xFFu8; DEPTH_FRAME_BYTES];
        // A single in-range band sweeping across the middle rows so zone
        // scans have something to land on.
        let raw: u16 = 300 + ((counter % 200) as u16);
        let y0 = FRAME_H / 2 - 20;
        let y1 = FRAME_H / 2 + 20;
        for y in y0..y1 {
            for x in (FRAME_W / 4)..(3 * FRAME_W / 4) {
                let p = y * FRAME_W + x;
                set_pxval_11(&mut buf, p, raw);
            }
        }
        buf
    }

    fn synth_video_frame() -> Vec<u8> {
        vec![128u8; VIDEO_FRAME_BYTES]
    }
}

fn set_pxval_11(buf: &mut [u8], p: usize, val: u16) {
    let bit_off = p * 11;
    for b in 0..11 {
        let bit = (val >> (10 - b)) & 1;
        let abs_bit = bit_off + b;
        let byte = abs_bit / 8;
        let shift = 7 - (abs_bit % 8);
        if bit == 1 {
            buf[byte] |= 1 << shift;
        } else {
            buf[byte] &= !(1 << shift);
        }
    }
}

impl Default for SimulatedCameraDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for SimulatedCameraDriver {
    fn start_depth(&self, cb: FrameCallback) -> anyhow::Result<()> {
        let mut s = self.state.lock().unwrap();
        s.depth_cb = Some(cb);
        if s.depth_running {
            return Ok(());
        }
        s.depth_running = true;
        drop(s);

        let state = Arc::clone(&self.state);
        let period = self.depth_period;
        thread::Builder::new().name("sim-depth".into()).spawn(move || loop {
            let (cb, counter, running) = {
                let mut s = state.lock().unwrap();
                if !s.depth_running {
                    break;
                }
                s.frame_counter += 1;
                (s.depth_cb.clone(), s.frame_counter, s.depth_running)
            };
            if !running {
                break;
            }
            if let Some(cb) = cb {
                let frame = SimulatedCameraDriver::synth_depth_frame(counter);
                cb(&frame);
            }
            thread::sleep(period);
        })?;
        Ok(())
    }

    fn stop_depth(&self) -> anyhow::Result<()> {
        self.state.lock().unwrap().depth_running = false;
        Ok(())
    }

    fn start_video(&self, cb: FrameCallback) -> anyhow::Result<()> {
        let mut s = self.state.lock().unwrap();
        s.video_cb = Some(cb);
        if s.video_running {
            return Ok(());
        }
        s.video_running = true;
        drop(s);

        let state = Arc::clone(&self.state);
        let period = self.video_period;
        thread::Builder::new().name("sim-video".into()).spawn(move || loop {
            let (cb, running) = {
                let s = state.lock().unwrap();
                (s.video_cb.clone(), s.video_running)
            };
            if !running {
                break;
            }
            if let Some(cb) = cb {
                let frame = SimulatedCameraDriver::synth_video_frame();
                cb(&frame);
            }
            thread::sleep(period);
        })?;
        Ok(())
    }

    fn stop_video(&self) -> anyhow::Result<()> {
        self.state.lock().unwrap().video_running = false;
        Ok(())
    }

    fn set_led(&self, led: Led) -> anyhow::Result<()> {
        self.state.lock().unwrap().led = led;
        Ok(())
    }

    fn set_tilt(&self, degrees: i32) -> anyhow::Result<()> {
        self.state.lock().unwrap().tilt = degrees.clamp(-15, 15);
        Ok(())
    }

    fn tilt_degrees(&self) -> i32 {
        self.state.lock().unwrap().tilt
    }

    fn process_events(&self, timeout: Duration) -> anyhow::Result<()> {
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn simulated_driver_delivers_depth_frames() {
        let driver = SimulatedCameraDriver::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        driver.start_depth(Arc::new(move |_buf| {
            count2.fetch_add(1, Ordering::SeqCst);
        })).unwrap();
        thread::sleep(Duration::from_millis(150));
        driver.stop_depth().unwrap();
        assert!(count.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn tilt_clamps_to_plus_minus_15() {
        let driver = SimulatedCameraDriver::new();
        driver.set_tilt(90).unwrap();
        assert_eq!(driver.tilt_degrees(), 15);
        driver.set_tilt(-90).unwrap();
        assert_eq!(driver.tilt_degrees(), -15);
    }
}
