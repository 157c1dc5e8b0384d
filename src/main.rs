mod camera;
mod config;
mod lut;
mod metrics;
mod persist;
mod pipeline;
mod scan;
mod server;
mod watchdog;
mod zone;

use camera::SimulatedCameraDriver;
use clap::Parser;
use config::Config;
use pipeline::Pipeline;
use server::Server;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_termination_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_termination_signal as libc::sighandler_t);
    }
}

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    stderrlog::new()
        .module(module_path!())
        .verbosity(config.verbosity())
        .timestamp(stderrlog::Timestamp::Second)
        .init()
        .expect("logger already initialized");

    log::info!("starting, zone protocol on port {}", config.port);

    let zones = Arc::new(Mutex::new(zone::ZoneList::new(2, 2)));
    let tilt = Arc::new(Mutex::new(0i32));

    if let Some(dir) = &config.save_dir {
        persist::validate_save_dir(dir)?;
        let zones_file = dir.join(persist::ZONE_FILENAME);
        if zones_file.exists() {
            let mut z = zones.lock().unwrap();
            match persist::load_zones(&zones_file, &mut z) {
                Ok(loaded_tilt) => {
                    *tilt.lock().unwrap() = loaded_tilt;
                    log::info!("loaded {} zones from {}", z.len(), zones_file.display());
                }
                Err(e) => log::error!("failed to load {}: {e}", zones_file.display()),
            }
        }
    }

    install_signal_handlers();

    let watchdog = watchdog::Watchdog::new(config.init_timeout());
    let watchdog_thread = watchdog.spawn(std::process::id() as i32)?;

    if !config.simulate {
        log::warn!("no real camera driver is wired up yet; running against the simulated driver");
    }
    let camera: Arc<dyn camera::CameraDriver> = Arc::new(SimulatedCameraDriver::new());
    let pipeline = Arc::new(Pipeline::new(camera, Arc::clone(&zones)));
    pipeline.start()?;
    let _ = pipeline.set_tilt(*tilt.lock().unwrap());

    let metrics_thread = match metrics::spawn_server(config.metrics_addr) {
        Ok(h) => Some(h),
        Err(e) => {
            log::warn!("metrics listener disabled: {e}");
            None
        }
    };

    let save_thread = config.save_dir.as_ref().map(|dir| {
        let save = persist::SaveThread::new();
        let handle = save.spawn(dir.clone(), Arc::clone(&zones), Arc::clone(&tilt)).expect("spawning save thread");
        (save, handle)
    });

    let stop_flag = Arc::new(AtomicBool::new(false));
    let mut srv = Server::bind_with_stop_flag(config.port, Arc::clone(&zones), Arc::clone(&pipeline), Arc::clone(&stop_flag))?;

    watchdog.start();
    watchdog.set_timeout(config.run_timeout());

    let result = srv.run(|| {
        watchdog.kick();
        if SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
            stop_flag.store(true, Ordering::Release);
        }
    });

    log::info!("shutting down");
    pipeline.stop();
    watchdog.shutdown();
    let _ = watchdog_thread.join();

    if let Some((save, handle)) = save_thread {
        save.shutdown();
        let _ = handle.join();
    }
    if let Some(h) = metrics_thread {
        drop(h); // tiny_http's server loop exits once the process is tearing down
    }

    result
}
