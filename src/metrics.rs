//! Prometheus metrics exposition, served over plain HTTP on a separate
//! thread so scraping never contends with the zone protocol server.

use lazy_static::lazy_static;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, TextEncoder};
use std::net::SocketAddr;

lazy_static! {
    pub static ref DEPTH_FPS: Gauge = prometheus::register_gauge!("knd_depth_fps", "Depth frame rate.").unwrap();
    pub static ref VIDEO_FPS: Gauge = prometheus::register_gauge!("knd_video_fps", "Video frame rate.").unwrap();
    pub static ref ZONE_COUNT: IntGauge = prometheus::register_int_gauge!("knd_zone_count", "Number of configured zones.").unwrap();
    pub static ref OCCUPIED_COUNT: IntGauge = prometheus::register_int_gauge!("knd_occupied_count", "Number of currently occupied zones.").unwrap();
    pub static ref BUSY_COUNT: IntCounter = prometheus::register_int_counter!("knd_busy_total", "Depth frames dropped because the scanner was still busy.").unwrap();
    pub static ref OOR_TOTAL: IntCounter = prometheus::register_int_counter!("knd_oor_total", "Out-of-range depth samples seen across all frames.").unwrap();
    pub static ref CLIENT_COUNT: IntGauge = prometheus::register_int_gauge!("knd_client_count", "Connected zone protocol clients.").unwrap();
}

/// Spawns the metrics HTTP listener. Each request gets a fresh render of the
/// current registry; there's no push path, Prometheus always pulls.
pub fn spawn_server(addr: SocketAddr) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let server = tiny_http::Server::http(addr).map_err(|e| anyhow::anyhow!("binding metrics listener on {addr}: {e}"))?;
    let handle = std::thread::Builder::new().name("metrics".into()).spawn(move || {
        for request in server.incoming_requests() {
            let metric_families = prometheus::gather();
            let mut buf = Vec::new();
            let encoder = TextEncoder::new();
            if encoder.encode(&metric_families, &mut buf).is_err() {
                let _ = request.respond(tiny_http::Response::empty(500));
                continue;
            }
            let response = tiny_http::Response::from_data(buf).with_header(
                tiny_http::Header::from_bytes(&b"Content-Type"[..], encoder.format_type().as_bytes()).unwrap(),
            );
            let _ = request.respond(response);
        }
    })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_are_settable() {
        ZONE_COUNT.set(3);
        assert_eq!(ZONE_COUNT.get(), 3);
        OCCUPIED_COUNT.set(1);
        assert_eq!(OCCUPIED_COUNT.get(), 1);
    }
}
