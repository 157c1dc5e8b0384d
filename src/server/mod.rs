//! Single-threaded, `poll`-driven zone protocol server. One thread owns the
//! listening socket and every client connection; nothing here blocks, so a
//! slow client can never stall zone updates to the others.

pub mod commands;

use crate::pipeline::Pipeline;
use crate::zone::ZoneList;
use commands::{dispatch, CommandContext, Dispatch, Reply, Request};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_INPUT: usize = 131072;
const OVERFLOW_MESSAGE: &[u8] = b"\n\n\nBuffer overflow.\n\n\n";

/// Lets other threads (the frame pipeline's workers, the watchdog) wake the
/// server's `poll` immediately instead of waiting for its next tick.
pub struct Wakeup {
    write_fd: RawFd,
}

impl Wakeup {
    pub fn notify(&self, opcode: u8) {
        unsafe {
            libc::write(self.write_fd, &opcode as *const u8 as *const libc::c_void, 1);
        }
    }
}

struct Client {
    stream: TcpStream,
    fd: RawFd,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    sub_zones: bool,
    sub_video: bool,
    sub_bright: bool,
    /// Remaining depth frames to push: -1 means unlimited, 0 means unsubscribed.
    depth_limit: i64,
    last_depth_counter: u64,
    last_video_counter: u64,
    closing: bool,
}

impl Client {
    fn new(stream: TcpStream) -> std::io::Result<Client> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        Ok(Client {
            stream,
            fd,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            sub_zones: false,
            sub_video: false,
            sub_bright: false,
            depth_limit: 0,
            last_depth_counter: 0,
            last_video_counter: 0,
            closing: false,
        })
    }

    fn queue(&mut self, bytes: &[u8]) {
        self.out_buf.extend_from_slice(bytes);
    }
}

pub struct Server {
    listener: TcpListener,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
    zones: Arc<Mutex<ZoneList>>,
    pipeline: Arc<Pipeline>,
    clients: Vec<Client>,
    last_bright_video_counter: u64,
    stop: bool,
    external_stop: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(port: u16, zones: Arc<Mutex<ZoneList>>, pipeline: Arc<Pipeline>) -> anyhow::Result<Server> {
        Self::bind_with_stop_flag(port, zones, pipeline, Arc::new(AtomicBool::new(false)))
    }

    /// Same as [`Server::bind`], but lets a caller share the "should stop"
    /// flag so a signal handler on another thread can request shutdown
    /// without needing a handle into the running server.
    pub fn bind_with_stop_flag(
        port: u16,
        zones: Arc<Mutex<ZoneList>>,
        pipeline: Arc<Pipeline>,
        external_stop: Arc<AtomicBool>,
    ) -> anyhow::Result<Server> {
        let listener = TcpListener::bind(("::", port))?;
        listener.set_nonblocking(true)?;

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            anyhow::bail!("creating wakeup pipe: {}", std::io::Error::last_os_error());
        }
        for fd in pipe_fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }

        Ok(Server {
            listener,
            wakeup_read: pipe_fds[0],
            wakeup_write: pipe_fds[1],
            zones,
            pipeline,
            clients: Vec::new(),
            last_bright_video_counter: 0,
            stop: false,
            external_stop,
        })
    }

    pub fn wakeup_handle(&self) -> Wakeup {
        Wakeup { write_fd: self.wakeup_write }
    }

    pub fn request_stop(&mut self) {
        self.stop = true;
        self.wakeup_handle().notify(b'K');
    }

    /// Runs the event loop until `request_stop` is called (typically from
    /// another thread via a `Wakeup`, since this call blocks).
    pub fn run(&mut self, mut kick_watchdog: impl FnMut()) -> anyhow::Result<()> {
        log::info!("zone protocol server listening");
        while !self.stop && !self.external_stop.load(Ordering::Acquire) {
            self.poll_once(Duration::from_millis(100))?;
            kick_watchdog();
        }
        Ok(())
    }

    fn poll_once(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.clients.len() + 2);
        fds.push(libc::pollfd { fd: self.listener.as_raw_fd(), events: libc::POLLIN, revents: 0 });
        fds.push(libc::pollfd { fd: self.wakeup_read, events: libc::POLLIN, revents: 0 });
        for c in &self.clients {
            let mut events = libc::POLLIN;
            if !c.out_buf.is_empty() {
                events |= libc::POLLOUT;
            }
            fds.push(libc::pollfd { fd: c.fd, events, revents: 0 });
        }

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout.as_millis() as libc::c_int) };
        if n < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            anyhow::bail!("poll failed: {e}");
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.accept_clients();
        }
        if fds[1].revents & libc::POLLIN != 0 {
            self.drain_wakeup();
        }

        for (i, client) in self.clients.iter_mut().enumerate() {
            let revents = fds[i + 2].revents;
            if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                client.closing = true;
                continue;
            }
            if revents & libc::POLLOUT != 0 {
                flush_client(client);
            }
            if revents & libc::POLLIN != 0 {
                read_client(client);
            }
        }

        self.process_requests();
        self.fanout_frames();

        self.clients.retain(|c| !(c.closing && c.out_buf.is_empty()));
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::debug!("client connected: {addr}");
                    match Client::new(stream) {
                        Ok(c) => self.clients.push(c),
                        Err(e) => log::warn!("failed to configure new client: {e}"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn drain_wakeup(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match unsafe { libc::read(self.wakeup_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } {
                n if n > 0 => continue,
                _ => break,
            }
        }
    }

    fn process_requests(&mut self) {
        let mut pending_effects = Vec::new();

        for (idx, client) in self.clients.iter_mut().enumerate() {
            if client.closing {
                continue;
            }
            while let Some(pos) = client.in_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = client.in_buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line).into_owned();
                let req = match Request::parse(&line) {
                    Some(r) => r,
                    None => continue,
                };

                let mut zones = self.zones.lock().unwrap();
                let mut ctx = CommandContext {
                    zones: &mut zones,
                    tilt_degrees: self.pipeline.tilt_degrees(),
                    depth_fps: self.pipeline.depth_fps(),
                    video_fps: self.pipeline.video_fps(),
                    busy_count: self.pipeline.busy_count(),
                };
                let Dispatch { reply, effects } = dispatch(&req, &mut ctx);
                drop(zones);

                apply_reply(client, reply);
                pending_effects.push((idx, effects));
            }
        }

        for (idx, effects) in pending_effects {
            {
                let client = &mut self.clients[idx];
                if let Some(v) = effects.set_sub_zones {
                    client.sub_zones = v;
                }
                if let Some(limit) = effects.set_sub_depth {
                    client.depth_limit = limit;
                }
                if let Some(v) = effects.set_sub_video {
                    client.sub_video = v;
                }
                if let Some(v) = effects.set_sub_bright {
                    client.sub_bright = v;
                }
                if effects.want_depth_once {
                    let (_, frame) = self.pipeline.get_depth();
                    send_frame(client, "DEPTH", &frame);
                }
                if effects.want_video_once {
                    self.pipeline.request_video(true);
                    let (_, frame) = self.pipeline.get_video();
                    send_frame(client, "VIDEO", &frame);
                }
                if let Some(degrees) = effects.request_tilt {
                    let _ = self.pipeline.set_tilt(degrees);
                }
            }
            if let Some(line) = effects.broadcast_add {
                self.broadcast_zone_line("ADD", &line);
            }
            if let Some(lines) = effects.broadcast_del {
                for line in lines {
                    self.broadcast_zone_line("DEL", &line);
                }
            }
        }

        let any_video_subscriber = self.clients.iter().any(|c| c.sub_video);
        self.pipeline.request_video(any_video_subscriber);
    }

    /// Broadcasts a zone event line to every client subscribed to zone
    /// changes (not just the client whose request triggered it).
    fn broadcast_zone_line(&mut self, prefix: &str, line: &str) {
        for client in &mut self.clients {
            if client.sub_zones {
                client.queue(format!("{prefix} - {line}\n").as_bytes());
            }
        }
    }

    fn fanout_frames(&mut self) {
        let (depth_counter, depth_frame) = self.pipeline.get_depth();
        let (video_counter, video_frame) = self.pipeline.get_video();

        let sub_lines: Vec<String> = {
            let mut zones = self.zones.lock().unwrap();
            let lines = zones
                .zones()
                .iter()
                .filter(|z| z.pop != z.lastpop || z.occupied != z.lastoccupied || z.new_zone)
                .map(|z| format!("SUB - {}", commands::format_zone_line(z)))
                .collect();
            zones.touch();
            lines
        };
        if !sub_lines.is_empty() {
            for client in &mut self.clients {
                if client.sub_zones {
                    for l in &sub_lines {
                        client.queue(l.as_bytes());
                        client.queue(b"\n");
                    }
                }
            }
        }

        for client in &mut self.clients {
            if client.depth_limit != 0 && depth_counter != client.last_depth_counter {
                client.last_depth_counter = depth_counter;
                send_frame(client, "DEPTH", &depth_frame);
                if client.depth_limit > 0 {
                    client.depth_limit -= 1;
                }
            }

            if client.sub_video && video_counter != client.last_video_counter {
                client.last_video_counter = video_counter;
                send_frame(client, "VIDEO", &video_frame);
            }
        }

        if video_counter != self.last_bright_video_counter && self.clients.iter().any(|c| c.sub_bright) {
            self.last_bright_video_counter = video_counter;
            let bright_lines: Vec<String> = {
                let zones = self.zones.lock().unwrap();
                zones.zones().iter().map(|z| format!("BRIGHT - bright={} name=\"{}\"", z.bright(), z.name)).collect()
            };
            for client in &mut self.clients {
                if client.sub_bright {
                    for l in &bright_lines {
                        client.queue(l.as_bytes());
                        client.queue(b"\n");
                    }
                }
            }
        }
    }
}

fn apply_reply(client: &mut Client, reply: Reply) {
    match reply {
        Reply::Line(s) => client.queue(s.as_bytes()),
        Reply::Block(lines) => {
            for l in lines {
                client.queue(l.as_bytes());
                client.queue(b"\n");
            }
            client.queue(b"\n");
        }
        Reply::CloseAfter(s) => {
            client.queue(s.as_bytes());
            client.closing = true;
        }
        Reply::None => {}
    }
}

fn send_frame(client: &mut Client, kind: &str, frame: &[u8]) {
    client.queue(format!("{kind} - {} bytes of raw data follow newline\n", frame.len()).as_bytes());
    client.queue(frame);
}

fn read_client(client: &mut Client) {
    let mut buf = [0u8; 4096];
    loop {
        match client.stream.read(&mut buf) {
            Ok(0) => {
                client.closing = true;
                break;
            }
            Ok(n) => {
                if client.in_buf.len() + n > MAX_INPUT {
                    client.queue(OVERFLOW_MESSAGE);
                    client.closing = true;
                    client.in_buf.clear();
                    break;
                }
                client.in_buf.extend_from_slice(&buf[..n]);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(_) => {
                client.closing = true;
                break;
            }
        }
    }
}

fn flush_client(client: &mut Client) {
    while !client.out_buf.is_empty() {
        match client.stream.write(&client.out_buf) {
            Ok(0) => break,
            Ok(n) => {
                client.out_buf.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(_) => {
                client.closing = true;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedCameraDriver;
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;

    fn start_test_server() -> (Server, u16) {
        let zones = Arc::new(Mutex::new(ZoneList::new(2, 2)));
        let camera: Arc<dyn crate::camera::CameraDriver> = Arc::new(SimulatedCameraDriver::new());
        let pipeline = Arc::new(Pipeline::new(camera, Arc::clone(&zones)));
        let server = Server::bind(0, zones, pipeline).unwrap();
        let port = server.listener.local_addr().unwrap().port();
        (server, port)
    }

    #[test]
    fn accepts_client_and_answers_ver() {
        let (mut server, port) = start_test_server();
        let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
        conn.write_all(b"ver\n").unwrap();

        server.poll_once(Duration::from_millis(200)).unwrap();
        server.poll_once(Duration::from_millis(200)).unwrap();

        conn.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert_eq!(reply, "OK - Version 2\n");
    }

    #[test]
    fn oversized_input_triggers_overflow_and_close() {
        let (mut server, port) = start_test_server();
        let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let junk = vec![b'x'; MAX_INPUT + 10];
        conn.write_all(&junk).unwrap();

        server.poll_once(Duration::from_millis(200)).unwrap();
        server.poll_once(Duration::from_millis(200)).unwrap();

        conn.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).ok();
        assert!(String::from_utf8_lossy(&buf).contains("Buffer overflow."));
    }

    #[test]
    fn sub_zones_client_sees_add_broadcast_for_another_connection() {
        let (mut server, port) = start_test_server();
        let mut subscriber = TcpStream::connect(("127.0.0.1", port)).unwrap();
        subscriber.write_all(b"sub\n").unwrap();
        subscriber.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

        server.poll_once(Duration::from_millis(200)).unwrap();
        server.poll_once(Duration::from_millis(200)).unwrap();
        let mut buf = [0u8; 4096];
        let n = subscriber.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("OK - Subscribed."));

        let mut adder = TcpStream::connect(("127.0.0.1", port)).unwrap();
        adder.write_all(b"addzone door,-500,-500,400,500,500,2000\n").unwrap();
        server.poll_once(Duration::from_millis(200)).unwrap();
        server.poll_once(Duration::from_millis(200)).unwrap();

        let n = subscriber.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("ADD - "));
        assert!(text.contains("name=\"door\""));
    }
}
