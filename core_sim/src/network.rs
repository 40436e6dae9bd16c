//! Tick-frame pub/sub: one listener per planet, simulation loop → authority.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender, TryRecvError};
use sim_proto::{codec, SimulationFrame};

pub struct FramePublisher {
    sender: Sender<Vec<u8>>,
    local_addr: SocketAddr,
    overflowed: Arc<AtomicBool>,
}

impl FramePublisher {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the backlog dropped a frame since the last call. Once it has,
    /// the authority can no longer follow this replica without a resync.
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::AcqRel)
    }

    /// Queue an encoded frame (as produced by `codec::encode_message`).
    pub fn publish(&self, frame: Vec<u8>) {
        if let Err(err) = self.sender.send(frame) {
            log::error!("Failed to queue frame: {}", err);
        }
    }
}

/// Bind the frame listener. While nobody is subscribed, up to `backlog_limit`
/// frames are held and handed to the first subscriber in order; dropping an
/// older one raises the overflow flag.
pub fn start_frame_publisher(
    bind_addr: SocketAddr,
    backlog_limit: usize,
) -> io::Result<FramePublisher> {
    let listener = TcpListener::bind(bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let (sender, receiver) = unbounded::<Vec<u8>>();
    let clients: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
    let overflowed = Arc::new(AtomicBool::new(false));
    let overflow_flag = Arc::clone(&overflowed);

    thread::Builder::new()
        .name(format!("frames-{}", local_addr.port()))
        .spawn(move || {
            let mut backlog: VecDeque<Vec<u8>> = VecDeque::new();
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        log::info!("Frame subscriber connected: {}", addr);
                        if let Err(err) = stream.set_nodelay(true) {
                            log::warn!("Failed to set TCP_NODELAY: {}", err);
                        }
                        if let Err(err) = stream.set_nonblocking(false) {
                            log::warn!(
                                "Failed to set blocking mode for frame subscriber {}: {}",
                                addr,
                                err
                            );
                            continue;
                        }
                        clients.lock().expect("clients mutex poisoned").push(stream);
                        while let Some(frame) = backlog.pop_front() {
                            broadcast_frame(&clients, &frame);
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        log::error!("Error accepting frame subscriber: {}", err);
                        thread::sleep(Duration::from_millis(200));
                    }
                }

                loop {
                    match receiver.try_recv() {
                        Ok(frame) => {
                            if has_clients(&clients) {
                                broadcast_frame(&clients, &frame);
                            } else {
                                if backlog.len() >= backlog_limit.max(1) {
                                    backlog.pop_front();
                                    if !overflow_flag.swap(true, Ordering::AcqRel) {
                                        log::warn!(
                                            "Frame backlog on {} full, dropping oldest frames",
                                            local_addr
                                        );
                                    }
                                }
                                backlog.push_back(frame);
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            log::info!("Frame publisher on {} stopped", local_addr);
                            return;
                        }
                    }
                }
            }
        })?;

    Ok(FramePublisher {
        sender,
        local_addr,
        overflowed,
    })
}

fn has_clients(clients: &Arc<Mutex<Vec<TcpStream>>>) -> bool {
    !clients.lock().expect("clients mutex poisoned").is_empty()
}

fn broadcast_frame(clients: &Arc<Mutex<Vec<TcpStream>>>, frame: &[u8]) {
    let mut guard = clients.lock().expect("clients mutex poisoned");
    guard.retain_mut(|stream| match codec::write_framed(stream, frame) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("Dropping frame subscriber: {}", err);
            false
        }
    });
}

/// Follow a planet's frame channel, reconnecting after `backoff` whenever the
/// publisher is unreachable. Frames failing their digest are dropped. The
/// thread exits once `sender` has no receiver.
pub fn subscribe_frames<E: Send + 'static>(
    addr: SocketAddr,
    backoff: Duration,
    sender: Sender<E>,
    wrap: fn(SimulationFrame) -> E,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("frame-sub-{}", addr.port()))
        .spawn(move || loop {
            let mut stream = match TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(err) => {
                    log::debug!("Frame publisher {} unreachable: {}", addr, err);
                    thread::sleep(backoff);
                    continue;
                }
            };
            log::info!("Subscribed to frames at {}", addr);
            loop {
                match codec::read_message::<_, SimulationFrame>(&mut stream) {
                    Ok(frame) => {
                        if !frame.verify() {
                            log::warn!("Dropping frame {} with bad digest", frame.tick);
                            continue;
                        }
                        if sender.send(wrap(frame)).is_err() {
                            return;
                        }
                    }
                    Err(err) if err.is_disconnect() => {
                        log::warn!("Frame publisher {} went away", addr);
                        break;
                    }
                    Err(err) => {
                        log::warn!("Undecodable frame from {}: {}", addr, err);
                    }
                }
            }
            thread::sleep(backoff);
        })
}
