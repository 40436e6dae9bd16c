//! Client-lifecycle pub/sub.
//!
//! Workers connect to the authority's hub, push lifecycle events up and
//! receive every entity-update broadcast back. Delivery is at most once: a
//! subscriber that fails a write is dropped and must reconnect.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use sim_proto::{codec, NotificationEnvelope, UpdateSource};

use crate::authority::AuthorityEvent;

/// Where the authority publishes what it changed.
pub trait NotificationSink: Send {
    fn publish(&mut self, notifications: Vec<NotificationEnvelope>);
}

impl NotificationSink for Sender<NotificationEnvelope> {
    fn publish(&mut self, notifications: Vec<NotificationEnvelope>) {
        for envelope in notifications {
            if self.send(envelope).is_err() {
                break;
            }
        }
    }
}

pub struct NotificationHub {
    sender: Sender<Vec<u8>>,
    local_addr: SocketAddr,
    clients: Arc<Mutex<Vec<TcpStream>>>,
}

impl NotificationHub {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().expect("clients mutex poisoned").len()
    }
}

impl NotificationSink for NotificationHub {
    fn publish(&mut self, notifications: Vec<NotificationEnvelope>) {
        for envelope in notifications {
            match codec::encode_message(&envelope) {
                Ok(bytes) => {
                    if let Err(err) = self.sender.send(bytes) {
                        log::error!("Failed to queue notification: {}", err);
                        return;
                    }
                }
                Err(err) => log::error!(
                    "Failed to encode {} notification: {}",
                    envelope.notification.kind(),
                    err
                ),
            }
        }
    }
}

/// Bind the hub. Lifecycle events read from subscribers are forwarded to
/// `events`; anything else a subscriber sends is ignored.
pub fn start_notification_hub(
    bind_addr: SocketAddr,
    events: Sender<AuthorityEvent>,
) -> io::Result<NotificationHub> {
    let listener = TcpListener::bind(bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let (sender, receiver) = unbounded::<Vec<u8>>();
    let clients: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
    let registered = Arc::clone(&clients);

    thread::Builder::new()
        .name("notification-hub".into())
        .spawn(move || loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("Notification subscriber connected: {}", addr);
                    match register(stream, addr, &events) {
                        Ok(stream) => clients.lock().expect("clients mutex poisoned").push(stream),
                        Err(err) => log::warn!("Failed to register subscriber {}: {}", addr, err),
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(err) => {
                    log::error!("Error accepting notification subscriber: {}", err);
                    thread::sleep(Duration::from_millis(200));
                }
            }

            loop {
                match receiver.try_recv() {
                    Ok(bytes) => broadcast(&clients, &bytes),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        for stream in clients.lock().expect("clients mutex poisoned").iter() {
                            let _ = stream.shutdown(Shutdown::Both);
                        }
                        return;
                    }
                }
            }
        })?;

    Ok(NotificationHub {
        sender,
        local_addr,
        clients: registered,
    })
}

fn register(
    stream: TcpStream,
    addr: SocketAddr,
    events: &Sender<AuthorityEvent>,
) -> io::Result<TcpStream> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = stream.try_clone()?;
    let events = events.clone();
    thread::Builder::new()
        .name(format!("hub-reader-{}", addr))
        .spawn(move || loop {
            match codec::read_message::<_, NotificationEnvelope>(&mut reader) {
                Ok(envelope) if envelope.source == UpdateSource::Lifecycle => {
                    if events.send(AuthorityEvent::Lifecycle(envelope)).is_err() {
                        return;
                    }
                }
                Ok(envelope) => {
                    log::debug!(
                        "Ignoring {} notification from subscriber {}",
                        envelope.notification.kind(),
                        addr
                    );
                }
                Err(err) if err.is_disconnect() => return,
                Err(err) => {
                    log::warn!("Bad notification from {}: {}", addr, err);
                    if !matches!(err, sim_proto::CodecError::Decode(_)) {
                        return;
                    }
                }
            }
        })?;
    Ok(stream)
}

fn broadcast(clients: &Arc<Mutex<Vec<TcpStream>>>, bytes: &[u8]) {
    let mut guard = clients.lock().expect("clients mutex poisoned");
    guard.retain_mut(|stream| match codec::write_framed(stream, bytes) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("Dropping notification subscriber: {}", err);
            false
        }
    });
}

/// Subscriber end of the hub, reconnecting after `backoff` on failure.
/// Broadcasts sent while it was disconnected are gone; `connections` tells
/// the owner when that may have happened.
pub struct NotificationLink {
    outbound: Sender<NotificationEnvelope>,
    inbound: Receiver<NotificationEnvelope>,
    connections: Arc<AtomicU64>,
}

impl NotificationLink {
    pub fn connect(addr: SocketAddr, backoff: Duration) -> io::Result<Self> {
        let (outbound, outbound_rx) = unbounded::<NotificationEnvelope>();
        let (inbound_tx, inbound) = unbounded::<NotificationEnvelope>();
        let connections = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&connections);

        thread::Builder::new()
            .name(format!("notification-link-{}", addr.port()))
            .spawn(move || loop {
                let stream = match TcpStream::connect(addr) {
                    Ok(stream) => stream,
                    Err(err) => {
                        log::debug!("Notification hub {} unreachable: {}", addr, err);
                        if matches!(outbound_rx.try_recv(), Err(TryRecvError::Disconnected)) {
                            return;
                        }
                        thread::sleep(backoff);
                        continue;
                    }
                };
                log::info!("Connected to notification hub {}", addr);
                counter.fetch_add(1, Ordering::AcqRel);
                if !pump(stream, &outbound_rx, &inbound_tx) {
                    return;
                }
                thread::sleep(backoff);
            })?;

        Ok(Self {
            outbound,
            inbound,
            connections,
        })
    }

    /// Number of times the link has (re)connected.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Fire and forget; lost if the hub is unreachable for good.
    pub fn send(&self, envelope: NotificationEnvelope) {
        if self.outbound.send(envelope).is_err() {
            log::warn!("Notification link closed");
        }
    }

    pub fn inbound(&self) -> &Receiver<NotificationEnvelope> {
        &self.inbound
    }
}

/// Move traffic over one connection. Returns false once the link owner is
/// gone and the supervisor should stop.
fn pump(
    mut stream: TcpStream,
    outbound: &Receiver<NotificationEnvelope>,
    inbound: &Sender<NotificationEnvelope>,
) -> bool {
    let mut reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(err) => {
            log::warn!("Failed to clone notification stream: {}", err);
            return true;
        }
    };
    let (closed_tx, closed) = bounded::<()>(1);
    let inbound = inbound.clone();
    let spawned = thread::Builder::new()
        .name("notification-link-reader".into())
        .spawn(move || {
            let _closed = closed_tx;
            loop {
                match codec::read_message::<_, NotificationEnvelope>(&mut reader) {
                    Ok(envelope) => {
                        if inbound.send(envelope).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        if !err.is_disconnect() {
                            log::warn!("Notification link read failed: {}", err);
                        }
                        return;
                    }
                }
            }
        });
    if let Err(err) = spawned {
        log::error!("Failed to spawn notification reader: {}", err);
        return true;
    }

    loop {
        select! {
            recv(outbound) -> message => match message {
                Ok(envelope) => {
                    if let Err(err) = codec::write_message(&mut stream, &envelope) {
                        log::warn!("Notification link write failed: {}", err);
                        let _ = stream.shutdown(Shutdown::Both);
                        return true;
                    }
                }
                Err(_) => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return false;
                }
            },
            recv(closed) -> _ => {
                log::warn!("Notification hub connection lost");
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_proto::{Notification, PlanetId, SocketId, TycoonId};

    #[test]
    fn lifecycle_events_reach_the_authority_and_broadcasts_reach_links() {
        let (events, inbox) = unbounded();
        let mut hub = start_notification_hub("127.0.0.1:0".parse().unwrap(), events).unwrap();
        let link = NotificationLink::connect(hub.local_addr(), Duration::from_millis(20)).unwrap();
        while hub.subscriber_count() == 0 || link.connections() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(link.connections(), 1);

        link.send(NotificationEnvelope::lifecycle(Notification::SocketConnected {
            socket_id: SocketId(4),
            tycoon_id: TycoonId(2),
            planet_id: PlanetId(1),
        }));
        match inbox.recv_timeout(Duration::from_secs(5)).unwrap() {
            AuthorityEvent::Lifecycle(envelope) => {
                assert_eq!(envelope.notification.kind(), "socket_connected")
            }
            _ => panic!("expected a lifecycle event"),
        }

        hub.publish(vec![NotificationEnvelope::mutation(
            Notification::BuildingsDeleted {
                planet_id: PlanetId(1),
                building_ids: Vec::new(),
            },
        )]);
        let received = link
            .inbound()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(received.source, UpdateSource::Mutation);
    }
}
