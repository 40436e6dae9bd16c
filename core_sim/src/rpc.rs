//! Request/reply channel between front-end workers and the model authority.
//!
//! The server decodes each request and hands it to the authority event loop,
//! which is the single writer; a connection waits for its reply before reading
//! the next request. The client serializes every caller through one worker
//! thread, so at most one request per client is ever in flight.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use sim_proto::{codec, CodecError, ErrorCode, Reply, ReplyEnvelope, Request, RequestEnvelope};
use thiserror::Error;

use crate::authority::AuthorityEvent;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("reply correlation {received} does not match request {expected}")]
    Protocol { expected: u64, received: u64 },
    #[error("rpc channel disconnected")]
    Disconnected,
}

pub struct RpcServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
}

impl RpcServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub fn start_rpc_server(
    bind_addr: SocketAddr,
    events: Sender<AuthorityEvent>,
) -> io::Result<RpcServer> {
    let listener = TcpListener::bind(bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let stop = Arc::new(AtomicBool::new(false));
    let accept_stop = Arc::clone(&stop);

    thread::Builder::new()
        .name("rpc-accept".into())
        .spawn(move || {
            while !accept_stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        log::info!("RPC client connected: {}", addr);
                        if let Err(err) = stream.set_nonblocking(false) {
                            log::warn!("Failed to set blocking mode for RPC client {}: {}", addr, err);
                            continue;
                        }
                        if let Err(err) = stream.set_nodelay(true) {
                            log::warn!("Failed to set TCP_NODELAY: {}", err);
                        }
                        let events = events.clone();
                        let spawned = thread::Builder::new()
                            .name(format!("rpc-{}", addr))
                            .spawn(move || serve_connection(stream, addr, events));
                        if let Err(err) = spawned {
                            log::error!("Failed to spawn RPC connection thread: {}", err);
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        log::error!("Error accepting RPC client: {}", err);
                        thread::sleep(Duration::from_millis(200));
                    }
                }
            }
        })?;

    Ok(RpcServer { local_addr, stop })
}

fn serve_connection(mut stream: TcpStream, addr: SocketAddr, events: Sender<AuthorityEvent>) {
    loop {
        let payload = match codec::read_payload(&mut stream) {
            Ok(payload) => payload,
            Err(err) => {
                if !err.is_disconnect() {
                    log::warn!("Dropping RPC client {}: {}", addr, err);
                }
                break;
            }
        };

        let (correlation_id, reply) = match codec::decode_message::<RequestEnvelope>(&payload) {
            Ok(envelope) => {
                let Some(reply) = forward(&events, envelope.request) else {
                    log::warn!("Authority gone; closing RPC client {}", addr);
                    break;
                };
                (envelope.correlation_id, reply)
            }
            Err(err) => {
                log::warn!("Malformed request from {}: {}", addr, err);
                (0, Err(ErrorCode::MalformedRequest))
            }
        };

        if let Err(err) = codec::write_message(&mut stream, &ReplyEnvelope { correlation_id, reply }) {
            log::warn!("Failed to reply to RPC client {}: {}", addr, err);
            break;
        }
    }
    log::info!("RPC client disconnected: {}", addr);
}

fn forward(events: &Sender<AuthorityEvent>, request: Request) -> Option<Reply> {
    let (reply, receiver) = bounded(1);
    events.send(AuthorityEvent::Request { request, reply }).ok()?;
    receiver.recv().ok()
}

struct PendingCall {
    request: Request,
    reply: Sender<Result<Reply, RpcError>>,
}

/// Cloneable handle onto one connection. Calls from every clone queue behind
/// each other in FIFO order.
#[derive(Clone)]
pub struct RpcClient {
    calls: Sender<PendingCall>,
}

impl RpcClient {
    /// Start the client worker. The connection is opened on first use and
    /// reopened after any failure.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let (calls, queue) = unbounded();
        thread::Builder::new()
            .name(format!("rpc-client-{}", addr.port()))
            .spawn(move || run_client(addr, timeout, queue))?;
        Ok(Self { calls })
    }

    pub fn call(&self, request: Request) -> Result<Reply, RpcError> {
        let (reply, receiver) = bounded(1);
        self.calls
            .send(PendingCall { request, reply })
            .map_err(|_| RpcError::Disconnected)?;
        receiver.recv().map_err(|_| RpcError::Disconnected)?
    }
}

fn run_client(addr: SocketAddr, timeout: Duration, queue: Receiver<PendingCall>) {
    let mut connection: Option<TcpStream> = None;
    let mut next_correlation = 1u64;

    for call in queue.iter() {
        let correlation_id = next_correlation;
        next_correlation += 1;

        let result = exchange(&mut connection, addr, timeout, correlation_id, call.request);
        if let Err(err) = &result {
            log::warn!("RPC {} to {} failed: {}", correlation_id, addr, err);
            connection = None;
        }
        // Caller may have given up; nothing to do then.
        let _ = call.reply.send(result);
    }
}

fn exchange(
    connection: &mut Option<TcpStream>,
    addr: SocketAddr,
    timeout: Duration,
    correlation_id: u64,
    request: Request,
) -> Result<Reply, RpcError> {
    if connection.is_none() {
        *connection = Some(open(addr, timeout)?);
    }
    let stream = connection.as_mut().ok_or(RpcError::Disconnected)?;

    codec::write_message(
        stream,
        &RequestEnvelope {
            correlation_id,
            request,
        },
    )?;
    let envelope: ReplyEnvelope = codec::read_message(stream).map_err(|err| {
        if err.is_timeout() {
            RpcError::Timeout(timeout)
        } else if err.is_disconnect() {
            RpcError::Disconnected
        } else {
            RpcError::Codec(err)
        }
    })?;

    if envelope.correlation_id != correlation_id {
        return Err(RpcError::Protocol {
            expected: correlation_id,
            received: envelope.correlation_id,
        });
    }
    Ok(envelope.reply)
}

fn open(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, RpcError> {
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|source| RpcError::Connect { addr, source })?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
