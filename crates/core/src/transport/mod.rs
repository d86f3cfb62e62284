//! Byte-socket layer under the HTTP and SSDP engines.
//!
//! A [`Transport`] owns one TCP stream or UDP socket, a [`ReceiveBuffer`]
//! and a strictly ordered send queue. It reports what happens through a
//! [`TransportHandler`]:
//!
//! - **connect**: exactly one of `on_connected` / `on_connect_failed`.
//! - **receive**: one read outstanding at a time, sized by the handler. The
//!   handler consumes what it can from the unread bytes and sets the next
//!   read length through [`ReceivedChunk`]. UDP delivers whole datagrams.
//! - **send**: at most one write in flight per socket; later sends queue in
//!   FIFO order and each tagged completion fires `on_send_ready(tag)`.
//! - **disconnect**: every failure path funnels into `on_disconnected`,
//!   which fires at most once per transport.
//!
//! Each transport runs its receive loop on its own thread.
//!
//! - [`tcp`]: non-blocking accept loop feeding new streams to a callback.
//! - [`udp`]: short-lived multicast sender for announcement bursts.

pub mod buffer;
pub mod tcp;
pub mod udp;

pub use buffer::ReceiveBuffer;

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, UpnpError};

static TRANSPORT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Caller-chosen value echoed back by [`TransportHandler::on_send_ready`].
pub type SendTag = u64;

/// Largest UDP payload accepted by the datagram receive loop.
pub const MAX_DATAGRAM: usize = 65_507;

const UDP_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Initial receive buffer capacity.
    pub buffer_size: usize,
    /// Timeout for outbound TCP connects.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Transport event sink. Every method runs on a transport-owned thread or
/// on the thread that triggered the event (a send completion, a failed
/// write); none of them hold transport locks.
pub trait TransportHandler: Send + Sync {
    fn on_connected(&self, _transport: &Arc<Transport>) {}

    fn on_connect_failed(&self, _transport: &Arc<Transport>, _error: &io::Error) {}

    fn on_receive(&self, transport: &Arc<Transport>, chunk: &mut ReceivedChunk<'_>);

    fn on_send_ready(&self, _transport: &Arc<Transport>, _tag: SendTag) {}

    fn on_disconnected(&self, _transport: &Arc<Transport>) {}
}

/// View handed to [`TransportHandler::on_receive`].
///
/// `data` is every unread byte (earlier leftovers plus `bytes_just_read`
/// new ones). Bytes not [`consume`](Self::consume)d stay in the buffer and
/// are offered again on the next callback.
pub struct ReceivedChunk<'a> {
    pub data: &'a [u8],
    pub bytes_just_read: usize,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    consumed: usize,
    read_length: usize,
    stop: bool,
}

impl ReceivedChunk<'_> {
    pub fn consume(&mut self, n: usize) {
        self.consumed = (self.consumed + n).min(self.data.len());
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Upper bound for the next read.
    pub fn set_read_length(&mut self, n: usize) {
        self.read_length = n.max(1);
    }

    pub fn read_length(&self) -> usize {
        self.read_length
    }

    /// Pause the receive loop after this callback (see [`Transport::stop_reading`]).
    pub fn stop_reading(&mut self) {
        self.stop = true;
    }
}

enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Socket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(s) => s.local_addr(),
            Socket::Udp(s) => s.local_addr(),
        }
    }
}

struct Outgoing {
    data: Vec<u8>,
    dest: Option<SocketAddr>,
    tag: Option<SendTag>,
}

#[derive(Default)]
struct SendQueue {
    queue: VecDeque<Outgoing>,
    in_flight: bool,
}

#[derive(Default)]
struct ReadControl {
    started: bool,
    paused: bool,
}

/// One physical socket with managed receive and send paths.
pub struct Transport {
    id: u64,
    config: TransportConfig,
    socket: OnceLock<Socket>,
    remote: Mutex<Option<SocketAddr>>,
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    sends: Mutex<SendQueue>,
    reading: Mutex<ReadControl>,
    resume: Condvar,
    disconnected: AtomicBool,
}

impl Transport {
    fn with_handler(config: TransportConfig, handler: Arc<dyn TransportHandler>) -> Self {
        Self {
            id: TRANSPORT_COUNTER.fetch_add(1, Ordering::SeqCst),
            config,
            socket: OnceLock::new(),
            remote: Mutex::new(None),
            handler: Mutex::new(Some(handler)),
            sends: Mutex::new(SendQueue::default()),
            reading: Mutex::new(ReadControl::default()),
            resume: Condvar::new(),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Wrap an already connected stream (e.g. one returned by `accept`).
    pub fn attach(
        stream: TcpStream,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<Self>> {
        stream.set_nonblocking(false)?;
        let remote = stream.peer_addr()?;
        let transport = Self::with_handler(config, handler);
        *transport.remote.lock() = Some(remote);
        let _ = transport.socket.set(Socket::Tcp(stream));
        Ok(Arc::new(transport))
    }

    /// Bind a UDP socket on `local`.
    pub fn open_udp(
        local: SocketAddr,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(UDP_POLL))?;
        let transport = Self::with_handler(config, handler);
        let _ = transport.socket.set(Socket::Udp(socket));
        Ok(Arc::new(transport))
    }

    /// Start a TCP connect in the background. Exactly one of
    /// `on_connected` / `on_connect_failed` follows. Sends issued before the
    /// connect completes are queued and flushed once it does.
    pub fn connect(
        remote: SocketAddr,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
    ) -> Arc<Self> {
        let transport = Arc::new(Self::with_handler(config, handler));
        *transport.remote.lock() = Some(remote);

        let t = transport.clone();
        thread::spawn(move || {
            match TcpStream::connect_timeout(&remote, t.config.connect_timeout) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let _ = t.socket.set(Socket::Tcp(stream));
                    tracing::debug!(transport = t.id, %remote, "connected");
                    if let Some(h) = t.handler() {
                        h.on_connected(&t);
                    }
                    t.kick_sends();
                }
                Err(e) => {
                    tracing::debug!(transport = t.id, %remote, error = %e, "connect failed");
                    if t
                        .disconnected
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let handler = t.handler.lock().take();
                        t.sends.lock().queue.clear();
                        if let Some(h) = handler {
                            h.on_connect_failed(&t, &e);
                        }
                    }
                }
            }
        });
        transport
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.get().and_then(|s| s.local_addr().ok())
    }

    /// Connected peer for TCP; `None` for UDP.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.get().is_some() && !self.is_disconnected()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler.lock().clone()
    }

    /// Spawn the receive loop with `read_length` as the first read size.
    /// Calling it again is a no-op.
    pub fn begin_receive_loop(self: &Arc<Self>, read_length: usize) -> Result<()> {
        if self.is_disconnected() {
            return Err(UpnpError::Closed);
        }
        let socket = self.socket.get().ok_or(UpnpError::NotStarted)?;
        {
            let mut reading = self.reading.lock();
            if reading.started {
                return Ok(());
            }
            reading.started = true;
        }
        let t = self.clone();
        match socket {
            Socket::Tcp(s) => {
                let stream = s.try_clone()?;
                thread::spawn(move || t.stream_loop(stream, read_length));
            }
            Socket::Udp(s) => {
                let socket = s.try_clone()?;
                thread::spawn(move || t.datagram_loop(socket));
            }
        }
        Ok(())
    }

    /// Pause future reads without closing. Resume with
    /// [`resume_reading`](Self::resume_reading).
    pub fn stop_reading(&self) {
        self.reading.lock().paused = true;
    }

    pub fn resume_reading(&self) {
        self.reading.lock().paused = false;
        self.resume.notify_all();
    }

    /// Blocks while paused. Returns `false` once disconnected.
    fn wait_until_readable(&self) -> bool {
        let mut reading = self.reading.lock();
        while reading.paused && !self.is_disconnected() {
            self.resume.wait(&mut reading);
        }
        !self.is_disconnected()
    }

    fn stream_loop(self: Arc<Self>, mut stream: TcpStream, mut read_length: usize) {
        let Some(handler) = self.handler() else {
            return;
        };
        let local = stream.local_addr().unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
        let Some(remote) = self.remote_addr() else {
            return;
        };
        let mut buffer = ReceiveBuffer::new(self.config.buffer_size);

        while self.wait_until_readable() {
            let n = match buffer.read_from(&mut stream, read_length) {
                Ok(0) => {
                    tracing::debug!(transport = self.id, %remote, "peer closed");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.is_disconnected() {
                        tracing::debug!(transport = self.id, %remote, error = %e, "read error");
                    }
                    break;
                }
            };

            let mut chunk = ReceivedChunk {
                data: buffer.unread(),
                bytes_just_read: n,
                local,
                remote,
                consumed: 0,
                read_length,
                stop: false,
            };
            handler.on_receive(&self, &mut chunk);
            let (consumed, next, stop) = (chunk.consumed, chunk.read_length, chunk.stop);
            buffer.consume(consumed);
            read_length = next;
            if stop {
                self.stop_reading();
            }
        }
        self.disconnect();
    }

    fn datagram_loop(self: Arc<Self>, socket: UdpSocket) {
        let Some(handler) = self.handler() else {
            return;
        };
        let local = socket
            .local_addr()
            .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
        let mut buffer = ReceiveBuffer::new(MAX_DATAGRAM);

        while self.wait_until_readable() {
            buffer.clear();
            let (n, remote) = match socket.recv_from(buffer.reserve(MAX_DATAGRAM)) {
                Ok(r) => r,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(transport = self.id, error = %e, "datagram receive failed");
                    break;
                }
            };
            buffer.commit(n);

            let mut chunk = ReceivedChunk {
                data: buffer.unread(),
                bytes_just_read: n,
                local,
                remote,
                consumed: 0,
                read_length: MAX_DATAGRAM,
                stop: false,
            };
            handler.on_receive(&self, &mut chunk);
            if chunk.stop {
                self.stop_reading();
            }
        }
        self.disconnect();
    }

    /// Queue `data` for the connected peer.
    pub fn send(self: &Arc<Self>, data: Vec<u8>, tag: Option<SendTag>) -> Result<()> {
        self.enqueue(Outgoing {
            data,
            dest: None,
            tag,
        })
    }

    /// Queue a datagram for `dest` (UDP transports only).
    pub fn send_to(
        self: &Arc<Self>,
        data: Vec<u8>,
        dest: SocketAddr,
        tag: Option<SendTag>,
    ) -> Result<()> {
        self.enqueue(Outgoing {
            data,
            dest: Some(dest),
            tag,
        })
    }

    fn enqueue(self: &Arc<Self>, out: Outgoing) -> Result<()> {
        if self.is_disconnected() {
            return Err(UpnpError::Closed);
        }
        {
            let mut q = self.sends.lock();
            q.queue.push_back(out);
            if q.in_flight || self.socket.get().is_none() {
                return Ok(());
            }
            q.in_flight = true;
        }
        self.drain_sends();
        Ok(())
    }

    fn kick_sends(self: &Arc<Self>) {
        {
            let mut q = self.sends.lock();
            if q.in_flight || q.queue.is_empty() {
                return;
            }
            q.in_flight = true;
        }
        self.drain_sends();
    }

    /// Runs on whichever thread won the in-flight slot. Completions may
    /// enqueue more data; it is picked up by this same loop.
    fn drain_sends(self: &Arc<Self>) {
        loop {
            let next = {
                let mut q = self.sends.lock();
                match q.queue.pop_front() {
                    Some(out) => out,
                    None => {
                        q.in_flight = false;
                        return;
                    }
                }
            };
            if let Err(e) = self.write(&next) {
                tracing::debug!(transport = self.id, error = %e, "send failed");
                {
                    let mut q = self.sends.lock();
                    q.queue.clear();
                    q.in_flight = false;
                }
                self.disconnect();
                return;
            }
            if let Some(tag) = next.tag
                && let Some(h) = self.handler()
            {
                h.on_send_ready(self, tag);
            }
        }
    }

    fn write(&self, out: &Outgoing) -> io::Result<()> {
        match (self.socket.get(), out.dest) {
            (Some(Socket::Tcp(s)), _) => {
                let mut stream: &TcpStream = s;
                stream.write_all(&out.data)?;
                stream.flush()
            }
            (Some(Socket::Udp(s)), Some(dest)) => s.send_to(&out.data, dest).map(|_| ()),
            (Some(Socket::Udp(_)), None) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram send without destination",
            )),
            (None, _) => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub fn pending_sends(&self) -> usize {
        self.sends.lock().queue.len()
    }

    /// Close the socket. Idempotent; `on_disconnected` fires on the first
    /// call only, after which the handler is released.
    pub fn disconnect(self: &Arc<Self>) {
        if self
            .disconnected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Some(Socket::Tcp(s)) = self.socket.get() {
            let _ = s.shutdown(Shutdown::Both);
        }
        self.sends.lock().queue.clear();
        self.resume_reading();

        tracing::debug!(transport = self.id, "disconnected");
        let handler = self.handler.lock().take();
        if let Some(h) = handler {
            h.on_disconnected(self);
        }
    }

    /// Join `group` on `interface`, with multicast loopback enabled.
    pub fn add_membership(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
        let socket = self.udp()?;
        socket.join_multicast_v4(&group, &interface)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(())
    }

    pub fn drop_membership(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
        self.udp()?.leave_multicast_v4(&group, &interface)?;
        Ok(())
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        self.udp()?.set_multicast_ttl_v4(ttl)?;
        Ok(())
    }

    fn udp(&self) -> Result<&UdpSocket> {
        match self.socket.get() {
            Some(Socket::Udp(s)) => Ok(s),
            _ => Err(UpnpError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a UDP transport",
            ))),
        }
    }
}
