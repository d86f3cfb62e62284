//! Per-connection HTTP session.
//!
//! A [`Session`] sits on one TCP [`Transport`] and turns its byte stream
//! into [`WireMessage`]s through a [`Framer`], and outbound messages back
//! into bytes through the transport's single-in-flight send queue.
//!
//! ## Lifecycle
//!
//! ```text
//! accept/connect ─► receive loop ─► Head ─► body ─► on_message ─┐
//!                        ▲                                      │
//!                        └──────────────────────────────────────┘
//! disconnect (peer, error, idle timeout, Connection: close) ─► on_closed (once)
//! ```
//!
//! ## Exchange accounting (server role)
//!
//! Each inbound request head increments an in-flight counter; the end of
//! the matching response's transmission decrements it. At zero the
//! keep-alive timer is armed in the shared [`ExpirationScheduler`]. A
//! request that is HTTP/1.0 or older, whatever its `Connection` header
//! says, or that carries `Connection: close` ends the session once its
//! response has been sent. 1xx responses do not end an exchange.

pub mod framing;

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, UpnpError};
use crate::protocol::chunked::{LAST_CHUNK, encode_chunk};
use crate::protocol::{Body, Version, WireMessage};
use crate::scheduler::ExpirationScheduler;
use crate::transport::{ReceivedChunk, SendTag, Transport, TransportConfig, TransportHandler};
pub use framing::{FrameState, Framer, FramingRules, Step};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub type SessionId = u64;

/// Tags at or above this value are reserved for the session itself.
pub const RESERVED_TAGS: SendTag = u64::MAX - 1;
const STREAM_BLOCK: SendTag = u64::MAX - 1;
const END_OF_EXCHANGE: SendTag = u64::MAX;

const STREAM_BLOCK_SIZE: usize = 16 * 1024;

/// Default idle time before a kept-alive connection is closed.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    pub framing: FramingRules,
    /// Idle time after the last exchange before the server closes the connection.
    pub keep_alive: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            framing: FramingRules::default(),
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

impl SessionConfig {
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.transport.buffer_size = size;
        self.framing.read_chunk = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport.connect_timeout = timeout;
        self
    }

    pub fn with_implicit_empty_body(mut self, enabled: bool) -> Self {
        self.framing.implicit_empty_body = enabled;
        self
    }
}

/// Which side of the exchange this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted connection: receives requests, sends responses.
    Server,
    /// Outbound connection: sends requests, receives responses.
    Client,
}

/// Session event sink for the layer above (device/service model, pipeline).
pub trait SessionHandler: Send + Sync {
    fn on_connected(&self, _session: &Arc<Session>) {}

    fn on_connect_failed(&self, _session: &Arc<Session>) {}

    /// A header block arrived. Returning a writer streams the body into it
    /// instead of buffering; the completed message then has an empty body.
    fn on_head(&self, _session: &Arc<Session>, _head: &WireMessage) -> Option<Box<dyn Write + Send>> {
        None
    }

    fn on_message(&self, session: &Arc<Session>, message: WireMessage);

    /// A send issued with a caller tag finished writing.
    fn on_send_ready(&self, _session: &Arc<Session>, _tag: SendTag) {}

    /// The connection ended. Fires once.
    fn on_closed(&self, _session: &Arc<Session>) {}
}

struct OutboundStream {
    reader: Box<dyn Read + Send>,
}

#[derive(Default)]
struct Outbound {
    stream: Option<OutboundStream>,
    /// A caller-driven chunked body is open.
    chunking: bool,
    deferred: VecDeque<(WireMessage, Option<SendTag>)>,
}

impl Outbound {
    fn busy(&self) -> bool {
        self.stream.is_some() || self.chunking
    }
}

/// Bridges transport callbacks to a session without owning it.
struct Link {
    session: Weak<Session>,
}

pub struct Session {
    id: SessionId,
    role: Role,
    transport: OnceLock<Arc<Transport>>,
    framer: Mutex<Framer>,
    handler: Arc<dyn SessionHandler>,
    outbound: Mutex<Outbound>,
    in_flight: AtomicUsize,
    close_after_exchange: AtomicBool,
    closed: AtomicBool,
    idle: Option<(ExpirationScheduler<SessionId>, Duration)>,
}

impl Session {
    fn new(
        role: Role,
        config: &SessionConfig,
        handler: Arc<dyn SessionHandler>,
        idle: Option<ExpirationScheduler<SessionId>>,
    ) -> Self {
        Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::SeqCst),
            role,
            transport: OnceLock::new(),
            framer: Mutex::new(Framer::new(config.framing.clone())),
            handler,
            outbound: Mutex::new(Outbound::default()),
            in_flight: AtomicUsize::new(0),
            close_after_exchange: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            idle: idle.map(|s| (s, config.keep_alive)),
        }
    }

    /// Serve an accepted connection. When `idle` is given, the session's id
    /// is scheduled there whenever no exchange is in flight; the scheduler's
    /// owner is expected to [`close`](Self::close) the session on expiry.
    pub fn accept(
        stream: TcpStream,
        config: &SessionConfig,
        handler: Arc<dyn SessionHandler>,
        idle: Option<ExpirationScheduler<SessionId>>,
    ) -> Result<Arc<Self>> {
        let session = Arc::new(Self::new(Role::Server, config, handler, idle));
        let link = Arc::new(Link {
            session: Arc::downgrade(&session),
        });
        let transport = Transport::attach(stream, config.transport.clone(), link)?;
        let _ = session.transport.set(transport.clone());

        tracing::info!(session = session.id, peer = ?transport.remote_addr(), "session accepted");
        session.arm_idle();
        transport.begin_receive_loop(session.framer.lock().wanted())?;
        Ok(session)
    }

    /// Open an outbound connection. Messages sent before the connect
    /// completes are queued.
    pub fn connect(
        remote: SocketAddr,
        config: &SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Arc<Self> {
        let session = Arc::new(Self::new(Role::Client, config, handler, None));
        let link = Arc::new(Link {
            session: Arc::downgrade(&session),
        });
        let transport = Transport::connect(remote, config.transport.clone(), link);
        let _ = session.transport.set(transport);
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.get().and_then(|t| t.remote_addr())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.transport.get().is_none_or(|t| t.is_disconnected())
    }

    /// Requests whose responses have not finished sending.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn transport(&self) -> Result<&Arc<Transport>> {
        self.transport.get().ok_or(UpnpError::Closed)
    }

    /// Send a message. Streamed bodies are written in chunked framing, one
    /// block per send completion; anything sent meanwhile (or while a
    /// [`begin_chunked`](Self::begin_chunked) body is open) waits its turn.
    pub fn send(&self, message: WireMessage) -> Result<()> {
        self.send_tagged(message, None)
    }

    /// Like [`send`](Self::send); `tag` is reported through
    /// [`SessionHandler::on_send_ready`] once the message (or, for a
    /// stream, its head) is written. Tags from [`RESERVED_TAGS`] up are
    /// reserved.
    pub fn send_tagged(&self, message: WireMessage, tag: Option<SendTag>) -> Result<()> {
        {
            let mut out = self.outbound.lock();
            if out.busy() {
                out.deferred.push_back((message, tag));
                return Ok(());
            }
        }
        self.write_message(message, tag)
    }

    fn write_message(&self, mut message: WireMessage, tag: Option<SendTag>) -> Result<()> {
        let transport = self.transport()?;
        let ends_exchange =
            self.role == Role::Server && !message.is_request() && !message.is_informational();
        tracing::debug!(
            session = self.id,
            method = message.method().unwrap_or(""),
            status = message.status().unwrap_or(0),
            "send"
        );

        match std::mem::take(&mut message.body) {
            Body::Stream(stream) => {
                message.headers.remove("Content-Length");
                if !message.headers.has_token("Transfer-Encoding", "chunked") {
                    message.headers.add("Transfer-Encoding", "chunked");
                }
                self.outbound.lock().stream = Some(OutboundStream { reader: stream.0 });
                transport.send(message.head_bytes(), tag)?;
                self.pump_stream()
            }
            body => {
                message.body = body;
                transport.send(message.to_bytes(), tag)?;
                if ends_exchange {
                    transport.send(Vec::new(), Some(END_OF_EXCHANGE))?;
                }
                Ok(())
            }
        }
    }

    /// Start a chunked body the caller writes piece by piece with
    /// [`send_chunk`](Self::send_chunk) and ends with
    /// [`end_chunked`](Self::end_chunked). Messages sent in between are
    /// held until the body ends.
    pub fn begin_chunked(&self, mut head: WireMessage) -> Result<()> {
        let transport = self.transport()?;
        {
            let mut out = self.outbound.lock();
            if out.busy() {
                return Err(UpnpError::Busy);
            }
            out.chunking = true;
        }
        head.headers.remove("Content-Length");
        if !head.headers.has_token("Transfer-Encoding", "chunked") {
            head.headers.add("Transfer-Encoding", "chunked");
        }
        let head = head.without_content_length();
        transport.send(head.head_bytes(), None)
    }

    pub fn send_chunk(&self, data: &[u8], tag: Option<SendTag>) -> Result<()> {
        let framed = encode_chunk(data);
        if framed.is_empty() {
            return Ok(());
        }
        self.transport()?.send(framed, tag)
    }

    pub fn end_chunked(&self) -> Result<()> {
        self.outbound.lock().chunking = false;
        self.finish_chunked()?;
        self.flush_deferred()
    }

    fn finish_chunked(&self) -> Result<()> {
        let transport = self.transport()?;
        transport.send(LAST_CHUNK.to_vec(), None)?;
        if self.role == Role::Server {
            transport.send(Vec::new(), Some(END_OF_EXCHANGE))?;
        }
        Ok(())
    }

    /// Read the next block of the active stream and queue it. Completion
    /// of that block calls back here until the reader is exhausted.
    fn pump_stream(&self) -> Result<()> {
        let mut block = vec![0u8; STREAM_BLOCK_SIZE];
        let read = {
            let mut out = self.outbound.lock();
            let Some(stream) = out.stream.as_mut() else {
                return Ok(());
            };
            stream.reader.read(&mut block)
        };
        match read {
            Ok(0) => {
                self.outbound.lock().stream = None;
                self.finish_chunked()?;
                self.flush_deferred()
            }
            Ok(n) => self.transport()?.send(encode_chunk(&block[..n]), Some(STREAM_BLOCK)),
            Err(e) => {
                tracing::warn!(session = self.id, error = %e, "body stream failed; closing");
                self.outbound.lock().stream = None;
                self.close();
                Err(e.into())
            }
        }
    }

    fn flush_deferred(&self) -> Result<()> {
        loop {
            let next = {
                let mut out = self.outbound.lock();
                if out.busy() {
                    return Ok(());
                }
                out.deferred.pop_front()
            };
            match next {
                Some((message, tag)) => self.write_message(message, tag)?,
                None => return Ok(()),
            }
        }
    }

    /// Pause reading, e.g. while a response is produced asynchronously.
    pub fn stop_reading(&self) {
        if let Some(t) = self.transport.get() {
            t.stop_reading();
        }
    }

    pub fn resume_reading(&self) {
        if let Some(t) = self.transport.get() {
            t.resume_reading();
        }
    }

    /// Close the connection. Safe to call repeatedly and from callbacks.
    pub fn close(&self) {
        if let Some(t) = self.transport.get() {
            t.disconnect();
        }
    }

    fn arm_idle(&self) {
        if let Some((scheduler, timeout)) = &self.idle {
            scheduler.add(self.id, *timeout);
        }
    }

    fn disarm_idle(&self) {
        if let Some((scheduler, _)) = &self.idle {
            scheduler.remove(&self.id);
        }
    }

    fn exchange_finished(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous > 1 {
            return;
        }
        if self.close_after_exchange.load(Ordering::SeqCst) {
            tracing::debug!(session = self.id, "closing after final exchange");
            self.close();
        } else {
            self.arm_idle();
        }
    }

    fn on_head(self: &Arc<Self>) {
        let head = self.framer.lock().current().map(WireMessage::clone_head);
        let Some(head) = head else {
            return;
        };
        if self.role == Role::Server && head.is_request() {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.disarm_idle();
            if head.wants_close() || head.version() < Version::HTTP_11 {
                self.close_after_exchange.store(true, Ordering::SeqCst);
            }
        }
        if let Some(sink) = self.handler.on_head(self, &head) {
            self.framer.lock().attach_sink(sink);
        }
    }

    fn on_complete(self: &Arc<Self>, message: WireMessage) {
        tracing::debug!(
            session = self.id,
            method = message.method().unwrap_or(""),
            status = message.status().unwrap_or(0),
            body_len = message.body_bytes().len(),
            "message complete"
        );
        let closing = message.wants_close();
        if self.role == Role::Server && self.close_after_exchange.load(Ordering::SeqCst) {
            self.framer.lock().set_idle();
        }
        self.handler.on_message(self, message);
        if self.role == Role::Client && closing {
            self.close();
        }
    }

    fn receive(self: &Arc<Self>, chunk: &mut ReceivedChunk<'_>) {
        let mut offset = 0;
        loop {
            let (n, step) = self.framer.lock().advance(&chunk.data[offset..]);
            offset += n;
            match step {
                Step::NeedMore => break,
                Step::Head => self.on_head(),
                Step::Complete(message) => self.on_complete(message),
                Step::Informational(status) => {
                    tracing::trace!(session = self.id, status, "informational skipped");
                }
                Step::Rejected(e) => {
                    tracing::warn!(session = self.id, peer = %chunk.remote, error = %e, "header block rejected");
                }
            }
        }
        chunk.consume(offset);
        chunk.set_read_length(self.framer.lock().wanted());
    }

    fn disconnected(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disarm_idle();
        let last = self.framer.lock().finish();
        if let Some(message) = last {
            self.on_complete(message);
        }
        tracing::info!(session = self.id, "session closed");
        self.handler.on_closed(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(t) = self.transport.get() {
            t.disconnect();
        }
    }
}

impl TransportHandler for Link {
    fn on_connected(&self, transport: &Arc<Transport>) {
        let Some(session) = self.session.upgrade() else {
            transport.disconnect();
            return;
        };
        let wanted = session.framer.lock().wanted();
        if let Err(e) = transport.begin_receive_loop(wanted) {
            tracing::warn!(session = session.id, error = %e, "could not start receive loop");
            transport.disconnect();
            return;
        }
        session.handler.on_connected(&session);
    }

    fn on_connect_failed(&self, _transport: &Arc<Transport>, error: &std::io::Error) {
        if let Some(session) = self.session.upgrade() {
            tracing::debug!(session = session.id, error = %error, "session connect failed");
            session.closed.store(true, Ordering::SeqCst);
            session.handler.on_connect_failed(&session);
        }
    }

    fn on_receive(&self, transport: &Arc<Transport>, chunk: &mut ReceivedChunk<'_>) {
        match self.session.upgrade() {
            Some(session) => session.receive(chunk),
            None => transport.disconnect(),
        }
    }

    fn on_send_ready(&self, _transport: &Arc<Transport>, tag: SendTag) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match tag {
            END_OF_EXCHANGE => session.exchange_finished(),
            STREAM_BLOCK => {
                let _ = session.pump_stream();
            }
            tag => session.handler.on_send_ready(&session, tag),
        }
    }

    fn on_disconnected(&self, _transport: &Arc<Transport>) {
        if let Some(session) = self.session.upgrade() {
            session.disconnected();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::mpsc;

    struct Echo {
        messages: mpsc::Sender<WireMessage>,
        closed: mpsc::Sender<SessionId>,
    }

    impl SessionHandler for Echo {
        fn on_message(&self, session: &Arc<Session>, message: WireMessage) {
            if message.is_request() {
                let body = format!("echo {}", message.target().unwrap_or(""));
                let _ = session.send(WireMessage::response(200, "OK").with_body(body));
            }
            let _ = self.messages.send(message);
        }

        fn on_closed(&self, session: &Arc<Session>) {
            let _ = self.closed.send(session.id());
        }
    }

    fn serve_one(
        config: SessionConfig,
        idle: Option<ExpirationScheduler<SessionId>>,
    ) -> (
        TcpStream,
        Arc<Session>,
        mpsc::Receiver<WireMessage>,
        mpsc::Receiver<SessionId>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let (mtx, mrx) = mpsc::channel();
        let (ctx, crx) = mpsc::channel();
        let handler = Arc::new(Echo {
            messages: mtx,
            closed: ctx,
        });
        let session = Session::accept(stream, &config, handler, idle).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (client, session, mrx, crx)
    }

    fn read_response(reader: &mut BufReader<TcpStream>) -> String {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 {
                break;
            }
            head.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }
        let len = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).unwrap();
        head + &String::from_utf8(body).unwrap()
    }

    #[test]
    fn pipelined_requests_answered_in_order() {
        let (mut client, session, messages, _closed) = serve_one(SessionConfig::default(), None);
        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        assert!(read_response(&mut reader).ends_with("echo /a"));
        assert!(read_response(&mut reader).ends_with("echo /b"));
        for target in ["/a", "/b"] {
            let m = messages.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(m.target(), Some(target));
        }
        session.close();
    }

    #[test]
    fn http10_request_closes_after_response() {
        let (mut client, session, _messages, closed) = serve_one(SessionConfig::default(), None);
        client.write_all(b"GET /old HTTP/1.0\r\n\r\n").unwrap();
        let mut all = String::new();
        client.read_to_string(&mut all).unwrap();
        assert!(all.starts_with("HTTP/1.1 200 OK"));
        assert!(all.ends_with("echo /old"));
        assert_eq!(closed.recv_timeout(Duration::from_secs(2)).unwrap(), session.id());
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn http10_keep_alive_header_still_closes() {
        let (mut client, session, _messages, closed) = serve_one(SessionConfig::default(), None);
        client
            .write_all(b"GET /old HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
            .unwrap();
        let mut all = String::new();
        client.read_to_string(&mut all).unwrap();
        assert!(all.ends_with("echo /old"));
        assert_eq!(closed.recv_timeout(Duration::from_secs(2)).unwrap(), session.id());
    }

    #[test]
    fn informational_response_does_not_end_exchange() {
        struct Continue;
        impl SessionHandler for Continue {
            fn on_message(&self, session: &Arc<Session>, _m: WireMessage) {
                let _ = session.send(WireMessage::response(100, "Continue"));
                let _ = session.send(WireMessage::response(200, "OK").with_body("done"));
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let session = Session::accept(stream, &SessionConfig::default(), Arc::new(Continue), None).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
            .write_all(b"PUT /f HTTP/1.1\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
            .unwrap();

        let mut all = String::new();
        client.read_to_string(&mut all).unwrap();
        assert_eq!(
            all,
            "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone"
        );
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn manual_chunks_hold_back_other_sends() {
        struct Manual;
        impl SessionHandler for Manual {
            fn on_message(&self, session: &Arc<Session>, m: WireMessage) {
                if m.target() == Some("/a") {
                    session
                        .begin_chunked(WireMessage::response(200, "OK"))
                        .unwrap();
                    assert!(matches!(
                        session.begin_chunked(WireMessage::response(200, "OK")),
                        Err(UpnpError::Busy)
                    ));
                    session.send_chunk(b"hel", None).unwrap();
                    let session = session.clone();
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(100));
                        session.send_chunk(b"lo", None).unwrap();
                        session.end_chunked().unwrap();
                    });
                } else {
                    let _ = session.send(WireMessage::response(200, "OK").with_body("second"));
                }
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let session = Session::accept(stream, &SessionConfig::default(), Arc::new(Manual), None).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
            .unwrap();

        let expected = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n\
            HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecond";
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
        session.close();
    }

    #[test]
    fn paused_reading_holds_back_messages() {
        struct Pausing(mpsc::Sender<String>);
        impl SessionHandler for Pausing {
            fn on_message(&self, session: &Arc<Session>, m: WireMessage) {
                if m.target() == Some("/first") {
                    session.stop_reading();
                }
                let _ = self.0.send(m.target().unwrap_or("").to_string());
            }
        }

        let (tx, rx) = mpsc::channel();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let session = Session::accept(stream, &SessionConfig::default(), Arc::new(Pausing(tx)), None).unwrap();

        client.write_all(b"GET /first HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "/first");

        client.write_all(b"GET /second HTTP/1.1\r\n\r\n").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        session.resume_reading();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "/second");
        session.close();
    }

    #[test]
    fn idle_timeout_closes_exactly_once() {
        let closer: Arc<Mutex<Vec<Weak<Session>>>> = Arc::new(Mutex::new(Vec::new()));
        let sessions = closer.clone();
        let idle = ExpirationScheduler::new(move |id: SessionId| {
            for s in sessions.lock().iter().filter_map(Weak::upgrade) {
                if s.id() == id {
                    s.close();
                }
            }
        });
        let config = SessionConfig::default().with_keep_alive(Duration::from_millis(100));
        let (mut client, session, _messages, closed) = serve_one(config, Some(idle.clone()));
        closer.lock().push(Arc::downgrade(&session));

        client.write_all(b"GET /x HTTP/1.1\r\n\r\n").unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        assert!(read_response(&mut reader).ends_with("echo /x"));

        assert_eq!(closed.recv_timeout(Duration::from_secs(2)).unwrap(), session.id());
        session.close();
        assert!(closed.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(!idle.contains(&session.id()));
    }

    #[test]
    fn streamed_body_goes_out_chunked() {
        struct Streamer;
        impl SessionHandler for Streamer {
            fn on_message(&self, session: &Arc<Session>, _m: WireMessage) {
                let data = std::io::Cursor::new(vec![b'z'; 20_000]);
                let _ = session.send(WireMessage::response(200, "OK").with_stream(data));
                let _ = session.send(WireMessage::response(200, "OK").with_body("after"));
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let session = Session::accept(stream, &SessionConfig::default(), Arc::new(Streamer), None).unwrap();
        client.write_all(b"GET /big HTTP/1.1\r\n\r\n").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut framer = Framer::new(FramingRules::default());
        let mut pending = Vec::new();
        let mut done = Vec::new();
        let mut buf = [0u8; 4096];
        while done.len() < 2 {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "server closed early");
            pending.extend_from_slice(&buf[..n]);
            loop {
                let (used, step) = framer.advance(&pending);
                pending.drain(..used);
                match step {
                    Step::NeedMore => break,
                    Step::Complete(m) => done.push(m),
                    _ => {}
                }
            }
        }
        assert!(done[0].headers.has_token("Transfer-Encoding", "chunked"));
        assert_eq!(done[0].body_bytes().len(), 20_000);
        assert_eq!(done[1].body_bytes(), b"after");
        session.close();
    }
}
