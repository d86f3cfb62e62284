//! Client-side request ordering.
//!
//! A [`RequestPipeline`] keeps one logical request stream per destination.
//! While pipelining is allowed every request goes straight onto the
//! destination's shared connection and responses are matched to requests
//! strictly first-in first-out.
//!
//! ```text
//! submit ─► lane(dest) ─┬─ pipelining ─► shared link ─► FIFO match ─► on_response
//!                       └─ disabled ───► dedicated link per request
//! ```
//!
//! If a shared connection closes before answering anything while requests
//! are outstanding, the destination is marked non-pipelining and each
//! outstanding request is resubmitted on its own connection. A refused
//! connect completes every queued request with
//! [`PipelineOutcome::NoResponse`]. A request with a streamed body can be
//! written only once, so it is never resubmitted; if its connection closes
//! unanswered it also completes with `NoResponse`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::{Body, StartLine, Version, WireMessage};
use crate::scheduler::ExpirationScheduler;
use crate::session::{Session, SessionConfig, SessionHandler};

static LINK_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Caller-chosen value identifying a request in [`PipelineHandler::on_response`].
pub type RequestTag = u64;

type LinkId = u64;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Pipeline requests on one shared connection per destination.
    pub pipelining: bool,
    /// Close a shared connection after this long without outstanding requests.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Send every request through this HTTP proxy. Implies no pipelining.
    pub proxy: Option<SocketAddr>,
    pub session: SessionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipelining: true,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            proxy: None,
            session: SessionConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_pipelining(mut self, enabled: bool) -> Self {
        self.pipelining = enabled;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: SocketAddr) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

/// How a submitted request ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    Response(WireMessage),
    /// The destination refused the connection or never answered.
    NoResponse,
}

impl PipelineOutcome {
    pub fn response(&self) -> Option<&WireMessage> {
        match self {
            PipelineOutcome::Response(m) => Some(m),
            PipelineOutcome::NoResponse => None,
        }
    }

    pub fn into_response(self) -> Option<WireMessage> {
        match self {
            PipelineOutcome::Response(m) => Some(m),
            PipelineOutcome::NoResponse => None,
        }
    }
}

pub trait PipelineHandler: Send + Sync {
    /// Completion for a request submitted without its own callback.
    fn on_response(&self, tag: RequestTag, outcome: PipelineOutcome);

    /// A shared connection was closed by the idle timer.
    fn on_inactive_closed(&self, _destination: SocketAddr) {}
}

type Completion = Box<dyn FnOnce(PipelineOutcome) + Send>;

/// One queued request.
pub struct PipelineEntry {
    pub destination: SocketAddr,
    pub message: WireMessage,
    pub tag: RequestTag,
    on_complete: Option<Completion>,
    /// The body stream has been handed to a connection.
    streamed: bool,
}

impl PipelineEntry {
    pub fn new(destination: SocketAddr, message: WireMessage, tag: RequestTag) -> Self {
        Self {
            destination,
            message,
            tag,
            on_complete: None,
            streamed: false,
        }
    }

    /// Complete through `f` instead of [`PipelineHandler::on_response`].
    pub fn with_callback(mut self, f: impl FnOnce(PipelineOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

struct Lane {
    pipelining: bool,
    shared: Option<LinkId>,
}

struct Link {
    destination: SocketAddr,
    dedicated: bool,
    session: Arc<Session>,
    outstanding: VecDeque<PipelineEntry>,
    delivered: usize,
    to_send: VecDeque<WireMessage>,
    sending: bool,
}

#[derive(Default)]
struct State {
    lanes: HashMap<SocketAddr, Lane>,
    links: HashMap<LinkId, Link>,
    closing: bool,
}

struct Inner {
    config: PipelineConfig,
    session_config: SessionConfig,
    handler: Arc<dyn PipelineHandler>,
    state: Mutex<State>,
    idle: ExpirationScheduler<LinkId>,
}

/// Routes session events of one connection back to the pipeline.
struct LinkEvents {
    inner: Weak<Inner>,
    link: LinkId,
}

impl SessionHandler for LinkEvents {
    fn on_connect_failed(&self, _session: &Arc<Session>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.retire(self.link, true);
        }
    }

    fn on_message(&self, _session: &Arc<Session>, message: WireMessage) {
        if let Some(inner) = self.inner.upgrade() {
            inner.deliver(self.link, message);
        }
    }

    fn on_closed(&self, _session: &Arc<Session>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.retire(self.link, false);
        }
    }
}

pub struct RequestPipeline {
    inner: Arc<Inner>,
}

impl RequestPipeline {
    pub fn new(config: PipelineConfig, handler: Arc<dyn PipelineHandler>) -> Self {
        let session_config = config
            .session
            .clone()
            .with_connect_timeout(config.connect_timeout);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                config,
                session_config,
                handler,
                state: Mutex::new(State::default()),
                idle: ExpirationScheduler::new(move |link: LinkId| {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(link);
                    }
                }),
            }
        });
        Self { inner }
    }

    /// Queue `message` for `destination`; completion arrives through the
    /// handler with `tag`.
    pub fn request(&self, destination: SocketAddr, message: WireMessage, tag: RequestTag) {
        self.inner.submit(PipelineEntry::new(destination, message, tag));
    }

    pub fn submit(&self, entry: PipelineEntry) {
        self.inner.submit(entry);
    }

    /// Whether requests to `destination` currently share a connection.
    pub fn is_pipelining(&self, destination: SocketAddr) -> bool {
        let state = self.inner.state.lock();
        state
            .lanes
            .get(&destination)
            .map_or(self.inner.lane_default(), |lane| lane.pipelining)
    }

    /// Requests submitted but not yet completed.
    pub fn outstanding(&self) -> usize {
        let state = self.inner.state.lock();
        state.links.values().map(|l| l.outstanding.len()).sum()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().links.len()
    }

    /// Close every connection. Outstanding requests complete with
    /// [`PipelineOutcome::NoResponse`]; later submissions do too.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.closing = true;
            state.links.values().map(|l| l.session.clone()).collect()
        };
        for session in sessions {
            session.close();
        }
    }
}

impl Drop for RequestPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lane_default(&self) -> bool {
        self.config.pipelining && self.config.proxy.is_none()
    }

    fn submit(self: &Arc<Self>, mut entry: PipelineEntry) {
        let destination = entry.destination;
        let wire = self.prepare(&mut entry);

        let mut state = self.state.lock();
        if state.closing {
            drop(state);
            self.complete(entry, PipelineOutcome::NoResponse);
            return;
        }
        let default = self.lane_default();
        let lane = state.lanes.entry(destination).or_insert(Lane {
            pipelining: default,
            shared: None,
        });
        let (pipelining, shared) = (lane.pipelining, lane.shared);

        let id = match shared {
            Some(id) if pipelining && state.links.contains_key(&id) => id,
            _ => {
                let id = self.open_link(&mut state, destination, !pipelining);
                if pipelining && let Some(lane) = state.lanes.get_mut(&destination) {
                    lane.shared = Some(id);
                }
                id
            }
        };
        self.idle.remove(&id);

        let Some(link) = state.links.get_mut(&id) else {
            return;
        };
        tracing::debug!(
            link = id,
            %destination,
            tag = entry.tag,
            queued = link.outstanding.len(),
            "request queued"
        );
        link.outstanding.push_back(entry);
        link.to_send.push_back(wire);
        let drain = !std::mem::replace(&mut link.sending, true);
        drop(state);

        if drain {
            self.drain(id);
        }
    }

    fn open_link(self: &Arc<Self>, state: &mut State, destination: SocketAddr, dedicated: bool) -> LinkId {
        let id = LINK_COUNTER.fetch_add(1, Ordering::SeqCst);
        let remote = self.config.proxy.unwrap_or(destination);
        let events = Arc::new(LinkEvents {
            inner: Arc::downgrade(self),
            link: id,
        });
        tracing::debug!(link = id, %remote, dedicated, "opening connection");
        let session = Session::connect(remote, &self.session_config, events);
        state.links.insert(
            id,
            Link {
                destination,
                dedicated,
                session,
                outstanding: VecDeque::new(),
                delivered: 0,
                to_send: VecDeque::new(),
                sending: false,
            },
        );
        id
    }

    /// Write queued messages in submission order without holding the state
    /// lock, since a failed write closes the session synchronously.
    fn drain(&self, id: LinkId) {
        loop {
            let (session, message) = {
                let mut state = self.state.lock();
                let Some(link) = state.links.get_mut(&id) else {
                    return;
                };
                match link.to_send.pop_front() {
                    Some(m) => (link.session.clone(), m),
                    None => {
                        link.sending = false;
                        return;
                    }
                }
            };
            if let Err(e) = session.send(message) {
                tracing::debug!(link = id, error = %e, "request write failed");
            }
        }
    }

    /// Copy of the entry's message as it goes on the wire. A streamed body
    /// moves into the copy.
    fn prepare(&self, entry: &mut PipelineEntry) -> WireMessage {
        let mut wire = entry.message.clone_head();
        wire.body = match std::mem::take(&mut entry.message.body) {
            Body::Stream(stream) => {
                entry.streamed = true;
                Body::Stream(stream)
            }
            Body::Bytes(bytes) => {
                entry.message.body = Body::Bytes(bytes.clone());
                Body::Bytes(bytes)
            }
        };
        let host = wire
            .headers
            .get("Host")
            .map(str::to_string)
            .unwrap_or_else(|| entry.destination.to_string());
        if !wire.headers.contains("Host") {
            wire.headers.set("Host", &host);
        }
        if self.config.proxy.is_some() {
            if let StartLine::Request { target, .. } = &mut wire.start
                && !target.contains("://")
            {
                *target = format!("http://{host}{target}");
            }
            wire.set_version(Version::HTTP_10);
        }
        wire
    }

    fn deliver(&self, id: LinkId, message: WireMessage) {
        let (entry, finished) = {
            let mut state = self.state.lock();
            let Some(link) = state.links.get_mut(&id) else {
                tracing::warn!(link = id, "response on a retired connection");
                return;
            };
            let entry = link.outstanding.pop_front();
            link.delivered += 1;
            let mut finished = None;
            if link.outstanding.is_empty() {
                if link.dedicated {
                    finished = Some(link.session.clone());
                } else {
                    self.idle.add(id, self.config.idle_timeout);
                }
            }
            (entry, finished)
        };

        match entry {
            Some(entry) => {
                tracing::debug!(link = id, tag = entry.tag, status = message.status().unwrap_or(0), "response matched");
                self.complete(entry, PipelineOutcome::Response(message));
            }
            None => tracing::warn!(link = id, "unsolicited response dropped"),
        }
        if let Some(session) = finished {
            session.close();
        }
    }

    /// Forget a closed or refused connection and settle what it still owed.
    fn retire(self: &Arc<Self>, id: LinkId, refused: bool) {
        let (link, closing) = {
            let mut state = self.state.lock();
            let Some(link) = state.links.remove(&id) else {
                return;
            };
            let unanswered = !link.outstanding.is_empty() && link.delivered == 0;
            if let Some(lane) = state.lanes.get_mut(&link.destination) {
                if lane.shared == Some(id) {
                    lane.shared = None;
                }
                if unanswered && !refused && !link.dedicated && lane.pipelining {
                    tracing::warn!(destination = %link.destination, "connection closed before any response; pipelining disabled");
                    lane.pipelining = false;
                }
            }
            (link, state.closing)
        };
        self.idle.remove(&id);

        if link.outstanding.is_empty() {
            return;
        }
        let give_up = refused || closing || link.dedicated;
        if refused {
            tracing::info!(destination = %link.destination, pending = link.outstanding.len(), "connection refused");
        }
        for entry in link.outstanding {
            if give_up || entry.streamed {
                if entry.streamed && !give_up {
                    tracing::debug!(tag = entry.tag, "streamed request cannot be resent");
                }
                self.complete(entry, PipelineOutcome::NoResponse);
            } else {
                self.submit(entry);
            }
        }
    }

    fn expire(&self, id: LinkId) {
        let (session, destination) = {
            let mut state = self.state.lock();
            match state.links.get(&id) {
                Some(link) if link.outstanding.is_empty() => {}
                _ => return,
            }
            let Some(link) = state.links.remove(&id) else {
                return;
            };
            if let Some(lane) = state.lanes.get_mut(&link.destination)
                && lane.shared == Some(id)
            {
                lane.shared = None;
            }
            (link.session, link.destination)
        };
        tracing::info!(link = id, %destination, "idle connection closed");
        session.close();
        self.handler.on_inactive_closed(destination);
    }

    fn complete(&self, mut entry: PipelineEntry, outcome: PipelineOutcome) {
        match entry.on_complete.take() {
            Some(f) => f(outcome),
            None => self.handler.on_response(entry.tag, outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;

    struct Collect {
        responses: Mutex<mpsc::Sender<(RequestTag, Option<WireMessage>)>>,
        inactive: Mutex<mpsc::Sender<SocketAddr>>,
    }

    impl PipelineHandler for Collect {
        fn on_response(&self, tag: RequestTag, outcome: PipelineOutcome) {
            let _ = self.responses.lock().send((tag, outcome.into_response()));
        }

        fn on_inactive_closed(&self, destination: SocketAddr) {
            let _ = self.inactive.lock().send(destination);
        }
    }

    fn collector() -> (
        Arc<Collect>,
        mpsc::Receiver<(RequestTag, Option<WireMessage>)>,
        mpsc::Receiver<SocketAddr>,
    ) {
        let (rtx, rrx) = mpsc::channel();
        let (itx, irx) = mpsc::channel();
        let handler = Arc::new(Collect {
            responses: Mutex::new(rtx),
            inactive: Mutex::new(itx),
        });
        (handler, rrx, irx)
    }

    /// Reads request heads and answers each with its target as the body.
    fn echo_targets(stream: &TcpStream, count: usize) -> Vec<String> {
        let mut writer = stream;
        let mut reader = BufReader::new(stream);
        let mut lines = Vec::new();
        for _ in 0..count {
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" {
                    break;
                }
            }
            let target = request_line.split(' ').nth(1).unwrap_or("").to_string();
            let body = target.clone();
            write!(writer, "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body).unwrap();
            lines.push(request_line);
        }
        lines
    }

    #[test]
    fn refused_destination_yields_no_response() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let (handler, responses, _) = collector();
        let pipeline = RequestPipeline::new(PipelineConfig::default(), handler);
        for tag in 1..=3 {
            pipeline.request(addr, WireMessage::request("GET", "/"), tag);
        }
        let mut tags: Vec<_> = (0..3)
            .map(|_| {
                let (tag, response) = responses.recv_timeout(Duration::from_secs(5)).unwrap();
                assert!(response.is_none());
                tag
            })
            .collect();
        tags.sort();
        assert_eq!(tags, vec![1, 2, 3]);
        assert!(pipeline.is_pipelining(addr));
    }

    #[test]
    fn shared_connection_idles_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let lines = echo_targets(&stream, 1);
            // Hold the connection until the client gives up on it.
            let mut rest = Vec::new();
            let _ = (&stream).read_to_end(&mut rest);
            lines
        });

        let (handler, responses, inactive) = collector();
        let config = PipelineConfig::default().with_idle_timeout(Duration::from_millis(100));
        let pipeline = RequestPipeline::new(config, handler);
        pipeline.request(addr, WireMessage::request("GET", "/only"), 9);

        let (tag, response) = responses.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(tag, 9);
        assert_eq!(response.unwrap().body_bytes(), b"/only");
        assert_eq!(inactive.recv_timeout(Duration::from_secs(3)).unwrap(), addr);
        assert_eq!(pipeline.connection_count(), 0);
        server.join().unwrap();
    }

    #[test]
    fn proxy_mode_uses_absolute_target_and_http10() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            echo_targets(&stream, 1)
        });

        let destination: SocketAddr = "10.1.2.3:8080".parse().unwrap();
        let (handler, responses, _) = collector();
        let pipeline = RequestPipeline::new(PipelineConfig::default().with_proxy(proxy), handler);
        assert!(!pipeline.is_pipelining(destination));

        let (tx, rx) = mpsc::channel();
        pipeline.submit(
            PipelineEntry::new(destination, WireMessage::request("GET", "/desc.xml"), 1)
                .with_callback(move |outcome| {
                    let _ = tx.send(outcome.into_response());
                }),
        );
        let response = rx.recv_timeout(Duration::from_secs(3)).unwrap().unwrap();
        assert_eq!(response.body_bytes(), b"http://10.1.2.3:8080/desc.xml");
        assert!(responses.try_recv().is_err());

        let lines = server.join().unwrap();
        assert_eq!(lines[0], "GET http://10.1.2.3:8080/desc.xml HTTP/1.0\r\n");
    }

    #[test]
    fn unanswered_streamed_request_is_not_resent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (first, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(&first);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            drop(reader);
            drop(first);

            listener.set_nonblocking(true).unwrap();
            let mut extra = 0;
            for _ in 0..20 {
                if listener.accept().is_ok() {
                    extra += 1;
                }
                thread::sleep(Duration::from_millis(50));
            }
            (request_line, extra)
        });

        let (handler, responses, _) = collector();
        let pipeline = RequestPipeline::new(PipelineConfig::default(), handler);
        let upload = WireMessage::request("POST", "/upload")
            .with_stream(std::io::Cursor::new(b"payload".to_vec()));
        pipeline.request(addr, upload, 5);

        let (tag, response) = responses.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(tag, 5);
        assert!(response.is_none());

        let (request_line, extra) = server.join().unwrap();
        assert_eq!(request_line, "POST /upload HTTP/1.1\r\n");
        assert_eq!(extra, 0);
    }

    #[test]
    fn submissions_after_shutdown_get_no_response() {
        let (handler, responses, _) = collector();
        let pipeline = RequestPipeline::new(PipelineConfig::default(), handler);
        pipeline.shutdown();
        pipeline.request("127.0.0.1:9".parse().unwrap(), WireMessage::request("GET", "/"), 4);
        let (tag, response) = responses.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(tag, 4);
        assert!(response.is_none());
    }
}
