use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, UpnpError};
use crate::protocol::WireMessage;
use crate::scheduler::{ExpirationScheduler, SchedulerConfig};
use crate::session::{Session, SessionConfig, SessionHandler, SessionId};
use crate::transport::{SendTag, tcp};

/// Listener and per-connection settings for [`HttpServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks an ephemeral port; see
    /// [`HttpServer::local_addr`].
    pub bind_addr: String,
    pub session: SessionConfig,
    /// Sleep between accept attempts while idle.
    pub accept_poll: Duration,
    pub scheduler: SchedulerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            session: SessionConfig::default(),
            accept_poll: tcp::ACCEPT_POLL,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: &str) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

type Registry = Arc<Mutex<HashMap<SessionId, Arc<Session>>>>;

/// Keeps the registry in step with session lifetimes and forwards
/// everything else to the application handler.
struct Tracked {
    inner: Arc<dyn SessionHandler>,
    sessions: Weak<Mutex<HashMap<SessionId, Arc<Session>>>>,
}

impl SessionHandler for Tracked {
    fn on_head(
        &self,
        session: &Arc<Session>,
        head: &WireMessage,
    ) -> Option<Box<dyn std::io::Write + Send>> {
        self.inner.on_head(session, head)
    }

    fn on_message(&self, session: &Arc<Session>, message: WireMessage) {
        self.inner.on_message(session, message);
    }

    fn on_send_ready(&self, session: &Arc<Session>, tag: SendTag) {
        self.inner.on_send_ready(session, tag);
    }

    fn on_closed(&self, session: &Arc<Session>) {
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.lock().remove(&session.id());
        }
        self.inner.on_closed(session);
    }
}

/// Embedded HTTP server.
///
/// Accepts connections on a background thread and wraps each one in a
/// server-role [`Session`]. Idle connections are closed after
/// [`SessionConfig::keep_alive`] through one shared scheduler.
pub struct HttpServer {
    config: ServerConfig,
    handler: Arc<dyn SessionHandler>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    sessions: Registry,
    keep_alive: ExpirationScheduler<SessionId>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> Self {
        let sessions: Registry = Arc::new(Mutex::new(HashMap::new()));
        let registry = Arc::downgrade(&sessions);
        let keep_alive = ExpirationScheduler::with_config(config.scheduler.clone(), move |id: SessionId| {
            let Some(sessions) = registry.upgrade() else {
                return;
            };
            let session = sessions.lock().get(&id).cloned();
            if let Some(session) = session {
                tracing::debug!(session = id, "keep-alive expired");
                session.close();
            }
        });
        Self {
            config,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            sessions,
            keep_alive,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(UpnpError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        self.local_addr = Some(local);
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let poll = self.config.accept_poll;
        let acceptor = Acceptor {
            config: self.config.session.clone(),
            handler: Arc::new(Tracked {
                inner: self.handler.clone(),
                sessions: Arc::downgrade(&self.sessions),
            }),
            sessions: self.sessions.clone(),
            keep_alive: self.keep_alive.clone(),
        };

        tracing::info!(addr = %local, "HTTP server listening");

        thread::spawn(move || {
            tcp::accept_loop(listener, running, poll, |stream, peer| {
                acceptor.accept(stream, peer)
            });
        });

        Ok(())
    }

    /// Stop accepting and close every open session.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        let open: Vec<_> = self.sessions.lock().values().cloned().collect();
        for session in open {
            session.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(UpnpError::NotStarted)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Acceptor {
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    sessions: Registry,
    keep_alive: ExpirationScheduler<SessionId>,
}

impl Acceptor {
    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        // Hold the registry lock so a session that closes immediately
        // cannot be removed before it is inserted.
        let mut sessions = self.sessions.lock();
        match Session::accept(
            stream,
            &self.config,
            self.handler.clone(),
            Some(self.keep_alive.clone()),
        ) {
            Ok(session) => {
                if !session.is_closed() {
                    sessions.insert(session.id(), session);
                }
            }
            Err(e) => tracing::warn!(%peer, error = %e, "failed to start session"),
        }
    }
}
