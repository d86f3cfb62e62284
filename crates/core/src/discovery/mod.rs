//! SSDP discovery over UDP multicast.
//!
//! [`SsdpService`] joins the SSDP group and:
//!
//! - announces registered [`Announcement`]s with ALIVE bursts, renewed at a
//!   random 25–45% of their max-age, and BYEBYE on withdraw or shutdown;
//! - answers valid M-SEARCH requests after a random delay in `0..=MX`
//!   seconds (never from the receive callback itself);
//! - surfaces inbound NOTIFY traffic and search responses to subscribed
//!   listeners.
//!
//! Outbound bursts go out twice from a fresh socket each time. Active
//! searches are sent from a dedicated unicast socket so that responses
//! addressed to it come back through the same receive path.

pub mod packet;

pub use packet::{Announcement, AnnouncementKind, SearchRejection, SearchRequest};

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Result, UpnpError};
use crate::protocol::WireMessage;
use crate::scheduler::{ExpirationScheduler, SchedulerConfig};
use crate::transport::udp::BurstSender;
use crate::transport::{MAX_DATAGRAM, ReceivedChunk, Transport, TransportConfig, TransportHandler};

static LISTENER_COUNTER: AtomicU64 = AtomicU64::new(1);
static RESPONSE_COUNTER: AtomicU64 = AtomicU64::new(1);

pub type ListenerId = u64;

/// Max-age used by [`SsdpService::advertise_device`].
pub const DEFAULT_MAX_AGE: u32 = 1800;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Interface for multicast membership and outbound bursts.
    pub interface: Ipv4Addr,
    pub ttl: u32,
    /// Times each burst is transmitted.
    pub repeat: usize,
    /// `SERVER` header value.
    pub server: String,
    /// Larger MX values are clamped to this.
    pub max_mx: u32,
    pub scheduler: SchedulerConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: packet::SSDP_GROUP,
            port: packet::SSDP_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 4,
            repeat: 2,
            server: format!(
                "{}/1.0 UPnP/1.1 upnp-rs/{}",
                std::env::consts::OS,
                env!("CARGO_PKG_VERSION")
            ),
            max_mx: 5,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_server(mut self, server: &str) -> Self {
        self.server = server.to_string();
        self
    }

    pub fn with_max_mx(mut self, max_mx: u32) -> Self {
        self.max_mx = max_mx.max(1);
        self
    }

    fn group_endpoint(&self) -> SocketAddr {
        packet::group_endpoint(self.group, self.port)
    }
}

type Listener = Arc<dyn Fn(&Announcement, SocketAddr) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Timer {
    Renew,
    Respond(u64),
}

struct PendingResponse {
    dest: SocketAddr,
    packets: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Sockets {
    multicast: Option<Arc<Transport>>,
    unicast: Option<Arc<Transport>>,
}

struct Inner {
    config: DiscoveryConfig,
    running: AtomicBool,
    sockets: Mutex<Sockets>,
    advertised: Mutex<HashMap<String, Announcement>>,
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    pending: Mutex<HashMap<u64, PendingResponse>>,
    timers: ExpirationScheduler<Timer>,
}

struct Receiver {
    inner: Weak<Inner>,
}

impl TransportHandler for Receiver {
    fn on_receive(&self, _transport: &Arc<Transport>, chunk: &mut ReceivedChunk<'_>) {
        let data = chunk.data;
        chunk.consume(data.len());
        if let Some(inner) = self.inner.upgrade() {
            inner.datagram(data, chunk.remote);
        }
    }
}

/// SSDP advertise/search endpoint.
pub struct SsdpService {
    inner: Arc<Inner>,
}

impl SsdpService {
    pub fn new(config: DiscoveryConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                timers: ExpirationScheduler::with_config(config.scheduler.clone(), move |timer: Timer| {
                    if let Some(inner) = weak.upgrade() {
                        inner.fire(timer);
                    }
                }),
                config,
                running: AtomicBool::new(false),
                sockets: Mutex::new(Sockets::default()),
                advertised: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }
        });
        Self { inner }
    }

    /// Bind the multicast and unicast sockets and start receiving. Already
    /// registered announcements go out immediately.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(UpnpError::AlreadyRunning);
        }
        if let Err(e) = inner.open_sockets() {
            inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        tracing::info!(
            group = %inner.config.group,
            port = self.local_port().unwrap_or(0),
            "SSDP service started"
        );

        let current: Vec<_> = inner.advertised.lock().values().cloned().collect();
        if !current.is_empty() {
            inner.burst_group(&current, AnnouncementKind::Alive);
            inner.schedule_renewal();
        }
        Ok(())
    }

    /// Send BYEBYE for everything advertised and close the sockets.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let current: Vec<_> = inner.advertised.lock().values().cloned().collect();
        inner.burst_group(&current, AnnouncementKind::ByeBye);

        inner.timers.remove(&Timer::Renew);
        let pending: Vec<u64> = inner.pending.lock().drain().map(|(id, _)| id).collect();
        for id in pending {
            inner.timers.remove(&Timer::Respond(id));
        }

        let sockets = std::mem::take(&mut *inner.sockets.lock());
        if let Some(multicast) = sockets.multicast {
            let _ = multicast.drop_membership(inner.config.group, inner.config.interface);
            multicast.disconnect();
        }
        if let Some(unicast) = sockets.unicast {
            unicast.disconnect();
        }
        tracing::info!("SSDP service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Port of the multicast listening socket.
    pub fn local_port(&self) -> Option<u16> {
        let sockets = self.inner.sockets.lock();
        sockets
            .multicast
            .as_ref()
            .and_then(|t| t.local_addr())
            .map(|a| a.port())
    }

    /// Address of the socket searches are sent from.
    pub fn search_addr(&self) -> Option<SocketAddr> {
        let sockets = self.inner.sockets.lock();
        sockets.unicast.as_ref().and_then(|t| t.local_addr())
    }

    /// Register (or replace, by USN) an announcement.
    pub fn advertise(&self, announcement: Announcement) {
        let announcement = announcement.with_kind(AnnouncementKind::Alive);
        tracing::debug!(usn = %announcement.usn, nt = %announcement.search_target, "advertise");
        self.inner
            .advertised
            .lock()
            .insert(announcement.usn.clone(), announcement.clone());
        if self.is_running() {
            self.inner.burst_group(&[announcement], AnnouncementKind::Alive);
            if !self.inner.timers.contains(&Timer::Renew) {
                self.inner.schedule_renewal();
            }
        }
    }

    /// Register the usual announcement set for a root device: the bare
    /// UUID, `upnp:rootdevice`, and each extra notification type.
    pub fn advertise_device(&self, uuid: &str, location: &str, types: &[&str]) {
        let uuid = uuid.strip_prefix("uuid:").unwrap_or(uuid);
        let udn = format!("uuid:{uuid}");
        self.advertise(Announcement::alive(&udn, &udn, location, DEFAULT_MAX_AGE));
        self.advertise(Announcement::alive(
            &format!("{udn}::{}", packet::ROOT_DEVICE),
            packet::ROOT_DEVICE,
            location,
            DEFAULT_MAX_AGE,
        ));
        for nt in types {
            self.advertise(Announcement::alive(&format!("{udn}::{nt}"), nt, location, DEFAULT_MAX_AGE));
        }
    }

    /// Remove an announcement and send its BYEBYE. Returns whether it existed.
    pub fn withdraw(&self, usn: &str) -> bool {
        let removed = self.inner.advertised.lock().remove(usn);
        let Some(announcement) = removed else {
            return false;
        };
        tracing::debug!(usn, "withdraw");
        if self.is_running() {
            self.inner.burst_group(&[announcement], AnnouncementKind::ByeBye);
        }
        if self.inner.advertised.lock().is_empty() {
            self.inner.timers.remove(&Timer::Renew);
        }
        true
    }

    pub fn advertised(&self) -> Vec<Announcement> {
        self.inner.advertised.lock().values().cloned().collect()
    }

    /// Observe inbound ALIVE, BYEBYE and search-response traffic.
    pub fn subscribe(&self, listener: impl Fn(&Announcement, SocketAddr) + Send + Sync + 'static) -> ListenerId {
        let id = LISTENER_COUNTER.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.lock().remove(&id).is_some()
    }

    /// Multicast an M-SEARCH. Responses reach subscribed listeners.
    pub fn search(&self, target: &str, mx: u32) -> Result<()> {
        self.search_to(self.inner.config.group_endpoint(), target, mx)
    }

    /// Send an M-SEARCH to one endpoint.
    pub fn search_to(&self, dest: SocketAddr, target: &str, mx: u32) -> Result<()> {
        let unicast = self.inner.sockets.lock().unicast.clone();
        let unicast = unicast.ok_or(UpnpError::NotStarted)?;
        let request = SearchRequest::new(target, mx.max(1).min(self.inner.config.max_mx.max(1)));
        let packet = request.to_message(self.inner.config.group_endpoint()).to_bytes();
        tracing::debug!(%dest, st = target, mx = request.mx, "M-SEARCH");
        for _ in 0..self.inner.config.repeat.max(1) {
            unicast.send_to(packet.clone(), dest, None)?;
        }
        Ok(())
    }

    /// Responses scheduled but not yet sent.
    pub fn pending_responses(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Drop for SsdpService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn open_sockets(self: &Arc<Self>) -> Result<()> {
        let config = &self.config;
        let receiver = || -> Arc<dyn TransportHandler> {
            Arc::new(Receiver {
                inner: Arc::downgrade(self),
            })
        };

        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
        let multicast = Transport::open_udp(bind, TransportConfig::default(), receiver())?;
        if let Err(e) = multicast.add_membership(config.group, config.interface) {
            tracing::warn!(group = %config.group, error = %e, "multicast join failed; unicast only");
        }
        multicast.set_ttl(config.ttl)?;

        let unicast_bind = SocketAddr::V4(SocketAddrV4::new(config.interface, 0));
        let unicast = Transport::open_udp(unicast_bind, TransportConfig::default(), receiver())?;
        unicast.set_ttl(config.ttl)?;

        multicast.begin_receive_loop(MAX_DATAGRAM)?;
        unicast.begin_receive_loop(MAX_DATAGRAM)?;

        let mut sockets = self.sockets.lock();
        sockets.multicast = Some(multicast);
        sockets.unicast = Some(unicast);
        Ok(())
    }

    fn datagram(&self, data: &[u8], from: SocketAddr) {
        let message = match WireMessage::parse(data) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%from, error = %e, "unparsable datagram dropped");
                return;
            }
        };
        if message.method() == Some(packet::M_SEARCH) {
            self.answer_search(&message, from);
            return;
        }
        let Some(announcement) = Announcement::from_message(&message) else {
            tracing::trace!(%from, "ignoring datagram");
            return;
        };
        tracing::debug!(%from, kind = ?announcement.kind, usn = %announcement.usn, "announcement observed");
        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&announcement, from);
        }
    }

    fn answer_search(&self, message: &WireMessage, from: SocketAddr) {
        let request = match SearchRequest::validate(message) {
            Ok(r) => r,
            Err(reason) => {
                tracing::warn!(%from, %reason, "M-SEARCH dropped");
                return;
            }
        };
        let packets: Vec<Vec<u8>> = self
            .advertised
            .lock()
            .values()
            .filter(|a| a.matches(&request.target))
            .map(|a| {
                let mut response = a.with_kind(AnnouncementKind::SearchResponse);
                if request.target != packet::SSDP_ALL {
                    response.search_target = request.target.clone();
                }
                response
                    .to_message(&self.config.server, self.config.group_endpoint())
                    .to_bytes()
            })
            .collect();
        if packets.is_empty() {
            return;
        }

        let mx = request.mx.min(self.config.max_mx);
        let delay = packet::response_delay(mx, &mut rand::rng());
        let id = RESPONSE_COUNTER.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%from, st = %request.target, count = packets.len(), ?delay, "search response scheduled");
        self.pending
            .lock()
            .insert(id, PendingResponse { dest: from, packets });
        self.timers.add(Timer::Respond(id), delay);
    }

    fn fire(&self, timer: Timer) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        match timer {
            Timer::Renew => {
                let current: Vec<_> = self.advertised.lock().values().cloned().collect();
                if current.is_empty() {
                    return;
                }
                tracing::debug!(count = current.len(), "renewing advertisements");
                self.burst_group(&current, AnnouncementKind::Alive);
                self.schedule_renewal();
            }
            Timer::Respond(id) => {
                let Some(pending) = self.pending.lock().remove(&id) else {
                    return;
                };
                if let Err(e) = self.burst(&pending.packets, pending.dest) {
                    tracing::warn!(dest = %pending.dest, error = %e, "search response failed");
                }
            }
        }
    }

    fn schedule_renewal(&self) {
        let shortest = self
            .advertised
            .lock()
            .values()
            .map(|a| a.max_age)
            .min()
            .unwrap_or(DEFAULT_MAX_AGE);
        let delay = packet::renewal_delay(shortest, &mut rand::rng());
        self.timers.add(Timer::Renew, delay);
    }

    fn burst_group(&self, announcements: &[Announcement], kind: AnnouncementKind) {
        let host = self.config.group_endpoint();
        let packets: Vec<Vec<u8>> = announcements
            .iter()
            .map(|a| a.with_kind(kind).to_message(&self.config.server, host).to_bytes())
            .collect();
        if packets.is_empty() {
            return;
        }
        if let Err(e) = self.burst(&packets, host) {
            tracing::warn!(?kind, error = %e, "announcement burst failed");
        }
    }

    fn burst(&self, packets: &[Vec<u8>], dest: SocketAddr) -> Result<usize> {
        let interface = match dest.ip() {
            IpAddr::V4(ip) if ip.is_loopback() => Ipv4Addr::LOCALHOST,
            _ => self.config.interface,
        };
        let sender = BurstSender::bind(interface, self.config.ttl)?;
        sender.send_burst(packets, dest, self.config.repeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn loopback_config() -> DiscoveryConfig {
        DiscoveryConfig::default()
            .with_port(0)
            .with_interface(Ipv4Addr::LOCALHOST)
            .with_max_mx(1)
    }

    #[test]
    fn start_twice_fails() {
        let service = SsdpService::new(loopback_config());
        service.start().unwrap();
        assert!(matches!(service.start(), Err(UpnpError::AlreadyRunning)));
        service.shutdown();
        assert!(!service.is_running());
    }

    #[test]
    fn search_before_start_fails() {
        let service = SsdpService::new(loopback_config());
        assert!(matches!(service.search("ssdp:all", 1), Err(UpnpError::NotStarted)));
    }

    #[test]
    fn withdraw_unknown_usn() {
        let service = SsdpService::new(loopback_config());
        service.advertise(Announcement::alive("uuid:a", "uuid:a", "http://h/", 60));
        assert!(!service.withdraw("uuid:b"));
        assert!(service.withdraw("uuid:a"));
        assert!(service.advertised().is_empty());
    }

    #[test]
    fn advertise_device_registers_standard_set() {
        let service = SsdpService::new(loopback_config());
        service.advertise_device("abc", "http://h/d.xml", &["urn:schemas-upnp-org:device:Basic:1"]);
        let mut usns: Vec<_> = service.advertised().into_iter().map(|a| a.usn).collect();
        usns.sort();
        assert_eq!(
            usns,
            vec![
                "uuid:abc".to_string(),
                "uuid:abc::upnp:rootdevice".to_string(),
                "uuid:abc::urn:schemas-upnp-org:device:Basic:1".to_string(),
            ]
        );
    }

    #[test]
    fn wrong_man_gets_no_answer() {
        let service = SsdpService::new(loopback_config());
        service.advertise(Announcement::alive("uuid:x", "uuid:x", "http://h/", 60));
        service.start().unwrap();
        let port = service.local_port().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(1500)))
            .unwrap();
        let raw = "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:other\"\r\nMX: 1\r\nST: ssdp:all\r\n\r\n";
        client.send_to(raw.as_bytes(), ("127.0.0.1", port)).unwrap();

        let mut buf = [0u8; 2048];
        assert!(client.recv_from(&mut buf).is_err());
        assert_eq!(service.pending_responses(), 0);
        service.shutdown();
    }
}
