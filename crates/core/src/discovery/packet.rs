use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;

use crate::protocol::{Version, WireMessage};

/// Well-known SSDP multicast group.
pub const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

pub const HOST: &str = "HOST";
pub const NT: &str = "NT";
pub const NTS: &str = "NTS";
pub const USN: &str = "USN";
pub const ST: &str = "ST";
pub const MX: &str = "MX";
pub const MAN: &str = "MAN";
pub const CACHE_CONTROL: &str = "CACHE-CONTROL";
pub const LOCATION: &str = "LOCATION";
pub const SERVER: &str = "SERVER";
pub const EXT: &str = "EXT";
pub const CALLBACK: &str = "CALLBACK";
pub const SID: &str = "SID";
pub const TIMEOUT: &str = "TIMEOUT";

pub const NTS_ALIVE: &str = "ssdp:alive";
pub const NTS_BYEBYE: &str = "ssdp:byebye";
pub const DISCOVER: &str = "ssdp:discover";
pub const SSDP_ALL: &str = "ssdp:all";
pub const ROOT_DEVICE: &str = "upnp:rootdevice";

pub const NOTIFY: &str = "NOTIFY";
pub const M_SEARCH: &str = "M-SEARCH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementKind {
    Alive,
    ByeBye,
    SearchResponse,
}

/// One advertised (or observed) device or service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub kind: AnnouncementKind,
    pub usn: String,
    /// `NT` for notifications, `ST` for search responses.
    pub search_target: String,
    pub location: Option<String>,
    pub max_age: u32,
}

impl Announcement {
    pub fn alive(usn: &str, notification_type: &str, location: &str, max_age: u32) -> Self {
        Self {
            kind: AnnouncementKind::Alive,
            usn: usn.to_string(),
            search_target: notification_type.to_string(),
            location: Some(location.to_string()),
            max_age,
        }
    }

    pub fn with_kind(&self, kind: AnnouncementKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    /// Build the packet for this announcement. `host` is the group endpoint
    /// written into `HOST` for notifications.
    pub fn to_message(&self, server: &str, host: SocketAddr) -> WireMessage {
        let message = match self.kind {
            AnnouncementKind::Alive => WireMessage::request(NOTIFY, "*")
                .with_header(HOST, &host.to_string())
                .with_header(CACHE_CONTROL, &format!("max-age={}", self.max_age))
                .with_header(LOCATION, self.location.as_deref().unwrap_or(""))
                .with_header(NT, &self.search_target)
                .with_header(NTS, NTS_ALIVE)
                .with_header(SERVER, server)
                .with_header(USN, &self.usn),
            AnnouncementKind::ByeBye => WireMessage::request(NOTIFY, "*")
                .with_header(HOST, &host.to_string())
                .with_header(NT, &self.search_target)
                .with_header(NTS, NTS_BYEBYE)
                .with_header(USN, &self.usn),
            AnnouncementKind::SearchResponse => WireMessage::response(200, "OK")
                .with_header(CACHE_CONTROL, &format!("max-age={}", self.max_age))
                .with_header(EXT, "")
                .with_header(LOCATION, self.location.as_deref().unwrap_or(""))
                .with_header(SERVER, server)
                .with_header(ST, &self.search_target)
                .with_header(USN, &self.usn),
        };
        message.without_content_length()
    }

    /// Classify an inbound NOTIFY or search response. Anything else,
    /// including a NOTIFY with an unknown `NTS`, yields `None`.
    pub fn from_message(message: &WireMessage) -> Option<Self> {
        let usn = message.headers.get(USN)?.trim().to_string();
        let max_age = message
            .headers
            .get(CACHE_CONTROL)
            .and_then(max_age_from)
            .unwrap_or(0);
        let location = message.headers.get(LOCATION).map(|l| l.trim().to_string());

        let (kind, search_target) = if message.is_request() {
            if message.method() != Some(NOTIFY) {
                return None;
            }
            let kind = match message.headers.get(NTS).map(str::trim) {
                Some(NTS_ALIVE) => AnnouncementKind::Alive,
                Some(NTS_BYEBYE) => AnnouncementKind::ByeBye,
                _ => return None,
            };
            (kind, message.headers.get(NT)?)
        } else {
            if message.status() != Some(200) {
                return None;
            }
            (AnnouncementKind::SearchResponse, message.headers.get(ST)?)
        };

        Some(Self {
            kind,
            usn,
            search_target: search_target.trim().to_string(),
            location,
            max_age,
        })
    }

    /// Whether this announcement answers a search for `target`.
    pub fn matches(&self, target: &str) -> bool {
        let target = target.trim();
        if target == SSDP_ALL || target.eq_ignore_ascii_case(&self.search_target) {
            return true;
        }
        target.starts_with("uuid:")
            && self
                .usn
                .split("::")
                .next()
                .is_some_and(|uuid| uuid.eq_ignore_ascii_case(target))
    }
}

/// `max-age=N` from a `Cache-Control` value.
pub fn max_age_from(cache_control: &str) -> Option<u32> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().trim_matches('"').parse().ok()
        } else {
            None
        }
    })
}

/// Why an M-SEARCH was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchRejection {
    NotSearch,
    WrongMan,
    WrongTarget,
    OldVersion,
    BadMx,
    MissingSearchTarget,
}

impl fmt::Display for SearchRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SearchRejection::NotSearch => "not an M-SEARCH",
            SearchRejection::WrongMan => "MAN is not ssdp:discover",
            SearchRejection::WrongTarget => "request target is not *",
            SearchRejection::OldVersion => "version below HTTP/1.1",
            SearchRejection::BadMx => "MX missing or not a positive integer",
            SearchRejection::MissingSearchTarget => "ST missing",
        };
        f.write_str(reason)
    }
}

/// A validated M-SEARCH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub target: String,
    pub mx: u32,
}

impl SearchRequest {
    pub fn new(target: &str, mx: u32) -> Self {
        Self {
            target: target.to_string(),
            mx,
        }
    }

    pub fn to_message(&self, host: SocketAddr) -> WireMessage {
        WireMessage::request(M_SEARCH, "*")
            .with_header(HOST, &host.to_string())
            .with_header(MAN, &format!("\"{DISCOVER}\""))
            .with_header(MX, &self.mx.to_string())
            .with_header(ST, &self.target)
            .without_content_length()
    }

    /// Check an inbound request before anything is answered.
    pub fn validate(message: &WireMessage) -> Result<Self, SearchRejection> {
        if message.method() != Some(M_SEARCH) {
            return Err(SearchRejection::NotSearch);
        }
        let man = message.headers.get(MAN).map(|m| m.trim().trim_matches('"'));
        if man != Some(DISCOVER) {
            return Err(SearchRejection::WrongMan);
        }
        if message.target() != Some("*") {
            return Err(SearchRejection::WrongTarget);
        }
        if message.version() < Version::HTTP_11 {
            return Err(SearchRejection::OldVersion);
        }
        let mx = message
            .headers
            .get(MX)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|&mx| mx > 0)
            .ok_or(SearchRejection::BadMx)?;
        let target = message
            .headers
            .get(ST)
            .map(str::trim)
            .filter(|st| !st.is_empty())
            .ok_or(SearchRejection::MissingSearchTarget)?;
        Ok(Self::new(target, mx))
    }
}

pub fn group_endpoint(group: Ipv4Addr, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(group, port))
}

/// Delay before the next ALIVE round: uniform in 25%..=45% of `max_age`.
pub fn renewal_delay(max_age: u32, rng: &mut impl Rng) -> Duration {
    let per_mille = rng.random_range(250..=450u64);
    Duration::from_millis(u64::from(max_age.max(1)) * per_mille)
}

/// Delay before answering a search: uniform in `0..=mx` seconds.
pub fn response_delay(mx: u32, rng: &mut impl Rng) -> Duration {
    Duration::from_millis(rng.random_range(0..=u64::from(mx) * 1000))
}
