//! HTTP/1.x framing and SSDP discovery engine for UPnP devices and control
//! points.
//!
//! - [`transport`]: TCP/UDP sockets with ordered send queues.
//! - [`protocol`]: [`WireMessage`] codec, chunk helpers, percent-escaping.
//! - [`session`]: per-connection framing state machine.
//! - [`server`]: embedded HTTP server built on sessions.
//! - [`pipeline`]: client-side request pipelining with fallback.
//! - [`scheduler`]: shared deadline service.
//! - [`discovery`]: SSDP advertise/search/notify.

pub mod discovery;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;

pub use discovery::{Announcement, AnnouncementKind, DiscoveryConfig, SsdpService};
pub use error::{ParseErrorKind, Result, UpnpError};
pub use pipeline::{PipelineConfig, PipelineEntry, PipelineHandler, PipelineOutcome, RequestPipeline};
pub use protocol::{Headers, Version, WireMessage};
pub use scheduler::{ExpirationScheduler, SchedulerConfig};
pub use server::{HttpServer, ServerConfig};
pub use session::{Session, SessionConfig, SessionHandler};
