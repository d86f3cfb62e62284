use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use upnp::discovery::packet::SSDP_ALL;
use upnp::pipeline::RequestTag;
use upnp::{
    Announcement, DiscoveryConfig, HttpServer, PipelineConfig, PipelineHandler, PipelineOutcome,
    RequestPipeline, ServerConfig, Session, SessionHandler, SsdpService, UpnpError, WireMessage,
};
use url::Url;

#[derive(Parser)]
#[command(name = "upnp", about = "SSDP discovery and HTTP probe", version)]
struct Args {
    /// Interface address for multicast traffic
    #[arg(long, global = true, default_value = "0.0.0.0")]
    interface: Ipv4Addr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send an M-SEARCH and print every response
    Search {
        #[arg(long, short, default_value = SSDP_ALL)]
        target: String,
        /// Maximum response delay requested from devices, in seconds
        #[arg(long, default_value_t = 2)]
        mx: u32,
        /// Seconds to wait for responses
        #[arg(long, default_value_t = 4)]
        wait: u64,
    },
    /// Print NOTIFY traffic seen on the SSDP group
    Listen {
        #[arg(long, default_value_t = 1900)]
        port: u16,
    },
    /// Announce a device until Enter is pressed
    Advertise {
        #[arg(long)]
        uuid: String,
        /// Device description URL
        #[arg(long)]
        location: String,
        /// Extra notification types (device or service URNs)
        #[arg(long = "type")]
        types: Vec<String>,
    },
    /// Fetch URLs through the request pipeline
    Get {
        #[arg(required = true)]
        urls: Vec<String>,
        /// One connection per request
        #[arg(long)]
        no_pipeline: bool,
        /// HTTP proxy (host:port)
        #[arg(long)]
        proxy: Option<String>,
        /// Seconds to wait for all responses
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Answer every request with a short text body
    Serve {
        #[arg(long, short, default_value = "0.0.0.0:8080")]
        bind: String,
        #[arg(long, default_value = "hello from upnp\n")]
        body: String,
        /// Send the body with chunked transfer encoding
        #[arg(long)]
        chunked: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> upnp::Result<()> {
    let discovery = DiscoveryConfig::default().with_interface(args.interface);
    match args.command {
        Command::Search { target, mx, wait } => search(discovery.with_port(0), &target, mx, wait),
        Command::Listen { port } => listen(discovery.with_port(port)),
        Command::Advertise {
            uuid,
            location,
            types,
        } => advertise(discovery, &uuid, &location, &types),
        Command::Get {
            urls,
            no_pipeline,
            proxy,
            timeout,
        } => get(&urls, no_pipeline, proxy.as_deref(), timeout),
        Command::Serve {
            bind,
            body,
            chunked,
        } => serve(&bind, body, chunked),
    }
}

fn print_announcement(a: &Announcement, from: SocketAddr) {
    println!(
        "{from:<22} {:<15} {:<45} {}",
        format!("{:?}", a.kind),
        a.search_target,
        a.location.as_deref().unwrap_or("-")
    );
    println!("{:<22} usn={}", "", a.usn);
}

fn search(config: DiscoveryConfig, target: &str, mx: u32, wait: u64) -> upnp::Result<()> {
    let service = SsdpService::new(config);
    service.subscribe(|a, from| {
        if a.kind == upnp::AnnouncementKind::SearchResponse {
            print_announcement(a, from);
        }
    });
    service.start()?;
    service.search(target, mx)?;
    thread::sleep(Duration::from_secs(wait));
    service.shutdown();
    Ok(())
}

fn listen(config: DiscoveryConfig) -> upnp::Result<()> {
    let service = SsdpService::new(config);
    service.subscribe(print_announcement);
    service.start()?;
    println!("listening for SSDP traffic, press Enter to stop");
    wait_for_enter();
    service.shutdown();
    Ok(())
}

fn advertise(config: DiscoveryConfig, uuid: &str, location: &str, types: &[String]) -> upnp::Result<()> {
    let service = SsdpService::new(config);
    let types: Vec<&str> = types.iter().map(String::as_str).collect();
    service.advertise_device(uuid, location, &types);
    service.start()?;
    println!("advertising {} entries, press Enter to send byebye", service.advertised().len());
    wait_for_enter();
    service.shutdown();
    Ok(())
}

fn wait_for_enter() {
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);
}

struct Printer {
    done: mpsc::Sender<(RequestTag, PipelineOutcome)>,
}

impl PipelineHandler for Printer {
    fn on_response(&self, tag: RequestTag, outcome: PipelineOutcome) {
        let _ = self.done.send((tag, outcome));
    }
}

fn resolve(url: &Url) -> upnp::Result<SocketAddr> {
    let host = url
        .host_str()
        .ok_or_else(|| UpnpError::InvalidUrl(url.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| UpnpError::InvalidUrl(url.to_string()))?;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| UpnpError::InvalidUrl(url.to_string()))
}

fn resolve_endpoint(endpoint: &str) -> upnp::Result<SocketAddr> {
    endpoint
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| UpnpError::InvalidUrl(endpoint.to_string()))
}

fn get(urls: &[String], no_pipeline: bool, proxy: Option<&str>, timeout: u64) -> upnp::Result<()> {
    let mut config = PipelineConfig::default().with_pipelining(!no_pipeline);
    if let Some(proxy) = proxy {
        config = config.with_proxy(resolve_endpoint(proxy)?);
    }

    let (tx, rx) = mpsc::channel();
    let pipeline = RequestPipeline::new(config, Arc::new(Printer { done: tx }));

    let mut requested = Vec::new();
    for (tag, raw) in urls.iter().enumerate() {
        let url = Url::parse(raw).map_err(|e| UpnpError::InvalidUrl(format!("{raw}: {e}")))?;
        let destination = resolve(&url)?;
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        let host = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let request = WireMessage::request("GET", &target).with_header("Host", &host);
        pipeline.request(destination, request, tag as RequestTag);
        requested.push(raw.as_str());
    }

    let deadline = Instant::now() + Duration::from_secs(timeout);
    let stdout = io::stdout();
    for _ in 0..requested.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok((tag, outcome)) = rx.recv_timeout(remaining) else {
            eprintln!("timed out waiting for responses");
            break;
        };
        let url = requested.get(tag as usize).copied().unwrap_or("?");
        let mut out = stdout.lock();
        match outcome {
            PipelineOutcome::Response(response) => {
                let _ = writeln!(
                    out,
                    "== {url} -> {} ({} bytes)",
                    response.status().unwrap_or(0),
                    response.body_bytes().len()
                );
                let _ = out.write_all(response.body_bytes());
                let _ = writeln!(out);
            }
            PipelineOutcome::NoResponse => {
                let _ = writeln!(out, "== {url} -> no response");
            }
        }
    }
    pipeline.shutdown();
    Ok(())
}

struct TextResponder {
    body: String,
    chunked: bool,
}

impl SessionHandler for TextResponder {
    fn on_message(&self, session: &Arc<Session>, message: WireMessage) {
        tracing::info!(
            peer = ?session.remote_addr(),
            method = message.method().unwrap_or(""),
            target = message.target().unwrap_or(""),
            "request"
        );
        let response = WireMessage::response(200, "OK").with_header("Content-Type", "text/plain");
        let response = if self.chunked {
            response.with_stream(io::Cursor::new(self.body.clone().into_bytes()))
        } else {
            response.with_body(self.body.clone())
        };
        if let Err(e) = session.send(response) {
            tracing::warn!(error = %e, "response failed");
        }
    }
}

fn serve(bind: &str, body: String, chunked: bool) -> upnp::Result<()> {
    let mut server = HttpServer::new(
        ServerConfig::new(bind),
        Arc::new(TextResponder { body, chunked }),
    );
    server.start()?;
    println!("HTTP server on {}, press Enter to stop", server.local_addr()?);
    wait_for_enter();
    server.stop();
    Ok(())
}
