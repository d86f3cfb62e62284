use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Default sleep between accept attempts when no connection is pending.
pub const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a `poll` sleep so that
/// [`HttpServer::stop`](crate::server::HttpServer::stop) terminates it
/// promptly. Accepted streams are switched back to blocking mode before
/// being handed to `on_accept`.
pub fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    poll: Duration,
    mut on_accept: impl FnMut(TcpStream, SocketAddr),
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                on_accept(stream, peer);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(poll);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}
