// TCP listener, accept loop, and idle sweeper.
//
// Architecture: thread-per-connection over a shared `ServerContext`.
//
// - **Accept thread** (`accept_loop`): polls a non-blocking `TcpListener`,
//   sleeping briefly when nothing is pending. Each accepted socket is
//   registered with the context and handed to a new handler thread. Every
//   `sweep_interval` the same loop runs `ServerContext::sweep_idle`, so idle
//   supervision needs no timer thread of its own.
// - **Connection threads** (one per client): run `ConnectionHandler::run`,
//   which blocks on reads and calls into sessions directly. Session calls are
//   short critical sections; writes happen after the session lock is
//   released.
//
// Shutdown: `ServerHandle::stop` (or the admin console's `Shutdown`) sets the
// context's shutdown flag. The accept loop notices on its next poll, stops
// accepting, and force-closes every remaining connection so their handler
// threads unblock and exit.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::ConnectionHandler;
use crate::error::ServerError;
use crate::registry::ServerContext;

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle returned by `start_server` to control the running server.
pub struct ServerHandle {
    context: Arc<ServerContext>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Signal the server to stop and wait for the accept loop to finish.
    pub fn stop(mut self) {
        self.context.request_shutdown();
        self.join();
    }

    /// Block until the server stops on its own (admin `Shutdown`).
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if self.thread.take().is_some_and(|handle| handle.join().is_err()) {
            warn!("accept thread panicked");
        }
    }
}

/// Bind the listener and start the accept loop on a background thread.
/// Returns a handle and the bound address (useful with port 0).
pub fn start_server(config: ServerConfig) -> Result<(ServerHandle, SocketAddr), ServerError> {
    let address = config.listen_address();
    let bind_error = |source: io::Error| ServerError::Bind {
        addr: address.clone(),
        source,
    };
    let listener = TcpListener::bind(&address).map_err(bind_error)?;
    let local = listener.local_addr().map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;

    let context = Arc::new(ServerContext::new(config));
    let loop_context = Arc::clone(&context);
    let thread = thread::Builder::new()
        .name("salvo-accept".into())
        .spawn(move || accept_loop(listener, loop_context))
        .map_err(|source| ServerError::Spawn {
            name: "accept",
            source,
        })?;

    info!(addr = %local, rules = ?context.config().rules, "salvo server listening");
    Ok((
        ServerHandle {
            context,
            thread: Some(thread),
        },
        local,
    ))
}

/// Accept connections and sweep idle ones until shutdown is requested.
fn accept_loop(listener: TcpListener, context: Arc<ServerContext>) {
    let sweep_interval = context.config().sweep_interval();
    let mut last_sweep = Instant::now();

    while !context.is_shutting_down() {
        match listener.accept() {
            Ok((stream, peer)) => accept_connection(&context, stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) => {
                warn!(%error, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }

        let now = Instant::now();
        if now.duration_since(last_sweep) >= sweep_interval {
            context.sweep_idle(now);
            last_sweep = now;
        }
    }

    info!(
        connections = context.connection_count(),
        "shutting down; closing connections"
    );
    context.close_all();
}

/// Register a freshly accepted socket and give it a handler thread.
fn accept_connection(context: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    if let Err(error) = stream.set_nonblocking(false) {
        warn!(%peer, %error, "could not configure accepted socket");
        return;
    }
    stream.set_nodelay(true).ok();

    let link = match context.register_connection(stream) {
        Ok(link) => link,
        Err(error) => {
            warn!(%peer, %error, "could not register connection");
            return;
        }
    };
    let handler = match ConnectionHandler::new(Arc::clone(context), Arc::clone(&link)) {
        Ok(handler) => handler,
        Err(error) => {
            warn!(%peer, %error, "could not start connection handler");
            context.release_connection(&link);
            return;
        }
    };

    debug!(conn = %link.id(), %peer, "accepted");
    let spawned = thread::Builder::new()
        .name(format!("salvo-conn-{}", link.id()))
        .spawn(move || handler.run());
    if let Err(error) = spawned {
        warn!(conn = %link.id(), %error, "could not spawn connection thread");
        context.release_connection(&link);
    }
}
