// src/server.rs
use crate::config::Config;
use crate::error::EtudeResult;
use crate::http::Handler;
use crate::runtime::{Handle, Settings, Shared};
use crate::scheduler::{Limits, Scheduler};
use crate::syscalls;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A bound, not yet running server.
///
/// ```no_run
/// use etude_core::{Context, EtudeResult, Response, Server};
///
/// fn hello(_ctx: &mut Context) -> EtudeResult<Response> {
///     Ok(Response::ok("Hello world!"))
/// }
///
/// let server = Server::bind("127.0.0.1:8000".parse().unwrap()).unwrap();
/// server.run(hello).unwrap();
/// ```
pub struct Server {
    listen_fd: RawFd,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    max_connections: usize,
    limits: Limits,
    handle_signals: bool,
}

impl Server {
    /// Binds with default settings.
    pub fn bind(addr: SocketAddr) -> EtudeResult<Self> {
        let config = Config {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Config::default()
        };
        Self::build(addr, &config)
    }

    /// Binds `config.host:config.port` and applies every other setting.
    pub fn from_config(config: &Config) -> EtudeResult<Self> {
        Self::build(config.addr()?, config)
    }

    fn build(addr: SocketAddr, config: &Config) -> EtudeResult<Self> {
        let shared = Shared::new(Settings {
            liveness_probe: config.liveness_probe(),
            stack_size: config.coroutine_stack_size,
        })?;
        let listen_fd = syscalls::create_listen_socket(&addr, config.backlog)?;
        let local_addr = match syscalls::local_addr(listen_fd) {
            Ok(a) => a,
            Err(e) => {
                syscalls::close(listen_fd);
                return Err(e.into());
            }
        };
        Ok(Self {
            listen_fd,
            local_addr,
            shared,
            max_connections: config.max_connections,
            limits: Limits {
                read_buffer_size: config.read_buffer_size,
                max_request_size: config.max_request_size,
                keep_alive: config.keep_alive_timeout(),
                poll_interval: config.poll_interval(),
            },
            handle_signals: config.handle_signals,
        })
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for scheduling calls or shutting down from outside.
    pub fn handle(&self) -> Handle {
        Handle::new(self.shared.clone())
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Idle keep-alive timeout; `None` closes after every response.
    pub fn keep_alive(mut self, timeout: Option<Duration>) -> Self {
        self.limits.keep_alive = timeout;
        self
    }

    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.limits.max_request_size = bytes;
        self
    }

    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Serves `handler` on the calling thread until [`Handle::shutdown`].
    pub fn run<H: Handler>(self, handler: H) -> EtudeResult<()> {
        if self.handle_signals {
            let handle = self.handle();
            // Setup signal handling - ctrl-c graceful shutdown
            if let Err(e) = ctrlc::set_handler(move || handle.shutdown()) {
                warn!("could not install signal handler: {e}");
            }
        }

        info!(addr = %self.local_addr, "etude listening");
        let scheduler = Scheduler::new(
            self.shared,
            Arc::new(handler),
            self.listen_fd,
            self.max_connections,
            self.limits,
        );
        scheduler.run()
    }
}
