use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use config::ConfigError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConnectionConfig, HandshakeConfig, Settings};
use crate::error::{format_io_error, HandshakeError, ServerError};
use crate::websocket::poller::{NixPoller, Poller};
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::{frame, handshake, Connection};

pub type ConnectHandler = Box<dyn FnMut(&Rc<Connection>)>;
pub type DisconnectHandler = Box<dyn FnMut(&Rc<Connection>)>;
pub type ErrorHandler = Box<dyn FnMut(&str)>;

/// A handler for one of the server-level events.
pub enum ServerHandler {
    Connection(ConnectHandler),
    Disconnect(DisconnectHandler),
    Error(ErrorHandler),
}

/// Outcome of one event-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was ready.
    Idle,
    /// At least one socket was serviced.
    Busy,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub handshake: HandshakeConfig,
    pub connection: ConnectionConfig,
    pub idle_sleep: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            connection: ConnectionConfig::default(),
            idle_sleep: Duration::ZERO,
        }
    }
}

impl ServerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.handshake.validate()?;
        self.connection.validate()
    }
}

impl From<&Settings> for ServerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            handshake: settings.handshake.clone(),
            connection: settings.connection.clone(),
            idle_sleep: Duration::from_millis(settings.server.idle_sleep_ms),
        }
    }
}

/// Single-threaded WebSocket server driven by a readiness poll.
pub struct Server<P: Poller = NixPoller> {
    address: String,
    port: u16,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    poller: P,
    options: ServerOptions,
    recv_buf: Vec<u8>,
    on_connect: Option<ConnectHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_error: Option<ErrorHandler>,
}

impl Server<NixPoller> {
    /// Bind and listen on `address:port`.
    pub fn bind(address: &str, port: u16) -> Result<Self, ServerError> {
        Self::with_options(address, port, ServerOptions::default())
    }

    pub fn with_options(address: &str, port: u16, options: ServerOptions) -> Result<Self, ServerError> {
        Self::with_poller(address, port, options, NixPoller)
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ServerError> {
        Self::with_options(
            &settings.server.host,
            settings.server.port,
            ServerOptions::from(settings),
        )
    }
}

impl<P: Poller> Server<P> {
    pub fn with_poller(
        address: &str,
        port: u16,
        options: ServerOptions,
        poller: P,
    ) -> Result<Self, ServerError> {
        options.validate()?;

        let bind_err = |source: io::Error| ServerError::Bind {
            addr: format!("{}:{}", address, port),
            source,
        };

        let listener = TcpListener::bind((address, port)).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!("Starting websocket server on {}", local_addr);

        Ok(Self {
            address: address.to_string(),
            port,
            local_addr,
            registry: ConnectionRegistry::new(listener),
            poller,
            recv_buf: vec![0u8; options.connection.recv_buffer],
            options,
            on_connect: None,
            on_disconnect: None,
            on_error: None,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The bound address, with the actual port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.peer_count()
    }

    /// Register by event name: `"connection"`, `"disconnect"` or `"error"`.
    pub fn on(&mut self, event: &str, handler: ServerHandler) -> Result<(), ServerError> {
        match (event, handler) {
            ("connection", ServerHandler::Connection(h)) => self.on_connect = Some(h),
            ("disconnect", ServerHandler::Disconnect(h)) => self.on_disconnect = Some(h),
            ("error", ServerHandler::Error(h)) => self.on_error = Some(h),
            ("connection" | "disconnect" | "error", _) => {
                return Err(ServerError::HandlerMismatch {
                    event: event.to_string(),
                })
            }
            (other, _) => return Err(ServerError::UnknownEvent(other.to_string())),
        }
        Ok(())
    }

    pub fn on_connection<F>(&mut self, handler: F)
    where
        F: FnMut(&Rc<Connection>) + 'static,
    {
        self.on_connect = Some(Box::new(handler));
    }

    pub fn on_disconnect<F>(&mut self, handler: F)
    where
        F: FnMut(&Rc<Connection>) + 'static,
    {
        self.on_disconnect = Some(Box::new(handler));
    }

    pub fn on_error<F>(&mut self, handler: F)
    where
        F: FnMut(&str) + 'static,
    {
        self.on_error = Some(Box::new(handler));
    }

    /// Run the event loop until polling fails.
    ///
    /// The poll failure has already been passed to the error handler when
    /// it is returned here.
    pub fn listen(&mut self) -> Result<(), ServerError> {
        info!("Listening for websocket connections on {}", self.local_addr);
        loop {
            match self.poll_once() {
                Ok(Tick::Idle) if !self.options.idle_sleep.is_zero() => {
                    std::thread::sleep(self.options.idle_sleep);
                }
                Ok(_) => {}
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }
        }
    }

    /// One iteration: poll, accept at most one pending connection, then
    /// read from every ready peer. Connections closed from handlers are
    /// removed once dispatch is over.
    pub fn poll_once(&mut self) -> Result<Tick, ServerError> {
        let fds = self.registry.borrowed_fds();
        let ready = match self.poller.ready(&fds) {
            Ok(ready) => ready,
            Err(e) => {
                error!("Poll failed: {}", e);
                self.report_error(&e.to_string());
                return Err(ServerError::Poll(e));
            }
        };

        if ready.is_empty() {
            return Ok(Tick::Idle);
        }

        let listener_fd = self.registry.listener_fd();
        if ready.contains(&listener_fd) {
            self.accept_pending();
        }

        let mut buf = std::mem::take(&mut self.recv_buf);
        for fd in ready.into_iter().filter(|fd| *fd != listener_fd) {
            self.receive(fd, &mut buf);
        }
        self.recv_buf = buf;

        self.sweep_closed();
        Ok(Tick::Busy)
    }

    /// Release every peer. The listening socket closes when the server is
    /// dropped.
    pub fn shutdown(&mut self) {
        for conn in self.registry.drain_peers() {
            conn.release();
        }
    }

    fn accept_pending(&mut self) {
        let (stream, addr) = match self.registry.listener().accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("Accept failed: {}", e);
                self.report_error(&format_io_error(&e));
                return;
            }
        };

        debug!("Accepted TCP connection from {}", addr);

        let stream = match handshake::accept(stream, &self.options.handshake) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Handshake with {} failed: {}", addr, e);
                let message = match &e {
                    HandshakeError::Write(io_err) | HandshakeError::Read(io_err) => {
                        format_io_error(io_err)
                    }
                    other => other.to_string(),
                };
                self.report_error(&message);
                return;
            }
        };

        let conn = Rc::new(Connection::new(stream));
        if let Err(e) = self.registry.insert(conn.clone()) {
            error!("Failed to register connection from {}: {}", addr, e);
            conn.release();
            self.report_error(&e.to_string());
            return;
        }

        info!("WebSocket connection established with {} (id: {})", addr, conn.id());
        if let Some(handler) = self.on_connect.as_mut() {
            handler(&conn);
        }
    }

    fn receive(&mut self, fd: RawFd, buf: &mut [u8]) {
        let conn = match self.registry.get_by_fd(fd) {
            Some(conn) if !conn.is_closing() => conn.clone(),
            _ => return,
        };

        match conn.recv(buf) {
            Ok(0) => self.disconnect(conn.id()),
            Ok(n) => self.dispatch_frames(&conn, &buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!("Receive on connection {} failed: {}", conn.id(), e);
                self.disconnect(conn.id());
            }
        }
    }

    /// Deliver every frame in one read, in order. Stops early once a handler
    /// closes the connection.
    fn dispatch_frames(&mut self, conn: &Rc<Connection>, mut data: &[u8]) {
        while !data.is_empty() && !conn.is_closing() && !conn.is_released() {
            match frame::decode_one(data) {
                Ok((payload, used)) => {
                    conn.dispatch(&payload);
                    data = &data[used..];
                }
                Err(e) => {
                    warn!("Dropping connection {}: {}", conn.id(), e);
                    self.report_error(&e.to_string());
                    self.disconnect(conn.id());
                    return;
                }
            }
        }
    }

    fn sweep_closed(&mut self) {
        for id in self.registry.closing_ids() {
            self.disconnect(id);
        }
    }

    fn disconnect(&mut self, id: Uuid) {
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        conn.release();
        info!("WebSocket connection closed (id: {})", id);

        if let Some(handler) = self.on_disconnect.as_mut() {
            handler(&conn);
        }
    }

    fn report_error(&mut self, message: &str) {
        if let Some(handler) = self.on_error.as_mut() {
            handler(message);
        }
    }
}

impl<P: Poller> Drop for Server<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
