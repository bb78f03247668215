use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use tracing::{debug, error};
use uuid::Uuid;

use crate::error::ServerError;
use crate::websocket::frame;

/// Called with the connection and the unmasked payload of each frame.
pub type MessageHandler = Box<dyn FnMut(&Connection, &[u8])>;

/// An established WebSocket peer.
pub struct Connection {
    id: Uuid,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    on_message: RefCell<Option<MessageHandler>>,
    closing: Cell<bool>,
    released: Cell<bool>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            id: Uuid::new_v4(),
            stream,
            peer_addr,
            on_message: RefCell::new(None),
            closing: Cell::new(false),
            released: Cell::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Encode `text` as a single text frame and write it.
    pub fn send(&self, text: &str) -> crate::Result<()> {
        if self.released.get() {
            return Err(ServerError::ConnectionClosed.into());
        }

        let frame = frame::encode(text)?;
        (&self.stream).write_all(&frame).map_err(|e| {
            error!("Failed to send to connection {}: {}", self.id, e);
            ServerError::Send(e)
        })?;
        Ok(())
    }

    /// Replace the message handler.
    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(&Connection, &[u8]) + 'static,
    {
        *self.on_message.borrow_mut() = Some(Box::new(handler));
    }

    /// Register by event name. Only `"message"` is known.
    pub fn on(&self, event: &str, handler: MessageHandler) -> Result<(), ServerError> {
        match event {
            "message" => {
                *self.on_message.borrow_mut() = Some(handler);
                Ok(())
            }
            other => Err(ServerError::UnknownEvent(other.to_string())),
        }
    }

    pub fn has_message_handler(&self) -> bool {
        self.on_message.borrow().is_some()
    }

    /// Ask the server to drop this connection once the current dispatch
    /// pass is over. The disconnect handler fires then.
    pub fn close(&self) {
        self.closing.set(true);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.get()
    }

    pub fn is_released(&self) -> bool {
        self.released.get()
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Run the message handler, if any. A handler that registers a
    /// replacement while running keeps the replacement.
    pub(crate) fn dispatch(&self, payload: &[u8]) {
        let handler = self.on_message.borrow_mut().take();
        if let Some(mut handler) = handler {
            handler(self, payload);
            let mut slot = self.on_message.borrow_mut();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    /// Shut the socket down. Idempotent; the descriptor itself closes when
    /// the last handle to this connection is dropped.
    pub(crate) fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("Shutdown of connection {} failed: {}", self.id, e);
            }
        }
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.stream.as_raw_fd())
            .field("peer_addr", &self.peer_addr)
            .field("closing", &self.closing.get())
            .field("released", &self.released.get())
            .finish()
    }
}
