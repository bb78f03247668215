use std::iter;
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::rc::Rc;

use tracing::info;
use uuid::Uuid;

use crate::error::ServerError;
use crate::websocket::Connection;

/// A registry slot: the listening socket or an established peer.
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    Listening(&'a TcpListener),
    Peer(&'a Rc<Connection>),
}

impl<'a> Entry<'a> {
    pub fn fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }

    pub fn as_fd(&self) -> BorrowedFd<'a> {
        match *self {
            Entry::Listening(listener) => listener.as_fd(),
            Entry::Peer(conn) => conn.as_ref().as_fd(),
        }
    }
}

/// Insertion-ordered set of live sockets, unique by descriptor.
///
/// The listening socket is the first entry for the registry's whole life.
#[derive(Debug)]
pub struct ConnectionRegistry {
    listener: TcpListener,
    peers: Vec<Rc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            peers: Vec::new(),
        }
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn insert(&mut self, conn: Rc<Connection>) -> Result<(), ServerError> {
        let fd = conn.as_raw_fd();
        if self.contains_fd(fd) {
            return Err(ServerError::DuplicateSocket(fd));
        }
        info!("Added connection {} (fd {}) to registry", conn.id(), fd);
        self.peers.push(conn);
        Ok(())
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Rc<Connection>> {
        let index = self.peers.iter().position(|conn| conn.id() == id)?;
        let conn = self.peers.remove(index);
        info!("Removed connection {} from registry", id);
        Some(conn)
    }

    pub fn get_by_fd(&self, fd: RawFd) -> Option<&Rc<Connection>> {
        self.peers.iter().find(|conn| conn.as_raw_fd() == fd)
    }

    pub fn contains_fd(&self, fd: RawFd) -> bool {
        self.entries().any(|entry| entry.fd() == fd)
    }

    /// Every entry, sentinel first, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = Entry<'_>> {
        iter::once(Entry::Listening(&self.listener)).chain(self.peers.iter().map(Entry::Peer))
    }

    /// Descriptors of every entry, sentinel included, in insertion order.
    pub fn fds(&self) -> Vec<RawFd> {
        self.entries().map(|entry| entry.fd()).collect()
    }

    /// Borrowed handles of every entry, in the same order as [`fds`](Self::fds).
    pub fn borrowed_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.entries().map(|entry| entry.as_fd()).collect()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Rc<Connection>> {
        self.peers.iter()
    }

    /// Ids of peers that asked to be closed.
    pub fn closing_ids(&self) -> Vec<Uuid> {
        self.peers
            .iter()
            .filter(|conn| conn.is_closing())
            .map(|conn| conn.id())
            .collect()
    }

    /// Remove every peer, leaving only the sentinel.
    pub fn drain_peers(&mut self) -> Vec<Rc<Connection>> {
        self.peers.drain(..).collect()
    }

    /// Total entries, sentinel included.
    pub fn len(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
