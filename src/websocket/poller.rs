use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::PollError;

/// Readiness check over a set of socket handles.
pub trait Poller {
    /// Returns the descriptors in `fds` with pending input, hang-up or
    /// error, in the order given. Must not block.
    fn ready(&mut self, fds: &[BorrowedFd<'_>]) -> Result<Vec<RawFd>, PollError>;
}

/// `poll(2)` with a zero timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixPoller;

impl Poller for NixPoller {
    fn ready(&mut self, fds: &[BorrowedFd<'_>]) -> Result<Vec<RawFd>, PollError> {
        let mut pollfds: Vec<PollFd<'_>> = fds
            .iter()
            .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
            .collect();

        let count = poll(&mut pollfds, PollTimeout::ZERO)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let interesting =
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;

        Ok(pollfds
            .iter()
            .zip(fds)
            .filter(|(pfd, _)| {
                pfd.revents()
                    .map_or(false, |revents| revents.intersects(interesting))
            })
            .map(|(_, fd)| fd.as_raw_fd())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::{AsFd, AsRawFd};
    use std::time::{Duration, Instant};

    fn wait_ready(poller: &mut NixPoller, fds: &[BorrowedFd<'_>]) -> Vec<RawFd> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let ready = poller.ready(fds).unwrap();
            if !ready.is_empty() || Instant::now() > deadline {
                return ready;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_idle_listener_not_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut poller = NixPoller;
        assert!(poller.ready(&[listener.as_fd()]).unwrap().is_empty());
    }

    #[test]
    fn test_pending_accept_and_data_are_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut poller = NixPoller;

        let listener_fd = listener.as_raw_fd();
        assert_eq!(wait_ready(&mut poller, &[listener.as_fd()]), vec![listener_fd]);

        let (peer, _) = listener.accept().unwrap();
        let peer_fd = peer.as_raw_fd();
        let both = [listener.as_fd(), peer.as_fd()];
        assert!(poller.ready(&both).unwrap().is_empty());

        client.write_all(b"ping").unwrap();
        assert_eq!(wait_ready(&mut poller, &both), vec![peer_fd]);
    }
}
