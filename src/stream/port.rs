//! Ephemeral port negotiation
//!
//! A session starts on a random port inside the configured range and walks
//! downward, wrapping from the bottom of the range to the top, until a bind
//! succeeds or every port has been tried once.

use crate::config::PortRange;
use crate::error::{StreamError, StreamResult};
use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpSocket;
use tracing::trace;

/// Pick a uniformly random port in the range
pub fn random_start(range: PortRange) -> u16 {
    rand::thread_rng().gen_range(range.min..=range.max)
}

/// Probe order over a port range
///
/// Yields `start`, `start - 1`, ... wrapping from `min` to `max`, and stops
/// after every port in the range has been yielded once.
#[derive(Debug, Clone)]
pub struct PortProbe {
    range: PortRange,
    next: u16,
    remaining: u32,
}

impl PortProbe {
    pub fn new(range: PortRange, start: u16) -> Self {
        let start = if range.contains(start) { start } else { range.max };
        Self {
            range,
            next: start,
            remaining: range.len(),
        }
    }
}

impl Iterator for PortProbe {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let port = self.next;
        self.next = if port <= self.range.min {
            self.range.max
        } else {
            port - 1
        };
        Some(port)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

/// Try `bind` on each port in probe order until one succeeds
///
/// Returns the port together with whatever `bind` produced.
pub fn bind_first<T>(
    range: PortRange,
    start: u16,
    mut bind: impl FnMut(u16) -> io::Result<T>,
) -> StreamResult<(u16, T)> {
    let mut attempts = 0;

    for port in PortProbe::new(range, start) {
        attempts += 1;
        match bind(port) {
            Ok(bound) => return Ok((port, bound)),
            Err(e) => trace!(port = port, error = %e, "Port unavailable"),
        }
    }

    Err(StreamError::NoFreePort {
        min: range.min,
        max: range.max,
        attempts,
    })
}

/// Create a TCP socket bound to `addr:port`
pub fn bind_socket(addr: IpAddr, port: u16) -> io::Result<TcpSocket> {
    let socket = match addr {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(addr, port))?;
    Ok(socket)
}
