//! Explicit reservation of a fixed network port
//!
//! The harness never allocates ports on behalf of scenarios. A scenario that
//! needs a port to be busy (to check how the CLI reports a conflict) holds
//! a `PortReservation` for as long as the conflict must last.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use crate::common::{Error, Result};

/// A listening socket held on a port until dropped or released
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    listener: Option<TcpListener>,
}

impl PortReservation {
    /// Listen on `0.0.0.0:port`. Fails if something else already holds it.
    pub fn acquire(port: u16) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr).map_err(|source| Error::PortUnavailable { port, source })?;
        let port = listener.local_addr()?.port();
        tracing::debug!(port, "Reserved port");
        Ok(Self {
            port,
            listener: Some(listener),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop listening. Dropping the reservation has the same effect.
    pub fn release(mut self) {
        self.listener.take();
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if self.listener.take().is_some() {
            tracing::debug!(port = self.port, "Released port");
        }
    }
}
