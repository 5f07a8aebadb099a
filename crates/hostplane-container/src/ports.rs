//! Host port allocation.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use crate::error::{ContainerError, Result};

/// Pick a currently free TCP port on the host.
///
/// The port is released before the container binds it, so another process
/// may claim it in between.
pub fn allocate_free_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .map_err(|e| ContainerError::PortUnavailable(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| ContainerError::PortUnavailable(e.to_string()))?
        .port();
    Ok(port)
}
