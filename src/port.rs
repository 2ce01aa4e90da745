//! Listening-port selection.
//!
//! The server prefers a fixed default port so viewer URLs stay stable across
//! runs; when that port is taken it asks the OS for a free ephemeral one.
//! The probe releases the socket before returning, so the number can in rare
//! cases be grabbed by another process before the real listener binds it;
//! callers handle that by retrying with a fresh ephemeral port.

use std::net::TcpListener;

pub const DEFAULT_PORT: u16 = 4243;

/// Pick the port the server should try to bind: the default port when it is
/// free, otherwise a fresh OS-assigned one.
///
/// Errors only when the OS cannot allocate any socket at all.
pub fn select_port() -> std::io::Result<u16> {
    if port_usable(DEFAULT_PORT) {
        return Ok(DEFAULT_PORT);
    }
    ephemeral_port()
}

/// Probe-bind `port` on localhost and release it again.
pub fn port_usable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Bind port 0, read the port the OS handed out, release it.
pub fn ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
