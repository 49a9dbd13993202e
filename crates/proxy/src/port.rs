//! Loopback port allocation for the per-run sockets.

use anyhow::{anyhow, Result};
use tokio::net::TcpListener;

const PICK_ATTEMPTS: usize = 8;

/// Reserves a free loopback port by bind-probing `127.0.0.1:0` and
/// releasing the listener. The caller binds it again shortly after; the
/// small reuse window is why callers that can hold the listener should use
/// [`reserve_listener`] instead.
pub fn pick_free_port() -> Result<u16> {
    let mut last_err = None;
    for _ in 0..PICK_ATTEMPTS {
        match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                drop(listener);
                return Ok(port);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(anyhow!(
        "failed to allocate a free loopback port: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Binds a fresh loopback listener on an OS-assigned port and keeps it,
/// so the port cannot be lost to a collision before use.
pub async fn reserve_listener() -> Result<(u16, TcpListener)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((port, listener))
}
