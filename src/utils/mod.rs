// SPDX-License-Identifier: GPL-3.0-only

use futures_executor::ThreadPool;
use futures_util::task::{SpawnError, SpawnExt};

pub mod dirs;
pub mod env;

/// Runs blocking `work` on the worker pool and waits for its result.
pub async fn unblock<T, F>(executor: &ThreadPool, work: F) -> Result<T, SpawnError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = executor.spawn_with_handle(async move { work() })?;
    Ok(handle.await)
}

/// Both ends of a peer to peer connection over a socket pair.
#[cfg(test)]
pub fn peer_connections() -> (zbus::Connection, zbus::Connection) {
    let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
    let (server, client) = futures_executor::block_on(futures_util::future::join(
        zbus::connection::Builder::unix_stream(ours)
            .server(zbus::Guid::generate())
            .unwrap()
            .p2p()
            .build(),
        zbus::connection::Builder::unix_stream(theirs).p2p().build(),
    ));
    (server.unwrap(), client.unwrap())
}
