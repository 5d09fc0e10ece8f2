//! UDP listener loop.
//!
//! Every inbound datagram becomes its own exchange task; responses are sent
//! back to the client from the listening socket.

use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::dispatch::udp::MAX_DATAGRAM;
use crate::lifecycle::{ProxyRuntime, Shutdown};

/// Receive until shutdown, proxying every datagram over the listener's
/// current route.
pub async fn serve(socket: UdpSocket, name: Arc<str>, runtime: Arc<ProxyRuntime>, shutdown: Shutdown) {
    let socket = Arc::new(socket);
    let mut stop = shutdown.subscribe();
    if shutdown.is_triggered() {
        return;
    }
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = stop.recv() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, peer) = match received {
            Ok(received) => received,
            // ICMP port-unreachable from an earlier reply surfaces here on some platforms.
            Err(e) => {
                tracing::debug!(listener = %name, error = %e, "UDP receive failed");
                continue;
            }
        };

        let Some(route) = runtime.stream_route(&name) else {
            tracing::warn!(listener = %name, peer = %peer, "No route for listener, dropping datagram");
            continue;
        };

        let datagram = buf[..len].to_vec();
        let runtime = runtime.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            match runtime.udp().proxy(&datagram, peer, &route, &socket).await {
                Ok(responses) => {
                    tracing::trace!(route = %route.id(), peer = %peer, responses, "UDP exchange finished")
                }
                Err(e) => {
                    tracing::debug!(route = %route.id(), peer = %peer, error = %e, "UDP exchange failed")
                }
            }
        });
    }

    tracing::info!(listener = %name, "UDP listener stopped");
}
