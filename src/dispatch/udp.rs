//! UDP dispatch: one datagram out, up to N datagrams back.
//!
//! Each client datagram gets a fresh ephemeral socket so responses can be
//! told apart without session tracking. There is no failover; a failed
//! exchange is reported and the client simply retries. Shutdown stops the
//! wait for further responses without reporting the destination.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::dispatch::{admit, report, DispatchError};
use crate::health::HealthReporter;
use crate::lifecycle::Shutdown;
use crate::load_balancer::{pick_destination, RequestContext};
use crate::observability::metrics;
use crate::routing::RouteState;

pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpDispatcher {
    reporter: Arc<dyn HealthReporter>,
    shutdown: Shutdown,
}

impl UdpDispatcher {
    pub fn new(reporter: Arc<dyn HealthReporter>) -> Self {
        Self {
            reporter,
            shutdown: Shutdown::new(),
        }
    }

    /// Abandon in-flight exchanges when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Forward `datagram` from `peer` and relay responses back through `reply`.
    ///
    /// Returns the number of responses relayed.
    pub async fn proxy(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        route: &RouteState,
        reply: &UdpSocket,
    ) -> Result<usize, DispatchError> {
        let start = Instant::now();
        let result = self.exchange(datagram, peer, route, reply).await;
        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.status().as_u16(),
        };
        metrics::record_request("udp", route.cluster().id(), status, start);
        result
    }

    async fn exchange(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        route: &RouteState,
        reply: &UdpSocket,
    ) -> Result<usize, DispatchError> {
        let cluster = route.cluster();
        let mut ctx = RequestContext::new(route.id_arc()).with_remote_addr(peer);
        let _lease = admit(route, &ctx).await?;

        let destination = pick_destination(&mut ctx, cluster).ok_or_else(|| {
            DispatchError::NoAvailableDestination {
                cluster: cluster.id().to_string(),
            }
        })?;
        let _guard = destination.track();
        let endpoint = destination.endpoint();

        let bind: SocketAddr = if endpoint.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;

        if let Err(e) = socket.send_to(datagram, endpoint).await {
            warn!(route = route.id(), destination = %endpoint, error = %e, "UDP send failed");
            report(self.reporter.as_ref(), &destination, false);
            return Err(e.into());
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut relayed = 0;
        while relayed < route.udp_response_count() {
            let received = tokio::select! {
                received = tokio::time::timeout(route.timeout(), socket.recv_from(&mut buf)) => received,
                _ = self.shutdown.wait() => {
                    debug!(route = route.id(), destination = %endpoint, relayed, "UDP exchange closed by shutdown");
                    return Ok(relayed);
                }
            };
            match received {
                Ok(Ok((n, from))) => {
                    if from != endpoint {
                        debug!(route = route.id(), from = %from, "Ignoring datagram from unexpected source");
                        continue;
                    }
                    reply.send_to(&buf[..n], peer).await?;
                    relayed += 1;
                }
                Ok(Err(e)) => {
                    warn!(route = route.id(), destination = %endpoint, error = %e, "UDP receive failed");
                    report(self.reporter.as_ref(), &destination, false);
                    return Err(e.into());
                }
                Err(_) if relayed == 0 => {
                    debug!(route = route.id(), destination = %endpoint, "No UDP response before timeout");
                    report(self.reporter.as_ref(), &destination, false);
                    return Err(DispatchError::Timeout {
                        route: route.id().to_string(),
                        timeout: route.timeout(),
                    });
                }
                // Fewer responses than allowed is a normal end of exchange.
                Err(_) => break,
            }
        }

        report(self.reporter.as_ref(), &destination, true);
        Ok(relayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, DestinationState};
    use crate::config::{ClusterConfig, DestinationConfig, RouteConfig};
    use crate::lifecycle::Shutdown;
    use crate::resolver::DestinationResolverManager;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counts {
        failures: AtomicUsize,
        successes: AtomicUsize,
    }

    impl HealthReporter for Counts {
        fn report_failure(&self, _destination: &Arc<DestinationState>) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn report_success(&self, _destination: &Arc<DestinationState>) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn route_to(addr: SocketAddr, responses: usize, timeout_ms: u64) -> RouteState {
        let cluster = ClusterState::from_config(ClusterConfig::new(
            "udp",
            vec![DestinationConfig::new(addr.to_string())],
        ))
        .unwrap();
        Arc::new(DestinationResolverManager::with_dns(Shutdown::new()))
            .initialize(&cluster)
            .await
            .unwrap();
        let config = RouteConfig {
            name: "udp-route".into(),
            listener: "udp".into(),
            host: None,
            path_prefix: None,
            cluster: "udp".into(),
            priority: 0,
            timeout_ms: Some(timeout_ms),
            retry_count: 0,
            udp_response_count: responses,
            rate_limit: None,
        };
        RouteState::new(&config, cluster, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn relays_up_to_response_count() {
        // Backend answers every datagram three times.
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, from)) = backend.recv_from(&mut buf).await {
                for _ in 0..3 {
                    let _ = backend.send_to(&buf[..n], from).await;
                }
            }
        });

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let reporter = Arc::new(Counts::default());
        let dispatcher = UdpDispatcher::new(reporter.clone());
        let route = route_to(backend_addr, 2, 500).await;

        let relayed = dispatcher.proxy(b"hello", client_addr, &route, &listener).await.unwrap();
        assert_eq!(relayed, 2);

        let mut buf = [0u8; 16];
        for _ in 0..2 {
            let (n, _) = client.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");
        }
        assert_eq!(reporter.successes.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn silent_destination_is_reported() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let reporter = Arc::new(Counts::default());
        let dispatcher = UdpDispatcher::new(reporter.clone());
        let route = route_to(silent.local_addr().unwrap(), 1, 50).await;

        let err = dispatcher
            .proxy(b"ping", "127.0.0.1:9".parse().unwrap(), &route, &listener)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_exchange() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let shutdown = Shutdown::new();
        let reporter = Arc::new(Counts::default());
        let dispatcher = UdpDispatcher::new(reporter.clone()).with_shutdown(shutdown.clone());
        let route = route_to(silent.local_addr().unwrap(), 1, 10_000).await;

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let relayed = tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.proxy(b"ping", "127.0.0.1:9".parse().unwrap(), &route, &listener),
        )
        .await
        .expect("exchange outlived shutdown")
        .unwrap();
        assert_eq!(relayed, 0);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 0);
        assert_eq!(reporter.successes.load(Ordering::SeqCst), 0);
    }
}
