//! Startup orchestration and configuration reload.
//!
//! # Responsibilities
//! - Validate configuration and build cluster, route and router state
//! - Initialize subsystems in dependency order
//! - Start background tasks (health checks, destination refresh)
//! - Bind listeners and begin accepting traffic
//! - Apply reloaded configuration without dropping live traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - A reload is all-or-nothing: every new cluster is resolved before
//!   anything is published, so a failed reload leaves the previous state
//! - Unchanged clusters survive a reload with their health and counters
//! - Listeners start last (traffic only when ready) and are fixed for the
//!   life of the process; reloads change what they route to
//!
//! # Reload
//! ```text
//! ProxyConfig ─► validate ─► reuse unchanged clusters / resolve new ones
//!             ─► build RouteTable ─► unschedule removed clusters
//!             ─► schedule new clusters ─► evict removed routes ─► publish
//! ```

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::cluster::ClusterState;
use crate::config::validation::validate_config;
use crate::config::{ConfigError, ListenerConfig, Protocol, ProxyConfig};
use crate::dispatch::{HttpDispatcher, HttpForwarder, HyperForwarder, TcpDispatcher, UdpDispatcher};
use crate::health::{ActiveHealthMonitor, HealthReporter, PassiveHealthReporter, ProbeRegistry};
use crate::http::HttpServer;
use crate::lifecycle::Shutdown;
use crate::load_balancer::registry::PolicyError;
use crate::net::connector::{Connector, TcpConnector};
use crate::net::{datagram, listener::Listener};
use crate::resolver::{DestinationResolver, DestinationResolverManager, DnsResolver, ResolveError};
use crate::routing::{RouteState, Router};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to bind listener '{listener}': {source}")]
    Bind {
        listener: String,
        #[source]
        source: io::Error,
    },
}

/// Pluggable collaborators of the runtime.
pub struct Components {
    pub connector: Arc<dyn Connector>,
    pub forwarder: Arc<dyn HttpForwarder>,
    pub reporter: Arc<dyn HealthReporter>,
    pub resolvers: Vec<Arc<dyn DestinationResolver>>,
}

impl Default for Components {
    fn default() -> Self {
        Self {
            connector: Arc::new(TcpConnector::new(true)),
            forwarder: Arc::new(HyperForwarder::new()),
            reporter: Arc::new(PassiveHealthReporter::new()),
            resolvers: vec![Arc::new(DnsResolver::system()) as Arc<dyn DestinationResolver>],
        }
    }
}

/// Everything derived from one configuration snapshot.
#[derive(Debug, Default)]
pub struct RouteTable {
    clusters: HashMap<String, Arc<ClusterState>>,
    routes: HashMap<String, Arc<RouteState>>,
    http: HashMap<String, Arc<Router>>,
    streams: HashMap<String, Arc<RouteState>>,
}

impl RouteTable {
    fn build(config: &ProxyConfig, clusters: HashMap<String, Arc<ClusterState>>) -> Self {
        let default_timeout = Duration::from_millis(config.timeouts.route_ms);
        let protocols: HashMap<&str, Protocol> = config
            .listeners
            .iter()
            .map(|l| (l.name.as_str(), l.protocol))
            .collect();

        let mut routes = HashMap::new();
        let mut http_routes: HashMap<&str, Vec<_>> = HashMap::new();
        let mut streams: HashMap<String, (u32, Arc<RouteState>)> = HashMap::new();

        for route_config in &config.routes {
            // Validation guarantees both references resolve.
            let (Some(cluster), Some(protocol)) = (
                clusters.get(&route_config.cluster),
                protocols.get(route_config.listener.as_str()),
            ) else {
                continue;
            };
            let route = Arc::new(RouteState::new(route_config, cluster.clone(), default_timeout));
            routes.insert(route_config.name.clone(), route.clone());

            match protocol {
                Protocol::Http => http_routes
                    .entry(route_config.listener.as_str())
                    .or_default()
                    .push((route_config, route)),
                Protocol::Tcp | Protocol::Udp => {
                    let replace = streams
                        .get(&route_config.listener)
                        .map_or(true, |(priority, _)| route_config.priority > *priority);
                    if replace {
                        streams.insert(route_config.listener.clone(), (route_config.priority, route));
                    }
                }
            }
        }

        Self {
            clusters,
            routes,
            http: http_routes
                .into_iter()
                .map(|(listener, routes)| (listener.to_string(), Arc::new(Router::new(routes))))
                .collect(),
            streams: streams
                .into_iter()
                .map(|(listener, (_, route))| (listener, route))
                .collect(),
        }
    }
}

/// A bound listener and the task serving it.
#[derive(Debug)]
pub struct BoundListener {
    pub name: String,
    pub protocol: Protocol,
    pub local_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

/// Live proxy state shared by every listener.
pub struct ProxyRuntime {
    table: ArcSwap<RouteTable>,
    resolvers: Arc<DestinationResolverManager>,
    monitor: Arc<ActiveHealthMonitor>,
    tcp: TcpDispatcher,
    udp: UdpDispatcher,
    http: HttpDispatcher,
    reload: tokio::sync::Mutex<()>,
    shutdown: Shutdown,
}

impl ProxyRuntime {
    pub async fn new(config: ProxyConfig, shutdown: Shutdown) -> Result<Arc<Self>, StartupError> {
        Self::with_components(config, shutdown, Components::default()).await
    }

    pub async fn with_components(
        config: ProxyConfig,
        shutdown: Shutdown,
        components: Components,
    ) -> Result<Arc<Self>, StartupError> {
        let connect_timeout = Duration::from_millis(config.timeouts.connect_ms);
        let runtime = Arc::new(Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            resolvers: Arc::new(DestinationResolverManager::new(components.resolvers, shutdown.clone())),
            monitor: ActiveHealthMonitor::new(ProbeRegistry::new(components.connector.clone()), shutdown.clone()),
            tcp: TcpDispatcher::new(components.connector, components.reporter.clone(), connect_timeout)
                .with_shutdown(shutdown.clone()),
            udp: UdpDispatcher::new(components.reporter.clone()).with_shutdown(shutdown.clone()),
            http: HttpDispatcher::new(components.forwarder, components.reporter),
            reload: tokio::sync::Mutex::new(()),
            shutdown,
        });
        runtime.apply_config(config).await?;
        Ok(runtime)
    }

    /// Validate and publish `config`, reusing unchanged clusters.
    pub async fn apply_config(&self, config: ProxyConfig) -> Result<(), StartupError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let _reload = self.reload.lock().await;
        let previous = self.table.load_full();

        let mut clusters = HashMap::new();
        let mut fresh = Vec::new();
        for cluster_config in &config.clusters {
            match previous.clusters.get(&cluster_config.name) {
                Some(existing) if existing.config() == cluster_config => {
                    clusters.insert(cluster_config.name.clone(), existing.clone());
                }
                _ => {
                    let cluster = ClusterState::from_config(cluster_config.clone())?;
                    self.resolvers.prepare(&cluster).await?;
                    fresh.push(cluster.clone());
                    clusters.insert(cluster_config.name.clone(), cluster);
                }
            }
        }

        let table = RouteTable::build(&config, clusters);

        for (name, old) in &previous.clusters {
            let kept = table.clusters.get(name).is_some_and(|c| Arc::ptr_eq(c, old));
            if !kept {
                self.monitor.unschedule(name);
                self.resolvers.unschedule(name);
                tracing::info!(cluster = %name, "Cluster retired");
            }
        }
        for cluster in &fresh {
            self.resolvers.activate(cluster);
        }
        self.monitor.check_health(&fresh);

        for (name, route) in &previous.routes {
            if !table.routes.contains_key(name) {
                route.cluster().policy().evict_route(name);
            }
        }

        tracing::info!(
            clusters = table.clusters.len(),
            routes = table.routes.len(),
            new_clusters = fresh.len(),
            "Configuration applied"
        );
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// Bind every listener and start serving.
    pub async fn start_listeners(
        self: &Arc<Self>,
        listeners: &[ListenerConfig],
    ) -> Result<Vec<BoundListener>, StartupError> {
        let mut bound = Vec::with_capacity(listeners.len());
        for config in listeners {
            let bind_error = |source| StartupError::Bind {
                listener: config.name.clone(),
                source,
            };
            let name: Arc<str> = Arc::from(config.name.as_str());

            let (local_addr, task) = match config.protocol {
                Protocol::Tcp => {
                    let listener = Listener::bind(config).await.map_err(bind_error)?;
                    let local_addr = listener.local_addr().map_err(bind_error)?;
                    let task = tokio::spawn(listener.serve(name, self.clone(), self.shutdown.clone()));
                    (local_addr, task)
                }
                Protocol::Udp => {
                    let socket = UdpSocket::bind(&config.bind_address).await.map_err(bind_error)?;
                    let local_addr = socket.local_addr().map_err(bind_error)?;
                    let task = tokio::spawn(datagram::serve(socket, name, self.clone(), self.shutdown.clone()));
                    (local_addr, task)
                }
                Protocol::Http => {
                    let listener = TcpListener::bind(&config.bind_address).await.map_err(bind_error)?;
                    let local_addr = listener.local_addr().map_err(bind_error)?;
                    let server = HttpServer::new(self.clone(), name);
                    let shutdown = self.shutdown.clone();
                    let task = tokio::spawn(async move {
                        if let Err(e) = server.run(listener, shutdown).await {
                            tracing::error!(error = %e, "HTTP server failed");
                        }
                    });
                    (local_addr, task)
                }
            };

            tracing::info!(
                listener = %config.name,
                protocol = ?config.protocol,
                address = %local_addr,
                "Listener started"
            );
            bound.push(BoundListener {
                name: config.name.clone(),
                protocol: config.protocol,
                local_addr,
                task,
            });
        }
        Ok(bound)
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<ClusterState>> {
        self.table.load().clusters.get(name).cloned()
    }

    pub fn route(&self, name: &str) -> Option<Arc<RouteState>> {
        self.table.load().routes.get(name).cloned()
    }

    pub fn http_router(&self, listener: &str) -> Option<Arc<Router>> {
        self.table.load().http.get(listener).cloned()
    }

    /// The route served by a TCP or UDP listener.
    pub fn stream_route(&self, listener: &str) -> Option<Arc<RouteState>> {
        self.table.load().streams.get(listener).cloned()
    }

    pub fn tcp(&self) -> &TcpDispatcher {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpDispatcher {
        &self.udp
    }

    pub fn http(&self) -> &HttpDispatcher {
        &self.http
    }

    pub fn monitor(&self) -> &Arc<ActiveHealthMonitor> {
        &self.monitor
    }

    pub fn resolvers(&self) -> &Arc<DestinationResolverManager> {
        &self.resolvers
    }
}
