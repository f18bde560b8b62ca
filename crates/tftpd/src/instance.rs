//! One named server bound to a single UDP port.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tftp::Server;
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::address::NetworkAddress;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::FileHandler;

/// Where an instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Built from configuration; nothing bound.
    Provisioned,
    /// Listener bound, accept loop not entered yet.
    Listening,
    Serving,
    /// The accept loop returned.
    Stopped,
}

/// A TFTP server for one root on one address.
///
/// A configured port range yields one instance per port.
pub struct ServerInstance {
    name: String,
    address: NetworkAddress,
    root: PathBuf,
    timeout: Duration,
    server: Arc<Server<FileHandler>>,
    state: Arc<watch::Sender<InstanceState>>,
    local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("root", &self.root)
            .field("timeout", &self.timeout)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl ServerInstance {
    /// Build the instances for one configuration entry. No sockets are opened.
    ///
    /// The root must be absolute and an existing directory; it is canonicalized
    /// here, once, and never re-resolved.
    pub fn provision(name: &str, config: &ServerConfig) -> Result<Vec<Self>> {
        if !config.root.is_absolute() {
            let err = io::Error::new(io::ErrorKind::InvalidInput, "root must be an absolute path");
            return Err(Error::invalid_root(name, &config.root, err));
        }
        let root = std::fs::canonicalize(&config.root).map_err(|e| Error::invalid_root(name, &config.root, e))?;
        if !root.is_dir() {
            let err = io::Error::new(io::ErrorKind::NotADirectory, "root is not a directory");
            return Err(Error::invalid_root(name, &config.root, err));
        }

        let address = NetworkAddress::parse(&config.listen)?;
        if !address.is_udp() {
            return Err(Error::UnsupportedNetwork {
                network: address.network,
            });
        }

        let timeout = config.timeout();
        Ok(address
            .expand()
            .map(|address| Self::new(name, address, root.clone(), timeout, config.logs))
            .collect())
    }

    fn new(name: &str, address: NetworkAddress, root: PathBuf, timeout: Duration, access_log: bool) -> Self {
        let mut server = Server::new(FileHandler::new(name, root.clone(), access_log));
        server.set_timeout(timeout);

        Self {
            name: name.to_string(),
            address,
            root,
            timeout,
            server: Arc::new(server),
            state: Arc::new(watch::Sender::new(InstanceState::Provisioned)),
            local_addr: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The bound socket address, once listening. Reports the real port when
    /// port 0 was configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    /// Open the listening socket for this instance's address.
    pub(crate) async fn bind(&self) -> Result<UdpSocket> {
        let address = self.address.to_string();
        let bind_err = |source: io::Error| Error::Bind {
            address: address.clone(),
            source,
        };
        let port = self.address.start_port;

        let socket = if self.address.host.is_empty() {
            let wildcard = SocketAddr::new(self.address.unspecified_ip(), port);
            let only_v6 = self.address.network == "udp6";
            match bind_socket(wildcard, Some(only_v6)) {
                Ok(socket) => socket,
                // Hosts without IPv6 still get a plain `udp` listener.
                Err(e) if self.address.network == "udp" && e.kind() != io::ErrorKind::AddrInUse => {
                    debug!("dual-stack bind on {} failed ({}), falling back to IPv4", wildcard, e);
                    bind_socket(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), None).map_err(bind_err)?
                }
                Err(e) => return Err(bind_err(e)),
            }
        } else {
            let candidates = lookup_host((self.address.host.as_str(), port))
                .await
                .map_err(bind_err)?;

            let mut last_err = None;
            let mut bound = None;
            for addr in candidates.filter(|addr| self.address.accepts(addr)) {
                match bind_socket(addr, Some(self.address.network == "udp6")) {
                    Ok(socket) => {
                        bound = Some(socket);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            match bound {
                Some(socket) => socket,
                None => {
                    let err = last_err.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address of the requested family")
                    });
                    return Err(bind_err(err));
                }
            }
        };

        UdpSocket::from_std(socket).map_err(bind_err)
    }

    /// Take ownership of a bound listener and return the serving loop.
    ///
    /// The returned future owns everything it needs and can be spawned.
    pub(crate) fn serve(&mut self, socket: UdpSocket) -> impl Future<Output = anyhow::Result<()>> + Send + 'static {
        self.local_addr = socket.local_addr().ok();
        self.state.send_replace(InstanceState::Listening);

        let server = Arc::clone(&self.server);
        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        let address = self
            .local_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.address.to_string());
        let root = self.root.clone();

        async move {
            state.send_replace(InstanceState::Serving);
            info!(name = %name, address = %address, root = %root.display(), "server running");
            let result = server.serve(socket).await;
            state.send_replace(InstanceState::Stopped);
            result
        }
    }

    /// Stop accepting requests. In-flight transfers run to completion.
    pub(crate) fn shutdown(&self) {
        self.server.shutdown();
    }
}

/// Bind a non-blocking UDP socket. `only_v6` is applied to IPv6 sockets when set.
fn bind_socket(addr: SocketAddr, only_v6: Option<bool>) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6()
        && let Some(only_v6) = only_v6
    {
        socket.set_only_v6(only_v6)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
