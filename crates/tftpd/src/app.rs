//! The supervisor: provisions every configured server, runs them
//! concurrently, and stops them together.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::{Id, JoinSet};
use tracing::{error, info};

use crate::address::NetworkAddress;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::instance::ServerInstance;

/// All server instances of one configuration.
///
/// An app runs at most once: after [`App::stop`] the instances cannot be
/// restarted, and a new app has to be provisioned.
pub struct App {
    instances: Vec<ServerInstance>,
    group: Option<ServeGroup>,
    stopped: bool,
}

impl App {
    /// Build every instance described by `config`.
    ///
    /// Nothing is bound. Fails if any entry is invalid or if two instances
    /// would listen on the same address; no instances are kept in that case.
    pub fn provision(config: &AppConfig) -> Result<Self> {
        let mut instances = Vec::new();
        let mut listeners: Vec<(NetworkAddress, String)> = Vec::new();

        for (name, server) in &config.servers {
            for instance in ServerInstance::provision(name, server)? {
                // Port 0 picks a fresh port at bind time, so it never collides.
                if !instance.address().is_ephemeral() {
                    let address = instance.address();
                    if let Some((_, first)) = listeners.iter().find(|(taken, _)| taken.overlaps(address)) {
                        return Err(Error::DuplicateListener {
                            address: address.to_string(),
                            first: first.clone(),
                            second: name.clone(),
                        });
                    }
                    listeners.push((address.clone(), name.clone()));
                }
                instances.push(instance);
            }
        }

        info!("Provisioned {} tftp server instance(s)", instances.len());
        Ok(Self {
            instances,
            group: None,
            stopped: false,
        })
    }

    pub fn instances(&self) -> &[ServerInstance] {
        &self.instances
    }

    pub fn is_running(&self) -> bool {
        self.group.is_some()
    }

    /// Bind every listener, then start one serving task per instance.
    ///
    /// All listeners are bound before any task is spawned, so a bind failure
    /// leaves nothing running. Fails once the app has been stopped.
    pub async fn start(&mut self) -> Result<()> {
        if self.group.is_some() {
            return Err(Error::AlreadyStarted);
        }
        if self.stopped {
            return Err(Error::Stopped);
        }

        let mut sockets = Vec::with_capacity(self.instances.len());
        for instance in &self.instances {
            sockets.push(instance.bind().await?);
        }

        let mut group = ServeGroup::default();
        for (instance, socket) in self.instances.iter_mut().zip(sockets) {
            let name = instance.name().to_string();
            group.spawn(name, instance.serve(socket));
        }
        self.group = Some(group);
        Ok(())
    }

    /// Signal every instance to stop, then wait for all serving tasks.
    ///
    /// Returns the first serving failure, if any. Stopping an app that was
    /// never started is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(group) = self.group.take() else {
            return Ok(());
        };
        self.stopped = true;

        for instance in &self.instances {
            instance.shutdown();
            info!(
                name = %instance.name(),
                address = %instance.address(),
                root = %instance.root().display(),
                "server stopped"
            );
        }

        group.wait().await
    }
}

/// Serving tasks started together and awaited together.
#[derive(Default)]
struct ServeGroup {
    tasks: JoinSet<anyhow::Result<()>>,
    names: HashMap<Id, String>,
}

impl ServeGroup {
    fn spawn<F>(&mut self, name: String, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.names.insert(handle.id(), name);
    }

    /// Wait for every task; the earliest failure to happen wins.
    async fn wait(mut self) -> Result<()> {
        let mut first = None;

        while let Some(joined) = self.tasks.join_next_with_id().await {
            let (id, reason) = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((id, Err(e))) => (id, format!("{:#}", e)),
                Err(e) => (e.id(), format!("task panicked: {}", e)),
            };
            let name = self.names.remove(&id).unwrap_or_default();
            error!("tftp server '{}' failed: {}", name, reason);

            if first.is_none() {
                first = Some(Error::Serve { name, reason });
            }
        }

        first.map_or(Ok(()), Err)
    }
}
