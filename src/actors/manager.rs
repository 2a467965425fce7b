//! ManagerActor - registry of client actors and entry point of the hub
//!
//! The manager owns the active configuration and one [`ClientHandle`] per
//! target. It talks to clients only through sessions
//! ([`Actor::call`]), so its own queue keeps running while a client works.
//!
//! ## Message Flow
//!
//! ```text
//! build(config) ──► per target: new client → build    ─┐
//!                              existing client → prepare ├─► all ok? ─► commit + register + free
//!                                                        └─► any err ─► close new, discard prepared
//!
//! agent websocket ──► bind_inbound_stream ──► client.register_connection
//! dashboard ──► query_variables / query_records ──► client lookups
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, parse_config};
use crate::error::{Error, Result};
use crate::filter::pipeline::RecordRow;
use crate::transport::FrameStream;

use super::broker::Actor;
use super::client::{ClientHandle, ClientServices};
use super::messages::VariableTier;

pub struct ManagerState {
    config: Arc<Config>,
    raw: String,
    staged: Option<String>,
    clients: BTreeMap<String, ClientHandle>,
    building: bool,
    /// Where accepted configs are persisted on reload
    config_path: Option<PathBuf>,
    services: ClientServices,
}

impl ManagerState {
    fn client(&self, target: &str) -> Result<ClientHandle> {
        self.clients
            .get(target)
            .cloned()
            .ok_or_else(|| Error::TargetNotFound(target.to_string()))
    }

    /// Ids of open targets with a live client, sorted descending
    fn open_targets(&self) -> Vec<String> {
        self.clients
            .keys()
            .rev()
            .filter(|id| {
                self.config
                    .target(id)
                    .map(|target| target.open)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// Handle to the manager actor
#[derive(Clone, Debug)]
pub struct ManagerHandle {
    actor: Actor<ManagerState>,
}

impl ManagerHandle {
    /// Spawn a manager with an empty configuration. `config_path` is where
    /// [`reload`](Self::reload) persists accepted configs.
    pub fn spawn(services: ClientServices, config_path: Option<PathBuf>) -> Self {
        let state = ManagerState {
            config: Arc::new(Config::default()),
            raw: String::new(),
            staged: None,
            clients: BTreeMap::new(),
            building: false,
            config_path,
            services,
        };
        Self {
            actor: Actor::spawn("manager", state),
        }
    }

    pub fn close(&self) {
        self.actor.close();
    }

    /// Apply `config` (with its raw text) to every target, all or nothing
    pub async fn build(&self, config: Config, raw: String) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        let manager = self.actor.clone();
        // completes even if the caller is dropped
        self.actor.spawn_flow(async move {
            let _ = respond_to.send(build(manager, Arc::new(config), raw).await);
        });
        response
            .await
            .unwrap_or_else(|_| Err(Error::ActorClosed(self.actor.name().to_string())))
    }

    /// Store `raw` as the candidate for the next [`reload`](Self::reload)
    pub async fn stage(&self, raw: String) -> Result<()> {
        self.actor
            .run_sync(move |state, _| {
                state.staged = Some(raw);
                Ok(())
            })
            .await
    }

    /// Validate and apply the staged config, then persist its exact text
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<()> {
        let (raw, services, path) = self
            .actor
            .run_sync(|state, _| {
                let raw = state.staged.clone().ok_or(Error::NothingStaged)?;
                Ok((raw, state.services.clone(), state.config_path.clone()))
            })
            .await?;

        let config = parse_config(&raw)?;
        config.validate(services.loader.as_ref())?;
        self.build(config, raw.clone()).await?;

        if let Some(path) = path {
            tokio::fs::write(&path, raw.as_bytes()).await?;
            info!("persisted reloaded config to {}", path.display());
        }
        Ok(())
    }

    /// Raw text of the active config
    pub async fn config_text(&self) -> Result<String> {
        self.actor.run_sync(|state, _| Ok(state.raw.clone())).await
    }

    pub async fn config(&self) -> Result<Arc<Config>> {
        self.actor.run_sync(|state, _| Ok(state.config.clone())).await
    }

    /// Ids of the targets that currently have a client
    pub async fn client_ids(&self) -> Result<Vec<String>> {
        self.actor
            .run_sync(|state, _| Ok(state.clients.keys().cloned().collect()))
            .await
    }

    pub async fn client(&self, target: &str) -> Result<ClientHandle> {
        let target = target.to_string();
        self.actor.run_sync(move |state, _| state.client(&target)).await
    }

    /// Hand an agent's stream to the client of `target`. The stream is
    /// closed on any failure.
    #[instrument(skip(self, stream), fields(peer = %stream.peer()))]
    pub async fn bind_inbound_stream(
        &self,
        target: &str,
        file: &str,
        mut stream: Box<dyn FrameStream>,
    ) -> Result<()> {
        let lookup = target.to_string();
        let client = match self.actor.run_sync(move |state, _| state.client(&lookup)).await {
            Ok(client) => client,
            Err(e) => {
                warn!("rejecting agent stream: {e}");
                stream.close().await;
                return Err(e);
            }
        };

        let filename = file.to_string();
        let registration = self
            .actor
            .call(client.actor(), move |state, actor| {
                Ok(state.register_connection(actor, &filename))
            })
            .await;

        match registration {
            Ok(registration) => {
                client.start_receiving(file, registration, stream);
                debug!("bound agent stream");
                Ok(())
            }
            Err(e) => {
                warn!("failed to bind agent stream: {e}");
                stream.close().await;
                Err(e)
            }
        }
    }

    /// Names for the dashboard variable `tier`
    pub async fn query_variables(
        &self,
        tier: VariableTier,
        target: &str,
        filter: &str,
    ) -> Result<Vec<String>> {
        match tier {
            VariableTier::Target => {
                self.actor
                    .run_sync(|state, _| Ok(state.open_targets()))
                    .await
            }
            VariableTier::Filter => {
                let client = self.client(target).await?;
                self.actor
                    .call(client.actor(), |state, _| Ok(state.filter_ids()))
                    .await
            }
            VariableTier::SubFilter => {
                let client = self.client(target).await?;
                let filter = filter.to_string();
                self.actor
                    .call(client.actor(), move |state, _| state.sub_filter_ids(&filter))
                    .await
            }
            VariableTier::Unknown => Ok(Vec::new()),
        }
    }

    /// Aggregate row plus history of one sub filter, most recent first
    pub async fn query_records(
        &self,
        target: &str,
        filter: &str,
        sub_filter: &str,
    ) -> Result<Vec<RecordRow>> {
        let client = self.client(target).await?;
        let (filter, sub_filter) = (filter.to_string(), sub_filter.to_string());
        self.actor
            .call(client.actor(), move |state, _| {
                state.records(&filter, &sub_filter)
            })
            .await
    }
}

#[instrument(skip_all)]
async fn build(manager: Actor<ManagerState>, config: Arc<Config>, raw: String) -> Result<()> {
    let (existing, services) = manager
        .run_sync(|state, _| {
            if state.building {
                return Err(Error::ReloadInProgress);
            }
            state.building = true;
            Ok((state.clients.clone(), state.services.clone()))
        })
        .await?;

    let mut created = Vec::new();
    let mut prepared = Vec::new();
    let outcome = build_targets(
        &manager,
        &config,
        &existing,
        &services,
        &mut created,
        &mut prepared,
    )
    .await;

    if let Err(e) = outcome {
        error!("build failed: {e}");
        for client in &created {
            client.close();
        }
        for client in &prepared {
            client.actor().run_async(
                |state, _| {
                    state.discard();
                    Ok(())
                },
                None,
            );
        }
        let _ = manager
            .run_sync(|state, _| {
                state.building = false;
                Ok(())
            })
            .await;
        return Err(e);
    }

    for client in &prepared {
        if let Err(e) = manager.call(client.actor(), |state, _| state.commit()).await {
            error!(client = %client.id(), "commit failed: {e}");
        }
    }

    manager
        .run_sync(move |state, _| {
            for client in created {
                debug!(client = %client.id(), "registering client");
                client.activate();
                state.clients.insert(client.id().to_string(), client);
            }
            state.clients.retain(|id, client| {
                let keep = config.target(id).is_some();
                if !keep {
                    debug!(client = %id, "freeing client");
                    client.close();
                }
                keep
            });
            state.config = config;
            state.raw = raw;
            state.building = false;
            Ok(())
        })
        .await
}

async fn build_targets(
    manager: &Actor<ManagerState>,
    config: &Arc<Config>,
    existing: &BTreeMap<String, ClientHandle>,
    services: &ClientServices,
    created: &mut Vec<ClientHandle>,
    prepared: &mut Vec<ClientHandle>,
) -> Result<()> {
    for target in &config.targets {
        let candidate = config.clone();
        match existing.get(&target.id) {
            Some(client) => {
                debug!(client = %target.id, "preparing client");
                manager
                    .call(client.actor(), move |state, _| state.prepare(candidate))
                    .await?;
                prepared.push(client.clone());
            }
            None => {
                debug!(client = %target.id, "creating client");
                let client = ClientHandle::spawn_with_token(
                    &target.id,
                    config.clone(),
                    services.clone(),
                    manager.token().child_token(),
                );
                created.push(client.clone());
                manager
                    .call(client.actor(), move |state, _| state.build(candidate))
                    .await?;
            }
        }
    }
    Ok(())
}
