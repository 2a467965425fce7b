//! ClientActor - owns the filter pipelines and agents of one target
//!
//! Every monitored target gets one client actor. All of its state (pipelines,
//! per-file agent slots, the config snapshot) lives in [`ClientState`] and is
//! only touched by jobs on the client's own queue.
//!
//! ## Message Flow
//!
//! ```text
//! monitor tick ──► reconcile ──► provision flow ──(agent connects)──┐
//!                                                                   │
//! manager ──► register_connection ──► receive loop ◄────────────────┘
//!                                          │
//!                                          └──► evaluate_batch job ──► pipelines
//! dashboard ──► filter_ids / sub_filter_ids / records
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::pipeline::{self, PipelineBlueprint, Pipelines, RecordRow};
use crate::filter::script::ScriptLoader;
use crate::ssh::SshConnector;
use crate::transport::{FrameStream, decode_batch};

use super::broker::Actor;
use super::supervisor::{AgentPhase, AgentSlot, ProvisionRequest, Registration, provision};

/// Inbound streams that stay silent this long are dropped
pub const READ_DEADLINE: Duration = Duration::from_secs(10);

/// External capabilities shared by every client
#[derive(Clone)]
pub struct ClientServices {
    pub loader: Arc<dyn ScriptLoader>,
    pub connector: Arc<dyn SshConnector>,
}

pub struct ClientState {
    id: String,
    config: Arc<Config>,
    pipelines: Pipelines,
    prepared: Option<(Arc<Config>, Vec<PipelineBlueprint>)>,
    slots: BTreeMap<String, AgentSlot>,
    next_registration: u64,
    services: ClientServices,
}

impl ClientState {
    pub fn new(id: impl Into<String>, config: Arc<Config>, services: ClientServices) -> Self {
        Self {
            id: id.into(),
            config,
            pipelines: Pipelines::new(),
            prepared: None,
            slots: BTreeMap::new(),
            next_registration: 0,
            services,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Initial build of the pipelines from `config`
    pub fn build(&mut self, config: Arc<Config>) -> Result<()> {
        self.reload(config)
    }

    /// Load every script `config` needs for this target without touching
    /// the live pipelines
    pub fn prepare(&mut self, config: Arc<Config>) -> Result<()> {
        let blueprints = pipeline::prepare(&config, &self.id, self.services.loader.as_ref())
            .inspect_err(|e| warn!(client = %self.id, "failed to prepare pipelines: {e}"))?;
        self.prepared = Some((config, blueprints));
        Ok(())
    }

    /// Swap the prepared pipelines in, carrying history across
    pub fn commit(&mut self) -> Result<()> {
        let (config, blueprints) = self
            .prepared
            .take()
            .ok_or_else(|| Error::NothingPrepared(self.id.clone()))?;

        let previous = std::mem::take(&mut self.pipelines);
        self.pipelines = pipeline::assemble(blueprints, previous);
        self.config = config;
        self.release_forbidden_slots();

        debug!(client = %self.id, "committed {} pipelines", self.pipelines.len());
        Ok(())
    }

    /// Drop the prepared pipelines, if any
    pub fn discard(&mut self) {
        if self.prepared.take().is_some() {
            trace!(client = %self.id, "discarded prepared pipelines");
        }
    }

    pub fn reload(&mut self, config: Arc<Config>) -> Result<()> {
        self.prepare(config)?;
        self.commit()
    }

    /// Cancel agents whose target is gone or closed, or whose file entry no
    /// longer exists
    fn release_forbidden_slots(&mut self) {
        let target = self.config.target(&self.id);
        let open = target.map(|target| target.open).unwrap_or(false);

        self.slots.retain(|name, slot| {
            let known = target
                .map(|target| target.files.iter().any(|file| &file.name == name))
                .unwrap_or(false);
            if !open || !known {
                if slot.phase() != AgentPhase::Absent {
                    debug!("releasing agent for file {name}");
                }
                slot.reset();
            }
            known
        });
    }

    fn registration(&mut self, actor: &Actor<Self>) -> Registration {
        self.next_registration += 1;
        Registration {
            id: self.next_registration,
            token: actor.token().child_token(),
        }
    }

    /// Make a fresh connection the only one for `filename`
    pub fn register_connection(&mut self, actor: &Actor<Self>, filename: &str) -> Registration {
        let registration = self.registration(actor);
        self.slots
            .entry(filename.to_string())
            .or_default()
            .connect(registration.clone());
        debug!(client = %self.id, "registered connection {} for {filename}", registration.id);
        registration
    }

    fn connection_closed(&mut self, filename: &str, id: u64) {
        if let Some(slot) = self.slots.get_mut(filename)
            && slot.disconnect(id)
        {
            debug!(client = %self.id, "connection {id} for {filename} cleared");
        }
    }

    fn provision_finished(&mut self, filename: &str, id: u64) {
        if let Some(slot) = self.slots.get_mut(filename)
            && slot.end_provision(id)
        {
            trace!(client = %self.id, "provisioning {id} for {filename} finished");
        }
    }

    /// Start provisioning every file of the open target that has no agent.
    /// Returns the delay until the next pass.
    fn reconcile(&mut self, actor: &Actor<Self>) -> Duration {
        let config = self.config.clone();
        let interval = config.monitor_interval();

        let Some(target) = config.target(&self.id) else {
            warn!(client = %self.id, "monitor found no config for its target");
            return interval;
        };
        if !target.open {
            return interval;
        }

        for file in &target.files {
            let phase = self
                .slots
                .get(&file.name)
                .map(AgentSlot::phase)
                .unwrap_or(AgentPhase::Absent);
            if phase != AgentPhase::Absent {
                continue;
            }

            let registration = self.registration(actor);
            self.slots
                .entry(file.name.clone())
                .or_default()
                .begin_provision(registration.clone());

            let request = ProvisionRequest::new(&config, &self.id, file);
            let connector = self.services.connector.clone();
            let flow_actor = actor.clone();
            debug!(client = %self.id, "provisioning agent for {}", file.name);
            actor.spawn_flow(async move {
                let filename = request.file.name.clone();
                let Registration { id, token } = registration;
                if let Err(e) = provision(request, connector, token).await {
                    warn!(client = %flow_actor.name(), "provisioning {filename} failed: {e:#}");
                }
                flow_actor.run_async(
                    move |state: &mut ClientState, _: &Actor<ClientState>| {
                        state.provision_finished(&filename, id);
                        Ok(())
                    },
                    None,
                );
            });
        }

        interval
    }

    /// Run `line` through every pipeline
    pub fn evaluate(&mut self, filename: &str, line: &str) {
        if line.is_empty() {
            return;
        }
        for pipeline in self.pipelines.values_mut() {
            pipeline.evaluate(filename, line);
        }
    }

    pub fn evaluate_batch(&mut self, filename: &str, lines: &[String]) {
        for line in lines {
            self.evaluate(filename, line);
        }
    }

    /// Filter ids, sorted descending
    pub fn filter_ids(&self) -> Vec<String> {
        self.pipelines.keys().rev().cloned().collect()
    }

    /// Sub filter ids of `filter`, in declaration order
    pub fn sub_filter_ids(&self, filter: &str) -> Result<Vec<String>> {
        let pipeline = self.pipeline(filter)?;
        Ok(pipeline
            .sub_filters()
            .iter()
            .map(|sub| sub.id().to_string())
            .collect())
    }

    pub fn records(&self, filter: &str, sub_filter: &str) -> Result<Vec<RecordRow>> {
        let sub = self
            .pipeline(filter)?
            .sub_filter(sub_filter)
            .ok_or_else(|| Error::SubFilterNotFound {
                target: self.id.clone(),
                filter: filter.to_string(),
                sub_filter: sub_filter.to_string(),
            })?;
        Ok(sub.records())
    }

    /// Lifecycle phase of every configured file
    pub fn agent_phases(&self) -> BTreeMap<String, AgentPhase> {
        self.config
            .target(&self.id)
            .map(|target| {
                target
                    .files
                    .iter()
                    .map(|file| {
                        let phase = self
                            .slots
                            .get(&file.name)
                            .map(AgentSlot::phase)
                            .unwrap_or(AgentPhase::Absent);
                        (file.name.clone(), phase)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    fn pipeline(&self, filter: &str) -> Result<&pipeline::FilterPipeline> {
        self.pipelines
            .get(filter)
            .ok_or_else(|| Error::FilterNotFound {
                target: self.id.clone(),
                filter: filter.to_string(),
            })
    }
}

/// Handle to a client actor
#[derive(Clone, Debug)]
pub struct ClientHandle {
    id: String,
    actor: Actor<ClientState>,
}

impl ClientHandle {
    /// Spawn a client for target `id`. Nothing is built or monitored until
    /// [`build`](Self::build) and [`activate`](Self::activate) run.
    pub fn spawn(id: &str, config: Arc<Config>, services: ClientServices) -> Self {
        Self::spawn_with_token(id, config, services, Default::default())
    }

    pub fn spawn_with_token(
        id: &str,
        config: Arc<Config>,
        services: ClientServices,
        token: tokio_util::sync::CancellationToken,
    ) -> Self {
        let state = ClientState::new(id, config, services);
        Self {
            id: id.to_string(),
            actor: Actor::spawn_with_token(format!("client:{id}"), state, token),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn actor(&self) -> &Actor<ClientState> {
        &self.actor
    }

    pub fn is_closed(&self) -> bool {
        self.actor.is_closed()
    }

    pub fn close(&self) {
        debug!(client = %self.id, "closing client");
        self.actor.close();
    }

    /// Start the monitor loop
    pub fn activate(&self) {
        self.actor.spawn_flow(monitor(self.actor.clone()));
    }

    pub async fn build(&self, config: Arc<Config>) -> Result<()> {
        self.actor
            .run_sync(move |state, _| state.build(config))
            .await
    }

    pub async fn reload(&self, config: Arc<Config>) -> Result<()> {
        self.actor
            .run_sync(move |state, _| state.reload(config))
            .await
    }

    /// Bind `stream` as the connection of `filename`, replacing any previous
    /// one. The stream is closed if the client cannot take it.
    pub async fn bind(&self, filename: &str, mut stream: Box<dyn FrameStream>) -> Result<()> {
        let file = filename.to_string();
        let registration = self
            .actor
            .run_sync(move |state, actor| Ok(state.register_connection(actor, &file)))
            .await;

        match registration {
            Ok(registration) => {
                self.start_receiving(filename, registration, stream);
                Ok(())
            }
            Err(e) => {
                stream.close().await;
                Err(e)
            }
        }
    }

    /// Spawn the receive loop of a registered connection
    pub fn start_receiving(
        &self,
        filename: &str,
        registration: Registration,
        stream: Box<dyn FrameStream>,
    ) {
        self.actor.spawn_flow(receive_loop(
            self.actor.clone(),
            filename.to_string(),
            registration,
            stream,
        ));
    }

    pub async fn filter_ids(&self) -> Result<Vec<String>> {
        self.actor.run_sync(|state, _| Ok(state.filter_ids())).await
    }

    pub async fn sub_filter_ids(&self, filter: &str) -> Result<Vec<String>> {
        let filter = filter.to_string();
        self.actor
            .run_sync(move |state, _| state.sub_filter_ids(&filter))
            .await
    }

    pub async fn records(&self, filter: &str, sub_filter: &str) -> Result<Vec<RecordRow>> {
        let (filter, sub_filter) = (filter.to_string(), sub_filter.to_string());
        self.actor
            .run_sync(move |state, _| state.records(&filter, &sub_filter))
            .await
    }

    pub async fn agent_phases(&self) -> Result<BTreeMap<String, AgentPhase>> {
        self.actor.run_sync(|state, _| Ok(state.agent_phases())).await
    }
}

#[instrument(skip_all, fields(client = %actor.name()))]
async fn monitor(actor: Actor<ClientState>) {
    debug!("starting monitor");

    loop {
        let interval = match actor
            .run_sync(|state, actor| Ok(state.reconcile(actor)))
            .await
        {
            Ok(interval) => interval,
            Err(e) => {
                debug!("monitor stopped: {e}");
                break;
            }
        };
        tokio::time::sleep(interval).await;
    }
}

#[instrument(skip_all, fields(client = %actor.name(), file = %filename, connection = registration.id))]
async fn receive_loop(
    actor: Actor<ClientState>,
    filename: String,
    registration: Registration,
    mut stream: Box<dyn FrameStream>,
) {
    let peer = stream.peer();
    debug!("starting receive loop for {peer}");

    loop {
        let frame = tokio::select! {
            _ = registration.token.cancelled() => {
                debug!("connection cancelled");
                break;
            }
            frame = timeout(READ_DEADLINE, stream.recv_frame()) => frame,
        };

        let frame = match frame {
            Err(_) => {
                debug!("no frame within {READ_DEADLINE:?}");
                break;
            }
            Ok(None) => {
                debug!("stream closed by {peer}");
                break;
            }
            Ok(Some(Err(e))) => {
                debug!("read failed: {e}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let lines = match decode_batch(&frame) {
            Ok(lines) => lines,
            Err(e) => {
                debug!("undecodable frame: {e}");
                break;
            }
        };
        trace!("received {} lines", lines.len());

        let file = filename.clone();
        actor.run_async(
            move |state: &mut ClientState, _: &Actor<ClientState>| {
                state.evaluate_batch(&file, &lines);
                Ok(())
            },
            None,
        );
    }

    stream.close().await;
    let id = registration.id;
    actor.run_async(
        move |state: &mut ClientState, _: &Actor<ClientState>| {
            state.connection_closed(&filename, id);
            Ok(())
        },
        None,
    );
    debug!("receive loop finished");
}
