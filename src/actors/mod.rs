//! Actor-based hub
//!
//! Every piece of mutable hub state is owned by an actor: one manager plus
//! one client per monitored target. Actors are built on the session broker in
//! [`broker`], which gives each of them a private job queue drained by a
//! single worker task.
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────┐
//!   HTTP / agents ──►│  ManagerActor   │ config, client registry
//!                    └────────┬────────┘
//!                             │ sessions (call / wait / wakeup)
//!                ┌────────────┼────────────┐
//!                │            │            │
//!        ┌───────▼───────┐    │    ┌───────▼───────┐
//!        │ ClientActor   │    │    │ ClientActor   │
//!        │ (target A)    │    │    │ (target N)    │
//!        └───────┬───────┘    │    └───────┬───────┘
//!                │ monitor / receive loops │
//!        ┌───────▼───────┐            ┌────▼──────────┐
//!        │ remote agents │    ...     │ remote agents │
//!        └───────────────┘            └───────────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Jobs**: closures queued with `run_async` / `run_sync`, run one at a time
//! 2. **Sessions**: an actor suspends a flow on another actor's job with `call`
//! 3. **Flows**: long running tasks (monitor, receive loops, provisioning)
//!    spawned on an actor and cancelled with it

pub mod broker;
pub mod client;
pub mod manager;
pub mod messages;
pub mod supervisor;

pub use broker::{Actor, SessionId};
pub use client::{ClientHandle, ClientServices, ClientState};
pub use manager::ManagerHandle;
pub use messages::VariableTier;
pub use supervisor::AgentPhase;
