//! # Veribridge - Engine Connections for Timed-Automata Verification
//!
//! Veribridge is the engine-connection pool and request-dispatch pipeline
//! of a timed-automata verification workbench. It starts or locates
//! external verification engines, pools RPC connections to them, streams
//! verification and simulation requests under per-engine concurrency and
//! retry policy, and decodes streamed simulation responses into an
//! internal state/decision model.
//!
//! ## Core Concepts
//!
//! - **Engine**: an external verification process or remote service
//! - **EngineConnection**: one RPC channel (+ optional owned process)
//! - **EnginePool**: per-engine connections, queue and dispatch loop
//! - **Query**: a user-issued verification question with a lifecycle
//! - **State/Decision**: one simulation step and its candidate successors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use veribridge::{
//!     EngineConfig, EngineLocality, EngineRegistry, PoolSettings, Query, QueryHandler, QueryType,
//! };
//!
//! let registry = Arc::new(EngineRegistry::new(PoolSettings::default()));
//! registry.register(EngineConfig::new(
//!     "reverie",
//!     EngineLocality::Local { binary: "/opt/engines/reverie".into(), address: "127.0.0.1".into() },
//!     5000,
//!     5009,
//! ))?;
//!
//! let handler = QueryHandler::new(registry, "user-1", repository);
//! let query = Arc::new(Query::new(
//!     QueryType::Refinement,
//!     "Administration <= Spec",
//!     "reverie",
//!     |verdict| println!("refines: {verdict}"),
//!     |error| eprintln!("{error}"),
//! ));
//! handler.execute_query(&query)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod connection;
pub mod error;
pub mod state;

// Pooling and dispatch
pub mod pool;
pub mod registry;
pub mod request;
pub mod starter;

// Query and simulation lifecycles
pub mod query;
pub mod simulation;

// Wire surface
pub mod transport;

// Re-export primary types at crate root for convenience
pub use config::{EngineConfig, EngineLocality};
pub use connection::EngineConnection;
pub use error::{EngineError, EngineResult};
pub use pool::{EnginePool, PoolSettings};
pub use query::{Query, QueryDriver, QueryHandler, QueryState, QueryType};
pub use registry::EngineRegistry;
pub use request::{ConnectionObserver, EngineRequest, ErrorConsumer, RequestFactory};
pub use simulation::SimulationHandler;
pub use starter::{ConnectionStarter, EngineStarter};
pub use state::{create_initial_state, create_state, ClockConstraint, Comparator, Decision, State};
pub use transport::{components_info, ComponentRepository};
