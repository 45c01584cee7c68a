//! Interactive step-wise simulation of a composed system.
//!
//! A handler owns one simulation run: it issues the initial request,
//! tracks the current state, and replays a chosen decision back to the
//! engine to advance.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::connection::EngineConnection;
use crate::error::{EngineError, EngineResult};
use crate::pool::EnginePool;
use crate::request::{ConnectionObserver, ErrorConsumer, RequestFactory, TrackedConnections};
use crate::state::{create_initial_state, create_state, Decision, State};

/// Owns the lifecycle of one simulation run.
pub struct SimulationHandler {
    composition: String,
    pool: Arc<EnginePool>,
    factory: RequestFactory,
    tracked: Arc<TrackedConnections>,
    current: Arc<Mutex<Option<State>>>,
    on_state: Arc<dyn Fn(State) + Send + Sync>,
    on_failure: ErrorConsumer,
}

impl SimulationHandler {
    /// A handler simulating `composition` on the given engine pool.
    ///
    /// `on_state` receives each newly decoded state; `on_failure`
    /// receives stream-level failures. Both may be called from RPC
    /// callback tasks.
    pub fn new(
        pool: Arc<EnginePool>,
        factory: RequestFactory,
        composition: impl Into<String>,
        on_state: impl Fn(State) + Send + Sync + 'static,
        on_failure: impl Fn(EngineError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            composition: composition.into(),
            pool,
            factory,
            tracked: Arc::new(TrackedConnections::default()),
            current: Arc::new(Mutex::new(None)),
            on_state: Arc::new(on_state),
            on_failure: Arc::new(on_failure),
        }
    }

    /// Composition string under simulation.
    #[must_use]
    pub fn composition(&self) -> &str {
        &self.composition
    }

    /// State decoded from the engine's last response, if any.
    #[must_use]
    pub fn current_state(&self) -> Option<State> {
        self.current.lock().expect("state lock poisoned").clone()
    }

    /// Starts a fresh run from the composition's initial state.
    pub fn start(&self) -> EngineResult<()> {
        self.dispatch(Decision::initial(self.composition.clone()))
    }

    /// Advances the simulation by replaying `decision` to the engine.
    pub fn step(&self, decision: &Decision) -> EngineResult<()> {
        self.dispatch(decision.clone())
    }

    fn dispatch(&self, decision: Decision) -> EngineResult<()> {
        let initial = decision.is_initial();
        let composition = self.composition.clone();
        let current = Arc::clone(&self.current);
        let on_state = Arc::clone(&self.on_state);
        let observer: Arc<dyn ConnectionObserver> = self.tracked.clone();

        let request = self.factory.simulation_request(
            &self.pool,
            &self.composition,
            &decision,
            observer,
            || {},
            move |response| {
                let state = if initial {
                    create_initial_state(&composition, &response)
                } else {
                    create_state(&composition, &response)
                };
                *current.lock().expect("state lock poisoned") = Some(state.clone());
                on_state(state);
            },
            Arc::clone(&self.on_failure),
        );
        self.pool.enqueue(request)
    }

    /// Closes every connection this handler currently tracks.
    pub async fn close_all_engine_connections(&self) -> Vec<EngineError> {
        let connections: Vec<Arc<EngineConnection>> = self.tracked.drain();

        let mut failures = Vec::new();
        for connection in connections {
            if let Err(error) = connection.close().await {
                failures.push(error);
            }
        }
        failures
    }
}

impl fmt::Debug for SimulationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationHandler")
            .field("composition", &self.composition)
            .finish_non_exhaustive()
    }
}
