//! Requests and the factory that builds them.
//!
//! A request is an opaque unit of work: a function from "an available
//! engine connection" to side effects via continuations, plus a retry
//! counter. Both request kinds follow the same streaming contract: for
//! every received message the progress hook runs, then the caller's
//! consumer; on stream error the connection is returned to the pool before
//! the caller's error consumer runs; on stream completion the connection
//! is returned to the pool.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tonic::codec::Streaming;
use tonic::{Code, Response, Status};
use uuid::Uuid;

use crate::connection::EngineConnection;
use crate::error::EngineError;
use crate::pool::EnginePool;
use crate::state::Decision;
use crate::transport::{components_info, proto, ComponentRepository};

/// Shared failure continuation, invocable from any RPC callback task.
pub type ErrorConsumer = Arc<dyn Fn(EngineError) + Send + Sync>;

/// Observes a request binding to and releasing its connection.
///
/// Handlers use this to track which connections they currently have in
/// flight, so they can close them all at shutdown.
pub trait ConnectionObserver: Send + Sync {
    /// The request was dispatched on `connection`.
    fn connection_bound(&self, connection: &Arc<EngineConnection>);
    /// The request's stream finished and `connection` went back to the pool.
    fn connection_released(&self, connection: &Arc<EngineConnection>);
}

/// Connections a handler currently has in flight, updated through the
/// [`ConnectionObserver`] hooks.
#[derive(Default)]
pub(crate) struct TrackedConnections {
    open: std::sync::Mutex<Vec<Arc<EngineConnection>>>,
}

impl TrackedConnections {
    /// Takes every tracked connection, leaving the list empty.
    pub(crate) fn drain(&self) -> Vec<Arc<EngineConnection>> {
        let mut open = self.open.lock().expect("tracked lock poisoned");
        open.drain(..).collect()
    }
}

impl ConnectionObserver for TrackedConnections {
    fn connection_bound(&self, connection: &Arc<EngineConnection>) {
        self.open
            .lock()
            .expect("tracked lock poisoned")
            .push(Arc::clone(connection));
    }

    fn connection_released(&self, connection: &Arc<EngineConnection>) {
        self.open
            .lock()
            .expect("tracked lock poisoned")
            .retain(|open| !Arc::ptr_eq(open, connection));
    }
}

/// A queued unit of work for one engine.
///
/// Consumed exactly once by the dispatch loop; a request that found no
/// connection is re-enqueued whole, so the retry counter survives.
pub struct EngineRequest {
    tries: u32,
    action: Box<dyn FnOnce(Arc<EngineConnection>) + Send>,
    on_unserviceable: Box<dyn FnOnce(EngineError) + Send>,
}

impl EngineRequest {
    /// Wraps a unit of work plus the continuation the pool invokes when it
    /// gives up on finding a connection.
    pub fn new(
        action: impl FnOnce(Arc<EngineConnection>) + Send + 'static,
        on_unserviceable: impl FnOnce(EngineError) + Send + 'static,
    ) -> Self {
        Self {
            tries: 0,
            action: Box::new(action),
            on_unserviceable: Box::new(on_unserviceable),
        }
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.tries += 1;
    }

    pub(crate) const fn tries(&self) -> u32 {
        self.tries
    }

    /// Binds the request to `connection` for the duration of this attempt.
    pub(crate) fn execute(self, connection: Arc<EngineConnection>) {
        (self.action)(connection);
    }

    pub(crate) fn reject(self, error: EngineError) {
        (self.on_unserviceable)(error);
    }
}

impl fmt::Debug for EngineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRequest").field("tries", &self.tries).finish()
    }
}

/// Builds the two concrete request kinds the system needs.
#[derive(Clone)]
pub struct RequestFactory {
    user_id: String,
    repository: Arc<dyn ComponentRepository>,
}

impl RequestFactory {
    /// A factory serializing the given repository's components into every
    /// request it builds.
    pub fn new(user_id: impl Into<String>, repository: Arc<dyn ComponentRepository>) -> Self {
        Self {
            user_id: user_id.into(),
            repository,
        }
    }

    /// Streamed verification call for one query.
    ///
    /// Attaches a fresh correlation id, disables clock reduction and
    /// snapshots the current components.
    pub fn verification_request(
        &self,
        pool: &Arc<EnginePool>,
        query_line: String,
        observer: Arc<dyn ConnectionObserver>,
        on_progress: impl FnMut() + Send + 'static,
        on_message: impl FnMut(proto::QueryResponse) + Send + 'static,
        on_error: ErrorConsumer,
    ) -> EngineRequest {
        let request = proto::QueryRequest {
            user_id: self.user_id.clone(),
            query_id: Uuid::new_v4().to_string(),
            settings: Some(proto::QuerySettings {
                disable_clock_reduction: true,
            }),
            query: query_line,
            components_info: Some(components_info(&self.repository.components())),
        };

        let pool = Arc::clone(pool);
        let reject = Arc::clone(&on_error);
        EngineRequest::new(
            move |connection| {
                observer.connection_bound(&connection);
                tokio::spawn(async move {
                    let engine = connection.config().name.clone();
                    let deadline = pool.settings().response_deadline;
                    let result = match connection.client() {
                        Ok(mut client) => {
                            let mut call = tonic::Request::new(request);
                            call.set_timeout(deadline);
                            drain_stream(engine, deadline, client.send_query(call), on_progress, on_message)
                                .await
                        }
                        Err(error) => Err(error),
                    };
                    pool.set_connection_available(&connection);
                    observer.connection_released(&connection);
                    if let Err(error) = result {
                        on_error(error);
                    }
                });
            },
            move |error| reject(error),
        )
    }

    /// Streamed simulation call.
    ///
    /// An initial decision starts a new run from the composition; any other
    /// decision replays its raw payload as a step.
    pub fn simulation_request(
        &self,
        pool: &Arc<EnginePool>,
        composition: &str,
        decision: &Decision,
        observer: Arc<dyn ConnectionObserver>,
        on_progress: impl FnMut() + Send + 'static,
        on_message: impl FnMut(proto::SimulationStepResponse) + Send + 'static,
        on_error: ErrorConsumer,
    ) -> EngineRequest {
        let simulation_info = proto::SimulationInfo {
            component_composition: composition.to_string(),
            components_info: Some(components_info(&self.repository.components())),
        };
        let chosen = decision.raw().cloned();

        let pool = Arc::clone(pool);
        let reject = Arc::clone(&on_error);
        EngineRequest::new(
            move |connection| {
                observer.connection_bound(&connection);
                tokio::spawn(async move {
                    let engine = connection.config().name.clone();
                    let deadline = pool.settings().response_deadline;
                    let result = match connection.client() {
                        Ok(mut client) => match chosen {
                            None => {
                                let mut call = tonic::Request::new(proto::SimulationStartRequest {
                                    simulation_info: Some(simulation_info),
                                });
                                call.set_timeout(deadline);
                                drain_stream(
                                    engine,
                                    deadline,
                                    client.start_simulation(call),
                                    on_progress,
                                    on_message,
                                )
                                .await
                            }
                            Some(chosen_decision) => {
                                let mut call = tonic::Request::new(proto::SimulationStepRequest {
                                    simulation_info: Some(simulation_info),
                                    chosen_decision: Some(chosen_decision),
                                });
                                call.set_timeout(deadline);
                                drain_stream(
                                    engine,
                                    deadline,
                                    client.take_simulation_step(call),
                                    on_progress,
                                    on_message,
                                )
                                .await
                            }
                        },
                        Err(error) => Err(error),
                    };
                    pool.set_connection_available(&connection);
                    observer.connection_released(&connection);
                    if let Err(error) = result {
                        on_error(error);
                    }
                });
            },
            move |error| reject(error),
        )
    }
}

/// Drives one server stream to completion under the response deadline.
async fn drain_stream<T>(
    engine: String,
    deadline: Duration,
    call: impl Future<Output = Result<Response<Streaming<T>>, Status>>,
    mut on_progress: impl FnMut(),
    mut on_message: impl FnMut(T),
) -> Result<(), EngineError> {
    let drained = tokio::time::timeout(deadline, async {
        let mut stream = call
            .await
            .map_err(|status| classify_status(&engine, &status))?
            .into_inner();
        while let Some(message) = stream
            .message()
            .await
            .map_err(|status| classify_status(&engine, &status))?
        {
            on_progress();
            on_message(message);
        }
        Ok(())
    })
    .await;

    drained.unwrap_or(Err(EngineError::Timeout { engine }))
}

/// Maps an RPC status to the engine error taxonomy: deadline expiry is a
/// timeout, everything else a protocol failure carrying the message.
fn classify_status(engine: &str, status: &Status) -> EngineError {
    match status.code() {
        Code::DeadlineExceeded => EngineError::Timeout {
            engine: engine.to_string(),
        },
        _ => EngineError::Protocol {
            message: status.message().to_string(),
        },
    }
}
