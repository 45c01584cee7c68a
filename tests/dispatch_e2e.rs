//! End-to-end dispatch tests against an in-process mock engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status};

use veribridge::transport::proto;
use veribridge::{
    ComponentRepository, EngineConfig, EngineLocality, EngineRegistry, PoolSettings, Query,
    QueryHandler, QueryState, QueryType,
};

use proto::verification_engine_server::{VerificationEngine, VerificationEngineServer};

/// Scriptable engine double: answers refinement queries after a fixed
/// delay and records what it saw.
#[derive(Clone, Default)]
struct MockEngine {
    refinement_success: bool,
    response_delay: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    queries: Arc<Mutex<Vec<proto::QueryRequest>>>,
}

#[tonic::async_trait]
impl VerificationEngine for MockEngine {
    type SendQueryStream = ReceiverStream<Result<proto::QueryResponse, Status>>;

    async fn send_query(
        &self,
        request: Request<proto::QueryRequest>,
    ) -> Result<Response<Self::SendQueryStream>, Status> {
        self.queries.lock().unwrap().push(request.into_inner());

        let entered = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(entered, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(4);
        let active = Arc::clone(&self.active);
        let delay = self.response_delay;
        let success = self.refinement_success;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(Ok(proto::QueryResponse {
                    result: Some(proto::query_response::Result::Refinement(
                        proto::query_response::RefinementResult { success },
                    )),
                }))
                .await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type StartSimulationStream = ReceiverStream<Result<proto::SimulationStepResponse, Status>>;

    async fn start_simulation(
        &self,
        _request: Request<proto::SimulationStartRequest>,
    ) -> Result<Response<Self::StartSimulationStream>, Status> {
        Err(Status::unimplemented("not part of this double"))
    }

    type TakeSimulationStepStream = ReceiverStream<Result<proto::SimulationStepResponse, Status>>;

    async fn take_simulation_step(
        &self,
        _request: Request<proto::SimulationStepRequest>,
    ) -> Result<Response<Self::TakeSimulationStepStream>, Status> {
        Err(Status::unimplemented("not part of this double"))
    }
}

async fn serve(mock: MockEngine) -> u16 {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(VerificationEngineServer::new(mock))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    port
}

struct FixedRepository;

impl ComponentRepository for FixedRepository {
    fn components(&self) -> Vec<(String, String)> {
        vec![
            ("Administration".to_string(), "{\"name\":\"Administration\"}".to_string()),
            ("Machine".to_string(), "{\"name\":\"Machine\"}".to_string()),
        ]
    }

    fn insert_generated(&self, _name: &str, _json: &str) {}
}

fn engine_config(name: &str, port: u16, thread_safe: bool) -> EngineConfig {
    let mut config = EngineConfig::new(
        name,
        EngineLocality::Remote {
            address: "127.0.0.1".to_string(),
        },
        port,
        port,
    );
    config.thread_safe = thread_safe;
    config
}

fn verdict_query(
    text: &str,
    engine: &str,
    verdicts: mpsc::UnboundedSender<bool>,
) -> Arc<Query> {
    Arc::new(Query::new(
        QueryType::Refinement,
        text,
        engine,
        move |verdict| {
            let _ = verdicts.send(verdict);
        },
        |_| {},
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn query_round_trips_through_a_real_socket() {
    let mock = MockEngine {
        refinement_success: true,
        ..MockEngine::default()
    };
    let queries = Arc::clone(&mock.queries);
    let port = serve(mock).await;

    let registry = Arc::new(EngineRegistry::new(PoolSettings::default()));
    registry.register(engine_config("reverie", port, false)).unwrap();
    let handler = QueryHandler::new(Arc::clone(&registry), "user-1", Arc::new(FixedRepository));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let query = verdict_query("Administration <= Machine", "reverie", tx);
    handler.execute_query(&query).unwrap();

    let verdict = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("engine answered")
        .unwrap();
    assert!(verdict);
    assert_eq!(query.state(), QueryState::Successful);

    let seen = queries.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].query, "refinement: Administration <= Machine");
    assert_eq!(seen[0].user_id, "user-1");
    assert!(!seen[0].query_id.is_empty());
    let info = seen[0].components_info.as_ref().unwrap();
    assert_eq!(info.components.len(), 2);
    assert!(seen[0].settings.as_ref().unwrap().disable_clock_reduction);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_port_engine_serializes_requests_in_fifo_order() {
    let mock = MockEngine {
        refinement_success: true,
        response_delay: Duration::from_millis(200),
        ..MockEngine::default()
    };
    let queries = Arc::clone(&mock.queries);
    let max_active = Arc::clone(&mock.max_active);
    let port = serve(mock).await;

    let registry = Arc::new(EngineRegistry::new(PoolSettings::default()));
    let pool = registry.register(engine_config("reverie", port, false)).unwrap();
    let handler = QueryHandler::new(Arc::clone(&registry), "user-1", Arc::new(FixedRepository));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = verdict_query("A <= B", "reverie", tx.clone());
    let second = verdict_query("B <= C", "reverie", tx);
    handler.execute_query(&first).unwrap();
    handler.execute_query(&second).unwrap();

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("engine answered")
            .unwrap();
    }

    // The sole connection is held until each stream completes, so the
    // requests never overlap and arrive in enqueue order.
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    let seen = queries.lock().unwrap();
    assert_eq!(seen[0].query, "refinement: A <= B");
    assert_eq!(seen[1].query, "refinement: B <= C");

    // One port in range: the pool never opened a second connection.
    assert_eq!(pool.open_connections(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn thread_safe_engine_shares_one_connection_concurrently() {
    let mock = MockEngine {
        refinement_success: true,
        response_delay: Duration::from_millis(400),
        ..MockEngine::default()
    };
    let max_active = Arc::clone(&mock.max_active);
    let port = serve(mock).await;

    let registry = Arc::new(EngineRegistry::new(PoolSettings::default()));
    let pool = registry.register(engine_config("reverie", port, true)).unwrap();
    let handler = QueryHandler::new(Arc::clone(&registry), "user-1", Arc::new(FixedRepository));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = verdict_query("A <= B", "reverie", tx.clone());
    let second = verdict_query("B <= C", "reverie", tx);
    handler.execute_query(&first).unwrap();
    handler.execute_query(&second).unwrap();

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("engine answered")
            .unwrap();
    }

    assert_eq!(max_active.load(Ordering::SeqCst), 2);
    assert_eq!(pool.open_connections(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_engine_reports_a_timeout_failure() {
    let mock = MockEngine {
        refinement_success: true,
        response_delay: Duration::from_secs(10),
        ..MockEngine::default()
    };
    let port = serve(mock).await;

    let settings = PoolSettings {
        response_deadline: Duration::from_millis(200),
        ..PoolSettings::default()
    };
    let registry = Arc::new(EngineRegistry::new(settings));
    registry.register(engine_config("reverie", port, false)).unwrap();
    let handler = QueryHandler::new(Arc::clone(&registry), "user-1", Arc::new(FixedRepository));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let failures = tx;
    let query = Arc::new(Query::new(
        QueryType::Refinement,
        "A <= B",
        "reverie",
        |_| {},
        move |error| {
            let _ = failures.send(error.is_timeout());
        },
    ));
    handler.execute_query(&query).unwrap();

    let timed_out = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("failure surfaced")
        .unwrap();
    assert!(timed_out);
    assert_eq!(query.state(), QueryState::Error);
    assert!(query.errors().contains("did not answer in time"));
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_close_all_shuts_down_started_connections() {
    let mock = MockEngine {
        refinement_success: true,
        ..MockEngine::default()
    };
    let port = serve(mock).await;

    let registry = Arc::new(EngineRegistry::new(PoolSettings::default()));
    let pool = registry.register(engine_config("reverie", port, false)).unwrap();
    let handler = QueryHandler::new(Arc::clone(&registry), "user-1", Arc::new(FixedRepository));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let query = verdict_query("A <= B", "reverie", tx);
    handler.execute_query(&query).unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("engine answered")
        .unwrap();

    assert_eq!(pool.open_connections(), 1);
    let failures = registry.close_all().await;
    assert!(failures.is_empty());
    assert_eq!(pool.open_connections(), 0);
}
