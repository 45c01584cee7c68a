//! User-issued verification queries and their lifecycle.
//!
//! A query is shared between the UI thread and the RPC callback tasks:
//! its state and accumulated error text live behind interior mutability,
//! and cancellation is cooperative (resetting the state to `Unknown`
//! makes every later stream callback a no-op while the stream drains).

use std::fmt;
use std::sync::OnceLock;
use std::sync::{Arc, Mutex};

use regex::Regex;
use tracing::warn;

use crate::connection::EngineConnection;
use crate::error::{EngineError, EngineResult};
use crate::registry::EngineRegistry;
use crate::request::{ConnectionObserver, RequestFactory, TrackedConnections};
use crate::transport::{proto, ComponentRepository, GeneratedComponent};

/// Lifecycle state of a query.
///
/// The ordering is meaningful: stream callbacks never downgrade a query
/// once a more finished state has been reached, so later variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueryState {
    /// Not run yet, or cancelled. Both initial and re-entrant.
    Unknown,
    /// Dispatched and awaiting responses.
    Running,
    /// The engine answered the query positively.
    Successful,
    /// The engine answered negatively or the stream failed.
    Error,
    /// The query was rejected before dispatch.
    SyntaxError,
}

/// The kind of verification question a query asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Is a state satisfying the predicate reachable?
    Reachability,
    /// Does one system refine another?
    Refinement,
    /// Is the system consistent?
    Consistency,
    /// Is the system deterministic?
    Determinism,
    /// Ask the engine to generate a component from an expression.
    GetComponent,
}

impl QueryType {
    /// Wire name, used as the `"<type>: <text>"` prefix.
    #[must_use]
    pub const fn query_name(self) -> &'static str {
        match self {
            Self::Reachability => "reachability",
            Self::Refinement => "refinement",
            Self::Consistency => "consistency",
            Self::Determinism => "determinism",
            Self::GetComponent => "get-component",
        }
    }

    /// Parses a wire name back into a type.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "reachability" => Some(Self::Reachability),
            "refinement" => Some(Self::Refinement),
            "consistency" => Some(Self::Consistency),
            "determinism" => Some(Self::Determinism),
            "get-component" => Some(Self::GetComponent),
            _ => None,
        }
    }
}

fn query_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*([\w-]+)\s*:\s*(.*)$").expect("valid query prefix pattern"))
}

/// One user-issued query.
pub struct Query {
    query_type: QueryType,
    text: String,
    engine: String,
    state: Mutex<QueryState>,
    errors: Mutex<String>,
    on_result: Box<dyn Fn(bool) + Send + Sync>,
    on_failure: Box<dyn Fn(&EngineError) + Send + Sync>,
}

impl Query {
    /// A new query in the `Unknown` state.
    ///
    /// `on_result` receives the engine's verdict; `on_failure` receives
    /// stream-level failures. Both may be called from RPC callback tasks.
    pub fn new(
        query_type: QueryType,
        text: impl Into<String>,
        engine: impl Into<String>,
        on_result: impl Fn(bool) + Send + Sync + 'static,
        on_failure: impl Fn(&EngineError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            query_type,
            text: text.into(),
            engine: engine.into(),
            state: Mutex::new(QueryState::Unknown),
            errors: Mutex::new(String::new()),
            on_result: Box::new(on_result),
            on_failure: Box::new(on_failure),
        }
    }

    /// Splits a `"<type>: <text>"` line into its type and bare text.
    pub fn parse_line(line: &str) -> EngineResult<(QueryType, String)> {
        let captures = query_prefix_pattern()
            .captures(line)
            .ok_or_else(|| EngineError::Syntax {
                message: format!("missing query type prefix in '{line}'"),
            })?;
        let query_type = QueryType::from_name(&captures[1]).ok_or_else(|| EngineError::Syntax {
            message: format!("unknown query type '{}'", &captures[1]),
        })?;
        Ok((query_type, captures[2].to_string()))
    }

    /// The kind of question this query asks.
    #[must_use]
    pub const fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// Bare query text, without the type prefix.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Name of the engine the query is bound to.
    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// The query string as sent to the engine.
    #[must_use]
    pub fn wire_format(&self) -> String {
        format!("{}: {}", self.query_type.query_name(), self.text)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> QueryState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Accumulated error text from the last run.
    #[must_use]
    pub fn errors(&self) -> String {
        self.errors.lock().expect("errors lock poisoned").clone()
    }

    /// Cancels the query. Stream callbacks already in flight observe the
    /// reset and ignore the rest of the stream.
    pub fn cancel(&self) {
        *self.state.lock().expect("state lock poisoned") = QueryState::Unknown;
    }

    /// Whether the query has been cancelled (or never ran).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == QueryState::Unknown
    }

    /// Moves to `next` unless a more finished state was already reached.
    pub(crate) fn advance_state(&self, next: QueryState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if next > *state {
            *state = next;
        }
    }

    /// Unconditional transition, used when (re)starting a run.
    fn force_state(&self, next: QueryState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    fn record_error(&self, message: &str) {
        let mut errors = self.errors.lock().expect("errors lock poisoned");
        if !errors.is_empty() {
            errors.push('\n');
        }
        errors.push_str(message);
    }

    fn clear_errors(&self) {
        self.errors.lock().expect("errors lock poisoned").clear();
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("query_type", &self.query_type)
            .field("text", &self.text)
            .field("engine", &self.engine)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Pluggable query-execution capability.
///
/// The gRPC-backed [`QueryHandler`] is one implementation; a legacy
/// line-oriented pipe driver would be another.
pub trait QueryDriver: Send + Sync {
    /// Runs the query, dispatching it to its engine.
    fn run_query(&self, query: &Arc<Query>) -> EngineResult<()>;
    /// Cancels the query cooperatively.
    fn cancel(&self, query: &Query);
}

/// Owns the lifecycle of user-issued queries.
pub struct QueryHandler {
    registry: Arc<EngineRegistry>,
    factory: RequestFactory,
    repository: Arc<dyn ComponentRepository>,
    tracked: Arc<TrackedConnections>,
}

impl QueryHandler {
    /// A handler dispatching through `registry` and serializing the
    /// components of `repository` into every request.
    pub fn new(
        registry: Arc<EngineRegistry>,
        user_id: impl Into<String>,
        repository: Arc<dyn ComponentRepository>,
    ) -> Self {
        Self {
            registry,
            factory: RequestFactory::new(user_id, Arc::clone(&repository)),
            repository,
            tracked: Arc::new(TrackedConnections::default()),
        }
    }

    /// Validates and dispatches `query`.
    ///
    /// A no-op when the query is already running or its parentheses are
    /// unbalanced; an empty query transitions straight to `SyntaxError`.
    pub fn execute_query(&self, query: &Arc<Query>) -> EngineResult<()> {
        if query.state() == QueryState::Running {
            return Ok(());
        }
        if query.text().trim().is_empty() {
            query.record_error("query is empty");
            query.force_state(QueryState::SyntaxError);
            return Ok(());
        }
        if !parentheses_balanced(query.text()) {
            return Ok(());
        }

        let pool = self
            .registry
            .pool(query.engine())
            .ok_or_else(|| EngineError::Protocol {
                message: format!("no engine '{}' is registered", query.engine()),
            })?;

        query.clear_errors();
        query.force_state(QueryState::Running);

        let repository = Arc::clone(&self.repository);
        let message_query = Arc::clone(query);
        let error_query = Arc::clone(query);
        let observer: Arc<dyn ConnectionObserver> = self.tracked.clone();
        let request = self.factory.verification_request(
            &pool,
            query.wire_format(),
            observer,
            || {},
            move |response| interpret_response(&repository, &message_query, response),
            Arc::new(move |error| report_stream_error(&error_query, &error)),
        );
        pool.enqueue(request)
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

impl QueryDriver for QueryHandler {
    fn run_query(&self, query: &Arc<Query>) -> EngineResult<()> {
        self.execute_query(query)
    }

    fn cancel(&self, query: &Query) {
        query.cancel();
    }
}

impl fmt::Debug for QueryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandler").finish_non_exhaustive()
    }
}

/// Interprets one streamed response message for `query`.
fn interpret_response(
    repository: &Arc<dyn ComponentRepository>,
    query: &Arc<Query>,
    response: proto::QueryResponse,
) {
    if query.is_cancelled() {
        return;
    }

    use proto::query_response::Result as QueryResult;
    let success = match response.result {
        Some(QueryResult::Refinement(result)) => result.success,
        Some(QueryResult::Consistency(result)) => result.success,
        Some(QueryResult::Determinism(result)) => result.success,
        Some(QueryResult::Component(result)) => {
            if let Some(component) = result.component {
                insert_generated(repository, &component);
            }
            true
        }
        None => false,
    };

    if success {
        query.advance_state(QueryState::Successful);
    } else {
        query.record_error("the engine rejected the query");
        query.advance_state(QueryState::Error);
    }
    (query.on_result)(success);
}

fn insert_generated(repository: &Arc<dyn ComponentRepository>, component: &proto::Component) {
    if !component.name.is_empty() {
        repository.insert_generated(&component.name, &component.json);
        return;
    }
    match serde_json::from_str::<GeneratedComponent>(&component.json) {
        Ok(parsed) => repository.insert_generated(&parsed.name, &component.json),
        Err(error) => warn!(%error, "discarding generated component with unreadable name"),
    }
}

/// Hands a classified stream failure to the query's continuations.
fn report_stream_error(query: &Arc<Query>, error: &EngineError) {
    if query.is_cancelled() {
        return;
    }
    query.record_error(&error.to_string());
    query.advance_state(QueryState::Error);
    (query.on_failure)(error);
}

/// The syntactic pre-check applied before dispatch.
fn parentheses_balanced(text: &str) -> bool {
    let mut depth = 0_i32;
    for symbol in text.chars() {
        match symbol {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::pool::PoolSettings;

    #[derive(Default)]
    struct StubRepository {
        inserted: Mutex<Vec<(String, String)>>,
    }

    impl ComponentRepository for StubRepository {
        fn components(&self) -> Vec<(String, String)> {
            Vec::new()
        }

        fn insert_generated(&self, name: &str, json: &str) {
            self.inserted
                .lock()
                .unwrap()
                .push((name.to_string(), json.to_string()));
        }
    }

    fn plain_query(query_type: QueryType, text: &str) -> Arc<Query> {
        Arc::new(Query::new(query_type, text, "reverie", |_| {}, |_| {}))
    }

    #[test]
    fn state_order_never_downgrades() {
        let query = plain_query(QueryType::Refinement, "A <= B");
        query.advance_state(QueryState::Running);
        query.advance_state(QueryState::Error);
        query.advance_state(QueryState::Successful);
        assert_eq!(query.state(), QueryState::Error);

        // Cancellation is an explicit reset, not an advance.
        query.cancel();
        assert_eq!(query.state(), QueryState::Unknown);
    }

    #[test]
    fn parse_line_splits_type_and_text() {
        let (query_type, text) = Query::parse_line("refinement: A <= B").unwrap();
        assert_eq!(query_type, QueryType::Refinement);
        assert_eq!(text, "A <= B");

        assert!(Query::parse_line("bisimulation: A").is_err());
        assert!(Query::parse_line("no prefix here").is_err());
    }

    #[test]
    fn wire_format_prefixes_the_type() {
        let query = plain_query(QueryType::Consistency, "A && B");
        assert_eq!(query.wire_format(), "consistency: A && B");
    }

    #[test]
    fn parentheses_validator() {
        assert!(parentheses_balanced("reachability: (A[1].x > 2 && (b))"));
        assert!(parentheses_balanced("no parens"));
        assert!(!parentheses_balanced("(unclosed"));
        assert!(!parentheses_balanced(")("));
    }

    #[tokio::test]
    async fn empty_query_is_a_syntax_error_and_never_runs() {
        let registry = Arc::new(EngineRegistry::new(PoolSettings::default()));
        let handler = QueryHandler::new(registry, "user", Arc::new(StubRepository::default()));

        let query = plain_query(QueryType::Refinement, "   ");
        handler.execute_query(&query).unwrap();

        assert_eq!(query.state(), QueryState::SyntaxError);
        assert!(!query.errors().is_empty());
    }

    #[tokio::test]
    async fn unbalanced_query_is_a_silent_no_op() {
        let registry = Arc::new(EngineRegistry::new(PoolSettings::default()));
        let handler = QueryHandler::new(registry, "user", Arc::new(StubRepository::default()));

        let query = plain_query(QueryType::Refinement, "(A <= B");
        handler.execute_query(&query).unwrap();
        assert_eq!(query.state(), QueryState::Unknown);
    }

    #[test]
    fn cancelled_query_ignores_responses() {
        let results = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&results);
        let query = Arc::new(Query::new(
            QueryType::Refinement,
            "A <= B",
            "reverie",
            move |_| {
                count.fetch_add(1, Ordering::AcqRel);
            },
            |_| {},
        ));
        let repository: Arc<dyn ComponentRepository> = Arc::new(StubRepository::default());

        query.cancel();
        interpret_response(
            &repository,
            &query,
            proto::QueryResponse {
                result: Some(proto::query_response::Result::Refinement(
                    proto::query_response::RefinementResult { success: true },
                )),
            },
        );
        assert_eq!(results.load(Ordering::Acquire), 0);
        assert_eq!(query.state(), QueryState::Unknown);
    }

    #[test]
    fn refinement_success_reaches_successful() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let query = Arc::new(Query::new(
            QueryType::Refinement,
            "A <= B",
            "reverie",
            move |verdict| sink.lock().unwrap().push(verdict),
            |_| {},
        ));
        query.advance_state(QueryState::Running);
        let repository: Arc<dyn ComponentRepository> = Arc::new(StubRepository::default());

        interpret_response(
            &repository,
            &query,
            proto::QueryResponse {
                result: Some(proto::query_response::Result::Refinement(
                    proto::query_response::RefinementResult { success: true },
                )),
            },
        );
        assert_eq!(query.state(), QueryState::Successful);
        assert_eq!(*results.lock().unwrap(), vec![true]);
    }

    #[test]
    fn generated_component_lands_in_the_repository() {
        let repository = Arc::new(StubRepository::default());
        let dyn_repository: Arc<dyn ComponentRepository> = repository.clone();
        let query = plain_query(QueryType::GetComponent, "A // B save-as C");
        query.advance_state(QueryState::Running);

        interpret_response(
            &dyn_repository,
            &query,
            proto::QueryResponse {
                result: Some(proto::query_response::Result::Component(
                    proto::query_response::ComponentResult {
                        component: Some(proto::Component {
                            name: "C".to_string(),
                            json: "{\"name\":\"C\"}".to_string(),
                        }),
                    },
                )),
            },
        );
        assert_eq!(query.state(), QueryState::Successful);
        let inserted = repository.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].0, "C");
    }

    #[test]
    fn stream_error_reaches_failure_continuation() {
        let failures = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&failures);
        let query = Arc::new(Query::new(
            QueryType::Refinement,
            "A <= B",
            "reverie",
            |_| {},
            move |error| {
                assert!(error.is_timeout());
                count.fetch_add(1, Ordering::AcqRel);
            },
        ));
        query.advance_state(QueryState::Running);

        report_stream_error(
            &query,
            &EngineError::Timeout {
                engine: "reverie".to_string(),
            },
        );
        assert_eq!(query.state(), QueryState::Error);
        assert_eq!(failures.load(Ordering::Acquire), 1);
        assert!(query.errors().contains("did not answer in time"));
    }
}
