//! Integration tests for execution, documents and lifecycle.
//!
//! Everything runs against the in-process `MemoryJupyter` server.

use std::sync::Arc;
use std::time::Duration;

use notebook_session::memory::MemoryJupyter;
use notebook_session::output::MediaBundle;
use notebook_session::protocol::empty_notebook_json;
use notebook_session::{
    ApiError, CellKind, CellUpdate, ContentStore, DocumentError, DocumentStore, ExecuteError,
    ExecutionCoordinator, ExecutionOutcome, LifecycleController, LifecycleError, LifecycleState,
    Output, SessionError, SessionRegistry, StreamChannel, EXECUTION_ERROR, SESSION_DIED,
};
use serde_json::json;

struct Harness {
    server: Arc<MemoryJupyter>,
    registry: Arc<SessionRegistry>,
    coordinator: Arc<ExecutionCoordinator>,
    session: String,
}

impl Harness {
    /// A scratch notebook and one idle session.
    async fn new() -> Self {
        let server = Arc::new(MemoryJupyter::new());
        let registry = Arc::new(SessionRegistry::new(server.clone()));
        let documents = DocumentStore::new(server.clone());
        documents.open_scratch().await;

        let session = registry.start_session(Some("python")).await.unwrap();
        let session = registry
            .await_ready(&session.id, Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert_eq!(session.state, LifecycleState::Idle);

        let coordinator = Arc::new(ExecutionCoordinator::new(registry.clone(), documents));
        Self {
            server,
            registry,
            coordinator,
            session: session.id,
        }
    }

    fn documents(&self) -> &DocumentStore {
        self.coordinator.documents()
    }

    async fn code_cell(&self, source: &str) -> String {
        let cell = self
            .documents()
            .add_cell(CellKind::Code, None)
            .await
            .unwrap();
        self.documents()
            .update_cell(&cell.id, CellUpdate::source(source))
            .await
            .unwrap();
        cell.id
    }

    async fn outputs(&self, cell_id: &str) -> Vec<Output> {
        self.documents().cell(cell_id).await.unwrap().outputs
    }

    async fn execution_count(&self, cell_id: &str) -> Option<u32> {
        self.documents().cell(cell_id).await.unwrap().execution_count
    }

    /// Start executing a cell on a separate task.
    fn spawn_execute(
        &self,
        cell_id: &str,
    ) -> tokio::task::JoinHandle<Result<ExecutionOutcome, ExecuteError>> {
        let coordinator = self.coordinator.clone();
        let cell_id = cell_id.to_string();
        let session = self.session.clone();
        tokio::spawn(async move { coordinator.execute(&cell_id, Some(&session)).await })
    }
}

fn stdout(text: &str) -> Output {
    Output::stream(StreamChannel::Stdout, text)
}

fn plain_result(text: &str, execution_count: u32) -> Output {
    let mut data = MediaBundle::new();
    data.insert("text/plain".to_string(), json!(text));
    Output::Result {
        data,
        metadata: MediaBundle::new(),
        execution_count: Some(execution_count),
    }
}

#[tokio::test]
async fn test_text_reply_uses_fallback_count() {
    let h = Harness::new().await;
    let cell = h.code_cell("print(\"hi\")").await;

    // Give the cell a prior count of 4.
    h.server
        .respond_to("print(\"hi\")", MemoryJupyter::result_reply("None", 4));
    h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    assert_eq!(h.execution_count(&cell).await, Some(4));

    h.server.respond_to(
        "print(\"hi\")",
        json!({"content": {"text": "hi\n", "execution_count": 3}}),
    );
    let outcome = h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();

    assert_eq!(h.outputs(&cell).await, vec![stdout("hi\n")]);
    assert_eq!(h.execution_count(&cell).await, Some(5));
    assert!(matches!(
        outcome,
        ExecutionOutcome::Completed {
            execution_count: 5,
            ..
        }
    ));
}

#[tokio::test]
async fn test_result_count_comes_from_session() {
    let h = Harness::new().await;
    let a = h.code_cell("a").await;
    let b = h.code_cell("b").await;
    h.server.respond_with_result("a", "1");
    h.server.respond_with_result("b", "2");

    h.coordinator.execute(&a, Some(&h.session)).await.unwrap();
    h.coordinator.execute(&b, Some(&h.session)).await.unwrap();
    h.coordinator.execute(&a, Some(&h.session)).await.unwrap();

    assert_eq!(h.execution_count(&a).await, Some(3));
    assert_eq!(h.execution_count(&b).await, Some(2));
    assert_eq!(h.outputs(&a).await, vec![plain_result("1", 3)]);
}

#[tokio::test]
async fn test_distinct_cells_get_their_own_outputs() {
    let h = Harness::new().await;
    let mut cells = Vec::new();
    for i in 0..5 {
        let code = format!("print({})", i);
        h.server
            .respond_to(&code, MemoryJupyter::text_reply(&format!("{}\n", i)));
        cells.push(h.code_cell(&code).await);
    }

    let runs = cells
        .iter()
        .map(|cell| h.coordinator.execute(cell, Some(&h.session)));
    for result in futures::future::join_all(runs).await {
        assert!(matches!(result, Ok(ExecutionOutcome::Completed { .. })));
    }

    for (i, cell) in cells.iter().enumerate() {
        assert_eq!(h.outputs(cell).await, vec![stdout(&format!("{}\n", i))]);
    }
    assert_eq!(h.server.executed().len(), 5);
}

#[tokio::test]
async fn test_reexecution_replaces_outputs() {
    let h = Harness::new().await;
    let cell = h.code_cell("x").await;

    h.server.respond_to("x", MemoryJupyter::text_reply("A"));
    h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    assert_eq!(h.outputs(&cell).await, vec![stdout("A")]);

    h.server.respond_to("x", MemoryJupyter::text_reply("B"));
    h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    assert_eq!(h.outputs(&cell).await, vec![stdout("B")]);
}

#[tokio::test]
async fn test_second_execute_fails_fast_while_in_flight() {
    let h = Harness::new().await;
    let cell = h.code_cell("slow").await;
    h.server
        .respond_to("slow", MemoryJupyter::result_reply("done", 1));
    let held = h.server.hold("slow");

    let first = h.spawn_execute(&cell);
    held.arrived().await;

    assert!(h.coordinator.is_executing(&cell));
    assert_eq!(h.coordinator.executing_cells(), vec![cell.clone()]);
    assert_eq!(
        h.registry.state_of(&h.session).await,
        Some(LifecycleState::Busy)
    );
    assert_eq!(
        h.coordinator.execute(&cell, Some(&h.session)).await,
        Err(ExecuteError::ExecutionInProgress(cell.clone()))
    );

    held.release();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            execution_count: 1,
            outputs: vec![plain_result("done", 1)],
            unknown_fragments: 0,
        }
    );
    assert_eq!(h.outputs(&cell).await, vec![plain_result("done", 1)]);
    assert!(!h.coordinator.is_executing(&cell));
    assert_eq!(
        h.registry.state_of(&h.session).await,
        Some(LifecycleState::Idle)
    );
    // Only the first request reached the server.
    assert_eq!(h.server.executed().len(), 1);
}

#[tokio::test]
async fn test_session_stays_busy_until_last_execution_returns() {
    let h = Harness::new().await;
    let a = h.code_cell("a").await;
    let b = h.code_cell("b").await;
    let held_a = h.server.hold("a");
    let held_b = h.server.hold("b");

    let run_a = h.spawn_execute(&a);
    let run_b = h.spawn_execute(&b);
    held_a.arrived().await;
    held_b.arrived().await;
    assert_eq!(h.coordinator.executing_cells().len(), 2);

    held_a.release();
    run_a.await.unwrap().unwrap();
    assert_eq!(
        h.registry.state_of(&h.session).await,
        Some(LifecycleState::Busy)
    );

    held_b.release();
    run_b.await.unwrap().unwrap();
    assert_eq!(
        h.registry.state_of(&h.session).await,
        Some(LifecycleState::Idle)
    );
}

#[tokio::test]
async fn test_session_restarting_on_server_is_rejected() {
    let h = Harness::new().await;
    let cell = h.code_cell("x").await;
    h.server.respond_to("x", MemoryJupyter::text_reply("kept"));
    h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();

    // The registry still says idle; only the server knows.
    h.server.set_execution_state(&h.session, "restarting");
    assert_eq!(
        h.coordinator.execute(&cell, Some(&h.session)).await,
        Err(ExecuteError::NoSessionSelected)
    );

    assert_eq!(h.outputs(&cell).await, vec![stdout("kept")]);
    assert_eq!(h.server.executed().len(), 1);
    assert!(!h.coordinator.is_executing(&cell));
    assert_eq!(
        h.registry.state_of(&h.session).await,
        Some(LifecycleState::Starting)
    );
}

#[tokio::test]
async fn test_kernel_gone_on_server_mid_flight() {
    let h = Harness::new().await;
    let cell = h.code_cell("x").await;
    h.server.fail_execute(Some(ApiError::NotFound(format!(
        "/api/kernels/{}",
        h.session
    ))));

    let outcome = h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::SessionDied);

    let outputs = h.outputs(&cell).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].failure_kind(), Some(SESSION_DIED));
    assert_eq!(
        h.registry.state_of(&h.session).await,
        Some(LifecycleState::Dead)
    );
}

#[tokio::test]
async fn test_session_stopped_mid_flight() {
    let h = Harness::new().await;
    let cell = h.code_cell("slow").await;
    h.server
        .respond_to("slow", MemoryJupyter::result_reply("late", 7));
    let held = h.server.hold("slow");

    let run = h.spawn_execute(&cell);
    held.arrived().await;

    h.registry.stop_session(&h.session).await.unwrap();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, ExecutionOutcome::SessionDied);

    held.release();
    tokio::task::yield_now().await;

    let outputs = h.outputs(&cell).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].failure_kind(), Some(SESSION_DIED));
    assert!(!h.coordinator.is_executing(&cell));
}

#[tokio::test]
async fn test_session_reported_dead_mid_flight() {
    let h = Harness::new().await;
    let cell = h.code_cell("slow").await;
    h.server
        .respond_to("slow", MemoryJupyter::text_reply("never shown"));
    let held = h.server.hold("slow");

    let run = h.spawn_execute(&cell);
    held.arrived().await;

    h.server.set_execution_state(&h.session, "dead");
    h.registry.refresh().await.unwrap();

    assert_eq!(run.await.unwrap().unwrap(), ExecutionOutcome::SessionDied);
    held.release();

    let outputs = h.outputs(&cell).await;
    assert_eq!(outputs.len(), 1);
    assert!(matches!(
        &outputs[0],
        Output::Failure { kind, .. } if kind == SESSION_DIED
    ));
}

#[tokio::test]
async fn test_restart_orphans_in_flight_execution() {
    let h = Harness::new().await;
    let cell = h.code_cell("slow").await;
    let held = h.server.hold("slow");

    let run = h.spawn_execute(&cell);
    held.arrived().await;

    let restarted = h.registry.restart_session(&h.session).await.unwrap();
    assert_eq!(restarted.state, LifecycleState::Starting);
    assert_eq!(run.await.unwrap().unwrap(), ExecutionOutcome::SessionDied);
    held.release();

    assert_eq!(h.outputs(&cell).await[0].failure_kind(), Some(SESSION_DIED));
    // The coordinator does not report a restarting session as idle.
    assert_eq!(
        h.registry.state_of(&h.session).await,
        Some(LifecycleState::Starting)
    );
}

#[tokio::test]
async fn test_unreachable_session_leaves_outputs_untouched() {
    let h = Harness::new().await;
    let cell = h.code_cell("x").await;
    h.server.respond_to("x", MemoryJupyter::text_reply("kept"));
    h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();

    h.server.set_unreachable(&h.session, true);
    let err = h
        .coordinator
        .execute(&cell, Some(&h.session))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::SessionUnreachable { .. }));
    assert_eq!(h.outputs(&cell).await, vec![stdout("kept")]);
    assert!(!h.coordinator.is_executing(&cell));
    // Only the first execution was sent.
    assert_eq!(h.server.executed().len(), 1);
}

#[tokio::test]
async fn test_remote_failure_becomes_single_failure_output() {
    let h = Harness::new().await;
    let cell = h.code_cell("x").await;
    h.server.respond_to("x", MemoryJupyter::result_reply("1", 2));
    h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();

    h.server
        .fail_execute(Some(ApiError::Network("connection reset".into())));
    let outcome = h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    assert!(matches!(
        outcome,
        ExecutionOutcome::Failed { ref message } if message.contains("connection reset")
    ));

    let outputs = h.outputs(&cell).await;
    assert_eq!(outputs.len(), 1);
    match &outputs[0] {
        Output::Failure { kind, message, .. } => {
            assert_eq!(kind, EXECUTION_ERROR);
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.execution_count(&cell).await, Some(2));

    // Not retried.
    assert_eq!(h.server.executed().len(), 2);
    // The document is still usable.
    h.server.fail_execute(None);
    h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    assert_eq!(h.outputs(&cell).await, vec![plain_result("1", 2)]);
}

#[tokio::test]
async fn test_remote_error_fragment() {
    let h = Harness::new().await;
    let cell = h.code_cell("1/0").await;
    h.server.respond_to(
        "1/0",
        json!({"content": {
            "status": "error",
            "ename": "ZeroDivisionError",
            "evalue": "division by zero",
            "traceback": ["Traceback (most recent call last)", "ZeroDivisionError"]
        }}),
    );

    h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    let outputs = h.outputs(&cell).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].failure_kind(), Some("ZeroDivisionError"));
}

#[tokio::test]
async fn test_empty_reply_is_not_silence() {
    let h = Harness::new().await;
    let cell = h.code_cell("x = 1").await;

    let outcome = h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            execution_count: 1,
            outputs: vec![Output::completed(1)],
            unknown_fragments: 0,
        }
    );
}

#[tokio::test]
async fn test_unknown_fragments_are_reported() {
    let h = Harness::new().await;
    let cell = h.code_cell("w").await;
    h.server.respond_to(
        "w",
        json!({"content": {"text": "ok\n", "comm_open": {"target": "jupyter.widget"}}}),
    );

    let outcome = h.coordinator.execute(&cell, Some(&h.session)).await.unwrap();
    assert!(matches!(
        outcome,
        ExecutionOutcome::Completed {
            unknown_fragments: 1,
            ..
        }
    ));
    assert_eq!(h.outputs(&cell).await, vec![stdout("ok\n")]);
}

#[tokio::test]
async fn test_cell_deleted_mid_flight() {
    let h = Harness::new().await;
    let cell = h.code_cell("slow").await;
    let held = h.server.hold("slow");

    let run = h.spawn_execute(&cell);
    held.arrived().await;
    h.documents().delete_cell(&cell).await.unwrap();
    held.release();

    assert!(matches!(
        run.await.unwrap(),
        Ok(ExecutionOutcome::Completed { .. })
    ));
    assert!(h.documents().cell(&cell).await.is_none());
}

#[tokio::test]
async fn test_executed_notebook_survives_save_and_load() {
    let server = Arc::new(MemoryJupyter::new());
    server.insert_notebook("work/analysis.ipynb", empty_notebook_json());
    let registry = Arc::new(SessionRegistry::new(server.clone()));
    let documents = DocumentStore::new(server.clone());
    let lifecycle = LifecycleController::new(registry.clone(), documents.clone());
    let coordinator = ExecutionCoordinator::new(registry.clone(), documents.clone());

    lifecycle.open_notebook("work/analysis.ipynb").await.unwrap();
    let session = lifecycle.new_kernel(None).await.unwrap();
    coordinator.select_session(Some(session.id.clone()));

    let code = documents.add_cell(CellKind::Code, None).await.unwrap();
    documents
        .update_cell(&code.id, CellUpdate::source("print('a')\n21 * 2"))
        .await
        .unwrap();
    documents.add_cell(CellKind::Prose, Some(0)).await.unwrap();
    server.respond_to(
        "print('a')\n21 * 2",
        json!({"content": {"text": "a\n", "data": {"text/plain": "42"}, "execution_count": 1}}),
    );
    coordinator.execute(&code.id, None).await.unwrap();

    let saved = documents.notebook().await.unwrap();
    documents.save().await.unwrap();
    let loaded = documents.load("work/analysis.ipynb").await.unwrap();

    assert_eq!(loaded.cells, saved.cells);
    assert_eq!(
        loaded.cells[1].outputs,
        vec![stdout("a\n"), plain_result("42", 1)]
    );
}

#[tokio::test]
async fn test_save_conflict_reaches_caller() {
    let server = Arc::new(MemoryJupyter::new());
    server.insert_notebook("shared.ipynb", empty_notebook_json());
    let documents = DocumentStore::new(server.clone());
    documents.load("shared.ipynb").await.unwrap();
    documents.add_cell(CellKind::Code, None).await.unwrap();

    server.write("shared.ipynb", &empty_notebook_json()).await.unwrap();

    let err = documents.save().await.unwrap_err();
    assert!(matches!(err, DocumentError::SaveConflict { .. }));
    // The other writer's version is intact.
    assert_eq!(server.notebook("shared.ipynb"), Some(empty_notebook_json()));
}

#[tokio::test]
async fn test_stop_unknown_session_leaves_registry_unchanged() {
    let server = Arc::new(MemoryJupyter::new());
    let registry = Arc::new(SessionRegistry::new(server.clone()));
    let documents = DocumentStore::new(server.clone());
    let lifecycle = LifecycleController::new(registry.clone(), documents);
    lifecycle.new_kernel(None).await.unwrap();

    let before = registry.list_sessions().await;
    let err = lifecycle.stop_kernel("k1").await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Session(SessionError::Stop { .. })
    ));
    assert_eq!(registry.list_sessions().await, before);
}

#[tokio::test]
async fn test_independent_registries() {
    let a = Harness::new().await;
    let b = Harness::new().await;
    a.registry.stop_session(&a.session).await.unwrap();
    assert!(a.registry.list_sessions().await.is_empty());
    assert_eq!(b.registry.list_sessions().await.len(), 1);
}
