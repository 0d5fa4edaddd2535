//! Request dispatcher
//!
//! A single task owns the endpoint and the task correlator. It reads frames,
//! answers envelope-level failures on the spot, hands everything else to the
//! worker pool, and writes each completion back to the caller recorded for
//! its task. Handler latency never holds up the read loop, and no other task
//! ever writes to the endpoint.

use super::correlator::{TaskCorrelator, TaskId, TaskRecord};
use super::envelope::{CommandEnvelope, RequestError};
use super::handlers::Handler;
use super::pool::{Completion, WorkerPool};
use super::registry::HandlerRegistry;
use crate::config::ServerConfig;
use crate::transport::{CallerAddress, Endpoint, RoutedFrame};
use cmdbroker_shared::{errors, CommandResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Decode, route and run one request inline
///
/// Same result the dispatcher would send for `payload`, minus the worker pool
/// and backpressure.
pub async fn process_request(registry: &HandlerRegistry, payload: &[u8]) -> CommandResult {
    match registry.route(payload) {
        Ok((handler, envelope)) => handler.process(&envelope).await,
        Err(rejection) => rejection.into(),
    }
}

/// Routes requests from an endpoint through the worker pool and back
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    correlator: TaskCorrelator,
    pool: WorkerPool,
    completions: mpsc::UnboundedReceiver<Completion>,
    task_id: AtomicU64,
    max_outstanding: Option<usize>,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(config: &ServerConfig, registry: HandlerRegistry) -> Self {
        let (pool, completions) = WorkerPool::new(config.worker_pool_size);
        Self {
            registry: Arc::new(registry),
            correlator: TaskCorrelator::new(),
            pool,
            completions,
            task_id: AtomicU64::new(0),
            max_outstanding: config.max_outstanding(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    /// Another handle to the outstanding-task table, for monitoring
    pub fn correlator(&self) -> TaskCorrelator {
        self.correlator.clone()
    }

    fn next_task_id(&self) -> TaskId {
        TaskId::new(self.task_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Serve `endpoint` until `shutdown` resolves or the endpoint closes
    ///
    /// On the way out, outstanding tasks get up to the configured grace
    /// period to finish; requests arriving meanwhile are refused. The endpoint
    /// is closed before returning.
    pub async fn run<E, S>(mut self, mut endpoint: E, shutdown: S)
    where
        E: Endpoint,
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        info!(workers = self.pool.size(), max_outstanding = ?self.max_outstanding, "Dispatcher running");

        let mut endpoint_open = true;
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                Some(completion) = self.completions.recv() => {
                    self.complete(&mut endpoint, completion).await;
                }

                frame = endpoint.receive() => match frame {
                    Some(frame) => self.submit(&mut endpoint, frame).await,
                    None => {
                        info!("Endpoint closed");
                        endpoint_open = false;
                        break;
                    }
                },
            }
        }

        self.drain(&mut endpoint, endpoint_open).await;
        self.refuse_queued(&mut endpoint).await;
        endpoint.close().await;
        info!("Dispatcher stopped");
    }

    /// Accept one inbound frame: reject it synchronously or start a task
    async fn submit<E: Endpoint>(&mut self, endpoint: &mut E, frame: RoutedFrame) {
        let RoutedFrame { caller, payload } = frame;

        let (handler, envelope) = match self.registry.route(&payload) {
            Ok(routed) => routed,
            Err(rejection) => {
                debug!(caller = %caller, error = %rejection, "Request rejected");
                self.respond(endpoint, caller, &rejection.into()).await;
                return;
            }
        };

        if let Some(limit) = self.max_outstanding {
            let outstanding = self.correlator.len().await;
            if outstanding >= limit {
                warn!(caller = %caller, outstanding, limit, "Worker pool saturated, refusing request");
                self.respond(endpoint, caller, &RequestError::ServerBusy.into()).await;
                return;
            }
        }

        self.start_task(caller, handler, envelope).await;
    }

    async fn start_task(&mut self, caller: CallerAddress, handler: Arc<Handler>, envelope: CommandEnvelope) {
        let task_id = self.next_task_id();
        let command_type = handler.kind();

        // The completion is read by this same loop, so it cannot be looked up
        // before the record below is in place.
        let handle = self.pool.submit(task_id, handler, envelope);
        let inserted = self
            .correlator
            .insert(task_id, TaskRecord::new(caller, command_type, handle))
            .await;
        debug_assert!(inserted, "task id {} reused", task_id);

        debug!(task_id = %task_id, caller = %caller, command_type, busy = self.pool.busy(), "Task submitted");
    }

    /// Deliver a finished task to its caller, exactly once
    async fn complete<E: Endpoint>(&mut self, endpoint: &mut E, completion: Completion) {
        let Completion { task_id, outcome } = completion;

        let Some(record) = self.correlator.take(task_id).await else {
            warn!(task_id = %task_id, "Completion for unknown task dropped");
            return;
        };

        let result = match outcome {
            Ok(result) => result,
            Err(fault) => {
                error!(
                    task_id = %task_id,
                    caller = %record.caller,
                    command_type = %record.command_type,
                    fault = %fault,
                    "Handler fault"
                );
                CommandResult::error(errors::INTERNAL_ERROR)
            }
        };

        debug!(
            task_id = %task_id,
            caller = %record.caller,
            status = %result.status(),
            elapsed_ms = record.age().as_millis() as u64,
            "Task complete"
        );
        self.respond(endpoint, record.caller, &result).await;
    }

    /// Write a result to a caller. Transport failures are logged, never raised.
    async fn respond<E: Endpoint>(&self, endpoint: &mut E, caller: CallerAddress, result: &CommandResult) {
        let payload = match serde_json::to_vec(result) {
            Ok(payload) => payload,
            Err(e) => {
                error!(caller = %caller, error = %e, "Failed to serialize result");
                br#"{"status":"error","error":"Internal server error"}"#.to_vec()
            }
        };

        if let Err(e) = endpoint.send(RoutedFrame::new(caller, payload)).await {
            warn!(caller = %caller, error = %e, "Failed to deliver response");
        }
    }

    /// Let outstanding tasks finish, refusing anything new
    async fn drain<E: Endpoint>(&mut self, endpoint: &mut E, mut endpoint_open: bool) {
        let outstanding = self.correlator.len().await;
        if outstanding == 0 {
            return;
        }
        info!(outstanding, grace_ms = self.shutdown_grace.as_millis() as u64, "Draining outstanding tasks");

        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);

        while !self.correlator.is_empty().await {
            tokio::select! {
                biased;

                Some(completion) = self.completions.recv() => {
                    self.complete(endpoint, completion).await;
                }

                frame = endpoint.receive(), if endpoint_open => match frame {
                    Some(frame) => {
                        self.respond(endpoint, frame.caller, &RequestError::ShuttingDown.into()).await;
                    }
                    None => endpoint_open = false,
                },

                _ = &mut deadline => {
                    self.abort_outstanding(endpoint).await;
                    break;
                }
            }
        }
    }

    /// Answer every frame still queued on the endpoint before it closes
    async fn refuse_queued<E: Endpoint>(&mut self, endpoint: &mut E) {
        endpoint.stop_receiving().await;

        let mut refused = 0usize;
        while let Some(frame) = endpoint.receive().await {
            self.respond(endpoint, frame.caller, &RequestError::ShuttingDown.into())
                .await;
            refused += 1;
        }
        if refused > 0 {
            info!(refused, "Refused requests queued at shutdown");
        }
    }

    async fn abort_outstanding<E: Endpoint>(&mut self, endpoint: &mut E) {
        let abandoned = self.correlator.drain().await;
        warn!(tasks = abandoned.len(), "Shutdown grace elapsed, aborting tasks");

        for (task_id, record) in abandoned {
            record.abort();
            debug!(task_id = %task_id, caller = %record.caller, "Task aborted");
            self.respond(endpoint, record.caller, &RequestError::ShuttingDown.into())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::handlers::ProbeHandler;
    use crate::transport::memory::{self, MemoryPeer};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn config(workers: usize, queue_capacity: Option<usize>) -> ServerConfig {
        ServerConfig {
            worker_pool_size: workers,
            queue_capacity,
            shutdown_grace: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    fn registry(config: &ServerConfig) -> HandlerRegistry {
        HandlerRegistry::from_config(config).with_handler("probe", Handler::Probe(ProbeHandler))
    }

    struct Harness {
        peer: MemoryPeer,
        correlator: TaskCorrelator,
        shutdown: Option<oneshot::Sender<()>>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(config: ServerConfig) -> Self {
            let dispatcher = Dispatcher::new(&config, registry(&config));
            let correlator = dispatcher.correlator();
            let (endpoint, peer) = memory::pair();
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let task = tokio::spawn(dispatcher.run(endpoint, async {
                let _ = shutdown_rx.await;
            }));
            Self {
                peer,
                correlator,
                shutdown: Some(shutdown_tx),
                task,
            }
        }

        fn shutdown(&mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
        }

        /// Close the endpoint and wait for the dispatcher to finish
        async fn finish(mut self) -> (MemoryPeer, TaskCorrelator) {
            self.peer.hang_up();
            tokio::time::timeout(Duration::from_secs(10), self.task)
                .await
                .expect("dispatcher did not stop")
                .unwrap();
            (self.peer, self.correlator)
        }
    }

    #[tokio::test]
    async fn test_process_request_scenarios() {
        let config = ServerConfig::default();
        let registry = HandlerRegistry::from_config(&config);

        let run = |request: Value| {
            let registry = registry.clone();
            async move {
                serde_json::to_value(process_request(&registry, request.to_string().as_bytes()).await).unwrap()
            }
        };

        assert_eq!(
            run(json!({"command_type": "compute", "expression": "(2 + 2) * 10"})).await,
            json!({"status": "success", "result": 40})
        );
        assert_eq!(
            run(json!({"command_type": "os", "command_name": "rm", "parameters": ["-rf", "/"]})).await,
            json!({"status": "error", "error": "Command 'rm' is not allowed"})
        );
        assert_eq!(
            run(json!({"expression": "1 + 1"})).await,
            json!({"status": "error", "error": "Missing command_type"})
        );
        assert_eq!(
            run(json!({"command_type": "shell"})).await,
            json!({"status": "error", "error": "Unknown command type: shell"})
        );

        let unsupported = run(json!({"command_type": "compute", "expression": "2 + foo"})).await;
        assert_eq!(unsupported["status"], "error");
        assert!(unsupported["error"].as_str().unwrap().contains("Unsupported"));
    }

    #[tokio::test]
    async fn test_status_is_always_success_or_error() {
        let registry = HandlerRegistry::from_config(&ServerConfig::default());
        let payloads: [&[u8]; 8] = [
            br#"{"command_type":"compute","expression":"1 / 3"}"#,
            br#"{"command_type":"compute","expression":"1 / 0"}"#,
            br#"{"command_type":"compute","expression":["1"]}"#,
            br#"{"command_type":"os","command_name":"ls","parameters":{"a":1}}"#,
            br#"{"command_type":{"nested":true}}"#,
            br#"{}"#,
            b"42",
            b"",
        ];

        for payload in payloads {
            let value = serde_json::to_value(process_request(&registry, payload).await).unwrap();
            let status = value["status"].as_str().expect("status present");
            assert!(status == "success" || status == "error", "{:?}", value);
        }
    }

    #[tokio::test]
    async fn test_compute_routed_to_caller() {
        let mut harness = Harness::start(config(2, None));
        harness
            .peer
            .send_json(7, &json!({"command_type": "compute", "expression": "(2 + 2) * 10"}));

        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(7));
        assert_eq!(response, json!({"status": "success", "result": 40}));

        let (_, correlator) = harness.finish().await;
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_envelope_errors_answered_without_tasks() {
        let mut harness = Harness::start(config(2, None));

        harness.peer.send_json(1, &json!({"expression": "1"}));
        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(1));
        assert_eq!(response, json!({"status": "error", "error": "Missing command_type"}));

        harness.peer.send_json(2, &json!({"command_type": "telnet"}));
        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(2));
        assert_eq!(response["error"], "Unknown command type: telnet");

        assert!(harness.correlator.is_empty().await);
        harness.finish().await;
    }

    #[tokio::test]
    async fn test_malformed_rejection_is_repeatable() {
        let mut harness = Harness::start(config(2, None));

        let mut errors = Vec::new();
        for _ in 0..3 {
            harness.peer.send(5, "{\"command_type\": \"compute\", ");
            let (_, response) = harness.peer.recv().await;
            errors.push(response["error"].as_str().unwrap().to_string());
        }

        assert!(errors[0].starts_with(errors::INVALID_JSON_PREFIX));
        assert!(errors.iter().all(|e| e == &errors[0]));
        harness.finish().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifty_concurrent_callers_on_ten_slots() {
        let mut harness = Harness::start(config(10, None));

        for caller in 0..50u64 {
            harness.peer.send_json(
                caller,
                &json!({"command_type": "compute", "expression": format!("{} * 3 + 1", caller)}),
            );
        }

        let mut responses = HashMap::new();
        for _ in 0..50 {
            let (caller, response) = harness.peer.recv().await;
            assert!(responses.insert(caller.id(), response).is_none(), "caller {} answered twice", caller);
        }

        for caller in 0..50u64 {
            assert_eq!(
                responses[&caller],
                json!({"status": "success", "result": caller as i64 * 3 + 1})
            );
        }

        let (mut peer, correlator) = harness.finish().await;
        assert!(peer.try_recv().is_none(), "no extra responses");
        assert!(correlator.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_requests_do_not_block_or_misroute() {
        let mut harness = Harness::start(config(8, None));

        // Earlier callers sleep longer, so completions arrive in reverse order
        for caller in 0..8u64 {
            harness.peer.send_json(
                caller,
                &json!({"command_type": "probe", "tag": caller, "delay_ms": (8 - caller) * 40}),
            );
        }

        let mut order = Vec::new();
        for _ in 0..8 {
            let (caller, response) = harness.peer.recv().await;
            assert_eq!(response["tag"], json!(caller.id()), "response cross-delivered");
            order.push(caller.id());
        }
        assert_ne!(order, (0..8).collect::<Vec<_>>(), "completions should not be FIFO");

        let (_, correlator) = harness.finish().await;
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_panicking_handler_reports_internal_error() {
        let mut harness = Harness::start(config(2, None));

        harness
            .peer
            .send_json(1, &json!({"command_type": "probe", "panic": true}));
        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(1));
        assert_eq!(response, json!({"status": "error", "error": "Internal server error"}));

        // Dispatcher keeps serving
        harness.peer.send_json(2, &json!({"command_type": "probe", "tag": "ok"}));
        let (_, response) = harness.peer.recv().await;
        assert_eq!(response, json!({"status": "success", "tag": "ok"}));

        let (_, correlator) = harness.finish().await;
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_server_busy_when_backlog_full() {
        let mut harness = Harness::start(config(1, Some(0)));

        harness
            .peer
            .send_json(1, &json!({"command_type": "probe", "tag": "slow", "delay_ms": 300}));
        // Wait until the first request is registered
        while harness.correlator.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        harness.peer.send_json(2, &json!({"command_type": "probe", "tag": "extra"}));

        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(2));
        assert_eq!(response, json!({"status": "error", "error": "Server busy"}));

        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(1));
        assert_eq!(response["tag"], "slow");

        harness.finish().await;
    }

    #[tokio::test]
    async fn test_unbounded_queue_never_busy() {
        let mut harness = Harness::start(config(1, None));

        for caller in 0..20u64 {
            harness
                .peer
                .send_json(caller, &json!({"command_type": "probe", "tag": caller, "delay_ms": 5}));
        }
        for _ in 0..20 {
            let (_, response) = harness.peer.recv().await;
            assert_eq!(response["status"], "success");
        }

        harness.finish().await;
    }

    #[tokio::test]
    async fn test_disconnected_caller_releases_task() {
        let mut harness = Harness::start(config(2, None));

        harness.peer.disconnect(1);
        harness
            .peer
            .send_json(1, &json!({"command_type": "probe", "delay_ms": 20}));
        harness.peer.send_json(2, &json!({"command_type": "probe", "tag": "still-here", "delay_ms": 60}));

        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(2));
        assert_eq!(response["tag"], "still-here");

        let (mut peer, correlator) = harness.finish().await;
        assert!(peer.try_recv().is_none());
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_refuses_new_work() {
        let mut harness = Harness::start(config(2, None));

        harness
            .peer
            .send_json(1, &json!({"command_type": "probe", "tag": "inflight", "delay_ms": 200}));
        while harness.correlator.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        harness.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.peer.send_json(2, &json!({"command_type": "compute", "expression": "1 + 1"}));

        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(2));
        assert_eq!(response, json!({"status": "error", "error": "Server is shutting down"}));

        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(1));
        assert_eq!(response["tag"], "inflight");

        // Drained: the dispatcher stops on its own
        tokio::time::timeout(Duration::from_secs(5), &mut harness.task)
            .await
            .expect("dispatcher should stop after draining")
            .unwrap();
        assert!(harness.correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_requests_queued_at_shutdown_are_refused() {
        let config = config(2, None);
        let dispatcher = Dispatcher::new(&config, registry(&config));
        let correlator = dispatcher.correlator();
        let (endpoint, mut peer) = memory::pair();

        peer.send_json(9, &json!({"command_type": "compute", "expression": "1 + 1"}));
        peer.send_json(10, &json!({"command_type": "compute", "expression": "2 * 3"}));

        // Shutdown is already due, so neither frame is ever submitted
        dispatcher.run(endpoint, async {}).await;

        let mut refused = Vec::new();
        while let Some(frame) = peer.try_recv() {
            let response: Value = serde_json::from_slice(&frame.payload).unwrap();
            assert_eq!(response, json!({"status": "error", "error": "Server is shutting down"}));
            refused.push(frame.caller.id());
        }
        assert_eq!(refused, vec![9, 10]);
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_grace_aborts_stragglers() {
        let mut config = config(1, None);
        config.shutdown_grace = Some(Duration::from_millis(50));
        let mut harness = Harness::start(config);

        harness
            .peer
            .send_json(3, &json!({"command_type": "probe", "delay_ms": 60_000}));
        while harness.correlator.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        harness.shutdown();

        let (caller, response) = harness.peer.recv().await;
        assert_eq!(caller, CallerAddress::new(3));
        assert_eq!(response, json!({"status": "error", "error": "Server is shutting down"}));

        let (_, correlator) = harness.finish().await;
        assert!(correlator.is_empty().await);
    }
}
