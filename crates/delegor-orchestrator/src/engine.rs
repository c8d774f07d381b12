use crate::breaker::CircuitBreaker;
use crate::classifier::{Classifier, Request};
use crate::validator::{ResultValidator, ValidationReport};
use chrono::{DateTime, Utc};
use delegor_bus::{task_queue, BusMessage, MessageBus, HEALTH_QUEUE, RESULTS_QUEUE};
use delegor_core::{
    AggregationPolicy, CoordinatorConfig, DelegorError, DelegorResult, DeliveryMode, Domain,
    GroupResolution, HealthStatus, OutcomeCounts, Task, TaskGroup, TaskOutcome, TaskStatus,
};
use delegor_ledger::TaskLedger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Handle returned by [`Orchestrator::submit`]; the group id doubles as the
/// correlation id for polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    /// The group/correlation id.
    pub group_id: Uuid,
}

/// One group member's terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainResult {
    /// The member task.
    pub task_id: Uuid,
    /// The domain that produced it.
    pub domain: Domain,
    /// The terminal outcome.
    pub outcome: TaskOutcome,
}

/// The composed answer for a resolved group.
///
/// Always one of: a complete result, a policy-permitted partial result, or a
/// typed failure naming the failing domains — never a raw leaf error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// The group this result belongs to.
    pub group_id: Uuid,
    /// How the group resolved against its policy.
    pub resolution: GroupResolution,
    /// Whether failures or a timeout left gaps the policy tolerated.
    pub partial: bool,
    /// One entry per member, in submission order.
    pub results: Vec<DomainResult>,
    /// Domains that contributed a failed or cancelled member.
    pub failed_domains: Vec<Domain>,
    /// Residual validation over the member outcomes.
    pub validation: ValidationReport,
    /// When the group resolved.
    pub resolved_at: DateTime<Utc>,
}

struct GroupState {
    group: TaskGroup,
    domains: HashMap<Uuid, Domain>,
    outcomes: HashMap<Uuid, TaskOutcome>,
    resolved_tx: watch::Sender<bool>,
}

/// The root orchestrator: accepts requests, fans them out to sub-masters,
/// tracks group state, and composes the final answer.
pub struct Orchestrator {
    config: CoordinatorConfig,
    ledger: Arc<TaskLedger>,
    bus: Arc<dyn MessageBus>,
    classifier: Arc<dyn Classifier>,
    breaker: CircuitBreaker,
    validator: ResultValidator,
    groups: RwLock<HashMap<Uuid, GroupState>>,
    index: RwLock<HashMap<Uuid, Uuid>>,
    completed: RwLock<HashMap<Uuid, AggregatedResult>>,
    push_tx: Option<mpsc::Sender<AggregatedResult>>,
    push_rx: Mutex<Option<mpsc::Receiver<AggregatedResult>>>,
}

impl Orchestrator {
    /// Create an orchestrator over its collaborators.
    pub fn new(
        config: CoordinatorConfig,
        ledger: Arc<TaskLedger>,
        bus: Arc<dyn MessageBus>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let (push_tx, push_rx) = match config.delivery {
            DeliveryMode::Push => {
                let (tx, rx) = mpsc::channel(64);
                (Some(tx), Some(rx))
            }
            DeliveryMode::Poll => (None, None),
        };
        Self {
            breaker: CircuitBreaker::new(config.circuit.clone()),
            config,
            ledger,
            bus,
            classifier,
            validator: ResultValidator,
            groups: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashMap::new()),
            push_tx,
            push_rx: Mutex::new(push_rx),
        }
    }

    /// The circuit breaker (for health wiring and diagnostics).
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Feed a health signal directly into the breaker, bypassing the bus.
    pub async fn record_health(&self, domain: Domain, health: HealthStatus) {
        self.breaker.record_health(domain, health).await;
    }

    /// Spawn the result, health, and retention loops.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Results flowing up from sub-masters.
        {
            let orch = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                while let Some(delivery) = orch.bus.consume(RESULTS_QUEUE).await {
                    if let BusMessage::ResultReport { task_id, outcome, .. } =
                        delivery.envelope.message.clone()
                    {
                        orch.on_result(task_id, outcome).await;
                    } else {
                        warn!("unexpected message on results queue");
                    }
                    let _ = orch.bus.ack(&delivery).await;
                }
            }));
        }

        // Heartbeats feeding the circuit breaker.
        {
            let orch = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                while let Some(delivery) = orch.bus.consume(HEALTH_QUEUE).await {
                    if let BusMessage::Heartbeat { domain, health } = &delivery.envelope.message {
                        orch.breaker.record_health(*domain, *health).await;
                    } else {
                        warn!("unexpected message on health queue");
                    }
                    let _ = orch.bus.ack(&delivery).await;
                }
            }));
        }

        // Ledger retention.
        {
            let orch = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let retention = chrono::Duration::milliseconds(orch.config.retention_ms as i64);
                let tick = Duration::from_millis(orch.config.retention_ms.max(100));
                while !orch.bus.is_shutdown() {
                    tokio::time::sleep(tick).await;
                    orch.ledger.gc(retention).await;
                }
            }));
        }

        handles
    }

    /// Validate, classify, and fan a request out to its sub-masters.
    ///
    /// Returns immediately with the group handle; completion is observed via
    /// [`Orchestrator::await_group`], [`Orchestrator::poll`], or push
    /// delivery. Fails fast with `DomainUnavailable` when a required domain's
    /// circuit is open — before anything is persisted or enqueued.
    pub async fn submit(&self, request: Request) -> DelegorResult<SubmissionReceipt> {
        if request.items.is_empty() {
            return Err(DelegorError::Validation("request has no items".into()));
        }

        let classified = self.classifier.classify(&request).await?;
        if classified.is_empty() {
            return Err(DelegorError::Validation(
                "classification produced no tasks".into(),
            ));
        }

        for (domain, _) in &classified {
            if self.breaker.is_open(*domain).await {
                return Err(DelegorError::DomainUnavailable(*domain));
            }
        }

        let deadline_ms = request.deadline_ms.unwrap_or(self.config.default_deadline_ms);
        let deadline = Utc::now() + chrono::Duration::milliseconds(deadline_ms as i64);
        let policy = request.policy.unwrap_or_default();

        let tasks: Vec<Task> = classified
            .into_iter()
            .map(|(domain, payload)| Task::new(domain, payload, deadline))
            .collect();
        let group = TaskGroup::new(tasks.iter().map(|t| t.id).collect(), policy);
        let group_id = group.id;

        let (resolved_tx, _) = watch::channel(false);
        {
            let mut groups = self.groups.write().await;
            let mut index = self.index.write().await;
            for task in &tasks {
                index.insert(task.id, group_id);
            }
            groups.insert(
                group_id,
                GroupState {
                    domains: tasks.iter().map(|t| (t.id, t.domain)).collect(),
                    group,
                    outcomes: HashMap::new(),
                    resolved_tx,
                },
            );
        }

        for task in tasks {
            let domain = task.domain;
            self.ledger.create(task.clone()).await;
            self.bus
                .publish(&task_queue(domain), BusMessage::TaskAssignment { task })
                .await?;
        }

        info!(group_id = %group_id, "request submitted");
        Ok(SubmissionReceipt { group_id })
    }

    /// Suspend until the group resolves per its policy, or `timeout` elapses.
    ///
    /// On timeout, unresolved members are cancelled; a best-effort policy
    /// yields the partial result, any other policy fails with
    /// `DeadlineExceeded`.
    pub async fn await_group(
        &self,
        receipt: &SubmissionReceipt,
        timeout: Duration,
    ) -> DelegorResult<AggregatedResult> {
        let group_id = receipt.group_id;
        if let Some(result) = self.poll(group_id).await {
            return Ok(result);
        }

        let mut rx = {
            let groups = self.groups.read().await;
            match groups.get(&group_id) {
                Some(state) => state.resolved_tx.subscribe(),
                None => {
                    return self.poll(group_id).await.ok_or_else(|| {
                        DelegorError::Orchestrator(format!("unknown group {group_id}"))
                    });
                }
            }
        };

        let wait = tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        match wait {
            Ok(()) => self.poll(group_id).await.ok_or_else(|| {
                DelegorError::Orchestrator(format!(
                    "group {group_id} resolved without a stored result"
                ))
            }),
            Err(_) => self.on_group_timeout(group_id).await,
        }
    }

    /// Fetch a resolved group's result by correlation id.
    pub async fn poll(&self, group_id: Uuid) -> Option<AggregatedResult> {
        self.completed.read().await.get(&group_id).cloned()
    }

    /// Cancel an unresolved group.
    ///
    /// Propagates a Cancelled marker through the ledger to every live member.
    /// In-flight executions are not killed; their late results are discarded
    /// once the members are terminal. Returns the closed-out result, or the
    /// stored one when the group had already resolved.
    pub async fn cancel_group(&self, receipt: &SubmissionReceipt) -> DelegorResult<AggregatedResult> {
        let group_id = receipt.group_id;
        match self.finalize_group(group_id, None, true).await {
            Some(result) => Ok(result),
            None => self.poll(group_id).await.ok_or_else(|| {
                DelegorError::Orchestrator(format!("unknown group {group_id}"))
            }),
        }
    }

    /// The push-delivery receiver, available once when `delivery = "push"`.
    pub async fn take_push_receiver(&self) -> Option<mpsc::Receiver<AggregatedResult>> {
        self.push_rx.lock().await.take()
    }

    /// Fold one upstream result into its group and resolve if possible.
    async fn on_result(&self, task_id: Uuid, outcome: TaskOutcome) {
        let group_id = {
            let index = self.index.read().await;
            match index.get(&task_id) {
                Some(group_id) => *group_id,
                None => return, // late result for an already-resolved group
            }
        };

        let resolution = {
            let mut groups = self.groups.write().await;
            let Some(state) = groups.get_mut(&group_id) else { return };
            state.outcomes.insert(task_id, outcome);

            let collected: Vec<TaskOutcome> = state.outcomes.values().cloned().collect();
            let counts = OutcomeCounts::tally(&collected, state.group.children.len());
            let resolution = state.group.policy.resolve(&counts);
            if resolution == GroupResolution::Unresolved {
                return;
            }
            resolution
        };

        self.finalize_group(group_id, Some(resolution), false).await;
    }

    /// Close a group out: cancel stragglers, compose the answer, store it,
    /// wake awaiters, and push when configured.
    async fn finalize_group(
        &self,
        group_id: Uuid,
        resolution: Option<GroupResolution>,
        timed_out: bool,
    ) -> Option<AggregatedResult> {
        let state = self.groups.write().await.remove(&group_id)?;
        {
            let mut index = self.index.write().await;
            for child in &state.group.children {
                index.remove(child);
            }
        }

        let mut results = Vec::with_capacity(state.group.children.len());
        for child in &state.group.children {
            let outcome = match state.outcomes.get(child) {
                Some(outcome) => outcome.clone(),
                None => {
                    let _ = self
                        .ledger
                        .transition(*child, |t| {
                            (!t.status.is_terminal()).then_some(TaskStatus::Cancelled)
                        })
                        .await;
                    TaskOutcome::Cancelled
                }
            };
            let Some(&domain) = state.domains.get(child) else { continue };
            results.push(DomainResult { task_id: *child, domain, outcome });
        }

        // On timeout every member is terminal now, so the policy decides.
        let resolution = resolution.unwrap_or_else(|| {
            let outcomes: Vec<TaskOutcome> = results.iter().map(|r| r.outcome.clone()).collect();
            let counts = OutcomeCounts::tally(&outcomes, state.group.children.len());
            state.group.policy.resolve(&counts)
        });

        let mut failed_domains = Vec::new();
        for result in &results {
            if !result.outcome.is_success() && !failed_domains.contains(&result.domain) {
                failed_domains.push(result.domain);
            }
        }
        let partial = timed_out
            || (resolution == GroupResolution::Succeeded && !failed_domains.is_empty());
        let validation = self.validator.validate(&results);

        let result = AggregatedResult {
            group_id,
            resolution,
            partial,
            results,
            failed_domains,
            validation,
            resolved_at: Utc::now(),
        };

        info!(
            group_id = %group_id,
            resolution = ?result.resolution,
            partial = result.partial,
            timed_out,
            quality = result.validation.quality_score,
            "group resolved"
        );

        self.completed.write().await.insert(group_id, result.clone());
        let _ = state.resolved_tx.send(true);
        if let Some(tx) = &self.push_tx {
            if tx.try_send(result.clone()).is_err() {
                warn!(group_id = %group_id, "push channel unavailable, result remains pollable");
            }
        }
        Some(result)
    }

    async fn on_group_timeout(&self, group_id: Uuid) -> DelegorResult<AggregatedResult> {
        let best_effort = {
            let groups = self.groups.read().await;
            match groups.get(&group_id) {
                Some(state) => {
                    matches!(state.group.policy, AggregationPolicy::BestEffort { .. })
                }
                // Resolved while we were timing out.
                None => {
                    return self.poll(group_id).await.ok_or_else(|| {
                        DelegorError::DeadlineExceeded(format!("group {group_id}"))
                    });
                }
            }
        };

        warn!(group_id = %group_id, best_effort, "group deadline exceeded");
        let result = self.finalize_group(group_id, None, true).await;
        match result {
            Some(result) if best_effort => Ok(result),
            Some(result) => Err(DelegorError::DeadlineExceeded(format!(
                "group {group_id} unresolved in time, failing domains: {:?}",
                result.failed_domains
            ))),
            None => self
                .poll(group_id)
                .await
                .ok_or_else(|| DelegorError::DeadlineExceeded(format!("group {group_id}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::classifier::HintClassifier;
    use delegor_bus::InMemoryBus;
    use delegor_core::Payload;

    fn orchestrator(config: CoordinatorConfig, bus: &InMemoryBus) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            config,
            Arc::new(TaskLedger::new()),
            Arc::new(bus.clone()),
            Arc::new(HintClassifier),
        ))
    }

    fn orchestrator_with_ledger(
        config: CoordinatorConfig,
        bus: &InMemoryBus,
        ledger: Arc<TaskLedger>,
    ) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            config,
            ledger,
            Arc::new(bus.clone()),
            Arc::new(HintClassifier),
        ))
    }

    fn text_request() -> Request {
        Request::single(Domain::Nlp, Payload::Text { text: "hello".into() })
    }

    #[tokio::test]
    async fn test_empty_request_is_validation_error() {
        let bus = InMemoryBus::new();
        let orch = orchestrator(CoordinatorConfig::default(), &bus);
        let err = orch.submit(Request::default()).await.unwrap_err();
        assert!(matches!(err, DelegorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_bus_traffic() {
        let bus = InMemoryBus::new();
        let mut config = CoordinatorConfig::default();
        config.circuit.unreachable_threshold = 2;
        config.circuit.cooldown_ms = 60_000;
        let orch = orchestrator(config, &bus);

        orch.record_health(Domain::Nlp, HealthStatus::Unreachable).await;
        orch.record_health(Domain::Nlp, HealthStatus::Unreachable).await;

        let err = orch.submit(text_request()).await.unwrap_err();
        assert!(matches!(err, DelegorError::DomainUnavailable(Domain::Nlp)));
        assert_eq!(bus.ready_len(&task_queue(Domain::Nlp)).await, 0);
        assert!(orch.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_submit_enqueues_pending_tasks() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let orch = orchestrator_with_ledger(CoordinatorConfig::default(), &bus, Arc::clone(&ledger));

        let receipt = orch.submit(text_request()).await.unwrap();
        assert_eq!(bus.ready_len(&task_queue(Domain::Nlp)).await, 1);

        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].task.status, TaskStatus::Pending);
        assert!(snapshot[0].task.is_root());
        assert!(orch.poll(receipt.group_id).await.is_none());
    }

    #[tokio::test]
    async fn test_result_report_resolves_group() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let orch = orchestrator_with_ledger(CoordinatorConfig::default(), &bus, Arc::clone(&ledger));
        let _handles = Arc::clone(&orch).start();

        let receipt = orch.submit(text_request()).await.unwrap();
        let task_id = ledger.snapshot().await[0].task.id;

        // Simulate the sub-master's upstream report.
        bus.publish(
            RESULTS_QUEUE,
            BusMessage::ResultReport {
                task_id,
                domain: Domain::Nlp,
                outcome: TaskOutcome::Succeeded { value: serde_json::json!({"n": 1}) },
            },
        )
        .await
        .unwrap();

        let result = orch
            .await_group(&receipt, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.resolution, GroupResolution::Succeeded);
        assert!(!result.partial);
        assert_eq!(result.results.len(), 1);
        assert!(result.failed_domains.is_empty());
        assert!((result.validation.quality_score - 1.0).abs() < f64::EPSILON);

        // Poll finds the same result afterwards.
        let polled = orch.poll(receipt.group_id).await.unwrap();
        assert_eq!(polled.group_id, result.group_id);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_timeout_all_succeed_is_deadline_exceeded() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let orch = orchestrator_with_ledger(CoordinatorConfig::default(), &bus, Arc::clone(&ledger));
        let _handles = Arc::clone(&orch).start();

        // Nobody consumes the task queue; the group can never resolve.
        let receipt = orch.submit(text_request()).await.unwrap();
        let err = orch
            .await_group(&receipt, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DelegorError::DeadlineExceeded(_)));

        // The unresolved member was cancelled in the ledger.
        let entry = ledger.snapshot().await.remove(0);
        assert_eq!(entry.task.status, TaskStatus::Cancelled);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_timeout_best_effort_returns_partial() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let orch = orchestrator_with_ledger(CoordinatorConfig::default(), &bus, Arc::clone(&ledger));
        let _handles = Arc::clone(&orch).start();

        let request = Request::default()
            .push(Some(Domain::Nlp), Payload::Text { text: "a".into() })
            .push(Some(Domain::Vision), Payload::Image { bytes: vec![1] })
            .with_policy(AggregationPolicy::BestEffort { max_failures: 2 });
        let receipt = orch.submit(request).await.unwrap();

        // Only the NLP member reports before the deadline.
        let nlp_id = ledger
            .snapshot()
            .await
            .into_iter()
            .find(|e| e.task.domain == Domain::Nlp)
            .unwrap()
            .task
            .id;
        bus.publish(
            RESULTS_QUEUE,
            BusMessage::ResultReport {
                task_id: nlp_id,
                domain: Domain::Nlp,
                outcome: TaskOutcome::Succeeded { value: serde_json::json!("ok") },
            },
        )
        .await
        .unwrap();

        let result = orch
            .await_group(&receipt, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(result.partial);
        assert_eq!(result.results.len(), 2);
        let cancelled = result
            .results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Cancelled))
            .count();
        assert_eq!(cancelled, 1);
        assert_eq!(result.failed_domains, vec![Domain::Vision]);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_push_delivery() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let config = CoordinatorConfig {
            delivery: DeliveryMode::Push,
            ..CoordinatorConfig::default()
        };
        let orch = orchestrator_with_ledger(config, &bus, Arc::clone(&ledger));
        let mut rx = orch.take_push_receiver().await.unwrap();
        let _handles = Arc::clone(&orch).start();

        let receipt = orch.submit(text_request()).await.unwrap();
        let task_id = ledger.snapshot().await[0].task.id;
        bus.publish(
            RESULTS_QUEUE,
            BusMessage::ResultReport {
                task_id,
                domain: Domain::Nlp,
                outcome: TaskOutcome::Succeeded { value: serde_json::json!(1) },
            },
        )
        .await
        .unwrap();

        let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.group_id, receipt.group_id);

        // The receiver is handed out exactly once.
        assert!(orch.take_push_receiver().await.is_none());
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_group_marks_members_cancelled() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let orch = orchestrator_with_ledger(CoordinatorConfig::default(), &bus, Arc::clone(&ledger));

        let receipt = orch.submit(text_request()).await.unwrap();
        let result = orch.cancel_group(&receipt).await.unwrap();
        assert_eq!(result.resolution, GroupResolution::Failed);
        assert!(matches!(result.results[0].outcome, TaskOutcome::Cancelled));

        let entry = ledger.snapshot().await.remove(0);
        assert_eq!(entry.task.status, TaskStatus::Cancelled);

        // Cancelling twice returns the stored result.
        let again = orch.cancel_group(&receipt).await.unwrap();
        assert_eq!(again.group_id, result.group_id);
    }

    #[tokio::test]
    async fn test_await_unknown_group() {
        let bus = InMemoryBus::new();
        let orch = orchestrator(CoordinatorConfig::default(), &bus);
        let receipt = SubmissionReceipt { group_id: Uuid::new_v4() };
        let err = orch
            .await_group(&receipt, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DelegorError::Orchestrator(_)));
    }
}
