//! Domain-scoped coordinator: decomposes delegated tasks, dispatches
//! sub-tasks across its agent pool, and aggregates child results.
//!
//! A sub-master owns one domain. It consumes its task queue, decomposes each
//! task through a pluggable [`Decomposer`], executes sub-tasks on the
//! least-loaded healthy pool member, retries failures with exponential
//! backoff, and reports the aggregated parent outcome upstream. All state
//! changes go through the ledger's versioned CAS; the in-memory child tracker
//! is a cache, never the source of truth.
//!
//! # Main types
//!
//! - [`SubMaster`] — The coordination loops for one domain.
//! - [`Decomposer`] / [`FanOutDecomposer`] — Decomposition strategy.

/// Decomposition strategies.
pub mod decompose;
/// Backoff computation and retryability classification.
pub mod retry;

pub use decompose::{Decomposer, FanOutDecomposer};
pub use retry::{compute_backoff, is_retryable};

use chrono::Utc;
use delegor_agent::{AgentExecutor, AgentPool, CapabilitySet};
use delegor_bus::{agent_queue, task_queue, BusMessage, MessageBus, HEALTH_QUEUE, RESULTS_QUEUE};
use delegor_core::{
    DelegorError, DelegorResult, Domain, DomainConfig, GroupResolution, OutcomeCounts, Task,
    TaskOutcome, TaskStatus,
};
use delegor_ledger::TaskLedger;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

struct ChildTracker {
    expected: Vec<Uuid>,
    outcomes: HashMap<Uuid, TaskOutcome>,
    resolved: bool,
}

/// The coordinator for one domain's pool of agent executors.
pub struct SubMaster {
    domain: Domain,
    config: DomainConfig,
    ledger: Arc<TaskLedger>,
    bus: Arc<dyn MessageBus>,
    pool: Arc<AgentPool>,
    executor: AgentExecutor,
    decomposer: Arc<dyn Decomposer>,
    children: RwLock<HashMap<Uuid, ChildTracker>>,
}

impl SubMaster {
    /// Create a sub-master with a fresh pool sized per `config`.
    pub fn new(
        domain: Domain,
        config: DomainConfig,
        ledger: Arc<TaskLedger>,
        bus: Arc<dyn MessageBus>,
        capabilities: CapabilitySet,
    ) -> Self {
        let pool = Arc::new(AgentPool::new(domain, config.pool_size));
        Self {
            domain,
            config,
            ledger,
            bus,
            pool,
            executor: AgentExecutor::new(capabilities),
            decomposer: Arc::new(FanOutDecomposer),
            children: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the default decomposition strategy.
    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = decomposer;
        self
    }

    /// The domain this sub-master serves.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// The agent pool (owned exclusively by this sub-master).
    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    /// Spawn the coordination loops: inbox, bounded workers, heartbeat.
    ///
    /// The loops run until the bus shuts down.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Inbox: decompose incoming domain tasks.
        {
            let sm = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let queue = task_queue(sm.domain);
                while let Some(delivery) = sm.bus.consume(&queue).await {
                    if let BusMessage::TaskAssignment { task } = delivery.envelope.message.clone() {
                        if let Err(err) = sm.handle(task).await {
                            error!(domain = %sm.domain, error = %err, "task handling failed");
                        }
                    } else {
                        warn!(domain = %sm.domain, "unexpected message on task queue");
                    }
                    let _ = sm.bus.ack(&delivery).await;
                }
            }));
        }

        // Bounded agent workers.
        for _worker in 0..self.config.concurrency.max(1) {
            let sm = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let queue = agent_queue(sm.domain);
                while let Some(delivery) = sm.bus.consume(&queue).await {
                    if let BusMessage::TaskAssignment { task } = &delivery.envelope.message {
                        sm.process_assignment(task.id).await;
                    } else {
                        warn!(domain = %sm.domain, "unexpected message on agent queue");
                    }
                    let _ = sm.bus.ack(&delivery).await;
                }
            }));
        }

        // Heartbeat: rolled-up pool health for the orchestrator's breaker.
        {
            let sm = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let interval = Duration::from_millis(sm.config.heartbeat_interval_ms.max(1));
                while !sm.bus.is_shutdown() {
                    let health = sm.pool.overall_health().await;
                    let _ = sm
                        .bus
                        .publish(
                            HEALTH_QUEUE,
                            BusMessage::Heartbeat { domain: sm.domain, health },
                        )
                        .await;
                    tokio::time::sleep(interval).await;
                }
            }));
        }

        handles
    }

    /// Decompose a delegated task, or route a leaf straight to the pool.
    ///
    /// The CAS on `Pending → Dispatched` elects one winner per task, so an
    /// at-least-once bus never decomposes the same task twice.
    async fn handle(&self, task: Task) -> DelegorResult<()> {
        self.ledger.create(task.clone()).await;

        let claimed = self
            .ledger
            .transition(task.id, |t| {
                matches!(t.status, TaskStatus::Pending).then_some(TaskStatus::Dispatched)
            })
            .await?;
        if claimed.is_none() {
            return Ok(());
        }

        let children = match self.decomposer.decompose(&task) {
            Ok(children) => children,
            Err(err) => {
                let reason = format!("decomposition failed: {err}");
                warn!(task_id = %task.id, domain = %self.domain, %reason, "sub-master");
                let r = reason.clone();
                let marked = self
                    .ledger
                    .transition(task.id, move |t| {
                        let next = TaskStatus::Failed { reason: r.clone() };
                        t.status.can_transition_to(&next).then_some(next)
                    })
                    .await?;
                if marked.is_some() {
                    self.publish_upstream(task.id, TaskOutcome::Failed { reason }).await;
                }
                return Ok(());
            }
        };

        if children.is_empty() {
            // Leaf: the task itself is the unit of execution.
            self.bus
                .publish(&agent_queue(self.domain), BusMessage::TaskAssignment { task })
                .await?;
            return Ok(());
        }

        info!(
            task_id = %task.id,
            domain = %self.domain,
            children = children.len(),
            "decomposed task"
        );

        for child in &children {
            self.ledger.create(child.clone()).await;
        }
        {
            let mut map = self.children.write().await;
            map.insert(
                task.id,
                ChildTracker {
                    expected: children.iter().map(|c| c.id).collect(),
                    outcomes: HashMap::new(),
                    resolved: false,
                },
            );
        }

        // Parent runs while its children execute; must happen before the
        // first child can complete, or its terminal CAS would be rejected.
        let _ = self
            .ledger
            .transition(task.id, |t| {
                matches!(t.status, TaskStatus::Dispatched).then_some(TaskStatus::Running)
            })
            .await;

        for child in children {
            let child_id = child.id;
            let _ = self
                .ledger
                .transition(child_id, |t| {
                    matches!(t.status, TaskStatus::Pending).then_some(TaskStatus::Dispatched)
                })
                .await;
            self.bus
                .publish(&agent_queue(self.domain), BusMessage::TaskAssignment { task: child })
                .await?;
        }

        Ok(())
    }

    /// Execute one assignment from the agent queue.
    async fn process_assignment(&self, task_id: Uuid) {
        let Some(entry) = self.ledger.get(task_id).await else {
            warn!(task_id = %task_id, "assignment for unknown task");
            return;
        };
        let task = entry.task;

        // Discard work whose parent already resolved (best-effort cancellation).
        if let Some(parent_id) = task.parent_id {
            if let Some(parent) = self.ledger.get(parent_id).await {
                if parent.task.status.is_terminal() {
                    let _ = self
                        .ledger
                        .transition(task_id, |t| {
                            (!t.status.is_terminal()).then_some(TaskStatus::Cancelled)
                        })
                        .await;
                    return;
                }
            }
        }

        if task.status.is_terminal() {
            return;
        }

        // Least-loaded healthy member; none means requeue, never drop.
        let Some(agent_id) = self.pool.least_loaded_healthy().await else {
            let delay = compute_backoff(&self.config.retry, 0);
            warn!(
                task_id = %task_id,
                domain = %self.domain,
                delay_ms = delay.as_millis() as u64,
                "no healthy agent, requeueing"
            );
            let _ = self
                .bus
                .publish_delayed(
                    &agent_queue(self.domain),
                    BusMessage::TaskAssignment { task },
                    delay,
                )
                .await;
            return;
        };

        // Single winner claims the execution; redelivered duplicates stop here.
        let claimed = self
            .ledger
            .transition(task_id, |t| {
                matches!(t.status, TaskStatus::Dispatched).then_some(TaskStatus::Running)
            })
            .await;
        if !matches!(claimed, Ok(Some(_))) {
            return;
        }

        // One attempt may use the earlier of the task deadline and the
        // per-attempt window, so a timed-out attempt leaves room to retry.
        let attempt_cap =
            Utc::now() + chrono::Duration::milliseconds(self.config.attempt_timeout_ms as i64);
        let attempt_deadline = if task.deadline < attempt_cap { task.deadline } else { attempt_cap };

        self.pool.begin(agent_id).await;
        let outcome = self.executor.execute(&task, attempt_deadline).await;
        self.pool.finish(agent_id).await;

        match outcome {
            Ok(value) => {
                if self.record_success(task_id, value.clone()).await {
                    self.report_terminal(&task, TaskOutcome::Succeeded { value }).await;
                }
            }
            Err(err) => {
                let reason = err.to_string();
                let retryable = is_retryable(&err);

                let r = reason.clone();
                let marked = self
                    .ledger
                    .transition(task_id, move |t| {
                        let next = TaskStatus::Failed { reason: r.clone() };
                        t.status.can_transition_to(&next).then_some(next)
                    })
                    .await;
                if !matches!(marked, Ok(Some(_))) {
                    return; // cancelled while running; result discarded
                }

                if retryable && self.try_retry(task_id).await {
                    return;
                }

                error!(task_id = %task_id, domain = %self.domain, %reason, "sub-task failed terminally");
                self.report_terminal(&task, TaskOutcome::Failed { reason }).await;
            }
        }
    }

    /// Consume one retry from the budget and re-dispatch after backoff.
    ///
    /// Returns `true` when the failure was absorbed (requeued or cancelled
    /// mid-retry), `false` when the budget is spent and the failure stands.
    async fn try_retry(&self, id: Uuid) -> bool {
        loop {
            let Some(entry) = self.ledger.get(id).await else { return false };
            if !matches!(entry.task.status, TaskStatus::Failed { .. }) {
                return false;
            }
            if entry.task.retry_count >= self.config.retry.max_retries {
                return false;
            }
            let delay = compute_backoff(&self.config.retry, entry.task.retry_count);

            match self.ledger.retry(id, entry.version).await {
                Ok(_) => {
                    let claimed = self
                        .ledger
                        .transition(id, |t| {
                            matches!(t.status, TaskStatus::Pending).then_some(TaskStatus::Dispatched)
                        })
                        .await;
                    if !matches!(claimed, Ok(Some(_))) {
                        return true; // cancelled between retry and re-dispatch
                    }
                    if let Some(fresh) = self.ledger.get(id).await {
                        info!(
                            task_id = %id,
                            domain = %self.domain,
                            retry = fresh.task.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "retrying sub-task"
                        );
                        let _ = self
                            .bus
                            .publish_delayed(
                                &agent_queue(self.domain),
                                BusMessage::TaskAssignment { task: fresh.task },
                                delay,
                            )
                            .await;
                    }
                    return true;
                }
                Err(DelegorError::VersionConflict { .. }) => continue,
                Err(err) => {
                    warn!(task_id = %id, error = %err, "retry bookkeeping failed");
                    return false;
                }
            }
        }
    }

    /// Route a terminal outcome: to the parent's tracker for sub-tasks, or
    /// straight upstream for directly-executed domain tasks.
    async fn report_terminal(&self, task: &Task, outcome: TaskOutcome) {
        match task.parent_id {
            Some(parent_id) => self.on_child_result(parent_id, task.id, outcome).await,
            None => self.publish_upstream(task.id, outcome).await,
        }
    }

    /// Fold one child outcome into the parent and resolve if possible.
    async fn on_child_result(&self, parent_id: Uuid, child_id: Uuid, outcome: TaskOutcome) {
        let (pairs, expected, resolution) = {
            let mut map = self.children.write().await;
            let Some(tracker) = map.get_mut(&parent_id) else {
                warn!(parent_id = %parent_id, child_id = %child_id, "result for untracked parent");
                return;
            };
            if tracker.resolved {
                return;
            }
            tracker.outcomes.insert(child_id, outcome);

            let collected: Vec<TaskOutcome> = tracker.outcomes.values().cloned().collect();
            let counts = OutcomeCounts::tally(&collected, tracker.expected.len());
            let resolution = self.config.aggregation.resolve(&counts);
            if resolution == GroupResolution::Unresolved {
                return;
            }
            tracker.resolved = true;
            let pairs: Vec<(Uuid, TaskOutcome)> = tracker
                .outcomes
                .iter()
                .map(|(id, o)| (*id, o.clone()))
                .collect();
            (pairs, tracker.expected.clone(), resolution)
        };

        // Siblings that can no longer affect the outcome are cancelled; any
        // still in flight will see the terminal parent and discard.
        for child in expected.iter().filter(|c| !pairs.iter().any(|(id, _)| id == *c)) {
            let _ = self
                .ledger
                .transition(*child, |t| {
                    (!t.status.is_terminal()).then_some(TaskStatus::Cancelled)
                })
                .await;
        }

        let parent_outcome = match resolution {
            GroupResolution::Succeeded => {
                let Some(parent) = self.ledger.get(parent_id).await else { return };
                let value = self.decomposer.aggregate(&parent.task, &pairs);
                if !self.record_success(parent_id, value.clone()).await {
                    return;
                }
                TaskOutcome::Succeeded { value }
            }
            GroupResolution::Failed => {
                let failed = pairs.iter().filter(|(_, o)| !o.is_success()).count();
                let reason = format!("{failed} of {} sub-tasks failed", expected.len());
                let r = reason.clone();
                let marked = self
                    .ledger
                    .transition(parent_id, move |t| {
                        let next = TaskStatus::Failed { reason: r.clone() };
                        t.status.can_transition_to(&next).then_some(next)
                    })
                    .await;
                if !matches!(marked, Ok(Some(_))) {
                    return;
                }
                TaskOutcome::Failed { reason }
            }
            GroupResolution::Unresolved => return,
        };

        self.children.write().await.remove(&parent_id);
        self.publish_upstream(parent_id, parent_outcome).await;
    }

    async fn publish_upstream(&self, task_id: Uuid, outcome: TaskOutcome) {
        let report = BusMessage::ResultReport {
            task_id,
            domain: self.domain,
            outcome,
        };
        if let Err(err) = self.bus.publish(RESULTS_QUEUE, report).await {
            error!(task_id = %task_id, error = %err, "failed to publish result upstream");
        }
    }

    /// Terminal success CAS, absorbing version conflicts. Returns `false`
    /// when the task can no longer succeed (e.g. cancelled meanwhile).
    async fn record_success(&self, id: Uuid, value: serde_json::Value) -> bool {
        loop {
            let Some(entry) = self.ledger.get(id).await else { return false };
            if !entry.task.status.can_transition_to(&TaskStatus::Succeeded) {
                return false;
            }
            match self.ledger.record_result(id, entry.version, value.clone()).await {
                Ok(_) => return true,
                Err(DelegorError::VersionConflict { .. }) => continue,
                Err(err) => {
                    warn!(task_id = %id, error = %err, "recording result failed");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use delegor_agent::{
        KnowledgeCapability, NlpCapability, PricingCapability, PricingDecision, RankedMatch,
        VisionCapability,
    };
    use delegor_bus::InMemoryBus;
    use delegor_core::{HealthStatus, Payload, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// NLP mock that fails the first `fail_times` calls with a capability
    /// fault, then succeeds.
    struct FlakyNlp {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NlpCapability for FlakyNlp {
        async fn process(&self, text: &str) -> DelegorResult<serde_json::Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(DelegorError::Capability("model unavailable".into()))
            } else {
                Ok(serde_json::json!({ "words": text.split_whitespace().count() }))
            }
        }
    }

    struct NoopVision;
    #[async_trait]
    impl VisionCapability for NoopVision {
        async fn extract_features(&self, _image: &[u8]) -> DelegorResult<Vec<f32>> {
            Ok(vec![0.0])
        }
    }

    struct NoopKnowledge;
    #[async_trait]
    impl KnowledgeCapability for NoopKnowledge {
        async fn query(&self, _query: &str) -> DelegorResult<Vec<RankedMatch>> {
            Ok(vec![])
        }
    }

    struct NoopPricing;
    #[async_trait]
    impl PricingCapability for NoopPricing {
        async fn evaluate(&self, _context: &serde_json::Value) -> DelegorResult<PricingDecision> {
            Ok(PricingDecision { approved: true, amount: 1.0, rationale: None })
        }
    }

    fn capabilities(fail_times: u32) -> CapabilitySet {
        CapabilitySet::new(
            Arc::new(FlakyNlp { fail_times, calls: AtomicU32::new(0) }),
            Arc::new(NoopVision),
            Arc::new(NoopKnowledge),
            Arc::new(NoopPricing),
        )
    }

    fn fast_config() -> DomainConfig {
        DomainConfig {
            pool_size: 2,
            concurrency: 2,
            attempt_timeout_ms: 500,
            heartbeat_interval_ms: 50,
            retry: RetryPolicy { max_retries: 2, backoff_base_ms: 20, backoff_max_ms: 200 },
            aggregation: delegor_core::AggregationPolicy::AllSucceed,
        }
    }

    fn leaf_task(text: &str) -> Task {
        Task::new(
            Domain::Nlp,
            Payload::Text { text: text.into() },
            Utc::now() + chrono::Duration::seconds(10),
        )
    }

    async fn submit_and_await_result(
        bus: &InMemoryBus,
        ledger: &Arc<TaskLedger>,
        task: Task,
    ) -> (Uuid, TaskOutcome) {
        ledger.create(task.clone()).await;
        bus.publish(&task_queue(Domain::Nlp), BusMessage::TaskAssignment { task })
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), bus.consume(RESULTS_QUEUE))
            .await
            .expect("result not published in time")
            .expect("bus shut down");
        bus.ack(&delivery).await.unwrap();
        match delivery.envelope.message {
            BusMessage::ResultReport { task_id, outcome, .. } => (task_id, outcome),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leaf_task_executes_and_reports_upstream() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let sm = Arc::new(SubMaster::new(
            Domain::Nlp,
            fast_config(),
            Arc::clone(&ledger),
            Arc::new(bus.clone()),
            capabilities(0),
        ));
        let _handles = Arc::clone(&sm).start();

        let task = leaf_task("three little words");
        let task_id = task.id;
        let (reported_id, outcome) = submit_and_await_result(&bus, &ledger, task).await;

        assert_eq!(reported_id, task_id);
        match outcome {
            TaskOutcome::Succeeded { value } => assert_eq!(value["words"], 3),
            other => panic!("expected success, got {other:?}"),
        }
        let entry = ledger.get(task_id).await.unwrap();
        assert_eq!(entry.task.status, TaskStatus::Succeeded);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_batch_decomposes_and_aggregates() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let sm = Arc::new(SubMaster::new(
            Domain::Nlp,
            fast_config(),
            Arc::clone(&ledger),
            Arc::new(bus.clone()),
            capabilities(0),
        ));
        let _handles = Arc::clone(&sm).start();

        let items = vec![
            Payload::Text { text: "one".into() },
            Payload::Text { text: "two words".into() },
            Payload::Text { text: "now three words".into() },
        ];
        let task = Task::new(
            Domain::Nlp,
            Payload::Batch { items },
            Utc::now() + chrono::Duration::seconds(10),
        );
        let parent_id = task.id;
        let (reported_id, outcome) = submit_and_await_result(&bus, &ledger, task).await;

        assert_eq!(reported_id, parent_id);
        match outcome {
            TaskOutcome::Succeeded { value } => {
                assert_eq!(value["total"], 3);
                assert_eq!(value["succeeded"], 3);
                assert_eq!(value["failed"], 0);
            }
            other => panic!("expected success, got {other:?}"),
        }

        // Parent + 3 children, all terminal successes.
        assert_eq!(ledger.len().await, 4);
        for entry in ledger.snapshot().await {
            assert_eq!(entry.task.status, TaskStatus::Succeeded);
        }
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_always_failing_task_retried_exactly_max_retries() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let sm = Arc::new(SubMaster::new(
            Domain::Nlp,
            fast_config(),
            Arc::clone(&ledger),
            Arc::new(bus.clone()),
            capabilities(u32::MAX),
        ));
        let _handles = Arc::clone(&sm).start();

        let task = leaf_task("doomed");
        let task_id = task.id;
        let (_, outcome) = submit_and_await_result(&bus, &ledger, task).await;

        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
        let entry = ledger.get(task_id).await.unwrap();
        assert!(matches!(entry.task.status, TaskStatus::Failed { .. }));
        assert_eq!(entry.task.retry_count, 2, "retried exactly max_retries times");

        // No further retries: the queue drains and the count stays put.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let entry = ledger.get(task_id).await.unwrap();
        assert_eq!(entry.task.retry_count, 2);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_flaky_task_succeeds_after_backoff() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let sm = Arc::new(SubMaster::new(
            Domain::Nlp,
            fast_config(),
            Arc::clone(&ledger),
            Arc::new(bus.clone()),
            capabilities(1),
        ));
        let _handles = Arc::clone(&sm).start();

        let start = std::time::Instant::now();
        let task = leaf_task("eventually fine");
        let task_id = task.id;
        let (_, outcome) = submit_and_await_result(&bus, &ledger, task).await;

        assert!(outcome.is_success());
        assert!(
            start.elapsed() >= Duration::from_millis(20),
            "at least one backoff interval must elapse"
        );
        assert_eq!(ledger.get(task_id).await.unwrap().task.retry_count, 1);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_no_healthy_agent_requeues_instead_of_dropping() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let sm = Arc::new(SubMaster::new(
            Domain::Nlp,
            fast_config(),
            Arc::clone(&ledger),
            Arc::new(bus.clone()),
            capabilities(0),
        ));

        // Knock every pool member out before starting the loops.
        for handle in sm.pool().snapshot().await {
            sm.pool().set_health(handle.id, HealthStatus::Unreachable).await;
        }
        let _handles = Arc::clone(&sm).start();

        let task = leaf_task("parked");
        let task_id = task.id;
        ledger.create(task.clone()).await;
        bus.publish(&task_queue(Domain::Nlp), BusMessage::TaskAssignment { task })
            .await
            .unwrap();

        // The task must survive, undropped and non-terminal.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let entry = ledger.get(task_id).await.unwrap();
        assert!(!entry.task.status.is_terminal());

        // Recovery: one healthy member is enough to finish the work.
        let member = sm.pool().snapshot().await[0].id;
        sm.pool().set_health(member, HealthStatus::Healthy).await;

        let delivery = tokio::time::timeout(Duration::from_secs(5), bus.consume(RESULTS_QUEUE))
            .await
            .expect("requeued task never completed")
            .unwrap();
        match delivery.envelope.message {
            BusMessage::ResultReport { outcome, .. } => assert!(outcome.is_success()),
            other => panic!("unexpected message {other:?}"),
        }
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_heartbeats_report_pool_health() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let sm = Arc::new(SubMaster::new(
            Domain::Nlp,
            fast_config(),
            ledger,
            Arc::new(bus.clone()),
            capabilities(0),
        ));
        let _handles = Arc::clone(&sm).start();

        let delivery = tokio::time::timeout(Duration::from_secs(2), bus.consume(HEALTH_QUEUE))
            .await
            .expect("no heartbeat observed")
            .unwrap();
        match delivery.envelope.message {
            BusMessage::Heartbeat { domain, health } => {
                assert_eq!(domain, Domain::Nlp);
                assert_eq!(health, HealthStatus::Healthy);
            }
            other => panic!("unexpected message {other:?}"),
        }
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_delivery_decomposes_once() {
        let bus = InMemoryBus::new();
        let ledger = Arc::new(TaskLedger::new());
        let sm = Arc::new(SubMaster::new(
            Domain::Nlp,
            fast_config(),
            Arc::clone(&ledger),
            Arc::new(bus.clone()),
            capabilities(0),
        ));
        let _handles = Arc::clone(&sm).start();

        let items = vec![Payload::Text { text: "a".into() }, Payload::Text { text: "b".into() }];
        let task = Task::new(
            Domain::Nlp,
            Payload::Batch { items },
            Utc::now() + chrono::Duration::seconds(10),
        );
        ledger.create(task.clone()).await;

        // The same assignment twice, as an at-least-once bus may deliver it.
        bus.publish(&task_queue(Domain::Nlp), BusMessage::TaskAssignment { task: task.clone() })
            .await
            .unwrap();
        bus.publish(&task_queue(Domain::Nlp), BusMessage::TaskAssignment { task })
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), bus.consume(RESULTS_QUEUE))
            .await
            .expect("no result")
            .unwrap();
        bus.ack(&delivery).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Exactly one parent and two children; duplicates created nothing.
        assert_eq!(ledger.len().await, 3);
        // And exactly one upstream report.
        assert_eq!(bus.ready_len(RESULTS_QUEUE).await, 0);
        bus.shutdown();
    }
}
