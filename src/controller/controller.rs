use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::enhanced::{EnhancedBusConfig, EnhancedMessage, EnhancedMessageBus};
use crate::bus::circuit_breaker::BreakerConfig;
use crate::bus::message::{
    AlertSeverity, CoordinationSignal, LifecycleEvent, Message, MessageContent,
};
use crate::bus::message_bus::{MessageBus, MessageBusConfig, MessageBusStats};
use crate::controller::process::{LaunchSpec, ProcessHandle, ProcessLauncher};
use crate::controller::task_queue::{AgentTask, TaskQueue, TaskQueueStats};
use crate::coordination::auction::AuctionConfig;
use crate::coordination::consensus::ConsensusConfig;
use crate::coordination::manager::{
    CoordinationConfig, CoordinationManager, CoordinationPattern, CoordinationState,
    CoordinationStats,
};
use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};
use crate::monitor::resource_monitor::{MonitorConfig, ResourceMonitor};
use crate::monitor::sampler::ResourceSampler;
use crate::registry::{AgentRecord, AgentRegistry, RegistryConfig, RegistryStats};
use crate::shared::context::SystemContext;
use crate::shared::scheduler::Scheduler;
use crate::store::MessageStore;
use crate::types::{AgentState, ResourceVector, RoutingStrategy};

/// Everything needed to create and run one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub zone: String,
    pub capabilities: Vec<String>,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub mailbox_capacity: Option<usize>,
    pub concurrency_cap: Option<usize>,
    pub resource_limits: Option<ResourceVector>,
}

/// Point-in-time view of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub record: AgentRecord,
    pub assigned_tasks: usize,
    pub has_process: bool,
}

/// Aggregate view across the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub registry: RegistryStats,
    pub queue: TaskQueueStats,
    pub coordination_completed: u64,
    pub coordination_failed: u64,
    pub active_workflows: usize,
    pub bus_total_messages: u64,
    pub bus_failed_deliveries: u64,
    pub uptime_secs: i64,
}

/// Composition root: owns agent specs and process handles, the priority
/// task queue, per-agent assignment sets and workflow tracking, and runs
/// the background jobs that keep the system honest.
pub struct Controller {
    context: SystemContext,
    bus: Arc<MessageBus>,
    enhanced: Arc<EnhancedMessageBus>,
    registry: Arc<AgentRegistry>,
    monitor: Arc<ResourceMonitor>,
    coordinator: Arc<CoordinationManager>,
    scheduler: Scheduler,
    launcher: Arc<dyn ProcessLauncher>,
    store: Option<Arc<MessageStore>>,
    specs: RwLock<HashMap<String, AgentSpec>>,
    handles: RwLock<HashMap<String, Box<dyn ProcessHandle>>>,
    assignments: RwLock<HashMap<String, HashSet<Uuid>>>,
    queue: TaskQueue,
    watched_workflows: RwLock<HashSet<Uuid>>,
    last_restart: RwLock<HashMap<String, DateTime<Utc>>>,
    rr_counter: AtomicU64,
}

impl Controller {
    pub async fn new(
        context: SystemContext,
        launcher: Arc<dyn ProcessLauncher>,
        sampler: Arc<dyn ResourceSampler>,
        store: Option<Arc<MessageStore>>,
    ) -> Arc<Self> {
        let cfg = context.get_config().await;

        let bus = Arc::new(MessageBus::new(MessageBusConfig {
            default_capacity: cfg.mailbox_capacity,
            history_size: cfg.history_size,
        }));
        let registry = Arc::new(AgentRegistry::new(
            RegistryConfig {
                heartbeat_timeout_secs: cfg.heartbeat_timeout_secs,
                sweep_interval_secs: cfg.registry_sweep_secs,
            },
            Some(bus.clone()),
        ));
        let enhanced = Arc::new(EnhancedMessageBus::new(
            bus.clone(),
            registry.clone(),
            store.clone(),
            EnhancedBusConfig {
                breaker: BreakerConfig {
                    failure_threshold: cfg.breaker_failure_threshold,
                    cooldown_secs: cfg.breaker_cooldown_secs,
                },
                ..Default::default()
            },
        ));
        let monitor = Arc::new(ResourceMonitor::new(
            sampler,
            registry.clone(),
            Some(bus.clone()),
            MonitorConfig {
                sweep_interval_secs: cfg.resource_sweep_secs,
                retention_secs: cfg.usage_retention_secs,
                recommend_window_secs: cfg.recommend_window_secs,
                warning_fraction: cfg.warning_fraction,
                critical_fraction: cfg.critical_fraction,
                ..Default::default()
            },
        ));
        let coordinator = Arc::new(CoordinationManager::new(
            bus.clone(),
            registry.clone(),
            store.clone(),
            CoordinationConfig {
                default_timeout_secs: cfg.coordination_timeout_secs,
                step_timeout_secs: cfg.step_timeout_secs,
                consensus: ConsensusConfig {
                    quorum_fraction: cfg.quorum_fraction,
                    approval_fraction: cfg.approval_fraction,
                    default_window_secs: cfg.coordination_timeout_secs,
                },
                auction: AuctionConfig {
                    confidence_weight: cfg.confidence_weight,
                    default_window_secs: cfg.coordination_timeout_secs,
                },
            },
        ));

        Arc::new(Self {
            context,
            bus,
            enhanced,
            registry,
            monitor,
            coordinator,
            scheduler: Scheduler::new(),
            launcher,
            store,
            specs: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            queue: TaskQueue::new(),
            watched_workflows: RwLock::new(HashSet::new()),
            last_restart: RwLock::new(HashMap::new()),
            rr_counter: AtomicU64::new(0),
        })
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn enhanced_bus(&self) -> &Arc<EnhancedMessageBus> {
        &self.enhanced
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &Arc<CoordinationManager> {
        &self.coordinator
    }

    /// Register every background job on the shared scheduler.
    pub async fn start(self: &Arc<Self>) {
        let cfg = self.context.get_config().await;

        let registry = self.registry.clone();
        self.scheduler
            .register(
                "registry.health",
                StdDuration::from_secs(cfg.registry_sweep_secs),
                move || {
                    let registry = registry.clone();
                    async move { registry.sweep_health().await.map(|_| ()) }
                },
            )
            .await;

        let monitor = self.monitor.clone();
        self.scheduler
            .register(
                "monitor.resources",
                StdDuration::from_secs(cfg.resource_sweep_secs),
                move || {
                    let monitor = monitor.clone();
                    async move { monitor.sweep().await }
                },
            )
            .await;

        let coordinator = self.coordinator.clone();
        self.scheduler
            .register(
                "coordination.deadlines",
                StdDuration::from_secs(cfg.coordination_sweep_secs),
                move || {
                    let coordinator = coordinator.clone();
                    async move { coordinator.sweep().await }
                },
            )
            .await;

        let enhanced = self.enhanced.clone();
        self.scheduler
            .register(
                "bus.expiry",
                StdDuration::from_secs(cfg.monitor_interval_secs),
                move || {
                    let enhanced = enhanced.clone();
                    async move { enhanced.sweep_expiry().await }
                },
            )
            .await;

        let controller = Arc::clone(self);
        self.scheduler
            .register(
                "controller.dispatch",
                StdDuration::from_secs(cfg.dispatch_interval_secs),
                move || {
                    let controller = controller.clone();
                    async move { controller.dispatch_cycle().await }
                },
            )
            .await;

        let controller = Arc::clone(self);
        self.scheduler
            .register(
                "controller.processes",
                StdDuration::from_secs(cfg.monitor_interval_secs),
                move || {
                    let controller = controller.clone();
                    async move { controller.process_cycle().await }
                },
            )
            .await;

        let controller = Arc::clone(self);
        self.scheduler
            .register(
                "controller.health_ping",
                StdDuration::from_secs(cfg.health_ping_interval_secs),
                move || {
                    let controller = controller.clone();
                    async move { controller.health_ping_cycle().await }
                },
            )
            .await;

        let controller = Arc::clone(self);
        self.scheduler
            .register(
                "controller.timeouts",
                StdDuration::from_secs(cfg.monitor_interval_secs),
                move || {
                    let controller = controller.clone();
                    async move { controller.timeout_cycle().await }
                },
            )
            .await;

        let controller = Arc::clone(self);
        self.scheduler
            .register(
                "controller.workflows",
                StdDuration::from_secs(cfg.monitor_interval_secs),
                move || {
                    let controller = controller.clone();
                    async move { controller.workflow_cycle().await }
                },
            )
            .await;

        info!("controller started");
    }

    /// Stop the background jobs and every running agent.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let agent_ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        for agent_id in agent_ids {
            if let Err(e) = self.stop_agent(&agent_id, true).await {
                warn!("stopping {} during shutdown failed: {}", agent_id, e);
            }
        }
        info!("controller shut down");
    }

    // ------------------------------------------------------------------
    // Agent lifecycle
    // ------------------------------------------------------------------

    /// Persist the spec and register a stopped discovery record.
    pub async fn create_agent(&self, spec: AgentSpec) -> Result<()> {
        let agent_id = spec.agent_id.clone();
        if self.specs.read().await.contains_key(&agent_id) {
            return Err(Error::CoordError(CoordError::InvalidState(format!(
                "agent {} already exists",
                agent_id
            ))));
        }

        self.bus.register(&agent_id, spec.mailbox_capacity).await;
        let record = AgentRecord::new(
            &agent_id,
            &spec.name,
            &spec.role,
            &spec.zone,
            spec.capabilities.iter().cloned(),
        );
        self.registry.register(record).await?;

        if let Some(limits) = spec.resource_limits {
            self.monitor.set_limit(&agent_id, limits).await;
        }
        if let Some(store) = &self.store {
            for capability in &spec.capabilities {
                if let Err(e) = store.record_capability(&agent_id, capability, 1.0).await {
                    debug!("capability {} not persisted: {}", capability, e);
                }
            }
        }

        self.specs.write().await.insert(agent_id.clone(), spec);
        self.broadcast_lifecycle(&agent_id, LifecycleEvent::Created).await;
        info!("agent {} created", agent_id);
        Ok(())
    }

    pub async fn start_agent(&self, agent_id: &str) -> Result<()> {
        let spec = self
            .specs
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;
        if self.handles.read().await.contains_key(agent_id) {
            return Err(Error::CoordError(CoordError::InvalidState(format!(
                "agent {} is already running",
                agent_id
            ))));
        }

        self.registry.update_state(agent_id, AgentState::Starting).await?;
        let launch = LaunchSpec {
            command: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            working_dir: None,
        };
        let handle = match self.launcher.launch(&launch).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.update_state(agent_id, AgentState::Error).await?;
                self.registry.record_error(agent_id).await?;
                return Err(e);
            }
        };

        let pid = handle.pid();
        self.handles.write().await.insert(agent_id.to_string(), handle);
        self.registry.update_pid(agent_id, pid).await?;
        self.registry.heartbeat(agent_id, None).await?;
        self.registry.update_state(agent_id, AgentState::Running).await?;

        self.broadcast_lifecycle(agent_id, LifecycleEvent::Started).await;
        info!("agent {} started (pid {:?})", agent_id, pid);
        Ok(())
    }

    /// Stop an agent. A graceful stop sends a shutdown message over the
    /// bus and waits out the grace period before force-terminating.
    pub async fn stop_agent(&self, agent_id: &str, graceful: bool) -> Result<()> {
        let mut handle = self
            .handles
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| {
                Error::CoordError(CoordError::InvalidState(format!(
                    "agent {} is not running",
                    agent_id
                )))
            })?;

        self.registry.update_state(agent_id, AgentState::Stopping).await?;
        let mut exited = false;

        if graceful {
            let shutdown = Message::new(
                "controller",
                agent_id,
                MessageContent::Coordination {
                    signal: CoordinationSignal::Shutdown {
                        reason: "stop requested".into(),
                    },
                },
            );
            if let Err(e) = self.bus.send(shutdown).await {
                debug!("shutdown message to {} failed: {}", agent_id, e);
            }

            let grace = self.context.get_config().await.grace_period_secs;
            let deadline = tokio::time::Instant::now() + StdDuration::from_secs(grace);
            while tokio::time::Instant::now() < deadline {
                match handle.try_wait().await {
                    Ok(Some(_)) => {
                        exited = true;
                        break;
                    }
                    Ok(None) => tokio::time::sleep(StdDuration::from_millis(100)).await,
                    Err(_) => break,
                }
            }
        }

        if !exited {
            if let Err(e) = handle.terminate().await {
                debug!("terminate of {} failed: {}", agent_id, e);
            }
            if let Err(e) = handle.force_kill().await {
                warn!("force kill of {} failed: {}", agent_id, e);
            }
        }

        self.registry.update_pid(agent_id, None).await?;
        self.registry.update_state(agent_id, AgentState::Stopped).await?;
        self.broadcast_lifecycle(agent_id, LifecycleEvent::Stopped).await;
        info!("agent {} stopped (graceful: {})", agent_id, graceful);
        Ok(())
    }

    /// Restart, gated by a cooldown so a crashing agent cannot storm.
    pub async fn restart_agent(&self, agent_id: &str) -> Result<()> {
        let cooldown = self.context.get_config().await.restart_cooldown_secs;
        let now = Utc::now();
        {
            let mut last_restart = self.last_restart.write().await;
            if let Some(last) = last_restart.get(agent_id)
                && now - *last < Duration::seconds(cooldown)
            {
                return Err(Error::CoordError(CoordError::RestartCooldown(
                    agent_id.to_string(),
                )));
            }
            last_restart.insert(agent_id.to_string(), now);
        }

        match self.stop_agent(agent_id, true).await {
            Ok(()) => {}
            Err(Error::CoordError(CoordError::InvalidState(_))) => {} // not running
            Err(e) => return Err(e),
        }
        self.start_agent(agent_id).await?;
        self.broadcast_lifecycle(agent_id, LifecycleEvent::Restarted).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Assign a task to an explicit agent. Overflow past the concurrency
    /// cap is queued, never dropped.
    pub async fn assign_task(&self, task: AgentTask, agent_id: &str) -> Result<Uuid> {
        let task_id = task.task_id;
        let task = task.for_agent(agent_id);

        if !self.has_capacity(agent_id).await {
            debug!("agent {} at capacity, queueing {}", agent_id, task_id);
            self.queue.enqueue(task).await;
            return Ok(task_id);
        }

        match self.dispatch_to(task.clone(), agent_id).await {
            Ok(()) => Ok(task_id),
            Err(e) => {
                debug!("dispatch of {} failed ({}), queueing", task_id, e);
                self.queue.enqueue(task).await;
                Ok(task_id)
            }
        }
    }

    /// Resolve a target by capability and strategy, then assign. With no
    /// eligible agent the task is queued for the dispatcher.
    pub async fn auto_assign_task(
        &self,
        task: AgentTask,
        strategy: RoutingStrategy,
    ) -> Result<Uuid> {
        let task_id = task.task_id;
        match self.pick_target(&task, strategy).await {
            Some(agent_id) => {
                let task = task.for_agent(&agent_id);
                match self.dispatch_to(task.clone(), &agent_id).await {
                    Ok(()) => Ok(task_id),
                    Err(e) => {
                        debug!("dispatch of {} failed ({}), queueing", task_id, e);
                        self.queue.enqueue(task).await;
                        Ok(task_id)
                    }
                }
            }
            None => {
                debug!("no eligible agent for {}, queueing", task_id);
                self.queue.enqueue(task).await;
                Ok(task_id)
            }
        }
    }

    /// Report a task finished. Failed tasks with retry budget left are
    /// requeued.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        success: bool,
        error: Option<String>,
    ) -> Result<()> {
        if success {
            let task = self.queue.mark_completed(task_id).await?;
            self.release_assignment(&task, task_id).await;
            return Ok(());
        }

        let task = self
            .queue
            .mark_failed(task_id, error.unwrap_or_else(|| "unspecified".into()))
            .await?;
        self.release_assignment(&task, task_id).await;

        if task.retry_count < task.max_retries {
            let mut retry = task.clone();
            retry.retry_count += 1;
            retry.agent_id = None;
            retry.assigned_at = None;
            info!(
                "task {} retrying ({}/{})",
                task_id, retry.retry_count, retry.max_retries
            );
            self.queue.enqueue(retry).await;
        }
        Ok(())
    }

    pub async fn task_status(&self, task_id: Uuid) -> Option<AgentTask> {
        self.queue.get(task_id).await
    }

    // ------------------------------------------------------------------
    // Coordination passthrough
    // ------------------------------------------------------------------

    pub async fn create_workflow(
        self: &Arc<Self>,
        pattern: CoordinationPattern,
        participants: Vec<String>,
        input: serde_json::Value,
        timeout_secs: Option<u64>,
    ) -> Result<Uuid> {
        let workflow_id = self
            .coordinator
            .start_workflow(pattern, participants, input, timeout_secs)
            .await?;
        self.watched_workflows.write().await.insert(workflow_id);
        Ok(workflow_id)
    }

    pub async fn request_consensus(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
        participants: Vec<String>,
        window_secs: Option<u64>,
    ) -> Result<Uuid> {
        self.coordinator
            .consensus()
            .propose("controller", topic, payload, participants, window_secs)
            .await
    }

    pub async fn start_auction(
        &self,
        task: serde_json::Value,
        required_capabilities: Vec<String>,
        window_secs: Option<u64>,
    ) -> Result<Uuid> {
        self.coordinator
            .auctions()
            .start_auction(task, required_capabilities, window_secs)
            .await
    }

    // ------------------------------------------------------------------
    // Discovery and status
    // ------------------------------------------------------------------

    pub async fn register_capabilities(
        &self,
        agent_id: &str,
        capabilities: Vec<String>,
    ) -> Result<()> {
        self.registry
            .update_capabilities(agent_id, capabilities.iter().cloned())
            .await?;
        if let Some(store) = &self.store {
            for capability in &capabilities {
                if let Err(e) = store.record_capability(agent_id, capability, 1.0).await {
                    debug!("capability {} not persisted: {}", capability, e);
                }
            }
        }
        Ok(())
    }

    pub async fn discover_by_capability(&self, capabilities: &[String]) -> Vec<AgentRecord> {
        self.registry.find_capable(capabilities).await
    }

    pub async fn agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        let record = self
            .registry
            .get_agent(agent_id)
            .await
            .ok_or_else(|| Error::CoordError(CoordError::AgentNotFound(agent_id.to_string())))?;
        Ok(AgentStatus {
            assigned_tasks: self
                .assignments
                .read()
                .await
                .get(agent_id)
                .map(|set| set.len())
                .unwrap_or(0),
            has_process: self.handles.read().await.contains_key(agent_id),
            record,
        })
    }

    pub async fn system_status(&self) -> SystemStatus {
        let bus_stats: MessageBusStats = self.bus.stats().await;
        let coordination: CoordinationStats = self.coordinator.stats().await;
        SystemStatus {
            registry: self.registry.stats().await,
            queue: self.queue.stats().await,
            coordination_completed: coordination.tasks_completed,
            coordination_failed: coordination.tasks_failed,
            active_workflows: self.watched_workflows.read().await.len(),
            bus_total_messages: bus_stats.total_messages,
            bus_failed_deliveries: bus_stats.failed_deliveries,
            uptime_secs: (Utc::now() - self.context.runtime_info.start_time).num_seconds(),
        }
    }

    // ------------------------------------------------------------------
    // Background cycles
    // ------------------------------------------------------------------

    /// Drain the pending queue in priority order, stopping at the first
    /// task that still has no eligible target.
    async fn dispatch_cycle(&self) -> Result<()> {
        while let Some(task) = self.queue.dequeue().await {
            let target = match &task.agent_id {
                Some(agent_id) if self.has_capacity(agent_id).await => Some(agent_id.clone()),
                Some(_) => None,
                None => {
                    self.pick_target(&task, RoutingStrategy::CapabilityBased)
                        .await
                }
            };

            match target {
                Some(agent_id) => {
                    let task = task.for_agent(&agent_id);
                    if let Err(e) = self.dispatch_to(task.clone(), &agent_id).await {
                        debug!("dispatch failed ({}), requeueing", e);
                        self.queue.requeue_front(task).await;
                        break;
                    }
                }
                None => {
                    self.queue.requeue_front(task).await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Detect dead agent processes, flag them, and optionally restart.
    async fn process_cycle(&self) -> Result<()> {
        let mut exited = Vec::new();
        {
            let mut handles = self.handles.write().await;
            let agent_ids: Vec<String> = handles.keys().cloned().collect();
            for agent_id in agent_ids {
                let Some(handle) = handles.get_mut(&agent_id) else {
                    continue;
                };
                if let Ok(Some(code)) = handle.try_wait().await {
                    exited.push((agent_id, code));
                }
            }
            for (agent_id, _) in &exited {
                handles.remove(agent_id);
            }
        }

        let auto_restart = self.context.get_config().await.auto_restart;
        for (agent_id, code) in exited {
            warn!("agent {} process exited with code {}", agent_id, code);
            self.registry.update_state(&agent_id, AgentState::Error).await?;
            self.registry.update_pid(&agent_id, None).await?;
            self.registry.record_error(&agent_id).await?;

            let alert = Message::broadcast(
                "controller",
                MessageContent::Alert {
                    severity: AlertSeverity::Critical,
                    source: "controller".into(),
                    message: format!("agent {} process died (exit {})", agent_id, code),
                },
            );
            self.bus.broadcast(alert, Some("alerts")).await;
            self.broadcast_lifecycle(&agent_id, LifecycleEvent::Crashed).await;

            if auto_restart
                && let Err(e) = self.restart_agent(&agent_id).await
            {
                debug!("auto-restart of {} skipped: {}", agent_id, e);
            }
        }
        Ok(())
    }

    /// Ping every running agent so silent ones show up in the registry
    /// sweep.
    async fn health_ping_cycle(&self) -> Result<()> {
        for record in self.registry.find_by_state(AgentState::Running).await {
            let ping = Message::new(
                "controller",
                &record.agent_id,
                MessageContent::Coordination {
                    signal: CoordinationSignal::Ping,
                },
            );
            if let Err(e) = self.bus.send(ping).await {
                debug!("ping to {} failed: {}", record.agent_id, e);
            }
        }
        Ok(())
    }

    /// Drive overdue assigned tasks to their terminal timeout state.
    async fn timeout_cycle(&self) -> Result<()> {
        let overall = self.context.get_config().await.task_timeout_secs;
        for task_id in self.queue.overdue_assigned(Utc::now(), overall).await {
            let Ok(task) = self.queue.mark_timeout(task_id).await else {
                continue;
            };
            warn!("task {} timed out on {:?}", task_id, task.agent_id);
            self.release_assignment(&task, task_id).await;

            let alert = Message::broadcast(
                "controller",
                MessageContent::Alert {
                    severity: AlertSeverity::Warning,
                    source: "controller".into(),
                    message: format!("task {} timed out", task_id),
                },
            );
            self.bus.broadcast(alert, Some("alerts")).await;
        }
        Ok(())
    }

    /// Notify participants of workflows that reached a terminal state.
    async fn workflow_cycle(&self) -> Result<()> {
        let watched: Vec<Uuid> = self.watched_workflows.read().await.iter().copied().collect();
        for workflow_id in watched {
            let Some(task) = self.coordinator.get_task(workflow_id).await else {
                self.watched_workflows.write().await.remove(&workflow_id);
                continue;
            };
            if !task.state.is_terminal() {
                continue;
            }

            for participant in &task.participants {
                let update = Message::new(
                    "controller",
                    participant,
                    MessageContent::Coordination {
                        signal: CoordinationSignal::WorkflowUpdate {
                            workflow_id,
                            completed: task.state == CoordinationState::Completed,
                            detail: task.error.clone(),
                        },
                    },
                );
                if let Err(e) = self.bus.send(update).await {
                    debug!("workflow update to {} failed: {}", participant, e);
                }
            }
            self.watched_workflows.write().await.remove(&workflow_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn concurrency_cap(&self, agent_id: &str) -> usize {
        let default_cap = self.context.get_config().await.concurrency_cap;
        self.specs
            .read()
            .await
            .get(agent_id)
            .and_then(|spec| spec.concurrency_cap)
            .unwrap_or(default_cap)
    }

    async fn has_capacity(&self, agent_id: &str) -> bool {
        let cap = self.concurrency_cap(agent_id).await;
        let assigned = self
            .assignments
            .read()
            .await
            .get(agent_id)
            .map(|set| set.len())
            .unwrap_or(0);
        assigned < cap
    }

    /// Eligible target for a task: healthy, capable, running, under cap.
    async fn pick_target(&self, task: &AgentTask, strategy: RoutingStrategy) -> Option<String> {
        let mut candidates: Vec<String> = Vec::new();
        for record in self.registry.find_capable(&task.required_capabilities).await {
            if !matches!(record.state, AgentState::Running | AgentState::Busy) {
                continue;
            }
            if self.has_capacity(&record.agent_id).await {
                candidates.push(record.agent_id);
            }
        }
        if candidates.is_empty() {
            return None;
        }
        candidates.sort();

        let assignments = self.assignments.read().await;
        let chosen = match strategy {
            RoutingStrategy::LoadBalanced => candidates
                .into_iter()
                .min_by_key(|id| assignments.get(id).map(|set| set.len()).unwrap_or(0))?,
            RoutingStrategy::RoundRobin => {
                let index =
                    self.rr_counter.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
                candidates[index].clone()
            }
            _ => candidates[0].clone(),
        };
        Some(chosen)
    }

    /// Reserve the assignment slot and deliver the task request. The
    /// enhanced bus applies the destination breaker on the way out.
    async fn dispatch_to(&self, task: AgentTask, agent_id: &str) -> Result<()> {
        {
            let mut assignments = self.assignments.write().await;
            let set = assignments.entry(agent_id.to_string()).or_default();
            let cap = self.concurrency_cap(agent_id).await;
            if set.len() >= cap {
                return Err(Error::CoordError(CoordError::InvalidState(format!(
                    "agent {} at concurrency cap",
                    agent_id
                ))));
            }
            set.insert(task.task_id);
        }

        let request = Message::new(
            "controller",
            agent_id,
            MessageContent::TaskRequest {
                task_id: task.task_id.to_string(),
                task_type: task.task_type.clone(),
                payload: task.data.clone(),
                shard: None,
            },
        )
        .with_priority(task.priority);

        match self
            .enhanced
            .send(EnhancedMessage::direct(request))
            .await
        {
            Ok(_) => {
                self.queue.mark_assigned(task, agent_id).await;
                Ok(())
            }
            Err(e) => {
                if let Some(set) = self.assignments.write().await.get_mut(agent_id) {
                    set.remove(&task.task_id);
                }
                Err(e)
            }
        }
    }

    async fn release_assignment(&self, task: &AgentTask, task_id: Uuid) {
        if let Some(agent_id) = &task.agent_id {
            let mut assignments = self.assignments.write().await;
            if let Some(set) = assignments.get_mut(agent_id) {
                set.remove(&task_id);
                if set.is_empty() {
                    assignments.remove(agent_id);
                }
            }
        }
    }

    async fn broadcast_lifecycle(&self, agent_id: &str, event: LifecycleEvent) {
        let message = Message::broadcast(
            "controller",
            MessageContent::Coordination {
                signal: CoordinationSignal::Lifecycle {
                    agent_id: agent_id.to_string(),
                    event,
                },
            },
        );
        self.bus.broadcast(message, Some("lifecycle")).await;
    }
}
