#[cfg(test)]
mod controller_tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use swarmbus::controller::{
        AgentSpec, AgentTask, Controller, LaunchSpec, ProcessHandle, ProcessLauncher,
    };
    use swarmbus::error::coord_error::CoordError;
    use swarmbus::error::{Error, Result};
    use swarmbus::types::{AgentState, Priority, RoutingStrategy};
    use swarmbus::{SystemConfig, SystemContext};

    static NEXT_PID: AtomicU32 = AtomicU32::new(50_000);

    #[derive(Default)]
    struct ProcessFlags {
        exited: Arc<AtomicBool>,
        force_killed: Arc<AtomicBool>,
    }

    /// Launcher handing out fake process handles the tests can flip.
    #[derive(Clone, Default)]
    struct MockLauncher {
        processes: Arc<Mutex<HashMap<String, Arc<ProcessFlags>>>>,
    }

    impl MockLauncher {
        fn flags(&self, key: &str) -> Arc<ProcessFlags> {
            self.processes
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .clone()
        }
    }

    #[async_trait::async_trait]
    impl ProcessLauncher for MockLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
            let flags = self.flags(&spec.command);
            flags.exited.store(false, Ordering::SeqCst);
            flags.force_killed.store(false, Ordering::SeqCst);
            Ok(Box::new(MockHandle {
                pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
                flags,
            }))
        }
    }

    struct MockHandle {
        pid: u32,
        flags: Arc<ProcessFlags>,
    }

    #[async_trait::async_trait]
    impl ProcessHandle for MockHandle {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        async fn try_wait(&mut self) -> Result<Option<i32>> {
            if self.flags.exited.load(Ordering::SeqCst) {
                Ok(Some(1))
            } else {
                Ok(None)
            }
        }

        async fn terminate(&mut self) -> Result<()> {
            self.flags.exited.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn force_kill(&mut self) -> Result<()> {
            self.flags.exited.store(true, Ordering::SeqCst);
            self.flags.force_killed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// A sampler the controller can carry without touching /proc.
    struct NullSampler;

    #[async_trait::async_trait]
    impl swarmbus::ResourceSampler for NullSampler {
        async fn sample_process(&self, _pid: u32) -> Result<swarmbus::ResourceVector> {
            Ok(swarmbus::ResourceVector::default())
        }

        async fn sample_system(&self) -> Result<swarmbus::monitor::SystemUsage> {
            Ok(swarmbus::monitor::SystemUsage::default())
        }
    }

    fn spec(agent_id: &str, capabilities: &[&str]) -> AgentSpec {
        AgentSpec {
            agent_id: agent_id.to_string(),
            name: agent_id.to_string(),
            role: "worker".into(),
            zone: "zone-a".into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            command: agent_id.to_string(),
            args: vec![],
            env: HashMap::new(),
            mailbox_capacity: None,
            concurrency_cap: None,
            resource_limits: None,
        }
    }

    async fn harness(config: SystemConfig) -> (Arc<Controller>, MockLauncher) {
        let launcher = MockLauncher::default();
        let controller = Controller::new(
            SystemContext::new(config),
            Arc::new(launcher.clone()),
            Arc::new(NullSampler),
            None,
        )
        .await;
        (controller, launcher)
    }

    fn task() -> AgentTask {
        AgentTask::new("analysis", serde_json::json!({"doc": 1}), Priority::Normal)
            .with_capabilities(vec!["analysis".to_string()])
    }

    #[tokio::test]
    async fn test_concurrency_cap_queues_sixth_task() {
        let (controller, _launcher) = harness(SystemConfig::default()).await;
        controller.create_agent(spec("a1", &["analysis"])).await.unwrap();
        controller.start_agent("a1").await.unwrap();

        let mut task_ids = Vec::new();
        for _ in 0..6 {
            let id = controller
                .auto_assign_task(task(), RoutingStrategy::CapabilityBased)
                .await
                .unwrap();
            task_ids.push(id);
        }

        // Five in flight, the sixth queued rather than dropped or delivered.
        let status = controller.agent_status("a1").await.unwrap();
        assert_eq!(status.assigned_tasks, 5);
        assert_eq!(controller.bus().queue_depths().await.get("a1"), Some(&5));

        let system = controller.system_status().await;
        assert_eq!(system.queue.pending, 1);
        assert_eq!(system.queue.assigned, 5);
    }

    #[tokio::test]
    async fn test_dispatcher_drains_overflow_after_completion() {
        let config = SystemConfig {
            dispatch_interval_secs: 1,
            ..Default::default()
        };
        let (controller, _launcher) = harness(config).await;
        controller.create_agent(spec("a1", &["analysis"])).await.unwrap();
        controller.start_agent("a1").await.unwrap();
        controller.start().await;

        let mut task_ids = Vec::new();
        for _ in 0..6 {
            task_ids.push(
                controller
                    .auto_assign_task(task(), RoutingStrategy::CapabilityBased)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(controller.system_status().await.queue.pending, 1);

        controller.complete_task(task_ids[0], true, None).await.unwrap();

        // The dispatcher picks the queued task up on its next tick.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let system = controller.system_status().await;
        assert_eq!(system.queue.pending, 0);
        assert_eq!(system.queue.assigned, 5);
        assert_eq!(system.queue.completed, 1);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_capable_agent_queues() {
        let (controller, _launcher) = harness(SystemConfig::default()).await;
        controller.create_agent(spec("a1", &["search"])).await.unwrap();
        controller.start_agent("a1").await.unwrap();

        controller
            .auto_assign_task(task(), RoutingStrategy::CapabilityBased)
            .await
            .unwrap();

        assert_eq!(controller.system_status().await.queue.pending, 1);
        assert!(controller
            .bus()
            .drain("a1", Duration::from_millis(10))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_restart_cooldown_gates_second_restart() {
        let (controller, _launcher) = harness(SystemConfig::default()).await;
        controller.create_agent(spec("a1", &["analysis"])).await.unwrap();
        controller.start_agent("a1").await.unwrap();

        controller.restart_agent("a1").await.unwrap();
        let err = controller.restart_agent("a1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::CoordError(CoordError::RestartCooldown(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_stop_falls_back_to_force_kill() {
        let config = SystemConfig {
            grace_period_secs: 0,
            ..Default::default()
        };
        let (controller, launcher) = harness(config).await;
        controller.create_agent(spec("stuck", &["analysis"])).await.unwrap();
        controller.start_agent("stuck").await.unwrap();

        controller.stop_agent("stuck", true).await.unwrap();

        assert!(launcher.flags("stuck").force_killed.load(Ordering::SeqCst));
        let status = controller.agent_status("stuck").await.unwrap();
        assert_eq!(status.record.state, AgentState::Stopped);
        assert_eq!(status.record.pid, None);
        assert!(!status.has_process);
    }

    #[tokio::test]
    async fn test_process_monitor_flags_dead_agent() {
        let config = SystemConfig {
            monitor_interval_secs: 1,
            ..Default::default()
        };
        let (controller, launcher) = harness(config).await;
        controller.create_agent(spec("mort", &["analysis"])).await.unwrap();
        controller.start_agent("mort").await.unwrap();

        controller.bus().register("watcher", None).await;
        controller.bus().subscribe("watcher", "alerts").await;
        controller.start().await;

        // Simulate the child dying.
        launcher.flags("mort").exited.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let status = controller.agent_status("mort").await.unwrap();
        assert_eq!(status.record.state, AgentState::Error);
        assert!(!status.has_process);
        assert!(status.record.error_count >= 1);

        let alerts = controller
            .bus()
            .drain("watcher", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!alerts.is_empty());

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_agent_twice_fails() {
        let (controller, _launcher) = harness(SystemConfig::default()).await;
        controller.create_agent(spec("dup", &["x"])).await.unwrap();
        assert!(controller.create_agent(spec("dup", &["x"])).await.is_err());
    }

    #[tokio::test]
    async fn test_explicit_assignment_and_status() {
        let (controller, _launcher) = harness(SystemConfig::default()).await;
        controller.create_agent(spec("a1", &["analysis"])).await.unwrap();
        controller.start_agent("a1").await.unwrap();

        let one = task();
        let task_id = controller.assign_task(one, "a1").await.unwrap();

        let tracked = controller.task_status(task_id).await.unwrap();
        assert_eq!(tracked.agent_id, Some("a1".to_string()));

        controller
            .complete_task(task_id, false, Some("worker crashed".into()))
            .await
            .unwrap();
        // A failed task with budget left goes back to pending for retry.
        assert_eq!(controller.system_status().await.queue.pending, 1);
    }

    #[tokio::test]
    async fn test_discovery_by_capability() {
        let (controller, _launcher) = harness(SystemConfig::default()).await;
        controller.create_agent(spec("a1", &["analysis"])).await.unwrap();
        controller.create_agent(spec("a2", &["search"])).await.unwrap();

        let found = controller
            .discover_by_capability(&["analysis".to_string()])
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id, "a1");

        controller
            .register_capabilities("a2", vec!["analysis".to_string(), "search".to_string()])
            .await
            .unwrap();
        let found = controller
            .discover_by_capability(&["analysis".to_string()])
            .await;
        assert_eq!(found.len(), 2);
    }
}
