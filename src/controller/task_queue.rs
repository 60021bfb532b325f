use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};
use crate::types::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
    Timeout,
}

/// A unit of work tracked by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: Uuid,
    /// Set once the task is assigned.
    pub agent_id: Option<String>,
    pub task_type: String,
    pub data: serde_json::Value,
    pub priority: Priority,
    pub required_capabilities: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

impl AgentTask {
    pub fn new(
        task_type: impl Into<String>,
        data: serde_json::Value,
        priority: Priority,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            agent_id: None,
            task_type: task_type.into(),
            data,
            priority,
            required_capabilities: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            assigned_at: None,
            deadline: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskQueueStats {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Priority task queue: pending work bucketed per priority, FIFO within a
/// bucket, plus the assigned and terminal pools.
pub struct TaskQueue {
    pending: RwLock<HashMap<Priority, VecDeque<AgentTask>>>,
    assigned: RwLock<HashMap<Uuid, AgentTask>>,
    completed: RwLock<Vec<AgentTask>>,
    failed: RwLock<Vec<AgentTask>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let mut pending = HashMap::new();
        for priority in Priority::DESCENDING {
            pending.insert(priority, VecDeque::new());
        }
        Self {
            pending: RwLock::new(pending),
            assigned: RwLock::new(HashMap::new()),
            completed: RwLock::new(Vec::new()),
            failed: RwLock::new(Vec::new()),
        }
    }

    pub async fn enqueue(&self, mut task: AgentTask) {
        task.status = TaskStatus::Pending;
        let mut pending = self.pending.write().await;
        pending.entry(task.priority).or_default().push_back(task);
    }

    /// Put a task back at the head of its bucket, preserving its turn.
    pub async fn requeue_front(&self, mut task: AgentTask) {
        task.status = TaskStatus::Pending;
        let mut pending = self.pending.write().await;
        pending.entry(task.priority).or_default().push_front(task);
    }

    /// Highest-priority pending task, FIFO within a priority.
    pub async fn dequeue(&self) -> Option<AgentTask> {
        let mut pending = self.pending.write().await;
        for priority in Priority::DESCENDING {
            if let Some(task) = pending.get_mut(&priority).and_then(|q| q.pop_front()) {
                return Some(task);
            }
        }
        None
    }

    pub async fn mark_assigned(&self, mut task: AgentTask, agent_id: &str) {
        task.status = TaskStatus::Assigned;
        task.agent_id = Some(agent_id.to_string());
        task.assigned_at = Some(Utc::now());
        self.assigned.write().await.insert(task.task_id, task);
    }

    pub async fn mark_completed(&self, task_id: Uuid) -> Result<AgentTask> {
        let mut task = self.take_assigned(task_id).await?;
        task.status = TaskStatus::Completed;
        self.completed.write().await.push(task.clone());
        Ok(task)
    }

    pub async fn mark_failed(&self, task_id: Uuid, reason: impl Into<String>) -> Result<AgentTask> {
        let mut task = self.take_assigned(task_id).await?;
        task.status = TaskStatus::Failed;
        task.last_error = Some(reason.into());
        self.failed.write().await.push(task.clone());
        Ok(task)
    }

    pub async fn mark_timeout(&self, task_id: Uuid) -> Result<AgentTask> {
        let mut task = self.take_assigned(task_id).await?;
        task.status = TaskStatus::Timeout;
        task.last_error = Some("timed out".into());
        self.failed.write().await.push(task.clone());
        Ok(task)
    }

    /// Assigned tasks past their deadline, or assigned longer than the
    /// overall timeout.
    pub async fn overdue_assigned(
        &self,
        now: DateTime<Utc>,
        overall_timeout_secs: i64,
    ) -> Vec<Uuid> {
        let overall = Duration::seconds(overall_timeout_secs);
        self.assigned
            .read()
            .await
            .values()
            .filter(|task| {
                task.is_past_deadline(now)
                    || task
                        .assigned_at
                        .is_some_and(|assigned_at| now - assigned_at > overall)
            })
            .map(|task| task.task_id)
            .collect()
    }

    pub async fn get(&self, task_id: Uuid) -> Option<AgentTask> {
        if let Some(task) = self.assigned.read().await.get(&task_id) {
            return Some(task.clone());
        }
        for pool in [&self.completed, &self.failed] {
            if let Some(task) = pool.read().await.iter().find(|t| t.task_id == task_id) {
                return Some(task.clone());
            }
        }
        for queue in self.pending.read().await.values() {
            if let Some(task) = queue.iter().find(|t| t.task_id == task_id) {
                return Some(task.clone());
            }
        }
        None
    }

    pub async fn stats(&self) -> TaskQueueStats {
        TaskQueueStats {
            pending: self.pending.read().await.values().map(|q| q.len()).sum(),
            assigned: self.assigned.read().await.len(),
            completed: self.completed.read().await.len(),
            failed: self.failed.read().await.len(),
        }
    }

    async fn take_assigned(&self, task_id: Uuid) -> Result<AgentTask> {
        self.assigned
            .write()
            .await
            .remove(&task_id)
            .ok_or_else(|| Error::CoordError(CoordError::TaskNotFound(task_id.to_string())))
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_priority_order() {
        let queue = TaskQueue::new();
        queue
            .enqueue(AgentTask::new("low", serde_json::json!({}), Priority::Low))
            .await;
        queue
            .enqueue(AgentTask::new(
                "critical",
                serde_json::json!({}),
                Priority::Critical,
            ))
            .await;
        queue
            .enqueue(AgentTask::new(
                "normal",
                serde_json::json!({}),
                Priority::Normal,
            ))
            .await;

        assert_eq!(queue.dequeue().await.unwrap().task_type, "critical");
        assert_eq!(queue.dequeue().await.unwrap().task_type, "normal");
        assert_eq!(queue.dequeue().await.unwrap().task_type, "low");
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = TaskQueue::new();
        for name in ["first", "second", "third"] {
            queue
                .enqueue(AgentTask::new(name, serde_json::json!({}), Priority::Normal))
                .await;
        }
        assert_eq!(queue.dequeue().await.unwrap().task_type, "first");

        let task = AgentTask::new("head", serde_json::json!({}), Priority::Normal);
        queue.requeue_front(task).await;
        assert_eq!(queue.dequeue().await.unwrap().task_type, "head");
        assert_eq!(queue.dequeue().await.unwrap().task_type, "second");
    }

    #[tokio::test]
    async fn test_assignment_lifecycle() {
        let queue = TaskQueue::new();
        let task = AgentTask::new("work", serde_json::json!({}), Priority::Normal);
        let task_id = task.task_id;

        queue.mark_assigned(task, "a1").await;
        let assigned = queue.get(task_id).await.unwrap();
        assert_eq!(assigned.status, TaskStatus::Assigned);
        assert_eq!(assigned.agent_id, Some("a1".to_string()));

        let done = queue.mark_completed(task_id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(queue.mark_completed(task_id).await.is_err());
    }

    #[tokio::test]
    async fn test_overdue_detection() {
        let queue = TaskQueue::new();
        let task = AgentTask::new("slow", serde_json::json!({}), Priority::Normal)
            .with_deadline(Utc::now() - Duration::seconds(1));
        let task_id = task.task_id;
        queue.mark_assigned(task, "a1").await;

        let overdue = queue.overdue_assigned(Utc::now(), 300).await;
        assert_eq!(overdue, vec![task_id]);

        let timed_out = queue.mark_timeout(task_id).await.unwrap();
        assert_eq!(timed_out.status, TaskStatus::Timeout);
    }
}
