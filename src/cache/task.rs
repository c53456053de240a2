use crate::semantic_model::CatalogSchemaTableName;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        };
        write!(f, "{}", status)
    }
}

/// State of the latest materialization run of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub task_id: Uuid,
    pub key: CatalogSchemaTableName,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Local table the run writes to.
    pub table_name: Option<String>,
    pub error: Option<String>,
}

impl TaskInfo {
    pub(crate) fn queued(key: CatalogSchemaTableName) -> Self {
        TaskInfo {
            task_id: Uuid::new_v4(),
            key,
            status: TaskStatus::Queued,
            start_time: None,
            end_time: None,
            table_name: None,
            error: None,
        }
    }

    pub(crate) fn start(&mut self, table_name: &str) {
        self.status = TaskStatus::Running;
        self.start_time = Some(Utc::now());
        self.table_name = Some(table_name.to_string());
    }

    pub(crate) fn finish(&mut self) {
        self.status = TaskStatus::Done;
        self.end_time = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.status = TaskStatus::Failed;
        self.end_time = Some(Utc::now());
        self.error = Some(message);
    }
}
