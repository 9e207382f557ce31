//! The producer side of the pipeline: mutate the system of record, then publish.

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    error::{BoxError, PublishError},
    event::TaskEvent,
    publish::Publisher,
    task::{Dates, Priority, Task},
};

/// Parameters for creating a task. The repository assigns the id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateParams {
    pub description: String,
    pub priority: Priority,
    pub dates: Dates,
}

/// Classification of repository failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RepositoryErrorCode {
    #[error("not_found")]
    NotFound,
    #[error("invalid_argument")]
    InvalidArgument,
    #[error("unknown")]
    Unknown,
}

/// Error returned by the system of record.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct RepositoryError {
    pub code: RepositoryErrorCode,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl RepositoryError {
    pub fn new(code: RepositoryErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RepositoryErrorCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RepositoryErrorCode::InvalidArgument, message)
    }

    pub fn unknown(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            code: RepositoryErrorCode::Unknown,
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Create/read/update/delete by primary key against the system of record.
pub trait TaskRepository: Send + Sync {
    fn create(&self, params: CreateParams) -> impl Future<Output = Result<Task, RepositoryError>> + Send;

    fn find(&self, id: &str) -> impl Future<Output = Result<Task, RepositoryError>> + Send;

    /// Overwrites every mutable field of the task identified by `task.id`.
    fn update(&self, task: &Task) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The mutation was not applied; nothing was published.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    /// The mutation committed but its event was not published.
    ///
    /// The search index will miss this change until a later event for the
    /// same task, or a reindex, brings it back in line.
    #[error("task `{task_id}` was saved but its event was not published: {source}")]
    Publish {
        task_id: String,
        #[source]
        source: PublishError,
    },
}

/// Performs task mutations and publishes the matching event once each commits.
pub struct TaskService<R, P> {
    repository: R,
    publisher: P,
}

impl<R, P> TaskService<R, P>
where
    R: TaskRepository,
    P: Publisher,
{
    pub fn new(repository: R, publisher: P) -> Self {
        TaskService {
            repository,
            publisher,
        }
    }

    pub async fn create(&self, params: CreateParams) -> Result<Task, ServiceError> {
        let task = self.repository.create(params).await?;
        self.publish(TaskEvent::Created(task.clone())).await?;

        Ok(task)
    }

    pub async fn task(&self, id: &str) -> Result<Task, ServiceError> {
        Ok(self.repository.find(id).await?)
    }

    pub async fn update(&self, task: Task) -> Result<(), ServiceError> {
        self.repository.update(&task).await?;
        self.publish(TaskEvent::Updated(task)).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        self.repository.delete(id).await?;
        self.publish(TaskEvent::Deleted(id.to_string())).await
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    async fn publish(&self, event: TaskEvent) -> Result<(), ServiceError> {
        match self.publisher.publish(&event).await {
            Ok(()) => {
                info!(event_type = %event.kind(), task_id = event.task_id(), "published task event");
                Ok(())
            }
            Err(err) => {
                warn!(event_type = %event.kind(), task_id = event.task_id(), error = %err, "failed to publish task event");
                Err(ServiceError::Publish {
                    task_id: event.task_id().to_string(),
                    source: err,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use uuid::Uuid;

    use super::*;

    #[derive(Default)]
    struct MemoryRepository {
        tasks: Mutex<HashMap<String, Task>>,
    }

    impl TaskRepository for MemoryRepository {
        async fn create(&self, params: CreateParams) -> Result<Task, RepositoryError> {
            if params.description.is_empty() {
                return Err(RepositoryError::invalid_argument("description is required"));
            }
            let task = Task {
                id: Uuid::new_v4().to_string(),
                description: params.description,
                priority: params.priority,
                dates: params.dates,
                is_done: false,
            };
            self.tasks
                .lock()
                .unwrap()
                .insert(task.id.clone(), task.clone());
            Ok(task)
        }

        async fn find(&self, id: &str) -> Result<Task, RepositoryError> {
            self.tasks
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| RepositoryError::not_found("task not found"))
        }

        async fn update(&self, task: &Task) -> Result<(), RepositoryError> {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(existing) = tasks.get_mut(&task.id) else {
                return Err(RepositoryError::not_found("task not found"));
            };
            *existing = task.clone();
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
            self.tasks
                .lock()
                .unwrap()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| RepositoryError::not_found("task not found"))
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<TaskEvent>>,
        fail: AtomicBool,
    }

    impl RecordingPublisher {
        fn events(&self) -> Vec<TaskEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Publisher for RecordingPublisher {
        async fn publish(&self, event: &TaskEvent) -> Result<(), PublishError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PublishError::backend(
                    event.kind().topic(),
                    "broker unavailable",
                ));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn service() -> TaskService<MemoryRepository, RecordingPublisher> {
        TaskService::new(MemoryRepository::default(), RecordingPublisher::default())
    }

    fn params(description: &str) -> CreateParams {
        CreateParams {
            description: description.into(),
            priority: Priority::Normal,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_publishes_created_snapshot() {
        let service = service();

        let task = service.create(params("buy milk")).await.unwrap();

        assert_eq!(service.publisher().events(), vec![TaskEvent::Created(task.clone())]);
        assert_eq!(service.task(&task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn update_publishes_updated_snapshot() {
        let service = service();
        let task = service.create(params("buy milk")).await.unwrap();

        let updated = task.clone().done(true);
        service.update(updated.clone()).await.unwrap();

        assert_eq!(
            service.publisher().events(),
            vec![TaskEvent::Created(task), TaskEvent::Updated(updated)]
        );
    }

    #[tokio::test]
    async fn delete_publishes_id() {
        let service = service();
        let task = service.create(params("buy milk")).await.unwrap();

        service.delete(&task.id).await.unwrap();

        assert_eq!(
            service.publisher().events().last(),
            Some(&TaskEvent::Deleted(task.id))
        );
    }

    #[tokio::test]
    async fn failed_write_publishes_nothing() {
        let service = service();

        let err = service.create(params("")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Repository(RepositoryError {
                code: RepositoryErrorCode::InvalidArgument,
                ..
            })
        ));

        let err = service.delete("missing").await.unwrap_err();
        assert!(matches!(err, ServiceError::Repository(_)));

        assert!(service.publisher().events().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_surfaced_after_commit() {
        let service = service();
        service.publisher().fail.store(true, Ordering::SeqCst);

        let err = service.create(params("buy milk")).await.unwrap_err();

        let task_id = match err {
            ServiceError::Publish { task_id, .. } => task_id,
            other => panic!("expected publish error, got {other:?}"),
        };
        // The write itself committed.
        assert!(service.task(&task_id).await.is_ok());
    }
}
