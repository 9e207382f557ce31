use todo_sdk::{error::SearchError, event::TaskEvent, search::SearchIndex, task::Task};
use tracing::debug;

use crate::{consumer::EventHandler, error::ApplyError};

/// Applies task events to a search index.
///
/// Both operations are idempotent: upserting the same snapshot twice leaves the
/// index as a single upsert would, and removing an absent task succeeds.
pub struct IndexApplier<S> {
    index: S,
}

impl<S> IndexApplier<S>
where
    S: SearchIndex,
{
    pub fn new(index: S) -> Self {
        IndexApplier { index }
    }

    pub fn index(&self) -> &S {
        &self.index
    }

    pub async fn upsert(&self, task: &Task) -> Result<(), ApplyError> {
        self.index.index(task).await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), ApplyError> {
        match self.index.delete(id).await {
            Ok(()) => Ok(()),
            Err(SearchError::NotFound(_)) => {
                debug!(task_id = id, "task already absent from index");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn apply(&self, event: &TaskEvent) -> Result<(), ApplyError> {
        match event {
            TaskEvent::Created(task) | TaskEvent::Updated(task) => self.upsert(task).await,
            TaskEvent::Deleted(id) => self.remove(id).await,
        }
    }
}

impl<S> EventHandler for IndexApplier<S>
where
    S: SearchIndex,
{
    type Error = ApplyError;

    async fn handle(&mut self, event: &TaskEvent) -> Result<(), Self::Error> {
        self.apply(event).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::memory::MemoryIndex;

    struct BrokenIndex {
        calls: Mutex<u32>,
    }

    impl SearchIndex for BrokenIndex {
        async fn index(&self, _task: &Task) -> Result<(), SearchError> {
            *self.calls.lock().unwrap() += 1;
            Err(SearchError::Status {
                status: 503,
                body: "unavailable".into(),
            })
        }

        async fn delete(&self, _id: &str) -> Result<(), SearchError> {
            *self.calls.lock().unwrap() += 1;
            Err(SearchError::backend("connection reset"))
        }
    }

    #[tokio::test]
    async fn upsert_twice_matches_single_upsert() {
        let task = Task::new("abc", "buy milk");

        let once = IndexApplier::new(MemoryIndex::new());
        once.upsert(&task).await.unwrap();

        let twice = IndexApplier::new(MemoryIndex::new());
        twice.upsert(&task).await.unwrap();
        twice.upsert(&task).await.unwrap();

        assert_eq!(once.index().documents(), twice.index().documents());
        assert_eq!(twice.index().documents().len(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_previous_snapshot() {
        let applier = IndexApplier::new(MemoryIndex::new());

        applier.upsert(&Task::new("abc", "buy milk")).await.unwrap();
        applier
            .upsert(&Task::new("abc", "buy oat milk").done(true))
            .await
            .unwrap();

        assert_eq!(
            applier.index().get("abc"),
            Some(Task::new("abc", "buy oat milk").done(true))
        );
    }

    #[tokio::test]
    async fn removing_absent_task_succeeds() {
        let applier = IndexApplier::new(MemoryIndex::new());

        applier.remove("missing").await.unwrap();
        applier.upsert(&Task::new("abc", "buy milk")).await.unwrap();
        applier.remove("abc").await.unwrap();
        applier.remove("abc").await.unwrap();

        assert!(applier.index().documents().is_empty());
    }

    #[tokio::test]
    async fn collaborator_errors_are_propagated() {
        let applier = IndexApplier::new(BrokenIndex {
            calls: Mutex::new(0),
        });

        let upsert = applier.upsert(&Task::new("abc", "buy milk")).await;
        let remove = applier.remove("abc").await;

        assert!(matches!(
            upsert,
            Err(ApplyError::Search(SearchError::Status { status: 503, .. }))
        ));
        assert!(matches!(remove, Err(ApplyError::Search(SearchError::Backend(_)))));
        assert_eq!(*applier.index().calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn routes_events_by_kind() {
        let mut applier = IndexApplier::new(MemoryIndex::new());

        applier
            .handle(&TaskEvent::Created(Task::new("a", "one")))
            .await
            .unwrap();
        applier
            .handle(&TaskEvent::Updated(Task::new("b", "two")))
            .await
            .unwrap();
        applier
            .handle(&TaskEvent::Deleted("a".into()))
            .await
            .unwrap();

        assert_eq!(applier.index().get("a"), None);
        assert_eq!(applier.index().get("b"), Some(Task::new("b", "two")));
    }
}
