use crate::{error::SearchError, task::Task};

/// The search engine's write API.
pub trait SearchIndex: Send + Sync {
    /// Stores the task document, replacing any previous version.
    fn index(&self, task: &Task) -> impl Future<Output = Result<(), SearchError>> + Send;

    /// Removes the task document. Absent documents yield [`SearchError::NotFound`].
    fn delete(&self, id: &str) -> impl Future<Output = Result<(), SearchError>> + Send;
}

impl<S: SearchIndex> SearchIndex for std::sync::Arc<S> {
    fn index(&self, task: &Task) -> impl Future<Output = Result<(), SearchError>> + Send {
        (**self).index(task)
    }

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), SearchError>> + Send {
        (**self).delete(id)
    }
}
