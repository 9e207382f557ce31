//! Elasticsearch implementation of the task search index.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use todo_sdk::{error::SearchError, search::SearchIndex, task::Task};
use tracing::debug;

const DEFAULT_INDEX_NAME: &str = "tasks";

/// Search document stored for each task.
#[derive(Debug, PartialEq, Serialize)]
pub struct IndexedTask<'a> {
    pub id: &'a str,
    pub description: &'a str,
    pub priority: &'static str,
    pub is_done: bool,
    pub date_start: Option<DateTime<Utc>>,
    pub date_due: Option<DateTime<Utc>>,
}

impl<'a> From<&'a Task> for IndexedTask<'a> {
    fn from(task: &'a Task) -> Self {
        IndexedTask {
            id: &task.id,
            description: &task.description,
            priority: task.priority.as_str(),
            is_done: task.is_done,
            date_start: task.dates.start,
            date_due: task.dates.due,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ElasticsearchIndex {
    client: Client,
    base_url: Url,
    index: Arc<str>,
    refresh: bool,
}

impl ElasticsearchIndex {
    pub fn new(base_url: &str, index: impl Into<Arc<str>>) -> Result<Self, SearchError> {
        let base_url = Url::parse(base_url).map_err(SearchError::backend)?;
        if base_url.cannot_be_a_base() {
            return Err(SearchError::backend(format!(
                "elasticsearch url `{base_url}` cannot be a base"
            )));
        }

        Ok(ElasticsearchIndex {
            client: Client::new(),
            base_url,
            index: index.into(),
            refresh: true,
        })
    }

    /// Connects to `base_url` using the default `tasks` index.
    pub fn with_default_index(base_url: &str) -> Result<Self, SearchError> {
        Self::new(base_url, DEFAULT_INDEX_NAME)
    }

    pub fn client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Whether writes wait for the index to refresh before returning.
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn document_url(&self, id: &str) -> Result<Url, SearchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SearchError::backend("elasticsearch url cannot be a base"))?
            .pop_if_empty()
            .extend([self.index.as_ref(), "_doc", id]);

        if self.refresh {
            url.query_pairs_mut().append_pair("refresh", "true");
        }

        Ok(url)
    }
}

impl SearchIndex for ElasticsearchIndex {
    async fn index(&self, task: &Task) -> Result<(), SearchError> {
        let url = self.document_url(&task.id)?;

        let response = self
            .client
            .put(url)
            .json(&IndexedTask::from(task))
            .send()
            .await
            .map_err(SearchError::backend)?;

        check_status(response).await?;
        debug!(task_id = %task.id, index = %self.index, "indexed task");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SearchError> {
        let url = self.document_url(id)?;

        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(SearchError::backend)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SearchError::NotFound(id.to_string()));
        }

        check_status(response).await?;
        debug!(task_id = id, index = %self.index, "deleted task");
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<(), SearchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(SearchError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use mockito::Matcher;
    use serde_json::json;
    use todo_sdk::task::{Dates, Priority};

    use super::*;

    #[test]
    fn document_url_escapes_ids() {
        let index = ElasticsearchIndex::new("http://localhost:9200/", "tasks").unwrap();

        let url = index.document_url("a/b c").unwrap();

        assert_eq!(
            url.as_str(),
            "http://localhost:9200/tasks/_doc/a%2Fb%20c?refresh=true"
        );
    }

    #[test]
    fn document_url_keeps_base_path() {
        let index = ElasticsearchIndex::new("http://search.internal/es", "todo")
            .unwrap()
            .refresh(false);

        let url = index.document_url("abc").unwrap();

        assert_eq!(url.as_str(), "http://search.internal/es/todo/_doc/abc");
    }

    #[test]
    fn rejects_invalid_base_urls() {
        assert!(ElasticsearchIndex::new("not a url", "tasks").is_err());
        assert!(ElasticsearchIndex::new("mailto:search@example.com", "tasks").is_err());
    }

    #[test]
    fn document_flattens_task() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let task = Task::new("abc", "buy milk")
            .with_priority(Priority::High)
            .with_dates(Dates {
                start: Some(start),
                due: None,
            })
            .done(true);

        let document = serde_json::to_value(IndexedTask::from(&task)).unwrap();

        assert_eq!(
            document,
            json!({
                "id": "abc",
                "description": "buy milk",
                "priority": "high",
                "is_done": true,
                "date_start": "2024-05-01T09:00:00Z",
                "date_due": null,
            })
        );
    }

    #[tokio::test]
    async fn index_puts_document() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/tasks/_doc/abc")
            .match_query(Matcher::UrlEncoded("refresh".into(), "true".into()))
            .match_body(Matcher::PartialJson(json!({
                "id": "abc",
                "description": "buy milk",
                "priority": "none",
                "is_done": false,
            })))
            .with_status(201)
            .create_async()
            .await;
        let index = ElasticsearchIndex::with_default_index(&server.url()).unwrap();

        index.index(&Task::new("abc", "buy milk")).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn delete_of_missing_document_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/tasks/_doc/abc")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"result":"not_found"}"#)
            .create_async()
            .await;
        let index = ElasticsearchIndex::with_default_index(&server.url()).unwrap();

        let err = index.delete("abc").await.unwrap_err();

        assert!(matches!(err, SearchError::NotFound(id) if id == "abc"));
    }

    #[tokio::test]
    async fn server_errors_carry_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/tasks/_doc/abc")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("cluster unavailable")
            .create_async()
            .await;
        let index = ElasticsearchIndex::with_default_index(&server.url()).unwrap();

        let err = index.index(&Task::new("abc", "buy milk")).await.unwrap_err();

        assert!(matches!(
            err,
            SearchError::Status { status: 503, ref body } if body == "cluster unavailable"
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_backend_error() {
        let index = ElasticsearchIndex::with_default_index("http://127.0.0.1:1").unwrap();

        let err = index.delete("abc").await.unwrap_err();

        assert!(matches!(err, SearchError::Backend(_)));
    }
}
