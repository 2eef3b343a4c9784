//! Elasticsearch REST engine.
//!
//! Speaks the handful of endpoints the migrations need (`_cat/indices`,
//! `_search` with scroll, `_bulk`, `_reindex` + `_tasks`, `_settings`,
//! `_count`, `_refresh`) and maps store error payloads onto [`StoreError`] so the
//! retrying client can tell transient failures from permanent ones.

use std::{fmt::Debug, time::Duration};

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use url::Url;

use crate::{
    api::{
        BulkItemError, BulkResponse, Document, ReindexStatus, ReindexTask, ScrollPage,
        ScrollRequest, SearchEngine, SearchHit,
    },
    error::StoreError,
    filter::Filter,
    store_db::search_in_memory::DEFAULT_FIELD_LIMIT,
};

const SCROLL_KEEP_ALIVE: &str = "1m";

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Per-request timeout (default: 60s).
    pub timeout: Duration,
    /// TCP connect timeout (default: 10s).
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct HttpStore {
    http: Client,
    base_url: Url,
}

impl Debug for HttpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HttpStore({})", self.base_url)
    }
}

impl HttpStore {
    pub fn new(base_url: &str, config: HttpConfig) -> Result<Self, StoreError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| StoreError::Custom(format!("invalid search url {base_url}: {e}")))?;
        // keep any path prefix (proxies) when joining endpoint paths
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StoreError::Custom(format!("cannot build http client: {e}")))?;
        Ok(Self { http, base_url })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, StoreError> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| StoreError::Custom(format!("invalid path {path}: {e}")))?;
        Ok(self.http.request(method, url))
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response, StoreError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Timeout {
                    operation: operation.to_owned(),
                }
            } else {
                StoreError::Connection {
                    url: self.base_url.to_string(),
                    cause: e.to_string(),
                }
            }
        })
    }

    /// Sends the request and decodes a JSON body, mapping error statuses.
    async fn call(
        &self,
        operation: &str,
        index: Option<&str>,
        builder: RequestBuilder,
    ) -> Result<Value, StoreError> {
        let response = self.send(operation, builder).await?;
        let status = response.status();
        let body = response.text().await.map_err(|e| StoreError::Connection {
            url: self.base_url.to_string(),
            cause: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(map_error_body(status, index, &body));
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Translates an error response into the matching [`StoreError`] variant.
fn map_error_body(status: StatusCode, index: Option<&str>, body: &str) -> StoreError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error = &parsed["error"];
    let error_type = error["type"].as_str().unwrap_or_default();
    let reason = error["reason"].as_str().unwrap_or(body);
    let index = index.unwrap_or_default().to_owned();

    if status == StatusCode::NOT_FOUND || error_type == "index_not_found_exception" {
        return StoreError::NotFound {
            kind: "index",
            name: index,
        };
    }
    if error_type == "resource_already_exists_exception" {
        return StoreError::AlreadyExists {
            kind: "index",
            name: index,
        };
    }
    if let Some(limit) = parse_field_limit(reason) {
        return StoreError::FieldLimitExceeded { index, limit };
    }
    if (error_type == "mapper_parsing_exception" && reason.contains("cannot contain '.'"))
        || reason.contains("field name cannot be an empty string")
    {
        return StoreError::IllegalFieldName {
            index,
            field: extract_quoted(reason).unwrap_or_default(),
        };
    }
    StoreError::Http {
        status: status.as_u16(),
        body: reason.to_owned(),
    }
}

/// `Limit of total fields [1000] in index [x] has been exceeded` → 1000
fn parse_field_limit(reason: &str) -> Option<u64> {
    let rest = reason.strip_prefix("Limit of total fields [")?;
    let end = rest.find(']')?;
    rest[..end].parse().ok()
}

fn extract_quoted(reason: &str) -> Option<String> {
    let start = reason.find('[')? + 1;
    let end = start + reason[start..].find(']')?;
    Some(reason[start..end].to_owned())
}

fn source_of(hit: &Value) -> Document {
    hit["_source"].as_object().cloned().unwrap_or_default()
}

fn parse_hits(index: &str, body: &Value) -> Vec<SearchHit> {
    body["hits"]["hits"]
        .as_array()
        .map(|hits| {
            hits.iter()
                .map(|hit| SearchHit {
                    index: hit["_index"].as_str().unwrap_or(index).to_owned(),
                    id: hit["_id"].as_str().unwrap_or_default().to_owned(),
                    source: source_of(hit),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_scroll_page(index: &str, body: &Value) -> ScrollPage {
    let hits = parse_hits(index, body);
    let scroll_id = if hits.is_empty() {
        None
    } else {
        body["_scroll_id"].as_str().map(str::to_owned)
    };
    ScrollPage { scroll_id, hits }
}

/// Reads a `GET /_tasks/<id>` answer for a reindex task.
fn parse_task_status(task: &str, body: &Value) -> Result<ReindexStatus, StoreError> {
    if body["completed"] != Value::Bool(true) {
        return Ok(ReindexStatus::Running);
    }
    if !body["error"].is_null() {
        return Err(StoreError::Custom(format!(
            "reindex task {task} failed: {}",
            body["error"]
        )));
    }
    let response = &body["response"];
    if let Some(failure) = response["failures"].as_array().and_then(|f| f.first()) {
        return Err(StoreError::Custom(format!(
            "reindex task {task} failed: {failure}"
        )));
    }
    Ok(ReindexStatus::Completed {
        copied: response["total"].as_u64().unwrap_or_default(),
    })
}

#[async_trait::async_trait]
impl SearchEngine for HttpStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.call("ping", None, self.request(Method::GET, "/")?)
            .await
            .map(|_| ())
    }

    async fn list_indices(&self) -> Result<Vec<String>, StoreError> {
        let body = self
            .call(
                "list_indices",
                None,
                self.request(Method::GET, "/_cat/indices?format=json&h=index")?,
            )
            .await?;
        let mut names: Vec<String> = body
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row["index"].as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        let response = self
            .send("index_exists", self.request(Method::HEAD, &format!("/{index}"))?)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Http {
                status: status.as_u16(),
                body: format!("HEAD /{index}"),
            }),
        }
    }

    async fn create_index(&self, index: &str) -> Result<(), StoreError> {
        self.call(
            "create_index",
            Some(index),
            self.request(Method::PUT, &format!("/{index}"))?,
        )
        .await
        .map(|_| ())
    }

    async fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        self.call(
            "delete_index",
            Some(index),
            self.request(Method::DELETE, &format!("/{index}"))?,
        )
        .await
        .map(|_| ())
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<SearchHit>, StoreError> {
        let response = self
            .send("get", self.request(Method::GET, &format!("/{index}/_doc/{id}"))?)
            .await?;
        let status = response.status();
        let body = response.text().await.map_err(|e| StoreError::Connection {
            url: self.base_url.to_string(),
            cause: e.to_string(),
        })?;
        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        // a missing document answers 404 with `found: false`, a missing index does not
        if status == StatusCode::NOT_FOUND && parsed["found"] == Value::Bool(false) {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(map_error_body(status, Some(index), &body));
        }
        Ok(Some(SearchHit {
            index: index.to_owned(),
            id: id.to_owned(),
            source: source_of(&parsed),
        }))
    }

    async fn index_document(
        &self,
        index: &str,
        id: Option<&str>,
        source: Document,
    ) -> Result<String, StoreError> {
        let builder = match id {
            Some(id) => self.request(Method::PUT, &format!("/{index}/_doc/{id}"))?,
            None => self.request(Method::POST, &format!("/{index}/_doc"))?,
        };
        let body = self
            .call("index_document", Some(index), builder.json(&source))
            .await?;
        body["_id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| StoreError::Custom("index response without _id".to_owned()))
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: Vec<(String, Document)>,
    ) -> Result<BulkResponse, StoreError> {
        if documents.is_empty() {
            return Ok(BulkResponse::default());
        }
        let mut payload = String::new();
        for (id, source) in &documents {
            payload.push_str(&json!({ "index": { "_index": index, "_id": id } }).to_string());
            payload.push('\n');
            payload.push_str(&serde_json::to_string(source)?);
            payload.push('\n');
        }
        let builder = self
            .request(Method::POST, "/_bulk")?
            .header("content-type", "application/x-ndjson")
            .body(payload);
        let body = self.call("bulk_index", Some(index), builder).await?;

        let mut response = BulkResponse::default();
        for item in body["items"].as_array().into_iter().flatten() {
            let result = &item["index"];
            let id = result["_id"].as_str().unwrap_or_default().to_owned();
            if result["error"].is_null() {
                response.indexed += 1;
                continue;
            }
            let status = result["status"]
                .as_u64()
                .and_then(|s| u16::try_from(s).ok())
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_REQUEST);
            let error_body = json!({ "error": result["error"] }).to_string();
            response.failures.push(BulkItemError {
                id,
                error: map_error_body(status, Some(index), &error_body),
            });
        }
        Ok(response)
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), StoreError> {
        self.call(
            "delete_document",
            Some(index),
            self.request(Method::DELETE, &format!("/{index}/_doc/{id}"))?,
        )
        .await
        .map(|_| ())
    }

    async fn search(
        &self,
        index: &str,
        filter: &Filter,
        size: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let builder = self
            .request(Method::POST, &format!("/{index}/_search"))?
            .json(&json!({ "size": size, "query": filter.to_query_dsl() }));
        let body = self.call("search", Some(index), builder).await?;
        Ok(parse_hits(index, &body))
    }

    async fn count(&self, index: &str) -> Result<u64, StoreError> {
        let body = self
            .call(
                "count",
                Some(index),
                self.request(Method::GET, &format!("/{index}/_count"))?,
            )
            .await?;
        body["count"]
            .as_u64()
            .ok_or_else(|| StoreError::Custom("count response without count".to_owned()))
    }

    async fn open_scroll(&self, request: &ScrollRequest) -> Result<ScrollPage, StoreError> {
        let sort = match &request.sort_field {
            Some(field) => json!([{ field: { "order": "asc", "missing": "_last" } }, "_doc"]),
            None => json!(["_doc"]),
        };
        let builder = self
            .request(
                Method::POST,
                &format!("/{}/_search?scroll={SCROLL_KEEP_ALIVE}", request.index),
            )?
            .json(&json!({
                "size": request.batch_size,
                "sort": sort,
                "query": request.filter.to_query_dsl(),
            }));
        let body = self
            .call("open_scroll", Some(&request.index), builder)
            .await?;
        Ok(parse_scroll_page(&request.index, &body))
    }

    async fn scroll(&self, scroll_id: &str) -> Result<ScrollPage, StoreError> {
        let builder = self
            .request(Method::POST, "/_search/scroll")?
            .json(&json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id }));
        let body = self.call("scroll", None, builder).await?;
        Ok(parse_scroll_page("", &body))
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), StoreError> {
        let builder = self
            .request(Method::DELETE, "/_search/scroll")?
            .json(&json!({ "scroll_id": scroll_id }));
        match self.call("clear_scroll", None, builder).await {
            Err(error) if error.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn start_reindex(&self, source: &str, dest: &str) -> Result<ReindexTask, StoreError> {
        // runs as a server task so the copy never races the request timeout
        let builder = self
            .request(
                Method::POST,
                "/_reindex?wait_for_completion=false&refresh=true",
            )?
            .json(&json!({ "source": { "index": source }, "dest": { "index": dest } }));
        let body = self.call("start_reindex", Some(source), builder).await?;
        body["task"]
            .as_str()
            .map(|task| ReindexTask(task.to_owned()))
            .ok_or_else(|| {
                StoreError::Custom(format!("reindex {source} -> {dest} returned no task: {body}"))
            })
    }

    async fn reindex_status(&self, task: &ReindexTask) -> Result<ReindexStatus, StoreError> {
        let body = self
            .call(
                "reindex_status",
                None,
                self.request(Method::GET, &format!("/_tasks/{}", task.0))?,
            )
            .await?;
        parse_task_status(&task.0, &body)
    }

    async fn field_limit(&self, index: &str) -> Result<u64, StoreError> {
        let body = self
            .call(
                "field_limit",
                Some(index),
                self.request(Method::GET, &format!("/{index}/_settings"))?,
            )
            .await?;
        let limit = &body[index]["settings"]["index"]["mapping"]["total_fields"]["limit"];
        Ok(limit
            .as_str()
            .and_then(|raw| raw.parse().ok())
            .or_else(|| limit.as_u64())
            .unwrap_or(DEFAULT_FIELD_LIMIT))
    }

    async fn set_field_limit(&self, index: &str, limit: u64) -> Result<(), StoreError> {
        let builder = self
            .request(Method::PUT, &format!("/{index}/_settings"))?
            .json(&json!({ "index.mapping.total_fields.limit": limit }));
        self.call("set_field_limit", Some(index), builder)
            .await
            .map(|_| ())
    }

    async fn refresh(&self, index: &str) -> Result<(), StoreError> {
        self.call(
            "refresh",
            Some(index),
            self.request(Method::POST, &format!("/{index}/_refresh"))?,
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_field_limit_errors() {
        let body = json!({
            "error": {
                "type": "illegal_argument_exception",
                "reason": "Limit of total fields [1000] in index [results-a] has been exceeded"
            }
        })
        .to_string();
        let error = map_error_body(StatusCode::BAD_REQUEST, Some("results-a"), &body);
        assert!(matches!(error, StoreError::FieldLimitExceeded { limit: 1000, .. }));
    }

    #[test]
    fn maps_dotted_field_errors() {
        let body = json!({
            "error": {
                "type": "mapper_parsing_exception",
                "reason": "Field name [score.max] cannot contain '.'"
            }
        })
        .to_string();
        match map_error_body(StatusCode::BAD_REQUEST, Some("results-a"), &body) {
            StoreError::IllegalFieldName { field, .. } => assert_eq!(field, "score.max"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn maps_missing_index_to_not_found() {
        let body = json!({ "error": { "type": "index_not_found_exception", "reason": "no such index" } })
            .to_string();
        assert!(map_error_body(StatusCode::NOT_FOUND, Some("x"), &body).is_not_found());
    }

    #[test]
    fn overloaded_node_is_retryable() {
        let error = map_error_body(StatusCode::SERVICE_UNAVAILABLE, None, "busy");
        assert!(error.is_retryable());
    }

    #[test]
    fn reindex_task_is_running_until_completed() {
        let running = json!({ "completed": false, "task": { "status": { "created": 10 } } });
        assert_eq!(
            parse_task_status("n:1", &running).expect("status"),
            ReindexStatus::Running
        );

        let done = json!({ "completed": true, "response": { "total": 42, "failures": [] } });
        assert_eq!(
            parse_task_status("n:1", &done).expect("status"),
            ReindexStatus::Completed { copied: 42 }
        );
    }

    #[test]
    fn reindex_task_failures_are_errors() {
        let failed = json!({
            "completed": true,
            "response": { "total": 3, "failures": [{ "id": "t1", "cause": "mapper" }] }
        });
        let error = parse_task_status("n:1", &failed).expect_err("failure reported");
        assert!(!error.is_retryable());
        assert!(error.to_string().contains("n:1"));
    }

    #[test]
    fn scroll_page_without_hits_closes_cursor() {
        let body = json!({ "_scroll_id": "abc", "hits": { "hits": [] } });
        let page = parse_scroll_page("traces", &body);
        assert!(page.scroll_id.is_none());
    }
}
