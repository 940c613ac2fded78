//! DOC engine adapter (Elasticsearch wire protocol over HTTP).
//!
//! Reads use the scroll API; the continuation token is a server-side
//! handle, so a skipped batch cannot be replayed and `skip` advances past
//! the failed page. Writes go through `_bulk` with per-item error checking.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

use datatrac_db::models::{DataSource, EngineKind};

use crate::error::AdapterError;

use super::{Cursor, EngineAdapter, EntityRef, EntityShape, Record, SchemaCharset};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the server keeps a scroll context alive between reads.
const SCROLL_KEEPALIVE: &str = "5m";

/// Adapter over one Elasticsearch-compatible cluster.
pub struct DocAdapter {
    client: reqwest::Client,
    base: String,
    username: String,
    password: String,
    /// Last scroll handle handed out; cleared server-side on close.
    scroll_id: Option<String>,
}

impl DocAdapter {
    /// Open a client and verify the cluster answers within the connect
    /// timeout.
    pub async fn open(source: &DataSource, password: &str) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Connect {
                host: source.host.clone(),
                port: source.port,
                message: e.to_string(),
            })?;

        let adapter = Self {
            client,
            base: format!("http://{}:{}", source.host, source.port),
            username: source.username.clone(),
            password: password.to_owned(),
            scroll_id: None,
        };

        // Ping the root endpoint so open fails fast on bad credentials or
        // an unreachable host.
        adapter
            .send(Method::GET, "/", None)
            .await
            .map_err(|e| AdapterError::Connect {
                host: source.host.clone(),
                port: source.port,
                message: e.to_string(),
            })?;

        Ok(adapter)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Issue a request and return the parsed JSON body on 2xx.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, AdapterError> {
        let mut request = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::Read(format!("{path}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AdapterError::Read(format!("{path}: {e}")))?;
        if !status.is_success() {
            return Err(AdapterError::Read(format!(
                "{path}: {status}: {}",
                snippet(&text)
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| AdapterError::Read(format!("{path}: bad response body: {e}")))
    }

    async fn clear_scroll(&mut self) {
        if let Some(scroll_id) = self.scroll_id.take() {
            let body = json!({ "scroll_id": [scroll_id] });
            let _ = self
                .client
                .request(Method::DELETE, self.url("/_search/scroll"))
                .basic_auth(&self.username, Some(&self.password))
                .json(&body)
                .send()
                .await;
        }
    }
}

/// Index names travel in URL paths; refuse anything that could change the
/// path shape.
fn validate_index(entity: &EntityRef) -> Result<&str, AdapterError> {
    let name = entity.name.as_str();
    let bad = name.is_empty()
        || name.len() > 255
        || name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '?' | '#' | '*' | '<' | '>' | '|' | ' ' | '"'));
    if bad {
        return Err(AdapterError::IllegalIdentifier(name.to_owned()));
    }
    Ok(name)
}

fn snippet(text: &str) -> &str {
    &text[..text.len().min(200)]
}

/// Pull `_source` out of a search hit, carrying the document id along.
fn hit_to_record(hit: &Value) -> Record {
    let mut record = hit
        .get("_source")
        .cloned()
        .unwrap_or_else(|| json!({}));
    if let (Some(object), Some(id)) = (record.as_object_mut(), hit.get("_id")) {
        object.insert("_id".to_owned(), id.clone());
    }
    record
}

#[async_trait]
impl EngineAdapter for DocAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Doc
    }

    async fn count_records(&mut self, entity: &EntityRef) -> Result<u64, AdapterError> {
        let index = validate_index(entity)?;
        let body = self.send(Method::GET, &format!("/{index}/_count"), None).await?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| AdapterError::Read(format!("no count in response for {index}")))
    }

    async fn read_batch(
        &mut self,
        entity: &EntityRef,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> Result<(Vec<Record>, Option<Cursor>), AdapterError> {
        let response = match cursor {
            None => {
                let index = validate_index(entity)?;
                let body = json!({
                    "size": limit,
                    "query": { "match_all": {} },
                    "sort": ["_doc"],
                });
                self.send(
                    Method::POST,
                    &format!("/{index}/_search?scroll={SCROLL_KEEPALIVE}"),
                    Some(&body),
                )
                .await?
            }
            Some(Cursor::Token(token)) => {
                let body = json!({
                    "scroll": SCROLL_KEEPALIVE,
                    "scroll_id": token,
                });
                self.send(Method::POST, "/_search/scroll", Some(&body)).await?
            }
            Some(Cursor::Offset(_)) => {
                return Err(AdapterError::Unsupported(
                    "DOC reads use scroll cursors".into(),
                ));
            }
        };

        let scroll_id = response
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self.scroll_id = scroll_id.clone();

        let hits = response
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if hits.is_empty() {
            self.clear_scroll().await;
            return Ok((Vec::new(), None));
        }

        let records: Vec<Record> = hits.iter().map(hit_to_record).collect();
        Ok((records, scroll_id.map(Cursor::Token)))
    }

    async fn write_batch(
        &mut self,
        entity: &EntityRef,
        records: &[Record],
    ) -> Result<(), AdapterError> {
        if records.is_empty() {
            return Ok(());
        }
        let index = validate_index(entity)?;

        let mut ndjson = String::new();
        for record in records {
            let mut doc = record.clone();
            let id = doc
                .as_object_mut()
                .and_then(|object| object.remove("_id"));
            let action = match id {
                Some(id) => json!({ "index": { "_index": index, "_id": id } }),
                None => json!({ "index": { "_index": index } }),
            };
            ndjson.push_str(&action.to_string());
            ndjson.push('\n');
            ndjson.push_str(&doc.to_string());
            ndjson.push('\n');
        }

        let response = self
            .client
            .post(self.url("/_bulk"))
            .basic_auth(&self.username, Some(&self.password))
            .header("content-type", "application/x-ndjson")
            .body(ndjson)
            .send()
            .await
            .map_err(|e| AdapterError::Write(format!("bulk to {index}: {e}")))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Write(format!("bulk to {index}: {e}")))?;
        if !status.is_success() {
            return Err(AdapterError::Write(format!(
                "bulk to {index}: {status}"
            )));
        }

        // _bulk returns 200 even when individual items fail.
        if body.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            let reason = body
                .pointer("/items/0/index/error/reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown item failure");
            let failed = body
                .get("items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| item.pointer("/index/error").is_some())
                        .count()
                })
                .unwrap_or(0);
            return Err(AdapterError::Write(format!(
                "bulk to {index}: {failed} item(s) failed: {reason}"
            )));
        }
        Ok(())
    }

    async fn describe(&mut self, entity: &EntityRef) -> Result<EntityShape, AdapterError> {
        let index = validate_index(entity)?;

        let mapping_body = self
            .send(Method::GET, &format!("/{index}/_mapping"), None)
            .await
            .map_err(|e| AdapterError::Schema(e.to_string()))?;
        let mappings = mapping_body
            .as_object()
            .and_then(|o| o.values().next())
            .and_then(|v| v.get("mappings"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        let settings_body = self
            .send(Method::GET, &format!("/{index}/_settings"), None)
            .await
            .map_err(|e| AdapterError::Schema(e.to_string()))?;
        let index_settings = settings_body
            .as_object()
            .and_then(|o| o.values().next())
            .and_then(|v| v.pointer("/settings/index"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        // Only portable settings survive the copy; server-managed ones
        // (uuid, version, creation_date) would be rejected on create.
        let mut portable = serde_json::Map::new();
        for key in ["number_of_shards", "number_of_replicas", "analysis"] {
            if let Some(value) = index_settings.get(key) {
                portable.insert(key.to_owned(), value.clone());
            }
        }

        Ok(EntityShape::Doc {
            mappings,
            settings: json!({ "index": portable }),
        })
    }

    async fn create_entity(
        &mut self,
        entity: &EntityRef,
        shape: &EntityShape,
    ) -> Result<(), AdapterError> {
        let index = validate_index(entity)?;
        let body = match shape {
            EntityShape::Doc { mappings, settings } => json!({
                "settings": settings,
                "mappings": mappings,
            }),
            // SQL source: no mapping to carry over, let the engine infer.
            EntityShape::Sql { .. } => json!({}),
        };

        match self.send(Method::PUT, &format!("/{index}"), Some(&body)).await {
            Ok(_) => Ok(()),
            // Racing create against an existing index is benign.
            Err(AdapterError::Read(message))
                if message.contains("resource_already_exists_exception") =>
            {
                Ok(())
            }
            Err(e) => Err(AdapterError::Schema(format!("create {index}: {e}"))),
        }
    }

    async fn truncate(&mut self, entity: &EntityRef) -> Result<(), AdapterError> {
        let index = validate_index(entity)?;
        let body = json!({ "query": { "match_all": {} } });
        self.send(
            Method::POST,
            &format!("/{index}/_delete_by_query?conflicts=proceed&refresh=true"),
            Some(&body),
        )
        .await
        .map_err(|e| AdapterError::Schema(format!("truncate {index}: {e}")))?;
        Ok(())
    }

    async fn drop_entity(&mut self, entity: &EntityRef) -> Result<(), AdapterError> {
        let index = validate_index(entity)?;
        let response = self
            .client
            .delete(self.url(&format!("/{index}")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| AdapterError::Schema(format!("drop {index}: {e}")))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(AdapterError::Schema(format!("drop {index}: {status}")))
        }
    }

    async fn entity_exists(&mut self, entity: &EntityRef) -> Result<bool, AdapterError> {
        let index = validate_index(entity)?;
        let response = self
            .client
            .head(self.url(&format!("/{index}")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| AdapterError::Read(format!("exists check on {index}: {e}")))?;
        Ok(response.status().is_success())
    }

    async fn ensure_schema(
        &mut self,
        _schema: &str,
        _charset: Option<&SchemaCharset>,
    ) -> Result<bool, AdapterError> {
        // Indices are not namespaced by schema.
        Ok(false)
    }

    async fn schema_charset(
        &mut self,
        _schema: &str,
    ) -> Result<Option<SchemaCharset>, AdapterError> {
        Ok(None)
    }

    async fn close(&mut self) {
        self.clear_scroll().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_validation() {
        assert!(validate_index(&EntityRef::index("logs-2024")).is_ok());
        assert!(validate_index(&EntityRef::index("")).is_err());
        assert!(validate_index(&EntityRef::index("a/b")).is_err());
        assert!(validate_index(&EntityRef::index("a b")).is_err());
        assert!(validate_index(&EntityRef::index("a*")).is_err());
        assert!(validate_index(&EntityRef::index(&"x".repeat(256))).is_err());
    }

    #[test]
    fn hit_to_record_carries_id() {
        let hit = json!({
            "_id": "doc-1",
            "_source": { "field": "value" }
        });
        let record = hit_to_record(&hit);
        assert_eq!(record["_id"], "doc-1");
        assert_eq!(record["field"], "value");
    }

    #[test]
    fn hit_without_source_is_empty_object() {
        let hit = json!({ "_id": "doc-2" });
        let record = hit_to_record(&hit);
        assert_eq!(record["_id"], "doc-2");
        assert_eq!(record.as_object().unwrap().len(), 1);
    }
}
