use crate::error::QueryError;
use crate::models::{Chunk, IndexedDocument};
use crate::search::page_range_matches;
use crate::traits::{ChunkStore, ScoredPoint, SearchFilter, VectorIndex, VectorPoint};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

pub struct QdrantStore {
    endpoint: String,
    collection_prefix: String,
    api_key: Option<String>,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection_prefix: impl Into<String>,
        vector_size: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            collection_prefix: collection_prefix.into(),
            api_key: None,
            client: Client::new(),
            vector_size,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    // One collection per dataroom.
    fn collection(&self, dataroom_id: &str) -> String {
        format!("{}-{}", self.collection_prefix, dataroom_id)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn scroll_filter(
        &self,
        dataroom_id: &str,
        filter: Value,
        page_limit: usize,
    ) -> Result<Vec<Value>, QueryError> {
        let mut collected = Vec::new();
        let mut offset: Option<Value> = None;

        loop {
            let mut body = json!({
                "filter": filter,
                "limit": page_limit,
                "with_payload": true,
                "with_vector": false,
            });
            if let Some(from) = &offset {
                body["offset"] = from.clone();
            }

            let response = self
                .request(self.client.post(format!(
                    "{}/collections/{}/points/scroll",
                    self.endpoint,
                    self.collection(dataroom_id)
                )))
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(QueryError::BackendResponse {
                    backend: "qdrant".to_string(),
                    details: response.status().to_string(),
                });
            }

            let parsed: Value = response.json().await?;
            let points = parsed
                .pointer("/result/points")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            collected.extend(points);

            offset = parsed
                .pointer("/result/next_page_offset")
                .filter(|next| !next.is_null())
                .cloned();
            if offset.is_none() {
                break;
            }
        }

        Ok(collected)
    }
}

// Qdrant point ids must be UUIDs; derive them from the deterministic chunk id
// so re-indexing the same document overwrites in place.
pub fn point_id_for_chunk(chunk_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string()
}

pub fn chunk_payload(chunk: &Chunk, document_title: &str, document_page_count: u32) -> Value {
    let mut payload = serde_json::to_value(chunk).unwrap_or_else(|_| json!({}));
    payload["document_title"] = json!(document_title);
    payload["document_page_count"] = json!(document_page_count);
    payload
}

pub fn payload_to_chunk(payload: &Value) -> Option<Chunk> {
    serde_json::from_value(payload.clone()).ok()
}

fn document_filter(document_ids: &[String]) -> Value {
    json!({
        "must": [
            {"key": "document_id", "match": {"any": document_ids}}
        ]
    })
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn ensure_collection(
        &self,
        dataroom_id: &str,
        vector_size: usize,
    ) -> Result<(), QueryError> {
        if self.vector_size != vector_size {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: format!(
                    "configured vector size {} does not match requested {}",
                    self.vector_size, vector_size
                ),
            });
        }

        let collection = self.collection(dataroom_id);
        let response = self
            .request(
                self.client
                    .get(format!("{}/collections/{}", self.endpoint, collection)),
            )
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }
        if !response.status().is_client_error() {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let response = self
            .request(
                self.client
                    .put(format!("{}/collections/{}", self.endpoint, collection)),
            )
            .json(&json!({
                "vectors": {
                    "size": vector_size,
                    "distance": "Cosine",
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: format!("collection setup failed with {}", response.status()),
            });
        }
        Ok(())
    }

    async fn upsert(
        &self,
        dataroom_id: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), QueryError> {
        if points.is_empty() {
            return Ok(());
        }

        let body: Vec<Value> = points
            .iter()
            .map(|point| {
                if point.vector.len() != self.vector_size {
                    return Err(QueryError::BackendResponse {
                        backend: "qdrant".to_string(),
                        details: format!(
                            "embedding dimension {} != {}",
                            point.vector.len(),
                            self.vector_size
                        ),
                    });
                }
                Ok(json!({
                    "id": point_id_for_chunk(&point.id),
                    "vector": point.vector,
                    "payload": point.payload,
                }))
            })
            .collect::<Result<Vec<_>, QueryError>>()?;

        let response = self
            .request(self.client.put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint,
                self.collection(dataroom_id)
            )))
            .json(&json!({ "points": body }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }

    async fn search(
        &self,
        dataroom_id: &str,
        vector: &[f32],
        top_k: usize,
        threshold: f64,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredPoint>, QueryError> {
        if vector.len() != self.vector_size {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: format!("query vector dim {} is not {}", vector.len(), self.vector_size),
            });
        }

        let mut body = json!({
            "vector": vector,
            "limit": top_k,
            "score_threshold": threshold,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            if !filter.document_ids.is_empty() {
                body["filter"] = document_filter(&filter.document_ids);
            }
        }

        let response = self
            .request(self.client.post(format!(
                "{}/collections/{}/points/search",
                self.endpoint,
                self.collection(dataroom_id)
            )))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut points = Vec::with_capacity(hits.len());
        for hit in hits {
            let payload = hit.pointer("/payload").cloned().unwrap_or(Value::Null);

            // Range strings can't be matched inside the engine; the page
            // filter finishes here.
            if let Some(filter) = filter {
                if !filter.pages.is_empty() {
                    let matches = payload
                        .pointer("/page_ranges")
                        .and_then(Value::as_array)
                        .map(|ranges| {
                            ranges.iter().filter_map(Value::as_str).any(|range| {
                                filter.pages.iter().any(|page| page_range_matches(range, *page))
                            })
                        })
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                }
            }

            points.push(ScoredPoint {
                id: hit
                    .pointer("/id")
                    .map(|id| id.to_string().trim_matches('"').to_string())
                    .unwrap_or_default(),
                score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0),
                payload,
            });
        }
        Ok(points)
    }

    async fn delete_documents(
        &self,
        dataroom_id: &str,
        document_ids: &[String],
    ) -> Result<(), QueryError> {
        if document_ids.is_empty() {
            return Ok(());
        }

        let response = self
            .request(self.client.post(format!(
                "{}/collections/{}/points/delete?wait=true",
                self.endpoint,
                self.collection(dataroom_id)
            )))
            .json(&json!({ "filter": document_filter(document_ids) }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for QdrantStore {
    async fn chunks_by_pages(
        &self,
        dataroom_id: &str,
        document_ids: &[String],
        pages: &[u32],
    ) -> Result<Vec<Chunk>, QueryError> {
        if document_ids.is_empty() || pages.is_empty() {
            return Ok(Vec::new());
        }

        let points = self
            .scroll_filter(dataroom_id, document_filter(document_ids), 256)
            .await?;

        let mut chunks: Vec<Chunk> = points
            .iter()
            .filter_map(|point| point.pointer("/payload"))
            .filter_map(payload_to_chunk)
            .filter(|chunk| {
                chunk.page_ranges.iter().any(|range| {
                    pages.iter().any(|page| page_range_matches(range, *page))
                })
            })
            .collect();
        chunks.sort_by(|left, right| {
            left.document_id
                .cmp(&right.document_id)
                .then(left.chunk_index.cmp(&right.chunk_index))
        });
        Ok(chunks)
    }

    async fn chunks_by_document(
        &self,
        dataroom_id: &str,
        document_id: &str,
    ) -> Result<Vec<Chunk>, QueryError> {
        let filter = document_filter(&[document_id.to_string()]);
        let points = self.scroll_filter(dataroom_id, filter, 256).await?;

        let mut chunks: Vec<Chunk> = points
            .iter()
            .filter_map(|point| point.pointer("/payload"))
            .filter_map(payload_to_chunk)
            .collect();
        chunks.sort_by_key(|chunk| chunk.chunk_index);
        Ok(chunks)
    }

    async fn list_documents(&self, dataroom_id: &str) -> Result<Vec<IndexedDocument>, QueryError> {
        let points = self
            .scroll_filter(dataroom_id, json!({"must": []}), 256)
            .await?;

        let mut documents: HashMap<String, IndexedDocument> = HashMap::new();
        for point in &points {
            let Some(payload) = point.pointer("/payload") else {
                continue;
            };
            let Some(document_id) = payload.pointer("/document_id").and_then(Value::as_str) else {
                continue;
            };
            let title = payload
                .pointer("/document_title")
                .and_then(Value::as_str)
                .unwrap_or(document_id)
                .to_string();
            let page_count = payload
                .pointer("/document_page_count")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;

            documents
                .entry(document_id.to_string())
                .and_modify(|existing| existing.page_count = existing.page_count.max(page_count))
                .or_insert(IndexedDocument {
                    document_id: document_id.to_string(),
                    title,
                    page_count,
                });
        }

        let mut listed: Vec<IndexedDocument> = documents.into_values().collect();
        listed.sort_by(|left, right| left.document_id.cmp(&right.document_id));
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_deterministic_uuids() {
        let first = point_id_for_chunk("doc-1_chunk_0");
        let second = point_id_for_chunk("doc-1_chunk_0");
        let other = point_id_for_chunk("doc-1_chunk_1");
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn payload_round_trips_a_chunk() {
        let chunk = Chunk {
            id: "doc-1_chunk_0".to_string(),
            content: "The termination clause requires notice.".to_string(),
            document_id: "doc-1".to_string(),
            dataroom_id: "room-1".to_string(),
            chunk_index: 0,
            content_hash: "abc".to_string(),
            token_count: 8,
            page_ranges: vec!["5".to_string()],
            section_header: Some("Terms".to_string()),
            header_hierarchy: vec!["Agreement".to_string(), "Terms".to_string()],
            is_small_chunk: false,
        };

        let payload = chunk_payload(&chunk, "Purchase Agreement", 12);
        assert_eq!(payload["document_title"], "Purchase Agreement");
        assert_eq!(payload["document_page_count"], 12);

        let restored = payload_to_chunk(&payload).unwrap();
        assert_eq!(restored.id, chunk.id);
        assert_eq!(restored.page_ranges, chunk.page_ranges);
        assert_eq!(restored.header_hierarchy, chunk.header_hierarchy);
    }

    #[tokio::test]
    async fn vector_size_mismatch_is_rejected_before_any_call() {
        let store = QdrantStore::new("http://localhost:6333", "dataroom", 256);
        let error = store.ensure_collection("room-1", 128).await.unwrap_err();
        assert!(matches!(error, QueryError::BackendResponse { .. }));
    }
}
