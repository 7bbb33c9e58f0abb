use crate::chunking::ChunkingEngine;
use crate::embedding::EmbeddingGenerator;
use crate::error::IngestError;
use crate::models::{DocumentFingerprint, PageText};
use crate::stores::qdrant::chunk_payload;
use crate::traits::{VectorIndex, VectorPoint};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

const UPSERT_BATCH: usize = 200;

pub struct ExtractedDocument {
    pub fingerprint: DocumentFingerprint,
    pub pages: Vec<PageText>,
}

pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

pub struct DocumentIngestion {
    pub document_id: String,
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub cached_count: usize,
    pub failed_count: usize,
    pub total_tokens: usize,
}

pub struct IngestionReport {
    pub documents: Vec<DocumentIngestion>,
    pub skipped: Vec<SkippedDocument>,
}

pub fn discover_text_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_text = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                ext.eq_ignore_ascii_case("md")
                    || ext.eq_ignore_ascii_case("markdown")
                    || ext.eq_ignore_ascii_case("txt")
            });

        if is_text {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

// Extraction runs upstream; page boundaries arrive as form feeds.
pub fn split_pages(text: &str) -> Vec<PageText> {
    let raw: Vec<&str> = if text.contains('\u{c}') {
        text.split('\u{c}').collect()
    } else {
        vec![text]
    };

    raw.iter()
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(index, page)| PageText {
            number: index as u32 + 1,
            text: page.to_string(),
        })
        .collect()
}

pub fn load_extracted_document(path: &Path) -> Result<ExtractedDocument, IngestError> {
    let text = fs::read_to_string(path)?;
    let pages = split_pages(&text);
    if pages.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no extractable text in {}",
            path.display()
        )));
    }

    let checksum = digest_file(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;

    Ok(ExtractedDocument {
        fingerprint: DocumentFingerprint {
            document_id: document_id_for(name, &checksum),
            document_title: name.to_string(),
            source_path: path.to_string_lossy().to_string(),
            page_count: pages.iter().map(|page| page.number).max().unwrap_or(1),
            checksum,
            ingested_at: Utc::now(),
        },
        pages,
    })
}

fn document_id_for(name: &str, checksum: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(checksum.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

pub struct IngestPipeline {
    chunker: ChunkingEngine,
    embedder: Arc<EmbeddingGenerator>,
    index: Arc<dyn VectorIndex>,
}

impl IngestPipeline {
    pub fn new(
        chunker: ChunkingEngine,
        embedder: Arc<EmbeddingGenerator>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            chunker,
            embedder,
            index,
        }
    }

    pub async fn ingest_document(
        &self,
        dataroom_id: &str,
        document: &ExtractedDocument,
    ) -> Result<DocumentIngestion, IngestError> {
        let full_text = document
            .pages
            .iter()
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let chunks = self.chunker.chunk(
            &full_text,
            &document.fingerprint.document_id,
            dataroom_id,
            &document.pages,
        )?;

        let report = self.embedder.embed_chunks(&chunks).await;
        let embedded: std::collections::HashMap<&str, &Vec<f32>> = report
            .embeddings
            .iter()
            .map(|embedding| (embedding.chunk_id.as_str(), &embedding.vector))
            .collect();

        let points: Vec<VectorPoint> = chunks
            .iter()
            .filter_map(|chunk| {
                embedded.get(chunk.id.as_str()).map(|vector| VectorPoint {
                    id: chunk.id.clone(),
                    vector: (*vector).clone(),
                    payload: chunk_payload(
                        chunk,
                        &document.fingerprint.document_title,
                        document.fingerprint.page_count,
                    ),
                })
            })
            .collect();

        self.index
            .ensure_collection(dataroom_id, self.embedder.dimensions())
            .await
            .map_err(|error| IngestError::Index(error.to_string()))?;
        for batch in points.chunks(UPSERT_BATCH) {
            self.index
                .upsert(dataroom_id, batch.to_vec())
                .await
                .map_err(|error| IngestError::Index(error.to_string()))?;
        }

        info!(
            document = %document.fingerprint.document_id,
            chunks = chunks.len(),
            indexed = points.len(),
            "document ingested"
        );

        Ok(DocumentIngestion {
            document_id: document.fingerprint.document_id.clone(),
            chunk_count: chunks.len(),
            embedded_count: report.new_count,
            cached_count: report.cached_count,
            failed_count: report.failed_count,
            total_tokens: report.total_tokens,
        })
    }

    // Chunks are immutable after finalization; a re-index is delete+recreate.
    pub async fn reindex_document(
        &self,
        dataroom_id: &str,
        document: &ExtractedDocument,
    ) -> Result<DocumentIngestion, IngestError> {
        self.index
            .delete_documents(
                dataroom_id,
                &[document.fingerprint.document_id.clone()],
            )
            .await
            .map_err(|error| IngestError::Index(error.to_string()))?;
        self.ingest_document(dataroom_id, document).await
    }

    pub async fn ingest_folder(
        &self,
        dataroom_id: &str,
        folder: &Path,
    ) -> Result<IngestionReport, IngestError> {
        let files = discover_text_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no extracted documents found in {}",
                folder.display()
            )));
        }

        let mut documents = Vec::new();
        let mut skipped = Vec::new();

        for path in files {
            let outcome = match load_extracted_document(&path) {
                Ok(document) => self.ingest_document(dataroom_id, &document).await,
                Err(error) => Err(error),
            };

            match outcome {
                Ok(ingestion) => documents.push(ingestion),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping document");
                    skipped.push(SkippedDocument {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(IngestionReport {
            documents,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingOptions;
    use crate::embedding::HashedNgramEmbedder;
    use crate::error::QueryError;
    use crate::models::ChunkingOptions;
    use crate::tokens::TokenCounter;
    use crate::traits::{ScoredPoint, SearchFilter};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingIndex {
        upserted: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VectorIndex for RecordingIndex {
        async fn ensure_collection(
            &self,
            _dataroom_id: &str,
            _vector_size: usize,
        ) -> Result<(), QueryError> {
            Ok(())
        }

        async fn upsert(
            &self,
            _dataroom_id: &str,
            points: Vec<VectorPoint>,
        ) -> Result<(), QueryError> {
            self.upserted
                .lock()
                .unwrap()
                .extend(points.into_iter().map(|point| point.id));
            Ok(())
        }

        async fn search(
            &self,
            _dataroom_id: &str,
            _vector: &[f32],
            _top_k: usize,
            _threshold: f64,
            _filter: Option<&SearchFilter>,
        ) -> Result<Vec<ScoredPoint>, QueryError> {
            Ok(Vec::new())
        }

        async fn delete_documents(
            &self,
            _dataroom_id: &str,
            document_ids: &[String],
        ) -> Result<(), QueryError> {
            self.deleted
                .lock()
                .unwrap()
                .extend(document_ids.iter().cloned());
            Ok(())
        }
    }

    fn pipeline(index: Arc<RecordingIndex>) -> IngestPipeline {
        let counter = TokenCounter::new().unwrap();
        let chunker =
            ChunkingEngine::new(counter.clone(), ChunkingOptions::default()).unwrap();
        let embedder = Arc::new(EmbeddingGenerator::new(
            Arc::new(HashedNgramEmbedder::default()),
            counter,
            EmbeddingOptions::default(),
        ));
        IngestPipeline::new(chunker, embedder, index)
    }

    fn document(text: &str) -> ExtractedDocument {
        let pages = split_pages(text);
        ExtractedDocument {
            fingerprint: DocumentFingerprint {
                document_id: "doc16chars000000".to_string(),
                document_title: "agreement.md".to_string(),
                source_path: "/tmp/agreement.md".to_string(),
                checksum: "checksum".to_string(),
                page_count: pages.iter().map(|page| page.number).max().unwrap_or(1),
                ingested_at: Utc::now(),
            },
            pages,
        }
    }

    #[test]
    fn discovery_is_recursive_and_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("b.md"), "# B")?;
        fs::write(nested.join("a.txt"), "A")?;
        fs::write(dir.path().join("ignored.pdf"), "binary")?;

        let files = discover_text_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("nested/a.txt") || files[1].ends_with("nested/a.txt"));
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("a.md");
        fs::write(&path, "contents")?;
        assert_eq!(digest_file(&path)?, digest_file(&path)?);
        Ok(())
    }

    #[test]
    fn form_feeds_split_pages() {
        let pages = split_pages("page one text\u{c}page two text\u{c}\u{c}page four text");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].number, 1);
        assert_eq!(pages[1].number, 2);
        // Blank pages keep their position in the numbering.
        assert_eq!(pages[2].number, 4);
    }

    #[test]
    fn document_without_form_feeds_is_one_page() {
        let pages = split_pages("all on a single page");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].number, 1);
    }

    #[tokio::test]
    async fn ingestion_chunks_embeds_and_indexes() {
        let index = Arc::new(RecordingIndex::default());
        let pipeline = pipeline(index.clone());

        let text = "# Purchase Agreement\n\nThe buyer agrees to acquire all outstanding \
                    shares subject to the conditions below, including regulatory approval \
                    and the absence of material adverse changes before the closing date.";
        let ingestion = pipeline
            .ingest_document("room-1", &document(text))
            .await
            .unwrap();

        assert!(ingestion.chunk_count > 0);
        assert_eq!(
            ingestion.chunk_count,
            index.upserted.lock().unwrap().len()
        );
        assert_eq!(ingestion.failed_count, 0);
    }

    #[tokio::test]
    async fn reindex_deletes_before_writing() {
        let index = Arc::new(RecordingIndex::default());
        let pipeline = pipeline(index.clone());

        let text = "# Terms\n\nA body of text long enough to survive chunk filtering and \
                    produce at least one indexed chunk for the reindex test.";
        pipeline
            .reindex_document("room-1", &document(text))
            .await
            .unwrap();

        assert_eq!(
            index.deleted.lock().unwrap().as_slice(),
            &["doc16chars000000".to_string()]
        );
        assert!(!index.upserted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn folder_ingestion_skips_unreadable_documents() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        fs::write(
            dir.path().join("good.md"),
            "# Good\n\nEnough text here to produce a chunk that passes the minimum \
             size filters applied during finalization of the chunk list.",
        )?;
        fs::write(dir.path().join("empty.md"), "   ")?;

        let index = Arc::new(RecordingIndex::default());
        let pipeline = pipeline(index);
        let report = pipeline.ingest_folder("room-1", dir.path()).await?;

        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].path.ends_with("empty.md"));
        Ok(())
    }

    #[tokio::test]
    async fn folder_without_documents_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = Arc::new(RecordingIndex::default());
        let pipeline = pipeline(index);
        assert!(pipeline.ingest_folder("room-1", dir.path()).await.is_err());
        Ok(())
    }
}
