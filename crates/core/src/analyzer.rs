use crate::config::AnalyzerOptions;
use crate::error::QueryError;
use crate::models::{
    QueryAnalysis, QueryClassification, QueryComplexity, QueryIntent, QueryRewriting, QueryType,
    ContextSize, ExpansionPreference, ProcessingStyle,
};
use crate::prompts::{self, QueryAnalysisPrompt};
use crate::tokens;
use crate::traits::LanguageModel;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

pub struct QueryAnalyzer {
    llm: Arc<dyn LanguageModel>,
    options: AnalyzerOptions,
    sanitizer: Sanitizer,
}

struct Sanitizer {
    script_re: Regex,
    handler_re: Regex,
    protocol_re: Regex,
}

impl Sanitizer {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            script_re: Regex::new(r"(?is)<script[^>]*>.*?</script\s*>")?,
            handler_re: Regex::new(r#"(?i)\bon\w+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#)?,
            protocol_re: Regex::new(r"(?i)\b(javascript|vbscript|data)\s*:")?,
        })
    }

    // Applied to the raw query before the model sees it and again to every
    // rewritten variant the model returns.
    fn clean(&self, text: &str) -> String {
        let text = self.script_re.replace_all(text, " ");
        let text = self.handler_re.replace_all(&text, " ");
        let text = self.protocol_re.replace_all(&text, " ");
        tokens::normalize_whitespace(&text)
    }
}

impl QueryAnalyzer {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        options: AnalyzerOptions,
    ) -> Result<Self, QueryError> {
        let sanitizer = Sanitizer::new().map_err(|error| QueryError::Provider {
            stage: "query analysis",
            details: format!("sanitizer patterns failed to compile: {error}"),
        })?;
        Ok(Self {
            llm,
            options,
            sanitizer,
        })
    }

    pub async fn analyze(&self, query: &str) -> Result<QueryAnalysis, QueryError> {
        let sanitized = self.validate_and_sanitize(query)?;

        let prompt = format!("Question from a dataroom viewer:\n{sanitized}");
        let request = prompts::request::<QueryAnalysisPrompt>(prompt);
        let response = tokio::time::timeout(
            self.options.llm_timeout,
            self.llm.generate_structured(request),
        )
        .await
        .map_err(|_| QueryError::ProviderTimeout {
            stage: "query analysis",
        })??;

        let payload = prompts::decode::<QueryAnalysisPrompt>(&response)?;
        debug!(
            intent = ?payload.intent,
            complexity = payload.complexity_score,
            variants = payload.variants.len(),
            "query analyzed"
        );

        Ok(self.finish(sanitized, payload))
    }

    // Deterministic stand-in when the analysis call fails: lexical keywords
    // and page references, medium complexity, no rewriting.
    pub fn fallback_analysis(&self, query: &str) -> Result<QueryAnalysis, QueryError> {
        let sanitized = self.validate_and_sanitize(query)?;
        let keywords = unique_keywords(&sanitized, 8);
        let pages = extract_page_references(&sanitized);

        Ok(QueryAnalysis {
            classification: QueryClassification {
                query_type: QueryType::Question,
                intent: QueryIntent::Extraction,
            },
            complexity: QueryComplexity {
                score: 0.5,
                level: prompts::complexity_level(0.5),
            },
            extracted_pages: pages,
            keywords,
            desired_context: ContextSize::Medium,
            processing: ProcessingStyle::Balanced,
            expansion: ExpansionPreference::Moderate,
            context_window_hint: 4_000,
            rewriting: QueryRewriting {
                variants: Vec::new(),
                hyde_answer: None,
                requires_hyde: false,
            },
            sanitized_query: sanitized,
        })
    }

    fn validate_and_sanitize(&self, query: &str) -> Result<String, QueryError> {
        if query.trim().is_empty() {
            return Err(QueryError::Validation("query is empty".to_string()));
        }
        if query.len() > self.options.max_query_chars {
            return Err(QueryError::Validation(format!(
                "query exceeds {} characters",
                self.options.max_query_chars
            )));
        }

        let sanitized = self.sanitizer.clean(query);
        if sanitized.trim().is_empty() {
            return Err(QueryError::Validation(
                "query is empty after sanitization".to_string(),
            ));
        }
        Ok(sanitized)
    }

    fn finish(&self, sanitized: String, payload: prompts::AnalysisPayload) -> QueryAnalysis {
        let score = payload.complexity_score.clamp(0.0, 1.0);

        let mut variants: Vec<String> = Vec::new();
        for variant in payload.variants {
            let cleaned = self.sanitizer.clean(&variant);
            if !cleaned.is_empty() && !variants.contains(&cleaned) && cleaned != sanitized {
                variants.push(cleaned);
            }
            if variants.len() >= self.options.max_variants {
                break;
            }
        }

        let mut pages: Vec<u32> = payload
            .pages
            .into_iter()
            .filter(|page| *page > 0)
            .collect();
        pages.sort_unstable();
        pages.dedup();

        let hyde_answer = payload
            .hyde_answer
            .map(|answer| self.sanitizer.clean(&answer))
            .filter(|answer| !answer.is_empty());

        QueryAnalysis {
            classification: QueryClassification {
                query_type: payload.query_type,
                intent: payload.intent,
            },
            complexity: QueryComplexity {
                score,
                level: prompts::complexity_level(score),
            },
            extracted_pages: pages,
            keywords: payload
                .keywords
                .into_iter()
                .map(|keyword| keyword.to_lowercase())
                .filter(|keyword| !keyword.trim().is_empty())
                .collect(),
            desired_context: payload.desired_context,
            processing: payload.processing,
            expansion: payload.expansion,
            context_window_hint: payload.context_window_hint,
            rewriting: QueryRewriting {
                requires_hyde: payload.requires_hyde && hyde_answer.is_some(),
                hyde_answer,
                variants,
            },
            sanitized_query: sanitized,
        }
    }
}

pub fn extract_page_references(query: &str) -> Vec<u32> {
    let re = match Regex::new(r"(?i)\b(?:page|p\.?)\s*(\d{1,4})\b") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let mut pages: Vec<u32> = re
        .captures_iter(query)
        .filter_map(|captures| captures[1].parse::<u32>().ok())
        .filter(|page| *page > 0)
        .collect();
    pages.sort_unstable();
    pages.dedup();
    pages
}

fn unique_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut keywords = Vec::new();
    for word in tokens::significant_words(text) {
        if !keywords.contains(&word) {
            keywords.push(word);
        }
        if keywords.len() >= limit {
            break;
        }
    }
    keywords
}
