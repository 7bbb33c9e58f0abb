use crate::models::{
    ComplexityLevel, ContextSize, ExpansionPreference, ProcessingStyle, QueryAnalysis, QueryIntent,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    FastVector,
    StandardVector,
    Expanded,
    PageQuery,
}

#[derive(Debug, Clone, Copy)]
pub struct StrategyConfig {
    pub top_k: usize,
    pub similarity_threshold: f64,
    pub max_variants: usize,
}

impl SearchStrategy {
    pub fn name(self) -> &'static str {
        match self {
            SearchStrategy::FastVector => "fast_vector_search",
            SearchStrategy::StandardVector => "standard_vector_search",
            SearchStrategy::Expanded => "expanded_search",
            SearchStrategy::PageQuery => "page_query",
        }
    }

    pub fn config(self) -> StrategyConfig {
        match self {
            SearchStrategy::FastVector => StrategyConfig {
                top_k: 6,
                similarity_threshold: 0.75,
                max_variants: 2,
            },
            SearchStrategy::StandardVector => StrategyConfig {
                top_k: 10,
                similarity_threshold: 0.70,
                max_variants: 4,
            },
            SearchStrategy::Expanded => StrategyConfig {
                top_k: 18,
                similarity_threshold: 0.60,
                max_variants: 6,
            },
            // Page lookups bypass vector search entirely.
            SearchStrategy::PageQuery => StrategyConfig {
                top_k: 0,
                similarity_threshold: 0.0,
                max_variants: 1,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub strategy: SearchStrategy,
    pub confidence: f64,
}

// Below this winning margin the selector refuses to commit to a narrow
// search and degrades one tier toward the more thorough strategy.
const MIN_WINNING_MARGIN: i32 = 2;

// Above the largest score any vector tier can accumulate, so an explicit
// page reference always routes to the page lookup.
const PAGE_PRESENCE_BOOST: i32 = 10;

pub fn select(analysis: &QueryAnalysis, document_count: usize) -> Selection {
    let intent = analysis.classification.intent;
    let level = analysis.complexity.level;
    let has_pages = !analysis.extracted_pages.is_empty();

    if intent == QueryIntent::Summarization || analysis.rewriting.requires_hyde {
        return Selection {
            strategy: SearchStrategy::Expanded,
            confidence: 1.0,
        };
    }
    if level == ComplexityLevel::High && intent == QueryIntent::Analysis {
        return Selection {
            strategy: SearchStrategy::Expanded,
            confidence: 0.95,
        };
    }
    if level == ComplexityLevel::Low
        && intent == QueryIntent::Extraction
        && document_count >= 5
        && !has_pages
    {
        return Selection {
            strategy: SearchStrategy::FastVector,
            confidence: 0.9,
        };
    }

    let mut fast = 0i32;
    let mut standard = 0i32;
    let mut expanded = 0i32;
    let mut page = 0i32;

    match intent {
        QueryIntent::Extraction => fast += 2,
        QueryIntent::Conversational => fast += 1,
        QueryIntent::Analysis | QueryIntent::Comparison => expanded += 2,
        QueryIntent::Summarization => expanded += 3,
    }

    match level {
        ComplexityLevel::Low => fast += 2,
        ComplexityLevel::Medium => standard += 2,
        ComplexityLevel::High => expanded += 3,
    }

    match analysis.desired_context {
        ContextSize::Small => fast += 1,
        ContextSize::Medium => standard += 1,
        ContextSize::Large => expanded += 2,
    }

    match analysis.processing {
        ProcessingStyle::Focused => fast += 1,
        ProcessingStyle::Balanced => standard += 1,
        ProcessingStyle::Thorough => expanded += 2,
    }

    match analysis.expansion {
        ExpansionPreference::Narrow => fast += 1,
        ExpansionPreference::Moderate => standard += 1,
        ExpansionPreference::Broad => expanded += 2,
    }

    if analysis.context_window_hint >= 8_000 {
        expanded += 1;
    } else if analysis.context_window_hint > 0 && analysis.context_window_hint <= 2_000 {
        fast += 1;
    } else {
        standard += 1;
    }

    if has_pages {
        page += PAGE_PRESENCE_BOOST;
    }
    if analysis.keywords.len() >= 6 {
        expanded += 1;
    }
    if document_count >= 20 {
        expanded += 1;
    } else if document_count <= 2 {
        fast += 1;
    }

    let scored = [
        (SearchStrategy::PageQuery, page),
        (SearchStrategy::Expanded, expanded),
        (SearchStrategy::StandardVector, standard),
        (SearchStrategy::FastVector, fast),
    ];

    // First maximum wins so ties resolve toward the more thorough entry.
    let mut winner = SearchStrategy::StandardVector;
    let mut winner_score = i32::MIN;
    for (strategy, score) in scored {
        if score > winner_score {
            winner = strategy;
            winner_score = score;
        }
    }
    let runner_up = scored
        .iter()
        .filter(|(strategy, _)| *strategy != winner)
        .map(|(_, score)| *score)
        .max()
        .unwrap_or(0);

    if winner_score - runner_up < MIN_WINNING_MARGIN {
        winner = match winner {
            SearchStrategy::FastVector => SearchStrategy::StandardVector,
            SearchStrategy::StandardVector => SearchStrategy::Expanded,
            other => other,
        };
    }

    let total: i32 = scored.iter().map(|(_, score)| *score).sum();
    let confidence = if total > 0 {
        (winner_score as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.5
    };

    Selection {
        strategy: winner,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        QueryClassification, QueryComplexity, QueryRewriting, QueryType,
    };

    fn base_analysis() -> QueryAnalysis {
        QueryAnalysis {
            sanitized_query: "What is the termination clause?".to_string(),
            classification: QueryClassification {
                query_type: QueryType::Question,
                intent: QueryIntent::Extraction,
            },
            complexity: QueryComplexity {
                score: 0.2,
                level: ComplexityLevel::Low,
            },
            extracted_pages: Vec::new(),
            keywords: vec!["termination".to_string(), "clause".to_string()],
            desired_context: ContextSize::Small,
            processing: ProcessingStyle::Focused,
            expansion: ExpansionPreference::Narrow,
            context_window_hint: 1_500,
            rewriting: QueryRewriting {
                variants: Vec::new(),
                hyde_answer: None,
                requires_hyde: false,
            },
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let analysis = base_analysis();
        let first = select(&analysis, 3);
        let second = select(&analysis, 3);
        assert_eq!(first, second);
    }

    #[test]
    fn summarization_always_expands() {
        let mut analysis = base_analysis();
        analysis.classification.intent = QueryIntent::Summarization;
        let selection = select(&analysis, 1);
        assert_eq!(selection.strategy, SearchStrategy::Expanded);
        assert_eq!(selection.confidence, 1.0);
    }

    #[test]
    fn hyde_requirement_always_expands() {
        let mut analysis = base_analysis();
        analysis.rewriting.requires_hyde = true;
        analysis.rewriting.hyde_answer = Some("The clause likely allows...".to_string());
        let selection = select(&analysis, 1);
        assert_eq!(selection.strategy, SearchStrategy::Expanded);
        assert_eq!(selection.confidence, 1.0);
    }

    #[test]
    fn complex_analysis_intent_expands() {
        let mut analysis = base_analysis();
        analysis.classification.intent = QueryIntent::Analysis;
        analysis.complexity.level = ComplexityLevel::High;
        let selection = select(&analysis, 1);
        assert_eq!(selection.strategy, SearchStrategy::Expanded);
        assert!((selection.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn simple_extraction_over_many_documents_goes_fast() {
        let analysis = base_analysis();
        let selection = select(&analysis, 8);
        assert_eq!(selection.strategy, SearchStrategy::FastVector);
        assert!((selection.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn explicit_pages_select_page_query() {
        let mut analysis = base_analysis();
        analysis.extracted_pages = vec![5];
        let selection = select(&analysis, 1);
        assert_eq!(selection.strategy, SearchStrategy::PageQuery);

        // Even against many documents, a page reference wins over the fast tier.
        let selection = select(&analysis, 10);
        assert_eq!(selection.strategy, SearchStrategy::PageQuery);
    }

    #[test]
    fn thin_margins_degrade_toward_thorough() {
        let mut analysis = base_analysis();
        // Mixed signals: low complexity but thorough processing and medium scope.
        analysis.desired_context = ContextSize::Medium;
        analysis.processing = ProcessingStyle::Balanced;
        analysis.expansion = ExpansionPreference::Moderate;
        analysis.context_window_hint = 4_000;
        let selection = select(&analysis, 3);

        // Fast and standard end up close; the winner must not stay fast.
        assert_ne!(selection.strategy, SearchStrategy::FastVector);
    }

    #[test]
    fn confidence_is_normalized() {
        let analysis = base_analysis();
        let selection = select(&analysis, 1);
        assert!(selection.confidence > 0.0 && selection.confidence <= 1.0);
    }
}
