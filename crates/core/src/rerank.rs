use crate::models::SearchResult;
use std::collections::HashMap;
use tracing::debug;

// Deterministic TF-IDF cosine reranking. Provider-independent by design: on
// any degenerate input it hands back the original similarity ordering.
pub fn rerank(query: &str, results: Vec<SearchResult>) -> Vec<SearchResult> {
    match try_rerank(query, &results) {
        Some(reranked) => {
            debug!(candidates = reranked.len(), "tf-idf rerank applied");
            reranked
        }
        None => results,
    }
}

fn try_rerank(query: &str, results: &[SearchResult]) -> Option<Vec<SearchResult>> {
    if results.len() < 2 {
        return None;
    }

    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return None;
    }

    let documents: Vec<Vec<String>> = results
        .iter()
        .map(|result| tokenize(&result.content))
        .collect();
    if documents.iter().any(|terms| terms.is_empty()) {
        return None;
    }

    let mut document_frequency: HashMap<&str, usize> = HashMap::new();
    for terms in &documents {
        let mut seen: Vec<&str> = Vec::new();
        for term in terms {
            if !seen.contains(&term.as_str()) {
                seen.push(term);
                *document_frequency.entry(term).or_insert(0) += 1;
            }
        }
    }

    let pool_size = documents.len() as f64;
    let idf = |term: &str| -> f64 {
        let df = document_frequency.get(term).copied().unwrap_or(0) as f64;
        (pool_size / (1.0 + df)).ln() + 1.0
    };

    let query_vector = weighted_vector(&query_terms, &idf);
    let scores: Vec<f64> = documents
        .iter()
        .map(|terms| cosine(&query_vector, &weighted_vector(terms, &idf)))
        .collect();

    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max - min).is_finite() || (max - min) < 1e-9 {
        return None;
    }

    let mut ranked: Vec<(usize, f64)> = scores
        .iter()
        .map(|score| (score - min) / (max - min))
        .enumerate()
        .collect();
    ranked.sort_by(|left, right| {
        right
            .1
            .total_cmp(&left.1)
            .then_with(|| left.0.cmp(&right.0))
    });

    Some(
        ranked
            .into_iter()
            .map(|(index, score)| {
                let mut result = results[index].clone();
                result.similarity = score;
                result
            })
            .collect(),
    )
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|character: char| !character.is_alphanumeric())
        .filter(|term| term.len() > 2)
        .map(|term| term.to_lowercase())
        .collect()
}

fn weighted_vector<'a>(
    terms: &'a [String],
    idf: &dyn Fn(&str) -> f64,
) -> HashMap<&'a str, f64> {
    let length = terms.len() as f64;
    let mut counts: HashMap<&str, f64> = HashMap::new();
    for term in terms {
        *counts.entry(term).or_insert(0.0) += 1.0;
    }
    counts
        .into_iter()
        .map(|(term, count)| (term, (count / length) * idf(term)))
        .collect()
}

fn cosine(left: &HashMap<&str, f64>, right: &HashMap<&str, f64>) -> f64 {
    let dot: f64 = left
        .iter()
        .filter_map(|(term, weight)| right.get(term).map(|other| weight * other))
        .sum();
    let left_norm: f64 = left.values().map(|weight| weight * weight).sum::<f64>().sqrt();
    let right_norm: f64 = right.values().map(|weight| weight * weight).sum::<f64>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}
