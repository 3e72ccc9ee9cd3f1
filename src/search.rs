//! Reranking and display of backend search hits.
//!
//! The backend's raw scores are min-max normalized to `[0, 1]` and blended
//! with query-term coverage (the fraction of distinct query terms present in
//! the hit's text):
//!
//! ```text
//! score = 0.5 * normalized + 0.5 * coverage
//! ```
//!
//! Ties keep the backend's order.

use std::collections::HashSet;

use crate::backend::SearchHit;

const SCORE_WEIGHT: f64 = 0.5;
const EXCERPT_CHARS: usize = 200;

/// Min-max normalize scores to [0, 1]. Equal scores all map to 1.0.
fn normalize_scores(hits: &[SearchHit]) -> Vec<f64> {
    if hits.is_empty() {
        return Vec::new();
    }

    let s_min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let s_max = hits
        .iter()
        .map(|h| h.score)
        .fold(f64::NEG_INFINITY, f64::max);

    hits.iter()
        .map(|h| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (h.score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Fraction of distinct query terms that appear in `text`.
fn coverage(query_terms: &HashSet<String>, text: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms = terms(text);
    let hit = query_terms.iter().filter(|t| text_terms.contains(*t)).count();
    hit as f64 / query_terms.len() as f64
}

pub fn rerank(query: &str, hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let query_terms = terms(query);
    let normalized = normalize_scores(&hits);

    let mut scored: Vec<SearchHit> = hits
        .into_iter()
        .zip(normalized)
        .map(|(mut hit, norm)| {
            hit.score = SCORE_WEIGHT * norm + (1.0 - SCORE_WEIGHT) * coverage(&query_terms, &hit.text);
            hit
        })
        .collect();

    // sort_by is stable, so equal scores keep backend order
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored
}

pub fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.2}] {}", i + 1, hit.score, hit.source);
        let excerpt: String = hit
            .text
            .replace('\n', " ")
            .trim()
            .chars()
            .take(EXCERPT_CHARS)
            .collect();
        println!("    excerpt: \"{}\"", excerpt);
        println!("    id: {} (chunk {})", hit.unique_id, hit.chunk_index);
        println!();
    }
}
