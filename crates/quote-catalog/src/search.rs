//! Fuzzy product search over the catalog.

use std::collections::{BTreeSet, HashMap};

use quote_core::{Catalog, QuoteError, SearchResult};
use strsim::jaro_winkler;
use tracing::debug;

pub const DEFAULT_OVERSAMPLE: usize = 2;

/// Similarity between a query and a row's composite text, 0..=100.
pub trait SimilarityScorer: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, query: &str, candidate: &str) -> u8;
}

/// Lowercases, replaces everything but letters, digits and `_` with spaces,
/// and trims.
pub fn full_process(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' {
                c.to_lowercase().collect::<String>()
            } else {
                " ".to_string()
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn token_set(processed: &str) -> BTreeSet<&str> {
    processed.split_whitespace().collect()
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Indel similarity `2 * lcs / (len_a + len_b)` on a 0..=100 scale. Either
/// side empty scores 0.
pub fn indel_ratio(a: &str, b: &str) -> u8 {
    let a = a.chars().collect::<Vec<_>>();
    let b = b.chars().collect::<Vec<_>>();
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let ratio = 2.0 * lcs_len(&a, &b) as f64 / (a.len() + b.len()) as f64;
    (100.0 * ratio).round_ties_even() as u8
}

fn joined(parts: &[&str]) -> String {
    parts.join(" ")
}

/// Token-set ratio: compares the shared tokens against each side's full
/// sorted token list and keeps the best pairing. Insensitive to case,
/// punctuation, token order and repeated tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSetScorer;

impl SimilarityScorer for TokenSetScorer {
    fn name(&self) -> &'static str {
        "token-set"
    }

    fn score(&self, query: &str, candidate: &str) -> u8 {
        let a = full_process(query);
        let b = full_process(candidate);
        if a.is_empty() || b.is_empty() {
            return 0;
        }
        let tokens_a = token_set(&a);
        let tokens_b = token_set(&b);

        let sect = tokens_a.intersection(&tokens_b).copied().collect::<Vec<_>>();
        let diff_ab = tokens_a.difference(&tokens_b).copied().collect::<Vec<_>>();
        let diff_ba = tokens_b.difference(&tokens_a).copied().collect::<Vec<_>>();

        let sorted_sect = joined(&sect);
        let combined_ab = format!("{sorted_sect} {}", joined(&diff_ab)).trim().to_string();
        let combined_ba = format!("{sorted_sect} {}", joined(&diff_ba)).trim().to_string();

        [
            indel_ratio(&sorted_sect, &combined_ab),
            indel_ratio(&sorted_sect, &combined_ba),
            indel_ratio(&combined_ab, &combined_ba),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// Jaro-Winkler over the sorted unique tokens of both sides.
#[derive(Debug, Clone, Copy, Default)]
pub struct JaroWinklerScorer;

impl SimilarityScorer for JaroWinklerScorer {
    fn name(&self) -> &'static str {
        "jaro-winkler"
    }

    fn score(&self, query: &str, candidate: &str) -> u8 {
        let a = full_process(query);
        let b = full_process(candidate);
        if a.is_empty() || b.is_empty() {
            return 0;
        }
        let a = token_set(&a).into_iter().collect::<Vec<_>>().join(" ");
        let b = token_set(&b).into_iter().collect::<Vec<_>>().join(" ");
        (jaro_winkler(&a, &b) * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

pub fn scorer_by_name(name: &str) -> Option<Box<dyn SimilarityScorer>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "token-set" | "token_set" => Some(Box::new(TokenSetScorer)),
        "jaro-winkler" | "jaro_winkler" => Some(Box::new(JaroWinklerScorer)),
        _ => None,
    }
}

/// Keeps the best score per row, in first-seen order.
pub fn collapse_by_row(candidates: &[(usize, u8)]) -> Vec<(usize, u8)> {
    let mut best: HashMap<usize, usize> = HashMap::new();
    let mut out: Vec<(usize, u8)> = Vec::new();
    for &(idx, score) in candidates {
        match best.get(&idx) {
            Some(&pos) => {
                if score > out[pos].1 {
                    out[pos].1 = score;
                }
            }
            None => {
                best.insert(idx, out.len());
                out.push((idx, score));
            }
        }
    }
    out
}

/// Score descending, then row index ascending.
pub fn rank_candidates(candidates: &mut [(usize, u8)]) {
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
}

pub struct MatchEngine {
    scorer: Box<dyn SimilarityScorer>,
    oversample: usize,
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self::new(Box::new(TokenSetScorer))
    }
}

impl MatchEngine {
    pub fn new(scorer: Box<dyn SimilarityScorer>) -> Self {
        Self {
            scorer,
            oversample: DEFAULT_OVERSAMPLE,
        }
    }

    /// Factors below 2 are raised to 2.
    pub fn with_oversample(mut self, factor: usize) -> Self {
        self.oversample = factor.max(DEFAULT_OVERSAMPLE);
        self
    }

    pub fn scorer_name(&self) -> &'static str {
        self.scorer.name()
    }

    pub fn search(
        &self,
        query: &str,
        catalog: &Catalog,
        limit: usize,
    ) -> Result<Vec<SearchResult>, QuoteError> {
        if limit == 0 {
            return Err(QuoteError::InvalidArgument(
                "limit must be greater than 0".to_string(),
            ));
        }
        if catalog.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = catalog
            .iter()
            .enumerate()
            .map(|(idx, row)| (idx, self.scorer.score(query, &row.composite_text())))
            .collect::<Vec<_>>();
        rank_candidates(&mut scored);
        scored.truncate(limit.saturating_mul(self.oversample));

        let mut ranked = collapse_by_row(&scored);
        rank_candidates(&mut ranked);
        ranked.truncate(limit);
        debug!(
            scorer = self.scorer.name(),
            rows = catalog.len(),
            hits = ranked.len(),
            "catalog search"
        );

        Ok(ranked
            .into_iter()
            .filter_map(|(idx, score)| {
                catalog
                    .get(idx)
                    .map(|row| SearchResult::from_row(idx, row, score))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote_core::CatalogRow;

    fn row(product: &str, description: &str) -> CatalogRow {
        CatalogRow {
            product: Some(product.into()),
            description: Some(description.into()),
            finished_price_usd: Some(1.0),
            ..CatalogRow::default()
        }
    }

    fn catalog() -> Catalog {
        Catalog::new(vec![
            row("Fused Silica", "high purity sand"),
            row("Zircon Flour", "325 mesh"),
            row("Alumina Bubble", "0.5-1mm"),
            row("Fused Silica", "filled"),
        ])
    }

    #[test]
    fn processing_strips_case_and_punctuation() {
        assert_eq!(full_process("  Fused-Silica, 0.5mm! "), "fused silica  0 5mm");
        assert_eq!(full_process("!!!"), "");
    }

    #[test]
    fn token_set_ignores_order_and_duplicates() {
        let scorer = TokenSetScorer;
        let base = scorer.score("fused silica", "Fused Silica high purity");
        assert_eq!(scorer.score("silica fused", "Fused Silica high purity"), base);
        assert_eq!(scorer.score("silica silica FUSED", "Fused Silica high purity"), base);
        assert_eq!(base, 100);
    }

    #[test]
    fn token_set_scores_known_values() {
        let scorer = TokenSetScorer;
        // shared "i", "n": 2 * 2 / 13
        assert_eq!(scorer.score("zircon", "alumina"), 31);
        assert_eq!(scorer.score("", "anything"), 0);
        assert_eq!(scorer.score("abc", "abc"), 100);
    }

    #[test]
    fn indel_ratio_of_empty_is_zero() {
        assert_eq!(indel_ratio("", "abc"), 0);
        assert_eq!(indel_ratio("abcd", "abcd"), 100);
        assert_eq!(indel_ratio("ab", "abcd"), 67);
    }

    #[test]
    fn collapse_keeps_highest_score_per_row() {
        let collapsed = collapse_by_row(&[(7, 80), (2, 50), (7, 95)]);
        assert_eq!(collapsed, vec![(7, 95), (2, 50)]);
    }

    #[test]
    fn ranking_breaks_ties_by_row_index() {
        let mut hits = vec![(4, 70), (1, 90), (2, 70), (0, 10)];
        rank_candidates(&mut hits);
        assert_eq!(hits, vec![(1, 90), (2, 70), (4, 70), (0, 10)]);
    }

    #[test]
    fn search_is_deterministic_and_ranked() {
        let engine = MatchEngine::default();
        let first = engine.search("fused silica", &catalog(), 3).unwrap();
        let second = engine.search("fused silica", &catalog(), 3).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].catalog_row_index, 0);
        assert_eq!(first[1].catalog_row_index, 3);
        assert!(first.windows(2).all(|w| w[0].match_score >= w[1].match_score));
    }

    #[test]
    fn empty_query_returns_leading_rows_with_zero_score() {
        let hits = MatchEngine::default().search("", &catalog(), 2).unwrap();
        let indices = hits.iter().map(|h| h.catalog_row_index).collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 1]);
        assert!(hits.iter().all(|h| h.match_score == 0));
    }

    #[test]
    fn empty_catalog_and_zero_limit() {
        let engine = MatchEngine::default();
        assert!(engine.search("silica", &Catalog::empty(), 5).unwrap().is_empty());
        let err = engine.search("silica", &catalog(), 0).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn scorers_resolve_by_name() {
        assert_eq!(scorer_by_name("token-set").unwrap().name(), "token-set");
        assert_eq!(scorer_by_name("Jaro_Winkler").unwrap().name(), "jaro-winkler");
        assert!(scorer_by_name("levenshtein").is_none());

        let engine = MatchEngine::new(Box::new(JaroWinklerScorer)).with_oversample(0);
        let hits = engine.search("mesh 325 Zircon flour", &catalog(), 1).unwrap();
        assert_eq!(hits[0].catalog_row_index, 1);
        assert_eq!(hits[0].match_score, 100);
    }
}
