//! Weighted rank fusion with URL/title deduplication.
//!
//! Scores are normalized per lane, merged under fixed lane weights, and
//! deduplicated by normalized URL (or lane + normalized title when a source
//! has no URL). The first occurrence wins; later duplicates fold their
//! weighted score into the kept entry at a 0.5 discount. Output ordering is
//! fully deterministic.

use std::collections::HashMap;

use prism_core::{Lane, LaneResult, Source};

/// Discount applied when folding a duplicate's score into the kept entry.
const DUPLICATE_DISCOUNT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub web_weight: f64,
    pub vector_weight: f64,
    pub kg_weight: f64,
    pub top_k_final: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            web_weight: 0.4,
            vector_weight: 0.4,
            kg_weight: 0.2,
            top_k_final: 10,
        }
    }
}

impl FusionConfig {
    fn weight(&self, lane: Lane) -> f64 {
        match lane {
            Lane::Web => self.web_weight,
            Lane::Vector => self.vector_weight,
            Lane::Kg => self.kg_weight,
        }
    }
}

/// Dedup key: normalized URL when present, else lane + normalized title.
fn dedup_key(source: &Source) -> String {
    match source.url.as_deref() {
        Some(url) if !url.is_empty() => format!("url:{}", normalize_url(url)),
        _ => format!(
            "title:{}:{}",
            source.origin_lane.as_str(),
            source.title.trim().to_lowercase()
        ),
    }
}

/// Canonicalize a URL for equality: case-insensitive host, no scheme
/// distinction, no fragment, no tracking params, no trailing slash.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.trim().trim_end_matches('/').to_lowercase();
    };
    parsed.set_fragment(None);

    let host = parsed
        .host_str()
        .unwrap_or_default()
        .trim_start_matches("www.")
        .to_lowercase();
    let path = parsed.path().trim_end_matches('/').to_string();

    let query: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && k != "ref" && k != "fbclid")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if query.is_empty() {
        format!("{host}{path}")
    } else {
        let qs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{host}{path}?{}", qs.join("&"))
    }
}

struct FusedEntry {
    source: Source,
    combined: f64,
    /// (lane order, position within lane) of first occurrence, for ties.
    first_seen: (usize, usize),
}

/// Merge lane results into the fused, deduplicated, ranked source list.
pub fn fuse(lane_results: &[LaneResult], cfg: &FusionConfig) -> Vec<Source> {
    let mut entries: Vec<FusedEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    // Fixed lane order keeps first-occurrence semantics deterministic.
    for lane in Lane::ALL {
        let Some(result) = lane_results.iter().find(|r| r.lane == lane) else {
            continue;
        };
        let max_score = result
            .items
            .iter()
            .map(|s| s.score)
            .fold(0.0f64, f64::max);
        let weight = cfg.weight(lane);

        for (pos, item) in result.items.iter().enumerate() {
            let normalized = if max_score > 0.0 {
                (item.score / max_score).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let contribution = weight * normalized;
            let key = dedup_key(item);

            match index.get(&key) {
                Some(&i) => {
                    entries[i].combined += DUPLICATE_DISCOUNT * contribution;
                }
                None => {
                    index.insert(key, entries.len());
                    entries.push(FusedEntry {
                        source: item.clone(),
                        combined: contribution,
                        first_seen: (lane.order(), pos),
                    });
                }
            }
        }
    }

    entries.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.source.id.cmp(&b.source.id))
    });
    entries.truncate(cfg.top_k_final);

    entries
        .into_iter()
        .map(|e| {
            let mut source = e.source;
            source.score = e.combined.clamp(0.0, 1.0);
            source
        })
        .collect()
}
