//! Tiered merge policy.
//!
//! Segments are sorted by (delete-discounted) size. The policy computes how
//! many segments the index may have given `segments_per_tier` and the tier
//! sizes implied by `floor_segment_bytes` and `max_merge_at_once`; while the
//! eligible segments exceed that budget it picks the best-scoring run of up
//! to `max_merge_at_once` adjacent segments. Merges never produce a segment
//! larger than `max_merged_segment_bytes`, and segments already at half that
//! size are left alone.

use std::collections::HashSet;

use ahash::AHashMap;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::index::merge::policy::{MergePolicy, MergeSpecification, MergeTrigger, OneMerge, SegmentStats};

const MB: f64 = 1024.0 * 1024.0;

/// Tunables of [`TieredMergePolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TieredMergePolicyConfig {
    /// Segments merged at once by natural merges.
    pub max_merge_at_once: usize,
    /// Segments merged at once by forced merges.
    pub max_merge_at_once_explicit: usize,
    /// Largest segment a natural merge may produce, in MB.
    pub max_merged_segment_mb: f64,
    /// Segments smaller than this are treated as this size, in MB.
    pub floor_segment_mb: f64,
    /// Allowed segments per tier.
    pub segments_per_tier: f64,
    /// Deleted-document percentage above which `force_merge_deletes` merges a segment.
    pub force_merge_deletes_pct_allowed: f64,
    /// Exponent favouring merges that reclaim deletes.
    pub reclaim_deletes_weight: f64,
}

impl Default for TieredMergePolicyConfig {
    fn default() -> Self {
        TieredMergePolicyConfig {
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            max_merged_segment_mb: 5.0 * 1024.0,
            floor_segment_mb: 2.0,
            segments_per_tier: 10.0,
            force_merge_deletes_pct_allowed: 10.0,
            reclaim_deletes_weight: 2.0,
        }
    }
}

impl TieredMergePolicyConfig {
    /// Check the value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_merge_at_once < 2 {
            return Err(StrataError::invalid_argument(format!(
                "max_merge_at_once must be > 1 (got {})",
                self.max_merge_at_once
            )));
        }
        if self.max_merge_at_once_explicit < 2 {
            return Err(StrataError::invalid_argument(format!(
                "max_merge_at_once_explicit must be > 1 (got {})",
                self.max_merge_at_once_explicit
            )));
        }
        if self.max_merged_segment_mb < 0.0 {
            return Err(StrataError::invalid_argument("max_merged_segment_mb must be >= 0"));
        }
        if self.floor_segment_mb <= 0.0 {
            return Err(StrataError::invalid_argument("floor_segment_mb must be > 0"));
        }
        if self.segments_per_tier < 2.0 {
            return Err(StrataError::invalid_argument(format!(
                "segments_per_tier must be >= 2.0 (got {})",
                self.segments_per_tier
            )));
        }
        if !(0.0..=100.0).contains(&self.force_merge_deletes_pct_allowed) {
            return Err(StrataError::invalid_argument(
                "force_merge_deletes_pct_allowed must be between 0 and 100",
            ));
        }
        if self.reclaim_deletes_weight < 0.0 {
            return Err(StrataError::invalid_argument("reclaim_deletes_weight must be >= 0"));
        }
        Ok(())
    }
}

/// Score of a candidate merge; lower is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeScore {
    /// Final score.
    pub score: f64,
    /// Size of the largest input relative to the whole merge.
    pub skew: f64,
    /// Live-to-total byte ratio of the inputs.
    pub non_delete_ratio: f64,
}

/// Merges segments of roughly equal size, tier by tier.
#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    config: TieredMergePolicyConfig,
    max_merged_segment_bytes: u64,
    floor_segment_bytes: u64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        Self::from_valid_config(TieredMergePolicyConfig::default())
    }
}

impl TieredMergePolicy {
    /// Build a policy from a validated config.
    pub fn new(config: TieredMergePolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: TieredMergePolicyConfig) -> Self {
        let max_merged_segment_bytes = mb_to_bytes(config.max_merged_segment_mb);
        let floor_segment_bytes = mb_to_bytes(config.floor_segment_mb);
        TieredMergePolicy {
            config,
            max_merged_segment_bytes,
            floor_segment_bytes,
        }
    }

    /// Current tunables.
    pub fn config(&self) -> &TieredMergePolicyConfig {
        &self.config
    }

    /// Largest segment a natural merge may produce.
    pub fn max_merged_segment_bytes(&self) -> u64 {
        self.max_merged_segment_bytes
    }

    fn floor_size(&self, bytes: u64) -> u64 {
        bytes.max(self.floor_segment_bytes)
    }

    fn sorted_by_size_desc<'a>(&self, segments: impl Iterator<Item = &'a SegmentStats>) -> Vec<&'a SegmentStats> {
        let mut sorted: Vec<&SegmentStats> = segments.collect();
        sorted.sort_by(|a, b| b.size().cmp(&a.size()).then_with(|| a.name().cmp(b.name())));
        sorted
    }

    /// Score a candidate merge.
    pub fn score(&self, candidate: &[&SegmentStats], hit_too_large: bool) -> MergeScore {
        let mut tot_before = 0u64;
        let mut tot_after = 0u64;
        let mut tot_after_floored = 0u64;
        for seg in candidate {
            let size = seg.size();
            tot_after += size;
            tot_after_floored += self.floor_size(size);
            tot_before += seg.size_in_bytes;
        }

        let skew = if hit_too_large {
            // a max-sized merge does not cascade, so its balance is irrelevant
            1.0 / self.config.max_merge_at_once as f64
        } else {
            match candidate.first() {
                Some(first) if tot_after_floored > 0 => {
                    self.floor_size(first.size()) as f64 / tot_after_floored as f64
                }
                _ => 1.0,
            }
        };

        let mut score = skew;
        score *= (tot_after as f64).powf(0.05);
        let non_delete_ratio = if tot_before == 0 {
            1.0
        } else {
            tot_after as f64 / tot_before as f64
        };
        score *= non_delete_ratio.powf(self.config.reclaim_deletes_weight);

        MergeScore {
            score,
            skew,
            non_delete_ratio,
        }
    }

    fn allowed_segment_count(&self, total_bytes: u64, min_segment_bytes: u64) -> usize {
        let segs_per_tier = self.config.segments_per_tier;
        let mut level_size = self.floor_size(min_segment_bytes) as f64;
        let mut bytes_left = total_bytes as f64;
        let mut allowed = 0.0;
        loop {
            let seg_count_level = bytes_left / level_size;
            if seg_count_level < segs_per_tier {
                allowed += seg_count_level.ceil();
                break;
            }
            allowed += segs_per_tier;
            bytes_left -= segs_per_tier * level_size;
            level_size *= self.config.max_merge_at_once as f64;
        }
        allowed as usize
    }
}

fn mb_to_bytes(mb: f64) -> u64 {
    let bytes = mb * MB;
    if bytes >= u64::MAX as f64 {
        u64::MAX
    } else {
        bytes as u64
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(&self, trigger: MergeTrigger, segments: &[SegmentStats]) -> Option<MergeSpecification> {
        if segments.is_empty() {
            return None;
        }
        trace!("find_merges({trigger:?}): {} segments", segments.len());

        let sorted = self.sorted_by_size_desc(segments.iter());
        let half_max = self.max_merged_segment_bytes as f64 / 2.0;

        let mut total_bytes: u64 = sorted.iter().map(|s| s.size()).sum();
        let min_segment_bytes = sorted.iter().map(|s| s.size()).min().unwrap_or(0);

        let mut too_big_count = 0;
        while too_big_count < sorted.len() && sorted[too_big_count].size() as f64 >= half_max {
            total_bytes -= sorted[too_big_count].size();
            too_big_count += 1;
        }

        let allowed = self.allowed_segment_count(total_bytes, min_segment_bytes);
        let max_at_once = self.config.max_merge_at_once;
        let mut to_be_merged: HashSet<&str> = HashSet::new();
        let mut spec: Option<MergeSpecification> = None;

        loop {
            let mut merging_bytes = 0u64;
            let mut eligible: Vec<&SegmentStats> = Vec::new();
            for seg in &sorted[too_big_count..] {
                if seg.merging {
                    merging_bytes += seg.size_in_bytes;
                } else if !to_be_merged.contains(seg.name()) {
                    eligible.push(seg);
                }
            }
            let max_merge_is_running = merging_bytes >= self.max_merged_segment_bytes;

            trace!(
                "allowed segment count {allowed} vs {} segments ({} eligible, {too_big_count} too big)",
                sorted.len(),
                eligible.len()
            );

            if eligible.is_empty() || eligible.len() < allowed || eligible.len() < max_at_once {
                return spec;
            }

            let mut best: Option<(Vec<&SegmentStats>, MergeScore, bool, u64)> = None;
            for start in 0..=(eligible.len() - max_at_once) {
                let mut tot_after = 0u64;
                let mut candidate: Vec<&SegmentStats> = Vec::new();
                let mut hit_too_large = false;
                for seg in &eligible[start..] {
                    if candidate.len() >= max_at_once {
                        break;
                    }
                    let size = seg.size();
                    if tot_after + size > self.max_merged_segment_bytes {
                        hit_too_large = true;
                        // keep packing smaller segments into this merge
                        continue;
                    }
                    candidate.push(seg);
                    tot_after += size;
                }
                if candidate.is_empty() {
                    continue;
                }

                let score = self.score(&candidate, hit_too_large);
                trace!(
                    "maybe {:?} score={:.3} skew={:.3} nonDelRatio={:.3} tooLarge={hit_too_large}",
                    candidate.iter().map(|s| s.name()).collect::<Vec<_>>(),
                    score.score,
                    score.skew,
                    score.non_delete_ratio
                );
                let better = best
                    .as_ref()
                    .is_none_or(|(_, best_score, _, _)| score.score < best_score.score);
                if better && (!hit_too_large || !max_merge_is_running) {
                    best = Some((candidate, score, hit_too_large, tot_after));
                }
            }

            let Some((candidate, score, too_large, bytes)) = best else {
                return spec;
            };
            debug!(
                "add merge {:?} size={:.3} MB score={:.3}{}",
                candidate.iter().map(|s| s.name()).collect::<Vec<_>>(),
                bytes as f64 / MB,
                score.score,
                if too_large { " [max merge]" } else { "" }
            );
            for seg in &candidate {
                to_be_merged.insert(seg.name());
            }
            let merge = OneMerge::new(candidate.iter().map(|s| s.info.clone()).collect());
            merge.set_estimated_bytes(bytes);
            spec.get_or_insert_with(MergeSpecification::new).add(merge);
        }
    }

    fn find_forced_merges(
        &self,
        segments: &[SegmentStats],
        max_segment_count: usize,
        segments_to_merge: &AHashMap<String, bool>,
    ) -> Option<MergeSpecification> {
        let max_segment_count = max_segment_count.max(1);
        debug!("find_forced_merges max_segment_count={max_segment_count}");
        let mut eligible: Vec<&SegmentStats> = Vec::new();
        let mut force_merge_running = false;
        let mut segment_is_original = false;
        for seg in segments {
            if let Some(&is_original) = segments_to_merge.get(seg.name()) {
                segment_is_original = is_original;
                if seg.merging {
                    force_merge_running = true;
                } else {
                    eligible.push(seg);
                }
            }
        }

        if eligible.is_empty() {
            return None;
        }
        if (max_segment_count > 1 && eligible.len() <= max_segment_count)
            || (max_segment_count == 1
                && eligible.len() == 1
                && (!segment_is_original || eligible[0].is_merged()))
        {
            trace!("already merged");
            return None;
        }

        let eligible = self.sorted_by_size_desc(eligible.into_iter());
        let explicit = self.config.max_merge_at_once_explicit;
        let mut end = eligible.len();
        let mut spec: Option<MergeSpecification> = None;

        // full-width merges first, from the small end
        while end >= explicit + max_segment_count - 1 {
            let merge = OneMerge::new(eligible[end - explicit..end].iter().map(|s| s.info.clone()).collect());
            debug!("add forced merge {}", merge.seg_string());
            spec.get_or_insert_with(MergeSpecification::new).add(merge);
            end -= explicit;
        }

        if spec.is_none() && !force_merge_running {
            let num_to_merge = end + 1 - max_segment_count;
            let merge = OneMerge::new(
                eligible[end - num_to_merge..end]
                    .iter()
                    .map(|s| s.info.clone())
                    .collect(),
            );
            debug!("add final forced merge {}", merge.seg_string());
            spec = Some(MergeSpecification {
                merges: vec![merge],
            });
        }
        spec
    }

    fn find_forced_deletes_merges(&self, segments: &[SegmentStats]) -> Option<MergeSpecification> {
        let pct_allowed = self.config.force_merge_deletes_pct_allowed;
        let eligible: Vec<&SegmentStats> = segments
            .iter()
            .filter(|s| !s.merging && 100.0 * s.delete_ratio() > pct_allowed)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let eligible = self.sorted_by_size_desc(eligible.into_iter());
        let explicit = self.config.max_merge_at_once_explicit;
        let mut spec = MergeSpecification::new();
        // no size limit: the caller asked for it explicitly
        for chunk in eligible.chunks(explicit) {
            let merge = OneMerge::new(chunk.iter().map(|s| s.info.clone()).collect());
            debug!("add forced deletes merge {}", merge.seg_string());
            spec.add(merge);
        }
        Some(spec)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::index::merge::policy::tests::stats;

    const KB: u64 = 1024;

    fn names(merge: &OneMerge) -> Vec<String> {
        merge.segment_names()
    }

    #[test]
    fn test_config_validation() {
        assert!(TieredMergePolicyConfig::default().validate().is_ok());
        let bad = TieredMergePolicyConfig {
            max_merge_at_once: 1,
            ..Default::default()
        };
        assert!(TieredMergePolicy::new(bad).is_err());
        let bad = TieredMergePolicyConfig {
            segments_per_tier: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_fewer_segments_than_merge_width_do_not_merge() {
        let policy = TieredMergePolicy::default();
        let segments: Vec<_> = (0..9).map(|i| stats(&format!("_{i}"), 10, 10 * KB, 0)).collect();
        assert!(policy.find_merges(MergeTrigger::SegmentFlush, &segments).is_none());
    }

    #[test]
    fn test_ten_small_segments_merge_together() {
        let policy = TieredMergePolicy::default();
        let segments: Vec<_> = (0..10).map(|i| stats(&format!("_{i}"), 10, 10 * KB, 0)).collect();
        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &segments)
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments().len(), 10);
    }

    #[test]
    fn test_merging_segments_are_not_eligible() {
        let policy = TieredMergePolicy::default();
        let mut segments: Vec<_> = (0..11).map(|i| stats(&format!("_{i}"), 10, 10 * KB, 0)).collect();
        segments[0].merging = true;
        segments[1].merging = true;
        assert!(policy.find_merges(MergeTrigger::SegmentFlush, &segments).is_none());
    }

    #[test]
    fn test_score_prefers_reclaiming_deletes() {
        let policy = TieredMergePolicy::default();
        let clean: Vec<_> = (0..3).map(|i| stats(&format!("_{i}"), 100, 10 * KB, 0)).collect();
        let deleted: Vec<_> = (0..3).map(|i| stats(&format!("_d{i}"), 100, 10 * KB, 50)).collect();
        let clean_score = policy.score(&clean.iter().collect::<Vec<_>>(), false);
        let deleted_score = policy.score(&deleted.iter().collect::<Vec<_>>(), false);
        assert!(deleted_score.score < clean_score.score);
        assert!((deleted_score.non_delete_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_random_merges_respect_max_segment_size() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let config = TieredMergePolicyConfig {
            max_merged_segment_mb: 64.0,
            ..Default::default()
        };
        let policy = TieredMergePolicy::new(config).unwrap();
        let max = policy.max_merged_segment_bytes();

        for round in 0..200 {
            let count = rng.random_range(1..80);
            let segments: Vec<SegmentStats> = (0..count)
                .map(|i| {
                    let max_doc = rng.random_range(1..10_000);
                    let del_count = if rng.random_bool(0.3) {
                        rng.random_range(0..=max_doc)
                    } else {
                        0
                    };
                    let bytes = rng.random_range(1..(48 * 1024 * KB));
                    stats(&format!("_{round}_{i}"), max_doc, bytes, del_count)
                })
                .collect();

            let Some(spec) = policy.find_merges(MergeTrigger::SegmentFlush, &segments) else {
                continue;
            };
            let mut seen = HashSet::new();
            for merge in &spec.merges {
                assert!(merge.segments().len() <= policy.config().max_merge_at_once);
                let total: u64 = merge
                    .segment_names()
                    .iter()
                    .map(|name| segments.iter().find(|s| s.name() == name).unwrap().size())
                    .sum();
                let single_with_deletes = merge.segments().len() == 1
                    && segments
                        .iter()
                        .any(|s| s.name() == merge.segments()[0].name() && s.del_count > 0);
                assert!(total <= max || single_with_deletes, "merge of {total} bytes exceeds {max}");
                for name in merge.segment_names() {
                    assert!(seen.insert(name), "segment proposed twice");
                }
            }
        }
    }

    #[test]
    fn test_forced_merge_to_one_segment() {
        let policy = TieredMergePolicy::default();
        let segments: Vec<_> = (0..5).map(|i| stats(&format!("_{i}"), 10, (i + 1) * KB, 0)).collect();
        let to_merge: AHashMap<String, bool> = segments.iter().map(|s| (s.name().to_string(), true)).collect();

        let spec = policy.find_forced_merges(&segments, 1, &to_merge).unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments().len(), 5);

        // a single clean original segment is already merged
        let one = vec![stats("_9", 10, KB, 0)];
        let map: AHashMap<String, bool> = [("_9".to_string(), true)].into_iter().collect();
        assert!(policy.find_forced_merges(&one, 1, &map).is_none());

        // with deletions it is rewritten
        let one = vec![stats("_9", 10, KB, 3)];
        assert_eq!(
            names(&policy.find_forced_merges(&one, 1, &map).unwrap().merges[0]),
            vec!["_9"]
        );
    }

    #[test]
    fn test_forced_merge_uses_explicit_width() {
        let policy = TieredMergePolicy::default();
        let segments: Vec<_> = (0..65).map(|i| stats(&format!("_{i}"), 10, KB, 0)).collect();
        let to_merge: AHashMap<String, bool> = segments.iter().map(|s| (s.name().to_string(), true)).collect();
        let spec = policy.find_forced_merges(&segments, 1, &to_merge).unwrap();
        assert_eq!(spec.len(), 2);
        assert!(spec.merges.iter().all(|m| m.segments().len() == 30));
    }

    #[test]
    fn test_forced_deletes_merges() {
        let policy = TieredMergePolicy::default();
        let segments = vec![
            stats("_0", 100, 10 * KB, 50),
            stats("_1", 100, 10 * KB, 5),
            stats("_2", 100, 10 * KB, 11),
        ];
        let spec = policy.find_forced_deletes_merges(&segments).unwrap();
        assert_eq!(spec.len(), 1);
        let mut merged = names(&spec.merges[0]);
        merged.sort();
        assert_eq!(merged, vec!["_0", "_2"]);
        assert!(policy.find_forced_deletes_merges(&segments[1..2]).is_none());
    }
}
