//! 候选选择 - 偏好加权 + 人物/字幕替换 + 多样性贪心 + 回填
//!
//! 输入候选须按时间升序，与相似度矩阵下标一一对应。

use log::debug;
use std::collections::HashMap;

use crate::frame_extractor::candidate::{FrameCandidate, ScoreSet};
use crate::frame_extractor::settings::SelectionPreferences;
use crate::frame_extractor::similarity::SimilarityMatrix;

/// 经验常数，保留为可调默认值，需用真实素材校准
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// 多样性项的保底权重，不受用户偏好影响
    pub min_diversity_weight: f32,
    pub greedy_score_weight: f32,
    pub greedy_diversity_weight: f32,
    /// people_score 高于该值且 subtitle_score 低于下一项时触发替换搜索
    pub swap_people_threshold: f32,
    pub swap_subtitle_threshold: f32,
    /// 向前/向后搜索的候选个数
    pub swap_window: usize,
    /// 替换帧 people_score 允许比原帧低多少
    pub swap_people_tolerance: f32,
    /// 替换帧 subtitle_score 至少高出多少
    pub swap_subtitle_margin: f32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_diversity_weight: 0.15,
            greedy_score_weight: 0.7,
            greedy_diversity_weight: 0.3,
            swap_people_threshold: 0.6,
            swap_subtitle_threshold: 0.5,
            swap_window: 2,
            swap_people_tolerance: 0.15,
            swap_subtitle_margin: 0.2,
        }
    }
}

impl SelectorConfig {
    /// 不做替换，纯按分数与多样性
    pub fn without_swap() -> Self {
        Self {
            swap_window: 0,
            ..Default::default()
        }
    }
}

/// 按用户偏好加权，归一化到 0-1；多样性始终参与
pub fn weighted_score(scores: &ScoreSet, prefs: &SelectionPreferences, min_diversity_weight: f32) -> f32 {
    let terms = [
        (prefs.prioritize_static.max(0.0), scores.static_score),
        (prefs.avoid_subtitles.max(0.0), scores.subtitle_score),
        (prefs.prefer_people.max(0.0), scores.people_score),
        (prefs.avoid_empty_frames.max(0.0), scores.quality_score),
        (min_diversity_weight.max(0.0), scores.diversity_score),
    ];
    let total_weight: f32 = terms.iter().map(|(w, _)| w).sum();
    if total_weight <= f32::EPSILON {
        return 0.0;
    }
    let sum: f32 = terms.iter().map(|(w, s)| w * s).sum();
    (sum / total_weight).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// 候选下标，按时间升序
    pub indices: Vec<usize>,
    /// 与 `indices` 对齐的最终排序分
    pub scores: Vec<f32>,
    /// 主图在 `indices` 中的位置
    pub primary: Option<usize>,
    pub backfilled: usize,
    pub swaps: usize,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

pub struct CandidateSelector {
    config: SelectorConfig,
}

impl CandidateSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// 写入 diversity_score 与 weighted_score
    pub fn score_candidates(
        &self,
        candidates: &mut [FrameCandidate],
        matrix: &SimilarityMatrix,
        prefs: &SelectionPreferences,
    ) {
        for (i, candidate) in candidates.iter_mut().enumerate() {
            if candidate.is_qualifying() && i < matrix.len() {
                candidate.scores.diversity_score = matrix.uniqueness(i);
            }
            candidate.weighted_score = weighted_score(&candidate.scores, prefs, self.config.min_diversity_weight);
        }
    }

    pub fn select(&self, candidates: &[FrameCandidate], matrix: &SimilarityMatrix, target: usize) -> Selection {
        let eligible: Vec<usize> = (0..candidates.len().min(matrix.len()))
            .filter(|&i| candidates[i].is_qualifying())
            .collect();
        if eligible.is_empty() || target == 0 {
            return Selection::default();
        }

        let (boosts, replaced) = self.swap_pass(candidates, &eligible);
        let effective = |i: usize| -> f32 {
            let own = candidates[i].weighted_score;
            boosts.get(&i).map_or(own, |b| own.max(*b))
        };

        let mut selected: Vec<usize> = Vec::with_capacity(target);

        // 贪心：与已选任一帧太相似的候选直接不参与
        while selected.len() < target {
            let mut best: Option<(usize, f32)> = None;
            for &i in &eligible {
                if replaced.contains(&i) || selected.contains(&i) {
                    continue;
                }
                if selected.iter().any(|&s| matrix.too_similar(i, s)) {
                    continue;
                }
                let diversity = selected
                    .iter()
                    .map(|&s| 1.0 - matrix.get(i, s))
                    .fold(1.0f32, f32::min);
                let value = if selected.is_empty() {
                    effective(i)
                } else {
                    self.config.greedy_score_weight * effective(i) + self.config.greedy_diversity_weight * diversity
                };
                if best.map_or(true, |(_, v)| value > v) {
                    best = Some((i, value));
                }
            }
            match best {
                Some((i, _)) => selected.push(i),
                None => break,
            }
        }

        // 回填：放宽多样性，不放宽分数顺序
        let mut backfilled = 0;
        if selected.len() < target {
            let mut rest: Vec<usize> = eligible.iter().copied().filter(|i| !selected.contains(i)).collect();
            rest.sort_by(|&a, &b| effective(b).total_cmp(&effective(a)).then(a.cmp(&b)));
            for i in rest.into_iter().take(target - selected.len()) {
                selected.push(i);
                backfilled += 1;
            }
            if backfilled > 0 {
                debug!("🧩 backfilled {} near-duplicate candidates to reach {}", backfilled, target);
            }
        }

        selected.sort_by(|&a, &b| {
            candidates[a]
                .time_secs
                .total_cmp(&candidates[b].time_secs)
                .then(a.cmp(&b))
        });
        let scores: Vec<f32> = selected.iter().map(|&i| effective(i)).collect();
        let primary = scores
            .iter()
            .enumerate()
            .fold(None::<(usize, f32)>, |best, (pos, &s)| match best {
                Some((_, b)) if b >= s => best,
                _ => Some((pos, s)),
            })
            .map(|(pos, _)| pos);

        Selection {
            indices: selected,
            scores,
            primary,
            backfilled,
            swaps: replaced.len(),
        }
    }

    /// 有人物但字幕明显的候选，在相邻窗口内找人物相当、字幕更干净的替换帧。
    /// 返回（替换帧 -> 继承的分数，被替换的候选）。被替换的候选仍可回填。
    ///
    /// 替换帧自己也可能再被替换；分数沿链条传到最终的替换帧。
    fn swap_pass(&self, candidates: &[FrameCandidate], eligible: &[usize]) -> (HashMap<usize, f32>, Vec<usize>) {
        let mut boosts: HashMap<usize, f32> = HashMap::new();
        let mut replaced = Vec::new();
        let window = self.config.swap_window;
        if window == 0 {
            return (boosts, replaced);
        }
        let mut substitute_of: HashMap<usize, usize> = HashMap::new();

        for (pos, &i) in eligible.iter().enumerate() {
            let s = &candidates[i].scores;
            if s.people_score < self.config.swap_people_threshold || s.subtitle_score >= self.config.swap_subtitle_threshold {
                continue;
            }

            let from = pos.saturating_sub(window);
            let to = (pos + window).min(eligible.len() - 1);
            let substitute = (from..=to)
                .filter(|&p| p != pos)
                .map(|p| (p, eligible[p]))
                .filter(|&(_, j)| {
                    let o = &candidates[j].scores;
                    o.people_score >= s.people_score - self.config.swap_people_tolerance
                        && o.subtitle_score >= s.subtitle_score + self.config.swap_subtitle_margin
                })
                .max_by(|&(pa, a), &(pb, b)| {
                    candidates[a]
                        .scores
                        .subtitle_score
                        .total_cmp(&candidates[b].scores.subtitle_score)
                        .then(pb.abs_diff(pos).cmp(&pa.abs_diff(pos)))
                });

            if let Some((_, j)) = substitute {
                debug!(
                    "🔁 swap frame@{:.2}s -> frame@{:.2}s (subtitle {:.2} -> {:.2})",
                    candidates[i].time_secs,
                    candidates[j].time_secs,
                    s.subtitle_score,
                    candidates[j].scores.subtitle_score
                );
                substitute_of.insert(i, j);
                replaced.push(i);
            }
        }

        // swap_subtitle_margin 为 0 时链条可能成环，最多走 replaced.len() 步
        for &i in &replaced {
            let mut target = substitute_of[&i];
            for _ in 0..replaced.len() {
                match substitute_of.get(&target) {
                    Some(&next) => target = next,
                    None => break,
                }
            }
            let inherited = boosts.entry(target).or_insert(0.0);
            *inherited = inherited.max(candidates[i].weighted_score);
        }

        (boosts, replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::video::Frame;
    use crate::frame_extractor::analyzer::LocalAnalysis;

    fn candidate(index: usize, time: f64, weighted: f32, people: f32, subtitle: f32) -> FrameCandidate {
        let scores = ScoreSet {
            static_score: 0.5,
            subtitle_score: subtitle,
            people_score: people,
            quality_score: 0.5,
            diversity_score: 0.5,
        };
        let local = LocalAnalysis {
            scores,
            brightness: 0.5,
            sharpness: 0.5,
            edge_ratio: 0.1,
            subtitle_detected: subtitle < 0.5,
            quick_rejected: false,
        };
        let mut c = FrameCandidate::new(Frame::new(4, 4, vec![0; 64], time, index), local);
        c.weighted_score = weighted;
        c
    }

    fn rejected(index: usize, time: f64) -> FrameCandidate {
        let mut c = candidate(index, time, 0.0, 0.0, 1.0);
        c.local.quick_rejected = true;
        c
    }

    /// `groups[i]` 相同的候选彼此太相似
    fn grouped_matrix(groups: &[usize]) -> SimilarityMatrix {
        let mut m = SimilarityMatrix::identity(groups.len());
        for i in 0..groups.len() {
            for j in (i + 1)..groups.len() {
                if groups[i] == groups[j] {
                    m.set(i, j, 0.95, true);
                } else {
                    m.set(i, j, 0.3, false);
                }
            }
        }
        m
    }

    fn no_swap() -> CandidateSelector {
        CandidateSelector::new(SelectorConfig::without_swap())
    }

    #[test]
    fn test_weighted_score_includes_diversity() {
        let prefs = SelectionPreferences {
            prioritize_static: 0.0,
            avoid_subtitles: 0.0,
            prefer_people: 0.0,
            avoid_empty_frames: 0.0,
        };
        let s = ScoreSet {
            diversity_score: 1.0,
            ..Default::default()
        };
        assert_eq!(weighted_score(&s, &prefs, 0.15), 1.0);
        assert_eq!(weighted_score(&s, &prefs, 0.0), 0.0);

        let prefs = SelectionPreferences::default();
        let hi = ScoreSet {
            static_score: 1.0,
            subtitle_score: 1.0,
            people_score: 1.0,
            quality_score: 1.0,
            diversity_score: 1.0,
        };
        assert!((weighted_score(&hi, &prefs, 0.15) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_count_bound_with_backfill() {
        let selector = no_swap();
        let candidates: Vec<FrameCandidate> = (0..4).map(|i| candidate(i, i as f64, 0.5 + i as f32 * 0.1, 0.0, 1.0)).collect();
        // 全部是近重复
        let matrix = grouped_matrix(&[0, 0, 0, 0]);

        let selection = selector.select(&candidates, &matrix, 3);
        assert_eq!(selection.len(), 3);
        assert_eq!(selection.backfilled, 2);

        let selection = selector.select(&candidates, &matrix, 10);
        assert_eq!(selection.len(), 4);
    }

    #[test]
    fn test_quick_rejected_never_selected() {
        let selector = no_swap();
        let candidates = vec![rejected(0, 0.0), candidate(1, 1.0, 0.4, 0.0, 1.0), rejected(2, 2.0)];
        let matrix = grouped_matrix(&[0, 1, 2]);

        let selection = selector.select(&candidates, &matrix, 3);
        assert_eq!(selection.indices, vec![1]);

        let all_rejected = vec![rejected(0, 0.0), rejected(1, 1.0)];
        assert!(selector.select(&all_rejected, &grouped_matrix(&[0, 1]), 3).is_empty());
    }

    #[test]
    fn test_diversity_one_per_group() {
        let selector = no_swap();
        let groups = [0, 0, 0, 1, 1, 1, 2, 2, 2];
        let candidates: Vec<FrameCandidate> = (0..9)
            // 第一组分数最高，纯按分数会全选第一组
            .map(|i| candidate(i, i as f64, if i < 3 { 0.9 } else { 0.5 }, 0.0, 1.0))
            .collect();
        let matrix = grouped_matrix(&groups);

        let selection = selector.select(&candidates, &matrix, 3);
        assert_eq!(selection.len(), 3);
        assert_eq!(selection.backfilled, 0);
        let picked: Vec<usize> = selection.indices.iter().map(|&i| groups[i]).collect();
        assert_eq!(picked, vec![0, 1, 2]);
        for a in &selection.indices {
            for b in &selection.indices {
                if a != b {
                    assert!(!matrix.too_similar(*a, *b));
                }
            }
        }
    }

    #[test]
    fn test_output_sorted_by_time_with_top_primary() {
        let selector = no_swap();
        let candidates = vec![
            candidate(0, 5.0, 0.3, 0.0, 1.0),
            candidate(1, 1.0, 0.9, 0.0, 1.0),
            candidate(2, 3.0, 0.6, 0.0, 1.0),
        ];
        let matrix = grouped_matrix(&[0, 1, 2]);

        let selection = selector.select(&candidates, &matrix, 3);
        let times: Vec<f64> = selection.indices.iter().map(|&i| candidates[i].time_secs).collect();
        assert_eq!(times, vec![1.0, 3.0, 5.0]);
        assert_eq!(selection.primary, Some(0));
    }

    #[test]
    fn test_swap_prefers_subtitle_free_neighbour() {
        let selector = CandidateSelector::new(SelectorConfig::default());
        let candidates = vec![
            candidate(0, 0.0, 0.4, 0.3, 0.9),
            // 人物 + 字幕，分数最高
            candidate(1, 1.0, 0.9, 0.9, 0.1),
            // 同一镜头，无字幕
            candidate(2, 1.5, 0.6, 0.85, 0.95),
        ];
        let matrix = grouped_matrix(&[0, 1, 1]);

        let selection = selector.select(&candidates, &matrix, 1);
        assert_eq!(selection.indices, vec![2]);
        assert_eq!(selection.swaps, 1);
        // 替换帧继承被替换帧的排序分
        assert!((selection.scores[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_chained_swap_passes_score_to_final_substitute() {
        let selector = CandidateSelector::new(SelectorConfig::default());
        let candidates = vec![
            candidate(0, 0.0, 0.9, 0.9, 0.1),
            // 比 0 干净，但自己仍有字幕
            candidate(1, 1.0, 0.5, 0.85, 0.35),
            // 人物太少，不能作替换
            candidate(2, 2.0, 0.3, 0.1, 0.9),
            candidate(3, 3.0, 0.4, 0.85, 0.9),
        ];
        let matrix = grouped_matrix(&[0, 1, 2, 3]);

        let selection = selector.select(&candidates, &matrix, 1);
        assert_eq!(selection.indices, vec![3]);
        assert_eq!(selection.swaps, 2);
        assert!((selection.scores[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_swap_requires_comparable_people() {
        let selector = CandidateSelector::new(SelectorConfig::default());
        let candidates = vec![
            candidate(0, 1.0, 0.9, 0.9, 0.1),
            // 无字幕但人物明显更少
            candidate(1, 1.5, 0.6, 0.4, 0.95),
        ];
        let matrix = grouped_matrix(&[0, 0]);

        let selection = selector.select(&candidates, &matrix, 1);
        assert_eq!(selection.indices, vec![0]);
        assert_eq!(selection.swaps, 0);
    }

    #[test]
    fn test_replaced_candidate_can_backfill() {
        let selector = CandidateSelector::new(SelectorConfig::default());
        let candidates = vec![candidate(0, 1.0, 0.9, 0.9, 0.1), candidate(1, 1.5, 0.6, 0.85, 0.95)];
        let matrix = grouped_matrix(&[0, 0]);

        let selection = selector.select(&candidates, &matrix, 2);
        assert_eq!(selection.indices, vec![0, 1]);
        assert_eq!(selection.backfilled, 1);
    }

    #[test]
    fn test_score_candidates_sets_diversity() {
        let selector = no_swap();
        let mut candidates = vec![
            candidate(0, 0.0, 0.0, 0.0, 1.0),
            candidate(1, 1.0, 0.0, 0.0, 1.0),
            candidate(2, 2.0, 0.0, 0.0, 1.0),
        ];
        let mut matrix = SimilarityMatrix::identity(3);
        matrix.set(0, 1, 0.9, true);
        matrix.set(0, 2, 0.1, false);
        matrix.set(1, 2, 0.1, false);

        selector.score_candidates(&mut candidates, &matrix, &SelectionPreferences::default());
        assert!(candidates[2].scores.diversity_score > candidates[0].scores.diversity_score);
        assert!(candidates[2].weighted_score > candidates[0].weighted_score);
    }
}
