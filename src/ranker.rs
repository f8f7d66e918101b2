//! 匹配聚合与排序
//!
//! 原始 k-NN 命中是描述子级别的，这里把它们聚合成图片级别的匹配：
//! 每条查询描述子对同一张图片只保留最近的一次命中，
//! 距离换算成相似度后用 Wilson 下界打分，惩罚证据太少的图片。

use std::collections::HashMap;

use serde::Serialize;

use crate::descriptor::DESCRIPTOR_BITS;
use crate::ivf::Neighbor;
use crate::key;

/// Wilson 置信区间的 z 值，约对应 95% 双侧置信度
const WILSON_Z: f32 = 1.98;

/// 聚合时丢弃的最大汉明距离默认值
pub const DEFAULT_MAX_DISTANCE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreType {
    /// 相似度序列的 Wilson 下界
    Wilson,
    /// 命中的查询描述子数量
    Count,
}

#[derive(Debug, Clone)]
pub struct RankOptions {
    /// 最多返回的图片数量
    pub limit: usize,
    /// 超过该距离的命中直接丢弃
    pub max_distance: u32,
    pub score_type: ScoreType,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self { limit: 10, max_distance: DEFAULT_MAX_DISTANCE, score_type: ScoreType::Wilson }
    }
}

/// 一条图片级别的匹配结果
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub image_id: u32,
    pub score: f32,
    /// 命中该图片的查询描述子数量
    pub evidence: usize,
}

/// 把每条查询描述子的近邻列表聚合成图片排名
///
/// `hits[i]` 是第 i 条查询描述子的近邻，键是扁平键。
pub fn rank(hits: &[Vec<Neighbor>], opts: &RankOptions) -> Vec<Match> {
    // image_id -> 相似度序列，每条查询描述子最多贡献一项
    let mut evidence: HashMap<u32, Vec<f32>> = HashMap::new();

    for neighbors in hits {
        // 单条查询描述子内按图片去重，只保留最近命中
        let mut best: HashMap<u32, u32> = HashMap::new();
        for n in neighbors {
            if n.distance > opts.max_distance {
                continue;
            }
            let (image_id, _) = key::decode(n.key);
            best.entry(image_id).and_modify(|d| *d = (*d).min(n.distance)).or_insert(n.distance);
        }
        for (image_id, distance) in best {
            let similarity = 1.0 - distance as f32 / DESCRIPTOR_BITS as f32;
            evidence.entry(image_id).or_default().push(similarity);
        }
    }

    let mut candidates: Vec<(u32, Vec<f32>)> = evidence.into_iter().collect();

    // 先按证据数量粗筛，Wilson 只在头部候选上计算
    candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));
    candidates.truncate(2 * opts.limit);

    let mut matches: Vec<Match> = candidates
        .into_iter()
        .map(|(image_id, sims)| {
            let score = match opts.score_type {
                ScoreType::Wilson => wilson_score(&sims),
                ScoreType::Count => sims.len() as f32,
            };
            Match { image_id, score, evidence: sims.len() }
        })
        .collect();

    matches.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.image_id.cmp(&b.image_id)));
    matches.truncate(opts.limit);
    matches
}

/// 相似度序列的 Wilson 下界
///
/// 均值/方差形式，对样本少或波动大的序列给出更保守的分数
fn wilson_score(sims: &[f32]) -> f32 {
    let n = sims.len() as f32;
    let mean = sims.iter().sum::<f32>() / n;
    let var = sims.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
    let z = WILSON_Z;
    (mean + z * z / (2.0 * n) - z / (2.0 * n) * (4.0 * n * var + z * z).sqrt())
        / (1.0 + z * z / n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(image_id: u32, ordinal: u32, distance: u32) -> Neighbor {
        Neighbor { key: key::encode(image_id, ordinal).unwrap(), distance }
    }

    #[test]
    fn wilson_prefers_many_good_hits_over_few_perfect() {
        // 图片 1: 50 条 0.95 左右的证据；图片 2: 2 条接近完美的证据
        let many = vec![0.95f32; 50];
        let few = vec![0.99f32; 2];
        assert!(wilson_score(&many) > wilson_score(&few));
    }

    #[test]
    fn wilson_grows_with_sample_size_at_fixed_mean() {
        // 均值不变时，样本越多下界越高
        let mut last = f32::MIN;
        for n in [1usize, 2, 5, 20, 100, 1000] {
            let score = wilson_score(&vec![0.9f32; n]);
            assert!(score > last, "n = {n}: {score} <= {last}");
            last = score;
        }
        // 下界收敛到均值本身，但不会超过
        assert!(last < 0.9);
    }

    #[test]
    fn three_way_ranking_by_evidence_and_similarity() {
        // 三张图片：50 条一致的高相似度证据、2 条近乎完美的证据、
        // 50 条一致的低相似度证据。样本太少的图片被重罚，
        // 排在大量中等证据之后。
        let mut hits: Vec<Vec<Neighbor>> = vec![];
        for i in 0..50u32 {
            let mut list = vec![neighbor(1, i, 13), neighbor(3, i, 102)];
            if i < 2 {
                list.push(neighbor(2, i, 3));
            }
            hits.push(list);
        }

        let opts = RankOptions { max_distance: 150, ..Default::default() };
        let matches = rank(&hits, &opts);

        let order: Vec<u32> = matches.iter().map(|m| m.image_id).collect();
        assert_eq!(order, vec![1, 3, 2]);
        assert_eq!(matches[0].evidence, 50);
        assert!(matches[0].score > matches[1].score);
        assert!(matches[1].score > matches[2].score);
    }

    #[test]
    fn wilson_single_sample_is_finite() {
        let score = wilson_score(&[0.9]);
        assert!(score.is_finite());
        assert!(score > 0.0 && score < 0.9);
    }

    #[test]
    fn per_query_descriptor_dedup_keeps_min_distance() {
        // 同一条查询描述子两次命中图片 3，只应算一条证据
        let hits = vec![vec![neighbor(3, 0, 40), neighbor(3, 1, 10)]];
        let matches = rank(&hits, &RankOptions { score_type: ScoreType::Count, ..Default::default() });
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].image_id, 3);
        assert_eq!(matches[0].evidence, 1);
    }

    #[test]
    fn max_distance_cutoff_drops_far_hits() {
        let hits = vec![vec![neighbor(1, 0, 10), neighbor(2, 0, 200)]];
        let matches = rank(&hits, &RankOptions::default());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].image_id, 1);
    }

    #[test]
    fn ranking_orders_by_score_desc() {
        // 图片 1 被 10 条描述子以小距离命中，图片 2 只被 1 条命中
        let mut hits = vec![];
        for i in 0..10 {
            hits.push(vec![neighbor(1, i, 8)]);
        }
        hits[0].push(neighbor(2, 0, 2));

        let matches = rank(&hits, &RankOptions::default());
        assert_eq!(matches[0].image_id, 1);
        assert_eq!(matches[0].evidence, 10);
        assert!(matches[0].score > matches[1].score);
    }

    #[test]
    fn limit_truncates_results() {
        let hits: Vec<Vec<Neighbor>> =
            (0..20).map(|i| vec![neighbor(i, 0, 10)]).collect();
        let matches = rank(&hits, &RankOptions { limit: 5, ..Default::default() });
        assert_eq!(matches.len(), 5);
    }

    #[test]
    fn empty_hits_rank_empty() {
        assert!(rank(&[], &RankOptions::default()).is_empty());
    }
}
