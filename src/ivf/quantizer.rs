use hnsw_rs::prelude::*;
use rayon::prelude::*;

use crate::descriptor::Descriptor;
use crate::hamming::{hamming, TopK};

/// 粗量化器：把向量映射到最接近的若干个聚类中心
pub trait Quantizer: Send + Sync {
    /// 为每个向量返回最接近的 nprobe 个列表编号，按距离升序
    fn assign(&self, x: &[Descriptor], nprobe: usize) -> Vec<Vec<u32>>;
}

/// 暴力扫描量化器，nlist 较小时足够快且完全精确
pub struct FlatQuantizer {
    centroids: Vec<Descriptor>,
}

impl FlatQuantizer {
    pub fn new(centroids: Vec<Descriptor>) -> Self {
        Self { centroids }
    }
}

impl Quantizer for FlatQuantizer {
    fn assign(&self, x: &[Descriptor], nprobe: usize) -> Vec<Vec<u32>> {
        let nprobe = nprobe.min(self.centroids.len());
        x.par_iter()
            .map(|xq| {
                let mut top = TopK::new(nprobe);
                for (i, centroid) in self.centroids.iter().enumerate() {
                    top.push(i as u32, hamming(xq, centroid));
                }
                top.into_sorted().into_iter().map(|(i, _)| i).collect()
            })
            .collect()
    }
}

struct DistHamming;

impl Distance<u8> for DistHamming {
    fn eval(&self, va: &[u8], vb: &[u8]) -> f32 {
        hamming(va.try_into().unwrap(), vb.try_into().unwrap()) as f32
    }
}

/// HNSW 近似量化器，nlist 很大时用它代替暴力扫描
///
/// 图结构不持久化：加载索引时从聚类中心重建，
/// 几万个中心点的建图耗时可以忽略。
pub struct HnswQuantizer {
    hnsw: Hnsw<'static, u8, DistHamming>,
}

impl HnswQuantizer {
    pub fn build(centroids: &[Descriptor]) -> Self {
        let nlist = centroids.len();
        let hnsw = Hnsw::<u8, _>::new(32, nlist, 16, 128, DistHamming);
        centroids.par_iter().enumerate().for_each(|(i, c)| {
            hnsw.insert((c.as_slice(), i));
        });
        Self { hnsw }
    }
}

impl Quantizer for HnswQuantizer {
    fn assign(&self, x: &[Descriptor], nprobe: usize) -> Vec<Vec<u32>> {
        x.par_iter()
            .map(|xq| {
                self.hnsw
                    .search(xq.as_slice(), nprobe, 16.max(2 * nprobe))
                    .iter()
                    .map(|n| n.d_id as u32)
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn centroids() -> Vec<Descriptor> {
        vec![[0x00; 32], [0xFF; 32], [0x0F; 32]]
    }

    #[test]
    fn flat_assigns_nearest() {
        let q = FlatQuantizer::new(centroids());
        let lists = q.assign(&[[0x00; 32], [0xFE; 32]], 1);
        assert_eq!(lists, vec![vec![0], vec![1]]);
    }

    #[test]
    fn flat_nprobe_clamped_to_nlist() {
        let q = FlatQuantizer::new(centroids());
        let lists = q.assign(&[[0x00; 32]], 10);
        assert_eq!(lists[0].len(), 3);
        // 距离升序: 0x00 → 0 位, 0x0F → 128 位, 0xFF → 256 位
        assert_eq!(lists[0], vec![0, 2, 1]);
    }

    #[test]
    fn hnsw_finds_exact_centroid() {
        let cs: Vec<Descriptor> = (0..64u8).map(|i| [i; 32]).collect();
        let q = HnswQuantizer::build(&cs);
        let lists = q.assign(&[[7u8; 32]], 1);
        assert_eq!(lists[0], vec![7]);
    }
}
