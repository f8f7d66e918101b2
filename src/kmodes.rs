use indicatif::{ProgressBar, ProgressIterator};
use log::info;
use rand::prelude::*;
use rand::rng;
use rayon::prelude::*;

use crate::descriptor::Descriptor;
use crate::hamming::hamming;
use crate::utils::pb_style;

/// 两级 K-modes 聚类
///
/// 中心点数量很大时直接聚类太慢：先聚出 sqrt(nc) 个一级中心，
/// 再在每个一级簇内部按簇大小加权聚出二级中心，最终恰好得到 nc 个。
pub fn kmodes_2level(x: &[Descriptor], nc: usize, max_iter: usize) -> KModeState {
    let n = x.len();
    assert!(n >= 30 * nc, "向量数量必须大于 30 * {nc}");
    let nc1 = nc.isqrt();

    // 没有必要用全部向量进行一级聚类，这里取 nc1 的 1024 倍来训练，平衡精度和耗时
    let n1 = (nc1 * 1024).min(n);
    info!("对 {n1} 组向量进行 1 级聚类，中心点数量 = {nc1}");
    let ks = kmodes_binary(&x[..n1], nc1, max_iter);
    info!("1 级聚类完成，不平衡度：{:.2}", imbalance_factor(&ks.centroid_frequency));

    info!("根据 1 级聚类结果划分训练集");
    let (r, _) = update_assignments(x, &ks.centroids);

    // 一级聚类中，每个聚类中心分配到的向量列表
    let mut xc = vec![vec![]; nc1];
    r.iter().enumerate().for_each(|(i, r)| {
        xc[*r].push(x[i]);
    });

    // 此处使用了累加和+错位相减来进行加权分配，这样可以保证 sum(nc2) = nc
    let bc_sum = xc
        .iter()
        .scan(0, |acc, x| {
            *acc += x.len();
            Some(*acc)
        })
        .collect::<Vec<_>>();
    let mut nc2 = bc_sum.iter().map(|x| x * nc / bc_sum[bc_sum.len() - 1]).collect::<Vec<_>>();
    for i in (1..nc2.len()).rev() {
        nc2[i] -= nc2[i - 1];
    }
    assert_eq!(nc2.iter().sum::<usize>(), nc);

    let mut fks = KModeState::default();
    let pb = ProgressBar::new(nc1 as u64).with_style(pb_style());
    for i in (0..nc1).progress_with(pb.clone()) {
        let x = &xc[i];
        if nc2[i] > 0 {
            let ks = kmodes_binary(x, nc2[i], max_iter);
            let factor = imbalance_factor(&ks.centroid_frequency);
            pb.set_message(format!(
                "对 {} 组向量进行二级聚类，中心点数量 = {}, 不平衡度 = {factor:.2}",
                x.len(),
                nc2[i]
            ));
            fks.distsum += ks.distsum;
            fks.centroids.extend(ks.centroids);
            fks.centroid_frequency.extend(ks.centroid_frequency);
        }
    }
    pb.finish_with_message("二级聚类完成");

    assert_eq!(fks.centroids.len(), nc);

    info!("总距离：{}，不平衡度：{:.2}", fks.distsum, imbalance_factor(&fks.centroid_frequency));

    fks
}

#[derive(Debug, Clone, Default)]
pub struct KModeState {
    /// 聚类中心到所有向量的总距离
    pub distsum: u32,
    /// 聚类中心
    pub centroids: Vec<Descriptor>,
    /// 每个聚类中心包含的向量数量
    pub centroid_frequency: Vec<usize>,
}

/// 二进制向量上的 K-modes 聚类
pub fn kmodes_binary(data: &[Descriptor], k: usize, max_iter: usize) -> KModeState {
    if data.is_empty() || k == 0 {
        return KModeState::default();
    }

    let mut rng = rng();

    // 随机初始化聚类中心
    let mut centroids: Vec<Descriptor> = data.choose_multiple(&mut rng, k).cloned().collect();

    let mut assignments;
    let mut distance = u32::MAX;
    let mut centroid_frequency = vec![0; k];

    for _ in 0..max_iter {
        // 分配每个数据点到最近的聚类中心
        let (new_assignments, new_distance) = update_assignments(data, &centroids);

        // 如果距离没有变小，则算法收敛
        if new_distance >= distance {
            break;
        }
        assignments = new_assignments;
        distance = new_distance;

        // 更新聚类中心
        let (new_centroids, new_centroid_frequency): (Vec<Descriptor>, Vec<usize>) = (0..k)
            .into_par_iter()
            .map(|cluster_id| update_centroid(data, &assignments, cluster_id))
            .unzip();
        centroids = new_centroids;
        centroid_frequency = new_centroid_frequency;
    }

    KModeState { distsum: distance, centroids, centroid_frequency }
}

/// 将每个点分配给最近的聚类中心，并返回聚类中心的序号和总距离
fn update_assignments(data: &[Descriptor], centroids: &[Descriptor]) -> (Vec<usize>, u32) {
    let (assignments, distances): (Vec<_>, Vec<_>) = data
        .par_iter()
        .map(|point| {
            let mut min_distance = u32::MAX;
            let mut best_cluster = 0;

            for (j, centroid) in centroids.iter().enumerate() {
                let distance = hamming(point, centroid);
                if distance < min_distance {
                    min_distance = distance;
                    best_cluster = j;
                }
            }

            (best_cluster, min_distance)
        })
        .unzip();
    let distance = distances.iter().sum();
    (assignments, distance)
}

/// 更新聚类中心：计算分配给该聚类的所有点的众数
fn update_centroid(
    data: &[Descriptor],
    assignments: &[usize],
    cluster_id: usize,
) -> (Descriptor, usize) {
    let cluster_points: Vec<&Descriptor> = data
        .iter()
        .zip(assignments.iter())
        .filter_map(|(point, &assignment)| (assignment == cluster_id).then_some(point))
        .collect();

    if cluster_points.is_empty() {
        return ([0u8; 32], 0);
    }

    let mut new_centroid = [0u8; 32];

    // 对每个字节位置逐 bit 计算众数
    for byte_pos in 0..32 {
        let mut bit_counts = [0u32; 8];

        for point in &cluster_points {
            let byte_val = point[byte_pos];
            for bit_pos in 0..8 {
                if (byte_val >> bit_pos) & 1 == 1 {
                    bit_counts[bit_pos] += 1;
                }
            }
        }

        let mut new_byte = 0u8;
        let half_count = cluster_points.len() as u32 / 2;

        for bit_pos in 0..8 {
            if bit_counts[bit_pos] > half_count {
                new_byte |= 1 << bit_pos;
            }
        }

        new_centroid[byte_pos] = new_byte;
    }

    (new_centroid, cluster_points.len())
}

/// 计算不平衡因子：nc * Σh² / (Σh)²，完全均匀时为 1
pub fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}
