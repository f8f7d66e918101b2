use crate::descriptor::Descriptor;

/// 计算两个 256 位描述子的汉明距离
///
/// 按 8 字节分组异或取 popcount。描述子本身只有 1 字节对齐，
/// mmap 里的向量区也可能落在任意 4 字节边界上，
/// 所以这里按字节组装 u64 而不做切片转换。
#[inline(always)]
pub fn hamming(va: &Descriptor, vb: &Descriptor) -> u32 {
    let mut sum = 0;
    for (a, b) in va.chunks_exact(8).zip(vb.chunks_exact(8)) {
        let a = u64::from_le_bytes(a.try_into().unwrap());
        let b = u64::from_le_bytes(b.try_into().unwrap());
        sum += (a ^ b).count_ones();
    }
    sum
}

/// 候选集上的 k 近邻选择器
///
/// 维护一个按 (距离, 插入顺序) 升序排列的定长列表，
/// 相同距离时先插入的排在前面，保证结果稳定可复现。
pub struct TopK {
    k: usize,
    entries: Vec<(u32, u32)>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self { k, entries: Vec::with_capacity(k + 1) }
    }

    /// 当前第 k 小的距离，未满时为 None
    #[inline]
    pub fn threshold(&self) -> Option<u32> {
        if self.entries.len() == self.k { self.entries.last().map(|&(d, _)| d) } else { None }
    }

    #[inline]
    pub fn push(&mut self, key: u32, distance: u32) {
        if let Some(t) = self.threshold() {
            if distance >= t {
                return;
            }
        }
        // 相等距离插在所有相等项之后，维持插入顺序
        let pos = self.entries.partition_point(|&(d, _)| d <= distance);
        self.entries.insert(pos, (distance, key));
        self.entries.truncate(self.k);
    }

    /// 返回 (key, distance) 列表，按距离升序
    pub fn into_sorted(self) -> Vec<(u32, u32)> {
        self.entries.into_iter().map(|(d, k)| (k, d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_identical() {
        let v = [0xA5u8; 32];
        assert_eq!(hamming(&v, &v), 0);
    }

    #[test]
    fn hamming_all_bits() {
        let va = [0u8; 32];
        let vb = [0xFFu8; 32];
        assert_eq!(hamming(&va, &vb), 256);
    }

    #[test]
    fn hamming_on_unaligned_descriptors() {
        // 从奇数偏移切出描述子，对齐不能成为前提
        let mut buf = vec![0xA5u8; 65];
        buf[40] ^= 0b0110_0000;
        let va: &Descriptor = buf[1..33].try_into().unwrap();
        let vb: &Descriptor = buf[33..65].try_into().unwrap();
        assert_eq!(hamming(va, vb), 2);
    }

    #[test]
    fn hamming_single_bit() {
        let va = [0u8; 32];
        let mut vb = [0u8; 32];
        vb[17] = 0b0000_1000;
        assert_eq!(hamming(&va, &vb), 1);
    }

    #[test]
    fn topk_orders_by_distance() {
        let mut top = TopK::new(3);
        top.push(10, 5);
        top.push(11, 1);
        top.push(12, 3);
        top.push(13, 4);
        assert_eq!(top.into_sorted(), vec![(11, 1), (12, 3), (13, 4)]);
    }

    #[test]
    fn topk_stable_on_ties() {
        let mut top = TopK::new(2);
        top.push(1, 7);
        top.push(2, 7);
        top.push(3, 7);
        assert_eq!(top.into_sorted(), vec![(1, 7), (2, 7)]);
    }

    #[test]
    fn topk_fewer_than_k() {
        let mut top = TopK::new(5);
        top.push(1, 2);
        assert_eq!(top.into_sorted(), vec![(1, 2)]);
    }
}
