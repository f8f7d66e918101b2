use bytemuck::cast_slice;

use crate::error::{Error, Result};

/// 单个描述子的字节数
pub const DESCRIPTOR_SIZE: usize = 32;
/// 单个描述子的位数，也是汉明距离的最大值
pub const DESCRIPTOR_BITS: u32 = 256;

/// 256 位二进制描述子
pub type Descriptor = [u8; DESCRIPTOR_SIZE];

/// 一张图片的描述子集合
///
/// 集合非空且在创建时校验过形状，后续所有存储/索引边界都可以直接信任它。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSet(Vec<Descriptor>);

impl DescriptorSet {
    pub fn new(rows: Vec<Descriptor>) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::InvalidDescriptor { expected: DESCRIPTOR_SIZE, got: 0 });
        }
        Ok(Self(rows))
    }

    /// 从连续的字节缓冲区中解析描述子集合，长度必须是 32 的非零整数倍
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() % DESCRIPTOR_SIZE != 0 {
            return Err(Error::InvalidDescriptor { expected: DESCRIPTOR_SIZE, got: data.len() });
        }
        let rows = data.chunks_exact(DESCRIPTOR_SIZE).map(|c| c.try_into().unwrap()).collect();
        Ok(Self(rows))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        // 构造时已拒绝空集合
        false
    }

    pub fn as_slice(&self) -> &[Descriptor] {
        &self.0
    }

    /// 以连续字节的形式查看，用于写入数据库
    pub fn as_bytes(&self) -> &[u8] {
        cast_slice(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_roundtrip() {
        let mut buf = vec![0u8; DESCRIPTOR_SIZE * 3];
        buf[0] = 1;
        buf[DESCRIPTOR_SIZE] = 2;
        let set = DescriptorSet::from_bytes(&buf).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.as_bytes(), &buf[..]);
        assert_eq!(set.as_slice()[1][0], 2);
    }

    #[test]
    fn reject_empty() {
        assert!(DescriptorSet::from_bytes(&[]).is_err());
        assert!(DescriptorSet::new(vec![]).is_err());
    }

    #[test]
    fn reject_misaligned() {
        let buf = vec![0u8; DESCRIPTOR_SIZE + 1];
        assert!(matches!(
            DescriptorSet::from_bytes(&buf),
            Err(Error::InvalidDescriptor { got: 33, .. })
        ));
    }
}
