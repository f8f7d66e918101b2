//! 扁平键编码
//!
//! 倒排索引只认一个 u32 的键，这里负责在 `(image_id, ordinal)` 和
//! 扁平键之间做双向映射：高 22 位存图片 id，低 10 位存描述子在图片内的序号。
//! 理论容量约 420 万张图片，每张最多 1024 个描述子。

use crate::error::{Error, Result};

/// 描述子序号占用的位数
pub const ORDINAL_BITS: u32 = 10;
/// 每张图片允许的最大描述子数量
pub const MAX_ORDINALS: u32 = 1 << ORDINAL_BITS;
/// 图片 id 的上限（含）
pub const MAX_IMAGE_ID: u32 = (1 << (32 - ORDINAL_BITS)) - 1;

/// 编码扁平键，越界时返回 `CapacityExceeded`
///
/// 这是结构性容量错误而不是可重试错误：出现它说明当前键位宽
/// 已经装不下语料库，需要换编码方案。
#[inline]
pub fn encode(image_id: u32, ordinal: u32) -> Result<u32> {
    if ordinal >= MAX_ORDINALS || image_id > MAX_IMAGE_ID {
        return Err(Error::CapacityExceeded { image_id, ordinal });
    }
    Ok(image_id << ORDINAL_BITS | ordinal)
}

/// 解码扁平键，返回 `(image_id, ordinal)`
#[inline]
pub fn decode(key: u32) -> (u32, u32) {
    (key >> ORDINAL_BITS, key & (MAX_ORDINALS - 1))
}

/// 为一张图片的全部描述子生成连续的扁平键
pub fn encode_set(image_id: u32, count: usize) -> Result<Vec<u32>> {
    if count > MAX_ORDINALS as usize {
        return Err(Error::CapacityExceeded { image_id, ordinal: count as u32 });
    }
    (0..count as u32).map(|i| encode(image_id, i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for &(id, ord) in &[(0, 0), (1, 0), (42, 1023), (MAX_IMAGE_ID, 500)] {
            let key = encode(id, ord).unwrap();
            assert_eq!(decode(key), (id, ord));
        }
    }

    #[test]
    fn reject_ordinal_overflow() {
        assert!(matches!(
            encode(1, MAX_ORDINALS),
            Err(Error::CapacityExceeded { image_id: 1, ordinal: MAX_ORDINALS })
        ));
    }

    #[test]
    fn reject_image_id_overflow() {
        assert!(encode(MAX_IMAGE_ID + 1, 0).is_err());
    }

    #[test]
    fn encode_set_is_sequential() {
        let keys = encode_set(7, 3).unwrap();
        assert_eq!(keys, vec![7 << ORDINAL_BITS, (7 << ORDINAL_BITS) | 1, (7 << ORDINAL_BITS) | 2]);
        assert!(encode_set(7, MAX_ORDINALS as usize + 1).is_err());
    }
}
