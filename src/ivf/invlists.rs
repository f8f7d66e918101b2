use std::borrow::Cow;

use bytemuck::cast_slice;
use memmap2::Mmap;

use crate::descriptor::{Descriptor, DESCRIPTOR_SIZE};
use crate::error::{Error, Result};
use crate::kmodes::imbalance_factor;

/// 倒排列表的只读/读写抽象
///
/// 构建流程用内存版本，查询进程用 mmap 版本，两者共享同一份文件格式。
pub trait InvertedLists: Send + Sync {
    /// 倒排列表数量
    fn nlist(&self) -> usize;

    /// 指定倒排列表的元素数量
    fn list_len(&self, list_no: usize) -> usize;

    /// 指定倒排列表中的键列表和向量数据
    fn get_list(&self, list_no: usize) -> (Cow<'_, [u32]>, Cow<'_, [Descriptor]>);

    /// 往指定倒排列表中添加一个元素，只读实现返回 `ReadOnlyIndex`
    fn add_entry(&mut self, list_no: usize, key: u32, code: &Descriptor) -> Result<()>;

    /// 全部倒排列表的元素总数
    fn ntotal(&self) -> u64 {
        (0..self.nlist()).map(|i| self.list_len(i) as u64).sum()
    }

    /// 计算不平衡度
    fn imbalance(&self) -> f32 {
        let hist = (0..self.nlist()).map(|i| self.list_len(i)).collect::<Vec<_>>();
        imbalance_factor(&hist)
    }
}

/// 内存倒排列表
pub struct ArrayInvertedLists {
    pub ids: Vec<Vec<u32>>,
    pub codes: Vec<Vec<Descriptor>>,
}

impl ArrayInvertedLists {
    pub fn new(nlist: usize) -> Self {
        Self { ids: vec![vec![]; nlist], codes: vec![vec![]; nlist] }
    }
}

impl InvertedLists for ArrayInvertedLists {
    fn nlist(&self) -> usize {
        self.ids.len()
    }

    fn list_len(&self, list_no: usize) -> usize {
        self.ids[list_no].len()
    }

    fn get_list(&self, list_no: usize) -> (Cow<'_, [u32]>, Cow<'_, [Descriptor]>) {
        (Cow::Borrowed(&self.ids[list_no]), Cow::Borrowed(&self.codes[list_no]))
    }

    fn add_entry(&mut self, list_no: usize, key: u32, code: &Descriptor) -> Result<()> {
        self.ids[list_no].push(key);
        self.codes[list_no].push(*code);
        Ok(())
    }
}

/// mmap 只读倒排列表
///
/// 文件内每个列表的布局为 `[u32 键区][32 字节向量区]`，
/// 键区起始偏移保证 4 字节对齐，因此可以直接零拷贝 cast。
pub struct MmapInvertedLists {
    mmap: Mmap,
    lens: Vec<usize>,
    /// 每个列表键区在文件内的起始偏移
    offsets: Vec<usize>,
}

impl MmapInvertedLists {
    pub(crate) fn new(mmap: Mmap, lens: Vec<usize>, lists_base: usize) -> Result<Self> {
        let mut offsets = Vec::with_capacity(lens.len());
        let mut offset = lists_base;
        for &len in &lens {
            offsets.push(offset);
            offset += len * (4 + DESCRIPTOR_SIZE);
        }
        if offset > mmap.len() {
            return Err(Error::IndexFormat(format!(
                "倒排列表越过文件末尾: 需要 {offset} 字节，文件只有 {} 字节",
                mmap.len()
            )));
        }
        Ok(Self { mmap, lens, offsets })
    }
}

impl InvertedLists for MmapInvertedLists {
    fn nlist(&self) -> usize {
        self.lens.len()
    }

    fn list_len(&self, list_no: usize) -> usize {
        self.lens[list_no]
    }

    fn get_list(&self, list_no: usize) -> (Cow<'_, [u32]>, Cow<'_, [Descriptor]>) {
        let len = self.lens[list_no];
        let offset = self.offsets[list_no];
        let split = offset + len * 4;
        let ids: &[u32] = cast_slice(&self.mmap[offset..split]);
        let codes: &[Descriptor] = cast_slice(&self.mmap[split..split + len * DESCRIPTOR_SIZE]);
        (Cow::Borrowed(ids), Cow::Borrowed(codes))
    }

    fn add_entry(&mut self, _list_no: usize, _key: u32, _code: &Descriptor) -> Result<()> {
        Err(Error::ReadOnlyIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_invlists_basic() {
        let mut invlists = ArrayInvertedLists::new(3);
        assert_eq!(invlists.nlist(), 3);
        assert_eq!(invlists.ntotal(), 0);

        invlists.add_entry(0, 1, &[0x01; 32]).unwrap();
        invlists.add_entry(0, 2, &[0x02; 32]).unwrap();
        invlists.add_entry(2, 3, &[0x03; 32]).unwrap();

        assert_eq!(invlists.list_len(0), 2);
        assert_eq!(invlists.list_len(1), 0);
        assert_eq!(invlists.ntotal(), 3);

        let (ids, codes) = invlists.get_list(0);
        assert_eq!(ids.as_ref(), &[1, 2]);
        assert_eq!(codes[1], [0x02; 32]);
    }

    #[test]
    fn imbalance_of_populated_lists() {
        let mut invlists = ArrayInvertedLists::new(3);
        for key in 0..2u32 {
            invlists.add_entry(0, key, &[0; 32]).unwrap();
            invlists.add_entry(1, key + 2, &[0; 32]).unwrap();
        }
        invlists.add_entry(2, 4, &[0; 32]).unwrap();

        // 列表长度 [2, 2, 1] → (4 + 4 + 1) * 3 / 25 = 1.08
        assert!((invlists.imbalance() - 1.08).abs() < 0.01);
    }
}
