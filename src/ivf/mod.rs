pub mod invlists;
pub mod quantizer;

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytemuck::cast_slice;
pub use invlists::*;
use log::debug;
use memmap2::Mmap;
pub use quantizer::*;
use rayon::prelude::*;

use crate::descriptor::{Descriptor, DESCRIPTOR_SIZE};
use crate::error::{Error, Result};
use crate::hamming::{hamming, TopK};
use crate::kmodes::{kmodes_2level, kmodes_binary};

/// 索引文件魔数
const INDEX_MAGIC: &[u8; 4] = b"PSIX";
/// 索引文件格式版本
const INDEX_VERSION: u32 = 1;
/// 文件头固定 32 字节，保证后续聚类中心区对齐
const HEADER_SIZE: usize = 32;
/// 超过这个 nlist 就用 HNSW 量化器代替暴力扫描
const HNSW_THRESHOLD: usize = 2048;

/// 单条最近邻结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub key: u32,
    pub distance: u32,
}

/// 搜索参数
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// 探查的倒排列表数量
    pub nprobe: usize,
    /// 每条查询向量最多扫描的候选数量，0 表示不限制
    pub max_candidates: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self { nprobe: 3, max_candidates: 0 }
    }
}

/// 一次搜索的诊断统计
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStats {
    /// 探查过的倒排列表总数
    pub lists_probed: u64,
    /// 实际计算过距离的候选总数
    pub distances_computed: u64,
    /// 量化耗时
    pub quantizer_time: Duration,
    /// 扫描耗时
    pub scan_time: Duration,
}

/// 搜索结果：每条查询向量一组近邻，外加统计信息
#[derive(Debug)]
pub struct SearchResponse {
    pub neighbors: Vec<Vec<Neighbor>>,
    pub stats: SearchStats,
}

/// 统一的索引接口，构建端（内存）和查询端（mmap）共用
pub trait AnnIndex: Send + Sync {
    fn is_trained(&self) -> bool;
    fn ntotal(&self) -> u64;
    /// 已写入的最大扁平键
    fn max_key(&self) -> Option<u32>;
    /// 批量添加向量，重放的键会被静默跳过，返回实际写入数量
    fn add(&mut self, keys: &[u32], vectors: &[Descriptor]) -> Result<usize>;
    fn search(&self, queries: &[Descriptor], k: usize, params: &SearchParams) -> SearchResponse;
    /// 原子保存：先写临时文件再重命名
    fn save(&self, path: &Path) -> Result<()>;
    fn imbalance(&self) -> f32;
}

/// 根据预期向量数量选择聚类中心数量
///
/// 百万以下走 8·√n，再往上按数量级翻倍，后者需要配合 HNSW 量化器
pub fn choose_nlist(n: u64) -> usize {
    if n == 0 {
        return 1;
    }
    if n <= 1_000_000 {
        (8.0 * (n as f64).sqrt()).round() as usize
    } else {
        2usize.pow((2.0 * (n as f64).log10() + 2.0).round() as u32)
    }
}

/// 二进制 IVF 索引
pub struct BinaryIvf<I: InvertedLists> {
    centroids: Vec<Descriptor>,
    quantizer: Option<Box<dyn Quantizer>>,
    invlists: I,
    max_key: Option<u32>,
}

pub type ArrayIvf = BinaryIvf<ArrayInvertedLists>;
pub type MmapIvf = BinaryIvf<MmapInvertedLists>;

impl ArrayIvf {
    /// 未训练的空索引：add 会报错，search 返回空结果
    pub fn untrained() -> Self {
        Self {
            centroids: vec![],
            quantizer: None,
            invlists: ArrayInvertedLists::new(0),
            max_key: None,
        }
    }

    /// 用采样向量训练码本，产出倒排列表为空的索引
    ///
    /// `expected_n` 是预期的语料库向量总数，决定 nlist；
    /// 没有给出时用采样数量代替。
    pub fn train(sample: &[Descriptor], expected_n: Option<u64>, max_iter: usize) -> Self {
        let n = expected_n.unwrap_or(sample.len() as u64);
        // kmodes 需要每个中心至少 30 个样本
        let nlist = choose_nlist(n).min(sample.len() / 30).max(1);

        let ks = if nlist > 256 {
            kmodes_2level(sample, nlist, max_iter)
        } else {
            kmodes_binary(sample, nlist, max_iter)
        };

        let quantizer = build_quantizer(&ks.centroids);
        Self {
            invlists: ArrayInvertedLists::new(ks.centroids.len()),
            centroids: ks.centroids,
            quantizer: Some(quantizer),
            max_key: None,
        }
    }

    /// 从文件完整加载到内存，用于追加构建
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut data = vec![];
        File::open(path)
            .map_err(|_| Error::IndexFileMissing(path.to_path_buf()))?
            .read_to_end(&mut data)?;
        let (centroids, lens, max_key, lists_base) = parse_header(&data)?;

        let nlist = centroids.len();
        let mut invlists = ArrayInvertedLists::new(nlist);
        let mut offset = lists_base;
        for (list_no, &len) in lens.iter().enumerate() {
            let split = offset + len * 4;
            let end = split + len * DESCRIPTOR_SIZE;
            if end > data.len() {
                return Err(Error::IndexFormat("倒排列表越过文件末尾".to_string()));
            }
            // Vec<u8> 不保证 4 字节对齐，这里用拷贝转换
            invlists.ids[list_no] = bytemuck::pod_collect_to_vec(&data[offset..split]);
            invlists.codes[list_no] = cast_slice(&data[split..end]).to_vec();
            offset = end;
        }

        let quantizer = build_quantizer(&centroids);
        Ok(Self { centroids, quantizer: Some(quantizer), invlists, max_key })
    }
}

impl MmapIvf {
    /// 只读加载：倒排列表直接映射文件，不复制进内存
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|_| Error::IndexFileMissing(path.to_path_buf()))?;
        let mmap = unsafe { Mmap::map(&file)? };
        let (centroids, lens, max_key, lists_base) = parse_header(&mmap)?;

        let quantizer = build_quantizer(&centroids);
        let invlists = MmapInvertedLists::new(mmap, lens, lists_base)?;
        Ok(Self { centroids, quantizer: Some(quantizer), invlists, max_key })
    }
}

fn build_quantizer(centroids: &[Descriptor]) -> Box<dyn Quantizer> {
    if centroids.len() >= HNSW_THRESHOLD {
        Box::new(HnswQuantizer::build(centroids))
    } else {
        Box::new(FlatQuantizer::new(centroids.to_vec()))
    }
}

/// 解析文件头，返回 (聚类中心, 各列表长度, max_key, 倒排列表区起始偏移)
fn parse_header(data: &[u8]) -> Result<(Vec<Descriptor>, Vec<usize>, Option<u32>, usize)> {
    if data.len() < HEADER_SIZE {
        return Err(Error::IndexFormat("文件太短".to_string()));
    }
    let mut cursor = Cursor::new(data);
    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic)?;
    if &magic != INDEX_MAGIC {
        return Err(Error::IndexFormat(format!("魔数不匹配: {magic:?}")));
    }
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != INDEX_VERSION {
        return Err(Error::IndexFormat(format!("不支持的版本: {version}")));
    }
    let nlist = cursor.read_u32::<LittleEndian>()? as usize;
    let code_size = cursor.read_u32::<LittleEndian>()? as usize;
    if code_size != DESCRIPTOR_SIZE {
        return Err(Error::IndexFormat(format!("向量宽度不匹配: {code_size}")));
    }
    // max_key 值本身占满整个 u32 域，是否存在由单独的标志位表示
    let max_key_raw = cursor.read_u32::<LittleEndian>()?;
    let max_key = (cursor.read_u32::<LittleEndian>()? != 0).then_some(max_key_raw);
    let ntotal = cursor.read_u64::<LittleEndian>()?;

    let centroids_end = HEADER_SIZE + nlist * DESCRIPTOR_SIZE;
    let lens_end = centroids_end + nlist * 8;
    if data.len() < lens_end {
        return Err(Error::IndexFormat("文件头声明的大小超过文件长度".to_string()));
    }

    let centroids: Vec<Descriptor> =
        cast_slice::<u8, Descriptor>(&data[HEADER_SIZE..centroids_end]).to_vec();
    let lens: Vec<usize> = data[centroids_end..lens_end]
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()) as usize)
        .collect();

    if lens.iter().map(|&l| l as u64).sum::<u64>() != ntotal {
        return Err(Error::IndexFormat("列表长度与 ntotal 不一致".to_string()));
    }

    Ok((centroids, lens, max_key, lens_end))
}

impl<I: InvertedLists> BinaryIvf<I> {
    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }
}

impl<I: InvertedLists> AnnIndex for BinaryIvf<I> {
    fn is_trained(&self) -> bool {
        self.quantizer.is_some()
    }

    fn ntotal(&self) -> u64 {
        self.invlists.ntotal()
    }

    fn max_key(&self) -> Option<u32> {
        self.max_key
    }

    fn add(&mut self, keys: &[u32], vectors: &[Descriptor]) -> Result<usize> {
        assert_eq!(keys.len(), vectors.len(), "keys and vectors length mismatch");
        let quantizer = self.quantizer.as_ref().ok_or(Error::NotTrained)?;

        // 键单调递增，重放的批次整体落在 max_key 之下，逐键过滤即可
        let fresh: Vec<(u32, &Descriptor)> = keys
            .iter()
            .zip(vectors)
            .filter(|(key, _)| self.max_key.is_none_or(|m| **key > m))
            .map(|(key, code)| (*key, code))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let codes: Vec<Descriptor> = fresh.iter().map(|(_, c)| **c).collect();
        let lists = quantizer.assign(&codes, 1);
        for ((key, code), list) in fresh.iter().zip(&lists) {
            self.invlists.add_entry(list[0] as usize, *key, code)?;
        }

        let batch_max = fresh.iter().map(|(key, _)| *key).max();
        self.max_key = self.max_key.max(batch_max);
        Ok(fresh.len())
    }

    fn search(&self, queries: &[Descriptor], k: usize, params: &SearchParams) -> SearchResponse {
        let Some(quantizer) = self.quantizer.as_ref() else {
            return SearchResponse {
                neighbors: vec![vec![]; queries.len()],
                stats: SearchStats::default(),
            };
        };
        if self.ntotal() == 0 || queries.is_empty() || k == 0 {
            return SearchResponse {
                neighbors: vec![vec![]; queries.len()],
                stats: SearchStats::default(),
            };
        }

        let start = Instant::now();
        let vlists = quantizer.assign(queries, params.nprobe);
        let quantizer_time = start.elapsed();

        let lists_probed = AtomicU64::new(0);
        let distances = AtomicU64::new(0);

        let scan_start = Instant::now();
        let neighbors: Vec<Vec<Neighbor>> = queries
            .par_iter()
            .zip(&vlists)
            .map(|(xq, lists)| {
                let mut top = TopK::new(k);
                let mut scanned = 0usize;
                let mut probed = 0u64;
                for &list_no in lists {
                    if params.max_candidates > 0 && scanned >= params.max_candidates {
                        break;
                    }
                    let (ids, codes) = self.invlists.get_list(list_no as usize);
                    for (key, code) in ids.iter().zip(codes.iter()) {
                        top.push(*key, hamming(xq, code));
                    }
                    scanned += ids.len();
                    probed += 1;
                }
                lists_probed.fetch_add(probed, Ordering::Relaxed);
                distances.fetch_add(scanned as u64, Ordering::Relaxed);
                top.into_sorted()
                    .into_iter()
                    .map(|(key, distance)| Neighbor { key, distance })
                    .collect()
            })
            .collect();
        let scan_time = scan_start.elapsed();

        debug!(
            "搜索 {} 条向量: 探查 {} 个列表, 计算 {} 次距离, 量化 {:?}, 扫描 {:?}",
            queries.len(),
            lists_probed.load(Ordering::Relaxed),
            distances.load(Ordering::Relaxed),
            quantizer_time,
            scan_time
        );

        SearchResponse {
            neighbors,
            stats: SearchStats {
                lists_probed: lists_probed.load(Ordering::Relaxed),
                distances_computed: distances.load(Ordering::Relaxed),
                quantizer_time,
                scan_time,
            },
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        if !self.is_trained() {
            return Err(Error::NotTrained);
        }
        // 临时文件带上完整索引名，不同命名索引的保存互不干扰
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);

            writer.write_all(INDEX_MAGIC)?;
            writer.write_u32::<LittleEndian>(INDEX_VERSION)?;
            writer.write_u32::<LittleEndian>(self.nlist() as u32)?;
            writer.write_u32::<LittleEndian>(DESCRIPTOR_SIZE as u32)?;
            writer.write_u32::<LittleEndian>(self.max_key.unwrap_or(0))?;
            writer.write_u32::<LittleEndian>(self.max_key.is_some() as u32)?;
            writer.write_u64::<LittleEndian>(self.ntotal())?;

            writer.write_all(cast_slice(&self.centroids))?;
            for i in 0..self.nlist() {
                writer.write_u64::<LittleEndian>(self.invlists.list_len(i) as u64)?;
            }
            for i in 0..self.nlist() {
                let (ids, codes) = self.invlists.get_list(i);
                writer.write_all(cast_slice(ids.as_ref()))?;
                writer.write_all(cast_slice(codes.as_ref()))?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn imbalance(&self) -> f32 {
        self.invlists.imbalance()
    }
}
