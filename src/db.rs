//! 对外门面：把存储、索引、聚合串成完整的业务操作

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use tokio::runtime::Handle;

use crate::config::ConfDir;
use crate::descriptor::DescriptorSet;
use crate::error::Error;
use crate::ivf::{AnnIndex, ArrayIvf, MmapIvf, SearchParams, SearchStats};
use crate::key;
use crate::ranker::{self, RankOptions, ScoreType};
use crate::store::ImageStore;

pub struct PicDB {
    conf_dir: ConfDir,
    store: ImageStore,
}

/// 一条图片级别的搜索结果
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub image_id: u32,
    pub score: f32,
    pub path: String,
    /// 命中的查询描述子数量
    pub evidence: usize,
}

/// 一次增量构建的结果
#[derive(Debug, Default)]
pub struct BuildReport {
    /// 本次新入索引的图片数量
    pub images_indexed: u64,
    /// 构建后索引里的向量总数
    pub ntotal: u64,
    /// 构建后的水位
    pub watermark: u32,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// 每批从存储取出的图片数量
    pub batch_size: u32,
    /// 两次落盘之间的最小间隔
    pub flush_interval: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { batch_size: 10000, flush_interval: Duration::from_secs(300) }
    }
}

impl PicDB {
    pub async fn new(conf_dir: ConfDir, read_only: bool) -> Result<Self> {
        if !read_only {
            std::fs::create_dir_all(conf_dir.path())?;
        }
        let store = ImageStore::open(conf_dir.database(), read_only).await?;
        Ok(Self { conf_dir, store })
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn conf_dir(&self) -> &ConfDir {
        &self.conf_dir
    }

    /// 采样训练码本，保存为索引模板
    ///
    /// `sample_images` 是参与采样的图片数量，`expected` 是预期的
    /// 语料库向量总数，不给时按当前库中数量估算。
    pub async fn train_template(
        &self,
        sample_images: u32,
        max_iter: usize,
        expected: Option<u64>,
    ) -> Result<()> {
        let sample = self.store.sample(sample_images).await?;
        if sample.is_empty() {
            anyhow::bail!("数据库中没有可用于训练的描述子");
        }
        let expected = match expected {
            Some(n) => n,
            None => self.store.count_descriptors().await?,
        };
        info!("采样 {} 组向量，预期语料库规模 {expected}", sample.len());

        let template = self.conf_dir.template_index();
        let index = tokio::task::spawn_blocking(move || {
            ArrayIvf::train(&sample, Some(expected), max_iter)
        })
        .await?;

        index.save(&template)?;
        info!("索引模板已保存: {} (nlist = {})", template.display(), index.nlist());
        Ok(())
    }

    /// 打开命名索引用于构建，第一次使用时从模板复制
    pub fn open_index(&self, name: &str) -> Result<ArrayIvf> {
        let path = self.conf_dir.index(name);
        if !path.exists() {
            let template = self.conf_dir.template_index();
            if !template.exists() {
                return Err(Error::TrainingFileMissing(template).into());
            }
            std::fs::copy(&template, &path)
                .with_context(|| format!("复制索引模板到 {}", path.display()))?;
            info!("从模板创建命名索引: {}", path.display());
        }
        Ok(ArrayIvf::load(&path)?)
    }

    /// 打开命名索引用于查询，默认 mmap 零拷贝加载
    pub fn load_index(&self, name: &str, mmap: bool) -> Result<Box<dyn AnnIndex>> {
        let path = self.conf_dir.index(name);
        let index: Box<dyn AnnIndex> = if mmap {
            Box::new(MmapIvf::load(&path)?)
        } else {
            Box::new(ArrayIvf::load(&path)?)
        };
        debug!("索引加载完成: {} 个向量", index.ntotal());
        Ok(index)
    }

    /// 增量构建命名索引
    ///
    /// 从水位之后开始按 id 升序分批添加，每隔 `flush_interval`
    /// 原子落盘一次并推进水位。先保存索引再推进水位，
    /// 崩溃后重放的批次会被索引按键去重。
    ///
    /// 同步阻塞接口，应放在 `spawn_blocking` 中执行。
    pub fn build_index(&self, handle: &Handle, name: &str, opts: &BuildOptions) -> Result<BuildReport> {
        let mut index = self.open_index(name)?;
        let path = self.conf_dir.index(name);

        let watermark = handle.block_on(self.store.get_indexed(name))?;
        info!("开始增量构建 {name}: 水位 = {watermark}, 已有向量 = {}", index.ntotal());

        let mut cursor = watermark;
        let mut images = 0u64;
        let mut last_flush = Instant::now();

        loop {
            let batch = handle.block_on(self.store.iterate(cursor, opts.batch_size))?;
            if batch.is_empty() {
                break;
            }
            for (image_id, set) in &batch {
                let keys = key::encode_set(*image_id, set.len())?;
                index.add(&keys, set.as_slice())?;
                images += 1;
            }
            cursor = batch.last().map(|(id, _)| *id).unwrap_or(cursor);

            if last_flush.elapsed() >= opts.flush_interval {
                info!("中间落盘: 水位 {cursor}, 向量总数 {}", index.ntotal());
                index.save(&path)?;
                handle.block_on(self.store.set_indexed(name, cursor))?;
                last_flush = Instant::now();
            }
        }

        if cursor > watermark {
            index.save(&path)?;
            handle.block_on(self.store.set_indexed(name, cursor))?;
        }
        info!("构建完成: 新增 {images} 张图片, 向量总数 {}, 不平衡度 {:.2}", index.ntotal(), index.imbalance());

        Ok(BuildReport { images_indexed: images, ntotal: index.ntotal(), watermark: cursor })
    }

    /// 搜索一组查询描述子，聚合成图片级别的排名
    pub async fn search(
        &self,
        index: &dyn AnnIndex,
        descriptors: &DescriptorSet,
        k: usize,
        params: &SearchParams,
        rank_opts: &RankOptions,
    ) -> Result<(Vec<SearchMatch>, SearchStats)> {
        let start = Instant::now();
        let resp = index.search(descriptors.as_slice(), k, params);
        let matches = ranker::rank(&resp.neighbors, rank_opts);

        let mut results = Vec::with_capacity(matches.len());
        for m in matches {
            let path = self.store.get_path(m.image_id).await?.unwrap_or_default();
            let score = match rank_opts.score_type {
                ScoreType::Wilson => 100.0 * m.score,
                ScoreType::Count => m.score,
            };
            results.push(SearchMatch { image_id: m.image_id, score, path, evidence: m.evidence });
        }
        debug!("搜索耗时 {:.2}s", start.elapsed().as_secs_f32());

        Ok((results, resp.stats))
    }
}
