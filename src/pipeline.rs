//! 入库管道
//!
//! 三段式：喂入线程负责读文件、算哈希、按哈希去重；
//! N 个工作线程并行跑特征提取；单个写入线程串行落库。
//! 提取阶段的失败只计数不中断，数据库错误才是致命的。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use indicatif::ProgressBar;
use log::{debug, info, warn};
use tokio::runtime::Handle;

use crate::descriptor::DescriptorSet;
use crate::error::Error;
use crate::extract::FeatureExtractor;
use crate::key::MAX_ORDINALS;
use crate::store::ImageStore;
use crate::utils::{hash_bytes, pb_style};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// 提取工作线程数量
    pub workers: usize,
    /// 低于该描述子数量的图片跳过
    pub min_descriptors: usize,
    /// 重复图片是否更新存储的路径
    pub overwrite: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self { workers: num_cpus::get(), min_descriptors: 10, overwrite: false }
    }
}

/// 一次入库运行的统计
#[derive(Debug, Default)]
pub struct PipelineSummary {
    /// 输入的文件总数
    pub total: u64,
    /// 新入库的图片数量
    pub added: u64,
    /// 按哈希去重跳过的数量
    pub duplicate: u64,
    /// 无法读取的文件数量
    pub failed_read: u64,
    /// 提取失败的数量
    pub failed_extract: u64,
    /// 描述子数量不足的数量
    pub too_few: u64,
    /// 描述子数量超出单图上限的数量
    pub over_capacity: u64,
}

struct Job {
    path: String,
    hash: [u8; 32],
    data: Vec<u8>,
}

struct Extracted {
    path: String,
    hash: [u8; 32],
    descriptors: DescriptorSet,
}

/// 执行入库管道，返回统计摘要
///
/// 同步阻塞接口，内部通过 `handle` 回到 tokio 运行时执行数据库操作，
/// 调用方应放在 `spawn_blocking` 中。
pub fn run(
    handle: &Handle,
    store: &ImageStore,
    extractor: &dyn FeatureExtractor,
    paths: &[PathBuf],
    opts: &PipelineOptions,
) -> Result<PipelineSummary> {
    let workers = opts.workers.max(1);
    let pb = ProgressBar::new(paths.len() as u64).with_style(pb_style());

    let added = AtomicU64::new(0);
    let duplicate = AtomicU64::new(0);
    let failed_read = AtomicU64::new(0);
    let failed_extract = AtomicU64::new(0);
    let too_few = AtomicU64::new(0);
    let over_capacity = AtomicU64::new(0);
    // 写入线程遇到数据库错误时置位，所有阶段尽快收尾
    let abort = AtomicBool::new(false);

    let fatal = std::thread::scope(|s| {
        let (job_tx, job_rx) = bounded::<Option<Job>>(workers * 2);
        let (out_tx, out_rx) = unbounded::<Option<Extracted>>();

        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let (pb, abort) = (&pb, &abort);
            let (failed_extract, too_few, over_capacity) =
                (&failed_extract, &too_few, &over_capacity);
            s.spawn(move || {
                loop {
                    match job_rx.recv_timeout(Duration::from_secs(1)) {
                        Ok(Some(job)) => match extractor.extract(&job.data) {
                            Ok(descriptors) if descriptors.len() < opts.min_descriptors => {
                                debug!("特征过少，跳过: {}", job.path);
                                too_few.fetch_add(1, Ordering::Relaxed);
                                pb.inc(1);
                            }
                            Ok(descriptors) if descriptors.len() > MAX_ORDINALS as usize => {
                                warn!("描述子超出单图上限，跳过: {}", job.path);
                                over_capacity.fetch_add(1, Ordering::Relaxed);
                                pb.inc(1);
                            }
                            Ok(descriptors) => {
                                let msg = Extracted {
                                    path: job.path,
                                    hash: job.hash,
                                    descriptors,
                                };
                                if out_tx.send(Some(msg)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("提取失败 {}: {e}", job.path);
                                failed_extract.fetch_add(1, Ordering::Relaxed);
                                pb.inc(1);
                            }
                        },
                        // 每个工作线程收到一个结束哨兵，转发给写入线程
                        Ok(None) => {
                            let _ = out_tx.send(None);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if abort.load(Ordering::Relaxed) {
                                let _ = out_tx.send(None);
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            let _ = out_tx.send(None);
                            break;
                        }
                    }
                }
            });
        }
        drop(out_tx);

        // 写入线程：唯一的存储写入者，数到 workers 个哨兵后退出
        let (added, duplicate, abort, pb) = (&added, &duplicate, &abort, &pb);
        let writer = s.spawn(move || -> Result<(), Error> {
            let mut sentinels = 0;
            let mut result = Ok(());
            while let Ok(msg) = out_rx.recv() {
                let Some(item) = msg else {
                    sentinels += 1;
                    if sentinels == workers {
                        break;
                    }
                    continue;
                };
                if result.is_err() {
                    // 已经出错，只排空队列
                    continue;
                }
                if let Err(e) = write_one(handle, store, &item, opts, added, duplicate) {
                    abort.store(true, Ordering::Relaxed);
                    result = Err(e);
                    continue;
                }
                pb.inc(1);
            }
            result
        });

        // 喂入阶段在当前线程执行
        for path in paths {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            let display = path.to_string_lossy().to_string();
            let data = match std::fs::read(path) {
                Ok(data) => data,
                Err(e) => {
                    debug!("读取失败 {display}: {e}");
                    failed_read.fetch_add(1, Ordering::Relaxed);
                    pb.inc(1);
                    continue;
                }
            };
            let hash = hash_bytes(&data);

            // 入队前先按哈希去重，省掉重复图片的提取开销
            match handle.block_on(store.lookup_by_hash(&hash)) {
                Ok(Some(id)) => {
                    if opts.overwrite {
                        if let Err(e) = handle.block_on(store.update_image_path(id, &display)) {
                            abort.store(true, Ordering::Relaxed);
                            warn!("更新路径失败 {display}: {e}");
                            break;
                        }
                        pb.set_message(format!("更新图片路径: {display}"));
                    }
                    duplicate.fetch_add(1, Ordering::Relaxed);
                    pb.inc(1);
                }
                Ok(None) => {
                    if job_tx.send(Some(Job { path: display, hash, data })).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    abort.store(true, Ordering::Relaxed);
                    warn!("查询哈希失败 {display}: {e}");
                    break;
                }
            }
        }
        // 每个工作线程一个结束哨兵
        for _ in 0..workers {
            if job_tx.send(None).is_err() {
                break;
            }
        }
        drop(job_tx);

        writer.join().expect("writer thread panicked")
    });

    pb.finish();

    let summary = PipelineSummary {
        total: paths.len() as u64,
        added: added.load(Ordering::Relaxed),
        duplicate: duplicate.load(Ordering::Relaxed),
        failed_read: failed_read.load(Ordering::Relaxed),
        failed_extract: failed_extract.load(Ordering::Relaxed),
        too_few: too_few.load(Ordering::Relaxed),
        over_capacity: over_capacity.load(Ordering::Relaxed),
    };

    info!(
        "入库完成: 共 {} 张，新增 {}，重复 {}，读取失败 {}，提取失败 {}，特征过少 {}，超出容量 {}",
        summary.total,
        summary.added,
        summary.duplicate,
        summary.failed_read,
        summary.failed_extract,
        summary.too_few,
        summary.over_capacity
    );

    match fatal {
        Ok(()) => Ok(summary),
        Err(e) => Err(anyhow!(e).context("入库中断，存储写入失败")),
    }
}

fn write_one(
    handle: &Handle,
    store: &ImageStore,
    item: &Extracted,
    opts: &PipelineOptions,
    added: &AtomicU64,
    duplicate: &AtomicU64,
) -> Result<(), Error> {
    match handle.block_on(store.create_image(&item.hash, &item.path)) {
        Ok(id) => {
            match handle.block_on(store.put_descriptors(id, &item.descriptors)) {
                Ok(()) => {}
                // 重放或并发写入者抢先，当作重复处理
                Err(Error::AlreadyWritten(_)) => {
                    duplicate.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            added.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        // 同一批输入里出现了内容相同的文件
        Err(Error::DuplicateImage(id)) => {
            if opts.overwrite {
                handle.block_on(store.update_image_path(id, &item.path))?;
            }
            duplicate.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
