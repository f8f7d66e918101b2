use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressIterator};
use log::info;
use regex::Regex;
use tokio::runtime::Handle;
use tokio::task::spawn_blocking;
use walkdir::WalkDir;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, Opts};
use crate::extract::CommandExtractor;
use crate::pipeline::{self, PipelineOptions};
use crate::utils::pb_style;
use crate::PicDB;

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    /// 图片所在目录
    pub path: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,png,webp")]
    pub suffix: String,
    /// 提取工作线程数量，默认为 CPU 核心数
    #[arg(short, long)]
    pub jobs: Option<usize>,
    /// 如果图片已添加，是否更新存储的路径
    #[arg(long)]
    pub overwrite: bool,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let re_suf = format!("(?i)({})", self.suffix.replace(',', "|"));
        let re_suf = Regex::new(&re_suf).expect("failed to build regex");

        let paths = scan_directory(&self.path, &re_suf);
        if paths.is_empty() {
            info!("没有找到符合条件的图片");
            return Ok(());
        }

        let db = Arc::new(PicDB::new(opts.conf_dir.clone(), false).await?);
        let extractor = Arc::new(CommandExtractor::new(&self.extract.extractor)?);

        let pipeline_opts = PipelineOptions {
            workers: self.jobs.unwrap_or_else(num_cpus::get),
            min_descriptors: self.extract.min_descriptors,
            overwrite: self.overwrite,
        };

        let handle = Handle::current();
        spawn_blocking(move || {
            pipeline::run(&handle, db.store(), &*extractor, &paths, &pipeline_opts)
        })
        .await??;

        Ok(())
    }
}

fn scan_directory(path: &PathBuf, re_suf: &Regex) -> Vec<PathBuf> {
    info!("开始扫描目录: {}", path.display());
    let pb = ProgressBar::no_length().with_style(pb_style());
    let paths = WalkDir::new(path)
        .into_iter()
        .progress_with(pb)
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            if !path.is_file() {
                return None;
            }
            let ext = path.extension()?;
            re_suf.is_match(&ext.to_string_lossy()).then(|| path.to_path_buf())
        })
        .collect::<Vec<_>>();
    info!("扫描完成，共 {} 张图片", paths.len());
    paths
}
