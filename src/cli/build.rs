use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::runtime::Handle;
use tokio::task::spawn_blocking;

use crate::cli::SubCommandExtend;
use crate::db::BuildOptions;
use crate::{Opts, PicDB};

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    /// 命名索引，第一次使用时从模板复制
    #[arg(long, default_value = "main")]
    pub index: String,
    /// 构建索引时，多少张图片为一个批次
    #[arg(long, value_name = "SIZE", default_value_t = 10000)]
    pub batch_size: u32,
    /// 两次中间落盘之间的间隔秒数
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub flush_interval: u64,
}

impl SubCommandExtend for BuildCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let db = Arc::new(PicDB::new(opts.conf_dir.clone(), false).await?);
        let build_opts = BuildOptions {
            batch_size: self.batch_size,
            flush_interval: Duration::from_secs(self.flush_interval),
        };

        let handle = Handle::current();
        let name = self.index.clone();
        let report =
            spawn_blocking(move || db.build_index(&handle, &name, &build_opts)).await??;

        info!(
            "构建索引成功: 新增 {} 张图片，水位 {}，向量总数 {}",
            report.images_indexed, report.watermark, report.ntotal
        );
        Ok(())
    }
}
