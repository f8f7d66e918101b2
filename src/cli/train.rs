use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::{Opts, PicDB};

#[derive(Parser, Debug, Clone)]
pub struct TrainCommand {
    /// 用于采样训练的图片数量
    #[arg(short, long, default_value_t = 10000)]
    pub images: u32,
    /// 预期的语料库向量总数，决定聚类中心数量，默认按当前库中数量估算
    #[arg(short = 'n', long)]
    pub expected: Option<u64>,
    /// 最大迭代次数
    #[arg(short, long, default_value_t = 20)]
    pub max_iter: usize,
}

impl SubCommandExtend for TrainCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let db = PicDB::new(opts.conf_dir.clone(), false).await?;
        db.train_template(self.images, self.max_iter, self.expected).await
    }
}
