use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::ivf::{AnnIndex, MmapIvf};
use crate::{Opts, PicDB};

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let db = PicDB::new(opts.conf_dir.clone(), true).await?;

        let images = db.store().count_images().await?;
        let descriptors = db.store().count_descriptors().await?;
        println!("图片数量  : {images}");
        println!("描述子数量: {descriptors}");

        let template = opts.conf_dir.template_index();
        println!("索引模板  : {}", if template.exists() { "已训练" } else { "未训练" });

        for (name, path) in opts.conf_dir.all_indexes() {
            let index = MmapIvf::load(&path)?;
            let watermark = db.store().get_indexed(&name).await?;
            println!(
                "索引 {name}: 向量 {}, 水位 {}, nlist {}, 不平衡度 {:.2}",
                index.ntotal(),
                watermark,
                index.nlist(),
                index.imbalance()
            );
        }
        Ok(())
    }
}
