use std::convert::Infallible;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::debug;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, Opts, SearchOptions};
use crate::extract::{CommandExtractor, FeatureExtractor};
use crate::ivf::SearchParams;
use crate::ranker::RankOptions;
use crate::{PicDB, SearchMatch};

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 使用的命名索引
    #[arg(long, default_value = "main")]
    pub index: String,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let extractor = CommandExtractor::new(&self.extract.extractor)?;
        let data = tokio::fs::read(&self.image).await?;
        let descriptors = block_in_place(|| extractor.extract(&data))?;

        let db = PicDB::new(opts.conf_dir.clone(), true).await?;
        let index = db.load_index(&self.index, !self.search.no_mmap)?;

        let params = SearchParams {
            nprobe: self.search.nprobe,
            max_candidates: self.search.max_candidates,
        };
        let rank_opts = RankOptions {
            limit: self.search.count,
            max_distance: self.search.distance,
            score_type: self.search.score_type,
        };

        let (results, stats) =
            db.search(&*index, &descriptors, self.search.k, &params, &rank_opts).await?;

        debug!("lists_probed       : {}", stats.lists_probed);
        debug!("distances_computed : {}", stats.distances_computed);
        debug!("quantizer_time     : {:.2?}", stats.quantizer_time);
        debug!("scan_time          : {:.2?}", stats.scan_time);

        print_result(&results, self)
    }
}

fn print_result(results: &[SearchMatch], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?)
        }
        OutputFormat::Table => {
            for m in results {
                println!("{:.2}\t{}", m.score, m.path);
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone)]
pub enum OutputFormat {
    Json,
    Table,
}

impl FromStr for OutputFormat {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            _ => unreachable!(),
        }
    }
}
