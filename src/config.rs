use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::ranker::ScoreType;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "", "picseek").expect("failed to get project dir");
    ConfDir { path: proj_dirs.data_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap()
}

#[derive(Parser, Debug, Clone)]
pub struct ExtractOptions {
    /// 特征提取命令，从 stdin 读图片字节，向 stdout 输出 32 字节描述子流
    #[arg(short = 'e', long, value_name = "CMD", default_value = "picseek-extract")]
    pub extractor: String,
    /// 低于该描述子数量的图片直接跳过
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub min_descriptors: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 不使用 mmap 模式加载索引，而是一次性全部加载到内存
    #[arg(long)]
    pub no_mmap: bool,
    /// 两个相似向量允许的最大距离，范围从 0 到 255
    #[arg(long, value_name = "N", default_value_t = 64, value_parser = clap::value_parser!(u32).range(0..=255))]
    pub distance: u32,
    /// 显示的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = 10)]
    pub count: usize,
    /// 每个查询描述子保留的最近邻数量
    #[arg(short, value_name = "K", default_value_t = 3)]
    pub k: usize,
    /// 搜索的倒排列表数量
    #[arg(long, default_value_t = 3)]
    pub nprobe: usize,
    /// 每条查询向量最多扫描的候选数量，0 表示不限制
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub max_candidates: usize,
    /// 评分方式
    #[arg(long, value_enum, default_value_t = ScoreType::Wilson)]
    pub score_type: ScoreType,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "picseek", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// picseek 数据目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 扫描目录，提取图片描述子并入库
    Add(AddCommand),
    /// 用已入库的描述子采样训练索引模板
    Train(TrainCommand),
    /// 把未索引的描述子增量写入命名索引
    Build(BuildCommand),
    /// 以图搜图
    Search(SearchCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
    /// 显示数据库和索引的统计信息
    Show(ShowCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回数据库文件的路径
    pub fn database(&self) -> PathBuf {
        self.path.join("picseek.db")
    }

    /// 返回索引模板文件的路径，训练产物，倒排列表为空
    pub fn template_index(&self) -> PathBuf {
        self.path.join("index.template")
    }

    /// 返回命名索引文件的路径
    pub fn index(&self, name: &str) -> PathBuf {
        self.path.join(format!("index.{name}"))
    }

    /// 列出已经存在的命名索引
    pub fn all_indexes(&self) -> Vec<(String, PathBuf)> {
        let Ok(entries) = std::fs::read_dir(&self.path) else {
            return vec![];
        };
        let mut indexes = vec![];
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if let Some(suffix) = name.strip_prefix("index.") {
                if suffix != "template" && !suffix.ends_with(".tmp") {
                    indexes.push((suffix.to_string(), entry.path()));
                }
            }
        }
        indexes.sort();
        indexes
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn all_indexes_skips_template_and_leftover_tmp() {
        let dir = TempDir::new().unwrap();
        let conf = ConfDir::from_str(dir.path().to_str().unwrap()).unwrap();

        std::fs::write(conf.index("main"), b"x").unwrap();
        std::fs::write(conf.index("other"), b"x").unwrap();
        std::fs::write(conf.template_index(), b"x").unwrap();
        // 崩溃留下的中间文件不能被当成命名索引
        std::fs::write(dir.path().join("index.other.tmp"), b"x").unwrap();
        std::fs::write(conf.database(), b"x").unwrap();

        let names: Vec<String> = conf.all_indexes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["main", "other"]);
    }
}
