use std::sync::Arc;

use crate::cli::server::ServerCommand;
use crate::config::SearchOptions;
use crate::extract::CommandExtractor;
use crate::ivf::AnnIndex;
use crate::PicDB;

/// 应用状态
pub struct AppState {
    /// 只读索引，进程启动时加载一次
    pub index: Box<dyn AnnIndex>,
    /// 数据库连接
    pub db: PicDB,
    /// 特征提取器
    pub extractor: CommandExtractor,
    /// 搜索配置选项
    pub search: SearchOptions,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        index: Box<dyn AnnIndex>,
        db: PicDB,
        opts: ServerCommand,
    ) -> anyhow::Result<Arc<Self>> {
        let extractor = CommandExtractor::new(&opts.extract.extractor)?;
        Ok(Arc::new(AppState { index, db, extractor, search: opts.search }))
    }
}
