use serde::Serialize;
use utoipa::ToSchema;

use crate::db::SearchMatch;
use crate::ivf::SearchStats;

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 上传的图片文件，可以是多张图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 搜索扫描的倒排列表数量
    pub nprobe: Option<usize>,
    /// 每条查询向量最多扫描的候选数量
    pub max_candidates: Option<usize>,
    /// 返回的结果数量
    pub count: Option<usize>,
}

/// 一条搜索结果
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResult {
    pub image_id: u32,
    /// 相似度分数
    pub score: f32,
    pub path: String,
    /// 命中的查询描述子数量
    pub evidence: usize,
}

impl From<SearchMatch> for SearchResult {
    fn from(m: SearchMatch) -> Self {
        Self { image_id: m.image_id, score: m.score, path: m.path, evidence: m.evidence }
    }
}

/// 索引层面的搜索统计
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchStatsView {
    pub lists_probed: u64,
    pub distances_computed: u64,
    pub quantizer_time_ms: u64,
    pub scan_time_ms: u64,
}

impl From<SearchStats> for SearchStatsView {
    fn from(s: SearchStats) -> Self {
        Self {
            lists_probed: s.lists_probed,
            distances_computed: s.distances_computed,
            quantizer_time_ms: s.quantizer_time.as_millis() as u64,
            scan_time_ms: s.scan_time.as_millis() as u64,
        }
    }
}

/// 搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u64,
    /// 每张上传图片的搜索结果
    pub result: Vec<Vec<SearchResult>>,
    /// 累计的索引统计
    pub stats: SearchStatsView,
}
