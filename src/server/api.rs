use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Multipart, State};
use axum::Json;
use log::info;
use prometheus::{Encoder, TextEncoder};
use rayon::prelude::*;
use tokio::task::block_in_place;

use super::error::Result;
use super::state::AppState;
use super::types::*;
use crate::descriptor::DescriptorSet;
use crate::extract::FeatureExtractor;
use crate::ivf::{SearchParams, SearchStats};
use crate::metrics;
use crate::ranker::RankOptions;

/// 搜索上传的图片
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<SearchResponse>> {
    let mut files = vec![];
    let mut nprobe = None;
    let mut max_candidates = None;
    let mut count = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => files.push(field.bytes().await?),
            Some("nprobe") => nprobe = Some(field.text().await?.parse()?),
            Some("max_candidates") => max_candidates = Some(field.text().await?.parse()?),
            Some("count") => count = Some(field.text().await?.parse()?),
            _ => {}
        }
    }
    if files.is_empty() {
        return Err(anyhow::anyhow!("缺少 file 字段").into());
    }

    let params = SearchParams {
        nprobe: nprobe.unwrap_or(state.search.nprobe),
        max_candidates: max_candidates.unwrap_or(state.search.max_candidates),
    };
    let rank_opts = RankOptions {
        limit: count.unwrap_or(state.search.count),
        max_distance: state.search.distance,
        score_type: state.search.score_type,
    };

    let start = Instant::now();
    info!("正在搜索 {} 张上传图片", files.len());

    let descriptors = block_in_place(|| {
        files
            .par_iter()
            .map(|file| state.extractor.extract(file))
            .collect::<anyhow::Result<Vec<DescriptorSet>>>()
    })?;

    let mut result = vec![];
    let mut stats = SearchStats::default();
    for set in &descriptors {
        let (matches, s) =
            state.db.search(&*state.index, set, state.search.k, &params, &rank_opts).await?;

        metrics::inc_search_count(set.len(), params.nprobe);
        if let Some(best) = matches.first() {
            metrics::observe_search_max_score(set.len(), params.nprobe, best.score);
        }

        stats.lists_probed += s.lists_probed;
        stats.distances_computed += s.distances_computed;
        stats.quantizer_time += s.quantizer_time;
        stats.scan_time += s.scan_time;
        result.push(matches.into_iter().map(SearchResult::from).collect());
    }

    let elapsed = start.elapsed();
    for set in &descriptors {
        metrics::observe_search_duration(
            set.len(),
            params.nprobe,
            elapsed.as_secs_f32() / descriptors.len() as f32,
        );
    }

    Ok(Json(SearchResponse {
        time: elapsed.as_millis() as u64,
        result,
        stats: stats.into(),
    }))
}

/// prometheus 指标
pub async fn metrics_handler() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer).map_err(anyhow::Error::from)?)
}
