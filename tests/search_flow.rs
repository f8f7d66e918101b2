use std::str::FromStr;
use std::sync::Arc;

use picseek::config::ConfDir;
use picseek::db::{BuildOptions, PicDB};
use picseek::descriptor::DescriptorSet;
use picseek::ivf::SearchParams;
use picseek::ranker::RankOptions;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio::runtime::Handle;

/// 生成一张图片的随机描述子集合，内容由种子决定
fn random_set(rng: &mut StdRng, rows: usize) -> DescriptorSet {
    let mut data = vec![0u8; rows * 32];
    rng.fill(&mut data[..]);
    DescriptorSet::from_bytes(&data).unwrap()
}

async fn insert_image(db: &PicDB, seed: u8, set: &DescriptorSet) -> u32 {
    let hash = [seed; 32];
    let id = db.store().create_image(&hash, &format!("/img/{seed}.jpg")).await.unwrap();
    db.store().put_descriptors(id, set).await.unwrap();
    id
}

async fn build(db: &Arc<PicDB>, handle: &Handle) -> picseek::db::BuildReport {
    let db = db.clone();
    let handle = handle.clone();
    tokio::task::spawn_blocking(move || db.build_index(&handle, "main", &BuildOptions::default()))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn add_train_build_search_roundtrip() {
    let dir = TempDir::new().unwrap();
    let conf_dir = ConfDir::from_str(dir.path().to_str().unwrap()).unwrap();
    let db = Arc::new(PicDB::new(conf_dir, false).await.unwrap());

    let mut rng = StdRng::seed_from_u64(42);
    let mut sets = vec![];
    for seed in 1..=40u8 {
        let set = random_set(&mut rng, 12);
        insert_image(&db, seed, &set).await;
        sets.push(set);
    }

    db.train_template(10000, 20, None).await.unwrap();

    let handle = Handle::current();
    let report = build(&db, &handle).await;
    assert_eq!(report.images_indexed, 40);
    assert_eq!(report.ntotal, 40 * 12);
    assert_eq!(report.watermark, 40);

    // 用第 5 张图片自己的描述子查询，应排在第一且证据满额
    let index = db.load_index("main", true).unwrap();
    let params = SearchParams { nprobe: 4, max_candidates: 0 };
    let rank_opts = RankOptions::default();
    let (matches, stats) = db.search(&*index, &sets[4], 3, &params, &rank_opts).await.unwrap();

    assert_eq!(matches[0].image_id, 5);
    assert_eq!(matches[0].evidence, 12);
    assert!(matches[0].score > 70.0, "score = {}", matches[0].score);
    assert_eq!(matches[0].path, "/img/5.jpg");
    assert!(stats.distances_computed > 0);

    // 追加一张图片后增量构建，只处理新增部分
    let extra = random_set(&mut rng, 12);
    insert_image(&db, 41, &extra).await;

    let report = build(&db, &handle).await;
    assert_eq!(report.images_indexed, 1);
    assert_eq!(report.ntotal, 41 * 12);
    assert_eq!(report.watermark, 41);

    let index = db.load_index("main", true).unwrap();
    let (matches, _) = db.search(&*index, &extra, 3, &params, &rank_opts).await.unwrap();
    assert_eq!(matches[0].image_id, 41);
}

#[tokio::test(flavor = "multi_thread")]
async fn rebuild_without_new_images_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let conf_dir = ConfDir::from_str(dir.path().to_str().unwrap()).unwrap();
    let db = Arc::new(PicDB::new(conf_dir, false).await.unwrap());

    let mut rng = StdRng::seed_from_u64(7);
    for seed in 1..=35u8 {
        let set = random_set(&mut rng, 12);
        insert_image(&db, seed, &set).await;
    }
    db.train_template(10000, 20, None).await.unwrap();

    let handle = Handle::current();
    let first = build(&db, &handle).await;
    assert_eq!(first.images_indexed, 35);

    let second = build(&db, &handle).await;
    assert_eq!(second.images_indexed, 0);
    assert_eq!(second.ntotal, first.ntotal);
    assert_eq!(second.watermark, first.watermark);
}
