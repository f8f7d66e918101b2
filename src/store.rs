//! 元数据与描述子存储
//!
//! 以内容哈希做去重的图片表 + 一次写入的描述子表，
//! 外加每个命名索引的构建水位。所有写操作在返回时已落盘。

use std::path::Path;

use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::descriptor::{Descriptor, DescriptorSet};
use crate::error::{Error, Result};

pub struct ImageStore {
    pool: SqlitePool,
}

impl ImageStore {
    /// 打开数据库，不存在时创建并跑迁移
    ///
    /// 查询进程传 `read_only = true`，避免和构建进程争抢写锁。
    pub async fn open(filename: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let filename = filename.as_ref();
        info!("初始化数据库连接: {}", filename.display());

        let options = SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .filename(filename)
            .read_only(read_only)
            .create_if_missing(!read_only);

        let pool = SqlitePool::connect_with(options).await?;

        if !read_only {
            sqlx::migrate!().run(&pool).await.map_err(sqlx::Error::from)?;
        }

        Ok(Self { pool })
    }

    /// 按内容哈希查找图片 id
    pub async fn lookup_by_hash(&self, hash: &[u8]) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT id FROM image WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("id") as u32))
    }

    /// 登记一张新图片，哈希冲突时返回 `DuplicateImage` 并携带已有 id
    pub async fn create_image(&self, hash: &[u8], path: &str) -> Result<u32> {
        let result = sqlx::query("INSERT INTO image (hash, path) VALUES (?, ?) RETURNING id")
            .bind(hash)
            .bind(path)
            .fetch_one(&self.pool)
            .await;
        match result {
            Ok(row) => Ok(row.get::<i64, _>("id") as u32),
            Err(e) if is_unique_violation(&e) => {
                // 并发竞争下另一个写入者刚插入了同一哈希
                let id = self.lookup_by_hash(hash).await?.ok_or(Error::Storage(e))?;
                Err(Error::DuplicateImage(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 更新已有图片的路径，路径是可变元数据而不是身份
    pub async fn update_image_path(&self, id: u32, path: &str) -> Result<()> {
        sqlx::query("UPDATE image SET path = ? WHERE id = ?")
            .bind(path)
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 写入一张图片的描述子集合，只允许写一次
    pub async fn put_descriptors(&self, image_id: u32, descriptors: &DescriptorSet) -> Result<()> {
        let result = sqlx::query("INSERT INTO descriptor (image_id, count, data) VALUES (?, ?, ?)")
            .bind(image_id as i64)
            .bind(descriptors.len() as i64)
            .bind(descriptors.as_bytes())
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::AlreadyWritten(image_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_descriptors(&self, image_id: u32) -> Result<Option<DescriptorSet>> {
        let row = sqlx::query("SELECT data FROM descriptor WHERE image_id = ?")
            .bind(image_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| DescriptorSet::from_bytes(r.get::<&[u8], _>("data"))).transpose()
    }

    pub async fn get_path(&self, id: u32) -> Result<Option<String>> {
        let row = sqlx::query("SELECT path FROM image WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("path")))
    }

    /// 按 id 升序分批遍历描述子，从 `from_id` 之后开始
    ///
    /// 返回 (image_id, 描述子集合) 列表，空列表表示已经到头。
    /// 调用方记录最后一个 id 即可随时中断重启。
    pub async fn iterate(&self, from_id: u32, limit: u32) -> Result<Vec<(u32, DescriptorSet)>> {
        let rows = sqlx::query(
            "SELECT image_id, data FROM descriptor WHERE image_id > ? ORDER BY image_id ASC LIMIT ?",
        )
        .bind(from_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let set = DescriptorSet::from_bytes(r.get::<&[u8], _>("data"))?;
                Ok((r.get::<i64, _>("image_id") as u32, set))
            })
            .collect()
    }

    /// 随机抽取 n 张图片的全部描述子，用于训练
    pub async fn sample(&self, n: u32) -> Result<Vec<Descriptor>> {
        let rows = sqlx::query("SELECT data FROM descriptor ORDER BY RANDOM() LIMIT ?")
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut sample = vec![];
        for row in rows {
            let set = DescriptorSet::from_bytes(row.get::<&[u8], _>("data"))?;
            sample.extend_from_slice(set.as_slice());
        }
        Ok(sample)
    }

    pub async fn count_images(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM image").fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    pub async fn count_descriptors(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(SUM(count), 0) AS count FROM descriptor")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    /// 命名索引的构建水位：最后一个已入索引的图片 id，没有记录时为 0
    pub async fn get_indexed(&self, name: &str) -> Result<u32> {
        let row = sqlx::query("SELECT indexed FROM index_status WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("indexed") as u32).unwrap_or(0))
    }

    /// 推进命名索引的水位，单条 upsert 天然原子
    pub async fn set_indexed(&self, name: &str, watermark: u32) -> Result<()> {
        sqlx::query(
            "INSERT INTO index_status (name, indexed) VALUES (?, ?) \
             ON CONFLICT (name) DO UPDATE SET indexed = excluded.indexed",
        )
        .bind(name)
        .bind(watermark as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 所有命名索引及其水位
    pub async fn index_names(&self) -> Result<Vec<(String, u32)>> {
        let rows = sqlx::query("SELECT name, indexed FROM index_status ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| (r.get("name"), r.get::<i64, _>("indexed") as u32)).collect())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn open_store(dir: &TempDir) -> ImageStore {
        ImageStore::open(dir.path().join("test.db"), false).await.unwrap()
    }

    fn descriptors(seed: u8, count: usize) -> DescriptorSet {
        DescriptorSet::new(vec![[seed; 32]; count]).unwrap()
    }

    #[tokio::test]
    async fn duplicate_hash_reports_existing_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let id = store.create_image(b"hash-a", "/a.jpg").await.unwrap();
        let err = store.create_image(b"hash-a", "/elsewhere.jpg").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateImage(i) if i == id));

        assert_eq!(store.lookup_by_hash(b"hash-a").await.unwrap(), Some(id));
        assert_eq!(store.lookup_by_hash(b"hash-b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn descriptors_are_write_once() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let id = store.create_image(b"h", "/x.jpg").await.unwrap();
        store.put_descriptors(id, &descriptors(7, 3)).await.unwrap();

        let err = store.put_descriptors(id, &descriptors(9, 1)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyWritten(i) if i == id));

        let stored = store.get_descriptors(id).await.unwrap().unwrap();
        assert_eq!(stored, descriptors(7, 3));
    }

    #[tokio::test]
    async fn iterate_is_restartable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        for i in 0..5u8 {
            let id = store.create_image(&[i], &format!("/{i}.jpg")).await.unwrap();
            store.put_descriptors(id, &descriptors(i, 2)).await.unwrap();
        }

        let first = store.iterate(0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let last_id = first.last().unwrap().0;

        let rest = store.iterate(last_id, 100).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|(id, _)| *id > last_id));
        let ids: Vec<u32> = rest.iter().map(|(id, _)| *id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        assert!(store.iterate(u32::MAX, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watermark_upsert() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        assert_eq!(store.get_indexed("main").await.unwrap(), 0);
        store.set_indexed("main", 42).await.unwrap();
        store.set_indexed("other", 7).await.unwrap();
        store.set_indexed("main", 100).await.unwrap();

        assert_eq!(store.get_indexed("main").await.unwrap(), 100);
        assert_eq!(
            store.index_names().await.unwrap(),
            vec![("main".to_string(), 100), ("other".to_string(), 7)]
        );
    }

    #[tokio::test]
    async fn sample_and_counts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        for i in 0..4u8 {
            let id = store.create_image(&[i], "/img.jpg").await.unwrap();
            store.put_descriptors(id, &descriptors(i, 3)).await.unwrap();
        }

        assert_eq!(store.count_images().await.unwrap(), 4);
        assert_eq!(store.count_descriptors().await.unwrap(), 12);

        let sample = store.sample(2).await.unwrap();
        assert_eq!(sample.len(), 6);
    }
}
