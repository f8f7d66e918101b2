use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// picseek 核心错误类型
///
/// 提取阶段的失败（无法读取、特征点过少等）不属于这里：
/// 它们由管道统计并跳过，不会中断整次运行。
#[derive(Debug, Error)]
pub enum Error {
    /// 图片内容哈希已存在，携带已存在记录的 id
    #[error("图片已存在 (id = {0})")]
    DuplicateImage(u32),

    /// 描述子集合只允许写入一次
    #[error("图片 {0} 的描述子已写入，禁止覆盖")]
    AlreadyWritten(u32),

    /// 超出键编码的容量上限，说明键位宽已经不够用，需要修改编码方案
    #[error("超出键编码容量: image_id = {image_id}, ordinal = {ordinal}")]
    CapacityExceeded { image_id: u32, ordinal: u32 },

    /// 对未训练的索引执行 add
    #[error("索引尚未训练")]
    NotTrained,

    /// 训练模板文件不存在，无法创建命名索引
    #[error("索引模板不存在: {0}")]
    TrainingFileMissing(PathBuf),

    /// 命名索引文件不存在
    #[error("索引文件不存在: {0}")]
    IndexFileMissing(PathBuf),

    /// 描述子字节长度不是 32 的整数倍，或集合为空
    #[error("非法描述子数据: 期望 {expected} 字节的非空整数倍，实际 {got} 字节")]
    InvalidDescriptor { expected: usize, got: usize },

    /// 只读模式下的索引不支持修改
    #[error("索引为只读模式 (mmap)，不支持添加")]
    ReadOnlyIndex,

    /// 索引文件损坏或版本不兼容
    #[error("索引文件格式错误: {0}")]
    IndexFormat(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
