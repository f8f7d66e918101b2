//! 特征提取边界
//!
//! 关键点检测不在本仓库范围内，通过 trait 把提取器隔离在外。
//! 自带的实现把图片字节交给外部命令，从标准输出读回原始描述子。

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::descriptor::DescriptorSet;

pub trait FeatureExtractor: Send + Sync {
    /// 从图片原始字节中提取描述子集合
    ///
    /// 失败（无法解码、没有特征点等）对整次构建不是致命的，
    /// 调用方负责统计并跳过。
    fn extract(&self, image: &[u8]) -> Result<DescriptorSet>;
}

/// 外部命令提取器
///
/// 协议：图片字节写入子进程 stdin，子进程在 stdout 输出
/// 连续的 32 字节描述子，非零退出码视为提取失败。
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    /// 从命令行字符串构造，按空白切分出程序名和参数
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().context("提取命令不能为空")?;
        Ok(Self { program, args: parts.collect() })
    }
}

impl FeatureExtractor for CommandExtractor {
    fn extract(&self, image: &[u8]) -> Result<DescriptorSet> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("无法启动提取命令 {}", self.program))?;

        // 单独起线程喂 stdin，避免子进程边读边写时两端互相等待
        let mut stdin = child.stdin.take().context("无法获取子进程 stdin")?;
        let image = image.to_vec();
        let writer = std::thread::spawn(move || stdin.write_all(&image));

        let output = child.wait_with_output().context("等待提取命令退出失败")?;
        // 子进程提前退出时写端会收到 EPIPE，此时以退出码为准
        let _ = writer.join();
        if !output.status.success() {
            bail!("提取命令退出码异常: {}", output.status);
        }

        Ok(DescriptorSet::from_bytes(&output.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_extractor_reads_stdout() {
        // cat 原样回显，64 字节输入应该解析成 2 个描述子
        let extractor = CommandExtractor::new("cat").unwrap();
        let image = vec![0xABu8; 64];
        let set = extractor.extract(&image).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.as_bytes(), &image[..]);
    }

    #[test]
    fn misaligned_output_is_rejected() {
        let extractor = CommandExtractor::new("cat").unwrap();
        assert!(extractor.extract(&[0u8; 33]).is_err());
        assert!(extractor.extract(&[]).is_err());
    }

    #[test]
    fn failing_command_is_an_error() {
        let extractor = CommandExtractor::new("false").unwrap();
        assert!(extractor.extract(&[0u8; 32]).is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandExtractor::new("   ").is_err());
    }
}
