//! 错误类型定义
//!
//! 错误分级与处理策略：
//! - `MalformedRecord`: 记录级，可恢复。跳过该行并计入 failed，采集继续。
//! - `SourceUnavailable`: 文件级，可恢复。跳过该数据源，批量采集继续。
//! - `Database`: 文件/批次级，致命。中止当前事务，不推进 watermark。
//! - `Transport`: 同步尝试级，致命。写入 ledger（status=failed），本地 watermark 保留，
//!   重试即再次运行。
//!
//! 重复记录（natural key 已存在）不是错误，由报告中的 skipped 计数表达。

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误（对应存储写入失败：约束冲突、锁超时、磁盘错误）
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 记录格式错误（坏 JSON / 缺少必需字段），带源文件行号
    #[error("记录格式错误 (行 {line}): {reason}")]
    MalformedRecord { line: u64, reason: String },

    /// 数据源不可用（文件缺失或不可读）
    #[error("数据源不可用 ({path}): {reason}")]
    SourceUnavailable { path: String, reason: String },

    /// 同步传输错误（网络/远端命令失败）
    #[error("传输错误: {0}")]
    Transport(String),

    /// 同步协议错误（批次格式/版本不符）
    #[error("同步错误: {0}")]
    Sync(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 记录格式错误的便捷构造
    pub fn malformed(line: u64, reason: impl Into<String>) -> Self {
        Error::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
