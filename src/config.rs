//! 数据库与数据源配置

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// 数据库文件路径
    pub path: PathBuf,
}

impl DbConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("DATALAKE_DB") {
            return Self::local(expand_path(&path));
        }

        // 默认路径: ~/.datalake/db/datalake.db
        let default_path = dirs::home_dir()
            .map(|h| h.join(".datalake").join("db").join("datalake.db"))
            .unwrap_or_else(|| PathBuf::from("datalake.db"));

        Self::local(default_path)
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// 数据源根目录配置
///
/// - `claude_dir`: 会话日志与 history.jsonl 所在目录（默认 ~/.claude）
/// - `memory_dir`: 内存指标/事件 JSONL 所在目录（默认 ~/.datalake/memory）
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub claude_dir: PathBuf,
    pub memory_dir: PathBuf,
}

impl SourceConfig {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(claude_dir: P, memory_dir: Q) -> Self {
        Self {
            claude_dir: claude_dir.into(),
            memory_dir: memory_dir.into(),
        }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        let claude_dir = std::env::var("DATALAKE_CLAUDE_DIR")
            .map(|p| expand_path(&p))
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".claude"))
                    .unwrap_or_else(|| PathBuf::from(".claude"))
            });

        let memory_dir = std::env::var("DATALAKE_MEMORY_DIR")
            .map(|p| expand_path(&p))
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".datalake").join("memory"))
                    .unwrap_or_else(|| PathBuf::from("memory"))
            });

        Self {
            claude_dir,
            memory_dir,
        }
    }

    /// 会话日志项目目录
    pub fn projects_dir(&self) -> PathBuf {
        self.claude_dir.join("projects")
    }

    /// history.jsonl 路径
    pub fn history_file(&self) -> PathBuf {
        self.claude_dir.join("history.jsonl")
    }

    /// 内存指标文件路径
    pub fn metrics_file(&self) -> PathBuf {
        self.memory_dir.join("metrics.jsonl")
    }

    /// 内存事件文件路径
    pub fn events_file(&self) -> PathBuf {
        self.memory_dir.join("events.jsonl")
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// 展开用户输入路径中的 `~`
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

/// 设备名解析：环境变量 DATALAKE_DEVICE 优先，否则取 hostname
pub fn device_name() -> Result<String> {
    if let Ok(name) = std::env::var("DATALAKE_DEVICE") {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return Ok(name);
        }
    }

    sysinfo::System::host_name()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Config("无法确定设备名，请设置 DATALAKE_DEVICE".to_string()))
}

/// 构建会话日志文件的 glob 匹配器（默认只收 *.jsonl）
pub fn session_file_globs(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        let glob = Glob::new(p).map_err(|e| Error::Config(format!("无效 glob '{}': {}", p, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("glob 构建失败: {}", e)))
}

/// 默认会话日志匹配模式
pub const DEFAULT_SESSION_GLOBS: &[&str] = &["*.jsonl"];

/// 判断路径是否匹配会话日志模式
pub fn matches_session_glob(set: &GlobSet, path: &Path) -> bool {
    path.file_name().map(|n| set.is_match(n)).unwrap_or(false)
}
