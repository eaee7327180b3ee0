//! 源文件发现
//!
//! 枚举本机需要采集的 JSONL 源，包括：
//! - 会话日志：`{claude_dir}/projects/{encoded_dir}/{session_id}.jsonl`
//!   （agent-xxx.jsonl 是 sidechain 会话，一并采集）
//! - 命令历史：`{claude_dir}/history.jsonl`
//! - 内存指标/事件：`{memory_dir}/metrics.jsonl`、`{memory_dir}/events.jsonl`
//!
//! 缺失的目录和文件不是错误，跳过即可（对应源从未产生过数据）。

use crate::config::{self, SourceConfig};
use crate::error::Result;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 源类型，决定每行用哪套规范化规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Session,
    History,
    Metrics,
    Events,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Session => "session",
            SourceKind::History => "history",
            SourceKind::Metrics => "metrics",
            SourceKind::Events => "events",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "session" => Ok(SourceKind::Session),
            "history" => Ok(SourceKind::History),
            "metrics" => Ok(SourceKind::Metrics),
            "events" => Ok(SourceKind::Events),
            other => Err(crate::error::Error::Config(format!(
                "未知源类型: {}",
                other
            ))),
        }
    }
}

/// 一个待采集的源文件
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub kind: SourceKind,
    /// 会话源：目录名解码出的项目路径（记录内 cwd 优先于它）
    pub project_path: Option<String>,
    /// 会话源：文件名里的会话 ID，记录缺少 sessionId 时的回退值
    pub session_hint: Option<String>,
}

/// 解码项目目录名为路径
///
/// Claude 将 `/Users/x/proj` 编码为 `-Users-x-proj`（斜杠换横线）。
/// 路径段本身含横线时解码有歧义，调用方应优先用记录内的 cwd。
pub fn decode_project_path(encoded: &str) -> String {
    encoded.replace('-', "/")
}

/// 枚举配置目录下的全部源文件（确定性排序）
pub fn discover(config: &SourceConfig) -> Result<Vec<SourceFile>> {
    let mut sources = Vec::new();

    discover_sessions(&config.projects_dir(), &mut sources)?;

    for (path, kind) in [
        (config.history_file(), SourceKind::History),
        (config.metrics_file(), SourceKind::Metrics),
        (config.events_file(), SourceKind::Events),
    ] {
        if path.is_file() {
            sources.push(SourceFile {
                path,
                kind,
                project_path: None,
                session_hint: None,
            });
        } else {
            tracing::debug!("源文件不存在，跳过: {:?}", path);
        }
    }

    sources.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(sources)
}

/// 扫描 projects 目录下的会话日志
fn discover_sessions(projects_dir: &Path, sources: &mut Vec<SourceFile>) -> Result<()> {
    if !projects_dir.is_dir() {
        tracing::debug!("projects 目录不存在，跳过: {:?}", projects_dir);
        return Ok(());
    }

    let globs = config::session_file_globs(config::DEFAULT_SESSION_GLOBS)?;

    for entry in fs::read_dir(projects_dir)?.flatten() {
        let project_dir = entry.path();
        if !project_dir.is_dir() {
            continue;
        }

        let encoded_name = match project_dir.file_name().and_then(|s| s.to_str()) {
            Some(s) if !s.is_empty() && !s.starts_with('.') => s.to_string(),
            _ => continue,
        };
        let decoded = decode_project_path(&encoded_name);

        for file_entry in fs::read_dir(&project_dir)?.flatten() {
            let file_path = file_entry.path();
            if !file_path.is_file() || !config::matches_session_glob(&globs, &file_path) {
                continue;
            }

            let session_hint = file_path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());

            sources.push(SourceFile {
                path: file_path,
                kind: SourceKind::Session,
                project_path: Some(decoded.clone()),
                session_hint,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_decode_project_path() {
        assert_eq!(decode_project_path("-Users-x-proj"), "/Users/x/proj");
        assert_eq!(decode_project_path("-home-u-work"), "/home/u/work");
    }

    #[test]
    fn test_source_kind_roundtrip() {
        for kind in [
            SourceKind::Session,
            SourceKind::History,
            SourceKind::Metrics,
            SourceKind::Events,
        ] {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_discover_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let claude = dir.path().join("claude");
        let memory = dir.path().join("memory");

        touch(&claude.join("projects/-Users-x-proj/abc.jsonl"));
        touch(&claude.join("projects/-Users-x-proj/agent-def.jsonl"));
        touch(&claude.join("projects/-Users-x-proj/notes.txt"));
        touch(&claude.join("history.jsonl"));
        touch(&memory.join("metrics.jsonl"));
        touch(&memory.join("events.jsonl"));

        let config = SourceConfig::new(&claude, &memory);
        let sources = discover(&config).unwrap();

        let sessions: Vec<_> = sources
            .iter()
            .filter(|s| s.kind == SourceKind::Session)
            .collect();
        assert_eq!(sessions.len(), 2);
        for s in &sessions {
            assert_eq!(s.project_path.as_deref(), Some("/Users/x/proj"));
        }
        assert!(sessions
            .iter()
            .any(|s| s.session_hint.as_deref() == Some("agent-def")));

        assert_eq!(
            sources
                .iter()
                .filter(|s| s.kind == SourceKind::History)
                .count(),
            1
        );
        assert_eq!(
            sources
                .iter()
                .filter(|s| s.kind == SourceKind::Metrics)
                .count(),
            1
        );
        assert_eq!(
            sources
                .iter()
                .filter(|s| s.kind == SourceKind::Events)
                .count(),
            1
        );
    }

    #[test]
    fn test_discover_tolerates_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = SourceConfig::new(dir.path().join("no-claude"), dir.path().join("no-memory"));
        let sources = discover(&config).unwrap();
        assert!(sources.is_empty());
    }

    #[test]
    fn test_discover_skips_hidden_project_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let claude = dir.path().join("claude");
        touch(&claude.join("projects/.hidden/abc.jsonl"));
        touch(&claude.join("projects/-p/abc.jsonl"));

        let config = SourceConfig::new(&claude, dir.path().join("memory"));
        let sources = discover(&config).unwrap();
        assert_eq!(sources.len(), 1);
    }
}
