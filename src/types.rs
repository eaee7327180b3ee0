//! 数据类型定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 同步结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// 全部表应用成功
    Success,
    /// 部分表成功后失败，已应用部分保留，watermark 只推进到失败表之前
    Partial,
    /// 传输前/传输中失败，本地 watermark 不变
    Failed,
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(SyncStatus::Success),
            "partial" => Ok(SyncStatus::Partial),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Success => write!(f, "success"),
            SyncStatus::Partial => write!(f, "partial"),
            SyncStatus::Failed => write!(f, "failed"),
        }
    }
}

/// 设备角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// 合并目标（唯一）
    Primary,
    /// 向 primary 推送自己数据的设备
    Secondary,
}

impl FromStr for DeviceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(DeviceRole::Primary),
            "secondary" => Ok(DeviceRole::Secondary),
            _ => Err(format!("Invalid device role: {}", s)),
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Primary => write!(f, "primary"),
            DeviceRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// 设备注册信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub role: String,
    pub last_seen_at: Option<i64>,
    pub last_sync_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 会话（一个 assistant session 一行）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub session_id: String,
    pub device: String,
    pub project_path: Option<String>,
    pub summary: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub git_branch: Option<String>,
    // 聚合计数（与 messages 同事务维护）
    pub total_messages: i64,
    pub user_messages: i64,
    pub assistant_messages: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cache_read_tokens: i64,
    pub total_cache_creation_tokens: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    // 用户标注
    pub tags: Option<String>,
    pub rating: Option<i64>,
    pub source_file: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub r#type: String,
    pub role: Option<String>,
    pub model: Option<String>,
    pub content_text: String,
    pub content_thinking: String,
    pub word_count: i64,
    pub image_count: i64,
    pub tool_use_count: i64,
    pub tool_result_count: i64,
    pub is_sidechain: bool,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub stop_reason: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: i64,
    pub sequence: i64,
    pub device: String,
}

/// History 记录（轻量 prompt，复合 key (session_id, timestamp) 去重）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub session_id: String,
    pub display: String,
    pub pasted_contents: Option<String>,
    pub project: Option<String>,
    pub timestamp: i64,
    pub device: String,
}

/// 内存指标采样（(device, pid, timestamp) 去重）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub id: i64,
    pub pid: i64,
    pub session_id: Option<String>,
    pub rss_bytes: i64,
    pub rss_mb: Option<f64>,
    pub rate_mb_min: Option<f64>,
    pub command: Option<String>,
    pub timestamp: i64,
    pub device: String,
}

/// 内存事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: i64,
    pub event_type: String,
    pub pid: i64,
    pub session_id: Option<String>,
    pub severity: String,
    pub message: Option<String>,
    pub details: Option<String>,
    pub timestamp: i64,
    pub device: String,
}

/// 源文件采集进度（watermark）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFileState {
    pub device: String,
    pub path: String,
    pub source_kind: String,
    pub byte_offset: u64,
    pub line_no: u64,
    pub file_key: Option<String>,
    pub file_size: Option<u64>,
}

/// 同步 ledger 行（append-only 审计）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLedgerEntry {
    pub id: i64,
    pub batch_id: String,
    pub direction: String,
    pub source_device: String,
    pub target_device: String,
    pub records_sent: i64,
    pub records_applied: i64,
    pub records_skipped: i64,
    pub status: String,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// 采集报告
///
/// inserted/skipped/failed 三个计数对应三种逐行结果：
/// 新插入、natural key 已存在（幂等跳过，不是错误）、格式错误。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
    /// 逐条错误描述（带行号），供运维诊断，不中断采集
    pub errors: Vec<String>,
}

impl IngestReport {
    /// 合并另一份报告（批量采集汇总用）
    pub fn merge(&mut self, other: IngestReport) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// 消息搜索结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub message_id: i64,
    pub session_id: String,
    pub uuid: String,
    pub r#type: String,
    pub snippet: String,
    pub score: f64,
    pub timestamp: i64,
}

/// History 搜索结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySearchResult {
    pub session_id: String,
    pub snippet: String,
    pub score: f64,
    pub timestamp: i64,
}

/// 统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeStats {
    pub device_count: i64,
    pub conversation_count: i64,
    pub message_count: i64,
    pub history_count: i64,
    pub metric_count: i64,
    pub event_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
}

/// 聚合一致性检查结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub conversations_checked: i64,
    /// 聚合值与重算值不一致的 session_id 列表
    pub drifted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_roundtrip() {
        for s in [SyncStatus::Success, SyncStatus::Partial, SyncStatus::Failed] {
            assert_eq!(s.to_string().parse::<SyncStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_report_merge() {
        let mut a = IngestReport {
            inserted: 3,
            skipped: 1,
            failed: 0,
            errors: vec![],
        };
        a.merge(IngestReport {
            inserted: 2,
            skipped: 0,
            failed: 1,
            errors: vec!["行 6: bad json".to_string()],
        });
        assert_eq!(a.inserted, 5);
        assert_eq!(a.skipped, 1);
        assert_eq!(a.failed, 1);
        assert_eq!(a.errors.len(), 1);
    }
}
