//! 记录规范化
//!
//! 把各源的原始 JSONL 行转成类型化的写入输入：
//! - 会话行按 type 分流：summary 附着到会话，user/assistant 成为消息回合，
//!   其余类型（system、快照等）静默跳过
//! - history 行转命令历史
//! - 内存监控的指标/事件行转采样与事件
//!
//! 格式错误是记录级的：单行解析失败返回带行号的 MalformedRecord，
//! 调用方计入 failed 后继续处理后续行。缺少 timestamp 的回合一律算格式错误，
//! 时间线类数据没有时间戳无法定位。

use crate::db::{ConversationInput, EventInput, HistoryInput, MessageInput, MetricInput};
use crate::error::{Error, Result};
use crate::jsonl::RawLine;
use serde::Deserialize;
use serde_json::Value;

/// 会话行规范化结果
#[derive(Debug, Clone)]
pub enum SessionRecord {
    /// summary 行，附着到所在文件的会话
    Summary { summary: String },
    /// user/assistant 回合
    Turn {
        conversation: ConversationInput,
        message: MessageInput,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSessionLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    summary: Option<String>,
    uuid: Option<String>,
    parent_uuid: Option<String>,
    session_id: Option<String>,
    timestamp: Option<Value>,
    is_sidechain: Option<bool>,
    cwd: Option<String>,
    git_branch: Option<String>,
    version: Option<String>,
    request_id: Option<String>,
    message: Option<RawMessage>,
}

/// 内层 message 对象是 API 载荷，字段是 snake_case
#[derive(Debug, Deserialize)]
struct RawMessage {
    role: Option<String>,
    model: Option<String>,
    content: Option<Value>,
    stop_reason: Option<String>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize, Default)]
struct RawUsage {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cache_read_input_tokens: Option<i64>,
    cache_creation_input_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHistoryLine {
    display: Option<String>,
    pasted_contents: Option<Value>,
    project: Option<String>,
    session_id: Option<String>,
    timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawMetricLine {
    timestamp: Option<Value>,
    pid: Option<i64>,
    session_id: Option<String>,
    rss_bytes: Option<i64>,
    rss_mb: Option<f64>,
    rate_mb_min: Option<f64>,
    command: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEventLine {
    timestamp: Option<Value>,
    #[serde(rename = "type", alias = "event_type")]
    event_type: Option<String>,
    pid: Option<i64>,
    session_id: Option<String>,
    severity: Option<String>,
    message: Option<String>,
    details: Option<Value>,
}

/// 规范化一条会话日志行
///
/// 返回 `Ok(None)` 表示已知但不入库的记录类型（如 system）。
/// `session_hint` 是文件名里的会话 ID，记录缺少 sessionId 时回退使用。
pub fn normalize_session_line(
    line: &RawLine,
    device: &str,
    session_hint: Option<&str>,
    project_path: Option<&str>,
    source_file: &str,
) -> Result<Option<SessionRecord>> {
    let raw: RawSessionLine = serde_json::from_str(&line.text)
        .map_err(|e| Error::malformed(line.line_no, format!("JSON 解析失败: {}", e)))?;

    let kind = raw
        .kind
        .clone()
        .ok_or_else(|| Error::malformed(line.line_no, "缺少 type 字段"))?;

    match kind.as_str() {
        "summary" => {
            let summary = raw
                .summary
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| Error::malformed(line.line_no, "summary 行缺少 summary 字段"))?;
            Ok(Some(SessionRecord::Summary { summary }))
        }
        "user" | "assistant" => {
            let turn = build_turn(raw, &kind, line.line_no, device, session_hint, project_path, source_file)?;
            Ok(Some(turn))
        }
        other => {
            tracing::trace!("跳过不入库的记录类型: {} (行 {})", other, line.line_no);
            Ok(None)
        }
    }
}

fn build_turn(
    raw: RawSessionLine,
    kind: &str,
    line_no: u64,
    device: &str,
    session_hint: Option<&str>,
    project_path: Option<&str>,
    source_file: &str,
) -> Result<SessionRecord> {
    let uuid = raw
        .uuid
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::malformed(line_no, "缺少 uuid"))?;

    let session_id = raw
        .session_id
        .filter(|s| !s.is_empty())
        .or_else(|| session_hint.map(|s| s.to_string()))
        .ok_or_else(|| Error::malformed(line_no, "缺少 sessionId"))?;

    let timestamp = raw
        .timestamp
        .as_ref()
        .and_then(timestamp_ms)
        .ok_or_else(|| Error::malformed(line_no, "缺少或无效 timestamp"))?;

    let msg = raw.message.unwrap_or(RawMessage {
        role: None,
        model: None,
        content: None,
        stop_reason: None,
        usage: None,
    });
    let usage = msg.usage.unwrap_or_default();
    let parts = extract_content(msg.content.as_ref());

    // agent-xxx 文件里的会话是 sidechain，即使记录没带 isSidechain
    let is_sidechain = raw.is_sidechain.unwrap_or_else(|| {
        session_hint
            .map(|h| h.starts_with("agent-"))
            .unwrap_or(false)
    });

    let conversation = ConversationInput {
        session_id: session_id.clone(),
        device: device.to_string(),
        project_path: raw
            .cwd
            .clone()
            .or_else(|| project_path.map(|p| p.to_string())),
        summary: None,
        model: msg.model.clone(),
        version: raw.version,
        git_branch: raw.git_branch.clone(),
        source_file: Some(source_file.to_string()),
    };

    let word_count = parts.text.split_whitespace().count() as i64;
    let message = MessageInput {
        session_id,
        uuid,
        parent_uuid: raw.parent_uuid.filter(|s| !s.is_empty()),
        r#type: kind.to_string(),
        role: msg.role.or_else(|| Some(kind.to_string())),
        model: msg.model,
        content_text: parts.text,
        content_thinking: parts.thinking,
        word_count,
        image_count: parts.images,
        tool_use_count: parts.tool_uses,
        tool_result_count: parts.tool_results,
        is_sidechain,
        cwd: raw.cwd,
        git_branch: raw.git_branch,
        input_tokens: usage.input_tokens.unwrap_or(0),
        output_tokens: usage.output_tokens.unwrap_or(0),
        cache_read_tokens: usage.cache_read_input_tokens.unwrap_or(0),
        cache_creation_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
        stop_reason: msg.stop_reason,
        request_id: raw.request_id,
        timestamp,
        sequence: None,
        device: device.to_string(),
    };

    Ok(SessionRecord::Turn {
        conversation,
        message,
    })
}

/// 规范化一条命令历史行
pub fn normalize_history_line(line: &RawLine, device: &str) -> Result<HistoryInput> {
    let raw: RawHistoryLine = serde_json::from_str(&line.text)
        .map_err(|e| Error::malformed(line.line_no, format!("JSON 解析失败: {}", e)))?;

    let display = raw
        .display
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::malformed(line.line_no, "缺少 display"))?;

    let timestamp = raw
        .timestamp
        .as_ref()
        .and_then(timestamp_ms)
        .ok_or_else(|| Error::malformed(line.line_no, "缺少或无效 timestamp"))?;

    let pasted_contents = match raw.pasted_contents {
        Some(Value::Null) | None => None,
        Some(v) => Some(serde_json::to_string(&v)?),
    };

    Ok(HistoryInput {
        session_id: raw.session_id.unwrap_or_default(),
        display,
        pasted_contents,
        project: raw.project,
        timestamp,
        device: device.to_string(),
    })
}

/// 规范化一条内存指标行
pub fn normalize_metric_line(line: &RawLine, device: &str) -> Result<MetricInput> {
    let raw: RawMetricLine = serde_json::from_str(&line.text)
        .map_err(|e| Error::malformed(line.line_no, format!("JSON 解析失败: {}", e)))?;

    let pid = raw
        .pid
        .ok_or_else(|| Error::malformed(line.line_no, "缺少 pid"))?;

    let timestamp = raw
        .timestamp
        .as_ref()
        .and_then(epoch_to_ms)
        .ok_or_else(|| Error::malformed(line.line_no, "缺少或无效 timestamp"))?;

    // rss_bytes 和 rss_mb 至少要有一个
    let rss_bytes = match (raw.rss_bytes, raw.rss_mb) {
        (Some(b), _) => b,
        (None, Some(mb)) => (mb * 1024.0 * 1024.0) as i64,
        (None, None) => return Err(Error::malformed(line.line_no, "缺少 rss_bytes/rss_mb")),
    };

    Ok(MetricInput {
        pid,
        session_id: raw.session_id,
        rss_bytes,
        rss_mb: raw.rss_mb.or(Some(rss_bytes as f64 / 1024.0 / 1024.0)),
        rate_mb_min: raw.rate_mb_min,
        command: raw.command,
        timestamp,
        device: device.to_string(),
    })
}

/// 规范化一条内存事件行
pub fn normalize_event_line(line: &RawLine, device: &str) -> Result<EventInput> {
    let raw: RawEventLine = serde_json::from_str(&line.text)
        .map_err(|e| Error::malformed(line.line_no, format!("JSON 解析失败: {}", e)))?;

    let event_type = raw
        .event_type
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::malformed(line.line_no, "缺少 type"))?;

    let timestamp = raw
        .timestamp
        .as_ref()
        .and_then(epoch_to_ms)
        .ok_or_else(|| Error::malformed(line.line_no, "缺少或无效 timestamp"))?;

    let details = match raw.details {
        Some(Value::Null) | None => None,
        Some(v) => Some(serde_json::to_string(&v)?),
    };

    Ok(EventInput {
        event_type,
        pid: raw.pid.unwrap_or(0),
        session_id: raw.session_id,
        severity: raw.severity.unwrap_or_else(|| "info".to_string()),
        message: raw.message,
        details,
        timestamp,
        device: device.to_string(),
    })
}

// ==================== 字段提取辅助 ====================

#[derive(Debug, Default)]
struct ContentParts {
    text: String,
    thinking: String,
    images: i64,
    tool_uses: i64,
    tool_results: i64,
}

/// 提取 content 字段：字符串直接用，block 数组按类型拆分
fn extract_content(content: Option<&Value>) -> ContentParts {
    let mut parts = ContentParts::default();

    match content {
        Some(Value::String(s)) => {
            parts.text = s.clone();
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
                match block_type {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            if !parts.text.is_empty() {
                                parts.text.push('\n');
                            }
                            parts.text.push_str(text);
                        }
                    }
                    "thinking" => {
                        if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                            if !parts.thinking.is_empty() {
                                parts.thinking.push('\n');
                            }
                            parts.thinking.push_str(text);
                        }
                    }
                    "image" => parts.images += 1,
                    "tool_use" => parts.tool_uses += 1,
                    "tool_result" => parts.tool_results += 1,
                    _ => {}
                }
            }
        }
        _ => {}
    }

    parts
}

/// 解析时间戳为毫秒：RFC3339 字符串或毫秒数字
fn timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            s.parse::<i64>().ok()
        }
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

/// 监控源的 epoch 时间戳转毫秒（1e12 以下按秒处理）
fn epoch_to_ms(value: &Value) -> Option<i64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    if raw >= 1e12 {
        Some(raw as i64)
    } else {
        Some((raw * 1000.0) as i64)
    }
}
