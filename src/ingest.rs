//! 采集引擎 - 扫描源文件并增量写入数据湖
//!
//! 每个源文件一个 chunk：从上次 byte offset 续读、规范化、
//! 连同 offset 推进在一个事务里提交。单行格式错误计入 failed 后继续，
//! 单个源文件不可用告警后跳过，都不会中断整轮采集。

use crate::config::SourceConfig;
use crate::db::{ConversationInput, IngestChunk, LakeDB};
use crate::error::{Error, Result};
use crate::jsonl;
use crate::normalizer::{self, SessionRecord};
use crate::sources::{self, SourceFile, SourceKind};
use crate::types::{IngestReport, SourceFileState};
use std::collections::HashMap;
use std::path::Path;

/// 采集引擎
///
/// 持有设备名，写入的每一行都归属该设备。
pub struct IngestEngine<'a> {
    db: &'a LakeDB,
    device: String,
}

impl<'a> IngestEngine<'a> {
    /// 创建采集引擎
    pub fn new(db: &'a LakeDB, device: impl Into<String>) -> Self {
        Self {
            db,
            device: device.into(),
        }
    }

    /// 扫描配置目录下的全部源并采集
    ///
    /// 单个源失败只记入报告的 errors，继续处理其余源。
    pub fn ingest_all(&self, config: &SourceConfig) -> Result<IngestReport> {
        self.db.ensure_device(&self.device, None)?;

        let mut report = IngestReport::default();
        let sources = sources::discover(config)?;
        tracing::debug!("发现 {} 个源文件", sources.len());

        for source in &sources {
            match self.ingest_file(source) {
                Ok(file_report) => report.merge(file_report),
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    // 发现和读取之间文件被删除
                    tracing::warn!("源文件已消失，跳过: {:?}", source.path);
                }
                Err(Error::Io(e)) => {
                    let err = Error::SourceUnavailable {
                        path: source.path.to_string_lossy().to_string(),
                        reason: e.to_string(),
                    };
                    tracing::warn!("{}", err);
                    report.errors.push(err.to_string());
                }
                Err(e) => {
                    let msg = format!("{:?}: {}", source.path, e);
                    tracing::warn!("源采集失败: {}", msg);
                    report.errors.push(msg);
                }
            }
        }

        if report.inserted > 0 || report.failed > 0 {
            tracing::info!(
                "采集完成: {} 新增, {} 重复跳过, {} 格式错误",
                report.inserted,
                report.skipped,
                report.failed
            );
        }

        Ok(report)
    }

    /// 采集指定路径的单个源文件（按文件名推断源类型）
    pub fn ingest_path(&self, path: &Path) -> Result<IngestReport> {
        self.db.ensure_device(&self.device, None)?;
        self.ingest_file(&classify_path(path))
    }

    /// 采集单个源文件
    pub fn ingest_file(&self, source: &SourceFile) -> Result<IngestReport> {
        let path_str = source.path.to_string_lossy().to_string();
        let state = self.db.get_source_state(&self.device, &path_str)?;

        let chunk = jsonl::read_incremental(&source.path, state.as_ref())?;
        if chunk.lines.is_empty() && !chunk.advanced(state.as_ref()) {
            return Ok(IngestReport::default());
        }

        let mut report = IngestReport::default();
        let mut staged = IngestChunk::default();

        match source.kind {
            SourceKind::Session => {
                self.stage_session_lines(source, &chunk.lines, &mut staged, &mut report)
            }
            SourceKind::History => {
                for line in &chunk.lines {
                    match normalizer::normalize_history_line(line, &self.device) {
                        Ok(entry) => staged.history.push(entry),
                        Err(e) => record_failure(&mut report, &path_str, e),
                    }
                }
            }
            SourceKind::Metrics => {
                for line in &chunk.lines {
                    match normalizer::normalize_metric_line(line, &self.device) {
                        Ok(sample) => staged.metrics.push(sample),
                        Err(e) => record_failure(&mut report, &path_str, e),
                    }
                }
            }
            SourceKind::Events => {
                for line in &chunk.lines {
                    match normalizer::normalize_event_line(line, &self.device) {
                        Ok(event) => staged.events.push(event),
                        Err(e) => record_failure(&mut report, &path_str, e),
                    }
                }
            }
        }

        staged.watermark = Some(SourceFileState {
            device: self.device.clone(),
            path: path_str.clone(),
            source_kind: source.kind.as_str().to_string(),
            byte_offset: chunk.next_offset,
            line_no: chunk.next_line_no,
            file_key: chunk.file_key,
            file_size: Some(chunk.file_size),
        });

        let outcome = self.db.apply_ingest_chunk(&staged)?;
        report.inserted += outcome.inserted;
        report.skipped += outcome.skipped;

        if report.inserted > 0 || report.failed > 0 {
            tracing::debug!(
                "{:?}: {} 新增, {} 跳过, {} 错误",
                source.path,
                report.inserted,
                report.skipped,
                report.failed
            );
        }

        Ok(report)
    }

    /// 规范化会话日志行并归并到 chunk
    ///
    /// 会话元数据按 session 合并为一条 upsert。summary 行可能先于任何回合
    /// 出现（续接会话的文件头），先挂到文件名推断的会话上，没有就先缓存。
    fn stage_session_lines(
        &self,
        source: &SourceFile,
        lines: &[jsonl::RawLine],
        staged: &mut IngestChunk,
        report: &mut IngestReport,
    ) {
        let path_str = source.path.to_string_lossy().to_string();
        let mut conversations: HashMap<String, ConversationInput> = HashMap::new();
        let mut primary_session: Option<String> = source.session_hint.clone();
        let mut pending_summaries: Vec<String> = Vec::new();

        for line in lines {
            let record = match normalizer::normalize_session_line(
                line,
                &self.device,
                source.session_hint.as_deref(),
                source.project_path.as_deref(),
                &path_str,
            ) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    record_failure(report, &path_str, e);
                    continue;
                }
            };

            match record {
                SessionRecord::Summary { summary } => match &primary_session {
                    Some(session_id) => {
                        attach_summary(&mut conversations, session_id, &self.device, summary)
                    }
                    None => pending_summaries.push(summary),
                },
                SessionRecord::Turn {
                    conversation,
                    message,
                } => {
                    if primary_session.is_none() {
                        primary_session = Some(conversation.session_id.clone());
                    }
                    merge_conversation(&mut conversations, conversation);
                    staged.messages.push(message);
                }
            }
        }

        if let Some(session_id) = &primary_session {
            for summary in pending_summaries {
                attach_summary(&mut conversations, session_id, &self.device, summary);
            }
        }

        staged.conversations.extend(conversations.into_values());
    }
}

/// 记录单行失败：计数并保留带行号的错误描述
fn record_failure(report: &mut IngestReport, path: &str, error: Error) {
    tracing::warn!("记录规范化失败 {}: {}", path, error);
    report.failed += 1;
    report.errors.push(format!("{}: {}", path, error));
}

/// 合并同一会话的元数据：后到的非空字段补上先前的空缺
fn merge_conversation(map: &mut HashMap<String, ConversationInput>, incoming: ConversationInput) {
    match map.get_mut(&incoming.session_id) {
        Some(existing) => {
            if existing.project_path.is_none() {
                existing.project_path = incoming.project_path;
            }
            if existing.summary.is_none() {
                existing.summary = incoming.summary;
            }
            if existing.model.is_none() {
                existing.model = incoming.model;
            }
            if existing.version.is_none() {
                existing.version = incoming.version;
            }
            if existing.git_branch.is_none() {
                existing.git_branch = incoming.git_branch;
            }
            if existing.source_file.is_none() {
                existing.source_file = incoming.source_file;
            }
        }
        None => {
            map.insert(incoming.session_id.clone(), incoming);
        }
    }
}

/// 把 summary 挂到会话的元数据上（后出现的 summary 覆盖先前的）
fn attach_summary(
    map: &mut HashMap<String, ConversationInput>,
    session_id: &str,
    device: &str,
    summary: String,
) {
    let entry = map
        .entry(session_id.to_string())
        .or_insert_with(|| ConversationInput {
            session_id: session_id.to_string(),
            device: device.to_string(),
            ..Default::default()
        });
    entry.summary = Some(summary);
}

/// 按路径推断源类型
///
/// history.jsonl / metrics.jsonl / events.jsonl 按名字识别，其余按会话日志处理。
fn classify_path(path: &Path) -> SourceFile {
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");

    let kind = match file_name {
        "history.jsonl" => SourceKind::History,
        "metrics.jsonl" => SourceKind::Metrics,
        "events.jsonl" => SourceKind::Events,
        _ => SourceKind::Session,
    };

    let (project_path, session_hint) = if kind == SourceKind::Session {
        let project = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .map(sources::decode_project_path);
        let hint = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string());
        (project, hint)
    } else {
        (None, None)
    };

    SourceFile {
        path: path.to_path_buf(),
        kind,
        project_path,
        session_hint,
    }
}
