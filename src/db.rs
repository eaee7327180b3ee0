//! 数据库连接和操作
//!
//! 写入规则：
//! - 所有可同步表按 natural key 去重（ON CONFLICT DO NOTHING），重复写入幂等。
//! - Message 插入与所属 Conversation 的聚合更新在同一事务内完成，
//!   并发读取者要么同时看到两者，要么都看不到。
//! - 采集 chunk（含 watermark 推进）整体一个事务，崩溃后重跑从上次 offset 续读。

use crate::config::DbConfig;
use crate::error::Result;
use crate::migrations;
use crate::schema;
use crate::types::{
    Conversation, Device, HistoryEntry, IntegrityReport, LakeStats, Message, MetricSample,
    SourceFileState,
};
#[cfg(feature = "sync")]
use crate::types::{MemoryEvent, SyncLedgerEntry};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// 数据库连接
pub struct LakeDB {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl LakeDB {
    /// 连接本地 SQLite
    pub fn connect(config: DbConfig) -> Result<Self> {
        let path = Path::new(&config.path);

        // 确保目录存在
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL: 单写多读；busy_timeout 容忍并发读进程
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(30))?;

        // 执行数据库迁移（先于 schema，为老数据库添加缺失的列）
        // 注意：如果是新数据库，迁移会跳过（表不存在）
        migrations::run_migrations(&conn)?;

        // 初始化 schema（创建表和索引）
        let fts = cfg!(feature = "fts");
        let full_schema = schema::full_schema(fts);
        conn.execute_batch(&full_schema)?;

        tracing::info!("数据库已连接: {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== Device 操作 ====================

    /// 注册或刷新设备（刷新 last_seen_at；role 为 None 时保留原角色）
    pub fn ensure_device(&self, name: &str, role: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        let now = current_time_ms();

        conn.execute(
            r#"
            INSERT INTO devices (name, role, last_seen_at, created_at, updated_at)
            VALUES (?1, COALESCE(?2, 'secondary'), ?3, ?3, ?3)
            ON CONFLICT(name) DO UPDATE SET
                role = COALESCE(?2, devices.role),
                last_seen_at = excluded.last_seen_at,
                updated_at = excluded.updated_at
            "#,
            params![name, role, now],
        )?;

        Ok(())
    }

    /// 获取单个设备
    pub fn get_device(&self, name: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, role, last_seen_at, last_sync_at, created_at, updated_at FROM devices WHERE name = ?1",
            params![name],
            map_device_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 获取所有设备
    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, role, last_seen_at, last_sync_at, created_at, updated_at FROM devices ORDER BY name",
        )?;

        let rows = stmt.query_map([], map_device_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 记录设备最近一次同步成功时间
    pub fn touch_device_sync(&self, name: &str, timestamp: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE devices SET last_sync_at = ?1, updated_at = ?2 WHERE name = ?3",
            params![timestamp, current_time_ms(), name],
        )?;
        Ok(())
    }

    // ==================== Conversation 操作 ====================

    /// 获取单个会话
    pub fn get_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE session_id = ?1", CONVERSATION_SELECT),
            params![session_id],
            map_conversation_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 列出会话（可按设备过滤）
    pub fn list_conversations(&self, device: Option<&str>, limit: usize) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();

        let (sql, params_vec): (String, Vec<Box<dyn rusqlite::ToSql>>) = if let Some(dev) = device {
            (
                format!(
                    "{} WHERE device = ?1 ORDER BY updated_at DESC LIMIT ?2",
                    CONVERSATION_SELECT
                ),
                vec![
                    Box::new(dev.to_string()) as Box<dyn rusqlite::ToSql>,
                    Box::new(limit as i64),
                ],
            )
        } else {
            (
                format!("{} ORDER BY updated_at DESC LIMIT ?1", CONVERSATION_SELECT),
                vec![Box::new(limit as i64)],
            )
        };

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), map_conversation_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 检查会话是否存在
    pub fn conversation_exists(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 设置会话标签（显示层写入）
    pub fn set_conversation_tags(&self, session_id: &str, tags: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET tags = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![tags, current_time_ms(), session_id],
        )?;
        Ok(())
    }

    /// 设置会话评分（显示层写入）
    pub fn set_conversation_rating(&self, session_id: &str, rating: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET rating = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![rating, current_time_ms(), session_id],
        )?;
        Ok(())
    }

    // ==================== Message 读取 ====================

    /// 获取会话的所有消息（按 sequence 排序）
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE session_id = ?1 ORDER BY sequence ASC",
            MESSAGE_SELECT
        ))?;

        let rows = stmt.query_map(params![session_id], map_message_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 按 uuid 获取消息
    pub fn get_message_by_uuid(&self, uuid: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE uuid = ?1", MESSAGE_SELECT),
            params![uuid],
            map_message_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 解析父消息引用（读取时惰性解析；悬空引用返回 None）
    pub fn resolve_parent(&self, message: &Message) -> Result<Option<Message>> {
        match message.parent_uuid.as_deref() {
            Some(parent) => self.get_message_by_uuid(parent),
            None => Ok(None),
        }
    }

    /// 获取某消息的子消息（sidechain 分叉时可能多条）
    pub fn get_children(&self, parent_uuid: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE parent_uuid = ?1 ORDER BY sequence ASC",
            MESSAGE_SELECT
        ))?;

        let rows = stmt.query_map(params![parent_uuid], map_message_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== History / Metrics / Events 读取 ====================

    /// 获取会话的 history 记录
    pub fn list_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, display, pasted_contents, project, timestamp, device
            FROM history_entries
            WHERE session_id = ?1
            ORDER BY timestamp ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                session_id: row.get(1)?,
                display: row.get(2)?,
                pasted_contents: row.get(3)?,
                project: row.get(4)?,
                timestamp: row.get(5)?,
                device: row.get(6)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 获取某设备时间区间内的内存指标
    pub fn list_metrics(&self, device: &str, since: i64, until: i64) -> Result<Vec<MetricSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, pid, session_id, rss_bytes, rss_mb, rate_mb_min, command, timestamp, device
            FROM memory_metrics
            WHERE device = ?1 AND timestamp >= ?2 AND timestamp <= ?3
            ORDER BY timestamp ASC
            "#,
        )?;

        let rows = stmt.query_map(params![device, since, until], |row| {
            Ok(MetricSample {
                id: row.get(0)?,
                pid: row.get(1)?,
                session_id: row.get(2)?,
                rss_bytes: row.get(3)?,
                rss_mb: row.get(4)?,
                rate_mb_min: row.get(5)?,
                command: row.get(6)?,
                timestamp: row.get(7)?,
                device: row.get(8)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== 采集写入 ====================

    /// 应用一个采集 chunk（一个源文件一个 chunk）
    ///
    /// 会话 upsert、消息插入、聚合更新、history/指标/事件插入、watermark 推进
    /// 全部在同一事务内提交。任何一步失败整个 chunk 回滚，offset 不前进。
    pub fn apply_ingest_chunk(&self, chunk: &IngestChunk) -> Result<ChunkOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut outcome = ChunkOutcome::default();

        for conv in &chunk.conversations {
            tx_upsert_conversation(&tx, conv)?;
        }

        let (inserted, skipped) = tx_apply_messages(&tx, &chunk.messages)?;
        outcome.inserted += inserted;
        outcome.skipped += skipped;

        let (inserted, skipped) = tx_insert_history(&tx, &chunk.history)?;
        outcome.inserted += inserted;
        outcome.skipped += skipped;

        let (inserted, skipped) = tx_insert_metrics(&tx, &chunk.metrics)?;
        outcome.inserted += inserted;
        outcome.skipped += skipped;

        let (inserted, skipped) = tx_insert_events(&tx, &chunk.events)?;
        outcome.inserted += inserted;
        outcome.skipped += skipped;

        if let Some(state) = &chunk.watermark {
            tx_upsert_source_state(&tx, state)?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// 获取源文件的采集进度
    pub fn get_source_state(&self, device: &str, path: &str) -> Result<Option<SourceFileState>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT device, path, source_kind, byte_offset, line_no, file_key, file_size
            FROM source_files
            WHERE device = ?1 AND path = ?2
            "#,
            params![device, path],
            |row| {
                Ok(SourceFileState {
                    device: row.get(0)?,
                    path: row.get(1)?,
                    source_kind: row.get(2)?,
                    byte_offset: row.get::<_, i64>(3)? as u64,
                    line_no: row.get::<_, i64>(4)? as u64,
                    file_key: row.get(5)?,
                    file_size: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ==================== 统计 / 一致性 ====================

    /// 获取统计信息
    pub fn get_stats(&self) -> Result<LakeStats> {
        let conn = self.conn.lock();

        let device_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        let conversation_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        let message_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let history_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM history_entries", [], |row| row.get(0))?;
        let metric_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memory_metrics", [], |row| row.get(0))?;
        let event_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memory_events", [], |row| row.get(0))?;
        let (total_input_tokens, total_output_tokens): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0) FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(LakeStats {
            device_count,
            conversation_count,
            message_count,
            history_count,
            metric_count,
            event_count,
            total_input_tokens,
            total_output_tokens,
        })
    }

    /// 检查会话聚合值与重算值是否一致
    pub fn check_aggregates(&self) -> Result<IntegrityReport> {
        let conn = self.conn.lock();

        let conversations_checked: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT c.session_id FROM conversations c
            WHERE c.total_messages != (SELECT COUNT(*) FROM messages m WHERE m.session_id = c.session_id)
               OR c.total_input_tokens != (SELECT COALESCE(SUM(input_tokens), 0) FROM messages m WHERE m.session_id = c.session_id)
               OR c.total_output_tokens != (SELECT COALESCE(SUM(output_tokens), 0) FROM messages m WHERE m.session_id = c.session_id)
               OR c.total_cache_read_tokens != (SELECT COALESCE(SUM(cache_read_tokens), 0) FROM messages m WHERE m.session_id = c.session_id)
               OR c.total_cache_creation_tokens != (SELECT COALESCE(SUM(cache_creation_tokens), 0) FROM messages m WHERE m.session_id = c.session_id)
            ORDER BY c.session_id
            "#,
        )?;

        let drifted = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(IntegrityReport {
            conversations_checked,
            drifted,
        })
    }

    /// 重算漂移会话的聚合值，返回修复数量
    pub fn repair_aggregates(&self) -> Result<usize> {
        let drifted = self.check_aggregates()?.drifted;
        if drifted.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for session_id in &drifted {
            tx_update_aggregates(&tx, session_id)?;
        }
        tx.commit()?;

        tracing::info!("聚合修复完成: {} 个会话", drifted.len());
        Ok(drifted.len())
    }

    // ==================== 同步写入（primary 端 apply） ====================

    /// 应用同步批次中的会话行（跳过已存在，聚合计数清零，由消息应用重建）
    #[cfg(feature = "sync")]
    pub fn sync_insert_conversations(&self, rows: &[Conversation]) -> Result<(u64, u64)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut inserted = 0u64;
        let mut skipped = 0u64;
        let now = current_time_ms();

        for row in rows {
            tx_warn_device_collision(&tx, &row.session_id, &row.device)?;
            let n = tx.execute(
                r#"
                INSERT INTO conversations (session_id, device, project_path, summary, model, version,
                                           git_branch, tags, rating, source_file, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                ON CONFLICT(session_id) DO NOTHING
                "#,
                params![
                    row.session_id,
                    row.device,
                    row.project_path,
                    row.summary,
                    row.model,
                    row.version,
                    row.git_branch,
                    row.tags,
                    row.rating,
                    row.source_file,
                    now,
                ],
            )?;
            if n > 0 {
                inserted += 1;
            } else {
                skipped += 1;
            }
        }

        tx.commit()?;
        Ok((inserted, skipped))
    }

    /// 应用同步批次中的消息行（natural key 去重 + 聚合同事务重建）
    #[cfg(feature = "sync")]
    pub fn sync_insert_messages(&self, rows: &[Message]) -> Result<(u64, u64)> {
        let inputs: Vec<MessageInput> = rows.iter().map(MessageInput::from_row).collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = tx_apply_messages(&tx, &inputs)?;
        tx.commit()?;
        Ok(result)
    }

    /// 应用同步批次中的 history 行
    #[cfg(feature = "sync")]
    pub fn sync_insert_history(&self, rows: &[HistoryEntry]) -> Result<(u64, u64)> {
        let inputs: Vec<HistoryInput> = rows
            .iter()
            .map(|h| HistoryInput {
                session_id: h.session_id.clone(),
                display: h.display.clone(),
                pasted_contents: h.pasted_contents.clone(),
                project: h.project.clone(),
                timestamp: h.timestamp,
                device: h.device.clone(),
            })
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = tx_insert_history(&tx, &inputs)?;
        tx.commit()?;
        Ok(result)
    }

    /// 应用同步批次中的内存指标行
    #[cfg(feature = "sync")]
    pub fn sync_insert_metrics(&self, rows: &[MetricSample]) -> Result<(u64, u64)> {
        let inputs: Vec<MetricInput> = rows
            .iter()
            .map(|m| MetricInput {
                pid: m.pid,
                session_id: m.session_id.clone(),
                rss_bytes: m.rss_bytes,
                rss_mb: m.rss_mb,
                rate_mb_min: m.rate_mb_min,
                command: m.command.clone(),
                timestamp: m.timestamp,
                device: m.device.clone(),
            })
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = tx_insert_metrics(&tx, &inputs)?;
        tx.commit()?;
        Ok(result)
    }

    /// 应用同步批次中的内存事件行
    #[cfg(feature = "sync")]
    pub fn sync_insert_events(&self, rows: &[MemoryEvent]) -> Result<(u64, u64)> {
        let inputs: Vec<EventInput> = rows
            .iter()
            .map(|e| EventInput {
                event_type: e.event_type.clone(),
                pid: e.pid,
                session_id: e.session_id.clone(),
                severity: e.severity.clone(),
                message: e.message.clone(),
                details: e.details.clone(),
                timestamp: e.timestamp,
                device: e.device.clone(),
            })
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = tx_insert_events(&tx, &inputs)?;
        tx.commit()?;
        Ok(result)
    }

    // ==================== 同步导出（secondary 端） ====================

    /// 导出 watermark 之后本设备的会话行
    #[cfg(feature = "sync")]
    pub fn export_conversations_after(&self, device: &str, after: i64) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE device = ?1 AND id > ?2 ORDER BY id ASC",
            CONVERSATION_SELECT
        ))?;
        let rows = stmt.query_map(params![device, after], map_conversation_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 导出 watermark 之后本设备的消息行
    #[cfg(feature = "sync")]
    pub fn export_messages_after(&self, device: &str, after: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE device = ?1 AND id > ?2 ORDER BY id ASC",
            MESSAGE_SELECT
        ))?;
        let rows = stmt.query_map(params![device, after], map_message_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 导出 watermark 之后本设备的 history 行
    #[cfg(feature = "sync")]
    pub fn export_history_after(&self, device: &str, after: i64) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, display, pasted_contents, project, timestamp, device
            FROM history_entries
            WHERE device = ?1 AND id > ?2
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![device, after], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                session_id: row.get(1)?,
                display: row.get(2)?,
                pasted_contents: row.get(3)?,
                project: row.get(4)?,
                timestamp: row.get(5)?,
                device: row.get(6)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 导出 watermark 之后本设备的内存指标行
    #[cfg(feature = "sync")]
    pub fn export_metrics_after(&self, device: &str, after: i64) -> Result<Vec<MetricSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, pid, session_id, rss_bytes, rss_mb, rate_mb_min, command, timestamp, device
            FROM memory_metrics
            WHERE device = ?1 AND id > ?2
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![device, after], |row| {
            Ok(MetricSample {
                id: row.get(0)?,
                pid: row.get(1)?,
                session_id: row.get(2)?,
                rss_bytes: row.get(3)?,
                rss_mb: row.get(4)?,
                rate_mb_min: row.get(5)?,
                command: row.get(6)?,
                timestamp: row.get(7)?,
                device: row.get(8)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 导出 watermark 之后本设备的内存事件行
    #[cfg(feature = "sync")]
    pub fn export_events_after(&self, device: &str, after: i64) -> Result<Vec<MemoryEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, event_type, pid, session_id, severity, message, details, timestamp, device
            FROM memory_events
            WHERE device = ?1 AND id > ?2
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![device, after], |row| {
            Ok(MemoryEvent {
                id: row.get(0)?,
                event_type: row.get(1)?,
                pid: row.get(2)?,
                session_id: row.get(3)?,
                severity: row.get(4)?,
                message: row.get(5)?,
                details: row.get(6)?,
                timestamp: row.get(7)?,
                device: row.get(8)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== 同步 watermark ====================

    /// 读取某表的同步 watermark（无记录时为 0）
    #[cfg(feature = "sync")]
    pub fn get_sync_watermark(&self, device: &str, table: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let result: Option<i64> = conn
            .query_row(
                "SELECT last_rowid FROM sync_watermarks WHERE device = ?1 AND table_name = ?2",
                params![device, table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result.unwrap_or(0))
    }

    /// 推进某表的同步 watermark（仅在该表确认应用成功后调用）
    #[cfg(feature = "sync")]
    pub fn set_sync_watermark(&self, device: &str, table: &str, last_rowid: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO sync_watermarks (device, table_name, last_rowid, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(device, table_name) DO UPDATE SET
                last_rowid = excluded.last_rowid,
                updated_at = excluded.updated_at
            "#,
            params![device, table, last_rowid, current_time_ms()],
        )?;
        Ok(())
    }

    // ==================== 同步 ledger ====================

    /// 追加一条 ledger 审计行（append-only，写入后不再修改）
    #[cfg(feature = "sync")]
    pub fn append_sync_ledger(&self, entry: &SyncLedgerInput) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO sync_ledger (batch_id, direction, source_device, target_device,
                                     records_sent, records_applied, records_skipped,
                                     status, error, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                entry.batch_id,
                entry.direction,
                entry.source_device,
                entry.target_device,
                entry.records_sent,
                entry.records_applied,
                entry.records_skipped,
                entry.status,
                entry.error,
                entry.started_at,
                entry.finished_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 最近 ledger 行（新到旧）
    #[cfg(feature = "sync")]
    pub fn list_sync_ledger(&self, limit: usize) -> Result<Vec<SyncLedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, batch_id, direction, source_device, target_device,
                   records_sent, records_applied, records_skipped,
                   status, error, started_at, finished_at
            FROM sync_ledger
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(SyncLedgerEntry {
                id: row.get(0)?,
                batch_id: row.get(1)?,
                direction: row.get(2)?,
                source_device: row.get(3)?,
                target_device: row.get(4)?,
                records_sent: row.get(5)?,
                records_applied: row.get(6)?,
                records_skipped: row.get(7)?,
                status: row.get(8)?,
                error: row.get(9)?,
                started_at: row.get(10)?,
                finished_at: row.get(11)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 某设备对最近一次同步成功的完成时间
    #[cfg(feature = "sync")]
    pub fn last_successful_sync(&self, source: &str, target: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let result: Option<Option<i64>> = conn
            .query_row(
                r#"
                SELECT MAX(finished_at) FROM sync_ledger
                WHERE source_device = ?1 AND target_device = ?2 AND status = 'success'
                "#,
                params![source, target],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result.flatten())
    }

    /// 超过 max_age_ms 没有同步成功记录的 secondary 设备
    #[cfg(feature = "sync")]
    pub fn stale_devices(&self, now_ms: i64, max_age_ms: i64) -> Result<Vec<String>> {
        let cutoff = now_ms - max_age_ms;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT d.name FROM devices d
            WHERE d.role = 'secondary'
              AND NOT EXISTS (
                  SELECT 1 FROM sync_ledger l
                  WHERE l.source_device = d.name
                    AND l.status = 'success'
                    AND l.finished_at >= ?1
              )
            ORDER BY d.name
            "#,
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

// ==================== 事务内写入辅助 ====================

/// 会话 upsert：已存在时只做补空更新（COALESCE），device 永不改写
fn tx_upsert_conversation(tx: &Transaction<'_>, input: &ConversationInput) -> Result<()> {
    tx_warn_device_collision(tx, &input.session_id, &input.device)?;

    let now = current_time_ms();
    tx.execute(
        r#"
        INSERT INTO conversations (session_id, device, project_path, summary, model, version,
                                   git_branch, source_file, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        ON CONFLICT(session_id) DO UPDATE SET
            project_path = COALESCE(excluded.project_path, conversations.project_path),
            summary = COALESCE(excluded.summary, conversations.summary),
            model = COALESCE(excluded.model, conversations.model),
            version = COALESCE(excluded.version, conversations.version),
            git_branch = COALESCE(excluded.git_branch, conversations.git_branch),
            source_file = COALESCE(excluded.source_file, conversations.source_file),
            updated_at = excluded.updated_at
        "#,
        params![
            input.session_id,
            input.device,
            input.project_path,
            input.summary,
            input.model,
            input.version,
            input.git_branch,
            input.source_file,
            now,
        ],
    )?;
    Ok(())
}

/// 外部 ID 冲突检查：同一 session_id 出现在不同设备，按上游信任边界只告警不合并
fn tx_warn_device_collision(tx: &Transaction<'_>, session_id: &str, device: &str) -> Result<()> {
    let existing: Option<String> = tx
        .query_row(
            "SELECT device FROM conversations WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(owner) = existing {
        if owner != device {
            tracing::warn!(
                "外部 ID 冲突: 会话 {} 已归属设备 {}，来自设备 {} 的同名会话被跳过",
                session_id,
                owner,
                device
            );
        }
    }
    Ok(())
}

/// 会话占位行：消息先于会话元数据到达时创建（首次看到即创建会话）
fn tx_stub_conversation(tx: &Transaction<'_>, session_id: &str, device: &str) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO conversations (session_id, device, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?3)
        ON CONFLICT(session_id) DO NOTHING
        "#,
        params![session_id, device, current_time_ms()],
    )?;
    Ok(())
}

/// 批量插入消息并重建所属会话聚合（同一事务）
///
/// sequence 为 None 时按会话内 max+1 连续编号；Some 时原样保留（同步应用路径）。
fn tx_apply_messages(tx: &Transaction<'_>, messages: &[MessageInput]) -> Result<(u64, u64)> {
    if messages.is_empty() {
        return Ok((0, 0));
    }

    // 按会话分组，保持文件内到达顺序
    let mut by_session: HashMap<&str, Vec<&MessageInput>> = HashMap::new();
    for msg in messages {
        by_session.entry(&msg.session_id).or_default().push(msg);
    }

    let mut inserted = 0u64;
    let mut skipped = 0u64;

    for (session_id, msgs) in by_session {
        tx_stub_conversation(tx, session_id, &msgs[0].device)?;

        let mut next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), -1) + 1 FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        for msg in msgs {
            let seq = msg.sequence.unwrap_or(next_seq);
            let n = tx.execute(
                r#"
                INSERT INTO messages (session_id, uuid, parent_uuid, type, role, model,
                                      content_text, content_thinking, word_count, image_count,
                                      tool_use_count, tool_result_count, is_sidechain, cwd,
                                      git_branch, input_tokens, output_tokens, cache_read_tokens,
                                      cache_creation_tokens, stop_reason, request_id,
                                      timestamp, sequence, device)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                        ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
                ON CONFLICT(uuid) DO NOTHING
                "#,
                params![
                    msg.session_id,
                    msg.uuid,
                    msg.parent_uuid,
                    msg.r#type,
                    msg.role,
                    msg.model,
                    msg.content_text,
                    msg.content_thinking,
                    msg.word_count,
                    msg.image_count,
                    msg.tool_use_count,
                    msg.tool_result_count,
                    msg.is_sidechain as i64,
                    msg.cwd,
                    msg.git_branch,
                    msg.input_tokens,
                    msg.output_tokens,
                    msg.cache_read_tokens,
                    msg.cache_creation_tokens,
                    msg.stop_reason,
                    msg.request_id,
                    msg.timestamp,
                    seq,
                    msg.device,
                ],
            )?;

            if n > 0 {
                inserted += 1;
                if msg.sequence.is_none() {
                    next_seq += 1;
                }
            } else {
                skipped += 1;
            }
        }

        // 聚合与消息同事务更新，读取者不会看到半新状态
        tx_update_aggregates(tx, session_id)?;
    }

    Ok((inserted, skipped))
}

/// 按消息重算会话聚合（计数、token 合计、起止时间）
fn tx_update_aggregates(tx: &Transaction<'_>, session_id: &str) -> Result<()> {
    tx.execute(
        r#"
        UPDATE conversations SET
            total_messages = (SELECT COUNT(*) FROM messages WHERE session_id = ?1),
            user_messages = (SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND type = 'user'),
            assistant_messages = (SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND type = 'assistant'),
            total_input_tokens = (SELECT COALESCE(SUM(input_tokens), 0) FROM messages WHERE session_id = ?1),
            total_output_tokens = (SELECT COALESCE(SUM(output_tokens), 0) FROM messages WHERE session_id = ?1),
            total_cache_read_tokens = (SELECT COALESCE(SUM(cache_read_tokens), 0) FROM messages WHERE session_id = ?1),
            total_cache_creation_tokens = (SELECT COALESCE(SUM(cache_creation_tokens), 0) FROM messages WHERE session_id = ?1),
            started_at = (SELECT MIN(timestamp) FROM messages WHERE session_id = ?1),
            ended_at = (SELECT MAX(timestamp) FROM messages WHERE session_id = ?1),
            updated_at = ?2
        WHERE session_id = ?1
        "#,
        params![session_id, current_time_ms()],
    )?;
    Ok(())
}

fn tx_insert_history(tx: &Transaction<'_>, rows: &[HistoryInput]) -> Result<(u64, u64)> {
    let mut inserted = 0u64;
    let mut skipped = 0u64;

    for row in rows {
        let n = tx.execute(
            r#"
            INSERT INTO history_entries (session_id, display, pasted_contents, project, timestamp, device)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(session_id, timestamp) DO NOTHING
            "#,
            params![
                row.session_id,
                row.display,
                row.pasted_contents,
                row.project,
                row.timestamp,
                row.device,
            ],
        )?;
        if n > 0 {
            inserted += 1;
        } else {
            skipped += 1;
        }
    }

    Ok((inserted, skipped))
}

fn tx_insert_metrics(tx: &Transaction<'_>, rows: &[MetricInput]) -> Result<(u64, u64)> {
    let mut inserted = 0u64;
    let mut skipped = 0u64;

    for row in rows {
        let n = tx.execute(
            r#"
            INSERT INTO memory_metrics (pid, session_id, rss_bytes, rss_mb, rate_mb_min, command, timestamp, device)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(device, pid, timestamp) DO NOTHING
            "#,
            params![
                row.pid,
                row.session_id,
                row.rss_bytes,
                row.rss_mb,
                row.rate_mb_min,
                row.command,
                row.timestamp,
                row.device,
            ],
        )?;
        if n > 0 {
            inserted += 1;
        } else {
            skipped += 1;
        }
    }

    Ok((inserted, skipped))
}

fn tx_insert_events(tx: &Transaction<'_>, rows: &[EventInput]) -> Result<(u64, u64)> {
    let mut inserted = 0u64;
    let mut skipped = 0u64;

    for row in rows {
        let n = tx.execute(
            r#"
            INSERT INTO memory_events (event_type, pid, session_id, severity, message, details, timestamp, device)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(device, timestamp, event_type, pid) DO NOTHING
            "#,
            params![
                row.event_type,
                row.pid,
                row.session_id,
                row.severity,
                row.message,
                row.details,
                row.timestamp,
                row.device,
            ],
        )?;
        if n > 0 {
            inserted += 1;
        } else {
            skipped += 1;
        }
    }

    Ok((inserted, skipped))
}

fn tx_upsert_source_state(tx: &Transaction<'_>, state: &SourceFileState) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO source_files (device, path, source_kind, byte_offset, line_no, file_key, file_size, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(device, path) DO UPDATE SET
            source_kind = excluded.source_kind,
            byte_offset = excluded.byte_offset,
            line_no = excluded.line_no,
            file_key = excluded.file_key,
            file_size = excluded.file_size,
            updated_at = excluded.updated_at
        "#,
        params![
            state.device,
            state.path,
            state.source_kind,
            state.byte_offset as i64,
            state.line_no as i64,
            state.file_key,
            state.file_size.map(|v| v as i64),
            current_time_ms(),
        ],
    )?;
    Ok(())
}

// ==================== 行映射 ====================

const CONVERSATION_SELECT: &str = r#"
SELECT id, session_id, device, project_path, summary, model, version, git_branch,
       total_messages, user_messages, assistant_messages,
       total_input_tokens, total_output_tokens, total_cache_read_tokens, total_cache_creation_tokens,
       started_at, ended_at, tags, rating, source_file, created_at, updated_at
FROM conversations
"#;

const MESSAGE_SELECT: &str = r#"
SELECT id, session_id, uuid, parent_uuid, type, role, model,
       content_text, content_thinking, word_count, image_count,
       tool_use_count, tool_result_count, is_sidechain, cwd, git_branch,
       input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
       stop_reason, request_id, timestamp, sequence, device
FROM messages
"#;

fn map_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        device: row.get(2)?,
        project_path: row.get(3)?,
        summary: row.get(4)?,
        model: row.get(5)?,
        version: row.get(6)?,
        git_branch: row.get(7)?,
        total_messages: row.get(8)?,
        user_messages: row.get(9)?,
        assistant_messages: row.get(10)?,
        total_input_tokens: row.get(11)?,
        total_output_tokens: row.get(12)?,
        total_cache_read_tokens: row.get(13)?,
        total_cache_creation_tokens: row.get(14)?,
        started_at: row.get(15)?,
        ended_at: row.get(16)?,
        tags: row.get(17)?,
        rating: row.get(18)?,
        source_file: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let is_sidechain: i64 = row.get(13)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        uuid: row.get(2)?,
        parent_uuid: row.get(3)?,
        r#type: row.get(4)?,
        role: row.get(5)?,
        model: row.get(6)?,
        content_text: row.get(7)?,
        content_thinking: row.get(8)?,
        word_count: row.get(9)?,
        image_count: row.get(10)?,
        tool_use_count: row.get(11)?,
        tool_result_count: row.get(12)?,
        is_sidechain: is_sidechain != 0,
        cwd: row.get(14)?,
        git_branch: row.get(15)?,
        input_tokens: row.get(16)?,
        output_tokens: row.get(17)?,
        cache_read_tokens: row.get(18)?,
        cache_creation_tokens: row.get(19)?,
        stop_reason: row.get(20)?,
        request_id: row.get(21)?,
        timestamp: row.get(22)?,
        sequence: row.get(23)?,
        device: row.get(24)?,
    })
}

fn map_device_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        last_seen_at: row.get(3)?,
        last_sync_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

// ==================== 写入输入类型 ====================

/// 会话输入 (写入用)
#[derive(Debug, Clone, Default)]
pub struct ConversationInput {
    pub session_id: String,
    pub device: String,
    pub project_path: Option<String>,
    pub summary: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub git_branch: Option<String>,
    pub source_file: Option<String>,
}

/// 消息输入 (写入用)
#[derive(Debug, Clone)]
pub struct MessageInput {
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
    /// None = 采集路径按会话内 max+1 编号；Some = 同步应用保留原编号
    pub sequence: Option<i64>,
    pub device: String,
}

impl MessageInput {
    /// 从已存储的消息行构造（同步应用路径，保留 sequence）
    pub fn from_row(m: &Message) -> Self {
        Self {
            session_id: m.session_id.clone(),
            uuid: m.uuid.clone(),
            parent_uuid: m.parent_uuid.clone(),
            r#type: m.r#type.clone(),
            role: m.role.clone(),
            model: m.model.clone(),
            content_text: m.content_text.clone(),
            content_thinking: m.content_thinking.clone(),
            word_count: m.word_count,
            image_count: m.image_count,
            tool_use_count: m.tool_use_count,
            tool_result_count: m.tool_result_count,
            is_sidechain: m.is_sidechain,
            cwd: m.cwd.clone(),
            git_branch: m.git_branch.clone(),
            input_tokens: m.input_tokens,
            output_tokens: m.output_tokens,
            cache_read_tokens: m.cache_read_tokens,
            cache_creation_tokens: m.cache_creation_tokens,
            stop_reason: m.stop_reason.clone(),
            request_id: m.request_id.clone(),
            timestamp: m.timestamp,
            sequence: Some(m.sequence),
            device: m.device.clone(),
        }
    }
}

/// History 输入 (写入用)
#[derive(Debug, Clone)]
pub struct HistoryInput {
    pub session_id: String,
    pub display: String,
    pub pasted_contents: Option<String>,
    pub project: Option<String>,
    pub timestamp: i64,
    pub device: String,
}

/// 内存指标输入 (写入用)
#[derive(Debug, Clone)]
pub struct MetricInput {
    pub pid: i64,
    pub session_id: Option<String>,
    pub rss_bytes: i64,
    pub rss_mb: Option<f64>,
    pub rate_mb_min: Option<f64>,
    pub command: Option<String>,
    pub timestamp: i64,
    pub device: String,
}

/// 内存事件输入 (写入用)
#[derive(Debug, Clone)]
pub struct EventInput {
    pub event_type: String,
    pub pid: i64,
    pub session_id: Option<String>,
    pub severity: String,
    pub message: Option<String>,
    pub details: Option<String>,
    pub timestamp: i64,
    pub device: String,
}

/// 采集 chunk（一个源文件的本次新增内容，整体一个事务）
#[derive(Debug, Clone, Default)]
pub struct IngestChunk {
    pub conversations: Vec<ConversationInput>,
    pub messages: Vec<MessageInput>,
    pub history: Vec<HistoryInput>,
    pub metrics: Vec<MetricInput>,
    pub events: Vec<EventInput>,
    /// chunk 提交时一并推进的源文件进度
    pub watermark: Option<SourceFileState>,
}

impl IngestChunk {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
            && self.messages.is_empty()
            && self.history.is_empty()
            && self.metrics.is_empty()
            && self.events.is_empty()
    }
}

/// chunk 应用结果
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

/// 同步 ledger 输入 (写入用)
#[cfg(feature = "sync")]
#[derive(Debug, Clone)]
pub struct SyncLedgerInput {
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

/// 获取当前时间戳 (毫秒)
pub(crate) fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
