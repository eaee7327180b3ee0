//! 跨设备同步
//!
//! push-only：secondary 按表级 rowid watermark 导出本设备新增行，
//! 打包成 SyncBatch 推给 primary。primary 按固定表顺序（先父后子）
//! skip-if-present 应用，返回逐表结果。
//!
//! watermark 只在对应表确认应用成功后推进，部分失败时失败表之后的
//! watermark 原地不动，下次 push 重发，靠 natural key 去重保证幂等。
//! 两端各写一条 ledger 审计行，任何结局都写。

use crate::db::{current_time_ms, LakeDB, SyncLedgerInput};
use crate::error::{Error, Result};
use crate::types::{Conversation, HistoryEntry, MemoryEvent, Message, MetricSample, SyncStatus};
use serde::{Deserialize, Serialize};

/// 批次格式版本，不一致的批次拒绝应用
pub const FORMAT_VERSION: u32 = 1;

/// 同步表及应用顺序（conversations 在 messages 前，满足外键）
pub const SYNC_TABLES: [&str; 5] = [
    "conversations",
    "messages",
    "history_entries",
    "memory_metrics",
    "memory_events",
];

/// 一次推送的数据包
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    /// 批次格式版本
    pub format_version: u32,
    /// 批次唯一 ID，两端 ledger 用它对账
    pub batch_id: String,
    pub source_device: String,
    pub target_device: String,
    /// 打包时间 (毫秒)
    pub created_at: i64,
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    pub history: Vec<HistoryEntry>,
    pub metrics: Vec<MetricSample>,
    pub events: Vec<MemoryEvent>,
}

impl SyncBatch {
    pub fn total_records(&self) -> u64 {
        (self.conversations.len()
            + self.messages.len()
            + self.history.len()
            + self.metrics.len()
            + self.events.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }
}

/// 单表应用结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOutcome {
    pub table: String,
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// primary 端应用报告（经传输层原样带回 secondary）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub batch_id: String,
    pub status: SyncStatus,
    pub tables: Vec<TableOutcome>,
}

impl ApplyReport {
    pub fn total_applied(&self) -> u64 {
        self.tables.iter().map(|t| t.applied).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.tables.iter().map(|t| t.skipped).sum()
    }
}

/// 一次 push 的最终结果（secondary 端视角）
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub batch_id: String,
    pub status: SyncStatus,
    pub records_sent: u64,
    pub records_applied: u64,
    pub records_skipped: u64,
    pub error: Option<String>,
}

/// 传输层：把批次送到 primary 并取回应用报告
///
/// 传输失败返回 Transport 错误，secondary 不推进任何 watermark。
pub trait SyncTransport {
    fn deliver(&self, batch: &SyncBatch) -> Result<ApplyReport>;
}

/// 同步引擎
///
/// secondary 端用 push，primary 端用 apply。device 是本机设备名。
pub struct SyncEngine<'a> {
    db: &'a LakeDB,
    device: String,
}

/// 导出时记下的单表游标，应用成功后写回 watermark
struct TableCursor {
    table: &'static str,
    new_watermark: i64,
}

impl<'a> SyncEngine<'a> {
    pub fn new(db: &'a LakeDB, device: impl Into<String>) -> Self {
        Self {
            db,
            device: device.into(),
        }
    }

    /// 导出本设备 watermark 之后的新增行
    pub fn export_batch(&self, target_device: &str) -> Result<SyncBatch> {
        Ok(self.export_batch_with_cursors(target_device)?.0)
    }

    fn export_batch_with_cursors(
        &self,
        target_device: &str,
    ) -> Result<(SyncBatch, Vec<TableCursor>)> {
        let mut cursors = Vec::new();

        let wm = self.db.get_sync_watermark(&self.device, "conversations")?;
        let conversations = self.db.export_conversations_after(&self.device, wm)?;
        cursors.push(TableCursor {
            table: "conversations",
            new_watermark: conversations.last().map(|r| r.id).unwrap_or(wm),
        });

        let wm = self.db.get_sync_watermark(&self.device, "messages")?;
        let messages = self.db.export_messages_after(&self.device, wm)?;
        cursors.push(TableCursor {
            table: "messages",
            new_watermark: messages.last().map(|r| r.id).unwrap_or(wm),
        });

        let wm = self.db.get_sync_watermark(&self.device, "history_entries")?;
        let history = self.db.export_history_after(&self.device, wm)?;
        cursors.push(TableCursor {
            table: "history_entries",
            new_watermark: history.last().map(|r| r.id).unwrap_or(wm),
        });

        let wm = self.db.get_sync_watermark(&self.device, "memory_metrics")?;
        let metrics = self.db.export_metrics_after(&self.device, wm)?;
        cursors.push(TableCursor {
            table: "memory_metrics",
            new_watermark: metrics.last().map(|r| r.id).unwrap_or(wm),
        });

        let wm = self.db.get_sync_watermark(&self.device, "memory_events")?;
        let events = self.db.export_events_after(&self.device, wm)?;
        cursors.push(TableCursor {
            table: "memory_events",
            new_watermark: events.last().map(|r| r.id).unwrap_or(wm),
        });

        let batch = SyncBatch {
            format_version: FORMAT_VERSION,
            batch_id: uuid::Uuid::new_v4().to_string(),
            source_device: self.device.clone(),
            target_device: target_device.to_string(),
            created_at: current_time_ms(),
            conversations,
            messages,
            history,
            metrics,
            events,
        };

        Ok((batch, cursors))
    }

    /// 推送本设备新增数据到 primary
    ///
    /// 传输失败不返回 Err，而是返回 status 为 failed 的报告，
    /// ledger 照写。调用方按 status 决定退出码。
    pub fn push(&self, target_device: &str, transport: &dyn SyncTransport) -> Result<SyncReport> {
        let started_at = current_time_ms();
        self.db.ensure_device(&self.device, None)?;

        let (batch, cursors) = self.export_batch_with_cursors(target_device)?;
        let records_sent = batch.total_records();

        // 无新数据：不走传输，只记审计
        if batch.is_empty() {
            tracing::debug!("无新增数据，跳过推送: {} -> {}", self.device, target_device);
            let finished_at = current_time_ms();
            self.db.touch_device_sync(&self.device, finished_at)?;
            self.write_push_ledger(&batch, 0, 0, SyncStatus::Success, None, started_at)?;
            return Ok(SyncReport {
                batch_id: batch.batch_id,
                status: SyncStatus::Success,
                records_sent: 0,
                records_applied: 0,
                records_skipped: 0,
                error: None,
            });
        }

        tracing::info!(
            "推送 {} 条记录: {} -> {} (批次 {})",
            records_sent,
            self.device,
            target_device,
            batch.batch_id
        );

        match transport.deliver(&batch) {
            Ok(apply_report) => {
                // 按固定表顺序推进 watermark，到第一张失败的表为止
                for cursor in &cursors {
                    let outcome = apply_report
                        .tables
                        .iter()
                        .find(|t| t.table == cursor.table);
                    match outcome {
                        Some(o) if o.ok => {
                            self.db.set_sync_watermark(
                                &self.device,
                                cursor.table,
                                cursor.new_watermark,
                            )?;
                        }
                        _ => {
                            tracing::warn!(
                                "表 {} 应用失败，其后的 watermark 不推进",
                                cursor.table
                            );
                            break;
                        }
                    }
                }

                let status = apply_report.status;
                let applied = apply_report.total_applied();
                let skipped = apply_report.total_skipped();
                let error = apply_report
                    .tables
                    .iter()
                    .find_map(|t| t.error.clone());

                if status == SyncStatus::Success {
                    self.db.touch_device_sync(&self.device, current_time_ms())?;
                }
                self.write_push_ledger(&batch, applied, skipped, status, error.clone(), started_at)?;

                Ok(SyncReport {
                    batch_id: batch.batch_id,
                    status,
                    records_sent,
                    records_applied: applied,
                    records_skipped: skipped,
                    error,
                })
            }
            Err(e) => {
                tracing::warn!("推送失败: {}", e);
                let error = Some(e.to_string());
                self.write_push_ledger(
                    &batch,
                    0,
                    0,
                    SyncStatus::Failed,
                    error.clone(),
                    started_at,
                )?;

                Ok(SyncReport {
                    batch_id: batch.batch_id,
                    status: SyncStatus::Failed,
                    records_sent,
                    records_applied: 0,
                    records_skipped: 0,
                    error,
                })
            }
        }
    }

    fn write_push_ledger(
        &self,
        batch: &SyncBatch,
        applied: u64,
        skipped: u64,
        status: SyncStatus,
        error: Option<String>,
        started_at: i64,
    ) -> Result<()> {
        self.db.append_sync_ledger(&SyncLedgerInput {
            batch_id: batch.batch_id.clone(),
            direction: "push".to_string(),
            source_device: batch.source_device.clone(),
            target_device: batch.target_device.clone(),
            records_sent: batch.total_records() as i64,
            records_applied: applied as i64,
            records_skipped: skipped as i64,
            status: status.to_string(),
            error,
            started_at,
            finished_at: Some(current_time_ms()),
        })?;
        Ok(())
    }

    /// primary 端应用一个批次
    ///
    /// 表按固定顺序应用，某表失败则后续表不再尝试（watermark 语义要求
    /// 失败点之后不产生空洞）。无论结局在本端写一条 ledger。
    pub fn apply(&self, batch: &SyncBatch) -> Result<ApplyReport> {
        let started_at = current_time_ms();

        if batch.format_version != FORMAT_VERSION {
            let msg = format!(
                "不支持的批次格式版本: {} (本端 {})",
                batch.format_version, FORMAT_VERSION
            );
            self.write_apply_ledger(batch, 0, 0, SyncStatus::Failed, Some(msg.clone()), started_at)?;
            return Err(Error::Sync(msg));
        }

        if batch.target_device != self.device {
            tracing::warn!(
                "批次目标设备 {} 与本机 {} 不一致，仍按本机应用",
                batch.target_device,
                self.device
            );
        }

        self.db.ensure_device(&self.device, Some("primary"))?;
        self.db.ensure_device(&batch.source_device, Some("secondary"))?;

        let mut tables: Vec<TableOutcome> = Vec::new();
        let mut halted = false;

        self.apply_step(&mut tables, &mut halted, "conversations", batch.conversations.len(), || {
            self.db.sync_insert_conversations(&batch.conversations)
        });
        self.apply_step(&mut tables, &mut halted, "messages", batch.messages.len(), || {
            self.db.sync_insert_messages(&batch.messages)
        });
        self.apply_step(&mut tables, &mut halted, "history_entries", batch.history.len(), || {
            self.db.sync_insert_history(&batch.history)
        });
        self.apply_step(&mut tables, &mut halted, "memory_metrics", batch.metrics.len(), || {
            self.db.sync_insert_metrics(&batch.metrics)
        });
        self.apply_step(&mut tables, &mut halted, "memory_events", batch.events.len(), || {
            self.db.sync_insert_events(&batch.events)
        });

        let status = derive_status(&tables);
        let report = ApplyReport {
            batch_id: batch.batch_id.clone(),
            status,
            tables,
        };

        if status == SyncStatus::Success {
            self.db
                .touch_device_sync(&batch.source_device, current_time_ms())?;
        }
        self.write_apply_ledger(
            batch,
            report.total_applied(),
            report.total_skipped(),
            status,
            report.tables.iter().find_map(|t| t.error.clone()),
            started_at,
        )?;

        tracing::info!(
            "批次 {} 应用完成: {} 新增, {} 跳过, 状态 {}",
            batch.batch_id,
            report.total_applied(),
            report.total_skipped(),
            status
        );

        Ok(report)
    }

    fn apply_step<F>(
        &self,
        tables: &mut Vec<TableOutcome>,
        halted: &mut bool,
        table: &str,
        received: usize,
        step: F,
    ) where
        F: FnOnce() -> Result<(u64, u64)>,
    {
        if *halted {
            tables.push(TableOutcome {
                table: table.to_string(),
                received: received as u64,
                applied: 0,
                skipped: 0,
                ok: false,
                error: Some("前序表失败，未应用".to_string()),
            });
            return;
        }

        match step() {
            Ok((applied, skipped)) => tables.push(TableOutcome {
                table: table.to_string(),
                received: received as u64,
                applied,
                skipped,
                ok: true,
                error: None,
            }),
            Err(e) => {
                tracing::warn!("应用表 {} 失败: {}", table, e);
                *halted = true;
                tables.push(TableOutcome {
                    table: table.to_string(),
                    received: received as u64,
                    applied: 0,
                    skipped: 0,
                    ok: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    fn write_apply_ledger(
        &self,
        batch: &SyncBatch,
        applied: u64,
        skipped: u64,
        status: SyncStatus,
        error: Option<String>,
        started_at: i64,
    ) -> Result<()> {
        self.db.append_sync_ledger(&SyncLedgerInput {
            batch_id: batch.batch_id.clone(),
            direction: "apply".to_string(),
            source_device: batch.source_device.clone(),
            target_device: self.device.clone(),
            records_sent: batch.total_records() as i64,
            records_applied: applied as i64,
            records_skipped: skipped as i64,
            status: status.to_string(),
            error,
            started_at,
            finished_at: Some(current_time_ms()),
        })?;
        Ok(())
    }
}

/// 逐表结果汇总成批次状态
fn derive_status(tables: &[TableOutcome]) -> SyncStatus {
    if tables.iter().all(|t| t.ok) {
        SyncStatus::Success
    } else if tables.iter().any(|t| t.ok) {
        SyncStatus::Partial
    } else {
        SyncStatus::Failed
    }
}

// ==================== 传输实现 ====================

/// 进程内直连传输：目标库在同一进程（同机合并和测试用）
pub struct DirectTransport<'a> {
    target: SyncEngine<'a>,
}

impl<'a> DirectTransport<'a> {
    pub fn new(db: &'a LakeDB, device: impl Into<String>) -> Self {
        Self {
            target: SyncEngine::new(db, device),
        }
    }
}

impl SyncTransport for DirectTransport<'_> {
    fn deliver(&self, batch: &SyncBatch) -> Result<ApplyReport> {
        self.target.apply(batch)
    }
}

/// SSH 传输：scp 批次文件到远端，远程执行 apply 并回读 JSON 报告
///
/// 要求远端 PATH 里有 remote_command，且 apply --json 把报告写到 stdout
/// （日志走 stderr）。
pub struct SshTransport {
    /// ssh/scp 目标，形如 user@host
    pub host: String,
    /// 远端可执行文件名
    pub remote_command: String,
    /// 连接超时 (秒)
    pub connect_timeout_secs: u64,
}

impl SshTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            remote_command: "datalake".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl SyncTransport for SshTransport {
    fn deliver(&self, batch: &SyncBatch) -> Result<ApplyReport> {
        let payload = serde_json::to_vec(batch)?;
        let file_name = format!("datalake-batch-{}.json", batch.batch_id);
        let local_path = std::env::temp_dir().join(&file_name);
        std::fs::write(&local_path, &payload)?;
        let remote_path = format!("/tmp/{}", file_name);

        let timeout_opt = format!("ConnectTimeout={}", self.connect_timeout_secs);

        let scp = std::process::Command::new("scp")
            .arg("-q")
            .arg("-o")
            .arg(&timeout_opt)
            .arg(&local_path)
            .arg(format!("{}:{}", self.host, remote_path))
            .output();
        let _ = std::fs::remove_file(&local_path);

        let scp = scp.map_err(|e| Error::Transport(format!("scp 启动失败: {}", e)))?;
        if !scp.status.success() {
            return Err(Error::Transport(format!(
                "scp 失败: {}",
                String::from_utf8_lossy(&scp.stderr).trim()
            )));
        }

        // 批次文件无论 apply 成败都清掉
        let remote_cmd = format!(
            "{} apply --json {} ; status=$? ; rm -f {} ; exit $status",
            self.remote_command, remote_path, remote_path
        );
        let ssh = std::process::Command::new("ssh")
            .arg("-o")
            .arg(&timeout_opt)
            .arg(&self.host)
            .arg(&remote_cmd)
            .output()
            .map_err(|e| Error::Transport(format!("ssh 启动失败: {}", e)))?;

        if !ssh.status.success() {
            return Err(Error::Transport(format!(
                "远端 apply 失败: {}",
                String::from_utf8_lossy(&ssh.stderr).trim()
            )));
        }

        serde_json::from_slice::<ApplyReport>(&ssh.stdout)
            .map_err(|e| Error::Transport(format!("远端报告解析失败: {}", e)))
    }
}
