//! 数据库 Schema 定义
//!
//! 所有时间戳均为毫秒 Unix 时间戳 (INTEGER)。
//! 每张可同步表都带 device 列与 natural key 唯一约束，跨设备合并依赖它们去重。

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Devices 表（设备注册，每台机器一行）
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL DEFAULT 'secondary',  -- 'primary' | 'secondary'
    last_seen_at INTEGER,
    last_sync_at INTEGER,                    -- 最近一次同步成功时间
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- Conversations 表（一个 assistant 会话一行）
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL UNIQUE,  -- 上游生成的外部 ID，跨设备唯一
    device TEXT NOT NULL,             -- 归属设备名
    project_path TEXT,                -- 解码后的项目路径
    summary TEXT,                     -- summary 记录写入
    model TEXT,
    version TEXT,                     -- 客户端版本
    git_branch TEXT,
    -- 聚合计数（始终等于 messages 的统计值，插入事务内同步更新）
    total_messages INTEGER NOT NULL DEFAULT 0,
    user_messages INTEGER NOT NULL DEFAULT 0,
    assistant_messages INTEGER NOT NULL DEFAULT 0,
    total_input_tokens INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0,
    total_cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    total_cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER,               -- MIN(messages.timestamp)
    ended_at INTEGER,                 -- MAX(messages.timestamp)
    -- 用户标注
    tags TEXT,
    rating INTEGER,
    source_file TEXT,                 -- 来源 JSONL 路径
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- Messages 表
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    uuid TEXT NOT NULL UNIQUE,        -- 上游消息 ID，全局唯一，用于去重
    parent_uuid TEXT,                 -- 父消息引用（松散外键，读取时解析，可悬空）
    type TEXT NOT NULL,               -- 'user' | 'assistant'
    role TEXT,
    model TEXT,
    content_text TEXT NOT NULL DEFAULT '',      -- 最终回答文本
    content_thinking TEXT NOT NULL DEFAULT '',  -- thinking 内容，与正文分开存储
    word_count INTEGER NOT NULL DEFAULT 0,
    image_count INTEGER NOT NULL DEFAULT 0,     -- 大块内容只存计数
    tool_use_count INTEGER NOT NULL DEFAULT 0,
    tool_result_count INTEGER NOT NULL DEFAULT 0,
    is_sidechain INTEGER NOT NULL DEFAULT 0,
    cwd TEXT,
    git_branch TEXT,
    -- 逐消息 token 用量
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    stop_reason TEXT,
    request_id TEXT,
    timestamp INTEGER NOT NULL,
    sequence INTEGER NOT NULL,        -- 会话内全序，时间戳冲突时仍然稳定
    device TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES conversations(session_id) ON DELETE CASCADE
);

-- History 表（轻量 prompt 记录，复合 natural key 去重）
CREATE TABLE IF NOT EXISTS history_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    display TEXT NOT NULL,
    pasted_contents TEXT,
    project TEXT,
    timestamp INTEGER NOT NULL,
    device TEXT NOT NULL,
    UNIQUE(session_id, timestamp)
);

-- 内存指标表（append-only 时间序列）
CREATE TABLE IF NOT EXISTS memory_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pid INTEGER NOT NULL,
    session_id TEXT,
    rss_bytes INTEGER NOT NULL,
    rss_mb REAL,
    rate_mb_min REAL,
    command TEXT,
    timestamp INTEGER NOT NULL,
    device TEXT NOT NULL,
    UNIQUE(device, pid, timestamp)
);

-- 内存事件表（append-only）
CREATE TABLE IF NOT EXISTS memory_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    pid INTEGER NOT NULL DEFAULT 0,   -- 0 = 无关联进程；NOT NULL 保证唯一约束可判等
    session_id TEXT,
    severity TEXT NOT NULL DEFAULT 'info',
    message TEXT,
    details TEXT,                     -- 任意 JSON，序列化存储
    timestamp INTEGER NOT NULL,
    device TEXT NOT NULL,
    UNIQUE(device, timestamp, event_type, pid)
);

-- 采集 watermark 表（每个源文件的读取进度）
CREATE TABLE IF NOT EXISTS source_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device TEXT NOT NULL,
    path TEXT NOT NULL,
    source_kind TEXT NOT NULL,        -- 'session' | 'history' | 'metrics' | 'events'
    byte_offset INTEGER NOT NULL DEFAULT 0,
    line_no INTEGER NOT NULL DEFAULT 0,  -- 已消费行数，错误报告用绝对行号
    file_key TEXT,                    -- 文件标识 (dev:inode)，变化视为轮转
    file_size INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    UNIQUE(device, path)
);

-- 同步 watermark 表（每设备每表最后已确认同步的 rowid）
CREATE TABLE IF NOT EXISTS sync_watermarks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device TEXT NOT NULL,
    table_name TEXT NOT NULL,
    last_rowid INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    UNIQUE(device, table_name)
);

-- 同步 ledger 表（append-only 审计，成败都记一行）
CREATE TABLE IF NOT EXISTS sync_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    direction TEXT NOT NULL,          -- 'push' | 'apply'
    source_device TEXT NOT NULL,
    target_device TEXT NOT NULL,
    records_sent INTEGER NOT NULL DEFAULT 0,
    records_applied INTEGER NOT NULL DEFAULT 0,
    records_skipped INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,             -- 'success' | 'partial' | 'failed'
    error TEXT,
    started_at INTEGER NOT NULL,
    finished_at INTEGER
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_conversations_device ON conversations(device);
CREATE INDEX IF NOT EXISTS idx_conversations_started ON conversations(started_at);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_uuid) WHERE parent_uuid IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_messages_device ON messages(device);
CREATE INDEX IF NOT EXISTS idx_history_session ON history_entries(session_id);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history_entries(timestamp);
CREATE INDEX IF NOT EXISTS idx_metrics_pid_ts ON memory_metrics(pid, timestamp);
CREATE INDEX IF NOT EXISTS idx_metrics_device ON memory_metrics(device);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON memory_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_ledger_devices ON sync_ledger(source_device, target_device, started_at DESC);
"#;

/// FTS5 全文搜索 Schema
///
/// messages_fts 索引正文与 thinking 两列，history_fts 索引 display。
/// 触发器与源表写入同语句执行，影子索引始终与源表同事务一致。
pub const FTS_SCHEMA_SQL: &str = r#"
-- 全文搜索虚拟表 (带触发器自动维护)
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content_text,
    content_thinking,
    content='messages',
    content_rowid='id',
    tokenize='unicode61'
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, content_text, content_thinking)
    VALUES (new.id, new.content_text, new.content_thinking);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content_text, content_thinking)
    VALUES('delete', old.id, old.content_text, old.content_thinking);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content_text, content_thinking)
    VALUES('delete', old.id, old.content_text, old.content_thinking);
    INSERT INTO messages_fts(rowid, content_text, content_thinking)
    VALUES (new.id, new.content_text, new.content_thinking);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS history_fts USING fts5(
    display,
    content='history_entries',
    content_rowid='id',
    tokenize='unicode61'
);

CREATE TRIGGER IF NOT EXISTS history_ai AFTER INSERT ON history_entries BEGIN
    INSERT INTO history_fts(rowid, display) VALUES (new.id, new.display);
END;

CREATE TRIGGER IF NOT EXISTS history_ad AFTER DELETE ON history_entries BEGIN
    INSERT INTO history_fts(history_fts, rowid, display) VALUES('delete', old.id, old.display);
END;

CREATE TRIGGER IF NOT EXISTS history_au AFTER UPDATE ON history_entries BEGIN
    INSERT INTO history_fts(history_fts, rowid, display) VALUES('delete', old.id, old.display);
    INSERT INTO history_fts(rowid, display) VALUES (new.id, new.display);
END;
"#;

/// 获取完整 Schema (根据 feature flags)
pub fn full_schema(fts: bool) -> String {
    let mut sql = SCHEMA_SQL.to_string();

    if fts {
        sql.push_str(FTS_SCHEMA_SQL);
    }

    sql
}
