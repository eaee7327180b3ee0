//! 集成测试
//!
//! 覆盖采集全链路：源发现、增量读取、规范化、幂等写入、聚合维护。

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use datalake_db::*;
use tempfile::TempDir;

/// 创建临时数据库
fn setup_db() -> (LakeDB, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("lake.db");
    let db = LakeDB::connect(DbConfig::local(&db_path)).unwrap();
    (db, tmp)
}

/// 创建临时源目录（claude 会话 + memory 监控）
fn setup_sources(tmp: &TempDir) -> SourceConfig {
    let claude_dir = tmp.path().join("claude");
    let memory_dir = tmp.path().join("memory");
    fs::create_dir_all(claude_dir.join("projects")).unwrap();
    fs::create_dir_all(&memory_dir).unwrap();
    SourceConfig::new(claude_dir, memory_dir)
}

/// 写入一个会话日志文件，返回路径
fn write_session_file(
    config: &SourceConfig,
    project: &str,
    session: &str,
    lines: &[String],
) -> PathBuf {
    let dir = config.projects_dir().join(project);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.jsonl", session));
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(&path, body).unwrap();
    path
}

fn append_lines(path: &Path, lines: &[String]) {
    let mut f = OpenOptions::new().append(true).open(path).unwrap();
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
}

/// 构造一条 user 回合（外层 camelCase）
fn user_line(uuid: &str, parent: Option<&str>, text: &str, ts: &str) -> String {
    serde_json::json!({
        "uuid": uuid,
        "parentUuid": parent,
        "type": "user",
        "timestamp": ts,
        "cwd": "/Users/dev/proj",
        "gitBranch": "main",
        "version": "1.0.44",
        "message": { "role": "user", "content": text },
    })
    .to_string()
}

/// 构造一条 assistant 回合（内层 message 是 snake_case，带 usage）
fn assistant_line(uuid: &str, parent: Option<&str>, text: &str, ts: &str) -> String {
    serde_json::json!({
        "uuid": uuid,
        "parentUuid": parent,
        "type": "assistant",
        "timestamp": ts,
        "requestId": format!("req_{}", uuid),
        "message": {
            "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [ { "type": "text", "text": text } ],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 100,
                "output_tokens": 40,
                "cache_read_input_tokens": 10,
                "cache_creation_input_tokens": 5
            }
        },
    })
    .to_string()
}

fn summary_line(summary: &str, leaf: &str) -> String {
    serde_json::json!({ "type": "summary", "summary": summary, "leafUuid": leaf }).to_string()
}

/// 标准两回合会话：user -> assistant
fn basic_session_lines() -> Vec<String> {
    vec![
        user_line("u1", None, "如何初始化数据库", "2026-01-15T10:00:00.000Z"),
        assistant_line("a1", Some("u1"), "先建表再建索引", "2026-01-15T10:00:05.000Z"),
    ]
}

// ==================== 连接测试 ====================

mod connection_tests {
    use super::*;

    #[test]
    fn test_connect_creates_db_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("subdir").join("lake.db");

        // 目录不存在
        assert!(!db_path.parent().unwrap().exists());

        let _db = LakeDB::connect(DbConfig::local(&db_path)).unwrap();

        // 连接后文件应该存在
        assert!(db_path.exists());
    }

    #[test]
    fn test_connect_existing_db() {
        let (db1, tmp) = setup_db();
        drop(db1);

        let db_path = tmp.path().join("lake.db");
        let db2 = LakeDB::connect(DbConfig::local(&db_path)).unwrap();

        let stats = db2.get_stats().unwrap();
        assert_eq!(stats.conversation_count, 0);
        assert_eq!(stats.message_count, 0);
    }
}

// ==================== 设备测试 ====================

mod device_tests {
    use super::*;

    #[test]
    fn test_ensure_device_defaults_secondary() {
        let (db, _tmp) = setup_db();

        db.ensure_device("laptop", None).unwrap();

        let device = db.get_device("laptop").unwrap().unwrap();
        assert_eq!(device.role, "secondary");
        assert!(device.last_seen_at.is_some());
        assert!(device.last_sync_at.is_none());
    }

    #[test]
    fn test_ensure_device_role_upgrade() {
        let (db, _tmp) = setup_db();

        db.ensure_device("studio", None).unwrap();
        db.ensure_device("studio", Some("primary")).unwrap();
        // 不带 role 的后续调用不得降级
        db.ensure_device("studio", None).unwrap();

        let device = db.get_device("studio").unwrap().unwrap();
        assert_eq!(device.role, "primary");

        let devices = db.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn test_touch_device_sync() {
        let (db, _tmp) = setup_db();

        db.ensure_device("laptop", None).unwrap();
        db.touch_device_sync("laptop", 1736899200000).unwrap();

        let device = db.get_device("laptop").unwrap().unwrap();
        assert_eq!(device.last_sync_at, Some(1736899200000));
    }
}

// ==================== 会话采集测试 ====================

mod session_ingest_tests {
    use super::*;

    #[test]
    fn test_ingest_basic_session() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        let engine = IngestEngine::new(&db, "laptop");
        let report = engine.ingest_all(&config).unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failed, 0);
        assert!(report.errors.is_empty());

        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.device, "laptop");
        assert_eq!(conv.total_messages, 2);
        assert_eq!(conv.user_messages, 1);
        assert_eq!(conv.assistant_messages, 1);
        assert_eq!(conv.total_input_tokens, 100);
        assert_eq!(conv.total_output_tokens, 40);
        assert_eq!(conv.total_cache_read_tokens, 10);
        assert_eq!(conv.total_cache_creation_tokens, 5);
        assert_eq!(conv.started_at, Some(1768471200000));
        assert_eq!(conv.ended_at, Some(1768471205000));
        assert_eq!(conv.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(conv.git_branch.as_deref(), Some("main"));
        assert_eq!(conv.version.as_deref(), Some("1.0.44"));
    }

    #[test]
    fn test_project_path_decoded() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.project_path.as_deref(), Some("/Users/dev/proj"));
    }

    #[test]
    fn test_message_fields_and_sequence() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let messages = db.get_messages("sess-1").unwrap();
        assert_eq!(messages.len(), 2);

        // 按 sequence 升序，从 0 开始
        assert_eq!(messages[0].sequence, 0);
        assert_eq!(messages[1].sequence, 1);

        let user = &messages[0];
        assert_eq!(user.uuid, "u1");
        assert_eq!(user.r#type, "user");
        assert_eq!(user.role.as_deref(), Some("user"));
        assert_eq!(user.content_text, "如何初始化数据库");
        assert_eq!(user.cwd.as_deref(), Some("/Users/dev/proj"));
        assert!(!user.is_sidechain);

        let asst = &messages[1];
        assert_eq!(asst.parent_uuid.as_deref(), Some("u1"));
        assert_eq!(asst.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(asst.input_tokens, 100);
        assert_eq!(asst.output_tokens, 40);
        assert_eq!(asst.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(asst.request_id.as_deref(), Some("req_a1"));
    }

    #[test]
    fn test_parent_resolution() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let asst = db.get_message_by_uuid("a1").unwrap().unwrap();
        let parent = db.resolve_parent(&asst).unwrap().unwrap();
        assert_eq!(parent.uuid, "u1");

        let children = db.get_children("u1").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].uuid, "a1");

        // 根消息没有 parent
        let user = db.get_message_by_uuid("u1").unwrap().unwrap();
        assert!(db.resolve_parent(&user).unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_parent_linkage() {
        // 子消息先到，父消息在下一次采集才出现
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let path = write_session_file(
            &config,
            "-Users-dev-proj",
            "sess-1",
            &[user_line("b1", Some("a0"), "后续问题", "2026-01-15T10:05:00.000Z")],
        );

        let engine = IngestEngine::new(&db, "laptop");
        engine.ingest_all(&config).unwrap();

        // 悬空引用容忍：解析得到 None，不报错
        let child = db.get_message_by_uuid("b1").unwrap().unwrap();
        assert!(db.resolve_parent(&child).unwrap().is_none());

        append_lines(
            &path,
            &[user_line("a0", None, "最初的问题", "2026-01-15T10:04:00.000Z")],
        );
        engine.ingest_all(&config).unwrap();

        let parent = db.resolve_parent(&child).unwrap().unwrap();
        assert_eq!(parent.uuid, "a0");

        // 两条都只计一次
        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.total_messages, 2);
    }

    #[test]
    fn test_summary_attaches_to_conversation() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let mut lines = basic_session_lines();
        lines.push(summary_line("初始化数据库的讨论", "a1"));
        write_session_file(&config, "-Users-dev-proj", "sess-1", &lines);

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        // summary 行是元数据，不计入 inserted
        assert_eq!(report.inserted, 2);

        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.summary.as_deref(), Some("初始化数据库的讨论"));
    }

    #[test]
    fn test_summary_before_turns() {
        // 续写的会话文件把 summary 放在最前面
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let mut lines = vec![summary_line("上一段的总结", "u0")];
        lines.extend(basic_session_lines());
        write_session_file(&config, "-Users-dev-proj", "sess-1", &lines);

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.summary.as_deref(), Some("上一段的总结"));
        assert_eq!(conv.total_messages, 2);
    }

    #[test]
    fn test_sidechain_from_filename() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(
            &config,
            "-Users-dev-proj",
            "agent-task1",
            &[user_line("s1", None, "子任务", "2026-01-15T11:00:00.000Z")],
        );

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let msg = db.get_message_by_uuid("s1").unwrap().unwrap();
        assert!(msg.is_sidechain);
        assert_eq!(msg.session_id, "agent-task1");
    }

    #[test]
    fn test_watermark_second_run_reads_nothing() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        let engine = IngestEngine::new(&db, "laptop");
        engine.ingest_all(&config).unwrap();
        let second = engine.ingest_all(&config).unwrap();

        // 偏移已到文件尾，什么都不读
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 0);
        assert_eq!(second.failed, 0);
    }

    #[test]
    fn test_watermark_state_recorded() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let path =
            write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let state = db
            .get_source_state("laptop", &path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(state.byte_offset, fs::metadata(&path).unwrap().len());
        assert_eq!(state.line_no, 2);
        assert_eq!(state.source_kind, "session");
        assert!(state.file_key.is_some());
    }

    #[test]
    fn test_incremental_append() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let path =
            write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        let engine = IngestEngine::new(&db, "laptop");
        engine.ingest_all(&config).unwrap();

        append_lines(
            &path,
            &[user_line("u2", Some("a1"), "继续", "2026-01-15T10:01:00.000Z")],
        );
        let report = engine.ingest_all(&config).unwrap();

        // 只读到新追加的一行
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 0);

        let messages = db.get_messages("sess-1").unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].uuid, "u2");
        assert_eq!(messages[2].sequence, 2);

        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.total_messages, 3);
        assert_eq!(conv.ended_at, Some(1768471260000));
    }

    #[test]
    fn test_duplicate_uuid_skipped() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        let engine = IngestEngine::new(&db, "laptop");
        engine.ingest_all(&config).unwrap();

        // 同一会话被拷贝到另一个文件（显式 sessionId 指回 sess-1）
        let dup = vec![serde_json::json!({
            "uuid": "u1",
            "sessionId": "sess-1",
            "type": "user",
            "timestamp": "2026-01-15T10:00:00.000Z",
            "message": { "role": "user", "content": "如何初始化数据库" },
        })
        .to_string()];
        write_session_file(&config, "-Users-dev-proj", "sess-1-copy", &dup);

        let report = engine.ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.skipped, 1);

        // 没有产生重复行，聚合没被污染
        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.total_messages, 2);
    }

    #[test]
    fn test_malformed_line_counts_and_continues() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);

        // 11 行中第 6 行缺 timestamp
        let mut lines = Vec::new();
        for i in 0..11 {
            if i == 5 {
                lines.push(
                    serde_json::json!({
                        "uuid": "bad",
                        "type": "user",
                        "message": { "role": "user", "content": "缺时间戳" },
                    })
                    .to_string(),
                );
            } else {
                lines.push(user_line(
                    &format!("u{}", i),
                    None,
                    "正常行",
                    &format!("2026-01-15T10:00:{:02}.000Z", i),
                ));
            }
        }
        write_session_file(&config, "-Users-dev-proj", "sess-1", &lines);

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        assert_eq!(report.inserted, 10);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        // 错误带源文件行号
        assert!(report.errors[0].contains("行 6"), "{}", report.errors[0]);
        assert!(report.errors[0].contains("sess-1.jsonl"));

        // 坏行不阻塞其余行，聚合按实际写入计算
        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.total_messages, 10);
    }

    #[test]
    fn test_malformed_json_line() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let lines = vec![
            user_line("u1", None, "好行", "2026-01-15T10:00:00.000Z"),
            "{ 这不是 JSON".to_string(),
        ];
        write_session_file(&config, "-Users-dev-proj", "sess-1", &lines);

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed, 1);
        assert!(report.errors[0].contains("行 2"));
    }

    #[test]
    fn test_truncated_file_reingests_idempotently() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let path =
            write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        let engine = IngestEngine::new(&db, "laptop");
        engine.ingest_all(&config).unwrap();

        // 文件被截断重写（只剩第一行），从头重读
        write_session_file(
            &config,
            "-Users-dev-proj",
            "sess-1",
            &[user_line("u1", None, "如何初始化数据库", "2026-01-15T10:00:00.000Z")],
        );
        let report = engine.ingest_all(&config).unwrap();

        // natural key 去重，重读不产生重复
        assert_eq!(report.inserted, 0);
        assert_eq!(report.skipped, 1);

        let state = db
            .get_source_state("laptop", &path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(state.byte_offset, fs::metadata(&path).unwrap().len());
        assert_eq!(state.line_no, 1);
    }

    #[test]
    fn test_ingest_path_single_file() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let path =
            write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        let report = IngestEngine::new(&db, "laptop").ingest_path(&path).unwrap();
        assert_eq!(report.inserted, 2);

        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.project_path.as_deref(), Some("/Users/dev/proj"));
    }

    #[test]
    fn test_list_conversations_by_device() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let all = db.list_conversations(None, 10).unwrap();
        assert_eq!(all.len(), 1);

        let mine = db.list_conversations(Some("laptop"), 10).unwrap();
        assert_eq!(mine.len(), 1);

        let other = db.list_conversations(Some("studio"), 10).unwrap();
        assert!(other.is_empty());
    }
}

// ==================== 命令历史采集测试 ====================

mod history_ingest_tests {
    use super::*;

    fn history_line(display: &str, session: &str, ts: i64) -> String {
        serde_json::json!({
            "display": display,
            "project": "/Users/dev/proj",
            "sessionId": session,
            "timestamp": ts,
        })
        .to_string()
    }

    #[test]
    fn test_ingest_history_basic() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let lines = vec![
            history_line("修复登录 bug", "sess-1", 1736899200000),
            history_line("跑一下测试", "sess-1", 1736899260000),
        ];
        fs::write(config.history_file(), format!("{}\n", lines.join("\n"))).unwrap();

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 2);

        let entries = db.list_history("sess-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].display, "修复登录 bug");
        assert_eq!(entries[0].project.as_deref(), Some("/Users/dev/proj"));
        assert_eq!(entries[0].device, "laptop");
    }

    #[test]
    fn test_history_duplicate_timestamp_skipped() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        // 同 (session, timestamp) 出现两次
        let line = history_line("重复命令", "sess-1", 1736899200000);
        fs::write(config.history_file(), format!("{}\n{}\n", line, line)).unwrap();

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_history_pasted_contents_serialized() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let line = serde_json::json!({
            "display": "粘贴了一段栈回溯",
            "pastedContents": { "0": { "type": "text", "content": "panic at ..." } },
            "sessionId": "sess-1",
            "timestamp": 1736899200000i64,
        })
        .to_string();
        fs::write(config.history_file(), format!("{}\n", line)).unwrap();

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let entries = db.list_history("sess-1").unwrap();
        assert_eq!(entries.len(), 1);
        let pasted = entries[0].pasted_contents.as_deref().unwrap();
        assert!(pasted.contains("panic at"));
    }

    #[test]
    fn test_history_missing_display_fails() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let line = serde_json::json!({ "sessionId": "sess-1", "timestamp": 1736899200000i64 })
            .to_string();
        fs::write(config.history_file(), format!("{}\n", line)).unwrap();

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.failed, 1);
        assert!(report.errors[0].contains("行 1"));
    }
}

// ==================== 内存监控采集测试 ====================

mod memory_ingest_tests {
    use super::*;

    #[test]
    fn test_metrics_bytes_and_mb() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let lines = [
            serde_json::json!({
                "pid": 100, "session_id": "sess-1", "rss_bytes": 1073741824i64,
                "command": "claude", "timestamp": 1736899200.0,
            })
            .to_string(),
            // 只有 rss_mb 的旧格式
            serde_json::json!({
                "pid": 100, "session_id": "sess-1", "rss_mb": 512.0,
                "rate_mb_min": 1.5, "timestamp": 1736899260.5,
            })
            .to_string(),
        ];
        fs::write(config.metrics_file(), format!("{}\n", lines.join("\n"))).unwrap();

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 2);

        let samples = db.list_metrics("laptop", 0, i64::MAX).unwrap();
        assert_eq!(samples.len(), 2);

        // 秒级浮点时间戳换算成毫秒
        assert_eq!(samples[0].timestamp, 1736899200000);
        assert_eq!(samples[0].rss_bytes, 1073741824);
        assert_eq!(samples[1].timestamp, 1736899260500);
        assert_eq!(samples[1].rss_bytes, 536870912);
        assert_eq!(samples[1].rate_mb_min, Some(1.5));
    }

    #[test]
    fn test_metric_duplicate_pid_timestamp_skipped() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let line = serde_json::json!({
            "pid": 100, "rss_bytes": 1024i64, "timestamp": 1736899200.0,
        })
        .to_string();
        fs::write(config.metrics_file(), format!("{}\n{}\n", line, line)).unwrap();

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_metric_missing_rss_fails() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let line = serde_json::json!({ "pid": 100, "timestamp": 1736899200.0 }).to_string();
        fs::write(config.metrics_file(), format!("{}\n", line)).unwrap();

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.failed, 1);
    }

    // 读回用 export_events_after，仅在 sync 构建下有该接口
    #[cfg(feature = "sync")]
    #[test]
    fn test_events_defaults_and_alias() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let lines = [
            // 文件格式用 type 键 + 完整字段
            serde_json::json!({
                "type": "high_memory", "pid": 100, "session_id": "sess-1",
                "severity": "warning", "message": "rss 超过阈值",
                "details": { "rss_mb": 2048 }, "timestamp": 1736899200.0,
            })
            .to_string(),
            // event_type 别名 + 最简形式：severity 缺省 info，pid 缺省 0
            serde_json::json!({ "event_type": "monitor_started", "timestamp": 1736899260.0 })
                .to_string(),
        ];
        fs::write(config.events_file(), format!("{}\n", lines.join("\n"))).unwrap();

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);

        let events = db.export_events_after("laptop", 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "high_memory");
        assert_eq!(events[0].pid, 100);
        assert_eq!(events[0].severity, "warning");
        assert_eq!(events[1].event_type, "monitor_started");
        assert_eq!(events[1].pid, 0);
        assert_eq!(events[1].severity, "info");
    }

    #[test]
    fn test_missing_memory_files_not_an_error() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        // 只有会话源，没有 history/metrics/events 文件
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        let report = IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);
    }
}

// ==================== 标注测试 ====================

mod curation_tests {
    use super::*;

    #[test]
    fn test_set_tags_and_rating() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());
        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        db.set_conversation_tags("sess-1", "rust,debug").unwrap();
        db.set_conversation_rating("sess-1", 5).unwrap();

        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.tags.as_deref(), Some("rust,debug"));
        assert_eq!(conv.rating, Some(5));
    }

    #[test]
    fn test_curation_survives_reingest() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let path =
            write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());

        let engine = IngestEngine::new(&db, "laptop");
        engine.ingest_all(&config).unwrap();

        db.set_conversation_rating("sess-1", 4).unwrap();

        // 会话继续，upsert 不得覆盖用户标注
        append_lines(
            &path,
            &[user_line("u2", Some("a1"), "再看看", "2026-01-15T10:02:00.000Z")],
        );
        engine.ingest_all(&config).unwrap();

        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.rating, Some(4));
        assert_eq!(conv.total_messages, 3);
    }
}

// ==================== 统计与一致性测试 ====================

mod stats_tests {
    use super::*;

    #[test]
    fn test_get_stats_counts() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());
        fs::write(
            config.history_file(),
            format!(
                "{}\n",
                serde_json::json!({
                    "display": "x", "sessionId": "sess-1", "timestamp": 1736899200000i64
                })
            ),
        )
        .unwrap();

        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.device_count, 1);
        assert_eq!(stats.conversation_count, 1);
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.history_count, 1);
        assert_eq!(stats.total_input_tokens, 100);
        assert_eq!(stats.total_output_tokens, 40);
    }

    #[test]
    fn test_check_aggregates_clean_after_ingest() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());
        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let report = db.check_aggregates().unwrap();
        assert_eq!(report.conversations_checked, 1);
        assert!(report.drifted.is_empty());
    }

    #[test]
    fn test_repair_aggregates_fixes_drift() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(&config, "-Users-dev-proj", "sess-1", &basic_session_lines());
        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        // 人为制造漂移
        db.connection()
            .lock()
            .execute(
                "UPDATE conversations SET total_messages = 99 WHERE session_id = 'sess-1'",
                [],
            )
            .unwrap();

        let report = db.check_aggregates().unwrap();
        assert_eq!(report.drifted, vec!["sess-1".to_string()]);

        let fixed = db.repair_aggregates().unwrap();
        assert_eq!(fixed, 1);

        let report = db.check_aggregates().unwrap();
        assert!(report.drifted.is_empty());
        let conv = db.get_conversation("sess-1").unwrap().unwrap();
        assert_eq!(conv.total_messages, 2);
    }
}

// ==================== 全文搜索测试 ====================

#[cfg(feature = "search")]
mod search_tests {
    use super::*;

    #[test]
    fn test_search_messages_finds_ingested_text() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let lines = vec![
            user_line(
                "u1",
                None,
                "how to configure sqlite wal mode",
                "2026-01-15T10:00:00.000Z",
            ),
            assistant_line(
                "a1",
                Some("u1"),
                "use pragma journal_mode",
                "2026-01-15T10:00:05.000Z",
            ),
        ];
        write_session_file(&config, "-Users-dev-proj", "sess-1", &lines);
        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let hits = db.search_messages("sqlite", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, "sess-1");
        assert_eq!(hits[0].uuid, "u1");
        assert!(hits[0].snippet.contains("<mark>"));
    }

    #[test]
    fn test_search_scoped_to_session() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        write_session_file(
            &config,
            "-Users-dev-proj",
            "sess-1",
            &[user_line(
                "u1",
                None,
                "wal checkpoint question",
                "2026-01-15T10:00:00.000Z",
            )],
        );
        write_session_file(
            &config,
            "-Users-dev-proj",
            "sess-2",
            &[user_line(
                "u2",
                None,
                "checkpoint again elsewhere",
                "2026-01-15T11:00:00.000Z",
            )],
        );
        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let all = db.search_messages("checkpoint", 10).unwrap();
        assert_eq!(all.len(), 2);

        let scoped = db
            .search_messages_with_session("checkpoint", 10, Some("sess-1"))
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].uuid, "u1");

        let none = db
            .search_messages_with_session("checkpoint", 10, Some("sess-9"))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_search_history() {
        let (db, tmp) = setup_db();
        let config = setup_sources(&tmp);
        let line = serde_json::json!({
            "display": "cargo clippy --all-targets",
            "sessionId": "sess-1",
            "timestamp": 1736899200000i64,
        })
        .to_string();
        fs::write(config.history_file(), format!("{}\n", line)).unwrap();
        IngestEngine::new(&db, "laptop").ingest_all(&config).unwrap();

        let hits = db.search_history("clippy", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, "sess-1");
    }

    #[test]
    fn test_search_empty_query_returns_empty() {
        let (db, _tmp) = setup_db();
        let hits = db.search_messages("   ", 10).unwrap();
        assert!(hits.is_empty());
    }
}
