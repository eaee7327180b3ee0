//! datalake - 个人数据湖 CLI
//!
//! 负责：
//! - 本机 JSONL 源的增量采集
//! - 向 primary 设备推送新增记录
//! - primary 端应用收到的同步批次
//! - 全文搜索与统计

use std::path::Path;

use anyhow::{Context, Result};
use datalake_db::config::{device_name, expand_path};
use datalake_db::sync::{DirectTransport, SshTransport, SyncBatch, SyncEngine};
use datalake_db::{DbConfig, IngestEngine, LakeDB, SourceConfig, SyncStatus};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    // 日志全部写 stderr，stdout 留给 apply --json 的报告输出
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("datalake_db=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    match args[1].as_str() {
        "ingest" => cmd_ingest(&args[2..]),
        "push" => cmd_push(&args[2..]),
        "apply" => cmd_apply(&args[2..]),
        "search" => cmd_search(&args[2..]),
        "stats" => cmd_stats(),
        "check" => cmd_check(&args[2..]),
        other => {
            eprintln!("❌ 未知命令: {}", other);
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }
}

fn print_usage(prog: &str) {
    eprintln!("用法: {} <命令> [参数]", prog);
    eprintln!();
    eprintln!("命令:");
    eprintln!("  ingest [路径] [--claude-dir D] [--memory-dir D]");
    eprintln!("                              采集全部已配置源，或指定单个源文件");
    eprintln!("  push <设备> --ssh <host>    通过 SSH 推送新增记录到目标设备");
    eprintln!("  push <设备> --local-db <路径>  推送到本机另一个数据库（调试用）");
    eprintln!("  apply --json <文件> [--db <路径>]");
    eprintln!("                              应用同步批次，stdout 输出报告 JSON");
    eprintln!("  search <关键词> [--history] 全文搜索消息（或命令历史）");
    eprintln!("  stats                       数据库统计");
    eprintln!("  check [--repair]            校验会话聚合字段，可选修复");
    eprintln!();
    eprintln!("例: {} ingest", prog);
    eprintln!("例: {} push studio --ssh user@studio.local", prog);
}

fn open_db() -> Result<LakeDB> {
    let config = DbConfig::from_env();
    Ok(LakeDB::connect(config)?)
}

fn cmd_ingest(rest: &[String]) -> Result<()> {
    let mut path: Option<&str> = None;
    let mut claude_dir: Option<&str> = None;
    let mut memory_dir: Option<&str> = None;
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--claude-dir" if i + 1 < rest.len() => {
                claude_dir = Some(rest[i + 1].as_str());
                i += 2;
            }
            "--memory-dir" if i + 1 < rest.len() => {
                memory_dir = Some(rest[i + 1].as_str());
                i += 2;
            }
            other => {
                path = Some(other);
                i += 1;
            }
        }
    }

    let db = open_db()?;
    let device = device_name()?;
    tracing::info!("🚀 datalake v{} 设备 {}", env!("CARGO_PKG_VERSION"), device);

    let engine = IngestEngine::new(&db, device);
    let report = match path {
        Some(p) => engine.ingest_path(Path::new(p))?,
        None => {
            let mut config = SourceConfig::from_env();
            if let Some(dir) = claude_dir {
                config.claude_dir = expand_path(dir);
            }
            if let Some(dir) = memory_dir {
                config.memory_dir = expand_path(dir);
            }
            engine.ingest_all(&config)?
        }
    };

    println!(
        "新增: {}  跳过: {}  失败: {}",
        report.inserted, report.skipped, report.failed
    );
    for err in &report.errors {
        eprintln!("  ❌ {}", err);
    }
    if report.failed > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_push(rest: &[String]) -> Result<()> {
    if rest.len() < 3 {
        eprintln!("用法: push <设备> --ssh <host> 或 push <设备> --local-db <路径>");
        std::process::exit(1);
    }
    let target = rest[0].as_str();
    let db = open_db()?;
    let device = device_name()?;
    let engine = SyncEngine::new(&db, device);

    let report = match rest[1].as_str() {
        "--ssh" => engine.push(target, &SshTransport::new(rest[2].as_str()))?,
        "--local-db" => {
            let remote = LakeDB::connect(DbConfig::local(rest[2].as_str()))?;
            let transport = DirectTransport::new(&remote, target);
            engine.push(target, &transport)?
        }
        other => {
            eprintln!("❌ 未知选项: {}", other);
            std::process::exit(1);
        }
    };

    println!("批次 {} 状态: {}", report.batch_id, report.status);
    println!(
        "发送: {}  应用: {}  跳过: {}",
        report.records_sent, report.records_applied, report.records_skipped
    );
    if let Some(err) = &report.error {
        eprintln!("  ❌ {}", err);
    }
    if report.status != SyncStatus::Success {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_apply(rest: &[String]) -> Result<()> {
    let mut json_file: Option<&str> = None;
    let mut db_path: Option<&str> = None;
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--json" if i + 1 < rest.len() => {
                json_file = Some(rest[i + 1].as_str());
                i += 2;
            }
            "--db" if i + 1 < rest.len() => {
                db_path = Some(rest[i + 1].as_str());
                i += 2;
            }
            _ => i += 1,
        }
    }
    let file = match json_file {
        Some(f) => f,
        None => {
            eprintln!("用法: apply --json <批次文件> [--db <路径>]");
            std::process::exit(1);
        }
    };

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("读取批次文件失败: {}", file))?;
    let batch: SyncBatch = serde_json::from_str(&raw).context("批次 JSON 解析失败")?;

    let db = match db_path {
        Some(p) => LakeDB::connect(DbConfig::local(p))?,
        None => open_db()?,
    };
    let device = device_name()?;
    let engine = SyncEngine::new(&db, device);
    let report = engine.apply(&batch)?;

    // stdout 只有这一行，推送端按 ApplyReport 解析；
    // 退出码反映"是否产出报告"，应用结果看 status 字段
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn cmd_search(rest: &[String]) -> Result<()> {
    if rest.is_empty() {
        eprintln!("用法: search <关键词> [--history]");
        std::process::exit(1);
    }
    let query = rest[0].as_str();
    let db = open_db()?;

    if rest.iter().any(|a| a == "--history") {
        let hits = db.search_history(query, 20)?;
        println!("命中 {} 条历史", hits.len());
        for hit in hits {
            println!("[{}] {}", hit.session_id, hit.snippet);
        }
    } else {
        let hits = db.search_messages(query, 20)?;
        println!("命中 {} 条消息", hits.len());
        for hit in hits {
            println!("[{} {}] {}", hit.session_id, hit.r#type, hit.snippet);
        }
    }
    Ok(())
}

fn cmd_stats() -> Result<()> {
    let db = open_db()?;
    let stats = db.get_stats()?;

    println!("设备: {}", stats.device_count);
    println!("会话: {}", stats.conversation_count);
    println!("消息: {}", stats.message_count);
    println!("命令历史: {}", stats.history_count);
    println!("内存采样: {}", stats.metric_count);
    println!("内存事件: {}", stats.event_count);
    println!(
        "tokens: 输入 {} / 输出 {}",
        stats.total_input_tokens, stats.total_output_tokens
    );
    Ok(())
}

fn cmd_check(rest: &[String]) -> Result<()> {
    let db = open_db()?;
    let report = db.check_aggregates()?;

    println!("已检查会话: {}", report.conversations_checked);
    if report.drifted.is_empty() {
        println!("聚合字段一致 ✅");
        return Ok(());
    }

    println!("聚合漂移: {}", report.drifted.len());
    for session_id in &report.drifted {
        println!("  {}", session_id);
    }

    if rest.iter().any(|a| a == "--repair") {
        let fixed = db.repair_aggregates()?;
        println!("已修复: {}", fixed);
    } else {
        eprintln!("加 --repair 重算并修复");
        std::process::exit(2);
    }
    Ok(())
}
