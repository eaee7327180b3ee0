//! datalake-db - 个人数据湖
//!
//! 把本机 AI CLI 的会话日志、命令历史和内存监控数据增量采集进单一
//! SQLite 数据库，并支持多台设备向 primary 推送合并。
//!
//! # 核心功能
//!
//! - **增量采集**: 按字节偏移续读 JSONL 源，natural key 幂等写入
//! - **全文搜索**: FTS5 支持（消息与命令历史）
//! - **跨设备同步**: push-only，表级 watermark + skip-if-present 应用
//! - **审计 ledger**: 每次同步两端各记一条
//!
//! # Feature Flags
//!
//! - `search`: 搜索能力 (依赖 `fts`)
//! - `fts`: FTS5 全文搜索
//! - `sync`: 跨设备同步
//!
//! # 架构
//!
//! 单写者模型：每台设备只有本机采集进程写本机库，primary 的合并写入
//! 只经过 apply 入口。并发读取方随时可以打开同一数据库（WAL）。

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jsonl;
pub mod migrations;
pub mod normalizer;
pub mod schema;
pub mod sources;
pub mod types;

#[cfg(feature = "search")]
pub mod search;

#[cfg(feature = "sync")]
pub mod sync;

// Re-exports
pub use config::{DbConfig, SourceConfig};
pub use db::{
    ChunkOutcome, ConversationInput, EventInput, HistoryInput, IngestChunk, LakeDB, MessageInput,
    MetricInput,
};
pub use error::{Error, Result};
pub use ingest::IngestEngine;
pub use sources::{SourceFile, SourceKind};
pub use types::*;

#[cfg(feature = "sync")]
pub use db::SyncLedgerInput;

#[cfg(feature = "sync")]
pub use sync::{
    ApplyReport, DirectTransport, SshTransport, SyncBatch, SyncEngine, SyncReport, SyncTransport,
};
