//! 数据库迁移模块

use rusqlite::{Connection, Result as SqliteResult};
use tracing::{info, warn};

/// 迁移版本
const MIGRATION_VERSION: i64 = 2;

/// 初始化迁移系统
pub fn initialize_migrations(conn: &Connection) -> SqliteResult<()> {
    // 创建迁移版本表
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    Ok(())
}

/// 获取当前数据库版本
fn get_current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: SqliteResult<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        });

    match version {
        Ok(v) => Ok(v),
        Err(_) => Ok(0), // 如果表为空，返回 0
    }
}

/// 记录迁移版本
fn record_migration(conn: &Connection, version: i64) -> SqliteResult<()> {
    let current_time_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        [version, current_time_ms],
    )?;

    Ok(())
}

/// 检查表是否存在
fn table_exists(conn: &Connection, table: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// 检查列是否存在
fn column_exists(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt.query_map([], |row| {
        let col_name: String = row.get(1)?;
        Ok(col_name)
    })?;

    for col_name in columns.flatten() {
        if col_name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

/// 迁移 1: 添加会话整理字段 (tags / rating)
fn migration_001_add_curation_fields(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 001: Add conversation curation fields");

    // 如果表不存在，跳过迁移（schema 会创建完整表）
    if !table_exists(conn, "conversations")? {
        info!("conversations table does not exist, skipping migration (will be created by schema)");
        return Ok(());
    }

    if !column_exists(conn, "conversations", "tags")? {
        info!("Adding tags column");
        conn.execute("ALTER TABLE conversations ADD COLUMN tags TEXT", [])?;
    }

    if !column_exists(conn, "conversations", "rating")? {
        info!("Adding rating column");
        conn.execute("ALTER TABLE conversations ADD COLUMN rating INTEGER", [])?;
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_conversations_rating ON conversations(rating) WHERE rating IS NOT NULL",
        [],
    )?;

    info!("Migration 001 complete");
    Ok(())
}

/// 迁移 2: 添加源文件轮转检测字段 (file_key / line_no)
fn migration_002_add_rotation_fields(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 002: Add source rotation fields");

    // 如果表不存在，跳过迁移
    if !table_exists(conn, "source_files")? {
        info!("source_files table does not exist, skipping migration (will be created by schema)");
        return Ok(());
    }

    if !column_exists(conn, "source_files", "file_key")? {
        info!("Adding file_key column");
        conn.execute("ALTER TABLE source_files ADD COLUMN file_key TEXT", [])?;
    }

    if !column_exists(conn, "source_files", "line_no")? {
        info!("Adding line_no column");
        conn.execute(
            "ALTER TABLE source_files ADD COLUMN line_no INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    info!("Migration 002 complete");
    Ok(())
}

/// 执行所有待应用的迁移
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    // 初始化迁移系统
    initialize_migrations(conn)?;

    // 获取当前版本
    let current_version = get_current_version(conn)?;

    // 如果已经是最新版本，直接返回
    if current_version >= MIGRATION_VERSION {
        return Ok(());
    }
    info!("Current database version: {}", current_version);

    // 执行迁移（事务保证原子性）
    let tx = conn.unchecked_transaction()?;

    if current_version < 1 {
        match migration_001_add_curation_fields(&tx) {
            Ok(_) => {
                record_migration(&tx, 1)?;
                info!("Migration 1 applied");
            }
            Err(e) => {
                warn!("Migration 1 failed: {}", e);
                return Err(e);
            }
        }
    }

    if current_version < 2 {
        match migration_002_add_rotation_fields(&tx) {
            Ok(_) => {
                record_migration(&tx, 2)?;
                info!("Migration 2 applied");
            }
            Err(e) => {
                warn!("Migration 2 failed: {}", e);
                return Err(e);
            }
        }
    }

    // 提交事务
    tx.commit()?;

    info!(
        "All migrations applied successfully, current version: {}",
        MIGRATION_VERSION
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_migrations() {
        // 创建内存数据库
        let conn = Connection::open_in_memory().unwrap();

        // 创建基础 schema（模拟老版本数据库）
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL UNIQUE,
                device TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS source_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device TEXT NOT NULL,
                path TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                byte_offset INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .unwrap();

        // 运行迁移
        run_migrations(&conn).unwrap();

        // 验证迁移 1 的列是否存在
        assert!(column_exists(&conn, "conversations", "tags").unwrap());
        assert!(column_exists(&conn, "conversations", "rating").unwrap());

        // 验证迁移 2 的列是否存在
        assert!(column_exists(&conn, "source_files", "file_key").unwrap());
        assert!(column_exists(&conn, "source_files", "line_no").unwrap());

        // 验证版本
        assert_eq!(get_current_version(&conn).unwrap(), 2);

        // 再次运行迁移应该是幂等的
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_migrations_on_empty_db() {
        // 全新数据库：表不存在，迁移直接落版本号
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 2);
    }
}
