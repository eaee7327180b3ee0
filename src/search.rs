//! 搜索功能

use crate::db::LakeDB;
use crate::error::Result;
use crate::types::{HistorySearchResult, SearchResult};
use rusqlite::params;

/// 转义 FTS5 查询中的特殊字符
///
/// FTS5 把 `-` `.` `*` `"` `(` `)` `^` `+` `:` 当作语法。
/// 对每个词单独用双引号包裹，用 OR 连接，实现"匹配任一关键词"的搜索。
fn escape_fts5_query(query: &str) -> String {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|word| {
            // 内部双引号需要转义（两个双引号表示一个字面双引号）
            let escaped = word.replace('"', "\"\"");
            format!("\"{}\"", escaped)
        })
        .collect();

    if terms.is_empty() {
        return String::new();
    }

    if terms.len() == 1 {
        return terms.into_iter().next().unwrap();
    }

    terms.join(" OR ")
}

impl LakeDB {
    /// 消息全文搜索
    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.search_messages_with_session(query, limit, None)
    }

    /// 消息全文搜索 (可限定在一个会话内)
    pub fn search_messages_with_session(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let escaped_query = escape_fts5_query(query);
        if escaped_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();

        let (sql, params_vec): (&str, Vec<Box<dyn rusqlite::ToSql>>) = if let Some(session) =
            session_id
        {
            (
                r#"
                SELECT
                    m.id,
                    m.session_id,
                    m.uuid,
                    m.type,
                    snippet(messages_fts, 0, '<mark>', '</mark>', '...', 64) as snippet,
                    bm25(messages_fts) as score,
                    m.timestamp
                FROM messages_fts
                JOIN messages m ON messages_fts.rowid = m.id
                WHERE messages_fts MATCH ?1
                  AND m.session_id = ?2
                ORDER BY score
                LIMIT ?3
                "#,
                vec![
                    Box::new(escaped_query) as Box<dyn rusqlite::ToSql>,
                    Box::new(session.to_string()),
                    Box::new(limit as i64),
                ],
            )
        } else {
            (
                r#"
                SELECT
                    m.id,
                    m.session_id,
                    m.uuid,
                    m.type,
                    snippet(messages_fts, 0, '<mark>', '</mark>', '...', 64) as snippet,
                    bm25(messages_fts) as score,
                    m.timestamp
                FROM messages_fts
                JOIN messages m ON messages_fts.rowid = m.id
                WHERE messages_fts MATCH ?1
                ORDER BY score
                LIMIT ?2
                "#,
                vec![
                    Box::new(escaped_query) as Box<dyn rusqlite::ToSql>,
                    Box::new(limit as i64),
                ],
            )
        };

        let mut stmt = conn.prepare(sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok(SearchResult {
                message_id: row.get(0)?,
                session_id: row.get(1)?,
                uuid: row.get(2)?,
                r#type: row.get(3)?,
                snippet: row.get(4)?,
                score: row.get(5)?,
                timestamp: row.get(6)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 命令历史全文搜索
    pub fn search_history(&self, query: &str, limit: usize) -> Result<Vec<HistorySearchResult>> {
        let escaped_query = escape_fts5_query(query);
        if escaped_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT
                h.session_id,
                snippet(history_fts, 0, '<mark>', '</mark>', '...', 32) as snippet,
                bm25(history_fts) as score,
                h.timestamp
            FROM history_fts
            JOIN history_entries h ON history_fts.rowid = h.id
            WHERE history_fts MATCH ?1
            ORDER BY score
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![escaped_query, limit as i64], |row| {
            Ok(HistorySearchResult {
                session_id: row.get(0)?,
                snippet: row.get(1)?,
                score: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
