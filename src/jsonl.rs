//! 增量 JSONL 读取
//!
//! 从上次记录的字节偏移续读源文件，提供：
//! - 尾部残行检测（写入方尚未补全换行的行不消费，留待下次）
//! - 空行消费但跳过
//! - 文件轮转/截断检测（file_key 变化或文件变小时从头重读）
//!
//! 偏移推进只计算以换行符结束的完整行，崩溃后重跑不会跳过或重复完整行。

use crate::error::Result;
use crate::types::SourceFileState;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// 一条完整行（1-based 行号为文件内真实行号）
#[derive(Debug, Clone)]
pub struct RawLine {
    pub line_no: u64,
    pub text: String,
}

/// 一次增量读取的结果
#[derive(Debug, Clone)]
pub struct ReadChunk {
    /// 本次新读到的非空完整行
    pub lines: Vec<RawLine>,
    /// 消费完整行后的新偏移（尾部残行不计入）
    pub next_offset: u64,
    /// 已消费的行数（含空行）
    pub next_line_no: u64,
    /// 读取时的文件大小
    pub file_size: u64,
    /// 当前文件标识
    pub file_key: Option<String>,
    /// 检测到轮转/截断，本次从头读
    pub reset: bool,
}

impl ReadChunk {
    /// 偏移是否有推进（无新内容时跳过提交）
    pub fn advanced(&self, state: Option<&SourceFileState>) -> bool {
        match state {
            Some(s) => self.reset || self.next_offset != s.byte_offset,
            None => true,
        }
    }
}

/// 计算文件标识（设备号:inode，Windows 上为卷序列号:文件索引）
///
/// 同名路径被轮转替换后标识会变化，用于触发重读。
pub fn file_key(path: &Path) -> Option<String> {
    match file_id::get_file_id(path) {
        Ok(file_id::FileId::Inode {
            device_id,
            inode_number,
        }) => Some(format!("{}:{}", device_id, inode_number)),
        Ok(file_id::FileId::LowRes {
            volume_serial_number,
            file_index,
        }) => Some(format!("{}:{}", volume_serial_number, file_index)),
        Ok(file_id::FileId::HighRes {
            volume_serial_number,
            file_id,
        }) => Some(format!("{}:{}", volume_serial_number, file_id)),
        Err(_) => None,
    }
}

/// 从上次进度续读文件，返回新增的完整行
///
/// `state` 为 None 时从头读。文件不存在时返回 Io 错误，由调用方决定跳过或报错。
pub fn read_incremental(path: &Path, state: Option<&SourceFileState>) -> Result<ReadChunk> {
    let metadata = std::fs::metadata(path)?;
    let file_size = metadata.len();
    let key = file_key(path);

    // 轮转/截断检测：标识变化或文件变小都从头重读
    let (start_offset, start_line_no, reset) = match state {
        Some(s) => {
            let key_changed = match (&s.file_key, &key) {
                (Some(old), Some(new)) => old != new,
                _ => false,
            };
            if key_changed || file_size < s.byte_offset {
                tracing::info!(
                    "源文件已轮转或截断，从头重读: {:?} (offset {} -> 0)",
                    path,
                    s.byte_offset
                );
                (0, 0, true)
            } else {
                (s.byte_offset, s.line_no, false)
            }
        }
        None => (0, 0, false),
    };

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start_offset))?;
    let mut reader = BufReader::new(file);

    let mut lines = Vec::new();
    let mut offset = start_offset;
    let mut line_no = start_line_no;
    let mut buf: Vec<u8> = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            // 尾部残行：不消费，下次从这里续读
            tracing::trace!("尾部残行 ({} 字节)，留待下次: {:?}", n, path);
            break;
        }

        offset += n as u64;
        line_no += 1;

        let text = String::from_utf8_lossy(&buf);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }

        lines.push(RawLine {
            line_no,
            text: trimmed.to_string(),
        });
    }

    Ok(ReadChunk {
        lines,
        next_offset: offset,
        next_line_no: line_no,
        file_size,
        file_key: key,
        reset,
    })
}
