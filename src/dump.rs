//! 초기 스냅샷 (mysqldump)
//!
//! 덤프는 스냅샷 시점의 binlog 좌표를 먼저 보고한 뒤 행을 하나씩 넘깁니다.
//! 엔진은 이 좌표를 모든 행이 전달된 다음에 트래커에 반영합니다.

use crate::config::DumpConfig;
use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::events::CellValue;
use crate::gtid::GtidSet;
use crate::offset::BinlogPosition;
use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 덤프 결과를 받는 쪽
#[async_trait]
pub trait DumpSink: Send {
    /// 스냅샷 좌표. 첫 행보다 먼저 한 번 호출됨
    async fn on_coordinate(&mut self, position: BinlogPosition, gtid_set: Option<GtidSet>) -> Result<()>;

    /// 덤프된 행 하나 (값은 텍스트 그대로, 정규화 전)
    async fn on_row(&mut self, schema: &str, table: &str, values: Vec<CellValue>) -> Result<()>;
}

#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(&self, sink: &mut dyn DumpSink) -> Result<()>;
}

/// mysqldump 실행 파일 기반 덤퍼
#[derive(Debug, Clone)]
pub struct MysqldumpDumper {
    connection: ConnectionConfig,
    config: DumpConfig,
}

impl MysqldumpDumper {
    pub fn new(connection: ConnectionConfig, config: DumpConfig) -> Self {
        MysqldumpDumper { connection, config }
    }

    /// 명령행 인자 구성
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--host={}", self.connection.hostname),
            format!("--port={}", self.connection.port),
            format!("--user={}", self.connection.username),
            "--master-data".to_string(),
            "--single-transaction".to_string(),
            "--skip-lock-tables".to_string(),
            "--compact".to_string(),
            "--skip-opt".to_string(),
            "--quick".to_string(),
            "--no-create-info".to_string(),
            "--skip-extended-insert".to_string(),
            "--hex-blob".to_string(),
        ];
        if !self.connection.password.is_empty() {
            args.push(format!("--password={}", self.connection.password));
        }
        if let Some(clause) = &self.config.where_clause {
            args.push(format!("--where={}", clause));
        }
        args.extend(self.config.extra_options.iter().cloned());

        if !self.config.tables.is_empty() {
            args.push(self.config.table_db.clone());
            args.extend(self.config.tables.iter().cloned());
        } else {
            args.push("--databases".to_string());
            args.extend(self.config.databases.iter().cloned());
        }
        args
    }
}

#[async_trait]
impl Dumper for MysqldumpDumper {
    async fn dump(&self, sink: &mut dyn DumpSink) -> Result<()> {
        info!("Running {} for snapshot", self.config.execution_path);

        let mut child = Command::new(&self.config.execution_path)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CdcError::DumpError(format!("failed to start {}: {}", self.config.execution_path, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CdcError::DumpError("dump stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut parser = DumpParser::new(&self.config.table_db)?;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            parser.feed(&line, sink).await?;
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            if self.config.discard_err {
                warn!("Dump exited with {}, ignoring: {}", status, stderr.trim());
            } else {
                return Err(CdcError::DumpError(format!(
                    "dump exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }
        }

        parser.finish(sink).await?;
        info!("Dump finished, {} rows", parser.rows());
        Ok(())
    }
}

/// mysqldump 출력 한 줄의 해석 결과
#[derive(Debug, Clone, PartialEq)]
pub enum DumpLine {
    Position(BinlogPosition),
    GtidPurged(String),
    Use(String),
    Insert { table: String, values: Vec<CellValue> },
    Other,
}

/// mysqldump 출력 파서
pub struct DumpParser {
    change_master: Regex,
    gtid_purged: Regex,
    use_db: Regex,
    insert: Regex,
    current_db: String,
    position: Option<BinlogPosition>,
    gtid_set: Option<GtidSet>,
    /// 여러 줄에 걸친 GTID_PURGED 문 (닫는 따옴표 전까지)
    pending_gtid: Option<String>,
    coordinate_sent: bool,
    rows: u64,
}

impl DumpParser {
    pub fn new(default_db: &str) -> Result<Self> {
        Ok(DumpParser {
            change_master: Regex::new(
                r"^(?:-- )?CHANGE (?:MASTER|REPLICATION SOURCE) TO (?:MASTER|SOURCE)_LOG_FILE='([^']+)', (?:MASTER|SOURCE)_LOG_POS=(\d+);",
            )?,
            gtid_purged: Regex::new(r"GTID_PURGED=(?:/\*!\d+ '\+'\*/ )?'([^']*)'")?,
            use_db: Regex::new(r"^USE `([^`]+)`;")?,
            insert: Regex::new(r"^INSERT INTO `([^`]+)` VALUES \((.*)\);$")?,
            current_db: default_db.to_string(),
            position: None,
            gtid_set: None,
            pending_gtid: None,
            coordinate_sent: false,
            rows: 0,
        })
    }

    pub fn parse_line(&self, line: &str) -> Result<DumpLine> {
        if let Some(caps) = self.insert.captures(line) {
            return Ok(DumpLine::Insert {
                table: caps[1].to_string(),
                values: parse_values(&caps[2])?,
            });
        }
        if let Some(caps) = self.change_master.captures(line) {
            let position = caps[2]
                .parse()
                .map_err(|_| CdcError::DumpError(format!("invalid binlog position in '{}'", line)))?;
            return Ok(DumpLine::Position(BinlogPosition::new(&caps[1], position)));
        }
        if let Some(caps) = self.gtid_purged.captures(line) {
            return Ok(DumpLine::GtidPurged(caps[1].to_string()));
        }
        if let Some(caps) = self.use_db.captures(line) {
            return Ok(DumpLine::Use(caps[1].to_string()));
        }
        Ok(DumpLine::Other)
    }

    pub async fn feed(&mut self, line: &str, sink: &mut dyn DumpSink) -> Result<()> {
        // 소스 UUID가 여럿이면 mysqldump는 GTID_PURGED 값을 여러 줄로 나눠 씀
        let joined;
        let line = match self.pending_gtid.take() {
            Some(mut pending) => {
                pending.push_str(line.trim());
                if !self.gtid_purged.is_match(&pending) {
                    self.pending_gtid = Some(pending);
                    return Ok(());
                }
                joined = pending;
                joined.as_str()
            }
            None if line.contains("GTID_PURGED=") && !self.gtid_purged.is_match(line) => {
                self.pending_gtid = Some(line.trim_end().to_string());
                return Ok(());
            }
            None => line,
        };

        match self.parse_line(line)? {
            DumpLine::Position(pos) => {
                debug!("Dump coordinate {}", pos);
                self.position = Some(pos);
            }
            DumpLine::GtidPurged(raw) => {
                let set = GtidSet::parse(&raw)?;
                self.gtid_set.get_or_insert_with(GtidSet::new).merge(&set);
            }
            DumpLine::Use(db) => self.current_db = db,
            DumpLine::Insert { table, values } => {
                self.flush_coordinate(sink).await?;
                self.rows += 1;
                sink.on_row(&self.current_db, &table, values).await?;
            }
            DumpLine::Other => {}
        }
        Ok(())
    }

    /// 행이 하나도 없었던 경우에도 좌표는 보고
    pub async fn finish(&mut self, sink: &mut dyn DumpSink) -> Result<()> {
        if let Some(pending) = self.pending_gtid.take() {
            return Err(CdcError::DumpError(format!(
                "unterminated GTID_PURGED statement: {}",
                pending
            )));
        }
        self.flush_coordinate(sink).await
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    async fn flush_coordinate(&mut self, sink: &mut dyn DumpSink) -> Result<()> {
        if self.coordinate_sent {
            return Ok(());
        }
        let position = self.position.clone().ok_or_else(|| {
            CdcError::DumpError("dump output has no binlog coordinate before data".to_string())
        })?;
        self.coordinate_sent = true;
        sink.on_coordinate(position, self.gtid_set.clone()).await
    }
}

/// `VALUES (...)` 안의 값 목록 파싱
///
/// 작은따옴표 문자열(백슬래시 이스케이프), `NULL`, `0x` 16진 리터럴을 처리하고
/// 나머지(숫자 등)는 원문 문자열로 둡니다.
pub fn parse_values(input: &str) -> Result<Vec<CellValue>> {
    let mut values = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.peek() {
            None => break,
            Some('\'') => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(CdcError::DumpError(format!(
                                "unterminated string in values: {}",
                                input
                            )))
                        }
                        Some('\\') => match chars.next() {
                            Some('0') => s.push('\0'),
                            Some('n') => s.push('\n'),
                            Some('r') => s.push('\r'),
                            Some('t') => s.push('\t'),
                            Some('b') => s.push('\x08'),
                            Some('Z') => s.push('\x1a'),
                            Some(c) => s.push(c),
                            None => {
                                return Err(CdcError::DumpError(format!(
                                    "dangling escape in values: {}",
                                    input
                                )))
                            }
                        },
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            s.push('\'');
                        }
                        Some('\'') => break,
                        Some(c) => s.push(c),
                    }
                }
                values.push(CellValue::String(s));
            }
            Some(_) => {
                let mut raw = String::new();
                while let Some(c) = chars.next_if(|&c| c != ',') {
                    raw.push(c);
                }
                values.push(literal_value(raw.trim())?);
            }
        }

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.next() {
            None => break,
            Some(',') => continue,
            Some(c) => {
                return Err(CdcError::DumpError(format!(
                    "unexpected '{}' in values: {}",
                    c, input
                )))
            }
        }
    }
    Ok(values)
}

fn literal_value(raw: &str) -> Result<CellValue> {
    if raw.eq_ignore_ascii_case("NULL") {
        return Ok(CellValue::Null);
    }
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return decode_hex(hex).map(CellValue::Bytes);
    }
    Ok(CellValue::String(raw.to_string()))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(CdcError::DumpError(format!("invalid hex literal 0x{}", hex)));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| CdcError::DumpError(format!("invalid hex literal 0x{}", hex)))
        })
        .collect()
}
