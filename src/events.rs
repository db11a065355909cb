//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의
//!
//! 디코더(외부)가 만들어 스트림으로 넘겨주는 이벤트와, 엔진이 핸들러에게
//! 전달하는 행 이벤트를 정의합니다.

use crate::offset::SourceInfo;
use crate::schema::TableSchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent = 2,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 설명 이벤트
    FormatDescriptionEvent = 15,
    /// XID 이벤트 (트랜잭션 커밋)
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    /// 하트비트 이벤트
    HeartbeatEvent = 27,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 36,
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치 (가짜 이벤트는 0)
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn new(event_type: EventType, next_pos: u32) -> Self {
        EventHeader {
            timestamp: 0,
            event_type,
            server_id: 0,
            event_length: 0,
            next_pos,
            flags: 0,
        }
    }
}

/// WRITE_ROWS 이벤트 데이터
///
/// 테이블 맵 해석은 디코더 몫이므로 스키마/테이블명이 함께 전달됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRowsData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 행 데이터들
    pub rows: Vec<Vec<CellValue>>,
}

/// UPDATE_ROWS 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRowsData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 변경 전후 데이터 쌍들
    pub rows: Vec<(Vec<CellValue>, Vec<CellValue>)>,
}

/// DELETE_ROWS 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRowsData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 행 데이터들
    pub rows: Vec<Vec<CellValue>>,
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(String),
    Time(String),
    Decimal(String),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s) => Some(s.clone()),
            CellValue::Int64(i) => Some(i.to_string()),
            CellValue::UInt64(u) => Some(u.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::Decimal(d) => Some(d.clone()),
            CellValue::DateTime(dt) => Some(dt.to_rfc3339()),
            CellValue::Null => Some("NULL".to_string()),
            _ => None,
        }
    }

    /// 부호 있는 정수 계열 값
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            CellValue::Int8(v) => Some(v as i64),
            CellValue::Int16(v) => Some(v as i64),
            CellValue::Int32(v) => Some(v as i64),
            CellValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// 부호 없는 정수 계열 값
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            CellValue::UInt8(v) => Some(v as u64),
            CellValue::UInt16(v) => Some(v as u64),
            CellValue::UInt32(v) => Some(v as u64),
            CellValue::UInt64(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    /// GTID 문자열 (format: uuid:sequence-number)
    pub gtid: String,
    /// 커밋 플래그
    pub committed: bool,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    /// 쿼리 실행 시점의 기본 데이터베이스
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// XID 이벤트 데이터 (트랜잭션 커밋)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XidEventData {
    pub xid: u64,
}

/// 모든 Binlog 이벤트를 포함하는 열거형
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BinlogEventData {
    WriteRows(WriteRowsData),
    UpdateRows(UpdateRowsData),
    DeleteRows(DeleteRowsData),
    Query(QueryEventData),
    Rotate(RotateEventData),
    Gtid(GtidEventData),
    Xid(XidEventData),
    Heartbeat,
    RowsQuery(String),
    Unknown(Vec<u8>),
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub data: BinlogEventData,
}

/// 행 변경 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::Delete => "delete",
        }
    }
}

/// 핸들러에게 전달되는 행 이벤트
///
/// `rows`의 값은 캐시된 `TableSchema` 기준으로 정규화되어 있습니다.
/// UPDATE는 변경 전/후 행이 번갈아 들어갑니다 (`[before, after, before, after, ...]`).
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub table: Arc<TableSchema>,
    pub action: RowAction,
    pub rows: Vec<Vec<CellValue>>,
    /// 이 행들이 귀속되는 좌표
    pub source: SourceInfo,
}

impl RowsEvent {
    /// 컬럼명 기준의 ChangeEvent로 변환
    pub fn to_change_events(&self) -> Vec<ChangeEvent> {
        let op = OperationType::from(self.action);
        let timestamp = DateTime::<Utc>::from_timestamp(self.source.ts_sec as i64, 0)
            .filter(|_| self.source.ts_sec > 0)
            .unwrap_or_else(Utc::now);

        let change = |before: Option<&Vec<CellValue>>, after: Option<&Vec<CellValue>>| ChangeEvent {
            gtid: self.source.gtid.clone(),
            op,
            timestamp,
            database: self.table.schema.clone(),
            table: self.table.name.clone(),
            key: after.or(before).and_then(|row| self.key_values(row)),
            before: before.map(|row| self.column_map(row)),
            after: after.map(|row| self.column_map(row)),
            query: None,
        };

        match self.action {
            RowAction::Insert => self.rows.iter().map(|row| change(None, Some(row))).collect(),
            RowAction::Delete => self.rows.iter().map(|row| change(Some(row), None)).collect(),
            RowAction::Update => self
                .rows
                .chunks(2)
                .filter(|pair| pair.len() == 2)
                .map(|pair| change(Some(&pair[0]), Some(&pair[1])))
                .collect(),
        }
    }

    /// 기본키가 없거나 행이 짧으면 None
    fn key_values(&self, row: &[CellValue]) -> Option<Vec<CellValue>> {
        if self.table.pk_columns.is_empty() {
            return None;
        }
        let values = self.table.pk_values(row).ok()?;
        Some(values.into_iter().cloned().collect())
    }

    fn column_map(&self, row: &[CellValue]) -> HashMap<String, CellValue> {
        self.table
            .columns
            .iter()
            .zip(row.iter())
            .map(|(col, value)| (col.name.clone(), value.clone()))
            .collect()
    }
}

/// CDC 변경 이벤트 (application-level view)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// GTID (있는 경우)
    pub gtid: Option<String>,
    /// 연산 타입 (INSERT, UPDATE, DELETE, DDL)
    pub op: OperationType,
    /// 타임스탬프
    pub timestamp: DateTime<Utc>,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 기본키 값 (기본키가 있는 테이블)
    pub key: Option<Vec<CellValue>>,
    /// 변경 전 데이터 (UPDATE/DELETE의 경우)
    pub before: Option<HashMap<String, CellValue>>,
    /// 변경 후 데이터 (INSERT/UPDATE의 경우)
    pub after: Option<HashMap<String, CellValue>>,
    /// 원본 쿼리 (DDL의 경우)
    pub query: Option<String>,
}

impl ChangeEvent {
    /// DDL 쿼리 이벤트를 ChangeEvent로 변환
    pub fn ddl(query: &QueryEventData) -> Self {
        ChangeEvent {
            gtid: None,
            op: OperationType::Ddl,
            timestamp: Utc::now(),
            database: query.database.clone(),
            table: String::new(),
            key: None,
            before: None,
            after: None,
            query: Some(query.query.clone()),
        }
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    Ddl,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Ddl => "DDL",
        }
    }
}

impl From<RowAction> for OperationType {
    fn from(action: RowAction) -> Self {
        match action {
            RowAction::Insert => OperationType::Insert,
            RowAction::Update => OperationType::Update,
            RowAction::Delete => OperationType::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::BinlogPosition;

    fn users_table() -> Arc<TableSchema> {
        let mut table = TableSchema::new("shop", "users");
        table.add_column("id", "int(11)", false);
        table.add_column("name", "varchar(100)", true);
        table.mark_primary_key("id");
        Arc::new(table)
    }

    #[test]
    fn test_update_to_change_events() {
        let event = RowsEvent {
            table: users_table(),
            action: RowAction::Update,
            rows: vec![
                vec![CellValue::Int64(1), CellValue::String("a".to_string())],
                vec![CellValue::Int64(1), CellValue::String("b".to_string())],
            ],
            source: SourceInfo::new(1, &BinlogPosition::new("mysql-bin.000001", 400)),
        };

        let changes = event.to_change_events();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.op, OperationType::Update);
        assert_eq!(change.key, Some(vec![CellValue::Int64(1)]));
        assert_eq!(
            change.before.as_ref().unwrap()["name"],
            CellValue::String("a".to_string())
        );
        assert_eq!(
            change.after.as_ref().unwrap()["name"],
            CellValue::String("b".to_string())
        );
    }

    #[test]
    fn test_binlog_event_json() {
        let event = BinlogEvent {
            header: EventHeader::new(EventType::XidEvent, 1024),
            data: BinlogEventData::Xid(XidEventData { xid: 9 }),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: BinlogEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.header.next_pos, 1024);
        assert!(matches!(back.data, BinlogEventData::Xid(XidEventData { xid: 9 })));
    }
}
