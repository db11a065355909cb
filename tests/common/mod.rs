//! 엔진 통합 테스트용 공용 가짜 구현
//!
//! 통합 테스트 파일에서 `mod common;`으로 가져옵니다.

use async_trait::async_trait;
use mysql_canal::dump::{DumpSink, Dumper};
use mysql_canal::events::*;
use mysql_canal::gtid::{Gtid, GtidSet};
use mysql_canal::offset::{BinlogPosition, SourceInfo};
use mysql_canal::schema::{MetadataProvider, TableSchema};
use mysql_canal::stream::{channel_source, SourceFeed};
use mysql_canal::{CdcConfig, CdcEngine, CdcError, EventHandler, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

// ============================================================================
// 메타데이터
// ============================================================================

/// 조회 횟수를 세는 메모리 메타데이터 소스
#[derive(Default)]
pub struct FakeMetadata {
    tables: Mutex<HashMap<String, TableSchema>>,
    master: Mutex<BinlogPosition>,
    calls: AtomicUsize,
    closes: AtomicUsize,
}

#[allow(dead_code)]
impl FakeMetadata {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeMetadata::default())
    }

    pub fn set_table(&self, table: TableSchema) {
        self.tables.lock().insert(table.qualified_name(), table);
    }

    pub fn set_master(&self, position: BinlogPosition) {
        *self.master.lock() = position;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataProvider for FakeMetadata {
    async fn fetch_table(&self, schema: &str, table: &str) -> Result<Option<TableSchema>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.lock().get(&format!("{}.{}", schema, table)).cloned())
    }

    async fn master_position(&self) -> Result<BinlogPosition> {
        Ok(self.master.lock().clone())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// `test.canal_test (id int unsigned pk, name varchar)`
#[allow(dead_code)]
pub fn canal_test_table() -> TableSchema {
    let mut table = TableSchema::new("test", "canal_test");
    table.add_column("id", "int(10) unsigned", false);
    table.add_column("name", "varchar(100)", true);
    table.mark_primary_key("id");
    table
}

/// canal_test와 같은 컬럼의 `test.<name>`
#[allow(dead_code)]
pub fn named_table(name: &str) -> TableSchema {
    let mut table = canal_test_table();
    table.name = name.to_string();
    table
}

// ============================================================================
// 덤프
// ============================================================================

/// 고정 좌표와 고정 행을 보고하는 덤퍼
#[derive(Default)]
pub struct ScriptedDumper {
    pub position: BinlogPosition,
    pub gtid_set: Option<GtidSet>,
    pub rows: Vec<(String, String, Vec<CellValue>)>,
    /// 끝나지 않음 (덤프 중 종료 테스트용)
    pub hang: bool,
}

#[async_trait]
impl Dumper for ScriptedDumper {
    async fn dump(&self, sink: &mut dyn DumpSink) -> Result<()> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        sink.on_coordinate(self.position.clone(), self.gtid_set.clone())
            .await?;
        for (schema, table, values) in &self.rows {
            sink.on_row(schema, table, values.clone()).await?;
        }
        Ok(())
    }
}

// ============================================================================
// 핸들러
// ============================================================================

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Record {
    Row {
        action: RowAction,
        table: String,
        columns: usize,
        rows: Vec<Vec<CellValue>>,
        source: SourceInfo,
    },
    Ddl(String),
    TableChanged(String),
    Rotate(BinlogPosition),
    Xid(BinlogPosition),
    Gtid(String),
    PosSynced {
        pos: BinlogPosition,
        gtid_set: Option<String>,
        forced: bool,
    },
    Error(String),
}

/// 모든 콜백을 공유 로그에 기록하는 핸들러
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub log: Arc<Mutex<Vec<Record>>>,
    /// 이 테이블의 on_row는 실패
    pub fail_on_table: Option<String>,
    /// on_xid 기록 후 대기 시간
    pub xid_delay: Option<Duration>,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn records(&self) -> Vec<Record> {
        self.log.lock().clone()
    }

    pub fn rows(&self) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| matches!(r, Record::Row { .. }))
            .collect()
    }

    /// 행/DDL 콜백을 전달 순서대로 짧은 문자열로
    pub fn change_log(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Row { action, table, .. } => Some(format!("{} {}", action.as_str(), table)),
                Record::Ddl(query) => Some(format!("ddl {}", query)),
                _ => None,
            })
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(r, Record::PosSynced { forced: false, .. }))
            .count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_rotate(&mut self, next: &BinlogPosition) -> Result<()> {
        self.log.lock().push(Record::Rotate(next.clone()));
        Ok(())
    }

    async fn on_table_changed(&mut self, schema: &str, table: &str) -> Result<()> {
        self.log
            .lock()
            .push(Record::TableChanged(format!("{}.{}", schema, table)));
        Ok(())
    }

    async fn on_ddl(&mut self, _next_pos: &BinlogPosition, query: &QueryEventData) -> Result<()> {
        self.log.lock().push(Record::Ddl(query.query.clone()));
        Ok(())
    }

    async fn on_row(&mut self, event: &RowsEvent) -> Result<()> {
        if self.fail_on_table.as_deref() == Some(event.table.name.as_str()) {
            return Err(CdcError::Other("boom".to_string()));
        }
        self.log.lock().push(Record::Row {
            action: event.action,
            table: event.table.qualified_name(),
            columns: event.table.columns.len(),
            rows: event.rows.clone(),
            source: event.source.clone(),
        });
        Ok(())
    }

    async fn on_xid(&mut self, next_pos: &BinlogPosition) -> Result<()> {
        self.log.lock().push(Record::Xid(next_pos.clone()));
        if let Some(delay) = self.xid_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn on_gtid(&mut self, gtid: &Gtid) -> Result<()> {
        self.log.lock().push(Record::Gtid(gtid.to_string()));
        Ok(())
    }

    async fn on_pos_synced(
        &mut self,
        pos: &BinlogPosition,
        gtid_set: Option<&GtidSet>,
        forced: bool,
    ) -> Result<()> {
        self.log.lock().push(Record::PosSynced {
            pos: pos.clone(),
            gtid_set: gtid_set.map(|s| s.to_string()),
            forced,
        });
        Ok(())
    }

    async fn on_error(&mut self, err: &CdcError) {
        self.log.lock().push(Record::Error(err.to_string()));
    }

    fn name(&self) -> &str {
        "RecordingHandler"
    }
}

// ============================================================================
// 엔진
// ============================================================================

#[allow(dead_code)]
pub fn config(include: &[&str], exclude: &[&str]) -> CdcConfig {
    CdcConfig {
        include_table_regex: include.iter().map(|s| s.to_string()).collect(),
        exclude_table_regex: exclude.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn engine(
    config: CdcConfig,
    metadata: Arc<FakeMetadata>,
    handler: RecordingHandler,
) -> (CdcEngine, SourceFeed) {
    let (source, feed) = channel_source(64);
    let engine = CdcEngine::new(config, metadata, Arc::new(source), Box::new(handler))
        .expect("valid engine config");
    (engine, feed)
}

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// 이벤트 생성
// ============================================================================

fn event(event_type: EventType, next_pos: u32, data: BinlogEventData) -> BinlogEvent {
    let mut header = EventHeader::new(event_type, next_pos);
    header.server_id = 1;
    header.timestamp = 1_700_000_000;
    BinlogEvent { header, data }
}

#[allow(dead_code)]
pub fn insert(schema: &str, table: &str, next_pos: u32, rows: Vec<Vec<CellValue>>) -> BinlogEvent {
    event(
        EventType::WriteRowsEvent,
        next_pos,
        BinlogEventData::WriteRows(WriteRowsData {
            table_id: 1,
            database: schema.to_string(),
            table: table.to_string(),
            rows,
        }),
    )
}

#[allow(dead_code)]
pub fn update(
    schema: &str,
    table: &str,
    next_pos: u32,
    rows: Vec<(Vec<CellValue>, Vec<CellValue>)>,
) -> BinlogEvent {
    event(
        EventType::UpdateRowsEvent,
        next_pos,
        BinlogEventData::UpdateRows(UpdateRowsData {
            table_id: 1,
            database: schema.to_string(),
            table: table.to_string(),
            rows,
        }),
    )
}

#[allow(dead_code)]
pub fn xid(next_pos: u32) -> BinlogEvent {
    event(
        EventType::XidEvent,
        next_pos,
        BinlogEventData::Xid(XidEventData { xid: next_pos as u64 }),
    )
}

#[allow(dead_code)]
pub fn query(schema: &str, sql: &str, next_pos: u32) -> BinlogEvent {
    event(
        EventType::QueryEvent,
        next_pos,
        BinlogEventData::Query(QueryEventData {
            thread_id: 1,
            exec_time: 0,
            database: schema.to_string(),
            query: sql.to_string(),
        }),
    )
}

#[allow(dead_code)]
pub fn rotate(next_binlog_name: &str) -> BinlogEvent {
    event(
        EventType::RotateEvent,
        0,
        BinlogEventData::Rotate(RotateEventData {
            next_binlog_name: next_binlog_name.to_string(),
            position: 4,
        }),
    )
}

#[allow(dead_code)]
pub fn gtid(gno: u64, next_pos: u32) -> BinlogEvent {
    event(
        EventType::GtidEvent,
        next_pos,
        BinlogEventData::Gtid(GtidEventData {
            gtid: format!("{}:{}", SID, gno),
            committed: true,
        }),
    )
}

#[allow(dead_code)]
pub fn int(v: i64) -> CellValue {
    CellValue::Int64(v)
}

#[allow(dead_code)]
pub fn text(v: &str) -> CellValue {
    CellValue::String(v.to_string())
}
