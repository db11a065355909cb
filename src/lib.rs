//! MySQL Binlog CDC (Change Data Capture) 엔진 코어
//!
//! 스냅샷 후 binlog 스트리밍으로 이어지는 복제 세션을 관리합니다.
//! 주요 기능:
//! - 테이블 include/exclude 필터
//! - 테이블 스키마 캐시와 DDL에 따른 무효화
//! - Binlog 위치 / GTID 추적과 재개
//! - 이벤트 핸들러로의 순서 보장 디스패치

pub mod cdc_engine;
pub mod config;
pub mod connection;
pub mod ddl;
pub mod dump;
pub mod error;
pub mod events;
pub mod filter;
pub mod gtid;
pub mod handler;
pub mod offset;
pub mod schema;
pub mod stream;

pub use cdc_engine::{CdcEngine, EngineHandle, EngineState};
pub use config::{CdcConfig, DumpConfig};
pub use connection::{ConnectionConfig, MySqlConnection};
pub use error::{CdcError, Result};
pub use events::{BinlogEvent, ChangeEvent, EventType, RowAction, RowsEvent};
pub use gtid::GtidSet;
pub use handler::{DummyEventHandler, EventHandler};
pub use offset::{BinlogPosition, Coordinate, SourceInfo};
pub use schema::{MetadataProvider, TableSchema};
