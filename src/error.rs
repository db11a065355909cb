//! CDC 관련 에러 타입

use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum CdcError {
    /// 필터에 의해 제외된 테이블. 재시도 대상이 아님
    #[error("제외된 테이블: {schema}.{table}")]
    ExcludedTable { schema: String, table: String },

    #[error("테이블을 찾을 수 없음: {schema}.{table}")]
    TableNotFound { schema: String, table: String },

    #[error("위치 역행: 현재 {current}, 요청 {requested}")]
    OutOfOrderPosition { current: String, requested: String },

    #[error("유효하지 않은 재개 모드: {0}")]
    InvalidResumeMode(String),

    #[error("Timeout 에러")]
    Timeout,

    #[error("세션이 이미 종료되었습니다")]
    SessionClosed,

    /// 이벤트 핸들러가 반환한 에러. 스트리밍을 중단시킨 원인으로 기록됨
    #[error("이벤트 핸들러 에러: {0}")]
    HandlerError(#[source] Box<CdcError>),

    #[error("설정 에러: {0}")]
    InvalidConfig(String),

    #[error("DDL 파싱 에러: {0}")]
    DdlParseError(String),

    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("덤프 에러: {0}")]
    DumpError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    pub fn excluded(schema: &str, table: &str) -> Self {
        CdcError::ExcludedTable {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn not_found(schema: &str, table: &str) -> Self {
        CdcError::TableNotFound {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    /// 핸들러 콜백 에러 래핑
    pub fn handler(err: CdcError) -> Self {
        match err {
            CdcError::HandlerError(_) => err,
            other => CdcError::HandlerError(Box::new(other)),
        }
    }

    pub fn is_excluded(&self) -> bool {
        matches!(self, CdcError::ExcludedTable { .. })
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<regex::Error> for CdcError {
    fn from(err: regex::Error) -> Self {
        CdcError::InvalidConfig(err.to_string())
    }
}

impl From<sqlparser::parser::ParserError> for CdcError {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        CdcError::DdlParseError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        CdcError::QueryError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
