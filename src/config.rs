//! CDC 엔진 설정

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::filter::TableFilter;
use std::env;
use std::time::Duration;

/// 스냅샷(mysqldump) 설정
#[derive(Debug, Clone, Default)]
pub struct DumpConfig {
    /// mysqldump 실행 경로. 비어있으면 덤프 단계 생략
    pub execution_path: String,
    /// 덤프할 데이터베이스 목록
    pub databases: Vec<String>,
    /// `tables`가 속한 데이터베이스
    pub table_db: String,
    pub tables: Vec<String>,
    /// `--where` 조건
    pub where_clause: Option<String>,
    /// 실행 파일이 실패 코드로 끝나도 무시
    pub discard_err: bool,
    /// 추가 명령행 옵션
    pub extra_options: Vec<String>,
}

impl DumpConfig {
    pub fn is_enabled(&self) -> bool {
        !self.execution_path.is_empty()
    }
}

/// CDC 엔진 설정
#[derive(Debug, Clone)]
pub struct CdcConfig {
    pub connection: ConnectionConfig,
    /// 이벤트가 없을 때 하트비트로 간주하는 간격
    pub heartbeat_period: Duration,
    /// 이 시간 동안 이벤트가 없으면 스트리밍 실패
    pub read_timeout: Duration,
    pub dump: DumpConfig,
    pub include_table_regex: Vec<String>,
    pub exclude_table_regex: Vec<String>,
}

impl Default for CdcConfig {
    fn default() -> Self {
        CdcConfig {
            connection: ConnectionConfig::default(),
            heartbeat_period: Duration::from_secs(60),
            read_timeout: Duration::from_secs(90),
            dump: DumpConfig::default(),
            include_table_regex: Vec::new(),
            exclude_table_regex: Vec::new(),
        }
    }
}

impl CdcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_period.is_zero() {
            return Err(CdcError::InvalidConfig(
                "heartbeat_period must be greater than zero".to_string(),
            ));
        }
        if self.read_timeout <= self.heartbeat_period {
            return Err(CdcError::InvalidConfig(format!(
                "read_timeout ({:?}) must exceed heartbeat_period ({:?})",
                self.read_timeout, self.heartbeat_period
            )));
        }
        if self.dump.is_enabled() && self.dump.databases.is_empty() && self.dump.tables.is_empty() {
            return Err(CdcError::InvalidConfig(
                "dump needs databases or tables".to_string(),
            ));
        }
        if !self.dump.tables.is_empty() && self.dump.table_db.is_empty() {
            return Err(CdcError::InvalidConfig(
                "dump tables need table_db".to_string(),
            ));
        }
        self.table_filter().map(|_| ())
    }

    /// include/exclude 규칙으로 필터 생성
    pub fn table_filter(&self) -> Result<TableFilter> {
        TableFilter::new(&self.include_table_regex, &self.exclude_table_regex)
    }

    /// 환경 변수에서 설정 로드. 없는 변수는 기본값 유지
    pub fn from_env() -> Result<Self> {
        let mut config = CdcConfig::default();
        let conn = &mut config.connection;

        if let Ok(host) = env::var("DB_HOST") {
            conn.hostname = host;
        }
        if let Some(port) = parse_var::<u16>("DB_PORT")? {
            conn.port = port;
        }
        if let Ok(user) = env::var("DB_USER") {
            conn.username = user;
        }
        if let Ok(password) = env::var("DB_PASSWORD") {
            conn.password = password;
        }
        if let Ok(db) = env::var("DB_NAME") {
            conn.database = Some(db).filter(|d| !d.is_empty());
        }
        if let Some(server_id) = parse_var::<u32>("CDC_SERVER_ID")? {
            conn.server_id = server_id;
        }

        if let Some(ms) = parse_var::<u64>("CDC_HEARTBEAT_MS")? {
            config.heartbeat_period = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("CDC_READ_TIMEOUT_MS")? {
            config.read_timeout = Duration::from_millis(ms);
        }
        config.include_table_regex = list_var("CDC_INCLUDE_TABLES");
        config.exclude_table_regex = list_var("CDC_EXCLUDE_TABLES");

        if let Ok(path) = env::var("DUMP_EXECUTION_PATH") {
            config.dump.execution_path = path;
        }
        config.dump.databases = list_var("DUMP_DATABASES");
        if let Ok(db) = env::var("DUMP_TABLE_DB") {
            config.dump.table_db = db;
        }
        config.dump.tables = list_var("DUMP_TABLES");
        config.dump.where_clause = env::var("DUMP_WHERE").ok().filter(|w| !w.is_empty());

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CdcError::InvalidConfig(format!("{} is not valid: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn list_var(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| split_list(&raw))
        .unwrap_or_default()
}

/// 쉼표로 구분된 목록. 빈 항목은 제외
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        CdcConfig::default().validate().unwrap();
    }

    #[test]
    fn test_read_timeout_must_exceed_heartbeat() {
        let config = CdcConfig {
            heartbeat_period: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CdcError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_filter_regex() {
        let config = CdcConfig {
            exclude_table_regex: vec!["(".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dump_tables_need_db() {
        let mut config = CdcConfig::default();
        config.dump.execution_path = "mysqldump".to_string();
        config.dump.tables = vec!["canal_test".to_string()];
        assert!(config.validate().is_err());

        config.dump.table_db = "test".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(r".*\.canal_test, ,mysql\..*"),
            vec![r".*\.canal_test".to_string(), r"mysql\..*".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
