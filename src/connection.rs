//! MySQL 데이터베이스 연결 관리
//!
//! 메타데이터 조회(`INFORMATION_SCHEMA.COLUMNS`)와 마스터 상태 조회를 담당합니다.

use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use crate::offset::BinlogPosition;
use crate::schema::{MetadataProvider, TableSchema};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 복제 클라이언트 server id
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1001,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// "host:port"
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    fn build_opts(&self) -> Opts {
        let builder = OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone());
        Opts::from(builder)
    }
}

/// Binlog 상태 (`SHOW BINARY LOG STATUS` / `SHOW MASTER STATUS`)
#[derive(Debug, Clone)]
pub struct BinlogStatus {
    pub position: BinlogPosition,
    pub executed_gtid_set: Option<GtidSet>,
}

/// MySQL 연결 풀 래퍼
pub struct MySqlConnection {
    pool: Pool,
    config: ConnectionConfig,
}

impl MySqlConnection {
    /// 연결 풀 생성 후 한 번 접속해 연결 가능 여부 확인
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let pool = Pool::new(config.build_opts());
        let connection = MySqlConnection { pool, config };
        drop(connection.get_conn().await?);
        Ok(connection)
    }

    async fn get_conn(&self) -> Result<Conn> {
        tokio::time::timeout(self.config.timeout, self.pool.get_conn())
            .await
            .map_err(|_| CdcError::Timeout)?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Binlog 상태 조회. 8.4 이전 서버는 `SHOW MASTER STATUS`로 재시도
    pub async fn get_binlog_status(&self) -> Result<BinlogStatus> {
        let mut conn = self.get_conn().await?;
        let rows: Vec<Row> = match conn.query("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(e) => {
                debug!("SHOW BINARY LOG STATUS failed ({}), trying SHOW MASTER STATUS", e);
                conn.query("SHOW MASTER STATUS").await.map_err(|e| {
                    CdcError::QueryError(format!("Failed to query binlog status: {}", e))
                })?
            }
        };

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| CdcError::QueryError("No binlog status available".to_string()))?;

        let file: String = column(&row, 0)?;
        let position: u64 = column(&row, 1)?;
        let executed: Option<String> = row.get_opt::<Option<String>, _>(4).and_then(|r| r.ok()).flatten();

        let executed_gtid_set = match executed.filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(GtidSet::parse(&raw)?),
            None => None,
        };

        Ok(BinlogStatus {
            position: BinlogPosition::new(file, position),
            executed_gtid_set,
        })
    }

    /// GTID 모드 활성 여부 확인
    pub async fn is_gtid_mode_enabled(&self) -> Result<bool> {
        Ok(self
            .get_variable("GTID_MODE")
            .await?
            .map(|v| v.eq_ignore_ascii_case("ON"))
            .unwrap_or(false))
    }

    /// MySQL 서버 ID 조회
    pub async fn get_server_id(&self) -> Result<u32> {
        let mut conn = self.get_conn().await?;
        let result: Option<u32> = conn
            .query_first("SELECT @@server_id")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query server_id: {}", e)))?;

        Ok(result.unwrap_or(self.config.server_id))
    }

    /// 변수 조회
    pub async fn get_variable(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.get_conn().await?;
        let query = format!("SHOW GLOBAL VARIABLES LIKE '{}'", name);
        let result: Option<(String, String)> = conn
            .query_first(query)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.map(|(_, v)| v))
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&self) -> Result<String> {
        self.get_variable("binlog_format")
            .await?
            .ok_or_else(|| CdcError::QueryError("Binlog format not found".to_string()))
    }

    /// 행 단위 복제가 가능한 서버인지 확인
    pub async fn check_row_format(&self) -> Result<()> {
        let format = self.get_binlog_format().await?;
        if !format.eq_ignore_ascii_case("ROW") {
            return Err(CdcError::InvalidConfig(format!(
                "binlog_format must be ROW, server uses {}",
                format
            )));
        }
        Ok(())
    }

    /// 테이블 스키마 조회. 컬럼이 하나도 없으면 테이블이 없는 것으로 봄
    pub async fn get_table_schema(&self, database: &str, table: &str) -> Result<Option<TableSchema>> {
        let mut conn = self.get_conn().await?;
        let result: Vec<(String, String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database.to_string(), table.to_string()),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        if result.is_empty() {
            return Ok(None);
        }

        let mut schema = TableSchema::new(database, table);
        for (name, column_type, is_nullable, column_key) in result {
            let idx = schema.add_column(&name, &column_type, is_nullable == "YES");
            if column_key == "PRI" {
                schema.pk_columns.push(idx);
            }
        }
        Ok(Some(schema))
    }

    /// 연결 풀 종료. 이후 풀에서 연결을 얻으면 에러
    pub async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.pool.clone().disconnect().await {
            warn!("Error while closing MySQL pool: {}", e);
        }
        Ok(())
    }
}

fn column<T: FromValue>(row: &Row, idx: usize) -> Result<T> {
    row.get_opt::<T, _>(idx)
        .ok_or_else(|| CdcError::QueryError(format!("Missing column {} in status row", idx)))?
        .map_err(|e| CdcError::QueryError(format!("Invalid column {} in status row: {}", idx, e)))
}

#[async_trait]
impl MetadataProvider for MySqlConnection {
    async fn fetch_table(&self, schema: &str, table: &str) -> Result<Option<TableSchema>> {
        self.get_table_schema(schema, table).await
    }

    async fn master_position(&self) -> Result<BinlogPosition> {
        Ok(self.get_binlog_status().await?.position)
    }

    async fn close(&self) -> Result<()> {
        info!("Disconnecting from {}", self.config.addr());
        self.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.addr(), "localhost:3306");
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("127.0.0.1", "root");
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.username, "root");
    }

    #[test]
    fn test_build_opts_keeps_special_password() {
        let config = ConnectionConfig {
            password: "p@ss:word/1".to_string(),
            database: Some("test".to_string()),
            ..Default::default()
        };
        let opts = config.build_opts();
        assert_eq!(opts.pass(), Some("p@ss:word/1"));
        assert_eq!(opts.db_name(), Some("test"));
        assert_eq!(opts.tcp_port(), 3306);
    }
}
