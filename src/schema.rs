//! 테이블 스키마 캐시 (Schema Registry)
//!
//! 필터를 통과한 테이블만 메타데이터 조회 후 캐싱합니다.
//! DDL로 무효화된 항목은 다음 접근 시 다시 조회됩니다.

use crate::error::{CdcError, Result};
use crate::events::CellValue;
use crate::filter::{qualified_name, TableFilter};
use crate::offset::BinlogPosition;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 컬럼 타입 분류 (값 정규화 기준)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// 정수 계열. 비트 폭 (TINYINT=8, SMALLINT=16, MEDIUMINT=24, INT=32, BIGINT=64)
    Integer(u8),
    Float,
    Double,
    Decimal,
    Text,
    Blob,
    Date,
    DateTime,
    Time,
    Year,
    Json,
    Enum,
    Set,
    Bit,
    Other,
}

impl ColumnKind {
    /// `INFORMATION_SCHEMA.COLUMNS.COLUMN_TYPE` 문자열에서 분류
    pub fn from_column_type(column_type: &str) -> Self {
        let lower = column_type.trim().to_ascii_lowercase();
        let base = lower
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or("");

        match base {
            "tinyint" | "bool" | "boolean" => ColumnKind::Integer(8),
            "smallint" => ColumnKind::Integer(16),
            "mediumint" => ColumnKind::Integer(24),
            "int" | "integer" => ColumnKind::Integer(32),
            "bigint" => ColumnKind::Integer(64),
            "float" => ColumnKind::Float,
            "double" | "real" => ColumnKind::Double,
            "decimal" | "numeric" => ColumnKind::Decimal,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" => {
                ColumnKind::Text
            }
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                ColumnKind::Blob
            }
            "date" => ColumnKind::Date,
            "datetime" | "timestamp" => ColumnKind::DateTime,
            "time" => ColumnKind::Time,
            "year" => ColumnKind::Year,
            "json" => ColumnKind::Json,
            "enum" => ColumnKind::Enum,
            "set" => ColumnKind::Set,
            "bit" => ColumnKind::Bit,
            _ => ColumnKind::Other,
        }
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    /// 선언된 타입 원문 (e.g., "mediumint(8) unsigned")
    pub column_type: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub unsigned: bool,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>, nullable: bool) -> Self {
        let column_type = column_type.into();
        let unsigned = column_type.to_ascii_lowercase().contains("unsigned");
        TableColumn {
            name: name.into(),
            kind: ColumnKind::from_column_type(&column_type),
            column_type,
            nullable,
            unsigned,
        }
    }

    /// 값 하나를 이 컬럼의 표준 표현으로 변환
    pub fn normalize(&self, value: CellValue) -> CellValue {
        if value.is_null() {
            return value;
        }

        match self.kind {
            ColumnKind::Integer(bits) => self.normalize_integer(value, bits),
            ColumnKind::Year => match value {
                CellValue::String(s) => s.trim().parse().map(CellValue::Int64).unwrap_or(CellValue::String(s)),
                other => other.as_i64().map(CellValue::Int64).unwrap_or(other),
            },
            ColumnKind::Float => match value {
                CellValue::String(s) => s.parse().map(CellValue::Float).unwrap_or(CellValue::String(s)),
                CellValue::Double(d) => CellValue::Float(d as f32),
                other => other,
            },
            ColumnKind::Double => match value {
                CellValue::String(s) => s.parse().map(CellValue::Double).unwrap_or(CellValue::String(s)),
                CellValue::Float(f) => CellValue::Double(f as f64),
                other => other,
            },
            ColumnKind::Decimal => match value {
                CellValue::String(s) => CellValue::Decimal(s),
                CellValue::Double(d) => CellValue::Decimal(d.to_string()),
                other => other,
            },
            ColumnKind::DateTime => match value {
                CellValue::String(s) => parse_datetime(&s)
                    .map(CellValue::DateTime)
                    .unwrap_or(CellValue::String(s)),
                other => other,
            },
            ColumnKind::Date => match value {
                CellValue::String(s) => CellValue::Date(s),
                other => other,
            },
            ColumnKind::Time => match value {
                CellValue::String(s) => CellValue::Time(s),
                other => other,
            },
            ColumnKind::Json => match value {
                CellValue::String(s) => serde_json::from_str(&s)
                    .map(CellValue::Json)
                    .unwrap_or(CellValue::String(s)),
                CellValue::Bytes(b) => serde_json::from_slice(&b)
                    .map(CellValue::Json)
                    .unwrap_or(CellValue::Bytes(b)),
                other => other,
            },
            ColumnKind::Blob => match value {
                CellValue::String(s) => CellValue::Bytes(s.into_bytes()),
                other => other,
            },
            ColumnKind::Text | ColumnKind::Enum | ColumnKind::Set => match value {
                CellValue::Bytes(b) => match String::from_utf8(b) {
                    Ok(s) => CellValue::String(s),
                    Err(e) => CellValue::Bytes(e.into_bytes()),
                },
                other => other,
            },
            ColumnKind::Bit | ColumnKind::Other => value,
        }
    }

    fn normalize_integer(&self, value: CellValue, bits: u8) -> CellValue {
        let value = match value {
            CellValue::String(s) => {
                let trimmed = s.trim();
                if let Ok(v) = trimmed.parse::<i64>() {
                    CellValue::Int64(v)
                } else if let Ok(v) = trimmed.parse::<u64>() {
                    CellValue::UInt64(v)
                } else {
                    return CellValue::String(s);
                }
            }
            other => other,
        };

        if let Some(v) = value.as_i64() {
            if !self.unsigned {
                return CellValue::Int64(v);
            }
            // 음수로 들어온 unsigned 값은 컬럼 비트 폭으로 재해석
            let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
            return CellValue::UInt64(v as u64 & mask);
        }

        if let Some(v) = value.as_u64() {
            if self.unsigned {
                return CellValue::UInt64(v);
            }
            return i64::try_from(v).map(CellValue::Int64).unwrap_or(CellValue::UInt64(v));
        }

        value
    }
}

fn parse_datetime(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc())
}

/// 테이블 스키마
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub columns: Vec<TableColumn>,
    /// 기본키 컬럼 인덱스 (선언 순서)
    pub pk_columns: Vec<usize>,
}

impl TableSchema {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        TableSchema {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            pk_columns: Vec::new(),
        }
    }

    pub fn add_column(&mut self, name: &str, column_type: &str, nullable: bool) -> usize {
        self.columns.push(TableColumn::new(name, column_type, nullable));
        self.columns.len() - 1
    }

    /// 이름으로 기본키 컬럼 지정. 없는 컬럼이면 false
    pub fn mark_primary_key(&mut self, name: &str) -> bool {
        match self.find_column(name) {
            Some(idx) => {
                if !self.pk_columns.contains(&idx) {
                    self.pk_columns.push(idx);
                }
                true
            }
            None => false,
        }
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn qualified_name(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }

    /// 행의 기본키 값들
    pub fn pk_values<'a>(&self, row: &'a [CellValue]) -> Result<Vec<&'a CellValue>> {
        self.pk_columns
            .iter()
            .map(|&idx| {
                row.get(idx).ok_or_else(|| {
                    CdcError::Other(format!(
                        "{} row has {} values, primary key column index {}",
                        self.qualified_name(),
                        row.len(),
                        idx
                    ))
                })
            })
            .collect()
    }

    /// 행 값을 컬럼별 표준 표현으로 변환. 스키마보다 긴 행의 나머지 값은 그대로 둠
    pub fn normalize_row(&self, row: Vec<CellValue>) -> Vec<CellValue> {
        row.into_iter()
            .enumerate()
            .map(|(idx, value)| match self.columns.get(idx) {
                Some(column) => column.normalize(value),
                None => value,
            })
            .collect()
    }
}

/// 외부 메타데이터 조회 인터페이스
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// 테이블 메타데이터 조회. 테이블이 없으면 `Ok(None)`
    async fn fetch_table(&self, schema: &str, table: &str) -> Result<Option<TableSchema>>;

    /// 소스 서버의 현재 binlog 위치
    async fn master_position(&self) -> Result<BinlogPosition>;

    /// 세션 종료 시 연결 자원 해제
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 필터 + 메타데이터 캐시
///
/// 조회는 디스패치 경로 밖에서도 호출될 수 있으므로 내부 잠금을 사용.
/// 잠금은 메타데이터 조회 await 동안 유지하지 않음.
pub struct SchemaRegistry {
    filter: TableFilter,
    provider: Arc<dyn MetadataProvider>,
    tables: Mutex<HashMap<String, Arc<TableSchema>>>,
}

impl SchemaRegistry {
    pub fn new(filter: TableFilter, provider: Arc<dyn MetadataProvider>) -> Self {
        SchemaRegistry {
            filter,
            provider,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, schema: &str, table: &str) -> Result<Arc<TableSchema>> {
        if !self.filter.matches(schema, table) {
            return Err(CdcError::excluded(schema, table));
        }

        let key = qualified_name(schema, table);
        let cached = self.tables.lock().get(&key).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        debug!("Fetching table metadata for {}", key);
        let fetched = self
            .provider
            .fetch_table(schema, table)
            .await?
            .ok_or_else(|| CdcError::not_found(schema, table))?;

        let fetched = Arc::new(fetched);
        self.tables.lock().insert(key, fetched.clone());
        Ok(fetched)
    }

    /// 캐시 항목 제거. 없는 항목 제거도 에러 아님
    pub fn invalidate(&self, schema: &str, table: &str) {
        let key = qualified_name(schema, table);
        if self.tables.lock().remove(&key).is_some() {
            debug!("Invalidated cached schema for {}", key);
        }
        self.filter.invalidate(schema, table);
    }

    /// 이전 이름과 새 이름 모두 비캐시 상태로. 새 이름은 다음 접근 시 필터 재평가 후 조회됨
    pub fn rename(&self, old_schema: &str, old_table: &str, new_schema: &str, new_table: &str) {
        debug!(
            "Table renamed {} -> {}",
            qualified_name(old_schema, old_table),
            qualified_name(new_schema, new_table)
        );
        self.invalidate(old_schema, old_table);
        self.invalidate(new_schema, new_table);
    }

    pub fn cached(&self, schema: &str, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.lock().get(&qualified_name(schema, table)).cloned()
    }

    pub fn filter(&self) -> &TableFilter {
        &self.filter
    }

    pub fn provider(&self) -> &Arc<dyn MetadataProvider> {
        &self.provider
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("filter", &self.filter)
            .field("cached", &self.tables.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataProvider for CountingProvider {
        async fn fetch_table(&self, schema: &str, table: &str) -> Result<Option<TableSchema>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if table == "missing" {
                return Ok(None);
            }
            let mut t = TableSchema::new(schema, table);
            t.add_column("id", "int(11)", false);
            t.mark_primary_key("id");
            Ok(Some(t))
        }

        async fn master_position(&self) -> Result<BinlogPosition> {
            Ok(BinlogPosition::new("mysql-bin.000001", 4))
        }
    }

    fn registry(exclude: &[&str]) -> (SchemaRegistry, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        let filter = TableFilter::new(&[], &exclude).unwrap();
        (SchemaRegistry::new(filter, provider.clone()), provider)
    }

    #[tokio::test]
    async fn test_get_caches_until_invalidated() {
        let (registry, provider) = registry(&[]);

        registry.get("shop", "orders").await.unwrap();
        registry.get("shop", "orders").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        registry.invalidate("shop", "orders");
        registry.get("shop", "orders").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        // 없는 항목 무효화는 에러가 아님
        registry.invalidate("shop", "nothing");
    }

    #[tokio::test]
    async fn test_excluded_table_skips_introspection() {
        let (registry, provider) = registry(&[r".*\..*_inner"]);
        let err = registry.get("test", "canal_test_inner").await.unwrap_err();
        assert!(err.is_excluded());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_table() {
        let (registry, _) = registry(&[]);
        let err = registry.get("shop", "missing").await.unwrap_err();
        assert!(matches!(err, CdcError::TableNotFound { .. }));
        assert!(registry.cached("shop", "missing").is_none());
    }

    #[tokio::test]
    async fn test_rename_leaves_both_names_uncached() {
        let (registry, provider) = registry(&[]);
        registry.get("shop", "a").await.unwrap();
        // 이전 스키마로 캐시된 새 이름도 버려야 함
        registry.get("shop", "b").await.unwrap();
        registry.rename("shop", "a", "shop", "b");
        assert!(registry.cached("shop", "a").is_none());
        assert!(registry.cached("shop", "b").is_none());

        registry.get("shop", "b").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_column_kind_from_type() {
        assert_eq!(
            ColumnKind::from_column_type("mediumint(8) unsigned"),
            ColumnKind::Integer(24)
        );
        assert_eq!(ColumnKind::from_column_type("VARCHAR(255)"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_column_type("enum('a','b')"), ColumnKind::Enum);
        assert_eq!(ColumnKind::from_column_type("datetime(6)"), ColumnKind::DateTime);
    }

    #[test]
    fn test_normalize_unsigned_integers() {
        let col = TableColumn::new("m", "mediumint(8) unsigned", true);
        assert!(col.unsigned);
        assert_eq!(col.normalize(CellValue::Int32(-1)), CellValue::UInt64(16777215));
        assert_eq!(col.normalize(CellValue::Int32(5)), CellValue::UInt64(5));
        assert_eq!(
            col.normalize(CellValue::String("16777215".to_string())),
            CellValue::UInt64(16777215)
        );

        let big = TableColumn::new("b", "bigint(20) unsigned", false);
        assert_eq!(big.normalize(CellValue::Int64(-1)), CellValue::UInt64(u64::MAX));

        let signed = TableColumn::new("s", "tinyint(4)", false);
        assert_eq!(signed.normalize(CellValue::Int8(-3)), CellValue::Int64(-3));
        assert_eq!(signed.normalize(CellValue::Null), CellValue::Null);
    }

    #[test]
    fn test_normalize_row_text_values() {
        let mut table = TableSchema::new("shop", "orders");
        table.add_column("id", "int(11)", false);
        table.add_column("created", "datetime", true);
        table.add_column("payload", "json", true);
        table.add_column("raw", "blob", true);

        let row = table.normalize_row(vec![
            CellValue::String("7".to_string()),
            CellValue::String("2024-01-02 03:04:05".to_string()),
            CellValue::String(r#"{"k":1}"#.to_string()),
            CellValue::String("ab".to_string()),
            CellValue::String("extra".to_string()),
        ]);

        assert_eq!(row[0], CellValue::Int64(7));
        match &row[1] {
            CellValue::DateTime(dt) => assert_eq!(dt.to_rfc3339(), "2024-01-02T03:04:05+00:00"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(row[2], CellValue::Json(serde_json::json!({"k": 1})));
        assert_eq!(row[3], CellValue::Bytes(b"ab".to_vec()));
        assert_eq!(row[4], CellValue::String("extra".to_string()));
    }

    #[test]
    fn test_pk_values() {
        let mut table = TableSchema::new("shop", "orders");
        table.add_column("a", "int", false);
        table.add_column("b", "int", false);
        assert!(table.mark_primary_key("b"));
        assert!(!table.mark_primary_key("zzz"));

        let row = vec![CellValue::Int64(1), CellValue::Int64(2)];
        assert_eq!(table.pk_values(&row).unwrap(), vec![&CellValue::Int64(2)]);
        assert!(table.pk_values(&row[..1]).is_err());
    }
}
