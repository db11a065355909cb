//! DDL 분류기
//!
//! SQL 파서가 만든 구문 트리에서 영향받는 (schema, table) 목록을 추출합니다.
//! 백틱/주석은 파서 단계에서 이미 정리되므로 여기서는 스키마 기본값 적용과
//! 대상 목록 전개만 담당합니다.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{ObjectName, ObjectType, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlKind {
    Create,
    Alter,
    RenameFrom,
    RenameTo,
    Drop,
}

impl DdlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DdlKind::Create => "create",
            DdlKind::Alter => "alter",
            DdlKind::RenameFrom => "rename-from",
            DdlKind::RenameTo => "rename-to",
            DdlKind::Drop => "drop",
        }
    }
}

/// DDL 구문에서 추출한 대상 테이블 하나
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlTarget {
    pub kind: DdlKind,
    pub schema: String,
    pub table: String,
}

impl DdlTarget {
    fn from_name(kind: DdlKind, name: &ObjectName, current_schema: &str) -> Self {
        let parts = &name.0;
        let table = parts.last().map(|i| i.value.clone()).unwrap_or_default();
        let schema = match parts.len() {
            0 | 1 => current_schema.to_string(),
            n => parts[n - 2].value.clone(),
        };
        DdlTarget {
            kind,
            schema,
            table,
        }
    }
}

impl fmt::Display for DdlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.kind.as_str(), self.schema, self.table)
    }
}

/// MySQL 문법으로 쿼리 파싱
pub fn parse_query(sql: &str) -> Result<Vec<Statement>> {
    Ok(Parser::parse_sql(&MySqlDialect {}, sql)?)
}

/// 구문 하나를 대상 목록으로 분류. DDL이 아니면 빈 목록
pub fn classify(statement: &Statement, current_schema: &str) -> Vec<DdlTarget> {
    match statement {
        Statement::CreateTable(create) => {
            vec![DdlTarget::from_name(DdlKind::Create, &create.name, current_schema)]
        }
        Statement::AlterTable { name, .. } => {
            vec![DdlTarget::from_name(DdlKind::Alter, name, current_schema)]
        }
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            ..
        } => names
            .iter()
            .map(|name| DdlTarget::from_name(DdlKind::Drop, name, current_schema))
            .collect(),
        Statement::RenameTable(renames) => renames
            .iter()
            .flat_map(|rename| {
                [
                    DdlTarget::from_name(DdlKind::RenameFrom, &rename.old_name, current_schema),
                    DdlTarget::from_name(DdlKind::RenameTo, &rename.new_name, current_schema),
                ]
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// 쿼리 문자열 전체를 파싱 후 분류 (세미콜론으로 이어진 여러 구문 포함)
pub fn classify_query(sql: &str, current_schema: &str) -> Result<Vec<DdlTarget>> {
    let statements = parse_query(sql)?;
    Ok(statements
        .iter()
        .flat_map(|stmt| classify(stmt, current_schema))
        .collect())
}
