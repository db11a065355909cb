//! 테이블 include/exclude 필터
//!
//! 규칙은 "schema.table" 문자열에 대해 정규식으로 평가됩니다.
//! include 목록이 비어있지 않으면 최소 하나와 일치해야 하고,
//! 그 다음 exclude 규칙 중 어느 것과도 일치하지 않아야 통과합니다.
//! 대소문자 정규화는 하지 않습니다.

use crate::error::Result;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;

/// 사용자 exclude 규칙 뒤에 항상 추가되는 시스템 스키마 규칙
pub const SYSTEM_SCHEMA_EXCLUDE: &str = r"^mysql\.";

pub struct TableFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    cache: Mutex<HashMap<String, bool>>,
}

impl TableFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = include
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut exclude = exclude
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        exclude.push(Regex::new(SYSTEM_SCHEMA_EXCLUDE)?);

        Ok(TableFilter {
            include,
            exclude,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn matches(&self, schema: &str, table: &str) -> bool {
        let key = qualified_name(schema, table);
        if let Some(&hit) = self.cache.lock().get(&key) {
            return hit;
        }

        let matched = self.evaluate(&key);
        self.cache.lock().insert(key, matched);
        matched
    }

    fn evaluate(&self, key: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(key));
        // exclude는 include를 통과한 경우에만 검사
        included && !self.exclude.iter().any(|r| r.is_match(key))
    }

    /// 캐시된 판정 제거
    pub fn invalidate(&self, schema: &str, table: &str) {
        self.cache.lock().remove(&qualified_name(schema, table));
    }
}

impl std::fmt::Debug for TableFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFilter")
            .field("include", &self.include.iter().map(Regex::as_str).collect::<Vec<_>>())
            .field("exclude", &self.exclude.iter().map(Regex::as_str).collect::<Vec<_>>())
            .finish()
    }
}

pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rule_precedence() {
        let filter = TableFilter::new(&rules(&[r".*\.orders"]), &rules(&[r"sys\..*"])).unwrap();
        assert!(!filter.matches("sys", "orders"));
        assert!(filter.matches("shop", "orders"));
        assert!(!filter.matches("shop", "users"));
    }

    #[test]
    fn test_canal_rules() {
        let filter = TableFilter::new(
            &rules(&[r".*\.canal_test"]),
            &rules(&[r"mysql\..*", r".*\..*_inner"]),
        )
        .unwrap();
        assert!(filter.matches("test", "canal_test"));
        assert!(filter.matches("not_exist_db", "canal_test"));
        assert!(!filter.matches("test", "canal_test_inner"));
        assert!(!filter.matches("mysql", "canal_test"));
        assert!(!filter.matches("not_exist_db", "not_canal_test"));
    }

    #[test]
    fn test_empty_include_passes_unless_excluded() {
        let filter = TableFilter::new(&[], &rules(&[r"^tmp\."])).unwrap();
        assert!(filter.matches("shop", "orders"));
        assert!(!filter.matches("tmp", "orders"));
    }

    #[test]
    fn test_system_schema_cannot_be_included() {
        let filter = TableFilter::new(&rules(&[r"^mysql\.user$"]), &[]).unwrap();
        assert!(!filter.matches("mysql", "user"));
    }

    #[test]
    fn test_case_sensitive() {
        let filter = TableFilter::new(&rules(&[r"^shop\.orders$"]), &[]).unwrap();
        assert!(filter.matches("shop", "orders"));
        assert!(!filter.matches("Shop", "Orders"));
    }

    #[test]
    fn test_cache_and_invalidate() {
        let filter = TableFilter::new(&[], &[]).unwrap();
        assert!(filter.matches("a", "b"));
        assert_eq!(filter.cache.lock().len(), 1);
        filter.invalidate("a", "b");
        assert!(filter.cache.lock().is_empty());
        filter.invalidate("a", "b");
    }

    #[test]
    fn test_invalid_regex() {
        assert!(TableFilter::new(&rules(&["("]), &[]).is_err());
    }
}
