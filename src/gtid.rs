//! GTID (Global Transaction ID) 관리
//!
//! GTID 형식: UUID:sequence-number
//! 여러 서버의 GTID 집합을 추적: "uuid1:1-100:200,uuid2:1-50"

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// GTID 범위 (sequence 범위, 양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 || start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {}-{}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    pub fn covers(&self, other: &GtidRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        // 겹치거나 연접한 범위만 병합
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let invalid = || CdcError::GtidError(format!("Invalid interval: {}", s));
        match s.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
                let end = end.trim().parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(start, end)
            }
            None => {
                let seq = s.trim().parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(seq, seq)
            }
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// 단일 트랜잭션 식별자 (source UUID + 트랜잭션 번호)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub sid: Uuid,
    pub gno: u64,
}

impl Gtid {
    pub fn new(sid: Uuid, gno: u64) -> Self {
        Gtid { sid, gno }
    }

    pub fn parse(gtid: &str) -> Result<Self> {
        let (sid, gno) = gtid
            .trim()
            .split_once(':')
            .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", gtid)))?;
        let sid = parse_sid(sid)?;
        let gno = gno
            .parse::<u64>()
            .map_err(|_| CdcError::GtidError(format!("Invalid sequence: {}", gno)))?;
        if gno == 0 {
            return Err(CdcError::GtidError(format!("Invalid sequence: {}", gno)));
        }
        Ok(Gtid { sid, gno })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sid.hyphenated(), self.gno)
    }
}

impl FromStr for Gtid {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        Gtid::parse(s)
    }
}

fn parse_sid(sid: &str) -> Result<Uuid> {
    Uuid::parse_str(sid.trim())
        .map_err(|e| CdcError::GtidError(format!("Invalid source UUID {}: {}", sid, e)))
}

/// UUID별 GTID 범위들 (정렬되고 병합된 상태를 유지)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UUIDGtidSet {
    pub uuid: String,
    pub ranges: Vec<GtidRange>,
}

impl UUIDGtidSet {
    pub fn new(uuid: String) -> Self {
        UUIDGtidSet {
            uuid,
            ranges: Vec::new(),
        }
    }

    pub fn add_gtid(&mut self, sequence: u64) -> Result<()> {
        self.add_range(GtidRange::new(sequence, sequence)?);
        Ok(())
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&range) {
                    Some(m) => *last = m,
                    None => merged.push(range),
                },
                None => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }

    pub fn contains_range(&self, range: &GtidRange) -> bool {
        self.ranges.iter().any(|r| r.covers(range))
    }
}

impl fmt::Display for UUIDGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)?;
        for range in &self.ranges {
            write!(f, ":{}", range)?;
        }
        Ok(())
    }
}

/// 전체 GTID 집합 (여러 UUID)
///
/// 트랜잭션이 적용될수록 단조 증가하며, 병합은 source UUID별로
/// 멱등이고 교환 법칙이 성립한다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    pub sets: BTreeMap<String, UUIDGtidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 문자열 파싱 (format: "uuid1:1-100:200,uuid2:1-50")
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();

        let gtid_str = gtid_str.trim();
        if gtid_str.is_empty() || gtid_str.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        // SHOW MASTER STATUS 결과에는 쉼표 뒤에 개행이 포함될 수 있음
        for part in gtid_str.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut fields = part.split(':');
            let sid = parse_sid(fields.next().unwrap_or_default())?;
            let mut uuid_set = UUIDGtidSet::new(sid.hyphenated().to_string());
            for interval in fields {
                uuid_set.add_range(GtidRange::parse(interval)?);
            }
            if uuid_set.ranges.is_empty() {
                return Err(CdcError::GtidError(format!("Missing interval: {}", part)));
            }

            gtid_set.merge_uuid_set(&uuid_set);
        }

        Ok(gtid_set)
    }

    /// 커밋된 트랜잭션 추가. 처음 보는 source UUID는 새로 등록됨
    pub fn add_gtid(&mut self, gtid: &Gtid) {
        let uuid = gtid.sid.hyphenated().to_string();
        let uuid_set = self
            .sets
            .entry(uuid.clone())
            .or_insert_with(|| UUIDGtidSet::new(uuid));
        uuid_set.add_range(GtidRange {
            start: gtid.gno,
            end: gtid.gno,
        });
    }

    /// 다른 집합을 병합 (합집합)
    pub fn merge(&mut self, other: &GtidSet) {
        for uuid_set in other.sets.values() {
            self.merge_uuid_set(uuid_set);
        }
    }

    fn merge_uuid_set(&mut self, other: &UUIDGtidSet) {
        let entry = self
            .sets
            .entry(other.uuid.clone())
            .or_insert_with(|| UUIDGtidSet::new(other.uuid.clone()));
        for range in &other.ranges {
            entry.add_range(*range);
        }
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.sets
            .get(&gtid.sid.hyphenated().to_string())
            .map(|s| s.contains(gtid.gno))
            .unwrap_or(false)
    }

    /// `other`의 모든 트랜잭션을 포함하는지 (부분 순서의 ⊇)
    pub fn contains_set(&self, other: &GtidSet) -> bool {
        other.sets.iter().all(|(uuid, other_set)| {
            if other_set.ranges.is_empty() {
                return true;
            }
            match self.sets.get(uuid) {
                Some(set) => other_set.ranges.iter().all(|r| set.contains_range(r)),
                None => false,
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(|(_, set)| set.ranges.is_empty())
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for uuid_set in self.sets.values().filter(|s| !s.ranges.is_empty()) {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", uuid_set)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "550e8400-e29b-41d4-a716-446655440000";
    const SID2: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[test]
    fn test_gtid_parse() {
        let gtid_str = format!("{}:1-100:200:300-400", SID);
        let gtid_set = GtidSet::parse(&gtid_str).unwrap();
        let set = &gtid_set.sets[SID];
        assert_eq!(set.ranges.len(), 3);
        assert_eq!(gtid_set.to_string(), gtid_str);
    }

    #[test]
    fn test_gtid_parse_multiple_sources_with_newline() {
        let gtid_str = format!("{}:1-5,\n{}:1-3", SID2.to_uppercase(), SID);
        let gtid_set = GtidSet::parse(&gtid_str).unwrap();
        assert_eq!(gtid_set.sets.len(), 2);
        assert!(gtid_set.contains(&Gtid::parse(&format!("{}:5", SID2)).unwrap()));
        assert!(!gtid_set.contains(&Gtid::parse(&format!("{}:4", SID)).unwrap()));
    }

    #[test]
    fn test_gtid_parse_empty() {
        assert!(GtidSet::parse("").unwrap().is_empty());
        assert!(GtidSet::parse("NULL").unwrap().is_empty());
    }

    #[test]
    fn test_gtid_parse_invalid() {
        assert!(GtidSet::parse("not-a-uuid:1-5").is_err());
        assert!(GtidSet::parse(&format!("{}:5-1", SID)).is_err());
        assert!(GtidSet::parse(SID).is_err());
        assert!(Gtid::parse(&format!("{}:0", SID)).is_err());
    }

    #[test]
    fn test_gtid_contains() {
        let mut gtid_set = GtidSet::new();
        gtid_set.add_gtid(&Gtid::parse(&format!("{}:50", SID)).unwrap());
        assert!(gtid_set.contains(&Gtid::parse(&format!("{}:50", SID)).unwrap()));
        assert!(!gtid_set.contains(&Gtid::parse(&format!("{}:51", SID)).unwrap()));
    }

    #[test]
    fn test_add_gtid_coalesces_adjacent() {
        let mut gtid_set = GtidSet::parse(&format!("{}:1-3:5", SID)).unwrap();
        gtid_set.add_gtid(&Gtid::parse(&format!("{}:4", SID)).unwrap());
        assert_eq!(gtid_set.to_string(), format!("{}:1-5", SID));
    }

    #[test]
    fn test_first_seen_source_is_added() {
        let mut gtid_set = GtidSet::parse(&format!("{}:1-3", SID)).unwrap();
        gtid_set.add_gtid(&Gtid::new(Uuid::parse_str(SID2).unwrap(), 7));
        assert_eq!(gtid_set.sets.len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent_and_commutative() {
        let a = GtidSet::parse(&format!("{}:1-10,{}:1-2", SID, SID2)).unwrap();
        let b = GtidSet::parse(&format!("{}:5-20:30", SID)).unwrap();

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let mut twice = ab.clone();
        twice.merge(&b);
        assert_eq!(twice, ab);
        assert_eq!(ab.sets[SID].to_string(), format!("{}:1-20:30", SID));
    }

    #[test]
    fn test_contains_set_partial_order() {
        let big = GtidSet::parse(&format!("{}:1-100,{}:1-5", SID, SID2)).unwrap();
        let small = GtidSet::parse(&format!("{}:3-50", SID)).unwrap();
        let other = GtidSet::parse(&format!("{}:99-101", SID)).unwrap();

        assert!(big.contains_set(&small));
        assert!(!small.contains_set(&big));
        assert!(!big.contains_set(&other));
        assert!(big.contains_set(&GtidSet::new()));
    }
}
