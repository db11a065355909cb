//! Binlog 처리 위치 추적 (Offset 및 SourceInfo)
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치
//!
//! 위치 갱신은 디스패치 경로에서만 일어나고, `catch_up`은 다른 태스크에서
//! 동시에 호출될 수 있습니다.

use crate::error::{CdcError, Result};
use crate::gtid::{Gtid, GtidSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.filename.is_empty()
    }

    /// 같은 세그먼트(파일) 여부
    pub fn same_segment(&self, other: &BinlogPosition) -> bool {
        self.filename == other.filename
    }

    fn compare_segment(&self, other: &BinlogPosition) -> Ordering {
        match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.filename.cmp(&other.filename)),
            _ => self.filename.cmp(&other.filename),
        }
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_segment(other)
            .then_with(|| self.position.cmp(&other.position))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 재개 지점: 파일 위치 또는 GTID 집합 중 하나
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coordinate {
    Position(BinlogPosition),
    Gtid(GtidSet),
}

impl Coordinate {
    pub fn mode(&self) -> ResumeMode {
        match self {
            Coordinate::Position(_) => ResumeMode::Position,
            Coordinate::Gtid(_) => ResumeMode::Gtid,
        }
    }

    /// 재개할 위치가 없는 좌표 (처음부터 시작 → 스냅샷 필요)
    pub fn is_empty(&self) -> bool {
        match self {
            Coordinate::Position(pos) => pos.is_empty() || pos.position == 0,
            Coordinate::Gtid(set) => set.is_empty(),
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coordinate::Position(pos) => write!(f, "position {}", pos),
            Coordinate::Gtid(set) => write!(f, "gtid set '{}'", set),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeMode {
    Position,
    Gtid,
}

#[derive(Debug, Default)]
struct TrackerState {
    position: BinlogPosition,
    gtid_set: Option<GtidSet>,
    mode: Option<ResumeMode>,
}

/// 현재 복제 좌표를 보관하는 트래커
///
/// 쓰기는 디스패치 경로 하나에서만 발생. 위치 변경은 watch 채널로
/// 발행되어 `catch_up` 대기자가 깨어남.
#[derive(Debug)]
pub struct PositionTracker {
    state: RwLock<TrackerState>,
    position_tx: watch::Sender<BinlogPosition>,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionTracker {
    pub fn new() -> Self {
        let (position_tx, _) = watch::channel(BinlogPosition::default());
        PositionTracker {
            state: RwLock::new(TrackerState::default()),
            position_tx,
        }
    }

    /// 재개 좌표 설정. 세션 중간에 모드를 바꿀 수 없음
    pub fn resume_from(&self, coordinate: Coordinate) -> Result<()> {
        let mut state = self.state.write();
        if let Some(mode) = state.mode {
            if mode != coordinate.mode() {
                return Err(CdcError::InvalidResumeMode(format!(
                    "session already resumes by {:?}, cannot switch to {:?}",
                    mode,
                    coordinate.mode()
                )));
            }
        }

        state.mode = Some(coordinate.mode());
        match coordinate {
            Coordinate::Position(pos) => {
                state.position = pos.clone();
                drop(state);
                self.position_tx.send_replace(pos);
            }
            Coordinate::Gtid(set) => {
                state.gtid_set = Some(set);
            }
        }
        Ok(())
    }

    /// 위치 전진. 같은 세그먼트 안에서 역행하거나 이전 세그먼트로
    /// 돌아가면 `OutOfOrderPosition`
    pub fn advance(&self, new_position: BinlogPosition) -> Result<()> {
        let mut state = self.state.write();
        if !state.position.is_empty() && new_position < state.position {
            return Err(CdcError::OutOfOrderPosition {
                current: state.position.to_string(),
                requested: new_position.to_string(),
            });
        }

        if state.position == new_position {
            return Ok(());
        }
        state.position = new_position.clone();
        drop(state);
        self.position_tx.send_replace(new_position);
        Ok(())
    }

    /// 새 세그먼트로 회전. 오프셋 기준은 0으로 초기화됨
    ///
    /// 이미 보유한 세그먼트로의 회전(스트림 시작 시의 가짜 rotate)은 무시.
    pub fn rotate(&self, next_segment: &str) -> Result<()> {
        let current = self.position();
        if current.filename == next_segment {
            debug!("Ignoring rotate to current segment {}", next_segment);
            return Ok(());
        }
        self.advance(BinlogPosition::new(next_segment, 0))
    }

    /// 커밋된 GTID 병합
    pub fn advance_gtid(&self, gtid: &Gtid) {
        let mut state = self.state.write();
        state.gtid_set.get_or_insert_with(GtidSet::new).add_gtid(gtid);
    }

    /// 스냅샷이 보고한 좌표로 초기화
    pub fn seed(&self, position: BinlogPosition, gtid_set: Option<GtidSet>) -> Result<()> {
        let mut state = self.state.write();
        match (state.mode, gtid_set) {
            (_, Some(set)) => {
                state.gtid_set.get_or_insert_with(GtidSet::new).merge(&set);
            }
            (Some(ResumeMode::Gtid), None) => {
                return Err(CdcError::InvalidResumeMode(
                    "snapshot did not report a GTID set for a GTID session".to_string(),
                ));
            }
            (_, None) => {}
        }
        state.position = position.clone();
        drop(state);
        self.position_tx.send_replace(position);
        Ok(())
    }

    pub fn position(&self) -> BinlogPosition {
        self.state.read().position.clone()
    }

    pub fn gtid_set(&self) -> Option<GtidSet> {
        self.state.read().gtid_set.clone()
    }

    pub fn mode(&self) -> Option<ResumeMode> {
        self.state.read().mode
    }

    /// 스트리밍을 시작할 좌표. GTID 집합이 있으면 위치보다 우선
    pub fn start_coordinate(&self) -> Coordinate {
        let state = self.state.read();
        match (state.mode, &state.gtid_set) {
            (Some(ResumeMode::Position), _) | (None, None) => {
                Coordinate::Position(state.position.clone())
            }
            (_, Some(set)) => Coordinate::Gtid(set.clone()),
            (Some(ResumeMode::Gtid), None) => Coordinate::Gtid(GtidSet::new()),
        }
    }

    /// 위치가 `target` 이상이 될 때까지 대기
    pub async fn catch_up(&self, target: &BinlogPosition, timeout: Duration) -> Result<()> {
        let mut rx = self.position_tx.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|pos| pos >= target))
            .await
            .map(|r| r.map(|_| ()));

        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CdcError::ChannelClosed),
            Err(_) => Err(CdcError::Timeout),
        }
    }
}

/// 현재 처리 상태 정보 (Debezium의 SourceInfo와 유사)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    /// MySQL 서버 ID
    pub server_id: u32,
    /// Binlog 파일명
    pub binlog_filename: String,
    /// Binlog 위치
    pub binlog_position: u64,
    /// 트랜잭션 GTID (있는 경우)
    pub gtid: Option<String>,
    /// 이벤트 타임스탬프 (초 단위)
    pub ts_sec: u32,
    /// 스냅샷에서 나온 행인지 여부
    pub snapshot: bool,
    /// 데이터베이스명
    pub database: Option<String>,
    /// 테이블명
    pub table: Option<String>,
}

impl SourceInfo {
    pub fn new(server_id: u32, position: &BinlogPosition) -> Self {
        SourceInfo {
            server_id,
            binlog_filename: position.filename.clone(),
            binlog_position: position.position,
            gtid: None,
            ts_sec: 0,
            snapshot: false,
            database: None,
            table: None,
        }
    }

    pub fn position(&self) -> BinlogPosition {
        BinlogPosition::new(self.binlog_filename.clone(), self.binlog_position)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "server_id": self.server_id,
            "file": self.binlog_filename,
            "pos": self.binlog_position,
            "gtid": self.gtid,
            "ts_sec": self.ts_sec,
            "snapshot": self.snapshot,
            "db": self.database,
            "table": self.table,
        })
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SourceInfo {{ server_id: {}, file: {}, pos: {}, gtid: {:?} }}",
            self.server_id, self.binlog_filename, self.binlog_position, self.gtid
        )
    }
}
