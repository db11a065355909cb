//! 이벤트 핸들러 인터페이스
//!
//! 모든 콜백은 기본 구현(no-op)을 가지므로 필요한 것만 구현하면 됩니다.
//! 콜백은 디스패치 경로에서 순서대로 호출되며, 하나의 이벤트에 대한 콜백이
//! 끝나기 전에는 다음 이벤트를 처리하지 않습니다.
//!
//! 에러를 반환하면 스트리밍이 중단되고 세션은 닫힙니다.

use crate::error::{CdcError, Result};
use crate::events::{QueryEventData, RowsEvent};
use crate::gtid::{Gtid, GtidSet};
use crate::offset::BinlogPosition;
use async_trait::async_trait;

#[async_trait]
pub trait EventHandler: Send {
    /// 새 binlog 파일로 회전
    async fn on_rotate(&mut self, _next: &BinlogPosition) -> Result<()> {
        Ok(())
    }

    /// DDL로 테이블 구조가 바뀜 (캐시 무효화 직후)
    async fn on_table_changed(&mut self, _schema: &str, _table: &str) -> Result<()> {
        Ok(())
    }

    /// DDL 쿼리 이벤트. 필터와 무관하게 전달됨
    async fn on_ddl(&mut self, _next_pos: &BinlogPosition, _query: &QueryEventData) -> Result<()> {
        Ok(())
    }

    async fn on_row(&mut self, _event: &RowsEvent) -> Result<()> {
        Ok(())
    }

    /// 트랜잭션 커밋
    async fn on_xid(&mut self, _next_pos: &BinlogPosition) -> Result<()> {
        Ok(())
    }

    async fn on_gtid(&mut self, _gtid: &Gtid) -> Result<()> {
        Ok(())
    }

    /// 위치 동기화 알림. `forced`는 트랜잭션 경계가 아닌 동기화 지점(DDL, rotate, 스냅샷)
    async fn on_pos_synced(
        &mut self,
        _pos: &BinlogPosition,
        _gtid_set: Option<&GtidSet>,
        _forced: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// 핸들러 에러로 세션이 닫힐 때 한 번 호출됨
    async fn on_error(&mut self, _err: &CdcError) {}

    fn name(&self) -> &str {
        "EventHandler"
    }
}

/// 아무 것도 하지 않는 핸들러
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyEventHandler;

#[async_trait]
impl EventHandler for DummyEventHandler {
    fn name(&self) -> &str {
        "DummyEventHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dummy_handler_accepts_everything() {
        let mut handler = DummyEventHandler;
        let pos = BinlogPosition::new("mysql-bin.000001", 4);
        handler.on_rotate(&pos).await.unwrap();
        handler.on_xid(&pos).await.unwrap();
        handler.on_pos_synced(&pos, None, true).await.unwrap();
        handler.on_table_changed("a", "b").await.unwrap();
        assert_eq!(handler.name(), "DummyEventHandler");
    }
}
