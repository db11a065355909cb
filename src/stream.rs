//! 외부 binlog 디코더와의 경계
//!
//! 엔진은 `BinlogSource`에서 시작 좌표로 스트림을 열고 이벤트를 하나씩 읽습니다.
//! 프로토콜 디코딩은 이 크레이트 밖에서 이루어집니다.

use crate::error::{CdcError, Result};
use crate::events::BinlogEvent;
use crate::offset::Coordinate;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// 열린 이벤트 스트림
#[async_trait]
pub trait EventStream: Send {
    /// 다음 이벤트. 스트림이 끝나면 `Ok(None)`
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>>;
}

/// 좌표에서 이벤트 스트림을 여는 쪽
#[async_trait]
pub trait BinlogSource: Send + Sync {
    async fn open(&self, start: &Coordinate) -> Result<Box<dyn EventStream>>;

    /// 세션 종료 시 호출
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 채널 기반 `BinlogSource`. 디코더는 `SourceFeed`로 이벤트를 밀어 넣음
pub struct ChannelSource {
    inner: parking_lot::Mutex<Option<(oneshot::Sender<Coordinate>, mpsc::Receiver<Result<BinlogEvent>>)>>,
}

/// 디코더 쪽 핸들
pub struct SourceFeed {
    start_rx: Option<oneshot::Receiver<Coordinate>>,
    event_tx: mpsc::Sender<Result<BinlogEvent>>,
}

pub fn channel_source(capacity: usize) -> (ChannelSource, SourceFeed) {
    let (start_tx, start_rx) = oneshot::channel();
    let (event_tx, event_rx) = mpsc::channel(capacity);
    (
        ChannelSource {
            inner: parking_lot::Mutex::new(Some((start_tx, event_rx))),
        },
        SourceFeed {
            start_rx: Some(start_rx),
            event_tx,
        },
    )
}

#[async_trait]
impl BinlogSource for ChannelSource {
    async fn open(&self, start: &Coordinate) -> Result<Box<dyn EventStream>> {
        let (start_tx, event_rx) = self.inner.lock().take().ok_or_else(|| {
            CdcError::ConnectionError("channel source can only be opened once".to_string())
        })?;

        info!("Opening binlog stream from {}", start);
        // 디코더가 시작 좌표를 기다리지 않아도 스트림은 열림
        if start_tx.send(start.clone()).is_err() {
            debug!("Source feed dropped its start coordinate receiver");
        }
        Ok(Box::new(ChannelStream { event_rx }))
    }
}

struct ChannelStream {
    event_rx: mpsc::Receiver<Result<BinlogEvent>>,
}

#[async_trait]
impl EventStream for ChannelStream {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        match self.event_rx.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }
}

impl SourceFeed {
    /// 엔진이 스트림을 연 좌표. 한 번만 받을 수 있음
    pub async fn start_coordinate(&mut self) -> Result<Coordinate> {
        let start_rx = self.start_rx.take().ok_or(CdcError::ChannelClosed)?;
        start_rx.await.map_err(|_| CdcError::ChannelClosed)
    }

    pub async fn send(&self, event: BinlogEvent) -> Result<()> {
        self.event_tx
            .send(Ok(event))
            .await
            .map_err(|_| CdcError::ChannelClosed)
    }

    /// 디코딩 실패 전달 (엔진은 치명적 에러로 처리)
    pub async fn fail(&self, err: CdcError) -> Result<()> {
        self.event_tx
            .send(Err(err))
            .await
            .map_err(|_| CdcError::ChannelClosed)
    }
}
