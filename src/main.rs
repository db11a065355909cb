/// MySQL CDC 엔진 실행 예제
///
/// 외부 디코더가 stdin으로 넘겨주는 JSON 이벤트(한 줄에 하나)를 엔진에 공급하고,
/// 변경 이벤트를 stdout에 JSON으로 출력합니다.
use async_trait::async_trait;
use mysql_canal::events::{BinlogEvent, ChangeEvent, QueryEventData, RowsEvent};
use mysql_canal::gtid::GtidSet;
use mysql_canal::offset::BinlogPosition;
use mysql_canal::stream::channel_source;
use mysql_canal::{CdcConfig, CdcEngine, CdcError, Coordinate, EventHandler};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// 변경 이벤트를 JSON 한 줄씩 출력하는 핸들러
struct JsonLinesHandler;

#[async_trait]
impl EventHandler for JsonLinesHandler {
    async fn on_row(&mut self, event: &RowsEvent) -> mysql_canal::Result<()> {
        for change in event.to_change_events() {
            println!("{}", serde_json::to_string(&change)?);
        }
        Ok(())
    }

    async fn on_ddl(&mut self, _next_pos: &BinlogPosition, query: &QueryEventData) -> mysql_canal::Result<()> {
        println!("{}", serde_json::to_string(&ChangeEvent::ddl(query))?);
        Ok(())
    }

    async fn on_pos_synced(
        &mut self,
        pos: &BinlogPosition,
        gtid_set: Option<&GtidSet>,
        forced: bool,
    ) -> mysql_canal::Result<()> {
        info!(
            "Position synced: {} gtid={} forced={}",
            pos,
            gtid_set.map(|s| s.to_string()).unwrap_or_default(),
            forced
        );
        Ok(())
    }

    async fn on_error(&mut self, err: &CdcError) {
        error!("Handler aborted streaming: {}", err);
    }

    fn name(&self) -> &str {
        "JsonLinesHandler"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = CdcConfig::from_env()?;
    info!("Starting MySQL CDC Engine");
    info!("Connecting to {}", config.connection.addr());

    let (source, mut feed) = channel_source(1024);
    let engine = CdcEngine::connect(config, Arc::new(source), Box::new(JsonLinesHandler)).await?;
    let handle = engine.handle();

    // 재개 좌표: CDC_START_GTID 또는 CDC_START_FILE/CDC_START_POS, 없으면 스냅샷부터
    let start = match env::var("CDC_START_GTID") {
        Ok(raw) => Coordinate::Gtid(GtidSet::parse(&raw)?),
        Err(_) => {
            let file = env::var("CDC_START_FILE").unwrap_or_default();
            let pos = env::var("CDC_START_POS")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            Coordinate::Position(BinlogPosition::new(file, pos))
        }
    };
    let engine_task = tokio::spawn(engine.run(start));

    // stdin의 JSON 이벤트를 스트림으로 공급
    let feeder = tokio::spawn(async move {
        match feed.start_coordinate().await {
            Ok(start) => info!("Decoder should stream from {}", start),
            Err(_) => return,
        }
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let sent = match serde_json::from_str::<BinlogEvent>(&line) {
                Ok(event) => feed.send(event).await,
                Err(e) => feed.fail(CdcError::BinlogParseError(e.to_string())).await,
            };
            if sent.is_err() {
                break;
            }
        }
    });

    let closer = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, closing");
            closer.close();
        }
    });

    let result = engine_task.await?;
    feeder.abort();

    match result {
        Ok(()) => info!("CDC Engine finished at {}", handle.position()),
        Err(e) => {
            warn!("CDC Engine finished with error: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}
