//! MySQL CDC 엔진 - 스냅샷 및 스트리밍 처리
//!
//! CDC 엔진은 다음 단계로 진행됩니다:
//! 1. 초기 스냅샷 (재개 좌표가 없고 덤퍼가 설정된 경우)
//! 2. Binlog 스트리밍 (스냅샷 좌표 또는 재개 좌표부터)
//! 3. 종료 (close 호출, 핸들러 에러, 읽기 타임아웃, 디코딩 실패)
//!
//! 이벤트 처리는 하나의 태스크에서 도착 순서대로 이루어지며, 한 이벤트의
//! 핸들러 콜백이 모두 끝난 뒤에 다음 이벤트를 읽습니다.

use crate::config::CdcConfig;
use crate::connection::MySqlConnection;
use crate::ddl::{classify_query, DdlKind, DdlTarget};
use crate::dump::{DumpSink, Dumper, MysqldumpDumper};
use crate::error::{CdcError, Result};
use crate::events::*;
use crate::gtid::{Gtid, GtidSet};
use crate::handler::EventHandler;
use crate::offset::{BinlogPosition, Coordinate, PositionTracker, SourceInfo};
use crate::schema::{MetadataProvider, SchemaRegistry, TableSchema};
use crate::stream::{BinlogSource, EventStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 엔진 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Dumping,
    Streaming,
    Closing,
    Closed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Dumping => "dumping",
            EngineState::Streaming => "streaming",
            EngineState::Closing => "closing",
            EngineState::Closed => "closed",
        }
    }

    fn is_closing(&self) -> bool {
        matches!(self, EngineState::Closing | EngineState::Closed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 복제 세션: 현재 좌표와 스키마 캐시
///
/// 쓰기는 디스패치 경로에서만, 읽기(`catch_up`, `get`)는 어디서든 가능.
#[derive(Debug)]
pub struct ReplicationSession {
    tracker: PositionTracker,
    registry: SchemaRegistry,
}

impl ReplicationSession {
    pub fn new(registry: SchemaRegistry) -> Self {
        ReplicationSession {
            tracker: PositionTracker::new(),
            registry,
        }
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }
}

struct EngineShared {
    config: CdcConfig,
    session: ReplicationSession,
    state_tx: watch::Sender<EngineState>,
    close_tx: watch::Sender<bool>,
    dump_done_tx: watch::Sender<bool>,
    terminal_error: Mutex<Option<String>>,
}

impl EngineShared {
    fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// `from` 상태일 때만 `to`로 전이
    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Engine state {} -> {}", from, to);
        }
        changed
    }

    fn close_requested(&self) -> bool {
        *self.close_tx.borrow()
    }

    async fn wait_closing(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| state.is_closing()).await;
    }
}

/// 엔진 밖에서 세션을 관찰/종료하는 핸들
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// 종료 요청. 진행 중인 읽기는 즉시 중단되고 이후 콜백은 호출되지 않음
    pub fn close(&self) {
        self.shared.close_tx.send_replace(true);
        let shared = &self.shared;
        shared.state_tx.send_if_modified(|state| match state {
            EngineState::Idle => {
                *state = EngineState::Closed;
                true
            }
            EngineState::Dumping | EngineState::Streaming => {
                *state = EngineState::Closing;
                true
            }
            _ => false,
        });
        info!("Close requested, engine is {}", shared.state());
    }

    pub fn closed(&self) -> bool {
        self.shared.state() == EngineState::Closed
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Closed 상태가 될 때까지 대기
    pub async fn wait_closed(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == EngineState::Closed).await;
    }

    /// 덤프 단계가 끝나거나 생략될 때까지 대기
    pub async fn wait_dump_done(&self) -> Result<()> {
        let mut done_rx = self.shared.dump_done_tx.subscribe();
        tokio::select! {
            biased;
            _ = async { done_rx.wait_for(|done| *done).await.map(|_| ()) } => Ok(()),
            _ = self.shared.wait_closing() => Err(CdcError::SessionClosed),
        }
    }

    /// 세션 위치가 `target` 이상이 될 때까지 대기
    pub async fn catch_up(&self, target: &BinlogPosition, timeout: Duration) -> Result<()> {
        if self.closed() {
            return Err(CdcError::SessionClosed);
        }
        tokio::select! {
            biased;
            result = self.shared.session.tracker.catch_up(target, timeout) => result,
            _ = self.shared.wait_closing() => Err(CdcError::SessionClosed),
        }
    }

    /// 소스 서버의 현재 위치를 조회해 그 위치까지 따라잡을 때까지 대기
    pub async fn catch_master_position(&self, timeout: Duration) -> Result<()> {
        if self.closed() {
            return Err(CdcError::SessionClosed);
        }
        let target = self.shared.session.registry.provider().master_position().await?;
        info!("Waiting to catch master position {}", target);
        self.catch_up(&target, timeout).await
    }

    /// 테이블 메타데이터 조회
    pub async fn get_table(&self, schema: &str, table: &str) -> Result<Arc<TableSchema>> {
        if self.closed() {
            return Err(CdcError::SessionClosed);
        }
        self.shared.session.registry.get(schema, table).await
    }

    pub fn position(&self) -> BinlogPosition {
        self.shared.session.tracker.position()
    }

    pub fn gtid_set(&self) -> Option<GtidSet> {
        self.shared.session.tracker.gtid_set()
    }

    /// 세션을 종료시킨 에러 메시지
    pub fn terminal_error(&self) -> Option<String> {
        self.shared.terminal_error.lock().clone()
    }
}

/// MySQL CDC 엔진
pub struct CdcEngine {
    shared: Arc<EngineShared>,
    source: Arc<dyn BinlogSource>,
    dumper: Option<Arc<dyn Dumper>>,
    handler: Box<dyn EventHandler>,
    /// 현재 트랜잭션의 GTID (커밋 시 병합)
    pending_gtid: Option<Gtid>,
    /// 마지막 이벤트의 끝 위치
    pending_pos: BinlogPosition,
}

impl CdcEngine {
    /// 새 CDC 엔진 생성
    pub fn new(
        config: CdcConfig,
        provider: Arc<dyn MetadataProvider>,
        source: Arc<dyn BinlogSource>,
        handler: Box<dyn EventHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = SchemaRegistry::new(config.table_filter()?, provider);

        let (state_tx, _) = watch::channel(EngineState::Idle);
        let (close_tx, _) = watch::channel(false);
        let (dump_done_tx, _) = watch::channel(false);

        Ok(CdcEngine {
            shared: Arc::new(EngineShared {
                config,
                session: ReplicationSession::new(registry),
                state_tx,
                close_tx,
                dump_done_tx,
                terminal_error: Mutex::new(None),
            }),
            source,
            dumper: None,
            handler,
            pending_gtid: None,
            pending_pos: BinlogPosition::default(),
        })
    }

    /// MySQL에 연결해 메타데이터 조회를 준비하고, 덤프 경로가 설정되어 있으면 mysqldump 덤퍼 사용
    pub async fn connect(
        config: CdcConfig,
        source: Arc<dyn BinlogSource>,
        handler: Box<dyn EventHandler>,
    ) -> Result<Self> {
        info!("Connecting CDC Engine to {}", config.connection.addr());
        config.validate()?;

        let conn = MySqlConnection::connect(config.connection.clone()).await?;

        let server_id = conn.get_server_id().await?;
        info!("Connected to MySQL server: {}", server_id);

        conn.check_row_format().await?;

        let gtid_enabled = conn.is_gtid_mode_enabled().await?;
        info!("GTID mode enabled: {}", gtid_enabled);

        let dumper = config.dump.is_enabled().then(|| {
            Arc::new(MysqldumpDumper::new(config.connection.clone(), config.dump.clone()))
                as Arc<dyn Dumper>
        });

        let mut engine = CdcEngine::new(config, Arc::new(conn), source, handler)?;
        engine.dumper = dumper;
        Ok(engine)
    }

    pub fn with_dumper(mut self, dumper: Arc<dyn Dumper>) -> Self {
        self.dumper = Some(dumper);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    pub async fn start_from_position(self, position: BinlogPosition) -> Result<()> {
        self.run(Coordinate::Position(position)).await
    }

    pub async fn start_from_gtid(self, gtid_set: GtidSet) -> Result<()> {
        self.run(Coordinate::Gtid(gtid_set)).await
    }

    /// 세션 실행. `close()`로 종료되면 `Ok`, 그 외 종료 원인은 에러로 반환
    pub async fn run(mut self, start: Coordinate) -> Result<()> {
        let shared = self.shared.clone();
        if !shared.transition(EngineState::Idle, EngineState::Dumping) {
            return Err(CdcError::SessionClosed);
        }

        info!(
            "Starting CDC Engine from {} with handler {}",
            start,
            self.handler.name()
        );
        let result = self.replicate(start).await;

        shared.transition(EngineState::Dumping, EngineState::Closing);
        shared.transition(EngineState::Streaming, EngineState::Closing);

        if let Err(e) = self.source.close().await {
            warn!("Error while closing binlog source: {}", e);
        }
        if let Err(e) = shared.session.registry.provider().close().await {
            warn!("Error while closing metadata connection: {}", e);
        }

        if let Err(err) = &result {
            error!("CDC Engine stopped with error: {}", err);
            *shared.terminal_error.lock() = Some(err.to_string());
            if matches!(err, CdcError::HandlerError(_)) {
                self.handler.on_error(err).await;
            }
        }

        shared.state_tx.send_replace(EngineState::Closed);
        info!("CDC Engine stopped at {}", shared.session.tracker.position());
        result
    }

    async fn replicate(&mut self, start: Coordinate) -> Result<()> {
        let shared = self.shared.clone();
        let tracker = &shared.session.tracker;
        tracker.resume_from(start.clone())?;

        match self.dumper.clone() {
            Some(dumper) if start.is_empty() => {
                if !self.dump(dumper.as_ref()).await? {
                    return Ok(());
                }
            }
            _ => debug!("Skipping dump, resuming from {}", start),
        }
        shared.dump_done_tx.send_replace(true);

        if !shared.transition(EngineState::Dumping, EngineState::Streaming) {
            return Ok(());
        }
        self.stream(tracker.start_coordinate()).await
    }

    /// 스냅샷 실행. 종료 요청으로 중단되면 false
    async fn dump(&mut self, dumper: &dyn Dumper) -> Result<bool> {
        let shared = self.shared.clone();
        let mut close_rx = shared.close_tx.subscribe();
        info!("Starting dump");

        let mut sink = DumpDispatcher {
            shared: &shared,
            handler: self.handler.as_mut(),
            coordinate: None,
            rows: 0,
        };

        if shared.close_requested() {
            return Ok(false);
        }
        tokio::select! {
            biased;
            _ = close_rx.changed() => {
                info!("Dump interrupted by close");
                return Ok(false);
            }
            result = dumper.dump(&mut sink) => result?,
        }

        let (position, gtid_set) = sink
            .coordinate
            .take()
            .ok_or_else(|| CdcError::DumpError("dump finished without a coordinate".to_string()))?;
        info!("Dump done, {} rows, snapshot at {}", sink.rows, position);

        let tracker = &shared.session.tracker;
        tracker.seed(position, gtid_set)?;
        if self.closing() {
            return Ok(false);
        }
        self.handler
            .on_pos_synced(&tracker.position(), tracker.gtid_set().as_ref(), true)
            .await
            .map_err(CdcError::handler)?;
        Ok(true)
    }

    async fn stream(&mut self, start: Coordinate) -> Result<()> {
        let shared = self.shared.clone();
        let heartbeat = shared.config.heartbeat_period;
        let read_timeout = shared.config.read_timeout;

        self.pending_pos = shared.session.tracker.position();
        let mut close_rx = shared.close_tx.subscribe();
        if shared.close_requested() {
            return Ok(());
        }
        let mut stream: Box<dyn EventStream> = tokio::select! {
            biased;
            _ = close_rx.changed() => {
                info!("Stream open interrupted by close");
                return Ok(());
            }
            opened = self.source.open(&start) => opened?,
        };
        let mut last_event = Instant::now();
        info!("Streaming binlog from {}", start);

        loop {
            if shared.close_requested() {
                info!("Stream closed on request");
                return Ok(());
            }

            let silence = last_event.elapsed();
            if silence >= read_timeout {
                return Err(CdcError::Timeout);
            }
            let wait = heartbeat.min(read_timeout - silence);

            tokio::select! {
                biased;
                _ = close_rx.changed() => continue,
                next = tokio::time::timeout(wait, stream.next_event()) => match next {
                    Err(_) => {
                        if last_event.elapsed() >= read_timeout {
                            warn!("No binlog event within {:?}", read_timeout);
                            return Err(CdcError::Timeout);
                        }
                        self.heartbeat().await?;
                    }
                    Ok(Ok(Some(event))) => {
                        last_event = Instant::now();
                        self.dispatch(event).await?;
                    }
                    Ok(Ok(None)) => return Err(CdcError::ChannelClosed),
                    Ok(Err(e)) => return Err(e),
                },
            }
        }
    }

    async fn heartbeat(&mut self) -> Result<()> {
        if self.closing() {
            return Ok(());
        }
        let tracker = &self.shared.session.tracker;
        debug!("Heartbeat at {}", tracker.position());
        self.handler
            .on_pos_synced(&tracker.position(), tracker.gtid_set().as_ref(), false)
            .await
            .map_err(CdcError::handler)
    }

    async fn dispatch(&mut self, event: BinlogEvent) -> Result<()> {
        let header = event.header;
        if header.next_pos > 0 && !self.pending_pos.is_empty() {
            self.pending_pos.position = header.next_pos as u64;
        }

        match event.data {
            BinlogEventData::Rotate(rotate) => self.on_rotate(&rotate).await,
            BinlogEventData::Gtid(gtid) => self.on_gtid(&gtid).await,
            BinlogEventData::Xid(_) => self.on_xid().await,
            BinlogEventData::Query(query) => self.on_query(&query).await,
            BinlogEventData::WriteRows(data) => {
                let rows = data.rows;
                self.on_rows(&header, &data.database, &data.table, RowAction::Insert, rows)
                    .await
            }
            BinlogEventData::DeleteRows(data) => {
                let rows = data.rows;
                self.on_rows(&header, &data.database, &data.table, RowAction::Delete, rows)
                    .await
            }
            BinlogEventData::UpdateRows(data) => {
                let rows = data
                    .rows
                    .into_iter()
                    .flat_map(|(before, after)| [before, after])
                    .collect();
                self.on_rows(&header, &data.database, &data.table, RowAction::Update, rows)
                    .await
            }
            BinlogEventData::Heartbeat => self.heartbeat().await,
            BinlogEventData::RowsQuery(_) | BinlogEventData::Unknown(_) => Ok(()),
        }
    }

    async fn on_rotate(&mut self, rotate: &RotateEventData) -> Result<()> {
        let tracker = &self.shared.session.tracker;
        tracker.rotate(&rotate.next_binlog_name)?;
        let position = tracker.position();
        self.pending_pos = position.clone();
        info!("Rotate to {}", position);

        if self.closing() {
            return Ok(());
        }
        self.handler
            .on_rotate(&position)
            .await
            .map_err(CdcError::handler)?;
        self.sync(true).await
    }

    async fn on_gtid(&mut self, data: &GtidEventData) -> Result<()> {
        let gtid = Gtid::parse(&data.gtid)?;
        if self.closing() {
            return Ok(());
        }
        self.handler.on_gtid(&gtid).await.map_err(CdcError::handler)?;
        self.pending_gtid = Some(gtid);
        Ok(())
    }

    async fn on_xid(&mut self) -> Result<()> {
        self.commit()?;
        if self.closing() {
            return Ok(());
        }
        let position = self.shared.session.tracker.position();
        self.handler.on_xid(&position).await.map_err(CdcError::handler)?;
        self.sync(false).await
    }

    async fn on_query(&mut self, query: &QueryEventData) -> Result<()> {
        let statement = query.query.trim();
        if statement.eq_ignore_ascii_case("BEGIN") {
            return Ok(());
        }

        let targets = match classify_query(statement, &query.database) {
            Ok(targets) => targets,
            Err(e) => {
                warn!("Skipping query that could not be parsed ({}): {}", e, statement);
                self.commit()?;
                return Ok(());
            }
        };
        if targets.is_empty() {
            self.commit()?;
            return Ok(());
        }

        let shared = self.shared.clone();
        let registry = &shared.session.registry;
        for (i, target) in targets.iter().enumerate() {
            let renamed_to = targets
                .get(i + 1)
                .filter(|next| target.kind == DdlKind::RenameFrom && next.kind == DdlKind::RenameTo);
            match renamed_to {
                Some(to) => registry.rename(&target.schema, &target.table, &to.schema, &to.table),
                None => registry.invalidate(&target.schema, &target.table),
            }
        }

        for target in &targets {
            if self.closing() {
                return Ok(());
            }
            info!("Table changed by DDL: {}", target);
            self.table_changed(target).await?;
        }

        // 전달되지 않은 DDL은 커밋하지 않음
        if self.closing() {
            return Ok(());
        }
        let next = self.pending_pos.clone();
        self.handler
            .on_ddl(&next, query)
            .await
            .map_err(CdcError::handler)?;
        self.commit()?;
        self.sync(true).await
    }

    async fn table_changed(&mut self, target: &DdlTarget) -> Result<()> {
        self.handler
            .on_table_changed(&target.schema, &target.table)
            .await
            .map_err(CdcError::handler)
    }

    async fn on_rows(
        &mut self,
        header: &EventHeader,
        schema: &str,
        table: &str,
        action: RowAction,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<()> {
        let registry = &self.shared.session.registry;
        let mut table_schema = match lookup(registry, schema, table).await? {
            Some(t) => t,
            None => return Ok(()),
        };

        let widest = rows.iter().map(Vec::len).max().unwrap_or(0);
        if widest > table_schema.columns.len() {
            debug!(
                "{} has {} columns but row has {}, refetching",
                table_schema.qualified_name(),
                table_schema.columns.len(),
                widest
            );
            registry.invalidate(schema, table);
            table_schema = match lookup(registry, schema, table).await? {
                Some(t) => t,
                None => return Ok(()),
            };
        }

        let rows = rows
            .into_iter()
            .map(|row| table_schema.normalize_row(row))
            .collect();

        let mut source = SourceInfo::new(header.server_id, &self.pending_pos);
        source.gtid = self.pending_gtid.as_ref().map(Gtid::to_string);
        source.ts_sec = header.timestamp;
        source.database = Some(schema.to_string());
        source.table = Some(table.to_string());

        let event = RowsEvent {
            table: table_schema,
            action,
            rows,
            source,
        };
        if self.closing() {
            return Ok(());
        }
        self.handler.on_row(&event).await.map_err(CdcError::handler)
    }

    /// 종료 요청 이후에는 핸들러 콜백을 호출하지 않음
    fn closing(&self) -> bool {
        self.shared.close_requested()
    }

    /// 트랜잭션 커밋: 위치를 영속 좌표로 반영하고 GTID 병합
    fn commit(&mut self) -> Result<()> {
        let tracker = &self.shared.session.tracker;
        if !self.pending_pos.is_empty() {
            tracker.advance(self.pending_pos.clone())?;
        }
        if let Some(gtid) = self.pending_gtid.take() {
            tracker.advance_gtid(&gtid);
        }
        Ok(())
    }

    async fn sync(&mut self, forced: bool) -> Result<()> {
        if self.closing() {
            return Ok(());
        }
        let tracker = &self.shared.session.tracker;
        self.handler
            .on_pos_synced(&tracker.position(), tracker.gtid_set().as_ref(), forced)
            .await
            .map_err(CdcError::handler)
    }
}

/// 제외되었거나 없는 테이블은 None (행 이벤트 건너뜀)
async fn lookup(registry: &SchemaRegistry, schema: &str, table: &str) -> Result<Option<Arc<TableSchema>>> {
    match registry.get(schema, table).await {
        Ok(t) => Ok(Some(t)),
        Err(e) if e.is_excluded() => Ok(None),
        Err(CdcError::TableNotFound { .. }) => {
            warn!("Skipping rows for missing table {}.{}", schema, table);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// 덤프된 행을 핸들러로 전달하는 sink
struct DumpDispatcher<'a> {
    shared: &'a EngineShared,
    handler: &'a mut dyn EventHandler,
    coordinate: Option<(BinlogPosition, Option<GtidSet>)>,
    rows: u64,
}

#[async_trait]
impl<'a> DumpSink for DumpDispatcher<'a> {
    async fn on_coordinate(&mut self, position: BinlogPosition, gtid_set: Option<GtidSet>) -> Result<()> {
        info!("Dump coordinate {}", position);
        self.coordinate = Some((position, gtid_set));
        Ok(())
    }

    async fn on_row(&mut self, schema: &str, table: &str, values: Vec<CellValue>) -> Result<()> {
        let position = match &self.coordinate {
            Some((position, _)) => position.clone(),
            None => {
                return Err(CdcError::DumpError(
                    "dump row arrived before the snapshot coordinate".to_string(),
                ))
            }
        };

        let table_schema = match lookup(&self.shared.session.registry, schema, table).await? {
            Some(t) => t,
            None => return Ok(()),
        };

        let mut source = SourceInfo::new(0, &position);
        source.snapshot = true;
        source.database = Some(schema.to_string());
        source.table = Some(table.to_string());

        let event = RowsEvent {
            rows: vec![table_schema.normalize_row(values)],
            table: table_schema,
            action: RowAction::Insert,
            source,
        };
        if self.shared.close_requested() {
            return Ok(());
        }
        self.rows += 1;
        self.handler.on_row(&event).await.map_err(CdcError::handler)
    }
}
