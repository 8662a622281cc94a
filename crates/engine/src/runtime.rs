//! 룰셋 런타임 -- 워커 풀, 백그라운드 스케일링, 채널 바인딩, 생명주기
//!
//! # 내부 아키텍처
//! ```text
//! upstream rx --> reader task --> pool queue --> worker*N --> executor --> downstream tx
//!                     |  (큐가 가득하면 인라인 실행으로 역압)        |
//!                  backlog 게시                                  스케일링 루프가 풀 크기 조정
//! ```
//!
//! 워커 풀은 호스트 코어 수로 하한 `max(4, cores/2)`, 상한
//! `max(8, cores*4)`를 계산하고, 20초마다 업스트림 백로그를 네 구간으로
//! 이산화하여 하한/하한+⅓/하한+⅔/상한으로 조정합니다. 조정은 무손실입니다
//! (실행 중인 작업은 취소되지 않습니다).
//!
//! 정지는 업스트림 드레인(10초) → 다운스트림 드레인(10초) → 워커 종료
//! 대기(15초) 순서의 예산을 가지며, 예산 초과 시 정리를 강제하고 정지
//! 에러를 보고하되 상태는 `Stopped`로 전환합니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;

use rulehub_core::config::EngineConfig;
use rulehub_core::error::{ConfigError, HubError, PipelineError};
use rulehub_core::event::Event;
use rulehub_core::metrics as m;
use rulehub_core::pipeline::{BoxFuture, HealthReport, NodeKind, Pipeline};
use rulehub_core::plugin::PluginRegistry;
use rulehub_core::sampler::{NoopSampler, Sampler};
use rulehub_core::store::CounterStore;

use crate::error::EngineError;
use crate::executor::Executor;
use crate::ruleset::{Mode, ValidationIssue, compile_with_warnings};

/// 런타임 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// 정지됨 (시작 가능)
    Stopped,
    /// 시작 절차 진행 중
    Starting,
    /// 실행 중
    Running,
    /// 시작 실패 또는 워커 장애 (시작 가능)
    Error,
}

// ─── 워커 풀 ─────────────────────────────────────────────────────────

struct PoolShared {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    target: AtomicUsize,
    active: AtomicUsize,
    executor: Arc<Executor>,
    downstreams: Arc<HashMap<String, mpsc::Sender<Event>>>,
    cancel: CancellationToken,
}

/// 바운드 큐를 가진 워커 풀
///
/// 워커들은 `Arc<Mutex<Receiver>>`를 공유하며 한 번에 하나씩 작업을
/// 가져갑니다. 축소는 워커가 루프 경계에서 목표치를 확인하고 스스로
/// 종료하는 방식이라 실행 중인 작업을 잃지 않습니다.
struct WorkerPool {
    tx: mpsc::Sender<Event>,
    shared: Arc<PoolShared>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    floor: usize,
    ceiling: usize,
    queue_capacity: usize,
}

impl WorkerPool {
    fn new(
        floor: usize,
        ceiling: usize,
        queue_capacity: usize,
        executor: Arc<Executor>,
        downstreams: Arc<HashMap<String, mpsc::Sender<Event>>>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let pool = Self {
            tx,
            shared: Arc::new(PoolShared {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                target: AtomicUsize::new(floor),
                active: AtomicUsize::new(0),
                executor,
                downstreams,
                cancel,
            }),
            handles: parking_lot::Mutex::new(Vec::new()),
            floor,
            ceiling,
            queue_capacity,
        };
        for _ in 0..floor {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        // 스케줄링 전에 집계해야 resize와 accessor가 일관된 수를 봅니다.
        shared.active.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            loop {
                // 축소 요청 확인 -- 작업 경계에서만 종료합니다.
                if shared.active.load(Ordering::SeqCst) > shared.target.load(Ordering::SeqCst) {
                    break;
                }
                let job = {
                    let mut rx = shared.rx.lock().await;
                    tokio::select! {
                        job = rx.recv() => job,
                        _ = shared.cancel.cancelled() => {
                            // 정지 신호 -- 큐에 남은 작업을 마저 비웁니다.
                            rx.try_recv().ok()
                        }
                    }
                };
                match job {
                    Some(event) => {
                        process_event(&shared.executor, &shared.downstreams, event).await;
                    }
                    None => break,
                }
            }
            shared.active.fetch_sub(1, Ordering::SeqCst);
        });
        self.handles.lock().push(handle);
    }

    /// 목표 워커 수를 조정합니다. 확장은 즉시 스폰, 축소는 워커가
    /// 작업 경계에서 스스로 감지합니다.
    fn resize(&self, target: usize) {
        let clamped = target.clamp(self.floor, self.ceiling);
        self.shared.target.store(clamped, Ordering::SeqCst);
        let active = self.shared.active.load(Ordering::SeqCst);
        for _ in active..clamped {
            self.spawn_worker();
        }
        metrics::gauge!(m::ENGINE_POOL_WORKERS).set(clamped as f64);
    }

    fn queue_depth(&self) -> usize {
        self.queue_capacity - self.tx.capacity()
    }

    fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }
}

/// 이벤트를 평가하고 결과를 모든 다운스트림 채널로 밀어 넣습니다.
///
/// 닫힌 다운스트림으로의 전송은 패닉 없이 조용히 포기합니다.
async fn process_event(
    executor: &Arc<Executor>,
    downstreams: &Arc<HashMap<String, mpsc::Sender<Event>>>,
    event: Event,
) {
    let start = Instant::now();
    let outputs = executor.execute(event).await;
    metrics::histogram!(m::ENGINE_EVAL_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

    if outputs.is_empty() && executor.ruleset().mode == Mode::Exclude {
        metrics::counter!(m::ENGINE_EVENTS_EXCLUDED_TOTAL).increment(1);
        return;
    }

    for output in outputs {
        metrics::counter!(m::ENGINE_EVENTS_EMITTED_TOTAL).increment(1);
        for (name, tx) in downstreams.iter() {
            // 역압 유지를 위해 블로킹 전송 -- 이벤트 유실 없음
            if tx.send(output.clone()).await.is_err() {
                tracing::debug!(channel = %name, "downstream channel closed, dropping event");
            }
        }
    }
}

// ─── 런타임 ──────────────────────────────────────────────────────────

/// 룰셋 런타임 -- 컴파일된 룰셋 하나의 실행 단위
///
/// core의 [`Pipeline`] trait을 구현하여 데이터플로우 수퍼바이저가
/// 다른 노드와 동일한 생명주기로 관리합니다.
pub struct RulesetRuntime {
    executor: Arc<Executor>,
    config: EngineConfig,
    state: RuntimeState,
    upstreams: HashMap<String, Option<mpsc::Receiver<Event>>>,
    downstreams: HashMap<String, mpsc::Sender<Event>>,
    sampler: Arc<dyn Sampler>,
    processed: Arc<AtomicU64>,
    pool: Option<Arc<WorkerPool>>,
    reader_tasks: Vec<JoinHandle<(String, mpsc::Receiver<Event>)>>,
    backlogs: Vec<Arc<AtomicUsize>>,
    scale_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RulesetRuntime {
    /// 룰셋 ID를 반환합니다.
    pub fn id(&self) -> &str {
        &self.executor.ruleset().id
    }

    /// 동작 모드를 반환합니다.
    pub fn mode(&self) -> Mode {
        self.executor.ruleset().mode
    }

    /// 현재 상태를 반환합니다.
    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// 상태 이름을 반환합니다.
    pub fn state_name(&self) -> &'static str {
        match self.state {
            RuntimeState::Stopped => "stopped",
            RuntimeState::Starting => "starting",
            RuntimeState::Running => "running",
            RuntimeState::Error => "error",
        }
    }

    /// 로드된 룰 수를 반환합니다.
    pub fn rule_count(&self) -> usize {
        self.executor.ruleset().rules.len()
    }

    /// 처리된 이벤트 누적 수를 반환합니다.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// 현재 활성 워커 수를 반환합니다 (정지 상태면 0).
    pub fn worker_count(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.active_workers())
    }

    /// 업스트림 채널을 논리 이름으로 바인딩합니다 (정지 상태에서만).
    pub fn bind_upstream(&mut self, name: impl Into<String>, rx: mpsc::Receiver<Event>) {
        self.upstreams.insert(name.into(), Some(rx));
    }

    /// 다운스트림 채널을 논리 이름으로 바인딩합니다 (정지 상태에서만).
    pub fn bind_downstream(&mut self, name: impl Into<String>, tx: mpsc::Sender<Event>) {
        self.downstreams.insert(name.into(), tx);
    }

    fn pool_bounds(&self) -> (usize, usize) {
        let cores = num_cpus::get();
        let floor = self.config.pool_floor.unwrap_or_else(|| 4.max(cores / 2));
        let ceiling = self
            .config
            .pool_ceiling
            .unwrap_or_else(|| 8.max(cores * 4))
            .max(floor);
        (floor, ceiling)
    }

    async fn try_start(&mut self) -> Result<(), HubError> {
        self.config.validate()?;

        if self.executor.requires_shared_store() {
            return Err(ConfigError::MissingBackend {
                reason: format!(
                    "ruleset '{}' declares shared thresholds but no counter store is configured",
                    self.id()
                ),
            }
            .into());
        }

        self.executor.open_caches();
        self.cancel = CancellationToken::new();

        // 채널 맵은 시작 이후 불변입니다.
        let downstreams = Arc::new(self.downstreams.clone());
        let (floor, ceiling) = self.pool_bounds();
        let pool = Arc::new(WorkerPool::new(
            floor,
            ceiling,
            self.config.pool_queue_capacity,
            Arc::clone(&self.executor),
            Arc::clone(&downstreams),
            self.cancel.clone(),
        ));

        // 업스트림 채널마다 리더 태스크 하나 -- 정지 시 수신기를 반환합니다.
        self.backlogs.clear();
        for (name, slot) in &mut self.upstreams {
            let rx = slot.take().ok_or_else(|| {
                HubError::Pipeline(PipelineError::InitFailed(format!(
                    "upstream channel '{name}' is not bound"
                )))
            })?;
            let backlog = Arc::new(AtomicUsize::new(0));
            self.backlogs.push(Arc::clone(&backlog));
            self.reader_tasks.push(spawn_reader(ReaderContext {
                name: name.clone(),
                rx,
                pool: Arc::clone(&pool),
                downstreams: Arc::clone(&downstreams),
                backlog,
                cancel: self.cancel.clone(),
                processed: Arc::clone(&self.processed),
                sampler: Arc::clone(&self.sampler),
                test_mode: self.config.test_mode,
            }));
        }

        // 백로그 기반 풀 스케일링 루프
        let scale_pool = Arc::clone(&pool);
        let scale_backlogs = self.backlogs.clone();
        let scale_cancel = self.cancel.clone();
        let scale_secs = self.config.scale_interval_secs;
        let queue_capacity = self.config.pool_queue_capacity;
        self.scale_task = Some(tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(scale_secs));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let backlog: usize = scale_backlogs
                            .iter()
                            .map(|b| b.load(Ordering::Relaxed))
                            .sum::<usize>()
                            + scale_pool.queue_depth();
                        metrics::gauge!(m::ENGINE_BACKLOG).set(backlog as f64);

                        let span = scale_pool.ceiling - scale_pool.floor;
                        let target = if backlog == 0 {
                            scale_pool.floor
                        } else if backlog < queue_capacity / 3 {
                            scale_pool.floor + span / 3
                        } else if backlog < queue_capacity * 2 / 3 {
                            scale_pool.floor + span * 2 / 3
                        } else {
                            scale_pool.ceiling
                        };
                        scale_pool.resize(target);
                        tracing::debug!(backlog, target, "tuned worker pool");
                    }
                    _ = scale_cancel.cancelled() => break,
                }
            }
        }));

        self.pool = Some(pool);
        Ok(())
    }

    /// 정리 -- 풀 해제, 임계치 캐시 닫기, 정규식 결과 캐시 비우기,
    /// 카운터 리셋, 채널 맵 비우기.
    fn cleanup(&mut self) {
        self.cancel.cancel();
        self.pool = None;
        self.reader_tasks.clear();
        self.scale_task = None;
        self.backlogs.clear();
        self.executor.close_caches();
        self.processed.store(0, Ordering::Relaxed);
        self.upstreams.clear();
        self.downstreams.clear();
        self.cancel = CancellationToken::new();
    }

    fn total_backlog(&self) -> usize {
        self.backlogs
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum::<usize>()
            + self.pool.as_ref().map_or(0, |p| p.queue_depth())
    }
}

struct ReaderContext {
    name: String,
    rx: mpsc::Receiver<Event>,
    pool: Arc<WorkerPool>,
    downstreams: Arc<HashMap<String, mpsc::Sender<Event>>>,
    backlog: Arc<AtomicUsize>,
    cancel: CancellationToken,
    processed: Arc<AtomicU64>,
    sampler: Arc<dyn Sampler>,
    test_mode: bool,
}

/// 업스트림 리더 -- 이벤트를 수신 순서대로 풀에 제출합니다.
///
/// 풀 큐가 가득하면 이벤트를 인라인으로 실행하여 업스트림에 역압을
/// 겁니다 (드롭하지 않습니다). 정지 시 수신기를 반환해 재바인딩 없이
/// 수퍼바이저가 회수할 수 있게 합니다.
fn spawn_reader(ctx: ReaderContext) -> JoinHandle<(String, mpsc::Receiver<Event>)> {
    tokio::spawn(async move {
        let ReaderContext {
            name,
            mut rx,
            pool,
            downstreams,
            backlog,
            cancel,
            processed,
            sampler,
            test_mode,
        } = ctx;

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(event) => {
                            backlog.store(rx.len(), Ordering::Relaxed);
                            if !test_mode {
                                processed.fetch_add(1, Ordering::Relaxed);
                                metrics::counter!(m::ENGINE_EVENTS_PROCESSED_TOTAL).increment(1);
                                sampler.sample(&pool.shared.executor.ruleset().id, &event);
                            }
                            match pool.tx.try_send(event) {
                                Ok(()) => {}
                                Err(TrySendError::Full(event)) => {
                                    // 큐가 가득 -- 리더가 직접 실행 (역압)
                                    process_event(&pool.shared.executor, &downstreams, event)
                                        .await;
                                }
                                Err(TrySendError::Closed(_)) => break,
                            }
                        }
                        None => {
                            tracing::info!(channel = %name, "upstream channel closed");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        backlog.store(rx.len(), Ordering::Relaxed);
        (name, rx)
    })
}

impl RulesetRuntime {
    /// 런타임을 시작합니다.
    ///
    /// `Stopped` 또는 `Error` 상태에서만 가능합니다. 시작 절차가
    /// 실패하면 정리를 수행하고 `Error` 상태로 전환합니다.
    pub async fn start(&mut self) -> Result<(), HubError> {
        if !matches!(self.state, RuntimeState::Stopped | RuntimeState::Error) {
            return Err(PipelineError::AlreadyRunning.into());
        }
        self.state = RuntimeState::Starting;
        tracing::info!(ruleset = self.id(), "starting ruleset runtime");

        if let Err(err) = self.try_start().await {
            tracing::error!(ruleset = self.id(), error = %err, "ruleset start failed");
            self.cleanup();
            self.state = RuntimeState::Error;
            return Err(err);
        }

        self.state = RuntimeState::Running;
        tracing::info!(
            ruleset = self.id(),
            rules = self.rule_count(),
            workers = self.worker_count(),
            "ruleset runtime started"
        );
        Ok(())
    }

    /// 런타임을 정지합니다.
    ///
    /// 드레인 예산(업스트림/다운스트림/워커)을 초과하면 정리를 강제하고
    /// 정지 에러를 보고하되 상태는 `Stopped`로 전환합니다.
    pub async fn stop(&mut self) -> Result<(), HubError> {
        if self.state != RuntimeState::Running {
            return Err(PipelineError::NotRunning.into());
        }
        tracing::info!(ruleset = self.id(), "stopping ruleset runtime");

        let mut stop_error: Option<PipelineError> = None;
        let mut worker_panic = false;

        // 1. 업스트림 드레인 (예산 내에서 백로그가 비워지길 기다림)
        let deadline = Instant::now() + Duration::from_secs(self.config.upstream_drain_secs);
        while self.total_backlog() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        if self.total_backlog() > 0 {
            stop_error.get_or_insert(PipelineError::StopTimeout {
                phase: "upstream".to_owned(),
                budget_secs: self.config.upstream_drain_secs,
            });
        }

        // 2. 정지 신호 -- 리더는 현재 수신 건 이후 종료하고 수신기를 반환
        self.cancel.cancel();
        for task in self.reader_tasks.drain(..) {
            match timeout(Duration::from_secs(2), task).await {
                Ok(Ok((name, rx))) => {
                    self.upstreams.insert(name, Some(rx));
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "reader task join failed");
                    worker_panic = worker_panic || err.is_panic();
                }
                Err(_) => {
                    tracing::warn!("reader task did not respond to cancellation");
                }
            }
        }

        // 3. 다운스트림 드레인 (송신 큐가 소비될 때까지)
        let deadline = Instant::now() + Duration::from_secs(self.config.downstream_drain_secs);
        loop {
            let drained = self
                .downstreams
                .values()
                .all(|tx| tx.capacity() == tx.max_capacity() || tx.is_closed());
            if drained || Instant::now() >= deadline {
                if !drained {
                    stop_error.get_or_insert(PipelineError::StopTimeout {
                        phase: "downstream".to_owned(),
                        budget_secs: self.config.downstream_drain_secs,
                    });
                }
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        // 4. 워커 종료 대기 -- 풀 송신측을 닫으면 큐를 비운 뒤 자연 종료
        if let Some(pool) = self.pool.take() {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *pool.handles.lock());
            let budget = Duration::from_secs(self.config.worker_drain_secs);
            drop(pool);
            let wait_all = async {
                for handle in handles {
                    if let Err(err) = handle.await {
                        tracing::warn!(error = %err, "worker task join failed");
                        if err.is_panic() {
                            return true;
                        }
                    }
                }
                false
            };
            match timeout(budget, wait_all).await {
                Ok(panicked) => worker_panic = worker_panic || panicked,
                Err(_) => {
                    stop_error.get_or_insert(PipelineError::StopTimeout {
                        phase: "workers".to_owned(),
                        budget_secs: self.config.worker_drain_secs,
                    });
                }
            }
        }

        // 5. 정리 -- 임계치 캐시/결과 캐시/카운터/채널 맵
        self.cleanup();
        self.state = if worker_panic {
            RuntimeState::Error
        } else {
            RuntimeState::Stopped
        };
        tracing::info!(ruleset = self.id(), state = self.state_name(), "ruleset runtime stopped");

        match stop_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// 현재 헬스 리포트를 만듭니다.
    ///
    /// 실행 중이면 풀 큐 적체를 백로그로 싣고, 큐 사용률이 90%를 넘으면
    /// 저하로 보고합니다.
    pub fn health_report(&self) -> HealthReport {
        match self.state {
            RuntimeState::Running => {
                let capacity = self.config.pool_queue_capacity;
                let depth = self.pool.as_ref().map_or(0, |p| p.queue_depth());
                if capacity > 0 && depth * 10 > capacity * 9 {
                    HealthReport::impaired(format!(
                        "pool queue utilization high: {depth}/{capacity}"
                    ))
                    .with_backlog(self.total_backlog())
                } else {
                    HealthReport::up().with_backlog(self.total_backlog())
                }
            }
            RuntimeState::Starting => HealthReport::impaired("starting"),
            RuntimeState::Stopped => HealthReport::down("stopped"),
            RuntimeState::Error => HealthReport::down("error"),
        }
    }
}

/// 수퍼바이저 DAG 노드로서의 룰셋 런타임
impl Pipeline for RulesetRuntime {
    fn node_kind(&self) -> NodeKind {
        NodeKind::Ruleset
    }

    fn node_id(&self) -> &str {
        self.id()
    }

    fn start(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(RulesetRuntime::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(RulesetRuntime::stop(self))
    }

    fn health(&self) -> BoxFuture<'_, HealthReport> {
        Box::pin(async move { self.health_report() })
    }
}

// ─── 빌더 ────────────────────────────────────────────────────────────

/// 룰셋 런타임 빌더
///
/// 소스 텍스트, 플러그인 레지스트리, 공유 카운터 스토어, 채널 바인딩을
/// 조립합니다. `build()`가 검증과 컴파일을 수행하며, 실패한 룰셋은
/// 런타임이 만들어지지 않습니다.
///
/// # 사용 예시
/// ```ignore
/// let (in_tx, in_rx) = mpsc::channel(1024);
/// let (out_tx, out_rx) = mpsc::channel(1024);
///
/// let mut runtime = RulesetBuilder::new(source_xml)
///     .registry(registry)
///     .upstream("input", in_rx)
///     .downstream("output", out_tx)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct RulesetBuilder {
    source: String,
    registry: Arc<PluginRegistry>,
    shared_store: Option<Arc<dyn CounterStore>>,
    sampler: Arc<dyn Sampler>,
    config: EngineConfig,
    upstreams: HashMap<String, Option<mpsc::Receiver<Event>>>,
    downstreams: HashMap<String, mpsc::Sender<Event>>,
}

impl RulesetBuilder {
    /// 룰셋 소스로 빌더를 생성합니다.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            registry: Arc::new(PluginRegistry::new()),
            shared_store: None,
            sampler: Arc::new(NoopSampler),
            config: EngineConfig::default(),
            upstreams: HashMap::new(),
            downstreams: HashMap::new(),
        }
    }

    /// 플러그인 레지스트리를 지정합니다.
    pub fn registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// 공유 카운터 스토어를 지정합니다.
    pub fn shared_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.shared_store = Some(store);
        self
    }

    /// 샘플러 훅을 지정합니다.
    pub fn sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// 엔진 설정을 지정합니다.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 업스트림 채널을 바인딩합니다.
    pub fn upstream(mut self, name: impl Into<String>, rx: mpsc::Receiver<Event>) -> Self {
        self.upstreams.insert(name.into(), Some(rx));
        self
    }

    /// 다운스트림 채널을 바인딩합니다.
    pub fn downstream(mut self, name: impl Into<String>, tx: mpsc::Sender<Event>) -> Self {
        self.downstreams.insert(name.into(), tx);
        self
    }

    /// 소스를 컴파일하고 정지 상태의 런타임을 만듭니다.
    pub fn build(self) -> Result<RulesetRuntime, EngineError> {
        self.config.validate().map_err(|e| EngineError::Config {
            field: "engine".to_owned(),
            reason: e.to_string(),
        })?;

        let mut warnings: Vec<ValidationIssue> = Vec::new();
        let ruleset = compile_with_warnings(&self.source, &self.registry, &mut warnings)?;
        for warning in &warnings {
            tracing::warn!(
                ruleset = %ruleset.id,
                line = warning.line,
                detail = %warning.detail,
                "{}",
                warning.message
            );
        }

        let executor = Arc::new(Executor::new(ruleset, &self.config, self.shared_store));
        Ok(RulesetRuntime {
            executor,
            config: self.config,
            state: RuntimeState::Stopped,
            upstreams: self.upstreams,
            downstreams: self.downstreams,
            sampler: self.sampler,
            processed: Arc::new(AtomicU64::new(0)),
            pool: None,
            reader_tasks: Vec::new(),
            backlogs: Vec::new(),
            scale_task: None,
            cancel: CancellationToken::new(),
        })
    }
}
