//! The single-active-phase executor.
//!
//! Every phase of every round funnels through one runner task. The runner
//! pops a phase, starts its graph workers, spawns its transmission handler,
//! and then waits on exactly one of: the finish signal, the phase's
//! timeout, or a kill request. At most one phase is ever `Running` on a
//! node; cross-round fairness is arrival order.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    graph::{GraphError, ModuleRuntime},
    phase::{
        GetChunk, GetSlot, Phase, PhaseError, PhaseType, RoundHooks, State, TransmitCtx,
        TransmitError,
    },
    queues::QueueError,
    round::manager::RoundManager,
    RoundId,
};

/// The depth of the phase arrival channel. Filling it means the runner is
/// wedged; the overflowing send is a critical error.
const PHASE_QUEUE_DEPTH: usize = 5000;

/// The completion signal a phase delivers back to the runner.
pub enum FinishSignal {
    /// The phase's graph drained and its outputs went out.
    Finished(Arc<Phase>),
    /// The transmission handler or finalization failed.
    TransmitFailed(Arc<Phase>, TransmitError),
}

/// Why a round was failed by the resource queue.
#[derive(Debug, Error)]
pub enum PhaseFailure {
    /// The phase's timer fired before its finish signal arrived.
    #[error("phase {phase} of round {round} timed out after {timeout:?}")]
    PhaseTimeout {
        round: RoundId,
        phase: PhaseType,
        timeout: Duration,
    },
    /// The transmission handler failed.
    #[error("phase {phase} of round {round} failed to transmit: {source}")]
    Transmit {
        round: RoundId,
        phase: PhaseType,
        #[source]
        source: TransmitError,
    },
    /// A queued phase referenced a round the manager no longer holds.
    #[error("round {0} is not registered with the manager")]
    RoundNotFound(RoundId),
    /// The phase could not change state.
    #[error("phase {phase}: {source}")]
    Phase {
        phase: PhaseType,
        #[source]
        source: PhaseError,
    },
    /// The phase's graph refused to start.
    #[error("phase {phase} of round {round} failed to start: {source}")]
    Graph {
        round: RoundId,
        phase: PhaseType,
        #[source]
        source: GraphError,
    },
}

/// The node-side sink for failed rounds: broadcasts the round error and
/// trips the node state machine.
pub trait RoundFailer: Send + Sync {
    fn fail_round(&self, failure: PhaseFailure);
}

/// Everything the runner resolves phases against.
pub struct QueueDeps {
    pub manager: Arc<RoundManager>,
    pub network: Arc<dyn crate::node::transport::Transport>,
    pub hooks: Arc<dyn RoundHooks>,
    pub failer: Arc<dyn RoundFailer>,
    /// Per-module runtimes are appended here after each phase when set.
    pub metric_log_path: Option<PathBuf>,
}

/// The phase queue and its control channels.
pub struct ResourceQueue {
    phase_tx: mpsc::Sender<Arc<Phase>>,
    phase_rx: Mutex<Option<mpsc::Receiver<Arc<Phase>>>>,
    finish_tx: mpsc::Sender<FinishSignal>,
    finish_rx: Mutex<Option<mpsc::Receiver<FinishSignal>>>,
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
    kill_rx: Mutex<Option<mpsc::Receiver<oneshot::Sender<()>>>>,
    running: AtomicBool,
}

impl Default for ResourceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceQueue {
    pub fn new() -> Self {
        let (phase_tx, phase_rx) = mpsc::channel(PHASE_QUEUE_DEPTH);
        let (finish_tx, finish_rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        Self {
            phase_tx,
            phase_rx: Mutex::new(Some(phase_rx)),
            finish_tx,
            finish_rx: Mutex::new(Some(finish_rx)),
            kill_tx,
            kill_rx: Mutex::new(Some(kill_rx)),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Submits a phase that has won its `Active` to `Queued` transition.
    /// Never blocks; a full channel indicates an upstream deadlock.
    pub fn queue_phase(&self, phase: Arc<Phase>) -> Result<(), QueueError> {
        self.phase_tx.try_send(phase).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                error!("resource queue is full, the runner is wedged");
                QueueError::Full("resource")
            }
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed("resource"),
        })
    }

    /// Stops the runner and waits up to `timeout` for its acknowledgement.
    pub async fn kill(&self, timeout: Duration) -> Result<(), QueueError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.kill_tx
            .try_send(ack_tx)
            .map_err(|_| QueueError::Closed("resource"))?;
        tokio::time::timeout(timeout, ack_rx)
            .await
            .map_err(|_| QueueError::KillTimeout("resource"))?
            .map_err(|_| QueueError::KillTimeout("resource"))
    }

    /// The runner loop. Runs until killed or until every sender is gone.
    pub async fn run(&self, deps: QueueDeps) {
        let (mut phase_rx, mut finish_rx, mut kill_rx) = {
            let phase_rx = self.phase_rx.lock().take();
            let finish_rx = self.finish_rx.lock().take();
            let kill_rx = self.kill_rx.lock().take();
            match (phase_rx, finish_rx, kill_rx) {
                (Some(p), Some(f), Some(k)) => (p, f, k),
                _ => {
                    error!("resource queue runner started twice");
                    return;
                }
            }
        };
        self.running.store(true, Ordering::SeqCst);
        info!("resource queue runner started");

        loop {
            let phase = tokio::select! {
                maybe = phase_rx.recv() => match maybe {
                    Some(phase) => phase,
                    None => break,
                },
                Some(ack) = kill_rx.recv() => {
                    let _ = ack.send(());
                    break;
                }
            };
            if !self
                .run_phase(phase, &deps, &mut finish_rx, &mut kill_rx)
                .await
            {
                break;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("resource queue runner stopped");
    }

    /// Executes one phase to completion. Returns `false` to stop the
    /// runner.
    async fn run_phase(
        &self,
        phase: Arc<Phase>,
        deps: &QueueDeps,
        finish_rx: &mut mpsc::Receiver<FinishSignal>,
        kill_rx: &mut mpsc::Receiver<oneshot::Sender<()>>,
    ) -> bool {
        let phase_type = phase.phase_type();
        let round_id = match phase.round_id() {
            Ok(id) => id,
            Err(source) => {
                deps.failer.fail_round(PhaseFailure::Phase {
                    phase: phase_type,
                    source,
                });
                return true;
            }
        };
        let round = match deps.manager.get_round(round_id) {
            Ok(round) => round,
            Err(_) => {
                deps.failer.fail_round(PhaseFailure::RoundNotFound(round_id));
                return true;
            }
        };
        if let Err(source) = phase.transition(State::Queued, State::Running) {
            deps.failer.fail_round(PhaseFailure::Phase {
                phase: phase_type,
                source,
            });
            return true;
        }
        phase.measure("active");
        debug!(round = round_id, phase = %phase_type, "phase running");

        let graph = Arc::clone(phase.graph());

        // Drain wrapper: the last pop finalizes the phase's states and
        // delivers the finish signal.
        let get_chunk: GetChunk = {
            let graph = Arc::clone(&graph);
            let phase = Arc::clone(&phase);
            let finish_tx = self.finish_tx.clone();
            Arc::new(move || {
                let graph = Arc::clone(&graph);
                let phase = Arc::clone(&phase);
                let finish_tx = finish_tx.clone();
                Box::pin(async move {
                    match graph.get_output().await {
                        Some(chunk) => Some(chunk),
                        None => {
                            let signal = match phase.update_final_states() {
                                Ok(()) => FinishSignal::Finished(phase),
                                Err(err) => FinishSignal::TransmitFailed(phase, err.into()),
                            };
                            let _ = finish_tx.send(signal).await;
                            None
                        }
                    }
                })
            })
        };
        let get_slot: GetSlot = {
            let graph = Arc::clone(&graph);
            Arc::new(move |index| graph.output_slot(index))
        };

        let ctx = TransmitCtx {
            round_id,
            phase_type,
            node_id: round.node_id().clone(),
            topology: Arc::clone(round.topology()),
            network: Arc::clone(&deps.network),
            get_chunk,
            get_slot,
            hooks: Arc::clone(&deps.hooks),
        };
        let transmission = Arc::clone(phase.transmission());
        let transmit_task = {
            let finish_tx = self.finish_tx.clone();
            let phase = Arc::clone(&phase);
            tokio::spawn(async move {
                if let Err(err) = (transmission)(ctx).await {
                    let _ = finish_tx
                        .send(FinishSignal::TransmitFailed(phase, err))
                        .await;
                }
            })
        };

        if let Err(source) = graph.run() {
            transmit_task.abort();
            deps.failer.fail_round(PhaseFailure::Graph {
                round: round_id,
                phase: phase_type,
                source,
            });
            return true;
        }

        tokio::select! {
            maybe = finish_rx.recv() => match maybe {
                Some(FinishSignal::Finished(done)) => {
                    if done.phase_type() != phase_type {
                        warn!(
                            round = round_id,
                            expected = %phase_type,
                            finished = %done.phase_type(),
                            "finish signal names a different phase",
                        );
                    }
                    phase.measure("finished");
                    let runtimes = graph.module_runtimes();
                    for runtime in &runtimes {
                        debug!(
                            round = round_id,
                            phase = %phase_type,
                            module = runtime.name,
                            adapt_micros = runtime.adapt.as_micros() as u64,
                            out_micros = runtime.out.as_micros() as u64,
                            "module runtime",
                        );
                    }
                    if let Some(path) = &deps.metric_log_path {
                        if let Err(err) = append_runtimes(path, round_id, phase_type, &runtimes) {
                            warn!(round = round_id, error = %err, "metric log write failed");
                        }
                    }
                    true
                }
                Some(FinishSignal::TransmitFailed(_, source)) => {
                    transmit_task.abort();
                    deps.failer.fail_round(PhaseFailure::Transmit {
                        round: round_id,
                        phase: phase_type,
                        source,
                    });
                    true
                }
                None => false,
            },
            _ = tokio::time::sleep(phase.timeout()) => {
                transmit_task.abort();
                deps.failer.fail_round(PhaseFailure::PhaseTimeout {
                    round: round_id,
                    phase: phase_type,
                    timeout: phase.timeout(),
                });
                true
            }
            Some(ack) = kill_rx.recv() => {
                transmit_task.abort();
                let _ = ack.send(());
                false
            }
        }
    }
}

fn append_runtimes(
    path: &Path,
    round: RoundId,
    phase: PhaseType,
    runtimes: &[ModuleRuntime],
) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for runtime in runtimes {
        writeln!(
            file,
            "round={} phase={} module={} adapt_micros={} out_micros={}",
            round,
            phase,
            runtime.name,
            runtime.adapt.as_micros(),
            runtime.out.as_micros(),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::{
        cryptops::rng::StreamGenerator,
        graph::{Chunk, Graph, InputSize, LinkCtx, Module, Slot, Stream, StreamError, ThreadCount},
        node::transport::LoopbackTransport,
        phase::{PhaseBuilder, PhaseType, TransmissionHandler},
        round::{
            responses::standard_responses,
            round::{Round, RoundExtras},
            topology::{Circuit, NodeId},
        },
        RoundId,
    };

    struct NullStream;

    impl Stream for NullStream {
        fn name(&self) -> &'static str {
            "null"
        }

        fn link(&mut self, _ctx: LinkCtx) -> Result<(), StreamError> {
            Ok(())
        }

        fn input(&self, _index: u32, _message: &Slot) -> Result<(), StreamError> {
            Ok(())
        }

        fn output(&self, _index: u32) -> Result<Slot, StreamError> {
            Ok(Slot::default())
        }
    }

    struct NullModule;

    impl Module<NullStream> for NullModule {
        fn name(&self) -> &'static str {
            "Null"
        }

        fn adapt(&self, _stream: &NullStream, _chunk: Chunk) -> Result<(), StreamError> {
            Ok(())
        }
    }

    /// Burns a little wall time per slot so chunk completions spread out.
    struct SlowModule;

    impl Module<NullStream> for SlowModule {
        fn name(&self) -> &'static str {
            "Slow"
        }

        fn input_size(&self) -> InputSize {
            InputSize::Fixed(1)
        }

        fn num_threads(&self) -> ThreadCount {
            ThreadCount::Fixed(4)
        }

        fn adapt(&self, _stream: &NullStream, _chunk: Chunk) -> Result<(), StreamError> {
            std::thread::sleep(Duration::from_micros(200));
            Ok(())
        }
    }

    /// Pulls chunks until the graph drains.
    fn draining_transmission() -> TransmissionHandler {
        Arc::new(|ctx: TransmitCtx| {
            Box::pin(async move {
                while (ctx.get_chunk)().await.is_some() {}
                Ok(())
            })
        })
    }

    /// Drains like [`draining_transmission`] but stamps each popped chunk.
    fn stamping_transmission(stamps: Arc<Mutex<Vec<(PhaseType, Instant)>>>) -> TransmissionHandler {
        Arc::new(move |ctx: TransmitCtx| {
            let stamps = Arc::clone(&stamps);
            Box::pin(async move {
                while (ctx.get_chunk)().await.is_some() {
                    stamps.lock().push((ctx.phase_type, Instant::now()));
                }
                Ok(())
            })
        })
    }

    fn sleeping_transmission(delay: Duration) -> TransmissionHandler {
        Arc::new(move |_ctx: TransmitCtx| {
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
        })
    }

    fn builder(
        phase_type: PhaseType,
        transmission: TransmissionHandler,
        timeout: Duration,
    ) -> PhaseBuilder {
        let mut graph = Graph::new("null", NullStream);
        let id = graph.add_module(Arc::new(NullModule));
        graph.first(id);
        graph.last(id);
        PhaseBuilder {
            phase_type,
            graph: Box::new(graph),
            transmission,
            timeout,
            verification: false,
        }
    }

    fn round_with(builders: Vec<PhaseBuilder>, id: RoundId) -> Arc<Round> {
        round_with_batch(builders, id, 4)
    }

    fn round_with_batch(builders: Vec<PhaseBuilder>, id: RoundId, batch_size: u32) -> Arc<Round> {
        let group = Arc::new(crate::group::tests::test_group());
        let node = NodeId::new(vec![1]);
        let topology = Arc::new(Circuit::new(vec![node.clone()]).unwrap());
        Round::new(
            group,
            id,
            builders,
            standard_responses(),
            topology,
            node,
            batch_size,
            StreamGenerator::new([4u8; 32]),
            RoundExtras::default(),
            Arc::new(|_| {}),
        )
        .unwrap()
    }

    struct NoopHooks;

    impl RoundHooks for NoopHooks {
        fn precomputation_complete(&self, _round_id: RoundId) {}
        fn realtime_complete(&self, _round_id: RoundId, _slots: Vec<Slot>) {}
    }

    #[derive(Default)]
    struct RecordingFailer {
        failures: Mutex<Vec<PhaseFailure>>,
    }

    impl RoundFailer for RecordingFailer {
        fn fail_round(&self, failure: PhaseFailure) {
            self.failures.lock().push(failure);
        }
    }

    fn deps(manager: Arc<RoundManager>, failer: Arc<RecordingFailer>) -> QueueDeps {
        QueueDeps {
            manager,
            network: LoopbackTransport::new(),
            hooks: Arc::new(NoopHooks),
            failer,
            metric_log_path: None,
        }
    }

    async fn wait_for_state(phase: &Arc<Phase>, wanted: State) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while phase.state().unwrap() != wanted {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "phase {} stuck in {}",
                phase.phase_type(),
                phase.state().unwrap()
            )
        });
    }

    #[tokio::test]
    async fn a_phase_runs_to_verified() {
        let round = round_with(
            vec![builder(
                PhaseType::PrecompGeneration,
                draining_transmission(),
                Duration::from_secs(5),
            )],
            1,
        );
        let manager = Arc::new(RoundManager::new());
        manager.add_round(Arc::clone(&round));

        let queue = Arc::new(ResourceQueue::new());
        let failer = Arc::new(RecordingFailer::default());
        let runner = {
            let queue = Arc::clone(&queue);
            let deps = deps(Arc::clone(&manager), Arc::clone(&failer));
            tokio::spawn(async move { queue.run(deps).await })
        };

        let phase = round.phase(PhaseType::PrecompGeneration).unwrap();
        assert!(phase.attempt_to_queue().unwrap());
        queue.queue_phase(Arc::clone(&phase)).unwrap();
        phase
            .graph()
            .send(Chunk::new(0, phase.graph().expanded_batch()))
            .await
            .unwrap();

        wait_for_state(&phase, State::Verified).await;
        assert!(failer.failures.lock().is_empty());

        queue.kill(Duration::from_secs(1)).await.unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn runtimes_land_in_the_metric_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.log");

        let round = round_with(
            vec![builder(
                PhaseType::PrecompGeneration,
                draining_transmission(),
                Duration::from_secs(5),
            )],
            7,
        );
        let manager = Arc::new(RoundManager::new());
        manager.add_round(Arc::clone(&round));

        let queue = Arc::new(ResourceQueue::new());
        let failer = Arc::new(RecordingFailer::default());
        let runner = {
            let queue = Arc::clone(&queue);
            let deps = QueueDeps {
                manager: Arc::clone(&manager),
                network: LoopbackTransport::new(),
                hooks: Arc::new(NoopHooks),
                failer: Arc::clone(&failer) as Arc<dyn RoundFailer>,
                metric_log_path: Some(path.clone()),
            };
            tokio::spawn(async move { queue.run(deps).await })
        };

        let phase = round.phase(PhaseType::PrecompGeneration).unwrap();
        assert!(phase.attempt_to_queue().unwrap());
        queue.queue_phase(Arc::clone(&phase)).unwrap();
        phase
            .graph()
            .send(Chunk::new(0, phase.graph().expanded_batch()))
            .await
            .unwrap();
        wait_for_state(&phase, State::Verified).await;

        // The write happens after the finish signal; poll for it.
        let log = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(log) = std::fs::read_to_string(&path) {
                    if log.contains("module=Null") {
                        break log;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(log.contains("round=7"));
        assert!(log.contains("phase=PrecompGeneration"));

        queue.kill(Duration::from_secs(1)).await.unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn phases_of_a_round_run_strictly_in_order() {
        let round = round_with(
            vec![
                builder(
                    PhaseType::PrecompGeneration,
                    draining_transmission(),
                    Duration::from_secs(5),
                ),
                builder(
                    PhaseType::PrecompShare,
                    draining_transmission(),
                    Duration::from_secs(5),
                ),
            ],
            2,
        );
        let manager = Arc::new(RoundManager::new());
        manager.add_round(Arc::clone(&round));

        let queue = Arc::new(ResourceQueue::new());
        let failer = Arc::new(RecordingFailer::default());
        let runner = {
            let queue = Arc::clone(&queue);
            let deps = deps(Arc::clone(&manager), Arc::clone(&failer));
            tokio::spawn(async move { queue.run(deps).await })
        };

        let first = round.phase(PhaseType::PrecompGeneration).unwrap();
        let second = round.phase(PhaseType::PrecompShare).unwrap();

        // The second phase cannot be claimed before the first computes.
        assert!(!second.attempt_to_queue().unwrap());

        assert!(first.attempt_to_queue().unwrap());
        queue.queue_phase(Arc::clone(&first)).unwrap();
        first
            .graph()
            .send(Chunk::new(0, first.graph().expanded_batch()))
            .await
            .unwrap();
        wait_for_state(&first, State::Verified).await;

        assert!(second.attempt_to_queue().unwrap());
        queue.queue_phase(Arc::clone(&second)).unwrap();
        second
            .graph()
            .send(Chunk::new(0, second.graph().expanded_batch()))
            .await
            .unwrap();
        wait_for_state(&second, State::Verified).await;

        assert!(failer.failures.lock().is_empty());
        queue.kill(Duration::from_secs(1)).await.unwrap();
        runner.await.unwrap();
    }

    fn slow_builder(phase_type: PhaseType, transmission: TransmissionHandler) -> PhaseBuilder {
        let mut graph = Graph::new("slow", NullStream);
        let id = graph.add_module(Arc::new(SlowModule));
        graph.first(id);
        graph.last(id);
        PhaseBuilder {
            phase_type,
            graph: Box::new(graph),
            transmission,
            timeout: Duration::from_secs(30),
            verification: false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn chunks_of_later_phases_never_precede_earlier_ones() {
        const BATCH: u32 = 100;

        let stamps: Arc<Mutex<Vec<(PhaseType, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let phases = [
            PhaseType::PrecompGeneration,
            PhaseType::PrecompShare,
            PhaseType::PrecompDecrypt,
        ];
        let round = round_with_batch(
            phases
                .iter()
                .map(|&phase_type| {
                    slow_builder(phase_type, stamping_transmission(Arc::clone(&stamps)))
                })
                .collect(),
            9,
            BATCH,
        );
        let manager = Arc::new(RoundManager::new());
        manager.add_round(Arc::clone(&round));

        let queue = Arc::new(ResourceQueue::new());
        let failer = Arc::new(RecordingFailer::default());
        let runner = {
            let queue = Arc::clone(&queue);
            let deps = deps(Arc::clone(&manager), Arc::clone(&failer));
            tokio::spawn(async move { queue.run(deps).await })
        };

        // Each phase is claimed as soon as the state word allows it, from
        // its own task; only the CAS ordering keeps them sequential.
        let mut claims = Vec::new();
        for &phase_type in &phases {
            let round = Arc::clone(&round);
            let queue = Arc::clone(&queue);
            claims.push(tokio::spawn(async move {
                let phase = round.phase(phase_type).unwrap();
                loop {
                    if phase.attempt_to_queue().unwrap() {
                        queue.queue_phase(Arc::clone(&phase)).unwrap();
                        phase
                            .graph()
                            .send(Chunk::new(0, phase.graph().expanded_batch()))
                            .await
                            .unwrap();
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }));
        }
        for claim in claims {
            claim.await.unwrap();
        }
        let last = round.phase(PhaseType::PrecompDecrypt).unwrap();
        wait_for_state(&last, State::Verified).await;
        assert!(failer.failures.lock().is_empty());

        let stamps = stamps.lock();
        let times = |wanted: PhaseType| {
            stamps
                .iter()
                .filter(|(phase_type, _)| *phase_type == wanted)
                .map(|(_, at)| *at)
                .collect::<Vec<_>>()
        };
        for pair in phases.windows(2) {
            let earlier = times(pair[0]);
            let later = times(pair[1]);
            assert_eq!(earlier.len(), BATCH as usize);
            assert_eq!(later.len(), BATCH as usize);
            assert!(
                earlier.iter().max().unwrap() <= later.iter().min().unwrap(),
                "a {} chunk completed before the last {} chunk",
                pair[1],
                pair[0],
            );
        }
        drop(stamps);

        queue.kill(Duration::from_secs(1)).await.unwrap();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_slow_transmission_times_the_phase_out() {
        let round = round_with(
            vec![builder(
                PhaseType::PrecompGeneration,
                sleeping_transmission(Duration::from_millis(100)),
                Duration::from_millis(10),
            )],
            3,
        );
        let manager = Arc::new(RoundManager::new());
        manager.add_round(Arc::clone(&round));

        let queue = Arc::new(ResourceQueue::new());
        let failer = Arc::new(RecordingFailer::default());
        let runner = {
            let queue = Arc::clone(&queue);
            let deps = deps(Arc::clone(&manager), Arc::clone(&failer));
            tokio::spawn(async move { queue.run(deps).await })
        };

        let phase = round.phase(PhaseType::PrecompGeneration).unwrap();
        assert!(phase.attempt_to_queue().unwrap());
        queue.queue_phase(Arc::clone(&phase)).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !failer.failures.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let failures = failer.failures.lock();
        assert!(matches!(
            failures[0],
            PhaseFailure::PhaseTimeout { round: 3, .. }
        ));
        drop(failures);

        queue.kill(Duration::from_secs(1)).await.unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn an_unregistered_round_is_failed() {
        let round = round_with(
            vec![builder(
                PhaseType::PrecompGeneration,
                draining_transmission(),
                Duration::from_secs(5),
            )],
            4,
        );
        // The round is never added to the manager.
        let manager = Arc::new(RoundManager::new());
        let queue = Arc::new(ResourceQueue::new());
        let failer = Arc::new(RecordingFailer::default());
        let runner = {
            let queue = Arc::clone(&queue);
            let deps = deps(Arc::clone(&manager), Arc::clone(&failer));
            tokio::spawn(async move { queue.run(deps).await })
        };

        let phase = round.phase(PhaseType::PrecompGeneration).unwrap();
        assert!(phase.attempt_to_queue().unwrap());
        queue.queue_phase(phase).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !failer.failures.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            failer.failures.lock()[0],
            PhaseFailure::RoundNotFound(4)
        ));

        queue.kill(Duration::from_secs(1)).await.unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn kill_is_acknowledged_and_idempotent() {
        let queue = Arc::new(ResourceQueue::new());
        let manager = Arc::new(RoundManager::new());
        let failer = Arc::new(RecordingFailer::default());
        let runner = {
            let queue = Arc::clone(&queue);
            let deps = deps(manager, failer);
            tokio::spawn(async move { queue.run(deps).await })
        };

        // Give the runner a moment to take its channels.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.kill(Duration::from_secs(1)).await.unwrap();
        runner.await.unwrap();

        // A second kill is a no-op.
        queue.kill(Duration::from_secs(1)).await.unwrap();
        assert!(!queue.is_running());
    }
}
