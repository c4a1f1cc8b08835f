//! The dataflow executor: a topologically ordered chain of modules
//! connected by chunk channels, driven by a tokio worker pool.
//!
//! A graph is *built* with a concrete batch size (rounded up to the
//! expanded batch size so every module's input width divides it), *linked*
//! to a stream that provides the round buffer, and *run*, which spawns the
//! per-module workers. Chunks flow through the chain in module order;
//! across modules they may complete out of order. Back-pressure falls out
//! of the bounded chunk channels: a producer blocks when the next module's
//! queue is full.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};

use super::{
    chunk::Chunk,
    module::{InputSize, Module, ThreadCount},
    stream::{LinkCtx, Slot, Stream, StreamError},
};

/// Invoked when a module fails; terminal for the round that owns the
/// graph.
pub type ErrorHandler = Arc<dyn Fn(GraphError) + Send + Sync>;

/// An error produced by graph construction or execution.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A lifecycle method was called out of order.
    #[error("graph `{graph}` is not {expected}")]
    InvalidState {
        graph: &'static str,
        expected: &'static str,
    },
    /// The module chain has no designated first or last module, or a gap.
    #[error("graph `{0}` has an incomplete module chain")]
    IncompleteChain(&'static str),
    /// A module returned an error; the graph is draining.
    #[error("module `{module}` failed: {source}")]
    ModuleFailed {
        module: &'static str,
        #[source]
        source: StreamError,
    },
    /// A chunk exceeds the expanded batch.
    #[error("chunk [{begin}, {end}) exceeds the expanded batch size {expanded}")]
    OutsideExpandedBatch { begin: u32, end: u32, expanded: u32 },
    /// The graph's input channel is closed (the batch already drained).
    #[error("graph `{0}` no longer accepts input")]
    InputClosed(&'static str),
    /// Linking the stream failed.
    #[error(transparent)]
    Link(#[from] StreamError),
}

/// The opaque handle returned by [`Graph::add_module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleId(usize);

/// Cumulative wall times of one module, for the round metrics.
#[derive(Debug, Clone)]
pub struct ModuleRuntime {
    pub name: &'static str,
    pub adapt: Duration,
    pub out: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GraphState {
    Created,
    Built,
    Linked,
    Running,
}

/// Holds chunks back until a module's start threshold is reached, then
/// splits them to the consumer's input width.
struct Gate {
    required: u32,
    state: AsyncMutex<GateState>,
}

struct GateState {
    open: bool,
    seen: u32,
    pending: Vec<Chunk>,
}

impl Gate {
    fn new(required: u32) -> Self {
        Self {
            required,
            state: AsyncMutex::new(GateState {
                open: required == 0,
                seen: 0,
                pending: Vec::new(),
            }),
        }
    }

    async fn send(&self, tx: &mpsc::Sender<Chunk>, width: u32, chunk: Chunk) -> Result<(), ()> {
        let mut state = self.state.lock().await;
        if !state.open {
            state.seen += chunk.len();
            state.pending.push(chunk);
            if state.seen < self.required {
                return Ok(());
            }
            state.open = true;
            let pending = std::mem::take(&mut state.pending);
            for held in pending {
                for piece in held.split(width) {
                    tx.send(piece).await.map_err(|_| ())?;
                }
            }
            return Ok(());
        }
        drop(state);
        for piece in chunk.split(width) {
            tx.send(piece).await.map_err(|_| ())?;
        }
        Ok(())
    }
}

struct ModuleSlot<S> {
    module: Arc<dyn Module<S>>,
    input_size: u32,
    threads: u32,
    gate: Arc<Gate>,
    tx: Mutex<Option<mpsc::Sender<Chunk>>>,
    rx: Mutex<Option<mpsc::Receiver<Chunk>>>,
    adapt_nanos: Arc<AtomicU64>,
    out_nanos: Arc<AtomicU64>,
}

/// A dataflow graph over a concrete stream type.
pub struct Graph<S: Stream> {
    name: &'static str,
    default_threads: u32,
    modules: Vec<ModuleSlot<S>>,
    next_of: Vec<Option<usize>>,
    first: Option<usize>,
    last: Option<usize>,
    batch_size: u32,
    expanded_batch: u32,
    state: Mutex<GraphState>,
    stream: Mutex<Option<S>>,
    linked: OnceCell<Arc<S>>,
    error_handler: OnceCell<ErrorHandler>,
    input_tx: Mutex<Option<mpsc::Sender<Chunk>>>,
    output_tx: Mutex<Option<mpsc::Sender<Chunk>>>,
    output_rx: AsyncMutex<Option<mpsc::Receiver<Chunk>>>,
    emitted: AtomicU32,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Stream> Graph<S> {
    /// Creates an empty graph owning `stream`.
    pub fn new(name: &'static str, stream: S) -> Self {
        let default_threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);
        Self {
            name,
            default_threads,
            modules: Vec::new(),
            next_of: Vec::new(),
            first: None,
            last: None,
            batch_size: 0,
            expanded_batch: 0,
            state: Mutex::new(GraphState::Created),
            stream: Mutex::new(Some(stream)),
            linked: OnceCell::new(),
            error_handler: OnceCell::new(),
            input_tx: Mutex::new(None),
            output_tx: Mutex::new(None),
            output_rx: AsyncMutex::new(None),
            emitted: AtomicU32::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the default worker count used for `ThreadCount::Auto`
    /// modules.
    pub fn set_default_threads(&mut self, threads: u32) {
        self.default_threads = threads.max(1);
    }

    /// Registers a module; call [`Graph::connect`] to wire it.
    pub fn add_module(&mut self, module: Arc<dyn Module<S>>) -> ModuleId {
        self.modules.push(ModuleSlot {
            module,
            input_size: 1,
            threads: 1,
            gate: Arc::new(Gate::new(0)),
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            adapt_nanos: Arc::new(AtomicU64::new(0)),
            out_nanos: Arc::new(AtomicU64::new(0)),
        });
        self.next_of.push(None);
        ModuleId(self.modules.len() - 1)
    }

    /// Makes `to` consume the outputs of `from`.
    pub fn connect(&mut self, from: ModuleId, to: ModuleId) {
        self.next_of[from.0] = Some(to.0);
    }

    /// Designates the module that consumes external input.
    pub fn first(&mut self, id: ModuleId) {
        self.first = Some(id.0);
    }

    /// Designates the module whose outputs leave the graph.
    pub fn last(&mut self, id: ModuleId) {
        self.last = Some(id.0);
    }

    /// The batch size the graph was built for.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// The batch size rounded up to align with every module's input width.
    pub fn expanded_batch(&self) -> u32 {
        self.expanded_batch
    }

    /// Computes the expanded batch size, resolves auto input sizes and
    /// thread counts, and allocates the chunk channels.
    pub fn build(&mut self, batch_size: u32, handler: ErrorHandler) -> Result<(), GraphError> {
        {
            let mut state = self.state.lock();
            if *state != GraphState::Created {
                return Err(GraphError::InvalidState {
                    graph: self.name,
                    expected: "newly created",
                });
            }
            *state = GraphState::Built;
        }
        let first = self.first.ok_or(GraphError::IncompleteChain(self.name))?;
        let last = self.last.ok_or(GraphError::IncompleteChain(self.name))?;
        self.validate_chain(first, last)?;

        self.batch_size = batch_size;
        let _ = self.error_handler.set(handler);

        // Resolve thread counts first; auto input sizes depend on them.
        for slot in &mut self.modules {
            slot.threads = match slot.module.num_threads() {
                ThreadCount::Auto => self.default_threads,
                ThreadCount::Fixed(n) => n.max(1),
            };
        }
        let mut max_input = 1;
        for slot in &mut self.modules {
            slot.input_size = match slot.module.input_size() {
                InputSize::Fixed(n) => n.max(1),
                InputSize::Auto => (batch_size / (slot.threads * 4)).max(1),
            };
            max_input = max_input.max(slot.input_size);
        }
        self.expanded_batch = ((batch_size + max_input - 1) / max_input) * max_input;

        for slot in &mut self.modules {
            let capacity = (slot.input_size * slot.threads) as usize;
            let (tx, rx) = mpsc::channel(capacity.max(1));
            *slot.tx.lock() = Some(tx);
            *slot.rx.lock() = Some(rx);
            let required = (slot.module.start_threshold() * self.expanded_batch as f32).ceil();
            slot.gate = Arc::new(Gate::new(required as u32));
        }

        let last_slot = &self.modules[last];
        let (out_tx, out_rx) = mpsc::channel((last_slot.input_size * last_slot.threads).max(1) as usize);
        *self.output_tx.lock() = Some(out_tx);
        self.output_rx = AsyncMutex::new(Some(out_rx));
        *self.input_tx.lock() = self.modules[first].tx.lock().clone();
        Ok(())
    }

    /// Raises the expanded batch to at least `expanded`. Callable between
    /// `build` and `link`, for rounds whose phases must share one slot
    /// domain even though their modules have different input widths.
    pub fn grow_expanded(&mut self, expanded: u32) -> Result<(), GraphError> {
        {
            let state = self.state.lock();
            if *state != GraphState::Built {
                return Err(GraphError::InvalidState {
                    graph: self.name,
                    expected: "built",
                });
            }
        }
        if expanded <= self.expanded_batch {
            return Ok(());
        }
        self.expanded_batch = expanded;
        // Gate thresholds are fractions of the expanded batch.
        for slot in &mut self.modules {
            let required = (slot.module.start_threshold() * self.expanded_batch as f32).ceil();
            slot.gate = Arc::new(Gate::new(required as u32));
        }
        Ok(())
    }

    fn validate_chain(&self, first: usize, last: usize) -> Result<(), GraphError> {
        let mut visited = 0;
        let mut cursor = first;
        loop {
            visited += 1;
            if visited > self.modules.len() {
                return Err(GraphError::IncompleteChain(self.name));
            }
            match self.next_of[cursor] {
                Some(next) => cursor = next,
                None => break,
            }
        }
        if cursor != last || visited != self.modules.len() {
            return Err(GraphError::IncompleteChain(self.name));
        }
        Ok(())
    }

    /// Links the stream to the round buffer and extras.
    pub fn link(&mut self, ctx: LinkCtx) -> Result<(), GraphError> {
        {
            let mut state = self.state.lock();
            if *state != GraphState::Built {
                return Err(GraphError::InvalidState {
                    graph: self.name,
                    expected: "built",
                });
            }
            *state = GraphState::Linked;
        }
        let mut stream = self
            .stream
            .lock()
            .take()
            .ok_or(GraphError::InvalidState {
                graph: self.name,
                expected: "holding its stream",
            })?;
        stream.link(ctx)?;
        let _ = self.linked.set(Arc::new(stream));
        Ok(())
    }

    /// Spawns the per-module workers.
    pub fn run(&self) -> Result<(), GraphError> {
        {
            let mut state = self.state.lock();
            if *state != GraphState::Linked {
                return Err(GraphError::InvalidState {
                    graph: self.name,
                    expected: "linked",
                });
            }
            *state = GraphState::Running;
        }
        let stream = self
            .linked
            .get()
            .cloned()
            .ok_or(GraphError::InvalidState {
                graph: self.name,
                expected: "linked",
            })?;
        let handler = self
            .error_handler
            .get()
            .cloned()
            .ok_or(GraphError::InvalidState {
                graph: self.name,
                expected: "built with an error handler",
            })?;

        // Original senders are dropped at the end of this scope so every
        // channel closes once its upstream workers exit.
        let senders: Vec<Option<mpsc::Sender<Chunk>>> =
            self.modules.iter().map(|m| m.tx.lock().take()).collect();
        let out_tx = self
            .output_tx
            .lock()
            .take()
            .ok_or(GraphError::InvalidState {
                graph: self.name,
                expected: "holding its output channel",
            })?;

        let mut workers = self.workers.lock();
        for (idx, slot) in self.modules.iter().enumerate() {
            let rx = slot.rx.lock().take().ok_or(GraphError::InvalidState {
                graph: self.name,
                expected: "holding its input channels",
            })?;
            let rx = Arc::new(AsyncMutex::new(rx));
            let (next_tx, next_width, next_gate) = match self.next_of[idx] {
                Some(j) => (
                    senders[j].clone().ok_or(GraphError::IncompleteChain(self.name))?,
                    self.modules[j].input_size,
                    Some(Arc::clone(&self.modules[j].gate)),
                ),
                None => (out_tx.clone(), slot.input_size, None),
            };
            for _ in 0..slot.threads {
                workers.push(tokio::spawn(worker_loop(
                    Arc::clone(&slot.module),
                    Arc::clone(&stream),
                    Arc::clone(&rx),
                    next_tx.clone(),
                    next_width,
                    next_gate.clone(),
                    Arc::clone(&slot.adapt_nanos),
                    Arc::clone(&slot.out_nanos),
                    Arc::clone(&handler),
                )));
            }
        }
        Ok(())
    }

    /// Feeds a chunk to the first module. The external entry point.
    pub async fn send(&self, chunk: Chunk) -> Result<(), GraphError> {
        if chunk.end() > self.expanded_batch {
            return Err(GraphError::OutsideExpandedBatch {
                begin: chunk.begin(),
                end: chunk.end(),
                expanded: self.expanded_batch,
            });
        }
        let tx = self
            .input_tx
            .lock()
            .clone()
            .ok_or(GraphError::InputClosed(self.name))?;
        let first = self.first.ok_or(GraphError::IncompleteChain(self.name))?;
        let slot = &self.modules[first];
        slot.gate
            .send(&tx, slot.input_size, chunk)
            .await
            .map_err(|_| GraphError::InputClosed(self.name))
    }

    /// Pops the next completed chunk, or `None` once the expanded batch has
    /// drained.
    pub async fn get_output(&self) -> Option<Chunk> {
        let mut guard = self.output_rx.lock().await;
        let rx = guard.as_mut()?;
        match rx.recv().await {
            Some(chunk) => {
                let emitted = self.emitted.fetch_add(chunk.len(), Ordering::SeqCst) + chunk.len();
                if emitted >= self.expanded_batch {
                    // Close the input so the worker chain winds down.
                    self.input_tx.lock().take();
                }
                Some(chunk)
            }
            None => {
                *guard = None;
                None
            }
        }
    }

    /// The linked stream, for slot input/output.
    pub fn stream(&self) -> Option<&Arc<S>> {
        self.linked.get()
    }

    /// Cumulative per-module wall times.
    pub fn module_runtimes(&self) -> Vec<ModuleRuntime> {
        self.modules
            .iter()
            .map(|slot| ModuleRuntime {
                name: slot.module.name(),
                adapt: Duration::from_nanos(slot.adapt_nanos.load(Ordering::Relaxed)),
                out: Duration::from_nanos(slot.out_nanos.load(Ordering::Relaxed)),
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<S: Stream>(
    module: Arc<dyn Module<S>>,
    stream: Arc<S>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Chunk>>>,
    next_tx: mpsc::Sender<Chunk>,
    next_width: u32,
    next_gate: Option<Arc<Gate>>,
    adapt_nanos: Arc<AtomicU64>,
    out_nanos: Arc<AtomicU64>,
    handler: ErrorHandler,
) {
    loop {
        let chunk = { rx.lock().await.recv().await };
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => break,
        };

        let started = Instant::now();
        let result = module.adapt(stream.as_ref(), chunk);
        adapt_nanos.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

        if let Err(err) = result {
            error!(module = module.name(), error = %err, "module failed, draining graph");
            handler(GraphError::ModuleFailed {
                module: module.name(),
                source: err,
            });
            return;
        }

        let started = Instant::now();
        let sent = match &next_gate {
            Some(gate) => gate.send(&next_tx, next_width, chunk).await.is_ok(),
            None => next_tx.send(chunk).await.is_ok(),
        };
        out_nanos.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        if !sent {
            return;
        }
    }
}

/// A graph before type erasure: buildable and linkable, then converted into
/// a shared [`GraphRunner`].
pub trait BuildableGraph: Send {
    fn name(&self) -> &'static str;
    fn build(&mut self, batch_size: u32, handler: ErrorHandler) -> Result<(), GraphError>;
    fn grow_expanded(&mut self, expanded: u32) -> Result<(), GraphError>;
    fn link(&mut self, ctx: LinkCtx) -> Result<(), GraphError>;
    fn expanded_batch(&self) -> u32;
    fn into_runner(self: Box<Self>) -> Arc<dyn GraphRunner>;
}

impl<S: Stream> BuildableGraph for Graph<S> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn build(&mut self, batch_size: u32, handler: ErrorHandler) -> Result<(), GraphError> {
        Graph::build(self, batch_size, handler)
    }

    fn grow_expanded(&mut self, expanded: u32) -> Result<(), GraphError> {
        Graph::grow_expanded(self, expanded)
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), GraphError> {
        Graph::link(self, ctx)
    }

    fn expanded_batch(&self) -> u32 {
        self.expanded_batch
    }

    fn into_runner(self: Box<Self>) -> Arc<dyn GraphRunner> {
        Arc::new(*self)
    }
}

/// The object-safe face of a linked graph, held by its phase.
#[async_trait]
pub trait GraphRunner: Send + Sync {
    fn name(&self) -> &'static str;
    fn batch_size(&self) -> u32;
    fn expanded_batch(&self) -> u32;
    fn run(&self) -> Result<(), GraphError>;
    async fn send(&self, chunk: Chunk) -> Result<(), GraphError>;
    async fn get_output(&self) -> Option<Chunk>;
    fn input_slot(&self, index: u32, message: &Slot) -> Result<(), StreamError>;
    fn output_slot(&self, index: u32) -> Result<Slot, StreamError>;
    fn module_runtimes(&self) -> Vec<ModuleRuntime>;
}

#[async_trait]
impl<S: Stream> GraphRunner for Graph<S> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn batch_size(&self) -> u32 {
        self.batch_size
    }

    fn expanded_batch(&self) -> u32 {
        self.expanded_batch
    }

    fn run(&self) -> Result<(), GraphError> {
        Graph::run(self)
    }

    async fn send(&self, chunk: Chunk) -> Result<(), GraphError> {
        Graph::send(self, chunk).await
    }

    async fn get_output(&self) -> Option<Chunk> {
        Graph::get_output(self).await
    }

    fn input_slot(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let stream = self.linked.get().ok_or(StreamError::NotLinked(self.name))?;
        stream.input(index, message)
    }

    fn output_slot(&self, index: u32) -> Result<Slot, StreamError> {
        let stream = self.linked.get().ok_or(StreamError::NotLinked(self.name))?;
        stream.output(index)
    }

    fn module_runtimes(&self) -> Vec<ModuleRuntime> {
        self.module_runtimes()
    }
}
