//! A unit of graph work: consumes a chunk, calls its cryptop, emits the
//! chunk downstream.

use super::{chunk::Chunk, stream::Stream, stream::StreamError};

/// The preferred chunk width of a module's input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSize {
    /// Let the graph pick a width from the batch size and thread count.
    Auto,
    /// Deliver chunks of at most this many slots.
    Fixed(u32),
}

/// The number of workers dedicated to a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCount {
    /// Use the graph's configured default.
    Auto,
    /// Spawn exactly this many workers.
    Fixed(u32),
}

/// A module of a dataflow graph.
///
/// `adapt` is conceptually pure over its input chunk: it reads and writes
/// only the slots in `chunk`, through the stream. A returned error is
/// terminal for the graph and surfaces through the graph's error handler;
/// per-slot client failures are not errors and go through the client
/// failure reporter instead.
pub trait Module<S: Stream>: Send + Sync + 'static {
    /// The module's name, used in metrics and failure reports.
    fn name(&self) -> &'static str;

    /// The preferred input chunk width.
    fn input_size(&self) -> InputSize {
        InputSize::Auto
    }

    /// The worker count for this module.
    fn num_threads(&self) -> ThreadCount {
        ThreadCount::Auto
    }

    /// The fraction of the expanded batch that must be enqueued before this
    /// module starts processing. Zero starts immediately.
    fn start_threshold(&self) -> f32 {
        0.0
    }

    /// Processes one chunk against the stream.
    fn adapt(&self, stream: &S, chunk: Chunk) -> Result<(), StreamError>;
}
