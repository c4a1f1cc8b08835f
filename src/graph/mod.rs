//! The dataflow runtime: graphs of modules connected by chunk channels.
//!
//! Every phase of a round owns one [`Graph`]. The graph is built for a
//! concrete batch size, linked to the round buffer through its [`Stream`],
//! and run on the tokio worker pool. See the [`graph`](self) submodules for
//! the executor, the module contract and the stream contract.

pub mod chunk;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod module;
pub mod stream;

pub use self::{
    chunk::Chunk,
    graph::{
        BuildableGraph, ErrorHandler, Graph, GraphError, GraphRunner, ModuleId, ModuleRuntime,
    },
    module::{InputSize, Module, ThreadCount},
    stream::{LinkCtx, Slot, Stream, StreamError},
};

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        cryptops::rng::StreamGenerator,
        group::tests::test_group,
        round::buffer::RoundBuffer,
    };

    /// A stream over plain counters, for exercising the executor without
    /// group arithmetic.
    struct CounterStream {
        values: Vec<AtomicU32>,
        expanded: AtomicU32,
    }

    impl CounterStream {
        fn new(capacity: usize) -> Self {
            Self {
                values: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
                expanded: AtomicU32::new(0),
            }
        }
    }

    impl Stream for CounterStream {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
            self.expanded.store(ctx.expanded_batch, Ordering::SeqCst);
            Ok(())
        }

        fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
            let batch = self.expanded.load(Ordering::SeqCst);
            if index >= batch {
                return Err(StreamError::OutsideOfBatch { index, batch });
            }
            let value = message.payload_a.first().copied().unwrap_or(0) as u32;
            self.values[index as usize].store(value, Ordering::SeqCst);
            Ok(())
        }

        fn output(&self, index: u32) -> Result<Slot, StreamError> {
            let batch = self.expanded.load(Ordering::SeqCst);
            if index >= batch {
                return Err(StreamError::OutsideOfBatch { index, batch });
            }
            Ok(Slot {
                payload_a: vec![self.values[index as usize].load(Ordering::SeqCst) as u8],
                ..Slot::default()
            })
        }
    }

    struct AddOne;

    impl Module<CounterStream> for AddOne {
        fn name(&self) -> &'static str {
            "AddOne"
        }

        fn input_size(&self) -> InputSize {
            InputSize::Fixed(4)
        }

        fn num_threads(&self) -> ThreadCount {
            ThreadCount::Fixed(2)
        }

        fn adapt(&self, stream: &CounterStream, chunk: Chunk) -> Result<(), StreamError> {
            for slot in chunk.range() {
                stream.values[slot as usize].fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct Double;

    impl Module<CounterStream> for Double {
        fn name(&self) -> &'static str {
            "Double"
        }

        fn input_size(&self) -> InputSize {
            InputSize::Fixed(2)
        }

        fn num_threads(&self) -> ThreadCount {
            ThreadCount::Fixed(3)
        }

        fn adapt(&self, stream: &CounterStream, chunk: Chunk) -> Result<(), StreamError> {
            for slot in chunk.range() {
                let old = stream.values[slot as usize].load(Ordering::SeqCst);
                stream.values[slot as usize].store(old * 2, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct FailOnSlotZero;

    impl Module<CounterStream> for FailOnSlotZero {
        fn name(&self) -> &'static str {
            "FailOnSlotZero"
        }

        fn adapt(&self, _stream: &CounterStream, chunk: Chunk) -> Result<(), StreamError> {
            if chunk.begin() == 0 {
                return Err(StreamError::OutsideOfGroup);
            }
            Ok(())
        }
    }

    fn link_ctx(expanded: u32) -> LinkCtx {
        let group = Arc::new(test_group());
        let buffer = Arc::new(RoundBuffer::new(&group, expanded, expanded));
        LinkCtx {
            group,
            buffer,
            expanded_batch: expanded,
            round_id: 1,
            rng: StreamGenerator::new([7u8; 32]),
            client_errors: None,
            secrets: None,
        }
    }

    fn noop_handler() -> ErrorHandler {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn chunks_partition_the_expanded_batch() {
        let mut graph = Graph::new("partition", CounterStream::new(32));
        let add = graph.add_module(Arc::new(AddOne));
        let double = graph.add_module(Arc::new(Double));
        graph.connect(add, double);
        graph.first(add);
        graph.last(double);

        // Batch 10 rounds up to 12: AddOne's fixed input size is 4.
        graph.build(10, noop_handler()).unwrap();
        assert_eq!(graph.expanded_batch(), 12);

        graph.link(link_ctx(graph.expanded_batch())).unwrap();
        graph.run().unwrap();

        graph.send(Chunk::new(0, 12)).await.unwrap();

        let mut seen = vec![false; 12];
        while let Some(chunk) = graph.get_output().await {
            for slot in chunk.range() {
                assert!(!seen[slot as usize], "slot {} emitted twice", slot);
                seen[slot as usize] = true;
            }
        }
        assert!(seen.iter().all(|&s| s), "not every slot was emitted");

        // (0 + 1) * 2 on every slot.
        let stream = graph.stream().unwrap();
        for slot in &stream.values {
            assert_eq!(slot.load(Ordering::SeqCst), 2);
        }
    }

    #[tokio::test]
    async fn module_failure_reaches_the_error_handler() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: ErrorHandler = {
            let failures = Arc::clone(&failures);
            let seen = Arc::clone(&seen);
            Arc::new(move |err| {
                failures.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(err.to_string());
            })
        };

        let mut graph = Graph::new("failing", CounterStream::new(8));
        let failing = graph.add_module(Arc::new(FailOnSlotZero));
        graph.first(failing);
        graph.last(failing);
        graph.build(8, handler).unwrap();
        graph.link(link_ctx(graph.expanded_batch())).unwrap();
        graph.run().unwrap();

        graph.send(Chunk::new(0, 8)).await.unwrap();

        // The drain never completes: the failed chunk is never emitted.
        let emitted = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            async {
                let mut total = 0;
                while let Some(chunk) = graph.get_output().await {
                    total += chunk.len();
                    if total >= 8 {
                        break;
                    }
                }
                total
            },
        )
        .await;
        assert!(emitted.is_err() || emitted.unwrap() < 8);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(seen.lock()[0].contains("FailOnSlotZero"));
    }

    #[tokio::test]
    async fn a_grown_graph_accepts_the_larger_domain() {
        let mut graph = Graph::new("grown", CounterStream::new(8));
        let add = graph.add_module(Arc::new(AddOne));
        graph.first(add);
        graph.last(add);
        graph.build(4, noop_handler()).unwrap();
        assert_eq!(graph.expanded_batch(), 4);

        graph.grow_expanded(8).unwrap();
        assert_eq!(graph.expanded_batch(), 8);

        graph.link(link_ctx(8)).unwrap();
        graph.run().unwrap();
        graph.send(Chunk::new(0, 8)).await.unwrap();

        let mut emitted = 0;
        while let Some(chunk) = graph.get_output().await {
            emitted += chunk.len();
        }
        assert_eq!(emitted, 8);
    }

    #[tokio::test]
    async fn growing_below_the_current_expansion_is_a_no_op() {
        let mut graph = Graph::new("shrink", CounterStream::new(8));
        let add = graph.add_module(Arc::new(AddOne));
        graph.first(add);
        graph.last(add);
        graph.build(8, noop_handler()).unwrap();
        graph.grow_expanded(2).unwrap();
        assert_eq!(graph.expanded_batch(), 8);
    }

    #[tokio::test]
    async fn incomplete_chain_is_rejected_at_build() {
        let mut graph = Graph::new("incomplete", CounterStream::new(4));
        let add = graph.add_module(Arc::new(AddOne));
        let double = graph.add_module(Arc::new(Double));
        // `double` is never connected.
        graph.first(add);
        graph.last(double);
        assert!(matches!(
            graph.build(4, noop_handler()),
            Err(GraphError::IncompleteChain(_))
        ));
    }

    #[tokio::test]
    async fn send_beyond_expanded_batch_is_rejected() {
        let mut graph = Graph::new("bounds", CounterStream::new(4));
        let add = graph.add_module(Arc::new(AddOne));
        graph.first(add);
        graph.last(add);
        graph.build(4, noop_handler()).unwrap();
        graph.link(link_ctx(graph.expanded_batch())).unwrap();
        graph.run().unwrap();

        assert!(matches!(
            graph.send(Chunk::new(0, 64)).await,
            Err(GraphError::OutsideExpandedBatch { .. })
        ));
    }
}
