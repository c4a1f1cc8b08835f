//! A phase: one graph plus the machinery to run it inside a round.
//!
//! A round is an ordered list of phases. Each phase owns a type-erased
//! graph, a transmission handler that forwards the graph's outputs to the
//! next node, an execution timeout for the resource queue, and a
//! verification flag. The phase's position in the round binds it to the
//! round's shared state word; all state queries and transitions go through
//! that binding.

pub mod state;

pub use self::state::{RoundStateWord, State, StateError, MAX_PHASES};

use std::{convert::TryFrom, fmt, sync::Arc, time::Duration, time::Instant};

use derive_more::Display;
use futures::future::BoxFuture;
use num_enum::TryFromPrimitive;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    graph::{BuildableGraph, Chunk, GraphRunner, Slot, StreamError},
    node::transport::TransportError,
    round::topology::{Circuit, NodeId},
    RoundId,
};

/// The nine phases of a round, in execution order.
///
/// The first six precompute the decryption factors; the last three carry
/// client traffic.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum PhaseType {
    #[display(fmt = "PrecompGeneration")]
    PrecompGeneration = 0,
    #[display(fmt = "PrecompShare")]
    PrecompShare = 1,
    #[display(fmt = "PrecompDecrypt")]
    PrecompDecrypt = 2,
    #[display(fmt = "PrecompPermute")]
    PrecompPermute = 3,
    #[display(fmt = "PrecompReveal")]
    PrecompReveal = 4,
    #[display(fmt = "PrecompStrip")]
    PrecompStrip = 5,
    #[display(fmt = "RealDecrypt")]
    RealDecrypt = 6,
    #[display(fmt = "RealPermute")]
    RealPermute = 7,
    #[display(fmt = "RealIdentify")]
    RealIdentify = 8,
}

impl PhaseType {
    /// The number of phase types.
    pub const COUNT: usize = 9;

    /// All phase types in execution order.
    pub fn all() -> [PhaseType; Self::COUNT] {
        [
            PhaseType::PrecompGeneration,
            PhaseType::PrecompShare,
            PhaseType::PrecompDecrypt,
            PhaseType::PrecompPermute,
            PhaseType::PrecompReveal,
            PhaseType::PrecompStrip,
            PhaseType::RealDecrypt,
            PhaseType::RealPermute,
            PhaseType::RealIdentify,
        ]
    }

    /// The wire tag carried by messages addressed to this phase.
    pub fn tag(self) -> &'static str {
        match self {
            PhaseType::PrecompGeneration => "PrecompGeneration",
            PhaseType::PrecompShare => "PrecompShare",
            PhaseType::PrecompDecrypt => "PrecompDecrypt",
            PhaseType::PrecompPermute => "PrecompPermute",
            PhaseType::PrecompReveal => "PrecompReveal",
            PhaseType::PrecompStrip => "PrecompStrip",
            PhaseType::RealDecrypt => "RealDecrypt",
            PhaseType::RealPermute => "RealPermute",
            PhaseType::RealIdentify => "RealIdentify",
        }
    }

    /// The wire tag of this phase's verification acknowledgement, for the
    /// phases that wait for one.
    pub fn verification_tag(self) -> Option<&'static str> {
        match self {
            PhaseType::PrecompShare => Some("PrecompShareVerification"),
            PhaseType::PrecompReveal => Some("PrecompRevealVerification"),
            PhaseType::RealPermute => Some("RealPermuteVerification"),
            _ => None,
        }
    }

    /// Resolves a wire tag back to its phase. Verification tags resolve to
    /// the phase they acknowledge.
    pub fn from_tag(tag: &str) -> Option<(PhaseType, bool)> {
        for phase_type in Self::all() {
            if phase_type.tag() == tag {
                return Some((phase_type, false));
            }
            if phase_type.verification_tag() == Some(tag) {
                return Some((phase_type, true));
            }
        }
        None
    }

    /// The phase that follows this one, or `None` for the final phase.
    pub fn next(self) -> Option<PhaseType> {
        PhaseType::try_from(self as u8 + 1).ok()
    }

    /// Whether this phase belongs to the precomputation half of the round.
    pub fn is_precomputation(self) -> bool {
        (self as u8) <= PhaseType::PrecompStrip as u8
    }

    /// Whether this phase belongs to the realtime half of the round.
    pub fn is_realtime(self) -> bool {
        !self.is_precomputation()
    }
}

/// An error produced by phase wiring or state handling.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// The phase was used before its round connected it.
    #[error("phase {0} is not connected to a round")]
    Unconnected(PhaseType),
    /// A phase can only be connected once.
    #[error("phase {0} is already connected to round {1}")]
    AlreadyConnected(PhaseType, RoundId),
    /// A state transition failed.
    #[error(transparent)]
    State(#[from] StateError),
}

/// An error produced while transmitting a phase's outputs.
#[derive(Debug, Error)]
pub enum TransmitError {
    /// The network send failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Rendering an outbound slot failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Finalizing the phase's state failed.
    #[error(transparent)]
    Phase(Box<PhaseError>),
    /// The circuit has no destination for the outputs.
    #[error(transparent)]
    Topology(#[from] crate::round::topology::TopologyError),
    /// A round completion hook rejected the outputs.
    #[error("round hook failed: {0}")]
    Hook(String),
}

impl From<PhaseError> for TransmitError {
    fn from(err: PhaseError) -> Self {
        TransmitError::Phase(Box::new(err))
    }
}

/// Pulls the next completed chunk off the phase's graph.
pub type GetChunk = Arc<dyn Fn() -> BoxFuture<'static, Option<Chunk>> + Send + Sync>;

/// Renders one outbound slot from the phase's stream.
pub type GetSlot = Arc<dyn Fn(u32) -> Result<Slot, StreamError> + Send + Sync>;

/// Everything a transmission handler needs to forward a phase's outputs.
#[derive(Clone)]
pub struct TransmitCtx {
    pub round_id: RoundId,
    pub phase_type: PhaseType,
    pub node_id: NodeId,
    pub topology: Arc<Circuit>,
    pub network: Arc<dyn crate::node::transport::Transport>,
    pub get_chunk: GetChunk,
    pub get_slot: GetSlot,
    pub hooks: Arc<dyn RoundHooks>,
}

/// Invoked as a phase's graph drains; transmits chunk by chunk.
pub type TransmissionHandler =
    Arc<dyn Fn(TransmitCtx) -> BoxFuture<'static, Result<(), TransmitError>> + Send + Sync>;

/// Callbacks a node registers on the rounds it owns.
pub trait RoundHooks: Send + Sync {
    /// The precomputation half of the round finished on this node.
    fn precomputation_complete(&self, round_id: RoundId);

    /// The realtime half finished; `slots` are the recovered outputs
    /// (populated on the last node only).
    fn realtime_complete(&self, round_id: RoundId, slots: Vec<Slot>);
}

/// The ingredients of one phase, consumed by the round constructor.
///
/// The graph arrives unbuilt; the round builds it at the round's batch
/// size, links it to the round buffer, and erases its type.
pub struct PhaseBuilder {
    pub phase_type: PhaseType,
    pub graph: Box<dyn BuildableGraph>,
    pub transmission: TransmissionHandler,
    pub timeout: Duration,
    pub verification: bool,
}

/// One timing mark taken during phase execution.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub tag: &'static str,
    pub at: Instant,
}

struct RoundBinding {
    round_id: RoundId,
    states: Arc<RoundStateWord>,
    index: usize,
}

/// A single phase of a round.
pub struct Phase {
    phase_type: PhaseType,
    graph: Arc<dyn GraphRunner>,
    transmission: TransmissionHandler,
    timeout: Duration,
    verification: bool,
    binding: OnceCell<RoundBinding>,
    measurements: Mutex<Vec<Measurement>>,
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("phase_type", &self.phase_type)
            .field("graph", &self.graph.name())
            .field("timeout", &self.timeout)
            .field("verification", &self.verification)
            .finish()
    }
}

impl Phase {
    /// Creates a phase around a built-and-linked graph.
    pub fn new(
        phase_type: PhaseType,
        graph: Arc<dyn GraphRunner>,
        transmission: TransmissionHandler,
        timeout: Duration,
        verification: bool,
    ) -> Self {
        Self {
            phase_type,
            graph,
            transmission,
            timeout,
            verification,
            binding: OnceCell::new(),
            measurements: Mutex::new(Vec::new()),
        }
    }

    pub fn phase_type(&self) -> PhaseType {
        self.phase_type
    }

    pub fn graph(&self) -> &Arc<dyn GraphRunner> {
        &self.graph
    }

    pub fn transmission(&self) -> &TransmissionHandler {
        &self.transmission
    }

    /// The execution deadline the resource queue enforces.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether completion requires an acknowledgement from the next node.
    pub fn is_verification(&self) -> bool {
        self.verification
    }

    /// Binds the phase to its position in a round. Called exactly once, by
    /// the round constructor.
    pub fn connect_to_round(
        &self,
        round_id: RoundId,
        states: Arc<RoundStateWord>,
        index: usize,
    ) -> Result<(), PhaseError> {
        self.binding
            .set(RoundBinding {
                round_id,
                states,
                index,
            })
            .map_err(|binding| PhaseError::AlreadyConnected(self.phase_type, binding.round_id))
    }

    fn binding(&self) -> Result<&RoundBinding, PhaseError> {
        self.binding
            .get()
            .ok_or(PhaseError::Unconnected(self.phase_type))
    }

    /// The round this phase belongs to.
    pub fn round_id(&self) -> Result<RoundId, PhaseError> {
        Ok(self.binding()?.round_id)
    }

    /// The phase's position within its round.
    pub fn index(&self) -> Result<usize, PhaseError> {
        Ok(self.binding()?.index)
    }

    /// The phase's current state.
    pub fn state(&self) -> Result<State, PhaseError> {
        let binding = self.binding()?;
        Ok(binding.states.get(binding.index))
    }

    /// Applies one forward transition to this phase.
    pub fn transition(&self, from: State, to: State) -> Result<(), PhaseError> {
        let binding = self.binding()?;
        binding.states.transition(binding.index, from, to)?;
        Ok(())
    }

    /// Claims the phase for the resource queue. `true` exactly when this
    /// caller won the `Active` to `Queued` transition; concurrent message
    /// arrivals race here and all but one lose.
    pub fn attempt_to_queue(&self) -> Result<bool, PhaseError> {
        let binding = self.binding()?;
        Ok(binding
            .states
            .try_transition(binding.index, State::Active, State::Queued))
    }

    /// Marks the phase `Computed` and, in the same compare-and-swap,
    /// activates the next phase of the round. Non-verification phases then
    /// advance straight to `Verified`.
    pub fn update_final_states(&self) -> Result<(), PhaseError> {
        let binding = self.binding()?;
        let index = binding.index;
        if index + 1 < binding.states.num_phases() {
            binding.states.apply(&[
                (index, State::Running, State::Computed),
                (index + 1, State::Initialized, State::Active),
            ])?;
        } else {
            binding
                .states
                .transition(index, State::Running, State::Computed)?;
        }
        if !self.verification {
            binding
                .states
                .transition(index, State::Computed, State::Verified)?;
        }
        Ok(())
    }

    /// Records the acknowledgement of a verification phase.
    pub fn mark_verified(&self) -> Result<(), PhaseError> {
        let binding = self.binding()?;
        binding
            .states
            .transition(binding.index, State::Computed, State::Verified)?;
        Ok(())
    }

    /// Takes a timing mark.
    pub fn measure(&self, tag: &'static str) {
        self.measurements.lock().push(Measurement {
            tag,
            at: Instant::now(),
        });
    }

    /// The timing marks taken so far, in order.
    pub fn measurements(&self) -> Vec<Measurement> {
        self.measurements.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{
            BuildableGraph, Chunk, ErrorHandler, Graph, LinkCtx, Module, Slot, Stream,
            StreamError,
        },
        round::buffer::RoundBuffer,
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

    fn null_runner() -> Arc<dyn GraphRunner> {
        let mut graph = Graph::new("null", NullStream);
        let id = graph.add_module(Arc::new(NullModule));
        graph.first(id);
        graph.last(id);
        let handler: ErrorHandler = Arc::new(|_| {});
        graph.build(4, handler).unwrap();
        let group = Arc::new(crate::group::tests::test_group());
        let buffer = Arc::new(RoundBuffer::new(&group, 4, 4));
        graph
            .link(LinkCtx {
                group,
                buffer,
                expanded_batch: 4,
                round_id: 1,
                rng: crate::cryptops::rng::StreamGenerator::new([1u8; 32]),
                client_errors: None,
                secrets: None,
            })
            .unwrap();
        Box::new(graph).into_runner()
    }

    fn null_transmission() -> TransmissionHandler {
        Arc::new(|_ctx| Box::pin(async { Ok(()) }))
    }

    fn connected_phase(verification: bool) -> (Phase, Arc<RoundStateWord>) {
        let (states, _rx) = RoundStateWord::new(2).unwrap();
        let phase = Phase::new(
            PhaseType::PrecompShare,
            null_runner(),
            null_transmission(),
            Duration::from_secs(3),
            verification,
        );
        phase.connect_to_round(7, Arc::clone(&states), 0).unwrap();
        (phase, states)
    }

    #[test]
    fn tags_round_trip_including_verification() {
        for phase_type in PhaseType::all() {
            assert_eq!(
                PhaseType::from_tag(phase_type.tag()),
                Some((phase_type, false))
            );
            if let Some(tag) = phase_type.verification_tag() {
                assert_eq!(PhaseType::from_tag(tag), Some((phase_type, true)));
            }
        }
        assert_eq!(PhaseType::from_tag("NoSuchPhase"), None);
    }

    #[test]
    fn verification_tags_cover_exactly_three_phases() {
        let tagged: Vec<_> = PhaseType::all()
            .iter()
            .filter(|p| p.verification_tag().is_some())
            .copied()
            .collect();
        assert_eq!(
            tagged,
            vec![
                PhaseType::PrecompShare,
                PhaseType::PrecompReveal,
                PhaseType::RealPermute,
            ]
        );
    }

    #[test]
    fn unconnected_phase_reports_it() {
        let phase = Phase::new(
            PhaseType::RealDecrypt,
            null_runner(),
            null_transmission(),
            Duration::from_secs(1),
            false,
        );
        assert!(matches!(phase.state(), Err(PhaseError::Unconnected(_))));
    }

    #[test]
    fn connecting_twice_fails() {
        let (phase, states) = connected_phase(false);
        assert!(matches!(
            phase.connect_to_round(8, states, 0),
            Err(PhaseError::AlreadyConnected(_, 7))
        ));
    }

    #[test]
    fn queueing_is_won_once() {
        let (phase, _states) = connected_phase(false);
        phase.transition(State::Initialized, State::Active).unwrap();
        assert!(phase.attempt_to_queue().unwrap());
        assert!(!phase.attempt_to_queue().unwrap());
    }

    #[test]
    fn completion_activates_the_next_phase() {
        let (phase, states) = connected_phase(false);
        phase.transition(State::Initialized, State::Active).unwrap();
        phase.transition(State::Active, State::Queued).unwrap();
        phase.transition(State::Queued, State::Running).unwrap();
        phase.update_final_states().unwrap();

        // Non-verification phases land on Verified directly.
        assert_eq!(phase.state().unwrap(), State::Verified);
        assert_eq!(states.get(1), State::Active);
    }

    #[test]
    fn verification_phases_wait_for_the_acknowledgement() {
        let (phase, states) = connected_phase(true);
        phase.transition(State::Initialized, State::Active).unwrap();
        phase.transition(State::Active, State::Queued).unwrap();
        phase.transition(State::Queued, State::Running).unwrap();
        phase.update_final_states().unwrap();

        assert_eq!(phase.state().unwrap(), State::Computed);
        assert_eq!(states.get(1), State::Active);

        phase.mark_verified().unwrap();
        assert_eq!(phase.state().unwrap(), State::Verified);
    }

    #[test]
    fn measurements_keep_their_order() {
        let (phase, _states) = connected_phase(false);
        phase.measure("queued");
        phase.measure("running");
        let marks = phase.measurements();
        assert_eq!(marks.len(), 2);
        assert_eq!(marks[0].tag, "queued");
        assert_eq!(marks[1].tag, "running");
        assert!(marks[0].at <= marks[1].at);
    }
}
