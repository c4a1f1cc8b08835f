//! # cMix node: round-execution core
//!
//! A node in an anonymizing mix-network executes the cMix protocol: each
//! round, a fixed-size batch of client-submitted ciphertext slots is
//! collectively transformed by a circuit of nodes so that outputs are
//! unlinkable from inputs. A round alternates between a precomputation part
//! (generating per-slot key material ahead of time) and a realtime part
//! (mixing live traffic with that material). Every sub-step of a round is a
//! *phase* whose computation is expressed as a dataflow graph of parallel
//! worker modules operating on chunks of the batch.
//!
//! This crate is the in-process round-execution engine:
//!
//! - [`group`]: modular arithmetic over a large prime group and the densely
//!   packed [`IntBuffer`]s that hold per-slot group elements.
//! - [`graph`]: the dataflow executor. A [`Graph`] is a chain of modules
//!   connected by chunk channels, driven by a tokio worker pool.
//! - [`phase`]: one sub-step of the protocol. A [`Phase`] wraps a graph, a
//!   transmission handler and an atomic state slot inside its round.
//! - [`round`]: the cryptographic working set of one batch, the circuit
//!   topology, the tag-based response table and the round manager index.
//! - [`queues`]: the single-active-phase [`ResourceQueue`] plus the bounded
//!   mailboxes that hand rounds and per-slot client errors to the transport.
//! - [`state`]: the node-level activity state machine
//!   (`NotStarted → Waiting → Precomputing → Standby → Realtime → Completed`).
//! - [`graphs`]: the concrete precomputation and realtime phase graphs.
//! - [`node`]: the [`Instance`] that wires all of the above together and the
//!   [`Transport`] contract it relies on for peer communication.
//!
//! Wire transport, TLS, the persistent client registry and fleet
//! orchestration live outside this crate; they are reached through the
//! narrow [`Transport`] and [`NodeSecrets`] contracts.
//!
//! [`IntBuffer`]: crate::group::IntBuffer
//! [`Graph`]: crate::graph::Graph
//! [`Phase`]: crate::phase::Phase
//! [`ResourceQueue`]: crate::queues::resource::ResourceQueue
//! [`Instance`]: crate::node::Instance
//! [`Transport`]: crate::node::Transport
//! [`NodeSecrets`]: crate::node::NodeSecrets

#[macro_use]
extern crate async_trait;

#[macro_use]
extern crate tracing;

pub mod cryptops;
pub mod graph;
pub mod graphs;
pub mod group;
pub mod node;
pub mod phase;
pub mod queues;
pub mod round;
pub mod settings;
pub mod state;

/// The process-wide identifier of a round, assigned by the permissioning
/// service and strictly monotonic across the network.
pub type RoundId = u64;
