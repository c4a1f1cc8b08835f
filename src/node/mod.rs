//! The node instance and its outward-facing contracts.
//!
//! An [`Instance`] owns the round manager, the resource queue and the
//! activity state machine, and drives them from three bounded inboxes:
//! round descriptors, realtime batches and peer messages. Everything that
//! leaves the process goes through the [`Transport`] trait; everything
//! secret that enters a round goes through [`NodeSecrets`].

pub mod instance;
pub mod messages;
pub mod recovery;
pub mod secrets;
pub mod transport;

pub use self::{
    instance::{InboundBatch, Instance, InstanceConfig, NodeError, RealtimeBatch},
    messages::{MessageError, RoundInfo, SignedRoundInfo},
    recovery::RecoveryError,
    secrets::{InMemorySecrets, NodeSecrets},
    transport::{LoopbackTransport, RoundErrorMsg, SentBatch, Transport, TransportError},
};
