//! Rounds: the buffer, the circuit, the response table, the manager.

pub mod buffer;
pub mod manager;
#[allow(clippy::module_inception)]
pub mod round;
pub mod responses;
pub mod topology;

pub use self::{
    buffer::RoundBuffer,
    manager::{ManagerError, RoundManager},
    responses::{standard_responses, Response, ResponseMap},
    round::{Round, RoundError, RoundExtras},
    topology::{Circuit, NodeId, TopologyError},
};
