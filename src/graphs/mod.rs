//! The concrete per-phase graphs and their assembly into rounds.

pub mod precomputation;
pub mod realtime;

use std::{sync::Arc, time::Duration};

use crate::{
    graph::{Graph, LinkCtx, Module, Stream, StreamError},
    phase::{PhaseBuilder, PhaseType, TransmissionHandler},
};

pub use self::{
    precomputation::{
        decrypt_graph, generation_graph, permute_graph, reveal_graph, share_graph, strip_graph,
    },
    realtime::{real_decrypt_graph, real_identify_graph, real_permute_graph},
};

fn linked<'a>(ctx: &'a Option<LinkCtx>, name: &'static str) -> Result<&'a LinkCtx, StreamError> {
    ctx.as_ref().ok_or(StreamError::NotLinked(name))
}

fn single_module_graph<S, M>(name: &'static str, stream: S, module: M) -> Graph<S>
where
    S: Stream,
    M: Module<S>,
{
    let mut graph = Graph::new(name, stream);
    let id = graph.add_module(Arc::new(module));
    graph.first(id);
    graph.last(id);
    graph
}

/// Builds the six precomputation phases in execution order. The phases
/// whose tags have a verification counterpart wait for the peer
/// acknowledgement before counting as done.
pub fn precomputation_builders<F>(timeout: Duration, transmission: F) -> Vec<PhaseBuilder>
where
    F: Fn(PhaseType) -> TransmissionHandler,
{
    vec![
        PhaseBuilder {
            phase_type: PhaseType::PrecompGeneration,
            graph: Box::new(generation_graph()),
            transmission: transmission(PhaseType::PrecompGeneration),
            timeout,
            verification: false,
        },
        PhaseBuilder {
            phase_type: PhaseType::PrecompShare,
            graph: Box::new(share_graph()),
            transmission: transmission(PhaseType::PrecompShare),
            timeout,
            verification: true,
        },
        PhaseBuilder {
            phase_type: PhaseType::PrecompDecrypt,
            graph: Box::new(decrypt_graph()),
            transmission: transmission(PhaseType::PrecompDecrypt),
            timeout,
            verification: false,
        },
        PhaseBuilder {
            phase_type: PhaseType::PrecompPermute,
            graph: Box::new(permute_graph()),
            transmission: transmission(PhaseType::PrecompPermute),
            timeout,
            verification: false,
        },
        PhaseBuilder {
            phase_type: PhaseType::PrecompReveal,
            graph: Box::new(reveal_graph()),
            transmission: transmission(PhaseType::PrecompReveal),
            timeout,
            verification: true,
        },
        PhaseBuilder {
            phase_type: PhaseType::PrecompStrip,
            graph: Box::new(strip_graph()),
            transmission: transmission(PhaseType::PrecompStrip),
            timeout,
            verification: false,
        },
    ]
}

/// Builds the three realtime phases in execution order.
pub fn realtime_builders<F>(timeout: Duration, transmission: F) -> Vec<PhaseBuilder>
where
    F: Fn(PhaseType) -> TransmissionHandler,
{
    vec![
        PhaseBuilder {
            phase_type: PhaseType::RealDecrypt,
            graph: Box::new(real_decrypt_graph()),
            transmission: transmission(PhaseType::RealDecrypt),
            timeout,
            verification: false,
        },
        PhaseBuilder {
            phase_type: PhaseType::RealPermute,
            graph: Box::new(real_permute_graph()),
            transmission: transmission(PhaseType::RealPermute),
            timeout,
            verification: true,
        },
        PhaseBuilder {
            phase_type: PhaseType::RealIdentify,
            graph: Box::new(real_identify_graph()),
            transmission: transmission(PhaseType::RealIdentify),
            timeout,
            verification: false,
        },
    ]
}

/// All nine phases of a round.
pub fn all_builders<F>(timeout: Duration, transmission: F) -> Vec<PhaseBuilder>
where
    F: Fn(PhaseType) -> TransmissionHandler,
{
    let mut builders = precomputation_builders(timeout, &transmission);
    builders.extend(realtime_builders(timeout, &transmission));
    builders
}
