//! The response table that routes incoming message tags to phases.
//!
//! Every inbound message names a protocol step by tag. The round's response
//! map resolves the tag to the phase whose state gates acceptance, the set
//! of states under which the message may be acted upon, and the phase that
//! is handed back to the transport once the gate opens.

use std::collections::HashMap;

use crate::phase::{PhaseType, State};

/// One routing entry of the response map.
#[derive(Debug, Clone)]
pub struct Response {
    /// The phase whose state decides whether the message is acceptable.
    pub phase_lookup: PhaseType,
    /// The phase returned to the caller once accepted.
    pub return_phase: PhaseType,
    /// The states under which the message is acceptable.
    pub accepted: Vec<State>,
}

impl Response {
    pub fn accepts(&self, state: State) -> bool {
        self.accepted.contains(&state)
    }
}

/// The tag-keyed routing table of a round.
#[derive(Debug, Clone, Default)]
pub struct ResponseMap {
    entries: HashMap<&'static str, Response>,
}

impl ResponseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: &'static str, response: Response) {
        self.entries.insert(tag, response);
    }

    pub fn get(&self, tag: &str) -> Option<&Response> {
        self.entries.get(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The routing table every round uses.
///
/// Data tags are acceptable while their phase can still take inputs;
/// verification tags only once their phase has computed.
pub fn standard_responses() -> ResponseMap {
    let mut map = ResponseMap::new();
    for phase_type in PhaseType::all() {
        map.insert(
            phase_type.tag(),
            Response {
                phase_lookup: phase_type,
                return_phase: phase_type,
                accepted: vec![State::Active, State::Queued, State::Running],
            },
        );
        if let Some(tag) = phase_type.verification_tag() {
            map.insert(
                tag,
                Response {
                    phase_lookup: phase_type,
                    return_phase: phase_type,
                    accepted: vec![State::Computed],
                },
            );
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tag_is_routable() {
        let map = standard_responses();
        assert_eq!(map.len(), PhaseType::COUNT + 3);
        for phase_type in PhaseType::all() {
            assert!(map.get(phase_type.tag()).is_some());
        }
        for tag in [
            "PrecompShareVerification",
            "PrecompRevealVerification",
            "RealPermuteVerification",
        ] {
            let response = map.get(tag).unwrap();
            assert_eq!(response.accepted, vec![State::Computed]);
        }
    }

    #[test]
    fn data_tags_accept_while_inputs_can_arrive() {
        let map = standard_responses();
        let response = map.get("PrecompDecrypt").unwrap();
        assert!(response.accepts(State::Active));
        assert!(response.accepts(State::Running));
        assert!(!response.accepts(State::Initialized));
        assert!(!response.accepts(State::Verified));
    }

    #[test]
    fn unknown_tags_are_absent() {
        assert!(standard_responses().get("NoSuchTag").is_none());
    }
}
