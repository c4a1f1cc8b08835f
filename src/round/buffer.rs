//! The cryptographic working set of one round.
//!
//! Allocated once at round creation, mutated by every phase's graph, never
//! visible outside the round. Each phase touches a statically known subset
//! of the buffers and no two phases of a round run concurrently, so the
//! per-element locks inside [`IntBuffer`] are only ever contended between
//! workers of the same graph writing disjoint slots.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use rand::Rng;

use crate::group::{CyclicGroup, GroupError, Int, IntBuffer};

/// The exponent bit budget for the private cypher key `Z`.
const CYPHER_KEY_BITS: u64 = 256;

/// All long-lived cryptographic state of one round.
pub struct RoundBuffer {
    batch_size: u32,
    expanded_batch: u32,

    /// Message key buffer `R` and its permuted counterpart `S`.
    pub r: IntBuffer,
    pub s: IntBuffer,
    /// Associated-data key buffer `U` and its permuted counterpart `V`.
    pub u: IntBuffer,
    pub v: IntBuffer,

    /// Blinding buffers matching the key buffers.
    pub y_r: IntBuffer,
    pub y_s: IntBuffer,
    pub y_t: IntBuffer,
    pub y_u: IntBuffer,
    pub y_v: IntBuffer,

    /// Per-slot decryption keys recovered during realtime decrypt. A slot
    /// whose client failed authentication holds the identity.
    pub keys_payload_a: IntBuffer,
    pub keys_payload_b: IntBuffer,

    /// Encrypted payloads as they travel through the realtime phases.
    pub ecr_payload_a: IntBuffer,
    pub ecr_payload_b: IntBuffer,

    /// Permuted payloads, written by the permute phases.
    pub permuted_payload_a: IntBuffer,
    pub permuted_payload_b: IntBuffer,

    /// Last-node only: the assembled precomputation results.
    pub payload_a_precomputation: IntBuffer,
    pub payload_b_precomputation: IntBuffer,
    /// Last-node only: the permuted key shares revealed during strip.
    pub permuted_payload_a_keys: IntBuffer,
    pub permuted_payload_b_keys: IntBuffer,

    cypher_public: Mutex<Int>,
    z: Mutex<Int>,
    permutations: RwLock<Vec<u32>>,
}

impl RoundBuffer {
    /// Allocates every buffer at `expanded_batch` slots, all elements the
    /// multiplicative identity, and an identity permutation.
    pub fn new(group: &CyclicGroup, batch_size: u32, expanded_batch: u32) -> Self {
        let len = expanded_batch as usize;
        let alloc = || IntBuffer::new(group, len);
        Self {
            batch_size,
            expanded_batch,
            r: alloc(),
            s: alloc(),
            u: alloc(),
            v: alloc(),
            y_r: alloc(),
            y_s: alloc(),
            y_t: alloc(),
            y_u: alloc(),
            y_v: alloc(),
            keys_payload_a: alloc(),
            keys_payload_b: alloc(),
            ecr_payload_a: alloc(),
            ecr_payload_b: alloc(),
            permuted_payload_a: alloc(),
            permuted_payload_b: alloc(),
            payload_a_precomputation: alloc(),
            payload_b_precomputation: alloc(),
            permuted_payload_a_keys: alloc(),
            permuted_payload_b_keys: alloc(),
            cypher_public: Mutex::new(group.new_int()),
            z: Mutex::new(group.new_int()),
            permutations: RwLock::new((0..expanded_batch).collect()),
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn expanded_batch(&self) -> u32 {
        self.expanded_batch
    }

    /// Samples the private cypher key `Z`, publishes `g^Z` as this node's
    /// share of the public cypher key, and shuffles the permutation over
    /// the batch-size prefix. The expanded suffix stays the identity.
    pub fn init_crypto_fields<R: Rng>(
        &self,
        group: &CyclicGroup,
        rng: &mut R,
    ) -> Result<(), GroupError> {
        {
            let mut z = self.z.lock();
            group.find_small_coprime_inverse(&mut z, CYPHER_KEY_BITS, rng)?;
            let mut public = self.cypher_public.lock();
            group.exp_generator(z.value(), &mut public)?;
        }

        // Fisher-Yates over [0, batch_size).
        let mut permutations = self.permutations.write();
        for i in (1..self.batch_size as usize).rev() {
            let j = rng.gen_range(0..=i);
            permutations.swap(i, j);
        }
        Ok(())
    }

    /// The private cypher key `Z`.
    pub fn z(&self) -> MutexGuard<'_, Int> {
        self.z.lock()
    }

    /// The shared public cypher key accumulated across the circuit.
    pub fn cypher_public(&self) -> MutexGuard<'_, Int> {
        self.cypher_public.lock()
    }

    /// The slot permutation. Read-only after `init_crypto_fields`.
    pub fn permutations(&self) -> RwLockReadGuard<'_, Vec<u32>> {
        self.permutations.read()
    }

    /// Zeroes every element of every buffer and the cypher keys, leaving
    /// all fingerprints invalid.
    pub fn erase(&self) {
        for buffer in [
            &self.r,
            &self.s,
            &self.u,
            &self.v,
            &self.y_r,
            &self.y_s,
            &self.y_t,
            &self.y_u,
            &self.y_v,
            &self.keys_payload_a,
            &self.keys_payload_b,
            &self.ecr_payload_a,
            &self.ecr_payload_b,
            &self.permuted_payload_a,
            &self.permuted_payload_b,
            &self.payload_a_precomputation,
            &self.payload_b_precomputation,
            &self.permuted_payload_a_keys,
            &self.permuted_payload_b_keys,
        ] {
            buffer.erase();
        }
        self.cypher_public.lock().erase();
        self.z.lock().erase();
    }
}
