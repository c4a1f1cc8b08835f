//! The three realtime graphs.
//!
//! Decrypt authenticates each client slot and strips the client key while
//! folding in this node's R/U keys, Permute mixes the batch through the
//! round's permutation, and Identify (last node) multiplies the
//! precomputation back in to recover the plaintext payloads.

use parking_lot::Mutex;

use crate::{
    cryptops,
    graph::{Chunk, Graph, InputSize, LinkCtx, Module, Slot, Stream, StreamError},
    queues::client_errors::ClientError,
};

use super::{
    linked,
    precomputation::{render_pair, set_pair, PERMUTE_INPUT_SIZE},
};

/// The client-facing metadata of one inbound slot, kept until the decrypt
/// module authenticates it.
#[derive(Debug, Clone)]
struct SlotMeta {
    sender_id: Vec<u8>,
    kmac: Vec<u8>,
    salt: Vec<u8>,
}

// --- RealDecrypt ---

#[derive(Default)]
pub struct RealDecryptStream {
    ctx: Option<LinkCtx>,
    metas: Vec<Mutex<Option<SlotMeta>>>,
}

impl Stream for RealDecryptStream {
    fn name(&self) -> &'static str {
        "RealDecrypt"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        // Fail at link time if the round forgot the decrypt extras.
        ctx.client_errors(self.name())?;
        ctx.secrets(self.name())?;
        self.metas = (0..ctx.expanded_batch)
            .map(|_| Mutex::new(None))
            .collect();
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        if index >= ctx.expanded_batch {
            return Err(StreamError::OutsideOfBatch {
                index,
                batch: ctx.expanded_batch,
            });
        }
        set_pair(
            ctx,
            index,
            message,
            &ctx.buffer.ecr_payload_a,
            &ctx.buffer.ecr_payload_b,
        )?;
        *self.metas[index as usize].lock() = Some(SlotMeta {
            sender_id: message.sender_id.clone(),
            kmac: message.kmac.clone(),
            salt: message.salt.clone(),
        });
        Ok(())
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        if index >= ctx.expanded_batch {
            return Err(StreamError::OutsideOfBatch {
                index,
                batch: ctx.expanded_batch,
            });
        }
        Ok(render_pair(
            index,
            &ctx.buffer.ecr_payload_a,
            &ctx.buffer.ecr_payload_b,
        ))
    }
}

/// Authenticates each slot's KMAC, derives the client's payload keys, and
/// replaces the client keying with this node's R/U keys.
///
/// A failed precondition blanks the slot and reports the client; it never
/// fails the graph.
pub struct RealDecryptModule;

impl RealDecryptModule {
    fn blank_slot(stream: &RealDecryptStream, ctx: &LinkCtx, i: usize, reason: &str) {
        let group = &ctx.group;
        let buffer = &ctx.buffer;
        *buffer.keys_payload_a.get(i) = group.new_int();
        *buffer.keys_payload_b.get(i) = group.new_int();
        *buffer.ecr_payload_a.get(i) = group.new_int();
        *buffer.ecr_payload_b.get(i) = group.new_int();

        let sender_id = stream.metas[i]
            .lock()
            .as_ref()
            .map(|meta| meta.sender_id.clone())
            .unwrap_or_default();
        // The reporter can only be missing if link-time validation was
        // bypassed; drop the report rather than fail the batch.
        if let Ok(reporter) = ctx.client_errors("RealDecrypt") {
            if let Err(err) = reporter.send(
                ctx.round_id,
                ClientError {
                    client_id: sender_id,
                    slot: i as u32,
                    reason: reason.to_string(),
                },
            ) {
                warn!(round = ctx.round_id, slot = i, error = %err, "client failure dropped");
            }
        }
    }
}

impl Module<RealDecryptStream> for RealDecryptModule {
    fn name(&self) -> &'static str {
        "RealDecrypt"
    }

    fn adapt(&self, stream: &RealDecryptStream, chunk: Chunk) -> Result<(), StreamError> {
        let ctx = linked(&stream.ctx, stream.name())?;
        let group = &ctx.group;
        let buffer = &ctx.buffer;
        let secrets = ctx.secrets(stream.name())?;
        for slot in chunk.range() {
            let i = slot as usize;
            let meta = match stream.metas[i].lock().clone() {
                Some(meta) => meta,
                // Padding slots carry no client message.
                None => continue,
            };

            let base_key = match secrets.client_base_key(&meta.sender_id) {
                Some(key) => key,
                None => {
                    Self::blank_slot(stream, ctx, i, "unregistered client");
                    continue;
                }
            };

            let payload_a = buffer.ecr_payload_a.get(i).bytes();
            let payload_b = buffer.ecr_payload_b.get(i).bytes();
            let kmac_key = cryptops::kmac_key(&base_key, &meta.salt);
            if !cryptops::verify_kmac(&meta.kmac, &kmac_key, &payload_a, &payload_b) {
                Self::blank_slot(stream, ctx, i, "invalid kmac");
                continue;
            }

            let key_a = cryptops::payload_a_key(group, &base_key, &meta.salt)?;
            let key_b = cryptops::payload_b_key(group, &base_key, &meta.salt)?;

            // payload A: strip the client key, fold in R.
            let mut inverted = group.new_int();
            group.inverse(&key_a, &mut inverted)?;
            let current = buffer.ecr_payload_a.get(i).clone();
            let mut stripped = group.new_int();
            group.mul(&current, &inverted, &mut stripped)?;
            let r = buffer.r.get(i).clone();
            let mut next = group.new_int();
            group.mul(&stripped, &r, &mut next)?;
            *buffer.ecr_payload_a.get(i) = next;

            // payload B: the same with U.
            let mut inverted = group.new_int();
            group.inverse(&key_b, &mut inverted)?;
            let current = buffer.ecr_payload_b.get(i).clone();
            let mut stripped = group.new_int();
            group.mul(&current, &inverted, &mut stripped)?;
            let u = buffer.u.get(i).clone();
            let mut next = group.new_int();
            group.mul(&stripped, &u, &mut next)?;
            *buffer.ecr_payload_b.get(i) = next;

            *buffer.keys_payload_a.get(i) = key_a;
            *buffer.keys_payload_b.get(i) = key_b;
        }
        Ok(())
    }
}

pub fn real_decrypt_graph() -> Graph<RealDecryptStream> {
    super::single_module_graph(
        "real-decrypt",
        RealDecryptStream::default(),
        RealDecryptModule,
    )
}

// --- RealPermute ---

#[derive(Default)]
pub struct RealPermuteStream {
    ctx: Option<LinkCtx>,
}

impl Stream for RealPermuteStream {
    fn name(&self) -> &'static str {
        "RealPermute"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        if index >= ctx.expanded_batch {
            return Err(StreamError::OutsideOfBatch {
                index,
                batch: ctx.expanded_batch,
            });
        }
        set_pair(
            ctx,
            index,
            message,
            &ctx.buffer.ecr_payload_a,
            &ctx.buffer.ecr_payload_b,
        )
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        if index >= ctx.expanded_batch {
            return Err(StreamError::OutsideOfBatch {
                index,
                batch: ctx.expanded_batch,
            });
        }
        Ok(render_pair(
            index,
            &ctx.buffer.permuted_payload_a,
            &ctx.buffer.permuted_payload_b,
        ))
    }
}

/// The realtime mix: identical gather to the precomputation permute, keyed
/// with `S` and `V`.
pub struct RealPermuteModule;

impl Module<RealPermuteStream> for RealPermuteModule {
    fn name(&self) -> &'static str {
        "RealPermute"
    }

    fn input_size(&self) -> InputSize {
        InputSize::Fixed(PERMUTE_INPUT_SIZE)
    }

    fn adapt(&self, stream: &RealPermuteStream, chunk: Chunk) -> Result<(), StreamError> {
        let ctx = linked(&stream.ctx, stream.name())?;
        let group = &ctx.group;
        let buffer = &ctx.buffer;
        let permutations = buffer.permutations();
        for slot in chunk.range() {
            let i = slot as usize;
            let src = permutations[i] as usize;

            let value = buffer.ecr_payload_a.get(src).clone();
            let s = buffer.s.get(src).clone();
            let mut out = group.new_int();
            group.mul(&value, &s, &mut out)?;
            *buffer.permuted_payload_a.get(i) = out;

            let value = buffer.ecr_payload_b.get(src).clone();
            let v = buffer.v.get(src).clone();
            let mut out = group.new_int();
            group.mul(&value, &v, &mut out)?;
            *buffer.permuted_payload_b.get(i) = out;
        }
        Ok(())
    }
}

pub fn real_permute_graph() -> Graph<RealPermuteStream> {
    super::single_module_graph(
        "real-permute",
        RealPermuteStream::default(),
        RealPermuteModule,
    )
}

// --- RealIdentify ---

#[derive(Default)]
pub struct RealIdentifyStream {
    ctx: Option<LinkCtx>,
}

impl Stream for RealIdentifyStream {
    fn name(&self) -> &'static str {
        "RealIdentify"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        if index >= ctx.expanded_batch {
            return Err(StreamError::OutsideOfBatch {
                index,
                batch: ctx.expanded_batch,
            });
        }
        set_pair(
            ctx,
            index,
            message,
            &ctx.buffer.permuted_payload_a,
            &ctx.buffer.permuted_payload_b,
        )
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        if index >= ctx.expanded_batch {
            return Err(StreamError::OutsideOfBatch {
                index,
                batch: ctx.expanded_batch,
            });
        }
        Ok(render_pair(
            index,
            &ctx.buffer.permuted_payload_a,
            &ctx.buffer.permuted_payload_b,
        ))
    }
}

/// Last-node recovery: multiplies the strip-phase precomputation into the
/// permuted payloads, cancelling every node's keying.
pub struct RealIdentifyModule;

impl Module<RealIdentifyStream> for RealIdentifyModule {
    fn name(&self) -> &'static str {
        "RealIdentify"
    }

    fn adapt(&self, stream: &RealIdentifyStream, chunk: Chunk) -> Result<(), StreamError> {
        let ctx = linked(&stream.ctx, stream.name())?;
        let group = &ctx.group;
        let buffer = &ctx.buffer;
        for slot in chunk.range() {
            let i = slot as usize;

            let value = buffer.permuted_payload_a.get(i).clone();
            let precomputed = buffer.payload_a_precomputation.get(i).clone();
            let mut out = group.new_int();
            group.mul(&value, &precomputed, &mut out)?;
            *buffer.permuted_payload_a.get(i) = out;

            let value = buffer.permuted_payload_b.get(i).clone();
            let precomputed = buffer.payload_b_precomputation.get(i).clone();
            let mut out = group.new_int();
            group.mul(&value, &precomputed, &mut out)?;
            *buffer.permuted_payload_b.get(i) = out;
        }
        Ok(())
    }
}

pub fn real_identify_graph() -> Graph<RealIdentifyStream> {
    super::single_module_graph(
        "real-identify",
        RealIdentifyStream::default(),
        RealIdentifyModule,
    )
}
