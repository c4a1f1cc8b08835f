//! The six precomputation graphs.
//!
//! Each phase is one single-module graph over the round buffer. Generation
//! samples the per-slot key material, Share accumulates the public cypher
//! key across the circuit, Decrypt folds this node's keys into the
//! travelling payload pair, Permute gathers slots through the round's
//! permutation, Reveal strips the cypher key with the z-th root, and Strip
//! (last node) inverts the result into the precomputation vectors.

use parking_lot::Mutex;

use crate::{
    graph::{Chunk, Graph, InputSize, LinkCtx, Module, Slot, Stream, StreamError},
    group::Int,
};

use super::{linked, single_module_graph};

/// The fixed chunk width of the permute graphs. Chosen so common batch
/// sizes expand to a small multiple.
pub(super) const PERMUTE_INPUT_SIZE: u32 = 8;

// --- Generation ---

#[derive(Default)]
pub struct GenerationStream {
    ctx: Option<LinkCtx>,
}

impl Stream for GenerationStream {
    fn name(&self) -> &'static str {
        "PrecompGeneration"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, _message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        bounds(index, ctx.expanded_batch)?;
        Ok(())
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        bounds(index, ctx.expanded_batch)?;
        // Key material never leaves the node.
        Ok(Slot::default())
    }
}

pub struct GenerationModule;

impl Module<GenerationStream> for GenerationModule {
    fn name(&self) -> &'static str {
        "Generate"
    }

    fn adapt(&self, stream: &GenerationStream, chunk: Chunk) -> Result<(), StreamError> {
        let ctx = linked(&stream.ctx, stream.name())?;
        let buffer = &ctx.buffer;
        let batch = buffer.batch_size();
        let mut rng = ctx.rng.stream();
        for slot in chunk.range() {
            // The expanded suffix stays identity so permutation and
            // blinding are no-ops there.
            if slot >= batch {
                continue;
            }
            let i = slot as usize;
            for target in [
                &buffer.r,
                &buffer.s,
                &buffer.u,
                &buffer.v,
                &buffer.y_r,
                &buffer.y_s,
                &buffer.y_t,
                &buffer.y_u,
                &buffer.y_v,
            ] {
                ctx.group.random(&mut target.get(i), &mut rng)?;
            }
        }
        Ok(())
    }
}

pub fn generation_graph() -> Graph<GenerationStream> {
    single_module_graph("precomp-generation", GenerationStream::default(), GenerationModule)
}

// --- Share ---

#[derive(Default)]
pub struct ShareStream {
    ctx: Option<LinkCtx>,
    incoming: Mutex<Option<Int>>,
}

impl Stream for ShareStream {
    fn name(&self) -> &'static str {
        "PrecompShare"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        bounds(index, ctx.expanded_batch)?;
        if !ctx.group.bytes_inside(&[&message.payload_a]) {
            return Err(StreamError::OutsideOfGroup);
        }
        let mut partial = ctx.group.new_int();
        ctx.group.set_bytes(&mut partial, &message.payload_a)?;
        *self.incoming.lock() = Some(partial);
        Ok(())
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        bounds(index, ctx.expanded_batch)?;
        Ok(Slot {
            payload_a: ctx.buffer.cypher_public().bytes(),
            ..Slot::default()
        })
    }
}

pub struct ShareModule;

impl Module<ShareStream> for ShareModule {
    fn name(&self) -> &'static str {
        "Share"
    }

    fn adapt(&self, stream: &ShareStream, _chunk: Chunk) -> Result<(), StreamError> {
        let ctx = linked(&stream.ctx, stream.name())?;
        // The first node of the circuit receives no partial key; its own
        // share was published by the round constructor.
        if let Some(partial) = stream.incoming.lock().take() {
            let own = ctx.buffer.z().clone();
            let mut raised = ctx.group.new_int();
            ctx.group.exp_generator(own.value(), &mut raised)?;
            let mut combined = ctx.group.new_int();
            ctx.group.mul(&partial, &raised, &mut combined)?;
            *ctx.buffer.cypher_public() = combined;
        }
        Ok(())
    }
}

pub fn share_graph() -> Graph<ShareStream> {
    single_module_graph("precomp-share", ShareStream::default(), ShareModule)
}

// --- Decrypt ---

#[derive(Default)]
pub struct DecryptStream {
    ctx: Option<LinkCtx>,
}

impl Stream for DecryptStream {
    fn name(&self) -> &'static str {
        "PrecompDecrypt"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        bounds(index, ctx.expanded_batch)?;
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
        bounds(index, ctx.expanded_batch)?;
        Ok(render_pair(
            index,
            &ctx.buffer.ecr_payload_a,
            &ctx.buffer.ecr_payload_b,
        ))
    }
}

pub struct DecryptModule;

impl Module<DecryptStream> for DecryptModule {
    fn name(&self) -> &'static str {
        "Decrypt"
    }

    fn adapt(&self, stream: &DecryptStream, chunk: Chunk) -> Result<(), StreamError> {
        let ctx = linked(&stream.ctx, stream.name())?;
        let group = &ctx.group;
        let buffer = &ctx.buffer;
        let cypher = buffer.cypher_public().clone();
        for slot in chunk.range() {
            let i = slot as usize;

            // payload A: fold in R and the cypher key blinded by Y_R.
            let r = buffer.r.get(i).clone();
            let y_r = buffer.y_r.get(i).clone();
            let mut blinded = group.new_int();
            group.exp(&cypher, &y_r, &mut blinded)?;
            let current = buffer.ecr_payload_a.get(i).clone();
            let mut keyed = group.new_int();
            group.mul(&current, &r, &mut keyed)?;
            let mut next = group.new_int();
            group.mul(&keyed, &blinded, &mut next)?;
            *buffer.ecr_payload_a.get(i) = next;

            // payload B: the same with U and Y_U.
            let u = buffer.u.get(i).clone();
            let y_u = buffer.y_u.get(i).clone();
            let mut blinded = group.new_int();
            group.exp(&cypher, &y_u, &mut blinded)?;
            let current = buffer.ecr_payload_b.get(i).clone();
            let mut keyed = group.new_int();
            group.mul(&current, &u, &mut keyed)?;
            let mut next = group.new_int();
            group.mul(&keyed, &blinded, &mut next)?;
            *buffer.ecr_payload_b.get(i) = next;
        }
        Ok(())
    }
}

pub fn decrypt_graph() -> Graph<DecryptStream> {
    single_module_graph("precomp-decrypt", DecryptStream::default(), DecryptModule)
}

// --- Permute ---

#[derive(Default)]
pub struct PermuteStream {
    ctx: Option<LinkCtx>,
}

impl Stream for PermuteStream {
    fn name(&self) -> &'static str {
        "PrecompPermute"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        bounds(index, ctx.expanded_batch)?;
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
        bounds(index, ctx.expanded_batch)?;
        Ok(render_pair(
            index,
            &ctx.buffer.permuted_payload_a,
            &ctx.buffer.permuted_payload_b,
        ))
    }
}

/// Gathers slots through the permutation: slot `i` of the output is slot
/// `permutations[i]` of the input, keyed with `S` respectively `V`. Reads
/// and writes touch different buffers, so concurrent chunks are safe.
pub struct PermuteModule;

impl Module<PermuteStream> for PermuteModule {
    fn name(&self) -> &'static str {
        "Permute"
    }

    fn input_size(&self) -> InputSize {
        InputSize::Fixed(PERMUTE_INPUT_SIZE)
    }

    fn adapt(&self, stream: &PermuteStream, chunk: Chunk) -> Result<(), StreamError> {
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

pub fn permute_graph() -> Graph<PermuteStream> {
    single_module_graph("precomp-permute", PermuteStream::default(), PermuteModule)
}

// --- Reveal ---

#[derive(Default)]
pub struct RevealStream {
    ctx: Option<LinkCtx>,
}

impl Stream for RevealStream {
    fn name(&self) -> &'static str {
        "PrecompReveal"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        bounds(index, ctx.expanded_batch)?;
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
        bounds(index, ctx.expanded_batch)?;
        Ok(render_pair(
            index,
            &ctx.buffer.permuted_payload_a,
            &ctx.buffer.permuted_payload_b,
        ))
    }
}

/// Strips this node's cypher key by taking the z-th root in place.
pub struct RevealModule;

impl Module<RevealStream> for RevealModule {
    fn name(&self) -> &'static str {
        "Reveal"
    }

    fn adapt(&self, stream: &RevealStream, chunk: Chunk) -> Result<(), StreamError> {
        let ctx = linked(&stream.ctx, stream.name())?;
        let group = &ctx.group;
        let buffer = &ctx.buffer;
        let z = buffer.z().clone();
        for slot in chunk.range() {
            let i = slot as usize;
            for target in [&buffer.permuted_payload_a, &buffer.permuted_payload_b] {
                let value = target.get(i).clone();
                let mut out = group.new_int();
                group.root_coprime(&value, &z, &mut out)?;
                *target.get(i) = out;
            }
        }
        Ok(())
    }
}

pub fn reveal_graph() -> Graph<RevealStream> {
    single_module_graph("precomp-reveal", RevealStream::default(), RevealModule)
}

// --- Strip ---

#[derive(Default)]
pub struct StripStream {
    ctx: Option<LinkCtx>,
}

impl Stream for StripStream {
    fn name(&self) -> &'static str {
        "PrecompStrip"
    }

    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError> {
        let ctx = linked(&self.ctx, self.name())?;
        bounds(index, ctx.expanded_batch)?;
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
        bounds(index, ctx.expanded_batch)?;
        Ok(render_pair(
            index,
            &ctx.buffer.payload_a_precomputation,
            &ctx.buffer.payload_b_precomputation,
        ))
    }
}

/// Last-node finalization: keeps the revealed key product and stores its
/// inverse as the precomputation the realtime identify phase multiplies
/// back in.
pub struct StripModule;

impl Module<StripStream> for StripModule {
    fn name(&self) -> &'static str {
        "Strip"
    }

    fn adapt(&self, stream: &StripStream, chunk: Chunk) -> Result<(), StreamError> {
        let ctx = linked(&stream.ctx, stream.name())?;
        let group = &ctx.group;
        let buffer = &ctx.buffer;
        for slot in chunk.range() {
            let i = slot as usize;

            let revealed = buffer.permuted_payload_a.get(i).clone();
            let mut inverted = group.new_int();
            group.inverse(&revealed, &mut inverted)?;
            *buffer.permuted_payload_a_keys.get(i) = revealed;
            *buffer.payload_a_precomputation.get(i) = inverted;

            let revealed = buffer.permuted_payload_b.get(i).clone();
            let mut inverted = group.new_int();
            group.inverse(&revealed, &mut inverted)?;
            *buffer.permuted_payload_b_keys.get(i) = revealed;
            *buffer.payload_b_precomputation.get(i) = inverted;
        }
        Ok(())
    }
}

pub fn strip_graph() -> Graph<StripStream> {
    single_module_graph("precomp-strip", StripStream::default(), StripModule)
}

// --- shared helpers ---

fn bounds(index: u32, batch: u32) -> Result<(), StreamError> {
    if index >= batch {
        return Err(StreamError::OutsideOfBatch { index, batch });
    }
    Ok(())
}

/// Decodes an inbound payload pair into a pair of buffers at `index`.
pub(super) fn set_pair(
    ctx: &LinkCtx,
    index: u32,
    message: &Slot,
    into_a: &crate::group::IntBuffer,
    into_b: &crate::group::IntBuffer,
) -> Result<(), StreamError> {
    if !ctx
        .group
        .bytes_inside(&[&message.payload_a, &message.payload_b])
    {
        return Err(StreamError::OutsideOfGroup);
    }
    let i = index as usize;
    ctx.group.set_bytes(&mut into_a.get(i), &message.payload_a)?;
    ctx.group.set_bytes(&mut into_b.get(i), &message.payload_b)?;
    Ok(())
}

/// Renders a pair of buffers at `index` as an outbound slot.
pub(super) fn render_pair(
    index: u32,
    from_a: &crate::group::IntBuffer,
    from_b: &crate::group::IntBuffer,
) -> Slot {
    let i = index as usize;
    Slot {
        payload_a: from_a.get(i).bytes(),
        payload_b: from_b.get(i).bytes(),
        ..Slot::default()
    }
}
