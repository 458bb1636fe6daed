//! Bitonic sort of particle ids by cell id.
//!
//! The network runs on the input padded to the next power of two. Padding
//! slots hold ids `>= len`, whose key is [`SENTINEL_CELL`], so they sink to
//! the end and never mix with real entries.
//!
//! Stage `s` (comparison span `k = 2^(s+1)`) runs `s + 1` passes with stride
//! `j = k/2, k/4, .., 1`. Every comparison of a pass touches a disjoint pair
//! of slots, so a pass is fully parallel; the next pass may only start once
//! all writes of the previous one are visible. On the CPU each pass is one
//! rayon job that returns after every lane finished. On the GPU each pass is
//! its own compute pass.
//!
//! Keys are looked up through the ids (`cell_ids[particle_ids[i]]`), so only
//! the id array is permuted. Ties resolve in either order.

use rayon::prelude::*;

use crate::grid::SENTINEL_CELL;
use crate::spatial::CellPairs;

/// Pairs per rayon task below which splitting stops paying off.
const MIN_PAIRS_PER_TASK: usize = 1024;

/// Parameters of one compare-exchange pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitonicPass {
    /// Span of the bitonic sequences being merged (stage size).
    pub k: u32,
    /// Distance between compared slots.
    pub j: u32,
}

/// Every pass of the network for `padded_len` slots, in execution order.
///
/// `padded_len` must be zero or a power of two. There are
/// `log2(n) * (log2(n) + 1) / 2` passes.
pub fn bitonic_passes(padded_len: usize) -> Vec<BitonicPass> {
    debug_assert!(padded_len == 0 || padded_len.is_power_of_two());
    let mut passes = Vec::new();
    let mut k = 2usize;
    while k <= padded_len {
        let mut j = k / 2;
        while j > 0 {
            passes.push(BitonicPass {
                k: k as u32,
                j: j as u32,
            });
            j /= 2;
        }
        k *= 2;
    }
    passes
}

/// Sort `pairs` so `cellIds[particleIds[i]]` is non-decreasing.
///
/// No-op for zero or one particle. `cell_ids` is never modified.
pub fn bitonic_sort(pairs: &mut CellPairs) {
    if pairs.len() <= 1 {
        return;
    }
    let (ids, keys) = pairs.sort_parts();
    for pass in bitonic_passes(ids.len()) {
        compare_exchange_pass(ids, keys, pass);
    }
}

#[inline]
fn sort_key(keys: &[u32], id: u32) -> u32 {
    keys.get(id as usize).copied().unwrap_or(SENTINEL_CELL)
}

/// One pass: every slot `i` with `i & j == 0` is compared with `i + j`.
///
/// Slots are grouped in blocks of `2j`. Since `2j <= k` and blocks are
/// aligned, every slot of a block agrees on the direction bit `i & k`.
fn compare_exchange_pass(ids: &mut [u32], keys: &[u32], pass: BitonicPass) {
    let k = pass.k as usize;
    let j = pass.j as usize;
    let block = 2 * j;
    let min_blocks = (MIN_PAIRS_PER_TASK / j).max(1);

    ids.par_chunks_mut(block)
        .with_min_len(min_blocks)
        .enumerate()
        .for_each(|(b, chunk)| {
            let ascending = (b * block) & k == 0;
            let (lo, hi) = chunk.split_at_mut(j);
            for (a, c) in lo.iter_mut().zip(hi.iter_mut()) {
                let ka = sort_key(keys, *a);
                let kc = sort_key(keys, *c);
                let out_of_order = if ascending { ka > kc } else { ka < kc };
                if out_of_order {
                    std::mem::swap(a, c);
                }
            }
        });
}

/// Uniform block for one GPU sort pass.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SortPassParams {
    pub k: u32,
    pub j: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl From<BitonicPass> for SortPassParams {
    fn from(pass: BitonicPass) -> Self {
        Self {
            k: pass.k,
            j: pass.j,
            ..Default::default()
        }
    }
}

/// WGSL compare-exchange kernel; one lane per compared pair.
pub const BITONIC_WGSL: &str = r#"
struct SortPass {
    k: u32,
    j: u32,
    _pad0: u32,
    _pad1: u32,
};

@group(1) @binding(0) var<uniform> sort_pass: SortPass;

fn sort_key(id: u32) -> u32 {
    if id >= grid.num_particles {
        return 0xFFFFFFFFu;
    }
    return cell_ids[id];
}

@compute @workgroup_size(128)
fn bitonic_pass(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let t = linear_index(gid, nwg);
    if t >= grid.padded_len / 2u {
        return;
    }

    let j = sort_pass.j;
    let i = 2u * j * (t / j) + (t % j);
    let l = i + j;

    let a = particle_ids[i];
    let b = particle_ids[l];
    let ka = sort_key(a);
    let kb = sort_key(b);

    let ascending = (i & sort_pass.k) == 0u;
    if (ascending && ka > kb) || (!ascending && ka < kb) {
        particle_ids[i] = b;
        particle_ids[l] = a;
    }
}
"#;
