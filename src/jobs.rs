//! Coarse parallelism for bulk, disjoint-slice work (spec §4.2 Generation,
//! §9 "coarse parallelism", §10.2).
//!
//! `RenderPass::generate` is the one place this crate fans out across
//! threads: each worker owns a disjoint sub-slice of a pre-sized command
//! buffer, located by the scene's prefix-summed primitive count, so no
//! synchronization is needed between workers — the app thread only joins
//! once, before sort. This crate has no job-system of its own (out of
//! scope); `rayon`'s `par_chunks_mut` plays that role, chunked at
//! [`JOBS_PARALLEL_FOR_COMMANDS_COUNT`] renderables per job. `rayon` is not
//! part of the structural teacher's dependency stack — it's grounded in
//! sibling example repos in the retrieved pack that reach for it at this
//! exact shape of problem (see `DESIGN.md`).

use rayon::prelude::*;

/// Renderables per parallel chunk during command generation. A
/// build-time choice (spec §9 Open Question 2); kept small enough that a
/// frame with few visible renderables still gets some parallelism.
pub const JOBS_PARALLEL_FOR_COMMANDS_COUNT: usize = 64;

/// Splits `[0, count)` into chunks of up to [`JOBS_PARALLEL_FOR_COMMANDS_COUNT`]
/// renderable indices and runs `body` on each chunk in parallel. `body`
/// receives the chunk's starting renderable index and its length; it is
/// responsible for locating its own disjoint sub-slice of the command
/// buffer (typically via a prefix sum).
pub fn parallel_for_renderables(count: usize, body: impl Fn(usize, usize) + Sync) {
    if count == 0 {
        return;
    }
    let chunk_starts: Vec<usize> = (0..count).step_by(JOBS_PARALLEL_FOR_COMMANDS_COUNT).collect();
    chunk_starts.par_iter().for_each(|&start| {
        let len = (count - start).min(JOBS_PARALLEL_FOR_COMMANDS_COUNT);
        body(start, len);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn every_index_is_visited_exactly_once() {
        let count = JOBS_PARALLEL_FOR_COMMANDS_COUNT * 3 + 5;
        let seen = Mutex::new(vec![0u32; count]);
        parallel_for_renderables(count, |start, len| {
            let mut seen = seen.lock();
            for i in start..start + len {
                seen[i] += 1;
            }
        });
        assert!(seen.lock().iter().all(|&c| c == 1));
    }

    #[test]
    fn empty_range_runs_no_chunks() {
        let ran = Mutex::new(false);
        parallel_for_renderables(0, |_, _| *ran.lock() = true);
        assert!(!*ran.lock());
    }

    #[test]
    fn chunks_never_exceed_the_configured_size() {
        let count = JOBS_PARALLEL_FOR_COMMANDS_COUNT + 1;
        let max_len = Mutex::new(0usize);
        parallel_for_renderables(count, |_, len| {
            let mut max_len = max_len.lock();
            *max_len = (*max_len).max(len);
        });
        assert!(*max_len.lock() <= JOBS_PARALLEL_FOR_COMMANDS_COUNT);
    }
}
