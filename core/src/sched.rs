//! GPU placement.
//!
//! Jobs are placed one at a time onto the *shortest* contiguous run of
//! free GPU indices that still fits, so long runs survive for future
//! wide requests. Node order is shuffled per job to level load across
//! equally good nodes; ties after the shuffle go to the first node
//! seen. Greedy and non-preemptive: a request that does not fit fails
//! instead of queueing.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;

use crate::error::CorralError;

/// The GPU widths a job may request.
pub const ALLOWED_WIDTHS: [usize; 6] = [0, 1, 2, 4, 8, 16];

/// Place `n_jobs` jobs of `n_gpus` GPUs each onto `available`
/// (node → sorted free GPU indices). Consumed GPUs are removed from
/// `available` as they are assigned.
pub fn schedule(
    available: &mut BTreeMap<String, Vec<u32>>,
    n_jobs: usize,
    n_gpus: usize,
) -> Result<Vec<(String, Vec<u32>)>, CorralError> {
    if !ALLOWED_WIDTHS.contains(&n_gpus) {
        return Err(CorralError::BadGpuCount(n_gpus));
    }

    let mut rng = rand::thread_rng();
    let mut placements = Vec::with_capacity(n_jobs);

    for i in 0..n_jobs {
        let mut nodes: Vec<String> = available.keys().cloned().collect();
        nodes.shuffle(&mut rng);

        // Zero-width jobs consume nothing; any node will do.
        if n_gpus == 0 {
            match nodes.first() {
                Some(node) => {
                    placements.push((node.clone(), Vec::new()));
                    continue;
                }
                None => {
                    return Err(CorralError::Unschedulable {
                        remaining: n_jobs - i,
                        n_gpus,
                    })
                }
            }
        }

        let mut best: Option<(String, Vec<u32>)> = None;
        for node in &nodes {
            for run in contiguous_runs(&available[node]) {
                let fits = run.len() >= n_gpus;
                let tighter = best.as_ref().is_none_or(|(_, b)| run.len() < b.len());
                if fits && tighter {
                    best = Some((node.clone(), run));
                }
            }
        }

        let Some((node, run)) = best else {
            return Err(CorralError::Unschedulable {
                remaining: n_jobs - i,
                n_gpus,
            });
        };

        let taken: Vec<u32> = run[..n_gpus].to_vec();
        let free = available.get_mut(&node).expect("node vanished mid-schedule");
        free.retain(|gpu| !taken.contains(gpu));
        placements.push((node, taken));
    }

    Ok(placements)
}

/// Split a free-GPU list into maximal runs of consecutive indices.
fn contiguous_runs(free: &[u32]) -> Vec<Vec<u32>> {
    let mut sorted = free.to_vec();
    sorted.sort_unstable();

    let mut runs: Vec<Vec<u32>> = Vec::new();
    for gpu in sorted {
        match runs.last_mut() {
            Some(run) if *run.last().expect("runs are never empty") + 1 == gpu => run.push(gpu),
            _ => runs.push(vec![gpu]),
        }
    }
    runs
}
