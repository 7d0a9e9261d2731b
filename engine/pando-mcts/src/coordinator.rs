//! Inference coordination: the adaptive barrier and unified batching.
//!
//! Workers that accumulated pending leaves rendezvous here once per round;
//! idle workers never touch the barrier, so a round only waits for the
//! workers that actually have work. The last worker to arrive becomes the
//! round's coordinator: it concatenates every participant's pending
//! leaves, drives one batched evaluator call, writes the normalised
//! priors onto the leaf edges, and scatters the value results back to
//! per-worker outboxes. Everyone then backpropagates its own results.
//!
//! The announce/arrive counters, the coordinator election, and the round
//! generation all live under one mutex, which closes the window where a
//! late worker could be miscounted across rounds. The bounded announce
//! window between the two increments is what lets near-simultaneous
//! finishers share a batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use pando_core::Engine;

use crate::evaluator::{EvalOutput, Evaluator};
use crate::tree::{PathStep, SearchTree};
use crate::worker::{PendingLeaf, WorkerContext};

/// Sleep between announcing and arriving, letting workers that finished
/// their simulation phase at almost the same time join the round.
const ANNOUNCE_WINDOW: Duration = Duration::from_micros(100);

/// Upper bound on a non-coordinator's wait for round results. Tripping it
/// means the coordinator stalled; the worker gives up on the round and
/// the controller surfaces the failure through `wait_for_idle`.
const RESULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// An evaluated (or failed) leaf handed back to its worker.
#[derive(Debug)]
pub struct EvaluatedLeaf {
    pub path: Vec<PathStep>,
    /// Per-player values to commit; empty when the evaluator failed and
    /// the coordinator already reverted the path.
    pub values: Vec<f32>,
}

#[derive(Debug, Default)]
struct BarrierState {
    workers_with_work: usize,
    workers_waiting: usize,
    coordination_in_progress: bool,
    results_ready: bool,
    round: u64,
}

/// Barrier plus per-worker mailboxes. One instance per searcher.
pub struct InferenceCoordinator<E: Engine> {
    state: Mutex<BarrierState>,
    cv: Condvar,
    inbox: Vec<Mutex<Vec<PendingLeaf<E>>>>,
    outbox: Vec<Mutex<Vec<EvaluatedLeaf>>>,
    batch_id: AtomicU64,
}

impl<E: Engine> InferenceCoordinator<E> {
    pub fn new(num_workers: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cv: Condvar::new(),
            inbox: (0..num_workers).map(|_| Mutex::new(Vec::new())).collect(),
            outbox: (0..num_workers).map(|_| Mutex::new(Vec::new())).collect(),
            batch_id: AtomicU64::new(0),
        }
    }

    /// Completed batch rounds since construction.
    pub fn batch_id(&self) -> u64 {
        self.batch_id.load(Ordering::Acquire)
    }

    /// True when no round is running and no worker is inside the barrier.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.workers_with_work == 0
            && state.workers_waiting == 0
            && !state.coordination_in_progress
    }

    /// Force-release a wedged barrier: wake every waiter, reset the
    /// counters, and revert anything stranded in the mailboxes so no
    /// virtual loss or stale path survives into the next search.
    /// Recovery path only.
    pub fn force_release(&self, tree: &SearchTree<E>) {
        let mut state = self.state.lock().unwrap();
        warn!(
            with_work = state.workers_with_work,
            waiting = state.workers_waiting,
            "force-releasing inference barrier"
        );
        state.workers_with_work = 0;
        state.workers_waiting = 0;
        state.coordination_in_progress = false;
        state.results_ready = false;
        state.round += 1;
        drop(state);
        self.cv.notify_all();

        for slot in &self.inbox {
            let mut taken = Vec::new();
            std::mem::swap(&mut taken, &mut slot.lock().unwrap());
            for leaf in taken {
                tree.cleanup_path(&leaf.path);
                tree.release_reservation();
            }
        }
        for slot in &self.outbox {
            let mut taken = Vec::new();
            std::mem::swap(&mut taken, &mut slot.lock().unwrap());
            for leaf in taken {
                // Entries with empty values were reverted already.
                if !leaf.values.is_empty() {
                    tree.cleanup_path(&leaf.path);
                    tree.release_reservation();
                }
            }
        }
    }

    /// One barrier round for a worker with pending leaves.
    ///
    /// Returns the number of simulations committed by this worker.
    pub fn barrier_round<V: Evaluator<E::IdxState>>(
        &self,
        tree: &SearchTree<E>,
        evaluator: &V,
        ctx: &mut WorkerContext<E>,
    ) -> u32 {
        debug_assert!(ctx.has_pending());

        // Announce. A round that is mid-coordination or still draining its
        // results is left alone; we join the next one.
        let my_round;
        {
            let mut state = self.state.lock().unwrap();
            while state.coordination_in_progress || state.results_ready {
                let (next, _) = self
                    .cv
                    .wait_timeout(state, RESULT_WAIT_TIMEOUT)
                    .unwrap();
                state = next;
            }
            state.workers_with_work += 1;
            my_round = state.round;
        }

        // Post the batch where the coordinator can reach it.
        self.inbox[ctx.id].lock().unwrap().append(&mut ctx.pending);

        // Give same-round finishers a moment to announce too.
        std::thread::sleep(ANNOUNCE_WINDOW);

        // Arrive; the last arriver coordinates.
        let coordinate = {
            let mut state = self.state.lock().unwrap();
            state.workers_waiting += 1;
            let last = state.workers_waiting == state.workers_with_work;
            if last {
                state.coordination_in_progress = true;
            }
            last
        };

        if coordinate {
            self.coordinate(tree, evaluator);
            let mut state = self.state.lock().unwrap();
            state.coordination_in_progress = false;
            state.results_ready = true;
            drop(state);
            self.cv.notify_all();
        } else {
            let mut state = self.state.lock().unwrap();
            while !state.results_ready && state.round == my_round {
                let (next, timeout) = self
                    .cv
                    .wait_timeout(state, RESULT_WAIT_TIMEOUT)
                    .unwrap();
                state = next;
                if timeout.timed_out() && !state.results_ready && state.round == my_round {
                    warn!(worker = ctx.id, "barrier result wait timed out");
                    break;
                }
            }
        }

        // Backpropagate whatever came back for this worker.
        let mut results = Vec::new();
        std::mem::swap(&mut results, &mut self.outbox[ctx.id].lock().unwrap());
        let mut committed = 0u32;
        for leaf in results {
            if leaf.values.is_empty() {
                continue; // already reverted by the coordinator
            }
            tree.commit_path(&leaf.path, &leaf.values);
            tree.finish_simulation();
            committed += 1;
        }

        // Exit; the last worker out closes the round.
        {
            let mut state = self.state.lock().unwrap();
            state.workers_waiting = state.workers_waiting.saturating_sub(1);
            state.workers_with_work = state.workers_with_work.saturating_sub(1);
            if state.workers_waiting == 0 {
                state.results_ready = false;
                state.round += 1;
                self.batch_id.fetch_add(1, Ordering::Release);
                drop(state);
                self.cv.notify_all();
            }
        }

        committed
    }

    /// Assemble the unified batch, run the evaluator, store priors, and
    /// scatter values. Runs with the barrier mutex released; the
    /// `coordination_in_progress` flag keeps newcomers out.
    fn coordinate<V: Evaluator<E::IdxState>>(&self, tree: &SearchTree<E>, evaluator: &V) {
        // Drain every participant's inbox, remembering per-worker extents.
        let mut batches: Vec<(usize, Vec<PendingLeaf<E>>)> = Vec::new();
        for (worker, slot) in self.inbox.iter().enumerate() {
            let mut taken = Vec::new();
            std::mem::swap(&mut taken, &mut slot.lock().unwrap());
            if !taken.is_empty() {
                batches.push((worker, taken));
            }
        }
        if batches.is_empty() {
            return;
        }

        let total: usize = batches.iter().map(|(_, b)| b.len()).sum();
        trace!(leaves = total, "coordinating inference round");

        let histories: Vec<_> = batches
            .iter()
            .flat_map(|(_, leaves)| leaves.iter().map(|l| l.history.clone()))
            .collect();

        // The evaluator contract caps one forward at batch_size; chunk the
        // unified batch accordingly.
        let chunk = tree.config().batch_size.max(1);
        let mut outputs: Vec<EvalOutput> = Vec::with_capacity(total);
        let mut failed = false;
        for window in histories.chunks(chunk) {
            let mut out = Vec::new();
            match evaluator.forward_batch(window, &mut out) {
                Ok(()) if out.len() == window.len() => outputs.append(&mut out),
                Ok(()) => {
                    warn!(
                        expected = window.len(),
                        got = out.len(),
                        "evaluator returned short batch"
                    );
                    failed = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "evaluator failed; reverting round");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            // Revert every pending path so no virtual loss leaks, and hand
            // the workers empty result queues. The simulation count does
            // not advance; the workers simply retry.
            for (_, leaves) in batches {
                for leaf in leaves {
                    tree.cleanup_path(&leaf.path);
                    tree.release_reservation();
                }
            }
            return;
        }

        let mut cursor = 0usize;
        for (worker, leaves) in batches {
            let mut outbox = self.outbox[worker].lock().unwrap();
            for leaf in leaves {
                let output = &outputs[cursor];
                cursor += 1;

                if output.values.len() != tree.num_players() {
                    warn!(
                        worker,
                        got = output.values.len(),
                        "evaluator values have wrong arity; reverting leaf"
                    );
                    tree.cleanup_path(&leaf.path);
                    tree.release_reservation();
                    outbox.push(EvaluatedLeaf {
                        path: leaf.path,
                        values: Vec::new(),
                    });
                    continue;
                }

                tree.apply_policy(leaf.leaf, &output.policy);
                outbox.push(EvaluatedLeaf {
                    path: leaf.path,
                    values: output.values.clone(),
                });
            }
        }
        debug!(leaves = total, "inference round complete");
    }
}
