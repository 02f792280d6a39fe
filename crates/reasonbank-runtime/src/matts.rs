//! [`MattsEngine`] – memory-aware test-time scaling.
//!
//! Two strategies spend extra executor calls on one query before anything is
//! written to the memory bank:
//!
//! - **Parallel scaling (self-contrast)** – `k` independent attempts run
//!   concurrently with the same prior memories.  Every attempt is judged and
//!   distilled, so failed attempts still leave corrective lessons behind, and
//!   one representative trajectory is selected.
//! - **Sequential scaling (self-refinement)** – one attempt is revised up to
//!   `k − 1` times using the judge's verdict on the previous attempt, stopping
//!   early on success.  Only the terminal attempt is distilled.
//!
//! An executor error or timeout counts as a `Failure` attempt whose
//! trajectory text starts with [`EXECUTOR_FAILURE_MARKER`]; such attempts are
//! never judged or distilled.  When every attempt fails the call returns
//! [`BankError::AllTrajectoriesFailed`] and nothing is consolidated.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use reasonbank_types::{BankError, MemoryItem, Outcome, RefinementContext, ScalingResult};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bank::MemoryBank;
use crate::executor::{Executor, ExecutorError};
use crate::llm_driver::{ChatMessage, LanguageModel};

/// Prefix of the trajectory text recorded for a failed executor invocation.
pub const EXECUTOR_FAILURE_MARKER: &str = "[executor failure]";

/// Upper bound on per-call buffer pre-allocation; `k` itself is unbounded.
const PREALLOCATED_ATTEMPTS: usize = 16;

const SYNTHESIS_PROMPT: &str = "\
You are given a task and several independent attempts at it. Select the best \
attempt or synthesise a final answer from them. Reply with the final answer only.";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning knobs for [`MattsEngine`].
#[derive(Debug, Clone)]
pub struct MattsConfig {
    /// Prior memories retrieved once per scaling call (0 disables retrieval).
    pub prior_k: usize,
    /// Deadline for a single executor invocation.
    pub branch_timeout: Duration,
    /// Ask the synthesis model for a final answer after parallel scaling.
    pub synthesize: bool,
}

impl Default for MattsConfig {
    fn default() -> Self {
        Self {
            prior_k: 1,
            branch_timeout: Duration::from_secs(120),
            synthesize: true,
        }
    }
}

enum BranchRun {
    Completed(String),
    Errored(ExecutorError),
    Aborted,
}

fn failure_text(err: &ExecutorError) -> String {
    format!("{EXECUTOR_FAILURE_MARKER} {err}")
}

// ─────────────────────────────────────────────────────────────────────────────
// MattsEngine
// ─────────────────────────────────────────────────────────────────────────────

pub struct MattsEngine {
    bank: Arc<MemoryBank>,
    executor: Arc<dyn Executor>,
    synthesizer: Option<Arc<dyn LanguageModel>>,
    config: MattsConfig,
}

impl MattsEngine {
    pub fn new(bank: Arc<MemoryBank>, executor: Arc<dyn Executor>) -> Self {
        Self {
            bank,
            executor,
            synthesizer: None,
            config: MattsConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MattsConfig) -> Self {
        self.config = config;
        self
    }

    /// Model used for the optional parallel-scaling final answer.
    pub fn with_synthesizer(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.synthesizer = Some(model);
        self
    }

    pub fn bank(&self) -> &Arc<MemoryBank> {
        &self.bank
    }

    pub fn config(&self) -> &MattsConfig {
        &self.config
    }

    /// Single executor invocation under the configured deadline.
    pub async fn execute(
        &self,
        query: &str,
        prior_memories: &[MemoryItem],
        refinement: Option<&RefinementContext>,
    ) -> Result<String, ExecutorError> {
        let timeout = self.config.branch_timeout;
        match tokio::time::timeout(timeout, self.executor.run(query, prior_memories, refinement)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(timeout)),
        }
    }

    async fn prior_memories(&self, query: &str) -> Result<Vec<MemoryItem>, BankError> {
        if self.config.prior_k == 0 {
            return Ok(Vec::new());
        }
        self.bank.retrieve_memories(query, self.config.prior_k).await
    }

    // ── parallel ─────────────────────────────────────────────────────────────

    /// Parallel self-contrast with `k` attempts.
    pub async fn parallel_scaling(&self, query: &str, k: usize) -> Result<ScalingResult, BankError> {
        self.parallel_scaling_with_cancel(query, k, CancellationToken::new())
            .await
    }

    /// [`parallel_scaling`](Self::parallel_scaling) that stops waiting on
    /// in-flight attempts once `cancel` fires.  Cancelled attempts are left
    /// out of the result entirely.
    #[instrument(skip_all, fields(query_len = query.len(), k = k))]
    pub async fn parallel_scaling_with_cancel(
        &self,
        query: &str,
        k: usize,
        cancel: CancellationToken,
    ) -> Result<ScalingResult, BankError> {
        if k < 1 {
            return Err(BankError::InvalidArgument("k must be at least 1".into()));
        }
        let prior: Arc<[MemoryItem]> = self.prior_memories(query).await?.into();

        let timeout = self.config.branch_timeout;
        let mut join_set = JoinSet::new();
        for idx in 0..k {
            let executor = Arc::clone(&self.executor);
            let prior = Arc::clone(&prior);
            let query = query.to_string();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let run = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => BranchRun::Aborted,
                    result = tokio::time::timeout(timeout, executor.run(&query, &prior, None)) => {
                        match result {
                            Ok(Ok(trajectory)) => BranchRun::Completed(trajectory),
                            Ok(Err(e)) => BranchRun::Errored(e),
                            Err(_) => BranchRun::Errored(ExecutorError::Timeout(timeout)),
                        }
                    }
                };
                (idx, run)
            });
        }

        let capacity = k.min(PREALLOCATED_ATTEMPTS);
        let mut runs: Vec<(usize, BranchRun)> = Vec::with_capacity(capacity);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(run) => runs.push(run),
                Err(e) => warn!(error = %e, "parallel branch task did not finish"),
            }
        }
        runs.sort_by_key(|(idx, _)| *idx);
        let mut runs = runs.into_iter().peekable();

        let mut trajectories = Vec::with_capacity(capacity);
        let mut outcomes = Vec::with_capacity(capacity);
        // Positions in `trajectories` of attempts that produced a real trajectory.
        let mut executed = Vec::with_capacity(capacity);
        for idx in 0..k {
            let run = match runs.next_if(|(i, _)| *i == idx) {
                Some((_, run)) => run,
                None => BranchRun::Errored(ExecutorError::Failed("branch task panicked".into())),
            };
            match run {
                BranchRun::Aborted => debug!(branch = idx, "branch cancelled"),
                BranchRun::Errored(e) => {
                    warn!(branch = idx, error = %e, "parallel branch failed");
                    trajectories.push(failure_text(&e));
                    outcomes.push(Outcome::Failure);
                }
                BranchRun::Completed(trajectory) => {
                    executed.push(trajectories.len());
                    trajectories.push(trajectory);
                    outcomes.push(Outcome::Unknown);
                }
            }
        }

        if trajectories.is_empty() {
            return Err(BankError::Cancelled);
        }
        if executed.is_empty() {
            return Err(BankError::AllTrajectoriesFailed {
                attempts: trajectories.len(),
            });
        }

        let judge = self.bank.judge();
        let verdicts = try_join_all(
            executed
                .iter()
                .map(|&pos| judge.judge(&trajectories[pos], query)),
        )
        .await?;
        for (&pos, verdict) in executed.iter().zip(verdicts) {
            outcomes[pos] = verdict;
        }

        let chosen = self.select(&executed, &trajectories, &outcomes).await;

        let distiller = self.bank.distiller();
        let distilled = try_join_all(
            executed
                .iter()
                .map(|&pos| distiller.distill(&trajectories[pos], query, outcomes[pos])),
        )
        .await?;

        let mut items = Vec::new();
        for (&pos, branch_items) in executed.iter().zip(distilled) {
            items.extend(branch_items.iter().cloned());
            self.bank
                .consolidate(query, &trajectories[pos], outcomes[pos], branch_items)
                .await?;
        }
        info!(
            attempts = trajectories.len(),
            executed = executed.len(),
            chosen_outcome = %outcomes[chosen],
            n_items = items.len(),
            "parallel scaling consolidated"
        );

        let executed_texts: Vec<&str> = executed.iter().map(|&p| trajectories[p].as_str()).collect();
        let synthesized_answer = self.synthesize(query, &executed_texts).await;

        Ok(ScalingResult {
            chosen_or_final: trajectories[chosen].clone(),
            chosen_outcome: outcomes[chosen],
            trajectories,
            outcomes,
            items,
            synthesized_answer,
        })
    }

    /// Pick the representative among executed attempts.
    ///
    /// The pool is the `Success` attempts, else the `Unknown` ones.  When the
    /// pool is empty the first executed attempt represents the call.
    async fn select(&self, executed: &[usize], trajectories: &[String], outcomes: &[Outcome]) -> usize {
        let pool_of = |wanted: Outcome| -> Vec<usize> {
            executed
                .iter()
                .copied()
                .filter(|&p| outcomes[p] == wanted)
                .collect()
        };
        let mut pool = pool_of(Outcome::Success);
        if pool.is_empty() {
            pool = pool_of(Outcome::Unknown);
        }
        if pool.is_empty() {
            return executed[0];
        }
        self.self_contrast(&pool, trajectories).await
    }

    /// Majority agreement within `pool`; ties go to the earliest attempt.
    /// Falls back to the first candidate when the executor cannot compare.
    async fn self_contrast(&self, pool: &[usize], trajectories: &[String]) -> usize {
        if pool.len() < 2 {
            return pool[0];
        }
        let mut votes = vec![0usize; pool.len()];
        for i in 0..pool.len() {
            for j in (i + 1)..pool.len() {
                match self
                    .executor
                    .agree(&trajectories[pool[i]], &trajectories[pool[j]])
                    .await
                {
                    Some(true) => {
                        votes[i] += 1;
                        votes[j] += 1;
                    }
                    Some(false) => {}
                    None => return pool[0],
                }
            }
        }
        let mut best = 0;
        for (i, &v) in votes.iter().enumerate() {
            if v > votes[best] {
                best = i;
            }
        }
        debug!(?votes, chosen = pool[best], "self-contrast vote");
        pool[best]
    }

    async fn synthesize(&self, query: &str, trajectories: &[&str]) -> Option<String> {
        if !self.config.synthesize {
            return None;
        }
        let model = self.synthesizer.as_ref()?;
        let listing = trajectories
            .iter()
            .enumerate()
            .map(|(i, t)| format!("### Attempt {}\n{t}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages = [
            ChatMessage::system(SYNTHESIS_PROMPT),
            ChatMessage::user(format!("Query: {query}\n\n{listing}")),
        ];
        match model.complete(&messages).await {
            Ok(answer) => Some(answer),
            Err(e) => {
                warn!(error = %e, "final-answer synthesis failed");
                None
            }
        }
    }

    // ── sequential ───────────────────────────────────────────────────────────

    /// Sequential self-refinement with at most `k` attempts.
    pub async fn sequential_scaling(&self, query: &str, k: usize) -> Result<ScalingResult, BankError> {
        self.sequential_scaling_with_cancel(query, k, CancellationToken::new())
            .await
    }

    /// [`sequential_scaling`](Self::sequential_scaling) that stops refining
    /// once `cancel` fires.  The round in flight is dropped; the attempts
    /// already judged are consolidated as usual.
    #[instrument(skip_all, fields(query_len = query.len(), k = k))]
    pub async fn sequential_scaling_with_cancel(
        &self,
        query: &str,
        k: usize,
        cancel: CancellationToken,
    ) -> Result<ScalingResult, BankError> {
        if k < 1 {
            return Err(BankError::InvalidArgument("k must be at least 1".into()));
        }
        let prior = self.prior_memories(query).await?;

        let mut trajectories = Vec::new();
        let mut outcomes = Vec::new();
        let mut last_executed: Option<usize> = None;
        let mut refinement: Option<RefinementContext> = None;

        for round in 0..k {
            let run = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                run = self.execute(query, &prior, refinement.as_ref()) => Some(run),
            };
            let Some(run) = run else {
                debug!(round, "refinement cancelled");
                break;
            };
            match run {
                Ok(trajectory) => {
                    let outcome = self.bank.judge().judge(&trajectory, query).await?;
                    debug!(round, %outcome, "refinement round judged");
                    last_executed = Some(trajectories.len());
                    refinement = Some(RefinementContext {
                        previous_trajectory: trajectory.clone(),
                        previous_outcome: outcome,
                    });
                    trajectories.push(trajectory);
                    outcomes.push(outcome);
                    if outcome == Outcome::Success {
                        break;
                    }
                }
                Err(e) => {
                    warn!(round, error = %e, "refinement round failed");
                    let text = failure_text(&e);
                    refinement = Some(RefinementContext {
                        previous_trajectory: text.clone(),
                        previous_outcome: Outcome::Failure,
                    });
                    trajectories.push(text);
                    outcomes.push(Outcome::Failure);
                }
            }
        }

        if trajectories.is_empty() {
            return Err(BankError::Cancelled);
        }
        let terminal = last_executed.ok_or(BankError::AllTrajectoriesFailed {
            attempts: trajectories.len(),
        })?;
        let (final_trajectory, final_outcome) = (&trajectories[terminal], outcomes[terminal]);

        let items = self
            .bank
            .distiller()
            .distill(final_trajectory, query, final_outcome)
            .await?;
        self.bank
            .consolidate(query, final_trajectory, final_outcome, items.clone())
            .await?;
        info!(
            rounds = trajectories.len(),
            outcome = %final_outcome,
            n_items = items.len(),
            "sequential scaling consolidated"
        );

        Ok(ScalingResult {
            chosen_or_final: final_trajectory.clone(),
            chosen_outcome: final_outcome,
            trajectories,
            outcomes,
            items,
            synthesized_answer: None,
        })
    }
}
