//! Dispatch and consensus: fan a turn out to adapters and pick the reply.

mod scoring;

pub use scoring::ScoringPolicy;

use duet_rs_config::DispatchConfig;
use duet_rs_protocol::{
    AdapterFailure, AdapterRequest, AdapterResponse, ConversationContext, DispatchMode,
    ModelAdapter,
};
use futures_util::FutureExt;
use log::{debug, info, warn};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// A successful adapter reply with the bookkeeping used for ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSuccess {
    pub adapter_id: String,
    /// Position in the engine's priority order.
    pub rank: usize,
    pub response: AdapterResponse,
    /// Wall time of the call as measured by the engine.
    pub latency: Duration,
    pub score: f32,
}

/// Result of a dispatch that produced a reply.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub winner: AdapterSuccess,
    /// Successful replies that lost.
    pub runners_up: Vec<AdapterSuccess>,
    /// Adapters that failed before dispatch concluded.
    pub failures: Vec<(String, AdapterFailure)>,
    /// Whether the turn deadline cut collection short.
    pub deadline_hit: bool,
}

/// Why a dispatch produced no reply.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchFailure {
    #[error("all adapters failed: {}", FailureList(.0))]
    AllAdaptersFailed(Vec<(String, AdapterFailure)>),
    #[error("no adapter can handle this turn")]
    NoCapableAdapter,
    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),
    #[error("no adapter replied before the turn deadline")]
    Timeout,
    #[error("dispatch cancelled")]
    Cancelled,
}

struct FailureList<'a>(&'a [(String, AdapterFailure)]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (adapter_id, failure)) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{adapter_id}: {failure}")?;
        }
        Ok(())
    }
}

struct Candidate {
    rank: usize,
    adapter: Arc<dyn ModelAdapter>,
    context: Arc<ConversationContext>,
}

struct Completion {
    rank: usize,
    adapter_id: String,
    latency: Duration,
    result: Result<AdapterResponse, AdapterFailure>,
}

/// Runs adapters for a turn and selects the reply.
pub struct DispatchEngine {
    /// Adapters in priority order.
    adapters: Vec<Arc<dyn ModelAdapter>>,
    adapter_timeout: Duration,
    turn_deadline: Duration,
    scoring: ScoringPolicy,
}

impl DispatchEngine {
    /// Register `adapters`, ordered by `config.priority`; adapters the list
    /// does not name keep their relative order after the listed ones.
    pub fn new(adapters: Vec<Arc<dyn ModelAdapter>>, config: &DispatchConfig) -> Self {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            if seen.insert(adapter.id().to_string()) {
                unique.push(adapter);
            } else {
                warn!("ignoring duplicate adapter (adapter_id={})", adapter.id());
            }
        }
        let priority_of = |adapter: &Arc<dyn ModelAdapter>| {
            config
                .priority
                .iter()
                .position(|id| id == adapter.id())
                .unwrap_or(usize::MAX)
        };
        unique.sort_by_key(|adapter| priority_of(adapter));

        info!(
            "dispatch engine ready (adapters={:?}, adapter_timeout_ms={}, turn_deadline_ms={})",
            unique.iter().map(|adapter| adapter.id()).collect::<Vec<_>>(),
            config.adapter_timeout_ms,
            config.turn_deadline_ms
        );
        Self {
            adapters: unique,
            adapter_timeout: Duration::from_millis(config.adapter_timeout_ms),
            turn_deadline: Duration::from_millis(config.turn_deadline_ms),
            scoring: ScoringPolicy::new(&config.scoring),
        }
    }

    /// Registered adapter ids in priority order.
    pub fn adapter_ids(&self) -> Vec<&str> {
        self.adapters.iter().map(|adapter| adapter.id()).collect()
    }

    pub fn has_adapter(&self, adapter_id: &str) -> bool {
        self.adapters.iter().any(|adapter| adapter.id() == adapter_id)
    }

    /// Query the adapters selected by `mode` and return the chosen reply.
    ///
    /// Unfinished adapter calls are cancelled once this returns.
    pub async fn dispatch(
        &self,
        context: Arc<ConversationContext>,
        mode: &DispatchMode,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchFailure> {
        if cancel.is_cancelled() {
            return Err(DispatchFailure::Cancelled);
        }
        let candidates = self.candidates(&context, mode)?;
        let single = matches!(mode, DispatchMode::Single(_));
        debug!(
            "dispatch starting (mode={}, candidates={}, turn_images={})",
            mode,
            candidates.len(),
            context.turn_has_images()
        );

        let calls = cancel.child_token();
        let mut tasks = JoinSet::new();
        for candidate in candidates {
            tasks.spawn(run_adapter(candidate, self.adapter_timeout, calls.child_token()));
        }

        let deadline = time::sleep(self.turn_deadline);
        tokio::pin!(deadline);
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    calls.cancel();
                    tasks.abort_all();
                    info!("dispatch cancelled by caller");
                    return Err(DispatchFailure::Cancelled);
                }
                _ = &mut deadline => {
                    deadline_hit = true;
                    warn!(
                        "turn deadline reached (pending={}, successes={})",
                        tasks.len(),
                        successes.len()
                    );
                    break;
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let completion = match joined {
                        Ok(completion) => completion,
                        Err(err) => {
                            warn!("adapter task did not complete (err={})", err);
                            continue;
                        }
                    };
                    match completion.result {
                        Ok(response) => {
                            let score = self
                                .scoring
                                .score(response.confidence_hint, completion.latency.as_secs_f32());
                            debug!(
                                "adapter succeeded (adapter_id={}, latency_ms={}, score={:.4})",
                                completion.adapter_id,
                                completion.latency.as_millis(),
                                score
                            );
                            successes.push(AdapterSuccess {
                                adapter_id: completion.adapter_id,
                                rank: completion.rank,
                                response,
                                latency: completion.latency,
                                score,
                            });
                        }
                        Err(failure) => {
                            warn!(
                                "adapter failed (adapter_id={}, latency_ms={}, err={})",
                                completion.adapter_id,
                                completion.latency.as_millis(),
                                failure
                            );
                            failures.push((completion.adapter_id, failure));
                        }
                    }
                    if single {
                        break;
                    }
                }
            }
        }

        calls.cancel();
        tasks.abort_all();

        let Some(index) = self.scoring.select(&successes) else {
            return Err(if deadline_hit {
                DispatchFailure::Timeout
            } else {
                DispatchFailure::AllAdaptersFailed(failures)
            });
        };
        let winner = successes.swap_remove(index);
        info!(
            "dispatch finished (winner={}, runners_up={}, failures={})",
            winner.adapter_id,
            successes.len(),
            failures.len()
        );
        Ok(DispatchOutcome {
            winner,
            runners_up: successes,
            failures,
            deadline_hit,
        })
    }

    fn candidates(
        &self,
        context: &Arc<ConversationContext>,
        mode: &DispatchMode,
    ) -> Result<Vec<Candidate>, DispatchFailure> {
        let image_turn = context.turn_has_images();
        let stripped = context
            .has_images()
            .then(|| Arc::new(context.without_images()));
        let context_for = |adapter: &Arc<dyn ModelAdapter>| match &stripped {
            Some(stripped) if !adapter.supports_images() => stripped.clone(),
            _ => context.clone(),
        };

        match mode {
            DispatchMode::Single(adapter_id) => {
                let (rank, adapter) = self
                    .adapters
                    .iter()
                    .enumerate()
                    .find(|(_, adapter)| adapter.id() == adapter_id)
                    .ok_or_else(|| DispatchFailure::UnknownAdapter(adapter_id.clone()))?;
                if image_turn && !adapter.supports_images() {
                    info!(
                        "image turn routed to text-only adapter (adapter_id={})",
                        adapter_id
                    );
                    return Err(DispatchFailure::NoCapableAdapter);
                }
                Ok(vec![Candidate {
                    rank,
                    adapter: adapter.clone(),
                    context: context_for(adapter),
                }])
            }
            DispatchMode::Auto => {
                let candidates: Vec<Candidate> = self
                    .adapters
                    .iter()
                    .enumerate()
                    .filter(|(_, adapter)| !image_turn || adapter.supports_images())
                    .map(|(rank, adapter)| Candidate {
                        rank,
                        adapter: adapter.clone(),
                        context: context_for(adapter),
                    })
                    .collect();
                if candidates.is_empty() {
                    return Err(DispatchFailure::NoCapableAdapter);
                }
                Ok(candidates)
            }
        }
    }
}

/// One adapter call with its own timeout; panics become `InvalidResponse`.
async fn run_adapter(
    candidate: Candidate,
    timeout: Duration,
    cancel: CancellationToken,
) -> Completion {
    let Candidate {
        rank,
        adapter,
        context,
    } = candidate;
    let adapter_id = adapter.id().to_string();
    let request = AdapterRequest::new(context);
    let started = Instant::now();
    let call = time::timeout(timeout, adapter.query(request, cancel));
    let result = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(result)) => result,
        Ok(Err(_elapsed)) => Err(AdapterFailure::Timeout),
        Err(panic) => Err(AdapterFailure::InvalidResponse(format!(
            "adapter panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };
    Completion {
        rank,
        adapter_id,
        latency: started.elapsed(),
        result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{DispatchFailure, FailureList};
    use duet_rs_protocol::AdapterFailure;
    use pretty_assertions::assert_eq;

    #[test]
    fn all_failed_display_names_every_adapter() {
        let failures = vec![
            ("gemini".to_string(), AdapterFailure::Timeout),
            (
                "huggingface".to_string(),
                AdapterFailure::Unauthorized("bad key".to_string()),
            ),
        ];
        assert_eq!(
            FailureList(&failures).to_string(),
            "gemini: timed out; huggingface: unauthorized: bad key"
        );
        assert_eq!(
            DispatchFailure::AllAdaptersFailed(failures).to_string(),
            "all adapters failed: gemini: timed out; huggingface: unauthorized: bad key"
        );
    }
}
