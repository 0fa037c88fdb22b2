//! Query dispatcher: spreads one prompt across providers.
//!
//! Three strategies:
//! - `all`: every selected provider on its own thread, gathered until the
//!   deadline. Providers still running at the deadline are abandoned.
//! - `sequential`: configured order, stopping at the first acceptable reply.
//! - `dialectic`: proposals, then a cross-critique round, then a synthesis
//!   round, all sharing one deadline.
//!
//! The ledger is consulted before every provider call. Once a limit trips the
//! dispatcher refuses all further work and every call returns the same
//! [`LimitExceeded`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::cost::{Ledger, LimitExceeded, Limits, Price, default_price, estimate_tokens};
use crate::core::metrics::DispatchMetrics;
use crate::core::types::{DispatchResult, ProviderResponse, Strategy};
use crate::io::prompt::{PromptEngine, RoundEntry};
use crate::io::provider::{Provider, ProviderReply};

/// Extra check a SEQUENTIAL reply must pass besides being non-empty.
pub type Acceptance<'a> = &'a (dyn Fn(&str) -> bool + Sync);

pub struct DispatchRequest<'a> {
    pub prompt: String,
    pub strategy: Strategy,
    /// Restrict the query to these provider ids; `None` means all.
    pub providers: Option<Vec<String>>,
    pub timeout: Duration,
    pub accept: Option<Acceptance<'a>>,
}

impl<'a> DispatchRequest<'a> {
    pub fn new(prompt: impl Into<String>, strategy: Strategy, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            strategy,
            providers: None,
            timeout,
            accept: None,
        }
    }

    pub fn with_providers(mut self, providers: Vec<String>) -> Self {
        if !providers.is_empty() {
            self.providers = Some(providers);
        }
        self
    }

    pub fn with_acceptance(mut self, accept: Acceptance<'a>) -> Self {
        self.accept = Some(accept);
        self
    }
}

type CallResult = (usize, Duration, Result<ProviderReply>);

/// Responses of one fan-out, in call order.
struct Round {
    responses: Vec<ProviderResponse>,
    timed_out: bool,
}

pub struct Dispatcher {
    providers: Vec<Arc<dyn Provider>>,
    prices: BTreeMap<String, Price>,
    ledger: Ledger,
    metrics: DispatchMetrics,
    prompts: PromptEngine,
    halted: Option<LimitExceeded>,
}

impl Dispatcher {
    pub fn new(providers: Vec<Arc<dyn Provider>>, limits: Limits) -> Self {
        Self {
            providers,
            prices: BTreeMap::new(),
            ledger: Ledger::new(limits),
            metrics: DispatchMetrics::default(),
            prompts: PromptEngine::new(),
            halted: None,
        }
    }

    /// Override the built-in price for a provider id.
    pub fn with_price(mut self, provider_id: &str, price: Price) -> Self {
        self.prices.insert(provider_id.to_string(), price);
        self
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn price(&self, provider_id: &str) -> Price {
        self.prices
            .get(provider_id)
            .copied()
            .unwrap_or_else(|| default_price(provider_id))
    }

    #[instrument(skip_all, fields(strategy = %request.strategy))]
    pub fn dispatch(&mut self, request: &DispatchRequest<'_>) -> Result<DispatchResult> {
        if let Some(limit) = &self.halted {
            return Err(limit.clone().into());
        }
        let selected = self.select(request.providers.as_deref())?;
        let queried: Vec<String> = selected.iter().map(|p| p.id().to_string()).collect();
        if selected.is_empty() {
            warn!("no providers selected");
            self.metrics.record_dispatch(false, false);
            return Ok(DispatchResult::failed(
                request.strategy,
                queried,
                "no providers selected".to_string(),
            ));
        }

        let deadline = Instant::now() + request.timeout;
        let outcome = match request.strategy {
            Strategy::All => self.dispatch_all(&selected, request, deadline),
            Strategy::Sequential => self.dispatch_sequential(&selected, request, deadline),
            Strategy::Dialectic => self.dispatch_dialectic(&selected, request, deadline),
        };
        let (result, timed_out) = match outcome {
            Ok(done) => done,
            Err(err) => {
                if let Some(limit) = err.downcast_ref::<LimitExceeded>() {
                    warn!(%limit, "dispatch halted by limit");
                    self.halted = Some(limit.clone());
                }
                return Err(err);
            }
        };
        self.metrics.record_dispatch(result.ok, timed_out);
        info!(
            queried = result.providers_queried.len(),
            responded = result.responses.len(),
            ok = result.ok,
            cost = result.total_cost,
            "dispatch finished"
        );
        Ok(result)
    }

    fn select(&self, allow: Option<&[String]>) -> Result<Vec<Arc<dyn Provider>>> {
        let Some(allow) = allow else {
            return Ok(self.providers.clone());
        };
        for id in allow {
            if !self.providers.iter().any(|p| p.id() == id) {
                bail!("unknown provider '{id}'");
            }
        }
        Ok(self
            .providers
            .iter()
            .filter(|p| allow.iter().any(|id| id == p.id()))
            .cloned()
            .collect())
    }

    fn dispatch_all(
        &mut self,
        selected: &[Arc<dyn Provider>],
        request: &DispatchRequest<'_>,
        deadline: Instant,
    ) -> Result<(DispatchResult, bool)> {
        let calls = selected
            .iter()
            .map(|p| (Arc::clone(p), request.prompt.clone()))
            .collect();
        let round = self.fan_out(calls, deadline)?;
        let queried = selected.iter().map(|p| p.id().to_string()).collect();
        let rounds = vec![round.responses.clone()];
        Ok((
            assemble(request.strategy, queried, round.responses, rounds),
            round.timed_out,
        ))
    }

    fn dispatch_sequential(
        &mut self,
        selected: &[Arc<dyn Provider>],
        request: &DispatchRequest<'_>,
        deadline: Instant,
    ) -> Result<(DispatchResult, bool)> {
        let mut queried = Vec::new();
        let mut seen = Vec::new();
        let mut accepted = None;
        let mut timed_out = false;

        for provider in selected {
            if deadline <= Instant::now() {
                timed_out = true;
                break;
            }
            queried.push(provider.id().to_string());
            let round = self.fan_out(
                vec![(Arc::clone(provider), request.prompt.clone())],
                deadline,
            )?;
            timed_out |= round.timed_out;
            let Some(response) = round.responses.into_iter().next() else {
                continue;
            };
            let acceptable = !response.raw_text.trim().is_empty()
                && request.accept.is_none_or(|accept| accept(&response.raw_text));
            seen.push(response.clone());
            if acceptable {
                accepted = Some(response);
                break;
            }
            debug!(provider = %provider.id(), "reply not acceptable, trying next provider");
        }

        let responses: Vec<ProviderResponse> = accepted.into_iter().collect();
        let mut result = assemble(request.strategy, queried, responses, vec![seen]);
        if !result.ok && result.rounds.iter().any(|r| !r.is_empty()) {
            result.error = Some("no provider returned an acceptable reply".to_string());
        }
        Ok((result, timed_out))
    }

    fn dispatch_dialectic(
        &mut self,
        selected: &[Arc<dyn Provider>],
        request: &DispatchRequest<'_>,
        deadline: Instant,
    ) -> Result<(DispatchResult, bool)> {
        let queried: Vec<String> = selected.iter().map(|p| p.id().to_string()).collect();

        let proposals = self.fan_out(
            selected
                .iter()
                .map(|p| (Arc::clone(p), request.prompt.clone()))
                .collect(),
            deadline,
        )?;
        let mut timed_out = proposals.timed_out;
        let mut rounds = vec![proposals.responses];

        let proposal_entries = round_entries(&rounds[0]);
        let mut critique_calls = Vec::new();
        for response in &rounds[0] {
            let others: Vec<RoundEntry> = proposal_entries
                .iter()
                .filter(|entry| entry.provider != response.provider_id)
                .cloned()
                .collect();
            let prompt = self
                .prompts
                .render_critique(&request.prompt, &response.raw_text, &others)?;
            critique_calls.push((provider_by_id(selected, &response.provider_id)?, prompt));
        }
        if !critique_calls.is_empty() {
            let critiques = self.fan_out(critique_calls, deadline)?;
            timed_out |= critiques.timed_out;
            rounds.push(critiques.responses);

            let critique_entries = round_entries(&rounds[1]);
            let synthesis_prompt =
                self.prompts
                    .render_synthesis(&request.prompt, &proposal_entries, &critique_entries)?;
            let synthesis_calls: Vec<_> = rounds[1]
                .iter()
                .map(|r| {
                    provider_by_id(selected, &r.provider_id).map(|p| (p, synthesis_prompt.clone()))
                })
                .collect::<Result<_>>()?;
            if !synthesis_calls.is_empty() {
                let synthesis = self.fan_out(synthesis_calls, deadline)?;
                timed_out |= synthesis.timed_out;
                rounds.push(synthesis.responses);
            }
        }

        let responses = rounds
            .iter()
            .rev()
            .find(|round| !round.is_empty())
            .cloned()
            .unwrap_or_default();
        debug!(
            rounds = rounds.len(),
            final_responses = responses.len(),
            "dialectic finished"
        );
        Ok((assemble(request.strategy, queried, responses, rounds), timed_out))
    }

    /// Run `calls` in parallel until they finish or `deadline` passes.
    fn fan_out(
        &mut self,
        calls: Vec<(Arc<dyn Provider>, String)>,
        deadline: Instant,
    ) -> Result<Round> {
        self.ledger.check(calls.len() as u64)?;

        let now = Instant::now();
        let Some(budget) = deadline.checked_duration_since(now).filter(|d| !d.is_zero()) else {
            return Ok(Round {
                responses: Vec::new(),
                timed_out: true,
            });
        };

        let ids: Vec<String> = calls.iter().map(|(p, _)| p.id().to_string()).collect();
        let prompts: Vec<String> = calls.iter().map(|(_, prompt)| prompt.clone()).collect();
        let (tx, rx) = mpsc::channel::<CallResult>();
        for (index, (provider, prompt)) in calls.into_iter().enumerate() {
            let tx = tx.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = provider.query(&prompt, budget);
                // The receiver is gone when the dispatcher has given up on us.
                let _ = tx.send((index, started.elapsed(), result));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<(Duration, Result<ProviderReply>)>> =
            (0..ids.len()).map(|_| None).collect();
        let mut pending = ids.len();
        let mut timed_out = false;
        while pending > 0 {
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                timed_out = true;
                break;
            };
            match rx.recv_timeout(remaining) {
                Ok((index, elapsed, result)) => {
                    slots[index] = Some((elapsed, result));
                    pending -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut responses = Vec::new();
        for ((id, prompt), slot) in ids.iter().zip(&prompts).zip(slots) {
            match slot {
                Some((elapsed, Ok(reply))) => {
                    let response = self.price_reply(id, prompt, reply, elapsed);
                    self.ledger.record_call(response.cost);
                    self.metrics
                        .record_success(id, response.token_count, response.cost);
                    responses.push(response);
                }
                Some((_, Err(err))) => {
                    warn!(provider = %id, err = %format!("{err:#}"), "provider failed");
                    self.ledger.record_call(0.0);
                    self.metrics.record_failure(id);
                }
                None => {
                    warn!(provider = %id, "provider abandoned at deadline");
                    self.ledger.record_call(0.0);
                    self.metrics.record_failure(id);
                }
            }
        }
        Ok(Round {
            responses,
            timed_out,
        })
    }

    fn price_reply(
        &self,
        provider_id: &str,
        prompt: &str,
        reply: ProviderReply,
        elapsed: Duration,
    ) -> ProviderResponse {
        let input_tokens = reply
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(prompt));
        let output_tokens = reply
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(&reply.text));
        ProviderResponse {
            provider_id: provider_id.to_string(),
            token_count: input_tokens + output_tokens,
            cost: self.price(provider_id).cost(input_tokens, output_tokens),
            elapsed_ms: elapsed.as_millis() as u64,
            raw_text: reply.text,
        }
    }
}

fn provider_by_id(selected: &[Arc<dyn Provider>], id: &str) -> Result<Arc<dyn Provider>> {
    match selected.iter().find(|p| p.id() == id) {
        Some(provider) => Ok(Arc::clone(provider)),
        None => bail!("provider '{id}' not in the selection"),
    }
}

fn round_entries(responses: &[ProviderResponse]) -> Vec<RoundEntry> {
    responses
        .iter()
        .map(|r| RoundEntry {
            provider: r.provider_id.clone(),
            text: r.raw_text.clone(),
        })
        .collect()
}

/// Totals cover every round, so audit cost matches what was spent.
fn assemble(
    strategy: Strategy,
    providers_queried: Vec<String>,
    responses: Vec<ProviderResponse>,
    rounds: Vec<Vec<ProviderResponse>>,
) -> DispatchResult {
    let total_tokens = rounds.iter().flatten().map(|r| r.token_count).sum();
    let total_cost = rounds.iter().flatten().map(|r| r.cost).sum();
    let ok = !responses.is_empty();
    DispatchResult {
        strategy,
        providers_queried,
        responses,
        rounds,
        total_tokens,
        total_cost,
        ok,
        error: (!ok).then(|| "no provider returned a response".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingProvider, ScriptedProvider, SlowProvider};

    fn limits() -> Limits {
        Limits {
            max_cost_usd: 100.0,
            max_calls: 100,
        }
    }

    fn arc<P: Provider + 'static>(provider: P) -> Arc<dyn Provider> {
        Arc::new(provider)
    }

    #[test]
    fn all_keeps_query_order_and_partial_results() {
        let mut dispatcher = Dispatcher::new(
            vec![
                arc(ScriptedProvider::always("a", "first")),
                arc(FailingProvider::new("b")),
                arc(ScriptedProvider::always("c", "third")),
            ],
            limits(),
        );
        let result = dispatcher
            .dispatch(&DispatchRequest::new("q", Strategy::All, Duration::from_secs(5)))
            .expect("dispatch");
        assert!(result.ok);
        assert_eq!(result.providers_queried, vec!["a", "b", "c"]);
        let ids: Vec<_> = result.responses.iter().map(|r| r.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(dispatcher.metrics().by_provider["b"].failures, 1);
        assert_eq!(dispatcher.ledger().calls(), 3);
    }

    #[test]
    fn all_abandons_slow_providers_at_deadline() {
        let mut dispatcher = Dispatcher::new(
            vec![
                arc(ScriptedProvider::always("fast", "hi")),
                arc(SlowProvider::new("slow", Duration::from_secs(5), "late")),
            ],
            limits(),
        );
        let started = Instant::now();
        let result = dispatcher
            .dispatch(&DispatchRequest::new(
                "q",
                Strategy::All,
                Duration::from_millis(200),
            ))
            .expect("dispatch");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.ok);
        assert_eq!(result.responses.len(), 1);
        assert_eq!(dispatcher.metrics().timeouts, 1);
    }

    #[test]
    fn everything_failing_is_not_ok() {
        let mut dispatcher = Dispatcher::new(vec![arc(FailingProvider::new("x"))], limits());
        let result = dispatcher
            .dispatch(&DispatchRequest::new("q", Strategy::All, Duration::from_secs(5)))
            .expect("dispatch");
        assert!(!result.ok);
        assert!(result.error.is_some());
        assert_eq!(dispatcher.metrics().failed_dispatches, 1);
    }

    #[test]
    fn sequential_stops_at_first_acceptable_reply() {
        let second = ScriptedProvider::always("b", "```diff\n+fix\n```");
        let third = ScriptedProvider::always("c", "unused");
        let third_calls = third.calls();
        let mut dispatcher = Dispatcher::new(
            vec![
                arc(ScriptedProvider::always("a", "no patch here")),
                arc(second),
                arc(third),
            ],
            limits(),
        );
        let has_diff = |text: &str| text.contains("```diff");
        let request = DispatchRequest::new("q", Strategy::Sequential, Duration::from_secs(5))
            .with_acceptance(&has_diff);
        let result = dispatcher.dispatch(&request).expect("dispatch");
        assert!(result.ok);
        assert_eq!(result.providers_queried, vec!["a", "b"]);
        assert_eq!(result.responses[0].provider_id, "b");
        assert_eq!(result.rounds[0].len(), 2);
        assert_eq!(third_calls.lock().expect("lock").len(), 0);
    }

    #[test]
    fn dialectic_runs_three_rounds() {
        let a = ScriptedProvider::new("a", ["proposal a", "critique a", "synthesis a"]);
        let a_calls = a.calls();
        let b = ScriptedProvider::new("b", ["proposal b", "critique b", "synthesis b"]);
        let mut dispatcher = Dispatcher::new(vec![arc(a), arc(b)], limits());
        let result = dispatcher
            .dispatch(&DispatchRequest::new(
                "fix it",
                Strategy::Dialectic,
                Duration::from_secs(5),
            ))
            .expect("dispatch");
        assert_eq!(result.rounds.len(), 3);
        let texts: Vec<_> = result.responses.iter().map(|r| r.raw_text.as_str()).collect();
        assert_eq!(texts, vec!["synthesis a", "synthesis b"]);

        let prompts = a_calls.lock().expect("lock");
        assert!(prompts[1].contains("proposal b"), "critique sees peer proposal");
        assert!(prompts[2].contains("critique b"));
        assert_eq!(dispatcher.ledger().calls(), 6);
    }

    #[test]
    fn dialectic_falls_back_to_latest_non_empty_round() {
        let a = ScriptedProvider::new("a", ["proposal a"]);
        let mut dispatcher = Dispatcher::new(vec![arc(a)], limits());
        let result = dispatcher
            .dispatch(&DispatchRequest::new(
                "q",
                Strategy::Dialectic,
                Duration::from_secs(5),
            ))
            .expect("dispatch");
        assert!(result.ok);
        assert_eq!(result.responses[0].raw_text, "proposal a");
    }

    #[test]
    fn limit_halts_dispatcher_for_good() {
        let mut dispatcher = Dispatcher::new(
            vec![
                arc(ScriptedProvider::always("a", "x")),
                arc(ScriptedProvider::always("b", "y")),
            ],
            Limits {
                max_cost_usd: 100.0,
                max_calls: 3,
            },
        );
        let request = DispatchRequest::new("q", Strategy::All, Duration::from_secs(5));
        dispatcher.dispatch(&request).expect("first fits");
        let err = dispatcher.dispatch(&request).expect_err("second exceeds");
        assert!(err.downcast_ref::<LimitExceeded>().is_some());
        assert_eq!(dispatcher.ledger().calls(), 2);

        let err = dispatcher.dispatch(&request).expect_err("still halted");
        assert!(err.downcast_ref::<LimitExceeded>().is_some());
    }

    #[test]
    fn cost_uses_configured_price_and_token_estimate() {
        let mut dispatcher =
            Dispatcher::new(vec![arc(ScriptedProvider::always("p", "abcd"))], limits())
                .with_price("p", Price::new(1.0, 2.0));
        let result = dispatcher
            .dispatch(&DispatchRequest::new("12345678", Strategy::All, Duration::from_secs(5)))
            .expect("dispatch");
        let response = &result.responses[0];
        assert_eq!(response.token_count, 3);
        assert!((response.cost - (0.002 + 0.002)).abs() < 1e-12);
        assert!((dispatcher.ledger().spent_usd() - response.cost).abs() < 1e-12);
    }

    #[test]
    fn allowlist_filters_and_rejects_unknown_ids() {
        let mut dispatcher = Dispatcher::new(
            vec![
                arc(ScriptedProvider::always("a", "x")),
                arc(ScriptedProvider::always("b", "y")),
            ],
            limits(),
        );
        let request = DispatchRequest::new("q", Strategy::All, Duration::from_secs(5))
            .with_providers(vec!["b".to_string()]);
        let result = dispatcher.dispatch(&request).expect("dispatch");
        assert_eq!(result.providers_queried, vec!["b"]);

        let request = DispatchRequest::new("q", Strategy::All, Duration::from_secs(5))
            .with_providers(vec!["zzz".to_string()]);
        assert!(dispatcher.dispatch(&request).is_err());
    }
}
