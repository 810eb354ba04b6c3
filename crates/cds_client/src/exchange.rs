//! Recorded request/response pairs, one per service URL.
//!
//! Every call against a URL is issued a sequence number first. A settled
//! call may only write its exchange if its number is still the latest one
//! issued for that URL, so a slow response cannot clobber a newer resend.

use std::collections::HashMap;

use serde::Serialize;
use shared::{domain::HookId, protocol::ExchangeBody};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExchange {
    pub service_url: String,
    pub request: ExchangeBody,
    pub response: ExchangeBody,
    pub status: u16,
    pub error_count: u32,
    #[serde(skip)]
    pub seq: u64,
}

/// How one call ended, before it is folded into the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Success { status: u16, body: ExchangeBody },
    /// 2xx answer whose body is not a usable service response.
    Malformed { status: u16, body: ExchangeBody },
    Failure { status: u16, body: ExchangeBody },
}

impl CallOutcome {
    pub fn status(&self) -> u16 {
        match self {
            Self::Success { status, .. }
            | Self::Malformed { status, .. }
            | Self::Failure { status, .. } => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum HookPhase {
    Idle,
    Dispatching { pending: usize },
    PartialResults { settled: usize, pending: usize },
    AllResults { settled: usize },
}

#[derive(Debug, Default)]
struct ExchangeSlot {
    latest_seq: u64,
    error_count: u32,
    exchange: Option<ServiceExchange>,
}

#[derive(Debug, Default)]
pub struct ExchangeStore {
    slots: HashMap<String, ExchangeSlot>,
    phases: HashMap<HookId, HookPhase>,
    selected_service: Option<String>,
}

impl ExchangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, service_url: &str) -> u64 {
        let slot = self.slots.entry(service_url.to_string()).or_default();
        slot.latest_seq += 1;
        slot.latest_seq
    }

    pub fn is_current(&self, service_url: &str, seq: u64) -> bool {
        self.slots
            .get(service_url)
            .is_some_and(|slot| slot.latest_seq == seq)
    }

    /// Writes the exchange for `service_url` unless `seq` has been
    /// superseded. Returns the stored exchange.
    pub fn record(
        &mut self,
        service_url: &str,
        seq: u64,
        request: ExchangeBody,
        outcome: CallOutcome,
    ) -> Option<ServiceExchange> {
        if !self.is_current(service_url, seq) {
            debug!(service_url, seq, "exchange: dropping stale result");
            return None;
        }
        let slot = self.slots.get_mut(service_url)?;

        let (status, response) = match outcome {
            CallOutcome::Success { status, body } => {
                slot.error_count = 0;
                (status, body)
            }
            CallOutcome::Malformed { status, body } | CallOutcome::Failure { status, body } => {
                slot.error_count += 1;
                (status, body)
            }
        };

        let exchange = ServiceExchange {
            service_url: service_url.to_string(),
            request,
            response,
            status,
            error_count: slot.error_count,
            seq,
        };
        slot.exchange = Some(exchange.clone());
        Some(exchange)
    }

    pub fn get(&self, service_url: &str) -> Option<&ServiceExchange> {
        self.slots
            .get(service_url)
            .and_then(|slot| slot.exchange.as_ref())
    }

    pub fn exchanges(&self) -> Vec<ServiceExchange> {
        let mut exchanges = self
            .slots
            .values()
            .filter_map(|slot| slot.exchange.clone())
            .collect::<Vec<_>>();
        exchanges.sort_by(|a, b| a.service_url.cmp(&b.service_url));
        exchanges
    }

    pub fn len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.exchange.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops recorded exchanges and the selection. Sequence numbers survive
    /// so that calls still in flight stay stale.
    pub fn clear(&mut self) {
        for slot in self.slots.values_mut() {
            slot.exchange = None;
            slot.error_count = 0;
        }
        self.selected_service = None;
    }

    pub fn select_service(&mut self, service_url: impl Into<String>) {
        self.selected_service = Some(service_url.into());
    }

    /// The explicitly selected service if it is still configured, else the
    /// first configured one.
    pub fn service_in_context<'a>(&'a self, configured: &[&'a str]) -> Option<&'a str> {
        self.selected_service
            .as_deref()
            .filter(|selected| configured.contains(selected))
            .or_else(|| configured.first().copied())
    }

    pub fn phase(&self, hook_id: &HookId) -> HookPhase {
        self.phases.get(hook_id).copied().unwrap_or(HookPhase::Idle)
    }

    pub fn begin_dispatch(&mut self, hook_id: &HookId, calls: usize) -> HookPhase {
        let phase = if calls == 0 {
            HookPhase::AllResults { settled: 0 }
        } else {
            HookPhase::Dispatching { pending: calls }
        };
        self.phases.insert(hook_id.clone(), phase);
        phase
    }

    pub fn settle(&mut self, hook_id: &HookId) -> HookPhase {
        let next = match self.phase(hook_id) {
            HookPhase::Dispatching { pending } => (0, pending),
            HookPhase::PartialResults { settled, pending } => (settled, pending),
            other => return other,
        };
        let (settled, pending) = (next.0 + 1, next.1.saturating_sub(1));
        let phase = if pending == 0 {
            HookPhase::AllResults { settled }
        } else {
            HookPhase::PartialResults { settled, pending }
        };
        self.phases.insert(hook_id.clone(), phase);
        phase
    }

    pub fn finish_dispatch(&mut self, hook_id: &HookId) -> HookPhase {
        self.phases.insert(hook_id.clone(), HookPhase::Idle);
        HookPhase::Idle
    }
}

#[cfg(test)]
#[path = "tests/exchange_tests.rs"]
mod tests;
