//! Turns settled service results into updates the sandbox applies.

use shared::protocol::{Action, Card, Suggestion};

use crate::{dispatcher::ServiceResult, registry::SystemActionPolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileCommand {
    ShowCards {
        service_url: String,
        cards: Vec<Card>,
    },
    ApplySystemActions {
        service_url: String,
        actions: Vec<Action>,
    },
    ShowMessage {
        service_url: String,
        message: String,
    },
    /// Drops the cards and messages a service returned earlier.
    Withdraw { service_url: String },
}

/// Commands for every current result. A failed call withdraws whatever the
/// service showed before; stale results contribute nothing.
///
/// `ShowCards` replaces the service's cards and messages, so the
/// `ShowMessage` commands that follow it are the service's only messages.
pub fn reconcile(policy: SystemActionPolicy, results: &[ServiceResult]) -> Vec<ReconcileCommand> {
    let mut commands = Vec::new();
    for result in results.iter().filter(|result| result.is_current()) {
        let Some(response) = &result.response else {
            commands.push(ReconcileCommand::Withdraw {
                service_url: result.service_url.clone(),
            });
            continue;
        };
        commands.push(ReconcileCommand::ShowCards {
            service_url: result.service_url.clone(),
            cards: response.cards.clone(),
        });
        if policy == SystemActionPolicy::Apply && !response.system_actions.is_empty() {
            commands.push(ReconcileCommand::ApplySystemActions {
                service_url: result.service_url.clone(),
                actions: response.system_actions.clone(),
            });
        }
        commands.extend(response.messages.iter().map(|message| ReconcileCommand::ShowMessage {
            service_url: result.service_url.clone(),
            message: message.clone(),
        }));
    }
    commands
}

/// Cards currently on display, grouped by the service that returned them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardDeck {
    decks: Vec<(String, Vec<Card>)>,
}

impl CardDeck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, service_url: &str, cards: Vec<Card>) {
        match self.decks.iter_mut().find(|(url, _)| url == service_url) {
            Some((_, existing)) => *existing = cards,
            None => self.decks.push((service_url.to_string(), cards)),
        }
    }

    pub fn remove(&mut self, service_url: &str) {
        self.decks.retain(|(url, _)| url != service_url);
    }

    pub fn all_cards(&self) -> Vec<Card> {
        self.decks
            .iter()
            .flat_map(|(_, cards)| cards.iter().cloned())
            .collect()
    }

    pub fn find_suggestion(&self, uuid: &str) -> Option<&Suggestion> {
        self.decks
            .iter()
            .flat_map(|(_, cards)| cards.iter())
            .flat_map(|card| card.suggestions.iter())
            .find(|suggestion| suggestion.uuid.as_deref() == Some(uuid))
    }

    pub fn is_empty(&self) -> bool {
        self.decks.iter().all(|(_, cards)| cards.is_empty())
    }

    pub fn clear(&mut self) {
        self.decks.clear();
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
