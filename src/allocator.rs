// 🎟️ Allocator - reserve unused cards for a combination, all or nothing
//
// Two phases inside the caller's unit of work:
// 1. select enough unused cards for every denomination (no writes)
// 2. mark each selected card used by the claimant
// Phase 2 only starts once phase 1 has covered every denomination, and any
// error leaves the unit of work uncommitted, so a failure never mutates a card.

use crate::db::{Card, UnitOfWork};
use crate::decompose::Combination;
use crate::error::AllocationError;
use crate::store::CardStore;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Cards reserved for one claimant, largest denomination first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub claimant: String,
    pub cards: Vec<Card>,
}

impl Allocation {
    pub fn codes(&self) -> Vec<String> {
        self.cards.iter().map(|card| card.code.clone()).collect()
    }

    pub fn total_value(&self) -> u64 {
        self.cards.iter().map(|card| u64::from(card.denomination)).sum()
    }
}

/// How often a conflicting reservation is attempted before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3 }
    }
}

/// Reserve every card `combination` asks for, inside the caller's transaction.
///
/// On error nothing has been committed; the caller must drop (roll back) its
/// unit of work.
pub fn allocate<S: CardStore>(
    store: &S,
    combination: &Combination,
    claimant: &str,
    at: DateTime<Utc>,
) -> Result<Allocation, AllocationError> {
    let mut selected: Vec<Card> = Vec::new();

    for (denomination, requested) in combination.required() {
        let cards = store.reserve_unused(denomination, requested)?;
        let available = cards.len() as u64;

        if available < requested {
            tracing::warn!(denomination, requested, available, "insufficient stock");
            return Err(AllocationError::InsufficientStock {
                denomination,
                requested,
                available,
            });
        }

        tracing::debug!(denomination, requested, "stock reserved");
        selected.extend(cards);
    }

    for card in &mut selected {
        if !store.mark_used(&card.code, claimant, at)? {
            return Err(AllocationError::Conflict {
                code: card.code.clone(),
            });
        }
        card.is_used = true;
        card.used_by = Some(claimant.to_string());
        card.used_at = Some(at);
    }

    Ok(Allocation {
        claimant: claimant.to_string(),
        cards: selected,
    })
}

/// Standalone allocation in its own unit of work, committed on success.
///
/// Conflicts and lock timeouts are retried per `policy`; the last error is
/// returned once attempts run out.
pub fn allocate_committed(
    conn: &mut Connection,
    combination: &Combination,
    claimant: &str,
    policy: RetryPolicy,
) -> Result<Allocation, AllocationError> {
    let mut attempt = 1;
    loop {
        match allocate_once(conn, combination, claimant) {
            Err(err) if err.is_retryable() && attempt < policy.attempts() => {
                tracing::warn!(claimant, attempt, error = %err, "allocation conflict, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn allocate_once(
    conn: &mut Connection,
    combination: &Combination,
    claimant: &str,
) -> Result<Allocation, AllocationError> {
    let uow = UnitOfWork::begin(conn)?;
    let allocation = allocate(&uow, combination, claimant, uow.timestamp())?;
    uow.commit()?;

    tracing::info!(
        claimant,
        cards = allocation.cards.len(),
        value = allocation.total_value(),
        "cards allocated"
    );
    Ok(allocation)
}
