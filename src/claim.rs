// 🧾 Claim Orchestrator - one request, one unit of work
//
// lookup → verify secret → reject duplicates → decompose → allocate → mark claimed
//
// Every step runs inside the same IMMEDIATE transaction, so the duplicate
// check and the card reservation see one consistent state and the recipient's
// claimed flag commits together with its cards.

use crate::allocator::{allocate, RetryPolicy};
use crate::credentials::CredentialVerifier;
use crate::db::{Event, UnitOfWork};
use crate::decompose::{decompose, Denominations};
use crate::error::{AllocationError, StoreError};
use crate::store::RecipientStore;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Success {
        nickname: String,
        target: i64,
        codes: Vec<String>,
    },
    NotFound,
    SecretMismatch,
    AlreadyClaimed {
        nickname: String,
        target: i64,
    },
    UnsolvableTarget {
        target: i64,
    },
    InsufficientStock {
        nickname: String,
        target: i64,
    },
    InternalError,
}

impl ClaimOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ClaimOutcome::Success { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            ClaimOutcome::Success { .. } => "success",
            ClaimOutcome::NotFound => "not_found",
            ClaimOutcome::SecretMismatch => "secret_mismatch",
            ClaimOutcome::AlreadyClaimed { .. } => "already_claimed",
            ClaimOutcome::UnsolvableTarget { .. } => "unsolvable_target",
            ClaimOutcome::InsufficientStock { .. } => "insufficient_stock",
            ClaimOutcome::InternalError => "internal_error",
        }
    }

    /// User-facing message, one fixed text per outcome
    pub fn message(&self) -> &'static str {
        match self {
            ClaimOutcome::Success { .. } => "Claim successful! Thank you for your support!",
            ClaimOutcome::NotFound => {
                "Claim failed: no recipient with this identity, please check your input."
            }
            ClaimOutcome::SecretMismatch => "Claim failed: the secret is incorrect, please try again.",
            ClaimOutcome::AlreadyClaimed { .. } => {
                "You have already claimed your cards; claims cannot be repeated."
            }
            ClaimOutcome::UnsolvableTarget { .. } => {
                "System error: no card combination exists for this amount, please contact the administrator."
            }
            ClaimOutcome::InsufficientStock { .. } => {
                "Sorry, current stock cannot cover your amount. Please ask the administrator to restock."
            }
            ClaimOutcome::InternalError => {
                "An error occurred while claiming, please retry or contact the administrator."
            }
        }
    }

    pub fn nickname(&self) -> Option<&str> {
        match self {
            ClaimOutcome::Success { nickname, .. }
            | ClaimOutcome::AlreadyClaimed { nickname, .. }
            | ClaimOutcome::InsufficientStock { nickname, .. } => Some(nickname),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<i64> {
        match self {
            ClaimOutcome::Success { target, .. }
            | ClaimOutcome::AlreadyClaimed { target, .. }
            | ClaimOutcome::UnsolvableTarget { target }
            | ClaimOutcome::InsufficientStock { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn codes(&self) -> &[String] {
        match self {
            ClaimOutcome::Success { codes, .. } => codes,
            _ => &[],
        }
    }
}

#[derive(Error, Debug)]
enum ClaimError {
    #[error("recipient {0} was claimed concurrently")]
    ClaimedConcurrently(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClaimError {
    fn is_retryable(&self) -> bool {
        match self {
            ClaimError::ClaimedConcurrently(_) => true,
            ClaimError::Allocation(e) => e.is_retryable(),
            ClaimError::Store(e) => e.is_busy(),
        }
    }
}

// ============================================================================
// CLAIM SERVICE
// ============================================================================

pub struct ClaimService {
    denominations: Denominations,
    verifier: Arc<dyn CredentialVerifier>,
    retry: RetryPolicy,
}

impl ClaimService {
    pub fn new(
        denominations: Denominations,
        verifier: Arc<dyn CredentialVerifier>,
        retry: RetryPolicy,
    ) -> Self {
        ClaimService {
            denominations,
            verifier,
            retry,
        }
    }

    pub fn denominations(&self) -> &Denominations {
        &self.denominations
    }

    /// Run one claim to a terminal outcome. Never errors: persistence
    /// failures are logged and reported as `InternalError`.
    pub fn claim(&self, conn: &mut Connection, identity: &str, secret: &str) -> ClaimOutcome {
        let mut attempt = 1;
        loop {
            match self.try_claim(conn, identity, secret) {
                Ok(outcome) => {
                    if outcome.is_success() {
                        tracing::info!(
                            identity,
                            target = ?outcome.target(),
                            cards = outcome.codes().len(),
                            "claim completed"
                        );
                    } else {
                        tracing::warn!(identity, status = outcome.status(), "claim rejected");
                    }
                    return outcome;
                }
                Err(err) if err.is_retryable() && attempt < self.retry.attempts() => {
                    tracing::warn!(identity, attempt, error = %err, "claim conflict, retrying");
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(identity, attempt, error = %err, "claim failed");
                    return ClaimOutcome::InternalError;
                }
            }
        }
    }

    fn try_claim(
        &self,
        conn: &mut Connection,
        identity: &str,
        secret: &str,
    ) -> Result<ClaimOutcome, ClaimError> {
        // Early returns drop the unit of work, which rolls it back
        let uow = UnitOfWork::begin(conn)?;

        let Some(recipient) = uow.find_by_identity(identity)? else {
            return Ok(ClaimOutcome::NotFound);
        };

        if !self.verifier.verify(secret, &recipient.secret) {
            return Ok(ClaimOutcome::SecretMismatch);
        }

        if recipient.has_claimed {
            return Ok(ClaimOutcome::AlreadyClaimed {
                nickname: recipient.nickname,
                target: recipient.target,
            });
        }

        let combination = match decompose(recipient.target, &self.denominations) {
            Ok(combination) => combination,
            Err(err) => {
                tracing::warn!(identity, error = %err, "target cannot be decomposed");
                return Ok(ClaimOutcome::UnsolvableTarget {
                    target: recipient.target,
                });
            }
        };

        let at = uow.timestamp();
        let allocation = match allocate(&uow, &combination, &recipient.identity, at) {
            Ok(allocation) => allocation,
            Err(AllocationError::InsufficientStock { .. }) => {
                return Ok(ClaimOutcome::InsufficientStock {
                    nickname: recipient.nickname,
                    target: recipient.target,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if !uow.mark_claimed(&recipient.identity, at)? {
            return Err(ClaimError::ClaimedConcurrently(recipient.identity));
        }

        let codes = allocation.codes();
        uow.record_event(
            &Event::new(
                "claim_completed",
                "recipient",
                &recipient.identity,
                serde_json::json!({
                    "target": recipient.target,
                    "combination": combination.parts(),
                    "codes": codes,
                }),
                "claim_service",
            )
            .at(at),
        )?;

        uow.commit()?;

        Ok(ClaimOutcome::Success {
            nickname: recipient.nickname,
            target: recipient.target,
            codes,
        })
    }
}
