// 🗃️ Store Traits - what the allocation core needs from persistence
// Implemented by db::UnitOfWork; all calls happen inside one transaction.

use crate::db::{Card, Recipient};
use crate::error::StoreError;
use chrono::{DateTime, Utc};

pub trait RecipientStore {
    fn find_by_identity(&self, identity: &str) -> Result<Option<Recipient>, StoreError>;

    /// Flip the claimed flag false → true. Returns false if the recipient was
    /// missing or already claimed.
    fn mark_claimed(&self, identity: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;
}

pub trait CardStore {
    /// Up to `count` unused cards of `denomination`. Fewer are returned when
    /// stock is short; nothing is modified.
    fn reserve_unused(&self, denomination: u32, count: u64) -> Result<Vec<Card>, StoreError>;

    /// Mark one unused card as used by `owner`. Returns false if the card is
    /// unknown or already used.
    fn mark_used(&self, code: &str, owner: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;
}
