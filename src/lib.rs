// Card Dispenser - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod decompose;   // Decomposer: target → denomination counts
pub mod store;       // Persistence seams used by the core
pub mod db;          // SQLite schema, records, unit of work, audit events
pub mod allocator;   // All-or-nothing card reservation
pub mod claim;       // Claim orchestrator
pub mod credentials;
pub mod admin;       // Directory and inventory upkeep
pub mod config;
pub mod logging;

// Re-export commonly used types
pub use error::{AllocationError, DecomposeError, DenominationError, StoreError};
pub use decompose::{decompose, Combination, Denominations, DEFAULT_DENOMINATIONS, MAX_DENOMINATION};
pub use store::{CardStore, RecipientStore};
pub use db::{
    Card, Event, Recipient, UnitOfWork,
    open_database, setup_database, insert_event, events_for_entity,
};
pub use allocator::{allocate, allocate_committed, Allocation, RetryPolicy};
pub use claim::{ClaimOutcome, ClaimService};
pub use credentials::{CredentialScheme, CredentialVerifier, PlainText, Sha256Digest};
pub use admin::{
    CardFilter, ImportSummary, Listing, NewRecipient, Page, Stats, StockLevel,
};
pub use config::Settings;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Claim service wired from settings
pub fn claim_service(settings: &Settings) -> ClaimService {
    ClaimService::new(
        settings.allocation.denominations.clone(),
        settings.credentials.scheme.verifier(),
        settings.allocation.retry,
    )
}
