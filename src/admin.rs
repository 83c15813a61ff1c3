// 🛠️ Administration - recipient directory, inventory upkeep, overrides
//
// Thin operations around the allocation core. Overrides (reset_claim,
// release_card) sit outside the claim path and are always audited.

use crate::credentials::CredentialVerifier;
use crate::db::{
    card_from_row, insert_event, recipient_from_row, Card, Event, Recipient, CARD_COLUMNS,
    RECIPIENT_COLUMNS,
};
use crate::decompose::Denominations;
use anyhow::{bail, ensure, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MAX_PAGE_SIZE: u32 = 100;

// ============================================================================
// RECIPIENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecipient {
    pub identity: String,
    pub nickname: String,
    pub secret: String,
    pub target: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
}

/// Create a recipient, or refresh nickname/secret/target of an existing one.
/// Claimed state is never touched. Returns true when a row was created.
pub fn upsert_recipient(
    conn: &Connection,
    verifier: &dyn CredentialVerifier,
    recipient: &NewRecipient,
) -> Result<bool> {
    let identity = recipient.identity.trim();
    ensure!(!identity.is_empty(), "identity must not be empty");
    ensure!(
        recipient.target >= 0,
        "target for {} must not be negative, got {}",
        identity,
        recipient.target
    );

    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM recipients WHERE identity = ?1)",
        [identity],
        |row| row.get(0),
    )?;

    let secret = verifier.encode(recipient.secret.trim());

    if exists {
        conn.execute(
            "UPDATE recipients SET nickname = ?2, secret = ?3, target = ?4 WHERE identity = ?1",
            params![identity, recipient.nickname.trim(), secret, recipient.target],
        )?;
    } else {
        conn.execute(
            "INSERT INTO recipients (identity, nickname, secret, target) VALUES (?1, ?2, ?3, ?4)",
            params![identity, recipient.nickname.trim(), secret, recipient.target],
        )?;
    }

    Ok(!exists)
}

/// Upsert a batch in one transaction; a bad row aborts the whole batch
pub fn import_recipients(
    conn: &mut Connection,
    verifier: &dyn CredentialVerifier,
    recipients: &[NewRecipient],
) -> Result<ImportSummary> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut summary = ImportSummary::default();

    for recipient in recipients {
        if upsert_recipient(&tx, verifier, recipient)? {
            summary.created += 1;
        } else {
            summary.updated += 1;
        }
    }

    tx.commit()?;
    tracing::info!(created = summary.created, updated = summary.updated, "recipients imported");
    Ok(summary)
}

/// CSV with headers `identity,nickname,secret,target`
pub fn import_recipients_csv(
    conn: &mut Connection,
    verifier: &dyn CredentialVerifier,
    csv_path: &Path,
) -> Result<ImportSummary> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .context("Failed to open CSV file")?;

    let mut recipients = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let recipient: NewRecipient =
            result.with_context(|| format!("Failed to deserialize recipient on row {}", line + 1))?;
        recipients.push(recipient);
    }

    import_recipients(conn, verifier, &recipients)
}

pub fn delete_recipient(conn: &Connection, identity: &str) -> Result<bool> {
    let removed = conn.execute("DELETE FROM recipients WHERE identity = ?1", [identity])?;
    Ok(removed == 1)
}

/// Administrative override: allow a recipient to claim again.
/// Cards handed out earlier stay with their owner.
pub fn reset_claim(conn: &mut Connection, identity: &str) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let changed = tx.execute(
        "UPDATE recipients SET has_claimed = 0, claimed_at = NULL
         WHERE identity = ?1 AND has_claimed = 1",
        [identity],
    )?;

    if changed == 1 {
        insert_event(
            &tx,
            &Event::new("claim_reset", "recipient", identity, serde_json::json!({}), "admin"),
        )?;
    }

    tx.commit()?;
    Ok(changed == 1)
}

// ============================================================================
// CARDS
// ============================================================================

/// Add one code per non-blank line. Codes already in inventory are skipped.
/// Returns the number of cards inserted.
pub fn add_cards(
    conn: &mut Connection,
    denominations: &Denominations,
    content: &str,
    denomination: u32,
) -> Result<usize> {
    if !denominations.contains(denomination) {
        bail!(
            "denomination {} is not one of {:?}",
            denomination,
            denominations.values()
        );
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut inserted = 0;
    let mut skipped = 0;

    {
        let mut stmt =
            tx.prepare("INSERT OR IGNORE INTO cards (code, denomination) VALUES (?1, ?2)")?;
        for code in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if stmt.execute(params![code, denomination])? == 1 {
                inserted += 1;
            } else {
                skipped += 1;
            }
        }
    }

    if inserted > 0 {
        insert_event(
            &tx,
            &Event::new(
                "cards_added",
                "inventory",
                &denomination.to_string(),
                serde_json::json!({ "inserted": inserted, "skipped": skipped }),
                "admin",
            ),
        )?;
    }

    tx.commit()?;
    tracing::info!(denomination, inserted, skipped, "cards added");
    Ok(inserted)
}

pub fn delete_card(conn: &Connection, code: &str) -> Result<bool> {
    let removed = conn.execute("DELETE FROM cards WHERE code = ?1", [code])?;
    Ok(removed == 1)
}

/// Administrative override: return a used card to inventory
pub fn release_card(conn: &mut Connection, code: &str) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let previous_owner: Option<Option<String>> = tx
        .query_row(
            "SELECT used_by FROM cards WHERE code = ?1 AND is_used = 1",
            [code],
            |row| row.get(0),
        )
        .optional()?;

    let Some(previous_owner) = previous_owner else {
        return Ok(false);
    };

    tx.execute(
        "UPDATE cards SET is_used = 0, used_by = NULL, used_at = NULL WHERE code = ?1",
        [code],
    )?;
    insert_event(
        &tx,
        &Event::new(
            "card_released",
            "card",
            code,
            serde_json::json!({ "previous_owner": previous_owner }),
            "admin",
        ),
    )?;

    tx.commit()?;
    Ok(true)
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub denomination: u32,
    pub available: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub stock: Vec<StockLevel>,
    pub recipients_total: i64,
    pub recipients_claimed: i64,
}

/// Unused card count for every configured denomination
pub fn stock_by_denomination(conn: &Connection, denominations: &Denominations) -> Result<Vec<StockLevel>> {
    let mut stmt =
        conn.prepare("SELECT COUNT(*) FROM cards WHERE denomination = ?1 AND is_used = 0")?;

    denominations
        .values()
        .iter()
        .map(|&denomination| -> Result<StockLevel> {
            let available: i64 = stmt.query_row([denomination], |row| row.get(0))?;
            Ok(StockLevel {
                denomination,
                available,
            })
        })
        .collect()
}

pub fn stats(conn: &Connection, denominations: &Denominations) -> Result<Stats> {
    let stock = stock_by_denomination(conn, denominations)?;
    let (recipients_total, recipients_claimed): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(has_claimed), 0) FROM recipients",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(Stats {
        stock,
        recipients_total,
        recipients_claimed,
    })
}

// ============================================================================
// LISTINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub fn new(page: u32, page_size: u32) -> Result<Self> {
        ensure!(page >= 1, "page must be at least 1");
        ensure!(
            (1..=MAX_PAGE_SIZE).contains(&page_size),
            "page_size must be between 1 and {}",
            MAX_PAGE_SIZE
        );
        Ok(Page { page, page_size })
    }

    fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Page {
            page: 1,
            page_size: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardFilter {
    pub denomination: Option<u32>,
    pub used: Option<bool>,
}

pub fn list_recipients(conn: &Connection, page: Page) -> Result<Listing<Recipient>> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM recipients", [], |row| row.get(0))?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM recipients ORDER BY id LIMIT ?1 OFFSET ?2",
        RECIPIENT_COLUMNS
    ))?;
    let items = stmt
        .query_map(params![page.page_size, page.offset()], recipient_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Listing {
        items,
        total,
        page: page.page,
        page_size: page.page_size,
    })
}

pub fn list_cards(conn: &Connection, page: Page, filter: CardFilter) -> Result<Listing<Card>> {
    const WHERE: &str = "WHERE (?1 IS NULL OR denomination = ?1) AND (?2 IS NULL OR is_used = ?2)";

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM cards {}", WHERE),
        params![filter.denomination, filter.used],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM cards {} ORDER BY id LIMIT ?3 OFFSET ?4",
        CARD_COLUMNS, WHERE
    ))?;
    let items = stmt
        .query_map(
            params![filter.denomination, filter.used, page.page_size, page.offset()],
            card_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Listing {
        items,
        total,
        page: page.page,
        page_size: page.page_size,
    })
}
