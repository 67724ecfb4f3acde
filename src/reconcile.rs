//! Transactional reconciliation of stash snapshots against the listings
//! table.
//!
//! The contract: after a successful apply, the stored listings for every
//! stash in the batch equal the target items of that stash's snapshot, with
//! `last_change_id` stamped from the change event that produced it. The diff
//! itself is a pure function over the batch and the currently stored rows,
//! so it can be tested without a database.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::stash_stream::{JewelEntry, StashSnapshot};
use crate::store::JewelRow;

const COMMIT_ATTEMPTS: u32 = 5;
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// The minimum set of statements that brings the listings table in line
/// with a batch of snapshots.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub updates: Vec<ListingUpdate>,
    pub deletes: Vec<i64>,
    pub upserts: Vec<ListingUpsert>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletes.is_empty() && self.upserts.is_empty()
    }
}

/// Refresh of an existing row whose price or owning stash changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingUpdate {
    pub row_id: i64,
    pub stash_id: String,
    pub amount: f64,
    pub currency: String,
    pub change_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// A listing seen in a snapshot that has no stored row for its stash yet.
/// Applied with an upsert keyed on `item_id`, so an item that moved from an
/// unseen stash keeps its row.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingUpsert {
    pub jewel_type: &'static str,
    pub jewel_class: String,
    pub allocated_node: String,
    pub item_id: String,
    pub stash_id: String,
    pub league: String,
    pub amount: f64,
    pub currency: String,
    pub change_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// Diff a snapshot batch against the rows currently stored for its stashes.
///
/// Every loaded row must belong to a stash in the batch; anything else means
/// the load query and the batch index disagree and the transaction must not
/// proceed.
pub fn plan(batch: &[StashSnapshot], existing: &[JewelRow]) -> Result<ReconcilePlan, PipelineError> {
    let mut stash_by_id: HashMap<&str, &StashSnapshot> = HashMap::new();
    let mut jewel_by_id: HashMap<&str, (&StashSnapshot, &JewelEntry)> = HashMap::new();
    for snapshot in batch {
        stash_by_id.insert(snapshot.stash_id.as_str(), snapshot);
        for item in &snapshot.items {
            jewel_by_id.insert(item.item_id.as_str(), (snapshot, item));
        }
    }

    let mut checked: HashSet<&str> = HashSet::new();
    let mut plan = ReconcilePlan::default();

    for row in existing {
        if let Some((snapshot, item)) = jewel_by_id.get(row.item_id.as_str()) {
            if item.price.amount != row.list_price_amount
                || item.price.currency != row.list_price_currency
                || snapshot.stash_id != row.stash_id
            {
                debug!(
                    "price changed for item {} ({} {} -> {} {})",
                    row.item_id,
                    row.list_price_amount,
                    row.list_price_currency,
                    item.price.amount,
                    item.price.currency
                );
                plan.updates.push(ListingUpdate {
                    row_id: row.id,
                    stash_id: snapshot.stash_id.clone(),
                    amount: item.price.amount,
                    currency: item.price.currency.clone(),
                    change_id: snapshot.change_id.clone(),
                    recorded_at: snapshot.recorded_at,
                });
            }
            checked.insert(row.item_id.as_str());
        } else if stash_by_id.contains_key(row.stash_id.as_str()) {
            debug!("item {} has been delisted, deleting entry", row.item_id);
            plan.deletes.push(row.id);
        } else {
            return Err(PipelineError::InvariantViolation(format!(
                "loaded a listing outside the batch (item_id={}, stash_id={})",
                row.item_id, row.stash_id
            )));
        }
    }

    for snapshot in batch {
        for item in &snapshot.items {
            if checked.contains(item.item_id.as_str()) {
                continue;
            }
            debug!(
                "adding new item {} at price {} {}",
                item.item_id, item.price.amount, item.price.currency
            );
            plan.upserts.push(ListingUpsert {
                jewel_type: item.jewel_type.as_str(),
                jewel_class: item.class.clone(),
                allocated_node: item.node.clone(),
                item_id: item.item_id.clone(),
                stash_id: snapshot.stash_id.clone(),
                league: snapshot.league.clone(),
                amount: item.price.amount,
                currency: item.price.currency.clone(),
                change_id: snapshot.change_id.clone(),
                recorded_at: snapshot.recorded_at,
            });
        }
    }

    Ok(plan)
}

/// Apply a snapshot batch inside a single transaction. A failed commit is
/// retried with the whole transaction redone from the load; any other store
/// error is fatal.
pub async fn apply(pool: &PgPool, batch: &[StashSnapshot]) -> Result<(), PipelineError> {
    let stash_ids: Vec<String> = batch.iter().map(|s| s.stash_id.clone()).collect();

    let mut attempt = 0;
    loop {
        attempt += 1;

        let mut tx = pool.begin().await?;

        let existing: Vec<JewelRow> = sqlx::query_as(
            "SELECT id, jewel_type, jewel_class, allocated_node, item_id, stash_id, league, \
             list_price_amount, list_price_currency, last_change_id, recorded_at \
             FROM jewels WHERE stash_id = ANY($1)",
        )
        .bind(&stash_ids)
        .fetch_all(&mut *tx)
        .await?;

        let plan = plan(batch, &existing)?;
        debug!(
            "reconcile plan: {} updates, {} deletes, {} upserts",
            plan.updates.len(),
            plan.deletes.len(),
            plan.upserts.len()
        );

        for update in &plan.updates {
            sqlx::query(
                "UPDATE jewels \
                 SET stash_id = $1, list_price_amount = $2, list_price_currency = $3, \
                     last_change_id = $4, recorded_at = $5 \
                 WHERE id = $6",
            )
            .bind(&update.stash_id)
            .bind(update.amount)
            .bind(&update.currency)
            .bind(&update.change_id)
            .bind(update.recorded_at)
            .bind(update.row_id)
            .execute(&mut *tx)
            .await?;
        }

        for row_id in &plan.deletes {
            sqlx::query("DELETE FROM jewels WHERE id = $1")
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
        }

        for upsert in &plan.upserts {
            sqlx::query(
                "INSERT INTO jewels \
                 (jewel_type, jewel_class, allocated_node, item_id, stash_id, league, \
                  list_price_amount, list_price_currency, last_change_id, recorded_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (item_id) DO UPDATE SET \
                     stash_id = EXCLUDED.stash_id, \
                     list_price_amount = EXCLUDED.list_price_amount, \
                     list_price_currency = EXCLUDED.list_price_currency, \
                     last_change_id = EXCLUDED.last_change_id, \
                     recorded_at = EXCLUDED.recorded_at",
            )
            .bind(upsert.jewel_type)
            .bind(&upsert.jewel_class)
            .bind(&upsert.allocated_node)
            .bind(&upsert.item_id)
            .bind(&upsert.stash_id)
            .bind(&upsert.league)
            .bind(upsert.amount)
            .bind(&upsert.currency)
            .bind(&upsert.change_id)
            .bind(upsert.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        match tx.commit().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < COMMIT_ATTEMPTS => {
                warn!("commit failed (attempt {attempt}/{COMMIT_ATTEMPTS}), retrying: {e}");
                sleep(COMMIT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::Price;
    use crate::stash_stream::JewelType;

    fn entry(item_id: &str, amount: f64, currency: &str) -> JewelEntry {
        JewelEntry {
            item_id: item_id.to_string(),
            jewel_type: JewelType::ForbiddenFlame,
            class: "Witch".to_string(),
            node: "Inner Conviction".to_string(),
            price: Price {
                amount,
                currency: currency.to_string(),
            },
        }
    }

    fn snapshot(stash_id: &str, change_id: &str, items: Vec<JewelEntry>) -> StashSnapshot {
        StashSnapshot {
            stash_id: stash_id.to_string(),
            league: "Settlers".to_string(),
            items,
            change_id: change_id.to_string(),
            recorded_at: Utc::now(),
        }
    }

    fn row(id: i64, item_id: &str, stash_id: &str, amount: f64, currency: &str) -> JewelRow {
        JewelRow {
            id,
            jewel_type: "Forbidden Flame".to_string(),
            jewel_class: "Witch".to_string(),
            allocated_node: "Inner Conviction".to_string(),
            item_id: item_id.to_string(),
            stash_id: stash_id.to_string(),
            league: "Settlers".to_string(),
            list_price_amount: amount,
            list_price_currency: currency.to_string(),
            last_change_id: "0-0".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_price_change_updates_and_new_item_inserts() {
        let batch = vec![snapshot(
            "S",
            "5-5",
            vec![entry("A", 6.0, "chaos"), entry("B", 10.0, "chaos")],
        )];
        let existing = vec![row(1, "A", "S", 5.0, "chaos")];

        let plan = plan(&batch, &existing).unwrap();

        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].row_id, 1);
        assert_eq!(plan.updates[0].amount, 6.0);
        assert_eq!(plan.updates[0].change_id, "5-5");
        assert!(plan.deletes.is_empty());
        assert_eq!(plan.upserts.len(), 1);
        assert_eq!(plan.upserts[0].item_id, "B");
        assert_eq!(plan.upserts[0].amount, 10.0);
    }

    #[test]
    fn test_omitted_item_is_deleted_and_unchanged_item_untouched() {
        let batch = vec![snapshot("S", "5-5", vec![entry("A", 5.0, "chaos")])];
        let existing = vec![
            row(1, "A", "S", 5.0, "chaos"),
            row(2, "C", "S", 20.0, "chaos"),
        ];

        let plan = plan(&batch, &existing).unwrap();

        assert!(plan.updates.is_empty());
        assert_eq!(plan.deletes, vec![2]);
        assert!(plan.upserts.is_empty());
    }

    #[test]
    fn test_identical_snapshot_is_a_noop() {
        let batch = vec![snapshot("S", "5-5", vec![entry("A", 5.0, "chaos")])];
        let existing = vec![row(1, "A", "S", 5.0, "chaos")];

        assert!(plan(&batch, &existing).unwrap().is_empty());
    }

    #[test]
    fn test_currency_change_alone_triggers_update() {
        let batch = vec![snapshot("S", "5-5", vec![entry("A", 5.0, "divine")])];
        let existing = vec![row(1, "A", "S", 5.0, "chaos")];

        let plan = plan(&batch, &existing).unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].currency, "divine");
    }

    #[test]
    fn test_item_moved_between_stashes_in_batch() {
        // the item now lives in T; its old row (stash S) is refreshed in
        // place rather than deleted
        let batch = vec![
            snapshot("S", "5-5", vec![entry("X", 1.0, "chaos")]),
            snapshot("T", "5-5", vec![entry("A", 5.0, "chaos")]),
        ];
        let existing = vec![
            row(1, "A", "S", 5.0, "chaos"),
            row(2, "X", "S", 1.0, "chaos"),
        ];

        let plan = plan(&batch, &existing).unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].row_id, 1);
        assert_eq!(plan.updates[0].stash_id, "T");
        assert!(plan.deletes.is_empty());
        assert!(plan.upserts.is_empty());
    }

    #[test]
    fn test_row_outside_batch_is_an_invariant_violation() {
        let batch = vec![snapshot("S", "5-5", vec![entry("A", 5.0, "chaos")])];
        let existing = vec![row(9, "Z", "UNRELATED", 1.0, "chaos")];

        assert!(matches!(
            plan(&batch, &existing),
            Err(PipelineError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_empty_stash_snapshot_deletes_everything() {
        let batch = vec![snapshot("S", "5-5", vec![])];
        let existing = vec![
            row(1, "A", "S", 5.0, "chaos"),
            row(2, "B", "S", 6.0, "chaos"),
        ];

        let plan = plan(&batch, &existing).unwrap();
        assert_eq!(plan.deletes, vec![1, 2]);
        assert!(plan.updates.is_empty());
        assert!(plan.upserts.is_empty());
    }
}
