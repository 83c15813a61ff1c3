// 🧮 Decomposer - target amount → card counts per denomination
// Pure functions only: no I/O, no shared state.

use crate::error::{DecomposeError, DenominationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Denominations used when nothing else is configured
pub const DEFAULT_DENOMINATIONS: [u32; 4] = [10, 5, 3, 1];

/// Largest accepted denomination; bounds the table built by the optimality check
pub const MAX_DENOMINATION: u32 = 1_000_000;

// ============================================================================
// DENOMINATIONS
// ============================================================================

/// A validated denomination set: non-empty, strictly descending, ends with 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Denominations(Vec<u32>);

impl Denominations {
    pub fn new(values: Vec<u32>) -> Result<Self, DenominationError> {
        let Some(&last) = values.last() else {
            return Err(DenominationError::Empty);
        };

        if let Some(&zero) = values.iter().find(|&&v| v == 0) {
            return Err(DenominationError::NotPositive(zero));
        }

        if let Some(&huge) = values.iter().find(|&&v| v > MAX_DENOMINATION) {
            return Err(DenominationError::TooLarge {
                value: huge,
                max: MAX_DENOMINATION,
            });
        }

        for pair in values.windows(2) {
            if pair[0] <= pair[1] {
                return Err(DenominationError::NotDescending {
                    previous: pair[0],
                    next: pair[1],
                });
            }
        }

        if last != 1 {
            return Err(DenominationError::MissingUnit(last));
        }

        Ok(Denominations(values))
    }

    pub fn values(&self) -> &[u32] {
        &self.0
    }

    pub fn contains(&self, denomination: u32) -> bool {
        self.0.contains(&denomination)
    }

    /// Check that greedy decomposition is optimal for this set.
    ///
    /// Compares greedy against an exact minimum for every target up to the sum
    /// of the two largest denominations. If greedy is suboptimal anywhere, the
    /// smallest counterexample lies inside that range.
    pub fn verify_greedy_optimal(&self) -> Result<(), DenominationError> {
        let bound = match self.0.as_slice() {
            [first, second, ..] => u64::from(*first) + u64::from(*second),
            _ => return Ok(()),
        };

        let optimal = minimal_card_counts(&self.0, bound);

        for target in 1..=bound {
            let greedy = greedy_counts(&self.0, target).iter().sum::<u64>();
            let best = optimal[target as usize];
            if greedy > best {
                return Err(DenominationError::NonCanonical {
                    target,
                    greedy,
                    optimal: best,
                });
            }
        }

        Ok(())
    }
}

impl Default for Denominations {
    fn default() -> Self {
        Denominations(DEFAULT_DENOMINATIONS.to_vec())
    }
}

impl<'de> Deserialize<'de> for Denominations {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let values = Vec::<u32>::deserialize(deserializer)?;
        Denominations::new(values).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// COMBINATION
// ============================================================================

/// Denomination → count mapping, largest denomination first.
///
/// Ephemeral: produced by [`decompose`] and consumed once by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Combination {
    parts: Vec<(u32, u64)>,
}

impl Combination {
    /// Build a combination directly, e.g. for a standalone allocation.
    /// Entries with the same denomination are merged.
    pub fn from_counts(counts: impl IntoIterator<Item = (u32, u64)>) -> Self {
        let mut parts: Vec<(u32, u64)> = Vec::new();
        for (denomination, count) in counts {
            match parts.iter_mut().find(|(d, _)| *d == denomination) {
                Some((_, existing)) => *existing = existing.saturating_add(count),
                None => parts.push((denomination, count)),
            }
        }
        parts.sort_by(|a, b| b.0.cmp(&a.0));
        Combination { parts }
    }

    /// All (denomination, count) pairs, including zero counts
    pub fn parts(&self) -> &[(u32, u64)] {
        &self.parts
    }

    /// Pairs with a positive count
    pub fn required(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.parts.iter().copied().filter(|&(_, count)| count > 0)
    }

    pub fn count_of(&self, denomination: u32) -> u64 {
        self.parts
            .iter()
            .find(|(d, _)| *d == denomination)
            .map(|&(_, count)| count)
            .unwrap_or(0)
    }

    /// Weighted sum of all parts
    pub fn total_value(&self) -> u64 {
        self.parts
            .iter()
            .fold(0u64, |total, &(denomination, count)| {
                total.saturating_add(u64::from(denomination).saturating_mul(count))
            })
    }

    /// Number of cards this combination needs
    pub fn card_count(&self) -> u64 {
        self.parts
            .iter()
            .fold(0u64, |total, &(_, count)| total.saturating_add(count))
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .parts
            .iter()
            .map(|(denomination, count)| format!("{}×{}", denomination, count))
            .collect();
        write!(f, "{{{}}}", rendered.join(", "))
    }
}

// ============================================================================
// DECOMPOSE
// ============================================================================

/// Decompose `target` into a minimal combination, largest denomination first.
///
/// Every configured denomination appears in the result, with zero counts kept.
pub fn decompose(target: i64, denominations: &Denominations) -> Result<Combination, DecomposeError> {
    if target <= 0 {
        return Err(DecomposeError::NonPositiveTarget(target));
    }

    let amount = target as u64;
    let counts = greedy_counts(denominations.values(), amount);
    let combination = Combination {
        parts: denominations.values().iter().copied().zip(counts).collect(),
    };

    let total = combination.total_value();
    if total != amount {
        return Err(DecomposeError::Unsolvable {
            target,
            remainder: amount.saturating_sub(total),
        });
    }

    tracing::debug!(amount = target, %combination, "decomposed target");
    Ok(combination)
}

fn greedy_counts(denominations: &[u32], amount: u64) -> Vec<u64> {
    let mut remaining = amount;
    denominations
        .iter()
        .map(|&denomination| {
            let value = u64::from(denomination);
            let count = remaining / value;
            remaining -= count * value;
            count
        })
        .collect()
}

/// Exact minimum card count for each amount in `0..=bound`
fn minimal_card_counts(denominations: &[u32], bound: u64) -> Vec<u64> {
    let size = bound as usize + 1;
    let mut best = vec![u64::MAX; size];
    best[0] = 0;

    for amount in 1..size {
        for &denomination in denominations {
            let value = denomination as usize;
            if value <= amount && best[amount - value] != u64::MAX {
                best[amount] = best[amount].min(best[amount - value] + 1);
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_set() -> Denominations {
        Denominations::default()
    }

    #[test]
    fn test_decompose_eighteen() {
        let combination = decompose(18, &default_set()).unwrap();

        assert_eq!(combination.parts(), &[(10, 1), (5, 1), (3, 1), (1, 0)]);
        assert_eq!(combination.total_value(), 18);
        assert_eq!(combination.card_count(), 3);
    }

    #[test]
    fn test_decompose_four() {
        let combination = decompose(4, &default_set()).unwrap();

        assert_eq!(combination.parts(), &[(10, 0), (5, 0), (3, 1), (1, 1)]);
    }

    #[test]
    fn test_non_positive_target_is_invalid() {
        assert_eq!(
            decompose(0, &default_set()),
            Err(DecomposeError::NonPositiveTarget(0))
        );
        assert_eq!(
            decompose(-7, &default_set()),
            Err(DecomposeError::NonPositiveTarget(-7))
        );
    }

    #[test]
    fn test_decompose_is_exact_and_minimal() {
        let set = default_set();
        let optimal = minimal_card_counts(set.values(), 500);

        for target in 1..=500i64 {
            let combination = decompose(target, &set).unwrap();
            assert_eq!(
                combination.total_value(),
                target as u64,
                "weighted sum must equal target {}",
                target
            );
            assert_eq!(
                combination.card_count(),
                optimal[target as usize],
                "card count must be minimal for target {}",
                target
            );
        }
    }

    #[test]
    fn test_decompose_is_deterministic() {
        let set = default_set();
        assert_eq!(decompose(97, &set), decompose(97, &set));
    }

    #[test]
    fn test_denomination_validation() {
        assert_eq!(Denominations::new(vec![]), Err(DenominationError::Empty));
        assert_eq!(
            Denominations::new(vec![5, 0]),
            Err(DenominationError::NotPositive(0))
        );
        assert_eq!(
            Denominations::new(vec![5, 5, 1]),
            Err(DenominationError::NotDescending { previous: 5, next: 5 })
        );
        assert_eq!(
            Denominations::new(vec![1, 5]),
            Err(DenominationError::NotDescending { previous: 1, next: 5 })
        );
        assert_eq!(
            Denominations::new(vec![10, 5, 2]),
            Err(DenominationError::MissingUnit(2))
        );
        assert!(Denominations::new(vec![1]).is_ok());
    }

    #[test]
    fn test_default_set_is_greedy_optimal() {
        assert!(default_set().verify_greedy_optimal().is_ok());
        assert!(Denominations::new(vec![25, 10, 5, 1])
            .unwrap()
            .verify_greedy_optimal()
            .is_ok());
    }

    #[test]
    fn test_non_canonical_set_is_rejected() {
        // 6 = 3 + 3, greedy picks 4 + 1 + 1
        let set = Denominations::new(vec![4, 3, 1]).unwrap();

        assert_eq!(
            set.verify_greedy_optimal(),
            Err(DenominationError::NonCanonical {
                target: 6,
                greedy: 3,
                optimal: 2,
            })
        );
    }

    #[test]
    fn test_combination_from_counts_merges_and_orders() {
        let combination = Combination::from_counts([(3, 1), (10, 1), (3, 2), (5, 0)]);

        assert_eq!(combination.parts(), &[(10, 1), (5, 0), (3, 3)]);
        assert_eq!(combination.required().collect::<Vec<_>>(), vec![(10, 1), (3, 3)]);
        assert_eq!(combination.count_of(3), 3);
        assert_eq!(combination.count_of(1), 0);
        assert_eq!(combination.to_string(), "{10×1, 5×0, 3×3}");
    }

    #[test]
    fn test_oversized_denomination_is_rejected() {
        assert_eq!(
            Denominations::new(vec![4_000_000_000, 1]),
            Err(DenominationError::TooLarge {
                value: 4_000_000_000,
                max: MAX_DENOMINATION,
            })
        );

        let largest = Denominations::new(vec![MAX_DENOMINATION, 1]).unwrap();
        assert!(largest.verify_greedy_optimal().is_ok());
    }

    #[test]
    fn test_combination_counts_saturate() {
        let combination = Combination::from_counts([(10, u64::MAX), (10, 5), (1, 1)]);

        assert_eq!(combination.count_of(10), u64::MAX);
        assert_eq!(combination.card_count(), u64::MAX);
        assert_eq!(combination.total_value(), u64::MAX);
    }

    #[test]
    fn test_huge_target_decomposes() {
        let combination = decompose(1_000_000_000_000_000_000, &default_set()).unwrap();

        assert_eq!(combination.count_of(10), 100_000_000_000_000_000);
        assert_eq!(combination.total_value(), 1_000_000_000_000_000_000);
    }

    #[test]
    fn test_denominations_deserialize_validates() {
        let ok: Denominations = serde_json::from_str("[10, 5, 3, 1]").unwrap();
        assert_eq!(ok, default_set());

        let bad = serde_json::from_str::<Denominations>("[10, 5, 3]");
        assert!(bad.is_err());
    }
}
