//! Weighted random selection within a tier

use std::sync::Arc;

use rand::Rng;

use crate::registry::ServerConfig;

/// Pick one candidate with probability proportional to its weight
///
/// Returns `None` when there are no candidates or every weight is zero.
pub fn pick_weighted<'a, R: Rng + ?Sized>(
    candidates: &'a [Arc<ServerConfig>],
    rng: &mut R,
) -> Option<&'a Arc<ServerConfig>> {
    let total_weight: u64 = candidates.iter().map(|s| u64::from(s.weight)).sum();
    if total_weight == 0 {
        return None;
    }

    let roll = rng.gen_range(0..total_weight);
    let mut cumulative = 0u64;
    for candidate in candidates {
        cumulative += u64::from(candidate.weight);
        if roll < cumulative {
            return Some(candidate);
        }
    }

    // Unreachable while roll < total_weight
    candidates.last()
}
