//! Object placement.
//!
//! Every var carries a sticky [`Positions`](crate::ids::Positions)
//! vector: the digits of a Lehmer code encoding a permutation of the
//! configuration's RM slots. Resolving a var's replicas decodes the
//! permutation over the current RM list, skips empty (removed) slots,
//! and takes the first `TwoFInc` survivors. Because positions never
//! change, an object's replica list moves only when the RM list does.

use std::collections::HashMap;

use rand::Rng;

use crate::ids::{Positions, RMId, VarUUId};
use crate::ResolveError;

/// Entropy pool bound: `2^63`, matching the range of a 63-bit draw.
const ENTROPY: u64 = 1 << 63;

// ============================================================================
// Resolver
// ============================================================================

/// Decodes positions into replica lists against a fixed RM slot list.
///
/// The slot list may contain [`RMId::EMPTY`] holes left by removed
/// nodes; holes keep later slots stable.
#[derive(Debug, Clone)]
pub struct Resolver {
    rms: Vec<RMId>,
    desired_len: usize,
}

impl Resolver {
    /// Creates a resolver over the given slot list producing replica
    /// lists of `desired_len` (normally `TwoFInc`).
    pub fn new(rms: Vec<RMId>, desired_len: usize) -> Self {
        Self { rms, desired_len }
    }

    pub fn desired_len(&self) -> usize {
        self.desired_len
    }

    /// Decodes the permutation and returns the first `desired_len`
    /// non-empty RMs in permuted order.
    pub fn resolve(&self, positions: &Positions) -> Result<Vec<RMId>, ResolveError> {
        if positions.len() < self.rms.len() {
            return Err(ResolveError::PositionsTooShort {
                len: positions.len(),
                rms: self.rms.len(),
            });
        }

        // Lehmer decode: digit i selects an index into the not-yet-taken
        // prefix of slots 0..=i.
        let mut slots: Vec<RMId> = Vec::with_capacity(self.rms.len());
        for (idx, &rm) in self.rms.iter().enumerate() {
            let digit = usize::from(positions.digits()[idx]);
            debug_assert!(digit <= idx, "position digit out of range");
            slots.insert(digit, rm);
        }

        let hash_codes: Vec<RMId> = slots
            .into_iter()
            .filter(|rm| !rm.is_empty())
            .take(self.desired_len)
            .collect();

        if hash_codes.len() < self.desired_len {
            return Err(ResolveError::InsufficientRMs {
                need: self.desired_len,
                have: hash_codes.len(),
            });
        }
        Ok(hash_codes)
    }
}

/// Generates fresh positions of `length` digits from a shared entropy
/// pool, plus the replica list they resolve to.
///
/// Digit 0 is always 0; digit `i` is drawn uniformly from `[0, i]`.
/// Drawing successive digits from one 63-bit sample amortises the RNG
/// cost across the whole vector.
pub fn create_positions(
    resolver: &Resolver,
    length: usize,
    rng: &mut impl Rng,
) -> Result<(Positions, Vec<RMId>), ResolveError> {
    let mut digits = vec![0u8; length];
    let mut n: u64 = rng.gen_range(0..ENTROPY);
    let mut entropy = ENTROPY;
    for idx in 1..length {
        let base = (idx + 1) as u64;
        if entropy < base {
            n = rng.gen_range(0..ENTROPY);
            entropy = ENTROPY;
        }
        digits[idx] = (n % base) as u8;
        n /= base;
        entropy /= base;
    }
    let positions = Positions::new(digits);
    let hash_codes = resolver.resolve(&positions)?;
    Ok((positions, hash_codes))
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    positions: Positions,
    hash_codes: Option<Vec<RMId>>,
}

/// Memoises positions and resolved replica lists per var.
///
/// Replica lists are invalidated wholesale when the resolver changes
/// (topology change); positions survive, being sticky.
#[derive(Debug)]
pub struct HashCache {
    entries: HashMap<VarUUId, CacheEntry>,
    resolver: Resolver,
}

impl HashCache {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            entries: HashMap::new(),
            resolver,
        }
    }

    pub fn positions(&self, var: &VarUUId) -> Option<&Positions> {
        self.entries.get(var).map(|e| &e.positions)
    }

    /// Records positions for a var, invalidating the cached replica list
    /// if they changed.
    pub fn add_position(&mut self, var: VarUUId, positions: Positions) {
        match self.entries.get_mut(&var) {
            Some(entry) if entry.positions == positions => {}
            Some(entry) => {
                entry.positions = positions;
                entry.hash_codes = None;
            }
            None => {
                self.entries.insert(
                    var,
                    CacheEntry {
                        positions,
                        hash_codes: None,
                    },
                );
            }
        }
    }

    pub fn remove(&mut self, var: &VarUUId) {
        self.entries.remove(var);
    }

    /// Returns the replica list for a known var, resolving lazily.
    pub fn hash_codes(&mut self, var: &VarUUId) -> Result<&[RMId], ResolveError> {
        let entry = self
            .entries
            .get_mut(var)
            .ok_or(ResolveError::UnknownVar(*var))?;
        if entry.hash_codes.is_none() {
            entry.hash_codes = Some(self.resolver.resolve(&entry.positions)?);
        }
        Ok(entry.hash_codes.as_deref().expect("resolved above"))
    }

    /// Mints positions for a new var and records them.
    pub fn create_positions(
        &mut self,
        var: VarUUId,
        length: usize,
        rng: &mut impl Rng,
    ) -> Result<(Positions, Vec<RMId>), ResolveError> {
        let (positions, hash_codes) = create_positions(&self.resolver, length, rng)?;
        self.entries.insert(
            var,
            CacheEntry {
                positions: positions.clone(),
                hash_codes: Some(hash_codes.clone()),
            },
        );
        Ok((positions, hash_codes))
    }

    /// Installs a new resolver (topology change) and drops every cached
    /// replica list.
    pub fn set_resolver(&mut self, resolver: Resolver) {
        self.resolver = resolver;
        for entry in self.entries.values_mut() {
            entry.hash_codes = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TxnId;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rms(n: u32) -> Vec<RMId> {
        (1..=n).map(RMId::new).collect()
    }

    fn var(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    #[test]
    fn identity_permutation() {
        // All-zero digits insert each RM at the front: reversed order.
        let resolver = Resolver::new(rms(3), 3);
        let positions = Positions::new(vec![0, 0, 0]);
        let codes = resolver.resolve(&positions).expect("resolve");
        assert_eq!(codes, vec![RMId::new(3), RMId::new(2), RMId::new(1)]);
    }

    #[test]
    fn max_digits_preserve_order() {
        // Digit i == i appends each RM at the back: original order.
        let resolver = Resolver::new(rms(3), 3);
        let positions = Positions::new(vec![0, 1, 2]);
        let codes = resolver.resolve(&positions).expect("resolve");
        assert_eq!(codes, vec![RMId::new(1), RMId::new(2), RMId::new(3)]);
    }

    #[test]
    fn empty_slots_are_skipped() {
        let mut slots = rms(5);
        slots[1] = RMId::EMPTY;
        let resolver = Resolver::new(slots, 3);
        let positions = Positions::new(vec![0, 1, 2, 3, 4]);
        let codes = resolver.resolve(&positions).expect("resolve");
        assert_eq!(codes.len(), 3);
        assert!(codes.iter().all(|rm| !rm.is_empty()));
        assert!(!codes.contains(&RMId::new(2)));
    }

    #[test]
    fn insufficient_rms_rejected() {
        let resolver = Resolver::new(rms(2), 3);
        let positions = Positions::new(vec![0, 1]);
        assert_eq!(
            resolver.resolve(&positions),
            Err(ResolveError::InsufficientRMs { need: 3, have: 2 })
        );
    }

    #[test]
    fn created_positions_are_valid_lehmer() {
        let resolver = Resolver::new(rms(5), 5);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..64 {
            let (positions, codes) =
                create_positions(&resolver, 5, &mut rng).expect("create");
            assert_eq!(positions.len(), 5);
            assert_eq!(positions.digits()[0], 0);
            for (i, &d) in positions.digits().iter().enumerate() {
                assert!(usize::from(d) <= i);
            }
            assert_eq!(codes.len(), 5);
        }
    }

    #[test]
    fn cache_invalidates_on_new_resolver() {
        let mut cache = HashCache::new(Resolver::new(rms(3), 3));
        cache.add_position(var(1), Positions::new(vec![0, 1, 2]));
        assert_eq!(
            cache.hash_codes(&var(1)).expect("resolve"),
            &[RMId::new(1), RMId::new(2), RMId::new(3)]
        );

        // Remove RM 1, shrink to 2 replicas.
        let mut slots = rms(3);
        slots[0] = RMId::EMPTY;
        cache.set_resolver(Resolver::new(slots, 2));
        assert_eq!(
            cache.hash_codes(&var(1)).expect("resolve"),
            &[RMId::new(2), RMId::new(3)]
        );
    }

    #[test]
    fn unknown_var_errors() {
        let mut cache = HashCache::new(Resolver::new(rms(3), 3));
        assert_eq!(
            cache.hash_codes(&var(9)).unwrap_err(),
            ResolveError::UnknownVar(var(9))
        );
    }
}
