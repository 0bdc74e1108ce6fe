//! Per-session lookup cache for resolved providers and materials.
//!
//! One [`ResolutionCache`] lives for one upload session or one aggregation
//! run and is dropped afterwards. Entries learned inside a transaction are
//! staged and only become visible to later transactions once
//! [`ResolutionCache::commit`] is called after a successful commit; a failed
//! transaction calls [`ResolutionCache::discard`] instead, so the cache never
//! points at rows that were rolled back. Every entry remembers its account
//! and is re-checked against the caller's account on lookup.

use crate::model::{AccountId, Material, Provider};
use std::collections::HashMap;

/// Lookup key of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Canonical CIF.
    Cif(String),
    /// Normalized provider name.
    ProviderName(String),
    /// Normalized material code.
    Code(String),
    /// Supplier reference code as extracted, normalized.
    ReferenceCode(String),
    /// Uppercased material name.
    MaterialName(String),
}

#[derive(Debug, Default)]
struct Layer {
    providers: HashMap<(AccountId, CacheKey), Provider>,
    materials: HashMap<(AccountId, CacheKey), Material>,
}

#[derive(Debug, Default)]
pub struct ResolutionCache {
    committed: Layer,
    staged: Layer,
    hits: u64,
    misses: u64,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&mut self, account: AccountId, key: &CacheKey) -> Option<Provider> {
        let key = (account, key.clone());
        let found = self
            .staged
            .providers
            .get(&key)
            .or_else(|| self.committed.providers.get(&key))
            .filter(|p| p.account == account)
            .cloned();
        self.count(found.is_some());
        found
    }

    pub fn material(&mut self, account: AccountId, key: &CacheKey) -> Option<Material> {
        let key = (account, key.clone());
        let found = self
            .staged
            .materials
            .get(&key)
            .or_else(|| self.committed.materials.get(&key))
            .filter(|m| m.account == account)
            .cloned();
        self.count(found.is_some());
        found
    }

    pub fn stage_provider(&mut self, keys: impl IntoIterator<Item = CacheKey>, provider: &Provider) {
        for key in keys {
            self.staged
                .providers
                .insert((provider.account, key), provider.clone());
        }
    }

    pub fn stage_material(&mut self, keys: impl IntoIterator<Item = CacheKey>, material: &Material) {
        for key in keys {
            self.staged
                .materials
                .insert((material.account, key), material.clone());
        }
    }

    /// Publish staged entries after the transaction committed.
    pub fn commit(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        self.committed.providers.extend(staged.providers);
        self.committed.materials.extend(staged.materials);
    }

    /// Drop staged entries after the transaction failed.
    pub fn discard(&mut self) {
        self.staged = Layer::default();
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn count(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }
}
