//! Entity resolution: map extracted provider and material text onto ledger
//! records, creating them when nothing matches.
//!
//! ## Provider ladder
//!
//! 1. canonical CIF, including hyphen and country-prefix variants
//! 2. known alias table (normalized name → CIF)
//! 3. case-insensitive exact name
//! 4. phone number (last nine digits)
//! 5. normalized-name containment
//!
//! First hit wins and has its mutable fields refreshed from the new
//! observation. The CIF of an existing record is never rewritten.
//!
//! ## Material ladder
//!
//! 1. code
//! 2. supplier reference code
//! 3. case-insensitive name
//! 4. for codes of at least [`LONG_CODE_MIN`] characters, a near match on code
//!
//! New materials get the supplier's normalized code, or a slug of the name.
//! Code collisions retry with a numeric suffix, then fall back to a name lookup.

pub mod cache;
pub mod normalize;

pub use cache::{CacheKey, ResolutionCache};

use crate::codec::ExtractedProvider;
use crate::config::PipelineConfig;
use crate::error::LedgerError;
use crate::ledger::LedgerTx;
use crate::model::{AccountId, Material, MaterialCategory, Provider, ProviderType};
use normalize::{
    canonical_cif, cif_variants, normalize_code, normalize_name, phone_digits, similarity, slug,
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Codes at least this long are eligible for near matching.
pub const LONG_CODE_MIN: usize = 6;

/// Minimum similarity for a near code match.
const CODE_SIMILARITY: f64 = 0.9;

/// Shorter side of a containment match must be at least this long.
const CONTAINMENT_MIN: usize = 4;

const SLUG_MAX: usize = 40;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The provider is on the denylist. Never retried.
    #[error("Provider '{provider}' is blocked")]
    Blocked { provider: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Stateless resolver; all state lives in the ledger and the caller's cache.
#[derive(Debug, Clone)]
pub struct EntityResolver {
    blocked: Vec<String>,
    aliases: HashMap<String, String>,
    code_attempts: u32,
}

impl EntityResolver {
    pub fn new<I, S>(blocked: I, aliases: &HashMap<String, String>, code_attempts: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            blocked: blocked
                .into_iter()
                .map(|b| normalize_name(b.as_ref()))
                .filter(|b| !b.is_empty())
                .collect(),
            aliases: aliases
                .iter()
                .map(|(alias, cif)| (normalize_name(alias), canonical_cif(cif)))
                .collect(),
            code_attempts: code_attempts.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            &config.blocked_providers,
            &config.provider_aliases,
            config.material_code_max_attempts,
        )
    }

    /// Whether a provider name is on the denylist, in any spelling.
    pub fn is_blocked(&self, name: &str) -> bool {
        let n = normalize_name(name);
        !n.is_empty() && self.blocked.iter().any(|b| n == *b || n.contains(b.as_str()))
    }

    /// Find or create the provider of an extraction.
    pub async fn resolve_provider(
        &self,
        tx: &mut dyn LedgerTx,
        account: AccountId,
        extracted: &ExtractedProvider,
        cache: &mut ResolutionCache,
    ) -> Result<Provider, ResolveError> {
        if self.is_blocked(&extracted.name) {
            return Err(ResolveError::Blocked {
                provider: extracted.name.clone(),
            });
        }

        let keys = provider_keys(extracted);
        let cached = keys.iter().find_map(|k| cache.provider(account, k));
        let matched = match cached {
            Some(p) => Some(p),
            None => self.find_provider(tx, account, extracted).await?,
        };

        let provider = match matched {
            Some(existing) => self.refresh_provider(tx, existing, extracted).await?,
            None => self.create_provider(tx, account, extracted).await?,
        };

        let mut all_keys = keys;
        all_keys.push(CacheKey::Cif(provider.cif.clone()));
        cache.stage_provider(all_keys, &provider);
        Ok(provider)
    }

    async fn find_provider(
        &self,
        tx: &mut dyn LedgerTx,
        account: AccountId,
        extracted: &ExtractedProvider,
    ) -> Result<Option<Provider>, LedgerError> {
        if let Some(cif) = extracted.cif.as_deref().filter(|c| !c.trim().is_empty()) {
            if let Some(p) = tx.find_provider_by_cif(account, &cif_variants(cif)).await? {
                debug!(provider = %p.name, "Provider matched by CIF");
                return Ok(Some(p));
            }
        }

        let normalized = normalize_name(&extracted.name);
        if let Some(alias_cif) = self.aliases.get(&normalized) {
            if let Some(p) = tx
                .find_provider_by_cif(account, &cif_variants(alias_cif))
                .await?
            {
                debug!(provider = %p.name, "Provider matched by alias");
                return Ok(Some(p));
            }
        }

        if !extracted.name.trim().is_empty() {
            if let Some(p) = tx.find_provider_by_name(account, &extracted.name).await? {
                debug!(provider = %p.name, "Provider matched by name");
                return Ok(Some(p));
            }
        }

        if let Some(digits) = extracted.phone.as_deref().and_then(phone_digits) {
            if let Some(p) = tx.find_provider_by_phone(account, &digits).await? {
                debug!(provider = %p.name, "Provider matched by phone");
                return Ok(Some(p));
            }
        }

        if normalized.chars().count() >= CONTAINMENT_MIN {
            let found = tx
                .list_providers(account)
                .await?
                .into_iter()
                .find(|p| names_contain(&normalize_name(&p.name), &normalized));
            if let Some(p) = found {
                debug!(provider = %p.name, "Provider matched by name containment");
                return Ok(Some(p));
            }
        }

        Ok(None)
    }

    async fn refresh_provider(
        &self,
        tx: &mut dyn LedgerTx,
        existing: Provider,
        extracted: &ExtractedProvider,
    ) -> Result<Provider, LedgerError> {
        let mut updated = existing.clone();
        let name = extracted.name.trim();
        if !name.is_empty() {
            updated.name = name.to_string();
            updated.provider_type = ProviderType::infer(name);
        }
        if let Some(v) = non_blank(&extracted.email) {
            updated.email = Some(v);
        }
        if let Some(v) = non_blank(&extracted.phone) {
            updated.phone = Some(v);
        }
        if let Some(v) = non_blank(&extracted.address) {
            updated.address = Some(v);
        }
        if updated != existing {
            tx.update_provider(&updated).await?;
        }
        Ok(updated)
    }

    async fn create_provider(
        &self,
        tx: &mut dyn LedgerTx,
        account: AccountId,
        extracted: &ExtractedProvider,
    ) -> Result<Provider, LedgerError> {
        let cif = extracted
            .cif
            .as_deref()
            .map(canonical_cif)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| format!("NOCIF-{}", slug(&extracted.name, SLUG_MAX)));
        let name = extracted.name.trim();
        let provider = Provider {
            id: Uuid::new_v4(),
            account,
            cif,
            name: if name.is_empty() {
                extracted.cif.clone().unwrap_or_default()
            } else {
                name.to_string()
            },
            email: non_blank(&extracted.email),
            phone: non_blank(&extracted.phone),
            address: non_blank(&extracted.address),
            provider_type: ProviderType::infer(name),
        };

        if tx.insert_provider(&provider).await? {
            info!(provider = %provider.name, cif = %provider.cif, "Created provider");
            return Ok(provider);
        }

        // Lost a creation race: the conflicting row is the match.
        warn!(cif = %provider.cif, "Provider insert conflicted, re-resolving");
        let existing = tx
            .find_provider_by_cif(account, std::slice::from_ref(&provider.cif))
            .await?;
        let existing = match existing {
            Some(p) => Some(p),
            None => self.find_provider(tx, account, extracted).await?,
        };
        match existing {
            Some(p) => self.refresh_provider(tx, p, extracted).await,
            None => Err(LedgerError::Backend(format!(
                "provider '{}' conflicted on insert but cannot be found",
                provider.cif
            ))),
        }
    }

    /// Find or create a material for an invoice line.
    pub async fn resolve_material(
        &self,
        tx: &mut dyn LedgerTx,
        account: AccountId,
        name: &str,
        code: Option<&str>,
        provider_type: ProviderType,
        cache: &mut ResolutionCache,
    ) -> Result<Material, ResolveError> {
        let name = name.trim();
        let reference = code.map(str::trim).filter(|c| !c.is_empty());
        let norm_code = reference.map(normalize_code).filter(|c| !c.is_empty());

        let mut keys = Vec::new();
        if let Some(c) = &norm_code {
            keys.push(CacheKey::Code(c.clone()));
            keys.push(CacheKey::ReferenceCode(c.clone()));
        }
        keys.push(CacheKey::MaterialName(name.to_uppercase()));

        if let Some(m) = keys.iter().find_map(|k| cache.material(account, k)) {
            return Ok(m);
        }

        let matched = self
            .find_material(tx, account, name, reference, norm_code.as_deref())
            .await?;
        let material = match matched {
            Some(m) => self.upgrade_code(tx, m, reference, norm_code.as_deref()).await?,
            None => {
                let category = MaterialCategory::from(provider_type);
                self.create_material(tx, account, name, reference, norm_code.as_deref(), category)
                    .await?
            }
        };

        keys.push(CacheKey::Code(material.code.clone()));
        cache.stage_material(keys, &material);
        Ok(material)
    }

    async fn find_material(
        &self,
        tx: &mut dyn LedgerTx,
        account: AccountId,
        name: &str,
        reference: Option<&str>,
        norm_code: Option<&str>,
    ) -> Result<Option<Material>, LedgerError> {
        if let Some(code) = norm_code {
            if let Some(m) = tx.find_material_by_code(account, code).await? {
                return Ok(Some(m));
            }
        }
        if let Some(reference) = reference {
            if let Some(m) = tx.find_material_by_reference(account, reference).await? {
                return Ok(Some(m));
            }
        }
        if !name.is_empty() {
            if let Some(m) = tx.find_material_by_name(account, name).await? {
                return Ok(Some(m));
            }
        }
        if let Some(code) = norm_code.filter(|c| c.chars().count() >= LONG_CODE_MIN) {
            let best = tx
                .list_materials_with_long_codes(account, LONG_CODE_MIN)
                .await?
                .into_iter()
                .map(|m| (code_similarity(code, &m.code), m))
                .filter(|(score, _)| *score >= CODE_SIMILARITY)
                .max_by(|a, b| a.0.total_cmp(&b.0));
            if let Some((score, m)) = best {
                debug!(code, matched = %m.code, score, "Material matched by near code");
                return Ok(Some(m));
            }
        }
        Ok(None)
    }

    /// Adopt the supplier's code on a material that was created without one.
    async fn upgrade_code(
        &self,
        tx: &mut dyn LedgerTx,
        existing: Material,
        reference: Option<&str>,
        norm_code: Option<&str>,
    ) -> Result<Material, LedgerError> {
        let (Some(reference), Some(code)) = (reference, norm_code) else {
            return Ok(existing);
        };
        if existing.reference_code.is_some() {
            return Ok(existing);
        }
        let mut updated = existing.clone();
        updated.reference_code = Some(reference.to_string());
        if updated.code != code && tx.find_material_by_code(existing.account, code).await?.is_none()
        {
            updated.code = code.to_string();
        }
        tx.update_material(&updated).await?;
        info!(from = %existing.code, to = %updated.code, "Upgraded material code");
        Ok(updated)
    }

    async fn create_material(
        &self,
        tx: &mut dyn LedgerTx,
        account: AccountId,
        name: &str,
        reference: Option<&str>,
        norm_code: Option<&str>,
        category: MaterialCategory,
    ) -> Result<Material, LedgerError> {
        let base = norm_code
            .map(str::to_string)
            .unwrap_or_else(|| slug(name, SLUG_MAX));
        let mut material = Material {
            id: Uuid::new_v4(),
            account,
            code: base.clone(),
            reference_code: reference.map(str::to_string),
            name: if name.is_empty() { base.clone() } else { name.to_string() },
            category,
        };

        for attempt in 0..self.code_attempts {
            if attempt > 0 {
                material.code = format!("{base}-{}", attempt + 1);
            }
            if tx.insert_material(&material).await? {
                debug!(code = %material.code, "Created material");
                return Ok(material);
            }
            debug!(code = %material.code, attempt = attempt + 1, "Material code collision");
        }

        warn!(
            code = %base,
            attempts = self.code_attempts,
            "Material codes exhausted, falling back to name lookup"
        );
        tx.find_material_by_name(account, &material.name)
            .await?
            .ok_or_else(|| {
                LedgerError::Backend(format!(
                    "no free code for material '{}' after {} attempts",
                    material.name, self.code_attempts
                ))
            })
    }
}

fn provider_keys(extracted: &ExtractedProvider) -> Vec<CacheKey> {
    let mut keys = Vec::new();
    if let Some(cif) = extracted.cif.as_deref() {
        let c = canonical_cif(cif);
        if !c.is_empty() {
            keys.push(CacheKey::Cif(c));
        }
    }
    let n = normalize_name(&extracted.name);
    if !n.is_empty() {
        keys.push(CacheKey::ProviderName(n));
    }
    keys
}

fn names_contain(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.chars().count() >= CONTAINMENT_MIN && long.contains(short)
}

/// Code similarity after folding characters OCR commonly confuses.
fn code_similarity(a: &str, b: &str) -> f64 {
    fn fold(s: &str) -> String {
        s.chars()
            .map(|c| match c {
                'O' => '0',
                'I' | 'L' => '1',
                'S' => '5',
                'B' => '8',
                'Z' => '2',
                c => c,
            })
            .collect()
    }
    similarity(&fold(a), &fold(b))
}

fn non_blank(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Ledger, MemoryLedger};

    fn resolver(blocked: &[&str]) -> EntityResolver {
        let mut aliases = HashMap::new();
        aliases.insert("Norte Suministros".to_string(), "B-12345678".to_string());
        EntityResolver::new(blocked.iter().copied(), &aliases, 3)
    }

    fn extracted(name: &str, cif: Option<&str>) -> ExtractedProvider {
        ExtractedProvider {
            name: name.into(),
            cif: cif.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn provider_ladder_matches_variants_and_refreshes() {
        let ledger = MemoryLedger::new();
        let r = resolver(&[]);
        let account = Uuid::new_v4();
        let mut cache = ResolutionCache::new();
        let mut tx = ledger.begin().await.unwrap();

        let first = r
            .resolve_provider(
                tx.as_mut(),
                account,
                &extracted("Suministros Norte SL", Some("ES-B12345678")),
                &mut cache,
            )
            .await
            .unwrap();
        assert_eq!(first.cif, "B12345678");

        let mut fresh = ResolutionCache::new();
        let by_variant = r
            .resolve_provider(
                tx.as_mut(),
                account,
                &ExtractedProvider {
                    email: Some("info@norte.es".into()),
                    ..extracted("Suministros del Norte", Some("B-12.345.678"))
                },
                &mut fresh,
            )
            .await
            .unwrap();
        assert_eq!(by_variant.id, first.id);
        assert_eq!(by_variant.name, "Suministros del Norte");
        assert_eq!(by_variant.email.as_deref(), Some("info@norte.es"));
        assert_eq!(by_variant.cif, "B12345678");

        let mut fresh = ResolutionCache::new();
        let by_alias = r
            .resolve_provider(
                tx.as_mut(),
                account,
                &extracted("NORTE SUMINISTROS, S.L.", None),
                &mut fresh,
            )
            .await
            .unwrap();
        assert_eq!(by_alias.id, first.id);
        tx.commit().await.unwrap();
        assert_eq!(ledger.providers().await.len(), 1);
    }

    #[tokio::test]
    async fn provider_matches_by_phone_and_containment() {
        let ledger = MemoryLedger::new();
        let r = resolver(&[]);
        let account = Uuid::new_v4();
        let mut tx = ledger.begin().await.unwrap();
        let mut cache = ResolutionCache::new();
        let created = r
            .resolve_provider(
                tx.as_mut(),
                account,
                &ExtractedProvider {
                    phone: Some("944 123 456".into()),
                    ..extracted("Ferreteria Goya", Some("B99999999"))
                },
                &mut cache,
            )
            .await
            .unwrap();

        let by_phone = r
            .resolve_provider(
                tx.as_mut(),
                account,
                &ExtractedProvider {
                    phone: Some("+34944123456".into()),
                    ..extracted("FG Bilbao", None)
                },
                &mut ResolutionCache::new(),
            )
            .await
            .unwrap();
        assert_eq!(by_phone.id, created.id);

        let by_containment = r
            .resolve_provider(
                tx.as_mut(),
                account,
                &extracted("FG Bilbao Centro", None),
                &mut ResolutionCache::new(),
            )
            .await
            .unwrap();
        assert_eq!(by_containment.id, created.id);
    }

    #[tokio::test]
    async fn blocked_provider_fails_fast() {
        let ledger = MemoryLedger::new();
        let r = resolver(&["Proveedor Vetado S.A."]);
        let mut tx = ledger.begin().await.unwrap();
        let err = r
            .resolve_provider(
                tx.as_mut(),
                Uuid::new_v4(),
                &extracted("PROVEEDOR VETADO, SA", Some("A11111111")),
                &mut ResolutionCache::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Blocked { .. }));
        tx.commit().await.unwrap();
        assert!(ledger.providers().await.is_empty());
    }

    #[tokio::test]
    async fn material_ladder_and_code_upgrade() {
        let ledger = MemoryLedger::new();
        let r = resolver(&[]);
        let account = Uuid::new_v4();
        let mut tx = ledger.begin().await.unwrap();
        let mut cache = ResolutionCache::new();

        let by_slug = r
            .resolve_material(
                tx.as_mut(),
                account,
                "Cemento gris",
                None,
                ProviderType::Materials,
                &mut cache,
            )
            .await
            .unwrap();
        assert_eq!(by_slug.code, "CEMENTO-GRIS");
        assert_eq!(by_slug.category, MaterialCategory::Material);

        // Same name, now with a supplier code: the code is adopted.
        let upgraded = r
            .resolve_material(
                tx.as_mut(),
                account,
                "CEMENTO GRIS",
                Some("cg-25"),
                ProviderType::Materials,
                &mut ResolutionCache::new(),
            )
            .await
            .unwrap();
        assert_eq!(upgraded.id, by_slug.id);
        assert_eq!(upgraded.code, "CG25");
        assert_eq!(upgraded.reference_code.as_deref(), Some("cg-25"));

        // The code wins over a different name.
        let near = r
            .resolve_material(
                tx.as_mut(),
                account,
                "Otro nombre",
                Some("CG25"),
                ProviderType::Materials,
                &mut ResolutionCache::new(),
            )
            .await
            .unwrap();
        assert_eq!(near.id, by_slug.id);
    }

    #[tokio::test]
    async fn long_codes_tolerate_ocr_confusion() {
        let ledger = MemoryLedger::new();
        let r = resolver(&[]);
        let account = Uuid::new_v4();
        let mut tx = ledger.begin().await.unwrap();
        let a = r
            .resolve_material(
                tx.as_mut(),
                account,
                "Tubo PVC 110",
                Some("TUB0110PVC"),
                ProviderType::Materials,
                &mut ResolutionCache::new(),
            )
            .await
            .unwrap();
        let b = r
            .resolve_material(
                tx.as_mut(),
                account,
                "Tubo PVC diametro 110",
                Some("TUBO110PVC"),
                ProviderType::Materials,
                &mut ResolutionCache::new(),
            )
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn code_collisions_get_suffixes() {
        let ledger = MemoryLedger::new();
        let r = resolver(&[]);
        let account = Uuid::new_v4();
        let mut tx = ledger.begin().await.unwrap();
        let first = r
            .create_material(
                tx.as_mut(),
                account,
                "Arena",
                None,
                None,
                MaterialCategory::Material,
            )
            .await
            .unwrap();
        let second = r
            .create_material(
                tx.as_mut(),
                account,
                "arena ",
                None,
                None,
                MaterialCategory::Material,
            )
            .await
            .unwrap();
        assert_eq!(first.code, "ARENA");
        assert_eq!(second.code, "ARENA-2");
    }
}
