//! Canonical forms used for identity comparisons.
//!
//! Extracted text arrives with every formatting variant a printed invoice
//! can have: `B-12.345.678`, `ESB12345678`, `Suministros Norte, S.L.`,
//! `+34 944 00 00 00`. Each helper here maps such variants onto one
//! comparable form.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Z0-9]+").unwrap());

static RE_LEGAL_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(SLU|SLL|SL|SAU|SA|SC|SCOOP|SCP|CB|SLNE|LTD|LLC|INC|GMBH)\b").unwrap()
});

static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Canonical tax id: uppercase alphanumerics with any `ES` country prefix removed.
///
/// ```
/// use invoice_pipeline::resolver::normalize::canonical_cif;
/// assert_eq!(canonical_cif("es-b.12.345.678"), "B12345678");
/// ```
pub fn canonical_cif(raw: &str) -> String {
    let upper: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    match upper.strip_prefix("ES") {
        Some(rest) if rest.len() == 9 => rest.to_string(),
        _ => upper,
    }
}

/// Spellings a tax id may have been stored under.
pub fn cif_variants(raw: &str) -> Vec<String> {
    let canonical = canonical_cif(raw);
    if canonical.is_empty() {
        return Vec::new();
    }
    let mut out = vec![canonical.clone(), format!("ES{canonical}")];
    if canonical.len() > 1 {
        let (head, tail) = canonical.split_at(1);
        out.push(format!("{head}-{tail}"));
    }
    let trimmed = raw.trim().to_uppercase();
    if !out.contains(&trimmed) && !trimmed.is_empty() {
        out.push(trimmed);
    }
    out
}

/// Replace accented Latin letters with their base letter.
pub fn fold_accents(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' | 'ã' => 'a',
            'Á' | 'À' | 'Ä' | 'Â' | 'Ã' => 'A',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'É' | 'È' | 'Ë' | 'Ê' => 'E',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'Í' | 'Ì' | 'Ï' | 'Î' => 'I',
            'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
            'Ó' | 'Ò' | 'Ö' | 'Ô' | 'Õ' => 'O',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'Ú' | 'Ù' | 'Ü' | 'Û' => 'U',
            'ñ' => 'n',
            'Ñ' => 'N',
            'ç' => 'c',
            'Ç' => 'C',
            other => other,
        })
        .collect()
}

/// Comparable company name: accents folded, punctuation and legal-form
/// suffixes removed, single-spaced, uppercase.
pub fn normalize_name(name: &str) -> String {
    // Dots go first so "S.L." collapses to "SL" before suffix removal.
    let upper = fold_accents(name).to_uppercase().replace('.', "");
    let spaced = RE_NON_ALNUM.replace_all(&upper, " ");
    let stripped = RE_LEGAL_SUFFIX.replace_all(&spaced, " ");
    RE_SPACES.replace_all(stripped.trim(), " ").into_owned()
}

/// The last nine digits of a phone number, `None` when too short to compare.
pub fn phone_digits(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 9 {
        return None;
    }
    Some(digits[digits.len() - 9..].to_string())
}

/// Comparable product code: uppercase alphanumerics only.
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Generated material code derived from a name, e.g. `CEMENTO-GRIS-25KG`.
pub fn slug(name: &str, max_len: usize) -> String {
    let upper = fold_accents(name).to_uppercase();
    let dashed = RE_NON_ALNUM.replace_all(&upper, "-");
    let mut s = dashed.trim_matches('-').to_string();
    if s.len() > max_len {
        s.truncate(max_len);
        s = s.trim_end_matches('-').to_string();
    }
    if s.is_empty() {
        s.push_str("MAT");
    }
    s
}

/// Edit distance between two strings, by characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Similarity in `[0, 1]`: one minus edit distance over the longer length.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cif_forms_collapse() {
        assert_eq!(canonical_cif("B-12345678"), "B12345678");
        assert_eq!(canonical_cif("ES B12345678"), "B12345678");
        assert_eq!(canonical_cif(" b.12.345.678 "), "B12345678");
        // Not a country prefix when the remainder is not a full id.
        assert_eq!(canonical_cif("ES123"), "ES123");
        let v = cif_variants("b-12345678");
        assert!(v.contains(&"B12345678".to_string()));
        assert!(v.contains(&"ESB12345678".to_string()));
        assert!(v.contains(&"B-12345678".to_string()));
        assert!(cif_variants("  ").is_empty());
    }

    #[test]
    fn names_lose_accents_and_legal_forms() {
        assert_eq!(
            normalize_name("Suministros Peñalba, S.L."),
            "SUMINISTROS PENALBA"
        );
        assert_eq!(normalize_name("ÁRIDOS DEL NORTE SA"), "ARIDOS DEL NORTE");
        assert_eq!(normalize_name("Hormigones SLU"), "HORMIGONES");
    }

    #[test]
    fn phones_compare_on_last_nine_digits() {
        assert_eq!(phone_digits("+34 944 00 00 01").as_deref(), Some("944000001"));
        assert_eq!(phone_digits("944000001").as_deref(), Some("944000001"));
        assert_eq!(phone_digits("12345"), None);
    }

    #[test]
    fn slugs_and_codes() {
        assert_eq!(slug("Cemento gris 25 kg", 40), "CEMENTO-GRIS-25-KG");
        assert_eq!(slug("Tubería PVC Ø110", 40), "TUBERIA-PVC-110");
        assert_eq!(slug("Arena lavada de río fina", 12), "ARENA-LAVADA");
        assert_eq!(slug("***", 40), "MAT");
        assert_eq!(normalize_code("ab-12 3"), "AB123");
    }

    #[test]
    fn edit_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert!(similarity("CEM25KG01", "CEM25KG02") > 0.85);
        assert!(similarity("ABCDEF", "UVWXYZ") < 0.2);
    }
}
