//! The closed region catalog (§3 "Region catalog").
//!
//! Keys are the platform's canonical region names; values are the opaque two-letter
//! codes that participate in a canonical hostname. This table is exhaustive and
//! compile-time constant: an unknown region is a fatal configuration error at startup
//! (see `config::RuntimeConfig::new`) and a per-request 500 thereafter (see `proxy`).

const REGION_CATALOG: &[(&str, &str)] = &[
    ("us-central1", "uc"),
    ("us-east1", "ue"),
    ("us-east4", "uf"),
    ("us-east5", "ug"),
    ("us-south1", "us"),
    ("us-west1", "uw"),
    ("us-west2", "ux"),
    ("us-west3", "uy"),
    ("us-west4", "uz"),
    ("northamerica-northeast1", "na"),
    ("northamerica-northeast2", "nb"),
    ("southamerica-east1", "sa"),
    ("southamerica-west1", "sw"),
    ("europe-central2", "ec"),
    ("europe-north1", "en"),
    ("europe-southwest1", "es"),
    ("europe-west1", "ew"),
    ("europe-west2", "ex"),
    ("europe-west3", "ey"),
    ("europe-west4", "ez"),
    ("europe-west6", "ev"),
    ("europe-west8", "eh"),
    ("europe-west9", "ei"),
    ("europe-west10", "ej"),
    ("europe-west12", "ek"),
    ("asia-east1", "ae"),
    ("asia-east2", "ah"),
    ("asia-northeast1", "an"),
    ("asia-northeast2", "ao"),
    ("asia-northeast3", "ap"),
    ("asia-south1", "as"),
    ("asia-south2", "at"),
    ("asia-southeast1", "aq"),
    ("asia-southeast2", "ar"),
    ("australia-southeast1", "au"),
    ("australia-southeast2", "av"),
    ("me-central1", "mc"),
    ("me-central2", "md"),
    ("me-west1", "mw"),
    ("africa-south1", "af"),
];

/// Look up the short code for a canonical region name. `None` if the region is not in
/// the closed catalog.
pub fn lookup(region: &str) -> Option<&'static str> {
    REGION_CATALOG
        .iter()
        .find(|(name, _)| *name == region)
        .map(|(_, code)| *code)
}

/// Whether the catalog knows about this region at all. Used at startup to fail fast
/// (I2: "the region catalog's keyset is closed at build time; the system refuses to
/// start in a region it does not know").
pub fn is_known(region: &str) -> bool {
    lookup(region).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_region_resolves_to_two_letter_code() {
        assert_eq!(lookup("us-central1"), Some("uc"));
        assert_eq!(lookup("europe-west1"), Some("ew"));
    }

    #[test]
    fn unknown_region_is_a_miss() {
        assert_eq!(lookup("mars-north1"), None);
        assert!(!is_known("mars-north1"));
    }

    #[test]
    fn every_code_is_two_lowercase_ascii_letters() {
        for (region, code) in REGION_CATALOG {
            assert_eq!(code.len(), 2, "region {region} has a non-2-char code {code}");
            assert!(
                code.chars().all(|c| c.is_ascii_lowercase()),
                "region {region} code {code} is not lowercase ascii"
            );
        }
    }

    #[test]
    fn catalog_has_no_duplicate_codes() {
        let mut codes: Vec<&str> = REGION_CATALOG.iter().map(|(_, c)| *c).collect();
        codes.sort_unstable();
        let mut deduped = codes.clone();
        deduped.dedup();
        assert_eq!(codes.len(), deduped.len(), "duplicate region code in catalog");
    }

    #[test]
    fn catalog_has_no_duplicate_region_names() {
        let mut names: Vec<&str> = REGION_CATALOG.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len(), "duplicate region name in catalog");
    }
}
