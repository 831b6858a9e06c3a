//! Storage quantity comparison

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Size in bytes, or `None` when the quantity is not a plain storage amount.
pub fn bytes(quantity: &Quantity) -> Option<f64> {
    let raw = quantity.0.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find(|(suffix, _)| raw.ends_with(suffix))
        .map(|(suffix, m)| (&raw[..raw.len() - suffix.len()], *m))
        .unwrap_or((raw, 1.0));

    number
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n * multiplier)
}

/// The larger of two optional quantities. An unparsable value loses to a
/// parsable one.
pub fn larger(a: Option<&Quantity>, b: Option<&Quantity>) -> Option<Quantity> {
    match (a, b) {
        (Some(a), Some(b)) => match (bytes(a), bytes(b)) {
            (Some(x), Some(y)) if y > x => Some(b.clone()),
            (None, Some(_)) => Some(b.clone()),
            _ => Some(a.clone()),
        },
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn test_bytes() {
        assert_eq!(bytes(&q("1Ki")), Some(1024.0));
        assert_eq!(bytes(&q("2G")), Some(2e9));
        assert_eq!(bytes(&q("1.5Gi")), Some(1.5 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(bytes(&q("100")), Some(100.0));
        assert_eq!(bytes(&q("lots")), None);
    }

    #[test]
    fn test_larger_mixes_units() {
        assert_eq!(larger(Some(&q("1Gi")), Some(&q("2G"))), Some(q("2G")));
        assert_eq!(larger(Some(&q("10Gi")), Some(&q("2G"))), Some(q("10Gi")));
        assert_eq!(larger(None, Some(&q("5Gi"))), Some(q("5Gi")));
        assert_eq!(larger(Some(&q("5Gi")), None), Some(q("5Gi")));
        assert_eq!(larger(None, None), None);
    }

    #[test]
    fn test_equal_keeps_first() {
        assert_eq!(larger(Some(&q("1024Mi")), Some(&q("1Gi"))), Some(q("1024Mi")));
    }
}
