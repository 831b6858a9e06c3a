//! Label selection shared by the cluster-backed and in-memory stores

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selector(LabelSelector);

impl Selector {
    /// Matches every object.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_labels(labels: BTreeMap<String, String>) -> Self {
        Self(LabelSelector {
            match_labels: Some(labels),
            match_expressions: None,
        })
    }

    pub fn from_label_selector(selector: &LabelSelector) -> Self {
        Self(selector.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.0.match_labels.as_ref().map_or(true, BTreeMap::is_empty)
            && self.0.match_expressions.as_ref().map_or(true, Vec::is_empty)
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let empty = BTreeMap::new();
        let labels = labels.unwrap_or(&empty);

        let labels_ok = self
            .0
            .match_labels
            .iter()
            .flatten()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_ok
            && self
                .0
                .match_expressions
                .iter()
                .flatten()
                .all(|req| requirement_matches(req, labels))
    }

    /// Query-string form understood by the API server's `labelSelector` parameter.
    pub fn to_query(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut terms: Vec<String> = self
            .0
            .match_labels
            .iter()
            .flatten()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        for req in self.0.match_expressions.iter().flatten() {
            let values = req.values.clone().unwrap_or_default().join(",");
            let term = match req.operator.as_str() {
                "In" => format!("{} in ({values})", req.key),
                "NotIn" => format!("{} notin ({values})", req.key),
                "Exists" => req.key.clone(),
                "DoesNotExist" => format!("!{}", req.key),
                _ => continue,
            };
            terms.push(term);
        }

        Some(terms.join(","))
    }
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&req.key);
    let in_values = |v: &String| req.values.iter().flatten().any(|candidate| candidate == v);

    match req.operator.as_str() {
        "In" => value.is_some_and(in_values),
        "NotIn" => !value.is_some_and(in_values),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        // Unknown operators select nothing.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: (!values.is_empty()).then(|| values.iter().map(|v| v.to_string()).collect()),
        }
    }

    #[test]
    fn test_everything_matches_unlabelled() {
        assert!(Selector::everything().matches(None));
        assert_eq!(Selector::everything().to_query(), None);
    }

    #[test]
    fn test_match_labels() {
        let sel = Selector::from_labels(labels(&[("volumereplicationgroups-owner", "vrg-app")]));
        assert!(sel.matches(Some(&labels(&[
            ("volumereplicationgroups-owner", "vrg-app"),
            ("extra", "x")
        ]))));
        assert!(!sel.matches(Some(&labels(&[("volumereplicationgroups-owner", "other")]))));
        assert!(!sel.matches(None));
    }

    #[test]
    fn test_match_expressions() {
        let sel = Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                requirement("tier", "In", &["gold", "silver"]),
                requirement("legacy", "DoesNotExist", &[]),
            ]),
        });
        assert!(sel.matches(Some(&labels(&[("tier", "gold")]))));
        assert!(!sel.matches(Some(&labels(&[("tier", "bronze")]))));
        assert!(!sel.matches(Some(&labels(&[("tier", "gold"), ("legacy", "1")]))));
    }

    #[test]
    fn test_query_rendering() {
        let sel = Selector::from_label_selector(&LabelSelector {
            match_labels: Some(labels(&[("a", "1")])),
            match_expressions: Some(vec![
                requirement("b", "NotIn", &["x", "y"]),
                requirement("c", "Exists", &[]),
            ]),
        });
        assert_eq!(sel.to_query().as_deref(), Some("a=1,b notin (x,y),c"));
    }
}
