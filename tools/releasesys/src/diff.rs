/*!
Change detection between two releases.

Flattens each release into a `key -> stringified value` table covering
every job property default (`<release>.<job>.<property>`) and every
configuration description attached to the release, then classifies the
union of keys into added, deleted, and changed.
*/

use crate::release::{Release, ReleaseSet};
use serde_json::Value;
use std::collections::BTreeMap;

/// The outcome of diffing two releases.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HashDiff {
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub changed: Vec<String>,
}

impl HashDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }
}

/// Diff release `a` against release `b`, keys present only in `a` being
/// reported as deleted. Output vectors are sorted, so two runs over the
/// same pair are identical.
pub fn diff_releases(set_a: &ReleaseSet, a: usize, set_b: &ReleaseSet, b: usize) -> HashDiff {
    let table_a = flatten(set_a.release(a));
    let table_b = flatten(set_b.release(b));

    let mut diff = HashDiff::default();
    for (key, value) in &table_a {
        match table_b.get(key) {
            None => diff.deleted.push(key.clone()),
            Some(other) if other != value => diff.changed.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in table_b.keys() {
        if !table_a.contains_key(key) {
            diff.added.push(key.clone());
        }
    }
    diff
}

fn flatten(release: &Release) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    for job in &release.jobs {
        for property in &job.properties {
            table.insert(
                format!("{}.{}.{}", release.name, job.name, property.name),
                stringify(&property.default),
            );
        }
    }
    for (name, description) in &release.configs {
        table.insert(name.clone(), description.clone());
    }
    table
}

/// Deterministic, order-independent stringification: mappings print with
/// sorted keys so two logically equal defaults always compare equal.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(stringify).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Object(entries) => {
            let mut sorted: Vec<(&String, &Value)> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = sorted
                .iter()
                .map(|(k, v)| format!("{}: {}", k, stringify(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixtures;
    use crate::ReleaseSet;
    use serde_json::json;

    #[test]
    fn stringify_is_order_independent_for_maps() {
        assert_eq!(
            stringify(&json!({"b": 1, "a": [1, "x"]})),
            stringify(&json!({"a": [1, "x"], "b": 1}))
        );
        assert_eq!(stringify(&Value::Null), "nil");
    }

    #[test]
    fn added_deleted_and_changed_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let old = fixtures::FinalRelease::new("rel")
            .package("p", &[])
            .job(
                "web",
                &["p"],
                &[
                    ("web.port", Some(json!(80))),
                    ("web.workers", Some(json!(2))),
                ],
            )
            .write(&dir.path().join("old"));
        let new = fixtures::FinalRelease::new("rel")
            .package("p", &[])
            .job(
                "web",
                &["p"],
                &[
                    ("web.port", Some(json!(8080))),
                    ("web.tls.cert", None),
                ],
            )
            .write(&dir.path().join("new"));

        let set_a = ReleaseSet::load(&[old.load_spec()]).unwrap();
        let set_b = ReleaseSet::load(&[new.load_spec()]).unwrap();
        let diff = diff_releases(&set_a, 0, &set_b, 0);

        assert_eq!(diff.added, vec!["rel.web.web.tls.cert".to_string()]);
        assert_eq!(diff.deleted, vec!["rel.web.web.workers".to_string()]);
        assert_eq!(diff.changed, vec!["rel.web.web.port".to_string()]);
    }

    #[test]
    fn identical_releases_produce_an_empty_diff() {
        let dir = tempfile::tempdir().unwrap();
        let rel = fixtures::FinalRelease::new("rel")
            .package("p", &[])
            .job("web", &["p"], &[("web.port", Some(json!(80)))])
            .write(dir.path());
        let set = ReleaseSet::load(&[rel.load_spec()]).unwrap();
        let diff = diff_releases(&set, 0, &set, 0);
        assert!(diff.is_empty());
    }
}
