/*!
Opinion files.

The light opinions carry preferred default values that override the
release-shipped defaults; the dark opinions list property paths that must
be supplied at runtime and never receive a build-time default. Both files
are YAML trees rooted at a `properties:` key; they are flattened once into
dotted-path maps and queried from there.
*/

use crate::error;
use crate::Result;
use canonical_hash::to_canonical_value;
use serde_json::Value;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct Opinions {
    light: BTreeMap<String, Value>,
    dark: BTreeMap<String, Value>,
}

impl Opinions {
    /// Load and flatten the light/dark opinion pair.
    pub fn load(light_path: impl AsRef<Path>, dark_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            light: flatten_file(light_path.as_ref())?,
            dark: flatten_file(dark_path.as_ref())?,
        })
    }

    /// Build from already-parsed documents; used when the opinions come
    /// from somewhere other than a pair of files.
    pub fn from_values(
        light: &serde_yaml::Value,
        dark: &serde_yaml::Value,
    ) -> Result<Self> {
        Ok(Self {
            light: flatten(light)?,
            dark: flatten(dark)?,
        })
    }

    /// The `(masked, value)` query: whether the path must be supplied at
    /// runtime, and the light value when one exists.
    pub fn get(&self, path: &str) -> (bool, Option<&Value>) {
        (self.masked(path), self.light.get(path))
    }

    pub fn masked(&self, path: &str) -> bool {
        self.dark.contains_key(path)
    }

    pub fn light_value(&self, path: &str) -> Option<&Value> {
        self.light.get(path)
    }

    pub fn light(&self) -> &BTreeMap<String, Value> {
        &self.light
    }

    pub fn dark(&self) -> &BTreeMap<String, Value> {
        &self.dark
    }
}

fn flatten_file(path: &Path) -> Result<BTreeMap<String, Value>> {
    let text = fs::read_to_string(path).context(error::FileReadSnafu {
        path: PathBuf::from(path),
    })?;
    let root: serde_yaml::Value = serde_yaml::from_str(&text).context(error::ManifestParseSnafu {
        path: PathBuf::from(path),
    })?;
    flatten(&root)
}

/// Flatten the subtree under the top-level `properties:` key by DFS with
/// path accumulation. A non-empty mapping recurses; everything below the
/// root, including an explicit nil and an empty mapping, is a leaf.
fn flatten(root: &serde_yaml::Value) -> Result<BTreeMap<String, Value>> {
    let mut flattened = BTreeMap::new();
    if let Some(serde_yaml::Value::Mapping(entries)) = root.get("properties") {
        for (key, value) in entries {
            walk(value, key_string(key), &mut flattened)?;
        }
    }
    Ok(flattened)
}

fn key_string(key: &serde_yaml::Value) -> String {
    key.as_str().map(String::from).unwrap_or_else(|| {
        serde_yaml::to_string(key)
            .unwrap_or_default()
            .trim()
            .to_string()
    })
}

fn walk(
    node: &serde_yaml::Value,
    prefix: String,
    out: &mut BTreeMap<String, Value>,
) -> Result<()> {
    match node {
        serde_yaml::Value::Mapping(entries) if !entries.is_empty() => {
            for (key, value) in entries {
                let path = format!("{}.{}", prefix, key_string(key));
                walk(value, path, out)?;
            }
        }
        _ => {
            let value = to_canonical_value(node).context(error::ValueEncodingSnafu {
                path: prefix.clone(),
            })?;
            out.insert(prefix, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn opinions(light: &str, dark: &str) -> Opinions {
        Opinions::from_values(
            &serde_yaml::from_str(light).unwrap(),
            &serde_yaml::from_str(dark).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn nested_trees_flatten_to_dotted_paths() {
        let opinions = opinions(
            r#"
properties:
  tor:
    hostname: localhost
    client:
      retries: 3
"#,
            "properties: {}",
        );
        assert_eq!(opinions.light_value("tor.hostname"), Some(&json!("localhost")));
        assert_eq!(opinions.light_value("tor.client.retries"), Some(&json!(3)));
        assert_eq!(opinions.light_value("tor"), None);
    }

    #[test]
    fn dark_paths_are_masked() {
        let opinions = opinions(
            "properties: {}",
            r#"
properties:
  tor:
    private_key: ~
"#,
        );
        let (masked, value) = opinions.get("tor.private_key");
        assert!(masked);
        assert!(value.is_none());
        assert!(!opinions.masked("tor.hostname"));
    }

    #[test]
    fn nil_and_empty_map_leaves_survive_flattening() {
        let opinions = opinions(
            r#"
properties:
  empty_map: {}
  nothing: ~
"#,
            "properties: {}",
        );
        assert_eq!(opinions.light_value("empty_map"), Some(&json!({})));
        assert_eq!(opinions.light_value("nothing"), Some(&Value::Null));
    }

    #[test]
    fn missing_properties_root_is_empty() {
        let opinions = opinions("other: {x: 1}", "{}");
        assert!(opinions.light().is_empty());
    }
}
