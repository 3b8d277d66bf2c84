/*!
Effective job configuration.

Composes, for one job in one instance group, the configuration object the
container reads at start time: release defaults first, then the light
opinions, then the manifest templates (global, then per-group), and
finally the dark opinions are carved out. The result is the JSON envelope
`{job, properties, networks}`; [`canonical_json_bytes`] renders it with a
canonical formatter so byte-identical inputs produce byte-identical
configs.
*/

use crate::error;
use crate::manifest::{InstanceGroup, RoleManifest};
use crate::opinions::Opinions;
use crate::property_path;
use crate::Result;
use olpc_cjson::CanonicalFormatter;
use releasesys::{JobId, ReleaseSet};
use serde::Serialize;
use serde_json::{json, Map, Value};
use snafu::ResultExt;
use std::collections::{BTreeMap, BTreeSet};

/// Produce the effective configuration envelope for `job_id` as deployed
/// by `group`.
pub fn job_config(
    set: &ReleaseSet,
    manifest: &RoleManifest,
    group: &InstanceGroup,
    job_id: JobId,
    opinions: &Opinions,
) -> Result<Value> {
    let release = set.release(job_id.release);

    // The property namespace of the job's release: first declaration of a
    // name wins, and nil or mapping defaults mark the name hash-shaped.
    let mut defaults: BTreeMap<&str, &Value> = BTreeMap::new();
    let mut maybe_hash: BTreeSet<&str> = BTreeSet::new();
    for job in &release.jobs {
        for property in &job.properties {
            defaults.entry(&property.name).or_insert(&property.default);
            if property.default.is_null() || property.default.is_object() {
                maybe_hash.insert(&property.name);
            }
        }
    }

    let mut properties = Value::Object(Map::new());

    // Release defaults. A nil-default hash-shaped property is a
    // placeholder for children supplied elsewhere, not a leaf.
    for (path, default) in &defaults {
        if default.is_null() && maybe_hash.contains(path) {
            continue;
        }
        deep_set(&mut properties, path, (*default).clone())?;
    }

    // Light opinions, skipping masked paths, paths outside this release's
    // namespace, and placeholder terminals.
    for (path, value) in opinions.light() {
        if opinions.masked(path) {
            continue;
        }
        if !in_namespace(&defaults, &maybe_hash, path) {
            continue;
        }
        if let Some(default) = defaults.get(path.as_str()) {
            if default.is_null() && maybe_hash.contains(path.as_str()) {
                continue;
            }
        }
        deep_set(&mut properties, path, value.clone())?;
    }

    // Manifest templates: global scope, then the group's own overrides.
    for (key, value) in manifest.templates.iter().chain(group.templates.iter()) {
        if let Some(path) = property_path(key) {
            deep_set(&mut properties, path, value.clone())?;
        }
    }

    // Dark opinions are never given a build-time value.
    for path in opinions.dark().keys() {
        deep_delete(&mut properties, path);
    }

    let templates: Vec<Value> = group
        .jobs
        .iter()
        .map(|j| json!({ "name": j.job_name }))
        .collect();
    Ok(json!({
        "job": {
            "name": set.job(job_id).name,
            "templates": templates,
        },
        "properties": properties,
        "networks": { "default": {} },
    }))
}

/// Serialize with the canonical formatter: sorted keys, no insignificant
/// whitespace, stable bytes.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
    value
        .serialize(&mut ser)
        .context(error::ConfigSerializeSnafu)?;
    Ok(buf)
}

/// Whether a dotted path belongs to the release's property namespace:
/// declared outright, or under a hash-shaped ancestor.
fn in_namespace(
    defaults: &BTreeMap<&str, &Value>,
    maybe_hash: &BTreeSet<&str>,
    path: &str,
) -> bool {
    if defaults.contains_key(path) {
        return true;
    }
    let mut current = path;
    while let Some(split) = current.rfind('.') {
        current = &current[..split];
        if maybe_hash.contains(current) {
            return true;
        }
    }
    false
}

/// Set `value` at the dotted `path`, creating intermediate mappings.
/// Descending through an existing non-mapping is a type mismatch: the
/// shapes disagree and silently clobbering either would hide the bug.
fn deep_set(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let parent = segments[..i].join(".");
        let entries = current
            .as_object_mut()
            .ok_or_else(|| error::Error::TypeMismatch {
                path: path.to_string(),
                parent: if parent.is_empty() {
                    "properties".to_string()
                } else {
                    parent
                },
                found: "a non-mapping value".to_string(),
            })?;
        if i == segments.len() - 1 {
            entries.insert(segment.to_string(), value);
            return Ok(());
        }
        current = entries
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

/// Delete the leaf at the dotted `path`. Missing intermediates are fine:
/// a dark opinion may mask a property nothing ever set.
fn deep_delete(root: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        match current.get_mut(*segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(entries) = current.as_object_mut() {
        entries.remove(*segments.last().unwrap_or(&""));
    }
}
