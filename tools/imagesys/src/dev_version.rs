/*!
Content hashes for instance groups and the shared packages layer.

The dev version of an instance group covers every input that affects what
ends up running: the group's identity and tags, the fingerprints of its
jobs and of every required package in dependency order, script and
template contents, the group's own configuration templates, whichever
opinions touch the group's property namespace, and the stemcell. Anything
else, a job description or a file's modification time, must leave the hash
alone.
*/

use canonical_hash::Encoder;
use releasesys::{PackageId, ReleaseSet};
use rolesys::{GroupType, InstanceGroup, Opinions};
use std::collections::BTreeSet;

/// Every package the group needs at runtime, dependencies first.
pub fn group_packages(set: &ReleaseSet, group: &InstanceGroup) -> Vec<PackageId> {
    let roots: Vec<PackageId> = group
        .jobs
        .iter()
        .flat_map(|reference| set.job(reference.job_id).packages.iter().copied())
        .collect();
    set.package_closure(&roots)
}

fn group_type_token(group_type: GroupType) -> &'static str {
    match group_type {
        GroupType::LongRunning => "long-running",
        GroupType::OneShotTask => "one-shot-task",
        GroupType::StopOnFailureTask => "stop-on-failure-task",
    }
}

/// The deterministic hex tag under which the group's image is known.
pub fn instance_group_dev_version(
    set: &ReleaseSet,
    group: &InstanceGroup,
    opinions: &Opinions,
    stemcell: &str,
) -> String {
    let mut enc = Encoder::new();
    enc.str(&group.name);
    enc.str(group_type_token(group.group_type));

    let mut tags: Vec<&String> = group.tags.iter().collect();
    tags.sort();
    enc.seq(tags.len());
    for tag in tags {
        enc.str(tag);
    }

    enc.seq(group.jobs.len());
    for reference in &group.jobs {
        enc.str(&set.job(reference.job_id).fingerprint);
    }

    let packages = group_packages(set, group);
    enc.seq(packages.len());
    for id in &packages {
        enc.str(&set.package(*id).fingerprint);
    }

    let scripts: Vec<_> = group.all_scripts().collect();
    enc.seq(scripts.len());
    for script in scripts {
        enc.str(&script.path).str(&script.content);
    }

    let templates: Vec<_> = group
        .jobs
        .iter()
        .flat_map(|reference| set.job(reference.job_id).templates.iter())
        .collect();
    enc.seq(templates.len());
    for template in templates {
        enc.str(&template.source)
            .str(&template.destination)
            .str(&template.content);
    }

    enc.map(group.templates.len());
    for (key, value) in &group.templates {
        enc.str(key).value(value);
    }

    let namespace = property_namespace(set, group);
    let light: Vec<_> = opinions
        .light()
        .iter()
        .filter(|(path, _)| affects(&namespace, path))
        .collect();
    enc.map(light.len());
    for (path, value) in light {
        enc.str(path).value(value);
    }
    let dark: Vec<_> = opinions
        .dark()
        .keys()
        .filter(|path| affects(&namespace, path))
        .collect();
    enc.seq(dark.len());
    for path in dark {
        enc.str(path);
    }

    enc.str(stemcell);
    enc.finish()
}

/// The hash of the shared packages layer: every compiled package any of
/// the selected groups reference, plus the stemcell.
pub fn packages_layer_version(
    set: &ReleaseSet,
    groups: &[&InstanceGroup],
    stemcell: &str,
) -> String {
    let mut fingerprints = BTreeSet::new();
    for group in groups {
        for id in group_packages(set, group) {
            fingerprints.insert(set.package(id).fingerprint.clone());
        }
    }

    let mut enc = Encoder::new();
    enc.seq(fingerprints.len());
    for fingerprint in &fingerprints {
        enc.str(fingerprint);
    }
    enc.str(stemcell);
    enc.finish()
}

/// Dotted property names the group's jobs declare.
fn property_namespace(set: &ReleaseSet, group: &InstanceGroup) -> BTreeSet<String> {
    group
        .jobs
        .iter()
        .flat_map(|reference| {
            set.job(reference.job_id)
                .properties
                .iter()
                .map(|p| p.name.clone())
        })
        .collect()
}

/// An opinion affects the group when its path, or any ancestor of it, is
/// one of the group's properties. The ancestor case covers children of
/// hash-shaped properties.
fn affects(namespace: &BTreeSet<String>, path: &str) -> bool {
    if namespace.contains(path) {
        return true;
    }
    let mut current = path;
    while let Some(split) = current.rfind('.') {
        current = &current[..split];
        if namespace.contains(current) {
            return true;
        }
    }
    false
}
