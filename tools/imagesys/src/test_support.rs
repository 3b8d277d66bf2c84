//! In-memory fixtures shared by the dev-version and planner tests.

use releasesys::{Job, Package, PackageId, Release, ReleaseSet, SpecProperty, Template};
use rolesys::{GroupType, InstanceGroup, JobReference, Opinions, RoleManifest, Script};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One release `app`: package `libuv`, package `server` (depends on
/// `libuv`), and job `web` requiring `server`.
pub(crate) fn release_set() -> ReleaseSet {
    let libuv = PackageId {
        release: 0,
        package: 0,
    };
    let server = PackageId {
        release: 0,
        package: 1,
    };
    let package = |name: &str, dependencies: Vec<PackageId>| Package {
        name: name.to_string(),
        version: "1".to_string(),
        fingerprint: format!("{}-fp", name),
        path: PathBuf::from(format!("/nonexistent/{}.tgz", name)),
        dependencies,
        release: 0,
    };
    let release = Release {
        name: "app".to_string(),
        version: "1.0".to_string(),
        commit_hash: String::new(),
        uncommitted_changes: false,
        path: PathBuf::from("/nonexistent/app"),
        tarball_cache: PathBuf::from("/nonexistent/cache"),
        jobs: vec![Job {
            name: "web".to_string(),
            version: "1".to_string(),
            description: "the web frontend".to_string(),
            fingerprint: "web-job-fp".to_string(),
            templates: vec![Template {
                source: "web.conf.erb".to_string(),
                destination: "/etc/web.conf".to_string(),
                content: "listen <%= p('web.port') %>".to_string(),
            }],
            properties: vec![
                SpecProperty {
                    name: "web.port".to_string(),
                    description: String::new(),
                    default: json!(80),
                },
                SpecProperty {
                    name: "uaa.clients".to_string(),
                    description: String::new(),
                    default: Value::Null,
                },
            ],
            packages: vec![server],
            release: 0,
        }],
        packages: vec![package("libuv", Vec::new()), package("server", vec![libuv])],
        license_files: BTreeMap::new(),
        configs: BTreeMap::new(),
    };
    ReleaseSet::from_releases(vec![release]).unwrap()
}

/// A single long-running group `front` carrying the `web` job.
pub(crate) fn group(set: &ReleaseSet) -> InstanceGroup {
    InstanceGroup {
        name: "front".to_string(),
        group_type: GroupType::LongRunning,
        jobs: vec![JobReference {
            release_name: "app".to_string(),
            job_name: "web".to_string(),
            job_id: set.find_job("app", "web").unwrap(),
        }],
        templates: BTreeMap::new(),
        scripts: vec![Script {
            path: "scripts/run.sh".to_string(),
            content: "#!/bin/sh\nexec web\n".to_string(),
        }],
        environment_scripts: Vec::new(),
        post_config_scripts: Vec::new(),
        tags: Vec::new(),
        volumes: Vec::new(),
    }
}

pub(crate) fn manifest(set: &ReleaseSet) -> RoleManifest {
    RoleManifest {
        path: PathBuf::from("/nonexistent/role-manifest.yml"),
        instance_groups: vec![group(set)],
        templates: BTreeMap::new(),
        variables: Vec::new(),
        authorization: BTreeMap::new(),
    }
}

pub(crate) fn opinions(light: &str, dark: &str) -> Opinions {
    Opinions::from_values(
        &serde_yaml::from_str(light).unwrap(),
        &serde_yaml::from_str(dark).unwrap(),
    )
    .unwrap()
}
