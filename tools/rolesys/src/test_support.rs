//! In-memory release fixtures shared by the manifest, validator, and
//! resolver tests.

use releasesys::{Job, Package, PackageId, Release, ReleaseSet, SpecProperty, Template};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) fn package(release: usize, name: &str) -> Package {
    Package {
        name: name.to_string(),
        version: "1".to_string(),
        fingerprint: format!("sha-{}", name),
        path: PathBuf::from(format!("/nonexistent/{}.tgz", name)),
        dependencies: Vec::new(),
        release,
    }
}

pub(crate) fn job(
    release: usize,
    name: &str,
    packages: Vec<PackageId>,
    properties: &[(&str, Value)],
) -> Job {
    Job {
        name: name.to_string(),
        version: "1".to_string(),
        description: String::new(),
        fingerprint: format!("fp-{}", name),
        templates: vec![Template {
            source: format!("{}.conf.erb", name),
            destination: format!("/etc/{}.conf", name),
            content: format!("config for {}", name),
        }],
        properties: properties
            .iter()
            .map(|(property_name, default)| SpecProperty {
                name: property_name.to_string(),
                description: String::new(),
                default: default.clone(),
            })
            .collect(),
        packages,
        release,
    }
}

fn release(name: &str, jobs: Vec<Job>, packages: Vec<Package>) -> Release {
    Release {
        name: name.to_string(),
        version: "1.0".to_string(),
        commit_hash: String::new(),
        uncommitted_changes: false,
        path: PathBuf::from(format!("/nonexistent/{}", name)),
        tarball_cache: PathBuf::from("/nonexistent/cache"),
        jobs,
        packages,
        license_files: BTreeMap::new(),
        configs: BTreeMap::new(),
    }
}

/// Two releases: `app` (jobs `web`, `worker`; package `server`) and
/// `base` (job `proxy`; package `libuv`). `uaa.clients` is a nil-default
/// hash-shaped property; `web.port` has differing defaults across jobs.
pub(crate) fn two_release_set() -> ReleaseSet {
    let server = PackageId {
        release: 0,
        package: 0,
    };
    let libuv = PackageId {
        release: 1,
        package: 0,
    };
    let app = release(
        "app",
        vec![
            job(
                0,
                "web",
                vec![server],
                &[
                    ("web.port", json!(80)),
                    ("uaa.clients", Value::Null),
                    ("tor.hostname", json!("localhost")),
                ],
            ),
            job(
                0,
                "worker",
                Vec::new(),
                &[("web.port", json!(8080)), ("worker.threads", json!(4))],
            ),
        ],
        vec![package(0, "server")],
    );
    let base = release(
        "base",
        vec![job(1, "proxy", vec![libuv], &[("proxy.host", json!("localhost"))])],
        vec![package(1, "libuv")],
    );
    ReleaseSet::from_releases(vec![app, base]).unwrap()
}

pub(crate) fn write_manifest(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("role-manifest.yml");
    fs::write(&path, text).unwrap();
    path
}

pub(crate) fn opinions(light: &str, dark: &str) -> crate::Opinions {
    crate::Opinions::from_values(
        &serde_yaml::from_str(light).unwrap(),
        &serde_yaml::from_str(dark).unwrap(),
    )
    .unwrap()
}
