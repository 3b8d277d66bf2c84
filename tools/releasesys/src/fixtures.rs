//! Builders that write miniature BOSH releases into a temp directory, so
//! loader and scheduler tests can run against the real on-disk layout.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::LoadSpec;

pub(crate) struct FinalRelease {
    name: String,
    packages: Vec<(String, Vec<String>)>,
    jobs: Vec<(String, Vec<String>, Vec<(String, Option<Value>)>)>,
    license_entries: Vec<(String, Vec<u8>)>,
}

pub(crate) struct WrittenRelease {
    pub(crate) path: PathBuf,
    pub(crate) cache_dir: PathBuf,
}

impl WrittenRelease {
    pub(crate) fn load_spec(&self) -> LoadSpec {
        LoadSpec::new(&self.path, &self.cache_dir)
    }
}

impl FinalRelease {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            packages: Vec::new(),
            jobs: Vec::new(),
            license_entries: Vec::new(),
        }
    }

    pub(crate) fn package(mut self, name: &str, dependencies: &[&str]) -> Self {
        self.packages.push((
            name.to_string(),
            dependencies.iter().map(|d| d.to_string()).collect(),
        ));
        self
    }

    pub(crate) fn job(
        mut self,
        name: &str,
        packages: &[&str],
        properties: &[(&str, Option<Value>)],
    ) -> Self {
        self.jobs.push((
            name.to_string(),
            packages.iter().map(|p| p.to_string()).collect(),
            properties
                .iter()
                .map(|(n, v)| (n.to_string(), v.clone()))
                .collect(),
        ));
        self
    }

    pub(crate) fn license_archive(mut self, entries: &[(&str, &[u8])]) -> Self {
        self.license_entries = entries
            .iter()
            .map(|(n, c)| (n.to_string(), c.to_vec()))
            .collect();
        self
    }

    pub(crate) fn write(self, root: &Path) -> WrittenRelease {
        let release_dir = root.join(&self.name);
        let cache_dir = root.join("tarball-cache");
        fs::create_dir_all(release_dir.join("jobs")).unwrap();
        fs::create_dir_all(release_dir.join("packages")).unwrap();
        fs::create_dir_all(&cache_dir).unwrap();

        let mut package_entries = Vec::new();
        for (name, dependencies) in &self.packages {
            let tarball = release_dir.join("packages").join(format!("{}.tgz", name));
            let sha1 = write_tarball(&tarball, &[("packaging", b"echo compile")]);
            package_entries.push(manifest_package(name, dependencies, &sha1));
        }

        let mut job_entries = Vec::new();
        for (name, packages, properties) in &self.jobs {
            write_job(&release_dir, name, packages, properties);
            job_entries.push(serde_yaml::to_value(BTreeMap::from([
                ("name", name.clone()),
                ("version", "1".to_string()),
            ]))
            .unwrap());
        }

        let manifest = serde_yaml::to_string(&serde_yaml::Value::Mapping(
            [
                (yaml("name"), yaml(&self.name)),
                (yaml("version"), yaml("1.0")),
                (yaml("commit_hash"), yaml("0000000")),
                (
                    yaml("jobs"),
                    serde_yaml::Value::Sequence(job_entries),
                ),
                (
                    yaml("packages"),
                    serde_yaml::Value::Sequence(package_entries),
                ),
            ]
            .into_iter()
            .collect(),
        ))
        .unwrap();
        fs::write(release_dir.join("release.MF"), manifest).unwrap();

        if !self.license_entries.is_empty() {
            let entries: Vec<(&str, &[u8])> = self
                .license_entries
                .iter()
                .map(|(n, c)| (n.as_str(), c.as_slice()))
                .collect();
            write_tarball(&release_dir.join("license.tgz"), &entries);
        }

        WrittenRelease {
            path: release_dir,
            cache_dir,
        }
    }
}

pub(crate) struct DevRelease {
    name: String,
    versions: Vec<String>,
    packages: Vec<(String, Vec<String>)>,
}

impl DevRelease {
    pub(crate) fn new(name: &str, versions: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            versions: versions.iter().map(|v| v.to_string()).collect(),
            packages: Vec::new(),
        }
    }

    pub(crate) fn package(mut self, name: &str, dependencies: &[&str]) -> Self {
        self.packages.push((
            name.to_string(),
            dependencies.iter().map(|d| d.to_string()).collect(),
        ));
        self
    }

    pub(crate) fn write(self, root: &Path) -> WrittenRelease {
        let release_dir = root.join(&self.name);
        let cache_dir = root.join("tarball-cache");
        let index_dir = release_dir.join("dev_releases").join(&self.name);
        fs::create_dir_all(&index_dir).unwrap();
        fs::create_dir_all(release_dir.join("jobs")).unwrap();
        fs::create_dir_all(release_dir.join("packages")).unwrap();
        fs::create_dir_all(&cache_dir).unwrap();

        let mut package_entries = Vec::new();
        for (name, dependencies) in &self.packages {
            let tarball = release_dir.join("packages").join(format!("{}.tgz", name));
            let sha1 = write_tarball(&tarball, &[("packaging", b"echo compile")]);
            package_entries.push(manifest_package(name, dependencies, &sha1));
        }

        let mut builds = BTreeMap::new();
        for (i, version) in self.versions.iter().enumerate() {
            builds.insert(
                format!("build-{}", i),
                BTreeMap::from([("version", version.clone())]),
            );
            let manifest = serde_yaml::to_string(&serde_yaml::Value::Mapping(
                [
                    (yaml("name"), yaml(&self.name)),
                    (yaml("version"), yaml(version)),
                    (
                        yaml("packages"),
                        serde_yaml::Value::Sequence(package_entries.clone()),
                    ),
                ]
                .into_iter()
                .collect(),
            ))
            .unwrap();
            fs::write(
                index_dir.join(format!("{}-{}.yml", self.name, version)),
                manifest,
            )
            .unwrap();
        }
        let index = serde_yaml::to_string(&BTreeMap::from([("builds", builds)])).unwrap();
        fs::write(index_dir.join("index.yml"), index).unwrap();

        WrittenRelease {
            path: release_dir,
            cache_dir,
        }
    }
}

fn yaml(s: &str) -> serde_yaml::Value {
    serde_yaml::Value::String(s.to_string())
}

fn manifest_package(name: &str, dependencies: &[String], sha1: &str) -> serde_yaml::Value {
    serde_yaml::Value::Mapping(
        [
            (yaml("name"), yaml(name)),
            (yaml("version"), yaml("1")),
            (yaml("sha1"), yaml(sha1)),
            (
                yaml("dependencies"),
                serde_yaml::Value::Sequence(dependencies.iter().map(|d| yaml(d)).collect()),
            ),
        ]
        .into_iter()
        .collect(),
    )
}

fn write_job(
    release_dir: &Path,
    name: &str,
    packages: &[String],
    properties: &[(String, Option<Value>)],
) {
    let job_dir = release_dir.join("jobs").join(name);
    let templates_dir = job_dir.join("templates");
    fs::create_dir_all(&templates_dir).unwrap();

    let template_source = format!("{}.conf.erb", name);
    fs::write(
        templates_dir.join(&template_source),
        format!("config for {}", name),
    )
    .unwrap();

    let mut property_map = serde_yaml::Mapping::new();
    for (property_name, default) in properties {
        let mut spec = serde_yaml::Mapping::new();
        spec.insert(yaml("description"), yaml(""));
        if let Some(default) = default {
            spec.insert(
                yaml("default"),
                serde_yaml::to_value(default.clone()).unwrap(),
            );
        }
        property_map.insert(yaml(property_name), serde_yaml::Value::Mapping(spec));
    }

    let job_spec = serde_yaml::Value::Mapping(
        [
            (yaml("name"), yaml(name)),
            (yaml("description"), yaml("test job")),
            (
                yaml("templates"),
                serde_yaml::Value::Mapping(
                    [(
                        yaml(&template_source),
                        yaml(&format!("/etc/{}.conf", name)),
                    )]
                    .into_iter()
                    .collect(),
                ),
            ),
            (
                yaml("packages"),
                serde_yaml::Value::Sequence(packages.iter().map(|p| yaml(p)).collect()),
            ),
            (yaml("properties"), serde_yaml::Value::Mapping(property_map)),
        ]
        .into_iter()
        .collect(),
    );
    fs::write(
        job_dir.join("job.MF"),
        serde_yaml::to_string(&job_spec).unwrap(),
    )
    .unwrap();
}

/// Write a `.tgz` with the given entries and return the file's SHA-1.
pub(crate) fn write_tarball(path: &Path, entries: &[(&str, &[u8])]) -> String {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    let bytes = builder.into_inner().unwrap().finish().unwrap();
    fs::write(path, &bytes).unwrap();

    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}
