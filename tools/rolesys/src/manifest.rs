/*!
Role manifest parsing and linking.

The document is deserialized into an unvalidated form first, then linked
against the loaded release set: every (release, job) reference must
resolve, scripts are read relative to the manifest file, and template
values are normalized into their canonical form.
*/

use crate::error;
use crate::Result;
use canonical_hash::to_canonical_value;
use log::debug;
use releasesys::{JobId, ReleaseSet};
use serde::Deserialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// What an instance group is for, which decides the downstream artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GroupType {
    /// A long-running service.
    #[default]
    LongRunning,
    /// A task that runs to completion once.
    OneShotTask,
    /// A task whose failure must stop the rollout.
    StopOnFailureTask,
}

/// The deployable artifact an instance group maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Single pod with restart-on-failure disabled.
    Task,
    /// Replicated deployment.
    Deployment,
    /// Stateful deployment, for groups with storage or a clustered or
    /// indexed tag.
    StatefulSet,
    /// Single pod that surfaces the failure exit code.
    StopOnFailureTask,
}

/// A (release, job) pair naming one job an instance group runs.
#[derive(Debug, Clone)]
pub struct JobReference {
    pub release_name: String,
    pub job_name: String,
    /// Resolved at load time; always valid for a loaded manifest.
    pub job_id: JobId,
}

/// A script carried by an instance group, with its contents loaded at
/// manifest load time so later consumers never touch the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VolumeDeclaration {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub required: bool,
}

/// A deployable unit bundling one or more jobs with run-time metadata.
#[derive(Debug)]
pub struct InstanceGroup {
    pub name: String,
    pub group_type: GroupType,
    /// Ordered job references, possibly across releases.
    pub jobs: Vec<JobReference>,
    /// Per-group configuration template overrides.
    pub templates: BTreeMap<String, Value>,
    pub scripts: Vec<Script>,
    pub environment_scripts: Vec<Script>,
    pub post_config_scripts: Vec<Script>,
    /// Free-form markers.
    pub tags: Vec<String>,
    pub volumes: Vec<VolumeDeclaration>,
}

impl InstanceGroup {
    /// The artifact this group produces at manifest-emit time.
    pub fn artifact_kind(&self) -> ArtifactKind {
        match self.group_type {
            GroupType::OneShotTask => ArtifactKind::Task,
            GroupType::StopOnFailureTask => ArtifactKind::StopOnFailureTask,
            GroupType::LongRunning => {
                let clustered = self
                    .tags
                    .iter()
                    .any(|t| t == "clustered" || t == "indexed");
                if clustered || !self.volumes.is_empty() {
                    ArtifactKind::StatefulSet
                } else {
                    ArtifactKind::Deployment
                }
            }
        }
    }

    /// Every script in the order they run: environment, then run, then
    /// post-configuration.
    pub fn all_scripts(&self) -> impl Iterator<Item = &Script> {
        self.environment_scripts
            .iter()
            .chain(self.scripts.iter())
            .chain(self.post_config_scripts.iter())
    }
}

/// The orchestration document, fully linked against a release set.
#[derive(Debug)]
pub struct RoleManifest {
    pub path: PathBuf,
    pub instance_groups: Vec<InstanceGroup>,
    /// Global configuration templates.
    pub templates: BTreeMap<String, Value>,
    pub variables: Vec<VariableDefinition>,
    /// Authorization blocks, carried through for downstream emitters.
    pub authorization: BTreeMap<String, Value>,
}

impl RoleManifest {
    /// Load the manifest at `path` and link it against `set`. Fails when
    /// any job reference does not resolve or any script file is missing.
    pub fn load(path: impl AsRef<Path>, set: &ReleaseSet) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).context(error::FileReadSnafu {
            path: path.to_path_buf(),
        })?;
        let raw: RawRoleManifest =
            serde_yaml::from_str(&text).context(error::ManifestParseSnafu {
                path: path.to_path_buf(),
            })?;
        let manifest = raw.link(path, set)?;
        debug!(
            "Loaded role manifest '{}' with {} instance groups",
            path.display(),
            manifest.instance_groups.len()
        );
        Ok(manifest)
    }

    pub fn find_instance_group(&self, name: &str) -> Option<&InstanceGroup> {
        self.instance_groups.iter().find(|g| g.name == name)
    }

    /// Select the named groups, or every group when `names` is empty.
    pub fn select_instance_groups(&self, names: &[String]) -> Result<Vec<&InstanceGroup>> {
        if names.is_empty() {
            return Ok(self.instance_groups.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.find_instance_group(name)
                    .context(error::ManifestInvalidSnafu {
                        path: self.path.clone(),
                        reason: format!("instance group '{}' is not defined", name),
                    })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawRoleManifest {
    #[serde(default)]
    instance_groups: Vec<RawInstanceGroup>,
    #[serde(default)]
    configuration: RawConfiguration,
    #[serde(default)]
    variables: Vec<VariableDefinition>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfiguration {
    #[serde(default)]
    templates: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    authorization: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawInstanceGroup {
    name: String,
    #[serde(rename = "type", default)]
    group_type: GroupType,
    #[serde(default)]
    jobs: Vec<RawJobReference>,
    #[serde(default)]
    configuration: RawGroupConfiguration,
    #[serde(default)]
    scripts: Vec<String>,
    #[serde(default)]
    environment_scripts: Vec<String>,
    #[serde(default)]
    post_config_scripts: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    volumes: Vec<VolumeDeclaration>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGroupConfiguration {
    #[serde(default)]
    templates: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawJobReference {
    name: String,
    release: String,
}

impl RawRoleManifest {
    fn link(self, path: &Path, set: &ReleaseSet) -> Result<RoleManifest> {
        let manifest_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut instance_groups = Vec::with_capacity(self.instance_groups.len());
        for raw_group in self.instance_groups {
            let mut jobs = Vec::with_capacity(raw_group.jobs.len());
            for reference in &raw_group.jobs {
                let job_id = set.find_job(&reference.release, &reference.name).context(
                    error::JobNotFoundSnafu {
                        group: raw_group.name.clone(),
                        release: reference.release.clone(),
                        job: reference.name.clone(),
                    },
                )?;
                jobs.push(JobReference {
                    release_name: reference.release.clone(),
                    job_name: reference.name.clone(),
                    job_id,
                });
            }

            instance_groups.push(InstanceGroup {
                name: raw_group.name,
                group_type: raw_group.group_type,
                jobs,
                templates: canonical_templates(raw_group.configuration.templates)?,
                scripts: load_scripts(manifest_dir, &raw_group.scripts)?,
                environment_scripts: load_scripts(manifest_dir, &raw_group.environment_scripts)?,
                post_config_scripts: load_scripts(manifest_dir, &raw_group.post_config_scripts)?,
                tags: raw_group.tags,
                volumes: raw_group.volumes,
            });
        }

        Ok(RoleManifest {
            path: path.to_path_buf(),
            instance_groups,
            templates: canonical_templates(self.configuration.templates)?,
            variables: self.variables,
            authorization: canonical_templates(self.configuration.authorization)?,
        })
    }
}

fn canonical_templates(
    raw: BTreeMap<String, serde_yaml::Value>,
) -> Result<BTreeMap<String, Value>> {
    raw.into_iter()
        .map(|(key, value)| {
            let value = to_canonical_value(&value)
                .context(error::ValueEncodingSnafu { path: key.clone() })?;
            Ok((key, value))
        })
        .collect()
}

fn load_scripts(manifest_dir: &Path, paths: &[String]) -> Result<Vec<Script>> {
    paths
        .iter()
        .map(|script_path| {
            let full = manifest_dir.join(script_path);
            let content = fs::read_to_string(&full).context(error::FileReadSnafu {
                path: full.clone(),
            })?;
            Ok(Script {
                path: script_path.clone(),
                content,
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support;

    #[test]
    fn manifest_links_jobs_across_releases() {
        let dir = tempfile::tempdir().unwrap();
        let set = test_support::two_release_set();
        let manifest_path = test_support::write_manifest(
            dir.path(),
            r#"
instance_groups:
- name: front
  type: long-running
  jobs:
  - name: web
    release: app
  - name: proxy
    release: base
configuration:
  templates:
    properties.web.port: 8080
"#,
        );

        let manifest = RoleManifest::load(&manifest_path, &set).unwrap();
        let group = &manifest.instance_groups[0];
        assert_eq!(group.jobs.len(), 2);
        assert_eq!(set.job(group.jobs[0].job_id).name, "web");
        assert_eq!(set.job(group.jobs[1].job_id).name, "proxy");
        assert_eq!(
            manifest.templates["properties.web.port"],
            serde_json::json!(8080)
        );
    }

    #[test]
    fn unresolvable_job_reference_fails() {
        let dir = tempfile::tempdir().unwrap();
        let set = test_support::two_release_set();
        let manifest_path = test_support::write_manifest(
            dir.path(),
            r#"
instance_groups:
- name: front
  jobs:
  - name: ghost
    release: app
"#,
        );

        let err = RoleManifest::load(&manifest_path, &set).unwrap_err();
        assert!(matches!(err, crate::Error::JobNotFound { .. }), "{err}");
    }

    #[test]
    fn scripts_are_loaded_relative_to_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let set = test_support::two_release_set();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/setup.sh"), "#!/bin/sh\n").unwrap();
        let manifest_path = test_support::write_manifest(
            dir.path(),
            r#"
instance_groups:
- name: front
  jobs:
  - name: web
    release: app
  scripts: [scripts/setup.sh]
"#,
        );

        let manifest = RoleManifest::load(&manifest_path, &set).unwrap();
        assert_eq!(
            manifest.instance_groups[0].scripts[0].content,
            "#!/bin/sh\n"
        );
    }

    #[test]
    fn artifact_kind_dispatch() {
        let group = |group_type, tags: &[&str], volumes: Vec<VolumeDeclaration>| InstanceGroup {
            name: "g".into(),
            group_type,
            jobs: Vec::new(),
            templates: BTreeMap::new(),
            scripts: Vec::new(),
            environment_scripts: Vec::new(),
            post_config_scripts: Vec::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            volumes,
        };
        let volume = VolumeDeclaration {
            path: "/var/data".into(),
            size: 10,
            tag: None,
        };

        assert_eq!(
            group(GroupType::OneShotTask, &[], Vec::new()).artifact_kind(),
            ArtifactKind::Task
        );
        assert_eq!(
            group(GroupType::StopOnFailureTask, &[], Vec::new()).artifact_kind(),
            ArtifactKind::StopOnFailureTask
        );
        assert_eq!(
            group(GroupType::LongRunning, &[], Vec::new()).artifact_kind(),
            ArtifactKind::Deployment
        );
        assert_eq!(
            group(GroupType::LongRunning, &["clustered"], Vec::new()).artifact_kind(),
            ArtifactKind::StatefulSet
        );
        assert_eq!(
            group(GroupType::LongRunning, &[], vec![volume]).artifact_kind(),
            ArtifactKind::StatefulSet
        );
    }
}
