/*!
Cross-checks over the manifest, the opinion pair, and the union of all
loaded job property schemas.

Every offense is collected before returning; partial failure is the norm
here, and the report order is deterministic so runs are comparable. The
"may-be-hash" relaxation threads through the lookup rules: a property
whose default is a mapping, or nil, may legitimately have children that no
job spec declares (for example `uaa.clients.<name>`), so a missing path is
accepted when one of its ancestors is such a property.
*/

use crate::manifest::RoleManifest;
use crate::opinions::Opinions;
use crate::property_path;
use releasesys::ReleaseSet;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    NotFound,
    Forbidden,
    Required,
}

impl Display for ValidationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationKind::NotFound => "Not found",
            ValidationKind::Forbidden => "Forbidden",
            ValidationKind::Required => "Required",
        })
    }
}

/// One offense: the path it concerns, its kind, and what went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub kind: ValidationKind,
    pub message: String,
}

impl Display for ValidationIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.path, self.kind, self.message)
    }
}

/// Everything the validator found, errors and warnings kept apart.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, kind: ValidationKind, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            path: path.into(),
            kind,
            message: message.into(),
        });
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for issue in &self.errors {
            writeln!(f, "{}", issue)?;
        }
        Ok(())
    }
}

/// One dotted property name as the union of all loaded releases sees it.
struct PropertySchema {
    /// Every (release, job, default) that declares the property.
    defaults: Vec<(String, String, Value)>,
    /// Whether the property may be hash-shaped: its default is a mapping,
    /// or nil (a hash-shaped property left empty in the job spec).
    maybe_hash: bool,
}

/// Run the full cross-check suite. `env_defaults` is the parsed
/// KEY=VALUE defaults file, when one is in play.
pub fn validate(
    manifest: &RoleManifest,
    set: &ReleaseSet,
    opinions: &Opinions,
    env_defaults: Option<&BTreeMap<String, String>>,
) -> ValidationReport {
    let registry = aggregate_properties(set);
    let mut report = ValidationReport::default();

    check_template_keys(manifest, &registry, &mut report);
    check_opinions_resolve(opinions, &registry, &mut report);
    check_dark_have_templates(manifest, opinions, &mut report);
    check_dark_not_in_light(opinions, &mut report);
    check_opinion_overrides(manifest, opinions, &mut report);
    check_env_defaults(manifest, env_defaults, &mut report);
    check_light_matches_default(opinions, &registry, &mut report);
    warn_differing_defaults(&registry, &mut report);

    report
}

fn aggregate_properties(set: &ReleaseSet) -> BTreeMap<String, PropertySchema> {
    let mut registry: BTreeMap<String, PropertySchema> = BTreeMap::new();
    for release in set.releases() {
        for job in &release.jobs {
            for property in &job.properties {
                let schema = registry
                    .entry(property.name.clone())
                    .or_insert_with(|| PropertySchema {
                        defaults: Vec::new(),
                        maybe_hash: false,
                    });
                schema.defaults.push((
                    release.name.clone(),
                    job.name.clone(),
                    property.default.clone(),
                ));
                if property.default.is_null() || property.default.is_object() {
                    schema.maybe_hash = true;
                }
            }
        }
    }
    registry
}

/// A dotted path resolves when a job spec declares it, or when some
/// ancestor of it is declared and may be hash-shaped.
fn resolves(registry: &BTreeMap<String, PropertySchema>, path: &str) -> bool {
    if registry.contains_key(path) {
        return true;
    }
    let mut current = path;
    while let Some(split) = current.rfind('.') {
        current = &current[..split];
        if let Some(schema) = registry.get(current) {
            if schema.maybe_hash {
                return true;
            }
        }
    }
    false
}

/// Rule: every template key addressing a property must resolve under some
/// release's job spec.
fn check_template_keys(
    manifest: &RoleManifest,
    registry: &BTreeMap<String, PropertySchema>,
    report: &mut ValidationReport,
) {
    for key in manifest.templates.keys() {
        if let Some(path) = property_path(key) {
            if !resolves(registry, path) {
                report.error(
                    key.clone(),
                    ValidationKind::NotFound,
                    "Not found in any job spec",
                );
            }
        }
    }
    for group in &manifest.instance_groups {
        for key in group.templates.keys() {
            if let Some(path) = property_path(key) {
                if !resolves(registry, path) {
                    report.error(
                        format!("instance_groups[{}].{}", group.name, key),
                        ValidationKind::NotFound,
                        "Not found in any job spec",
                    );
                }
            }
        }
    }
}

/// Rules: every light and dark opinion must resolve under a job spec,
/// with the same may-be-hash relaxation as template keys.
fn check_opinions_resolve(
    opinions: &Opinions,
    registry: &BTreeMap<String, PropertySchema>,
    report: &mut ValidationReport,
) {
    for path in opinions.light().keys() {
        if !resolves(registry, path) {
            report.error(
                format!("properties.{}", path),
                ValidationKind::NotFound,
                "Light opinion not found in any job spec",
            );
        }
    }
    for path in opinions.dark().keys() {
        if !resolves(registry, path) {
            report.error(
                format!("properties.{}", path),
                ValidationKind::NotFound,
                "Dark opinion not found in any job spec",
            );
        }
    }
}

/// Rule: every dark opinion must appear somewhere as a manifest template,
/// since the value has to arrive at runtime through one.
fn check_dark_have_templates(
    manifest: &RoleManifest,
    opinions: &Opinions,
    report: &mut ValidationReport,
) {
    for path in opinions.dark().keys() {
        let key = format!("properties.{}", path);
        let in_globals = manifest.templates.contains_key(&key);
        let in_groups = manifest
            .instance_groups
            .iter()
            .any(|g| g.templates.contains_key(&key));
        if !in_globals && !in_groups {
            report.error(key, ValidationKind::NotFound, "Dark opinion is missing template");
        }
    }
}

/// Rule: no dotted name may appear in both opinion files.
fn check_dark_not_in_light(opinions: &Opinions, report: &mut ValidationReport) {
    for path in opinions.dark().keys() {
        if opinions.light().contains_key(path) {
            report.error(
                format!("properties.{}", path),
                ValidationKind::Forbidden,
                "Dark opinion found in light opinions",
            );
        }
    }
}

/// Rule: global templates may neither duplicate nor override a light
/// opinion. A per-group template that duplicates one is only worth a
/// warning, and a differing per-group override is the supported way to
/// specialize a single group.
fn check_opinion_overrides(
    manifest: &RoleManifest,
    opinions: &Opinions,
    report: &mut ValidationReport,
) {
    for (key, value) in &manifest.templates {
        let Some(path) = property_path(key) else {
            continue;
        };
        let Some(light) = opinions.light_value(path) else {
            continue;
        };
        if light == value {
            report.error(
                key.clone(),
                ValidationKind::Forbidden,
                "Role manifest duplicates opinion",
            );
        } else {
            report.error(
                key.clone(),
                ValidationKind::Forbidden,
                "Role manifest overrides opinion",
            );
        }
    }
    for group in &manifest.instance_groups {
        for (key, value) in &group.templates {
            let Some(path) = property_path(key) else {
                continue;
            };
            if opinions.light_value(path) == Some(value) {
                report.warnings.push(format!(
                    "Instance group '{}' template '{}' duplicates opinion",
                    group.name, key
                ));
            }
        }
    }
}

/// Rule: every variable referenced by the env-defaults file must be
/// declared in the manifest's variable list.
fn check_env_defaults(
    manifest: &RoleManifest,
    env_defaults: Option<&BTreeMap<String, String>>,
    report: &mut ValidationReport,
) {
    let Some(env_defaults) = env_defaults else {
        return;
    };
    for name in env_defaults.keys() {
        if !manifest.variables.iter().any(|v| &v.name == name) {
            report.error(
                name.clone(),
                ValidationKind::Required,
                "Variable is not declared in the role manifest",
            );
        }
    }
}

/// Rule: a light opinion that matches the single release-wide default is
/// dead weight and must be removed.
fn check_light_matches_default(
    opinions: &Opinions,
    registry: &BTreeMap<String, PropertySchema>,
    report: &mut ValidationReport,
) {
    for (path, value) in opinions.light() {
        let Some(schema) = registry.get(path) else {
            continue;
        };
        let mut defaults = schema.defaults.iter().map(|(_, _, d)| d);
        let Some(first) = defaults.next() else {
            continue;
        };
        let uniform = defaults.all(|d| d == first);
        if uniform && first == value {
            report.error(
                format!("properties.{}", path),
                ValidationKind::Forbidden,
                "Light opinion matches default",
            );
        }
    }
}

/// Differing defaults for the same property across jobs is legal, but
/// worth surfacing.
fn warn_differing_defaults(
    registry: &BTreeMap<String, PropertySchema>,
    report: &mut ValidationReport,
) {
    for (path, schema) in registry {
        let first = &schema.defaults[0].2;
        if schema.defaults.iter().any(|(_, _, d)| d != first) {
            let sources: Vec<String> = schema
                .defaults
                .iter()
                .map(|(release, job, default)| {
                    format!("{}.{}={}", release, job, default)
                })
                .collect();
            report.warnings.push(format!(
                "Property '{}' has differing defaults: {}",
                path,
                sources.join(", ")
            ));
        }
    }
}
