/*!
Registry-safe image names.

Image names are assembled from the registry prefix, organization,
repository, and a content-hash tag. Anything a registry would reject is
replaced with `-`, except for names that are literally `{{…}}` template
placeholders, which pass through for downstream substitution.
*/

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-z0-9_.-]").unwrap();
}

/// Replace every character outside `[a-z0-9_.-]` with `-`. A name wrapped
/// in `{{…}}` is a template placeholder and passes through unchanged.
pub fn sanitized(name: &str) -> String {
    if name.starts_with("{{") && name.ends_with("}}") {
        return name.to_string();
    }
    INVALID_NAME_CHARS
        .replace_all(&name.to_lowercase(), "-")
        .into_owned()
}

/// `<registry>/<org>/<repo>-role-packages:<version>`, with empty
/// registry/org segments omitted.
pub fn packages_layer_image_name(
    registry: &str,
    organization: &str,
    repository: &str,
    version: &str,
) -> String {
    format!(
        "{}:{}",
        join_segments(registry, organization, &format!("{}-role-packages", repository)),
        sanitized(version)
    )
}

/// `<registry>/<org>/<repo>-<group>:<dev-version>[-tag-extra]`.
pub fn instance_group_image_name(
    registry: &str,
    organization: &str,
    repository: &str,
    group_name: &str,
    dev_version: &str,
    tag_extra: Option<&str>,
) -> String {
    let repo = format!("{}-{}", repository, sanitized(group_name));
    let tag = match tag_extra {
        Some(extra) if !extra.is_empty() => format!("{}-{}", dev_version, sanitized(extra)),
        _ => dev_version.to_string(),
    };
    format!("{}:{}", join_segments(registry, organization, &repo), tag)
}

fn join_segments(registry: &str, organization: &str, repo: &str) -> String {
    [registry, organization, repo]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/")
}
