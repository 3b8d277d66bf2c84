/*!
Role manifest handling.

The role manifest is the orchestration document: it assigns jobs from one
or more loaded releases to deployable instance groups, carries global and
per-group configuration templates, and declares the variables that may be
referenced at runtime. This crate parses and links the manifest, loads the
light/dark opinion pair, cross-checks the whole composition against the
union of job property schemas, and produces the effective per-job
configuration handed to containers at start time.
*/

mod error;
pub mod manifest;
pub mod opinions;
pub mod resolver;
/// Shared in-memory fixtures, test builds only.
#[cfg(test)]
pub(crate) mod test_support;
pub mod validator;

pub use error::Error;
pub use manifest::{
    ArtifactKind, GroupType, InstanceGroup, JobReference, RoleManifest, Script,
    VariableDefinition, VolumeDeclaration,
};
pub use opinions::Opinions;
pub use validator::{ValidationIssue, ValidationKind, ValidationReport};

use std::collections::BTreeMap;
use std::path::Path;

use snafu::ResultExt;

pub type Result<T> = std::result::Result<T, error::Error>;

/// Parse a dotenv-style defaults file (`KEY=VALUE` per line) into a map.
/// These are runtime defaults for manifest variables; the validator
/// rejects keys that are not declared in the manifest.
pub fn load_env_defaults(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    let mut defaults = BTreeMap::new();
    for item in dotenvy::from_path_iter(path).context(error::EnvDefaultsSnafu {
        path: path.to_path_buf(),
    })? {
        let (key, value) = item.context(error::EnvDefaultsSnafu {
            path: path.to_path_buf(),
        })?;
        defaults.insert(key, value);
    }
    Ok(defaults)
}

/// The dotted-path prefix under which all property templates live.
pub(crate) const PROPERTIES_PREFIX: &str = "properties.";

/// Strip the `properties.` prefix from a template key, if present.
/// Template keys outside that namespace do not address job properties.
pub(crate) fn property_path(template_key: &str) -> Option<&str> {
    template_key.strip_prefix(PROPERTIES_PREFIX)
}
