/*!
Image planning.

Turns compiled packages and resolved configuration into container images,
one per selected instance group, layered over a shared "packages" image so
unchanged subgraphs reuse earlier work. Every image is addressed by a
content hash over the inputs that affect runtime behavior: the group's
dev version for group images, and the referenced package fingerprints
plus the stemcell for the packages layer. Identical inputs therefore
produce identical image names, and the planner can skip a build whenever
the name already exists in the engine's index.
*/

mod dev_version;
mod error;
mod naming;
mod planner;
/// Fixtures shared across the test modules, test builds only.
#[cfg(test)]
pub(crate) mod test_support;

pub use dev_version::{group_packages, instance_group_dev_version, packages_layer_version};
pub use error::Error;
pub use naming::{instance_group_image_name, packages_layer_image_name, sanitized};
pub use planner::{plan, BuiltImage, ImageKind, PlanOptions};

pub type Result<T> = std::result::Result<T, error::Error>;
