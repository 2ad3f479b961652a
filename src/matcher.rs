use crate::image_reference::ImageReference;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    Unresolved(String),
}

impl std::error::Error for RegistryError {}
impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Unresolved(image) => {
                write!(f, "error while identifying the registry of {}", image)
            }
        }
    }
}

/// Returns true if the namespace equals a whitelist entry or contains one as a substring.
///
/// Substring matching is broad: an entry `dev` also exempts `devops-prod`.
pub fn is_exempt(namespace: &str, whitelist: &BTreeSet<String>) -> bool {
    whitelist
        .iter()
        .filter(|entry| !entry.is_empty())
        .any(|entry| namespace == entry || namespace.contains(entry.as_str()))
}

/// Checks the registry host of an image for exact membership in a non-empty whitelist.
pub fn is_allowed(
    image: &ImageReference,
    whitelist: &BTreeSet<String>,
) -> Result<bool, RegistryError> {
    if image.registry.is_empty() || image.repository.is_empty() {
        return Err(RegistryError::Unresolved(image.to_string()));
    }
    Ok(whitelist.contains(&image.registry))
}
