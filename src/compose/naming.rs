//! Container naming
//!
//! A deployment first creates each container under a transitional name
//! (`<app>_<service>_deploy`) so it can run alongside the live one, then
//! renames it to its final name (`<app>_<service>`) once every service is up.

use crate::deploy::DeployedService;
use std::collections::BTreeMap;

/// Suffix of transitional container names
pub const DEPLOY_SUFFIX: &str = "_deploy";

/// Name of a freshly created container
pub fn transitional_name(app: &str, service: &str) -> String {
    format!("{}_{}{}", app, service, DEPLOY_SUFFIX)
}

/// Name a container holds once swapped in
pub fn final_name(name: &str) -> String {
    name.strip_suffix(DEPLOY_SUFFIX).unwrap_or(name).to_string()
}

/// Resolve a `service` or `service:alias` link to `target:alias`
///
/// A bare `service` link to a service deployed in the same batch targets the
/// name that service will hold after the swap. Links with an explicit alias
/// and links to anything else are kept literally.
pub fn resolve_link(link: &str, peers: &BTreeMap<String, DeployedService>) -> String {
    if link.contains(':') {
        return link.to_string();
    }

    match peers.get(link) {
        Some(peer) => format!("{}:{}", final_name(&peer.transitional_name), link),
        None => format!("{}:{}", link, link),
    }
}

/// Check a name is usable as part of a container name
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Image reference with an explicit tag, `latest` when none is given
pub fn image_reference(image: &str) -> String {
    if image.contains('@') {
        return image.to_string();
    }

    let (_, tag) = split_image_reference(image);
    if image.ends_with(&format!(":{}", tag)) {
        image.to_string()
    } else {
        format!("{}:{}", image, tag)
    }
}

/// Split an image reference into repository and tag
///
/// A colon only starts a tag after the last `/`, so registry ports are kept.
pub fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    let last_segment = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment..].rfind(':') {
        Some(i) => (&image[..last_segment + i], &image[last_segment + i + 1..]),
        None => (image, "latest"),
    }
}
