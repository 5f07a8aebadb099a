//! Platform to base image mapping.

/// Image used when a platform has no dedicated entry.
pub const DEFAULT_IMAGE: &str = "nginx:alpine";

const PLATFORM_IMAGES: &[(&str, &str)] = &[
    ("wordpress", "wordpress:latest"),
    ("nginx", "nginx:alpine"),
    ("apache", "httpd:latest"),
    ("php", "php:8-apache"),
    ("node", "node:18-alpine"),
    ("hugo", "klakegg/hugo:ext-alpine"),
    ("jekyll", "jekyll/jekyll:latest"),
];

/// Resolve the base image for a site platform.
///
/// Lookup is case-insensitive. Unknown platforms fall back to
/// [`DEFAULT_IMAGE`] instead of failing.
pub fn image_for_platform(platform: &str) -> &'static str {
    let platform = platform.trim();
    PLATFORM_IMAGES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(platform))
        .map_or(DEFAULT_IMAGE, |(_, image)| image)
}

/// Split an image reference into repository and tag.
///
/// A registry port (`host:5000/app`) is not mistaken for a tag.
pub fn split_image_reference(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_platforms_map_to_their_image() {
        assert_eq!(image_for_platform("wordpress"), "wordpress:latest");
        assert_eq!(image_for_platform("hugo"), "klakegg/hugo:ext-alpine");
        assert_eq!(image_for_platform("PHP"), "php:8-apache");
    }

    #[test]
    fn unknown_platform_falls_back_to_default() {
        assert_eq!(image_for_platform("cobol"), DEFAULT_IMAGE);
        assert_eq!(image_for_platform(""), DEFAULT_IMAGE);
    }

    #[test]
    fn image_reference_split() {
        assert_eq!(split_image_reference("nginx:alpine"), ("nginx", "alpine"));
        assert_eq!(split_image_reference("jekyll/jekyll"), ("jekyll/jekyll", "latest"));
        assert_eq!(
            split_image_reference("registry:5000/site"),
            ("registry:5000/site", "latest")
        );
    }
}
