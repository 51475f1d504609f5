// PanelSync - Offline Chapter Reader for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! On-disk layout of cached images
//!
//! `<root>/<domain>/<owner dir>/<file key>.<ext>`
//!
//! - Owner directories are sanitized and suffixed with a short hash so two
//!   owners that sanitize to the same name never share a directory
//! - The extension is taken from the URL path when it is a known image type

use crate::cache::entry::{file_key, CacheDomain};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Maximum bytes kept from an owner key in its directory name
const MAX_OWNER_COMPONENT: usize = 64;

/// Recognized image extensions
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif", "bmp"];

/// Fallback extension for URLs without a usable one
const DEFAULT_EXTENSION: &str = "img";

/// Directory holding every file of `owner_key` in `domain`
pub fn owner_dir(root: &Path, domain: CacheDomain, owner_key: &str) -> PathBuf {
    root.join(domain.as_str()).join(owner_component(owner_key))
}

/// Deterministic path for `(domain, owner, url)`
pub fn image_path(root: &Path, domain: CacheDomain, owner_key: &str, url: &str) -> PathBuf {
    owner_dir(root, domain, owner_key).join(format!(
        "{}.{}",
        file_key(domain, owner_key, url),
        extension_for(url)
    ))
}

/// Temporary path a download is written to before being renamed into place
pub fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Sanitized, bounded directory name for an owner key
fn owner_component(owner_key: &str) -> String {
    let mut safe: String = owner_key
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    safe = safe.trim().trim_matches('.').to_string();
    safe = truncate_component(&safe, MAX_OWNER_COMPONENT);
    if safe.is_empty() {
        safe = "owner".to_string();
    }

    let digest = Sha256::digest(owner_key.as_bytes());
    format!("{}-{}", safe, hex::encode(&digest[..4]))
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 character
fn truncate_component(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Image extension from the URL path, lowercased
fn extension_for(url: &str) -> &'static str {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    let ext = Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext {
        Some(ext) => IMAGE_EXTENSIONS
            .iter()
            .find(|known| **known == ext)
            .copied()
            .unwrap_or(DEFAULT_EXTENSION),
        None => DEFAULT_EXTENSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_from_url() {
        assert_eq!(extension_for("https://cdn.example/a/01.PNG?token=1"), "png");
        assert_eq!(extension_for("https://cdn.example/a/01.webp#frag"), "webp");
        assert_eq!(extension_for("https://cdn.example/a/page"), "img");
        assert_eq!(extension_for("https://cdn.example/a/page.php"), "img");
    }

    #[test]
    fn test_owner_component_sanitized() {
        let a = owner_component("manga:42/ch:7");
        assert!(a.starts_with("manga_42_ch_7-"));
        assert!(!a.contains('/'));

        // Same sanitized text, different owners
        assert_ne!(owner_component("a/b"), owner_component("a:b"));
    }

    #[test]
    fn test_long_owner_truncated_on_char_boundary() {
        let owner = "é".repeat(100);
        let component = owner_component(&owner);
        let (name, _) = component.rsplit_once('-').unwrap();
        assert!(name.len() <= MAX_OWNER_COMPONENT);
    }

    #[test]
    fn test_image_path_layout() {
        let root = Path::new("/cache");
        let path = image_path(root, CacheDomain::Download, "m1/c1", "https://cdn/1.jpg");
        assert!(path.starts_with("/cache/download"));
        assert_eq!(path.extension().unwrap(), "jpg");
        assert_eq!(
            partial_path(&path).file_name().unwrap().to_str().unwrap(),
            format!(".{}.tmp", path.file_name().unwrap().to_str().unwrap())
        );
    }
}
