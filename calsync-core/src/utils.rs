//! Small helpers shared across modules.

use std::path::Path;

use crate::error::CalSyncResult;

/// Lowercase `s` and collapse every run of non-alphanumeric characters into
/// a single `_`.
pub fn normalize_name(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_gap = false;

    for c in s.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            in_gap = false;
        } else if !in_gap {
            out.push('_');
            in_gap = true;
        }
    }

    out
}

/// File-system friendly name for an identifier.
pub fn file_slug(id: &str) -> String {
    let slug = slug::slugify(id);
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &str) -> CalSyncResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");

    std::fs::write(&temp, contents)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Work"), "work");
        assert_eq!(normalize_name("Family & Friends"), "family_friends");
        assert_eq!(normalize_name("  Team -- Cal 2 "), "_team_cal_2_");
        assert_eq!(normalize_name("Überstunden"), "überstunden");
    }

    #[test]
    fn test_file_slug_never_empty() {
        assert_eq!(file_slug("e1@example.com"), "e1-example-com");
        assert_eq!(file_slug("@@@"), "item");
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/file.txt");

        write_atomic(&path, "hello").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert!(!dir.path().join("nested/file.txt.tmp").exists());
    }
}
