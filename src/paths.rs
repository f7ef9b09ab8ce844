//! Lexical path normalisation shared by the store and the extractor.

use camino::{Utf8Path, Utf8PathBuf};
use std::path::{Component, Path, PathBuf};

/// Normalise `path` without touching the filesystem.
///
/// Removes `.` components, folds `name/..` pairs, and keeps leading `..`
/// components of relative paths. `/..` collapses to `/`. An empty result is
/// returned as `.`.
pub(crate) fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match cleaned.components().next_back() {
                Some(Component::Normal(_)) => {
                    cleaned.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => cleaned.push(".."),
            },
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

/// UTF-8 flavour of [`lexical_clean`].
pub(crate) fn lexical_clean_utf8(path: &Utf8Path) -> Utf8PathBuf {
    // Cleaning only drops or reorders existing components, so the result
    // stays valid UTF-8; the fallback keeps the input untouched regardless.
    Utf8PathBuf::try_from(lexical_clean(path.as_std_path())).unwrap_or_else(|_| path.to_path_buf())
}

/// Return true when `path` starts with a `..` component.
pub(crate) fn starts_with_parent(path: &Path) -> bool {
    matches!(path.components().next(), Some(Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("a/b", "a/b")]
    #[case::current_dirs("./a/./b/", "a/b")]
    #[case::folded_parent("a/b/../c", "a/c")]
    #[case::leading_parent("../a", "../a")]
    #[case::escaping("a/../../b", "../b")]
    #[case::root_parent("/../etc", "/etc")]
    #[case::empty("", ".")]
    #[case::only_current(".", ".")]
    fn cleans_lexically(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(lexical_clean(Path::new(input)), PathBuf::from(expected));
    }

    #[test]
    fn detects_leading_parent() {
        assert!(starts_with_parent(Path::new("../x")));
        assert!(!starts_with_parent(Path::new("x/..")));
    }
}
