//! Component A: path normalisation and relative-path math (spec §4.1).
//! The extension→MIME table itself lives in `media-file-ext`; this module
//! owns the folder-key conventions specific to this system's identity model
//! (`(folder, fileName)`, canonical leading/trailing slashes).

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

pub use media_file_ext::mime_for_filename;

/// Ensures a folder string has a leading `/`, a trailing `/` (except the
/// root, which is exactly `/`), and collapses an empty string to `/`.
/// Idempotent: `normalize_folder(normalize_folder(s)) == normalize_folder(s)`.
pub fn normalize_folder(s: &str) -> String {
    if s.is_empty() || s == "/" {
        return "/".to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    if !s.starts_with('/') {
        out.push('/');
    }
    out.push_str(s);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Splits a relative path (no leading `/`) into `(folder, fileName)`.
/// `folder` is canonicalised via `normalize_folder`.
pub fn split(relative_path: &str) -> (String, String) {
    match relative_path.rfind('/') {
        Some(idx) => {
            let folder = normalize_folder(&relative_path[..idx]);
            let file_name = relative_path[idx + 1..].to_string();
            (folder, file_name)
        }
        None => ("/".to_string(), relative_path.to_string()),
    }
}

/// Inverse of `split`: joins a canonical folder and a file name back into a
/// slash-delimited relative path with no leading slash.
pub fn join(folder: &str, file_name: &str) -> String {
    let folder = normalize_folder(folder);
    if folder == "/" {
        file_name.to_string()
    } else {
        format!("{}{}", &folder[1..], file_name)
    }
}

/// Computes `absolute`'s path relative to `root`, failing with
/// `Error::PathEscape` if `absolute` does not lie inside `root`. Compares
/// canonicalised (symlink-resolved) prefixes, so this doubles as the guard
/// against directory-traversal in the request orchestrator.
pub fn to_relative(root: &Path, absolute: &Path) -> Result<String> {
    let canon_root = root
        .canonicalize()
        .map_err(|_| Error::PathEscape {
            root: root.to_path_buf(),
            path: absolute.to_path_buf(),
        })?;
    let canon_target = absolute.canonicalize().map_err(|_| Error::PathEscape {
        root: root.to_path_buf(),
        path: absolute.to_path_buf(),
    })?;

    let rel = canon_target
        .strip_prefix(&canon_root)
        .map_err(|_| Error::PathEscape {
            root: root.to_path_buf(),
            path: absolute.to_path_buf(),
        })?;

    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::PathEscape {
            root: root.to_path_buf(),
            path: absolute.to_path_buf(),
        });
    }

    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Lexically resolves `relative` against `root`, rejecting any path whose
/// `..` components would walk back above `root` — without touching the
/// filesystem, so the escape check never depends on whether the target
/// exists (spec §4.9 rule 1 ranks the path-escape check over not-found,
/// even for a path that doesn't exist). Existence and symlink-escape
/// detection remain `to_relative`'s job once the caller has stat'd the
/// result.
pub fn resolve_under_root(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut stack: Vec<&str> = Vec::new();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(c) => stack.push(c.to_str().unwrap_or_default()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(Error::PathEscape {
                        root: root.to_path_buf(),
                        path: PathBuf::from(relative),
                    });
                }
            }
        }
    }
    Ok(root.join(stack.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for s in ["", "/", "a/b", "/a/b", "a/b/", "/a/b/"] {
            let once = normalize_folder(s);
            let twice = normalize_folder(&once);
            assert_eq!(once, twice, "input {s:?}");
        }
    }

    #[test]
    fn normalize_root_is_exactly_slash() {
        assert_eq!(normalize_folder(""), "/");
        assert_eq!(normalize_folder("/"), "/");
    }

    #[test]
    fn split_and_join_round_trip() {
        let (folder, file_name) = split("a/b/photo.jpg");
        assert_eq!(folder, "/a/b/");
        assert_eq!(file_name, "photo.jpg");
        assert_eq!(join(&folder, &file_name), "a/b/photo.jpg");
    }

    #[test]
    fn split_root_level_file() {
        let (folder, file_name) = split("photo.jpg");
        assert_eq!(folder, "/");
        assert_eq!(file_name, "photo.jpg");
        assert_eq!(join(&folder, &file_name), "photo.jpg");
    }

    #[test]
    fn resolve_under_root_rejects_escape_for_a_nonexistent_path() {
        let root = Path::new("/media/root");
        let err = resolve_under_root(root, "../outside.txt").unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
    }

    #[test]
    fn resolve_under_root_accepts_a_nonexistent_path_inside_root() {
        let root = Path::new("/media/root");
        let resolved = resolve_under_root(root, "a/b/does-not-exist.jpg").unwrap();
        assert_eq!(resolved, root.join("a/b/does-not-exist.jpg"));
    }

    #[test]
    fn to_relative_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, b"x").unwrap();

        let err = to_relative(&root, &outside).unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
    }

    #[test]
    fn to_relative_accepts_inside() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("a")).unwrap();
        let inside = root.join("a").join("photo.jpg");
        std::fs::write(&inside, b"x").unwrap();

        let rel = to_relative(&root, &inside).unwrap();
        assert_eq!(rel, "a/photo.jpg");
    }
}
