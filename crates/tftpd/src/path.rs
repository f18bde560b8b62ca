//! Confinement of client-supplied filenames to a server root.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Map `filename` to a path strictly below `root`.
///
/// The filename is joined onto `root` the way a client expects a TFTP path
/// to behave: a leading `/` does not escape the root. The join is then
/// normalized lexically (`.` dropped, `..` popped), so names of files that
/// do not exist yet can be checked too. The result must lie below `root` on
/// a path-segment boundary; `root` itself is refused.
///
/// `root` must already be absolute and canonical.
pub fn safe_path(root: &Path, filename: &str) -> Result<PathBuf> {
    let candidate = normalize(&root.join(relative(filename)));

    tracing::debug!(
        root = %root.display(),
        filename,
        result = %candidate.display(),
        "sanitized path join"
    );

    if candidate.as_path() != root && candidate.starts_with(root) {
        Ok(candidate)
    } else {
        Err(Error::path_rejected(filename))
    }
}

/// [`safe_path`], then make sure symlinks do not lead out of `root`.
///
/// The deepest existing ancestor of the candidate is canonicalized and must
/// still lie below `root`. Components that do not exist yet, such as the
/// target of an upload, are appended to it unchanged.
pub async fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf> {
    let candidate = safe_path(root, filename)?;

    let mut existing = candidate.as_path();
    let mut missing = Vec::new();
    let resolved = loop {
        match tokio::fs::canonicalize(existing).await {
            Ok(resolved) => break resolved,
            Err(e) if e.kind() == io::ErrorKind::NotFound => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Err(Error::filesystem(filename, e)),
            },
            Err(e) => return Err(Error::filesystem(filename, e)),
        }
    };

    // The root itself is only acceptable as the parent of a new file.
    let inside = resolved.starts_with(root) && (resolved.as_path() != root || !missing.is_empty());
    if !inside {
        tracing::debug!(filename, resolved = %resolved.display(), "symlink leads out of root");
        return Err(Error::path_rejected(filename));
    }

    let mut path = resolved;
    path.extend(missing.iter().rev());
    Ok(path)
}

/// Strip anything that would make `filename` replace the root when joined.
fn relative(filename: &str) -> PathBuf {
    Path::new(filename)
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect()
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            // Popping at the filesystem root is a no-op, as with `/..`.
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/srv/tftp";

    fn resolve(filename: &str) -> Result<PathBuf> {
        safe_path(Path::new(ROOT), filename)
    }

    #[test]
    fn test_plain_names_stay_under_root() {
        assert_eq!(resolve("boot.bin").unwrap(), PathBuf::from("/srv/tftp/boot.bin"));
        assert_eq!(
            resolve("pxelinux.cfg/default").unwrap(),
            PathBuf::from("/srv/tftp/pxelinux.cfg/default")
        );
        assert_eq!(resolve("./a/./b").unwrap(), PathBuf::from("/srv/tftp/a/b"));
    }

    #[test]
    fn test_leading_slash_is_relative_to_root() {
        assert_eq!(resolve("/boot.bin").unwrap(), PathBuf::from("/srv/tftp/boot.bin"));
        assert_eq!(resolve("//etc/passwd").unwrap(), PathBuf::from("/srv/tftp/etc/passwd"));
    }

    #[test]
    fn test_inner_parent_segments_that_stay_inside() {
        assert_eq!(resolve("a/../b.img").unwrap(), PathBuf::from("/srv/tftp/b.img"));
    }

    #[test]
    fn test_traversal_is_rejected() {
        for name in ["../secret.txt", "../../etc/passwd", "a/../../x", "/../../etc/shadow", ".."] {
            let err = resolve(name).unwrap_err();
            assert!(matches!(err, Error::PathRejected { ref filename } if filename == name), "{name}");
        }
    }

    #[test]
    fn test_sibling_with_shared_prefix_is_rejected() {
        assert!(resolve("../tftp-other/secret").is_err());
    }

    #[test]
    fn test_root_itself_is_rejected() {
        assert!(resolve("").is_err());
        assert!(resolve(".").is_err());
        assert!(resolve("/").is_err());
        assert!(resolve("a/..").is_err());
    }

    #[test]
    fn test_repeated_calls_agree() {
        let first = resolve("images/../boot.bin").unwrap();
        let second = resolve("images/../boot.bin").unwrap();
        assert_eq!(first, second);
    }

    /// A canonical root inside a scratch directory that also holds `secret.txt`.
    fn sandbox() -> (tempfile::TempDir, PathBuf) {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), b"top secret").unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let root = std::fs::canonicalize(root).unwrap();
        (outer, root)
    }

    #[tokio::test]
    async fn test_resolve_existing_and_new_files() {
        let (_outer, root) = sandbox();
        std::fs::write(root.join("boot.bin"), b"x").unwrap();

        assert_eq!(resolve_path(&root, "boot.bin").await.unwrap(), root.join("boot.bin"));
        assert_eq!(resolve_path(&root, "new.img").await.unwrap(), root.join("new.img"));
        assert_eq!(resolve_path(&root, "a/b/c.img").await.unwrap(), root.join("a/b/c.img"));
        assert!(resolve_path(&root, "../secret.txt").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_follows_links_inside_root() {
        let (_outer, root) = sandbox();
        std::fs::create_dir(root.join("images")).unwrap();
        std::os::unix::fs::symlink("images", root.join("alias")).unwrap();

        assert_eq!(
            resolve_path(&root, "alias/boot.bin").await.unwrap(),
            root.join("images").join("boot.bin")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_rejects_links_out_of_root() {
        let (outer, root) = sandbox();
        std::os::unix::fs::symlink("..", root.join("link")).unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("escape.txt")).unwrap();
        std::os::unix::fs::symlink(".", root.join("self")).unwrap();

        for name in ["link/secret.txt", "link/new.txt", "escape.txt", "link", "self"] {
            let err = resolve_path(&root, name).await.unwrap_err();
            assert!(matches!(err, Error::PathRejected { ref filename } if filename == name), "{name}");
        }
    }
}
