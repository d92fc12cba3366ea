//! Path checks used by the registry and the helper's allow-list.
//!
//! [`normalize`] and [`is_within`] are purely lexical. [`resolve_beneath`]
//! walks the filesystem one component at a time without following symlinks
//! and keeps the final component open, so the helper mounts onto exactly
//! the object it checked. It never stats a resolved mount point: a wedged
//! FUSE mount would block `stat` and `canonicalize`.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Reasons a path argument is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// The path is relative.
    #[error("{0:?} is not absolute")]
    NotAbsolute(PathBuf),

    /// The path contains a `..` component.
    #[error("{0:?} contains a parent-directory component")]
    ParentComponent(PathBuf),

    /// The path contains an interior NUL byte.
    #[error("{0:?} contains a NUL byte")]
    Nul(PathBuf),
}

/// Returns the absolute, normalized form of `path`: `.` components and
/// duplicate separators removed, `..` rejected.
pub fn normalize(path: &Path) -> Result<PathBuf, PathError> {
    use std::os::unix::ffi::OsStrExt;

    if path.as_os_str().as_bytes().contains(&0) {
        return Err(PathError::Nul(path.to_path_buf()));
    }
    if !path.is_absolute() {
        return Err(PathError::NotAbsolute(path.to_path_buf()));
    }

    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => return Err(PathError::ParentComponent(path.to_path_buf())),
            Component::Prefix(_) => return Err(PathError::NotAbsolute(path.to_path_buf())),
        }
    }
    Ok(normalized)
}

/// Whether `path` equals or lies beneath one of `roots`. Both sides are
/// expected to be normalized already.
pub fn is_within(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

/// Reasons [`resolve_beneath`] refuses a path.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// A component below the root is a symbolic link.
    #[error("{0:?} is a symbolic link")]
    Symlink(PathBuf),

    /// An intermediate component, or a required directory, is something else.
    #[error("{0:?} is not a directory")]
    NotDirectory(PathBuf),

    /// `path` does not start with `root`.
    #[error("{path:?} is not beneath {root:?}")]
    NotBeneath { path: PathBuf, root: PathBuf },

    /// Any other failure while opening a component.
    #[error("resolving {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// What the final component must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// A directory, such as a mount point.
    Directory,
    /// Anything but a symlink; bind mounts may target files.
    Any,
}

/// A path opened with `O_PATH`, pinning the object it named at check time.
#[derive(Debug)]
pub struct PinnedPath {
    path: PathBuf,
    fd: OwnedFd,
}

impl PinnedPath {
    /// The path as it was checked.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `/proc/self/fd/N` for the pinned object. System calls given this path
    /// act on the object itself, whatever `path` points at by then.
    pub fn proc_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/self/fd/{}", self.fd.as_raw_fd()))
    }
}

/// Outcome of a successful [`resolve_beneath`].
#[derive(Debug)]
pub enum Resolved {
    Pinned(PinnedPath),
    /// Some component does not exist (yet).
    Missing,
}

/// Opens `path` beneath `root` without following symlinks below `root`.
///
/// Both paths must be normalized. `root` itself is trusted configuration
/// and may be a symlink. Every component after it is opened relative to
/// its parent with `O_PATH | O_NOFOLLOW`, so a link planted anywhere
/// beneath the root is reported as [`ResolveError::Symlink`] instead of
/// being followed out of it.
#[cfg(target_os = "linux")]
pub fn resolve_beneath(root: &Path, path: &Path, expect: Expect) -> Result<Resolved, ResolveError> {
    use nix::errno::Errno;
    use nix::fcntl::{open, openat, AtFlags, OFlag};
    use nix::sys::stat::{fstatat, Mode, SFlag};
    use std::os::unix::io::FromRawFd;

    let relative = path
        .strip_prefix(root)
        .map_err(|_| ResolveError::NotBeneath {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })?;
    let io = |at: &Path, source| ResolveError::Io {
        path: at.to_path_buf(),
        source,
    };
    // Safety: every raw fd wrapped below was just returned by open/openat
    // and is owned by nothing else.
    let own = |fd| unsafe { OwnedFd::from_raw_fd(fd) };

    let dir_flags = OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC;
    let mut current = match open(root, dir_flags, Mode::empty()) {
        Ok(fd) => own(fd),
        Err(Errno::ENOENT) => return Ok(Resolved::Missing),
        Err(Errno::ENOTDIR) => return Err(ResolveError::NotDirectory(root.to_path_buf())),
        Err(e) => return Err(io(root, e)),
    };

    let names: Vec<_> = relative.components().map(|c| c.as_os_str()).collect();
    let mut walked = root.to_path_buf();
    for (i, name) in names.iter().enumerate() {
        walked.push(name);
        let last = i + 1 == names.len();
        match openat(current.as_raw_fd(), *name, dir_flags | OFlag::O_NOFOLLOW, Mode::empty()) {
            Ok(fd) => current = own(fd),
            Err(Errno::ENOENT) => return Ok(Resolved::Missing),
            Err(Errno::ELOOP) | Err(Errno::ENOTDIR) => {
                let stat = fstatat(current.as_raw_fd(), *name, AtFlags::AT_SYMLINK_NOFOLLOW)
                    .map_err(|e| io(walked.as_path(), e))?;
                let kind = SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT;
                if kind == SFlag::S_IFLNK {
                    return Err(ResolveError::Symlink(walked));
                }
                if !last || expect == Expect::Directory {
                    return Err(ResolveError::NotDirectory(walked));
                }
                // A plain file. If it was swapped for a link since the stat,
                // O_NOFOLLOW pins the link itself, never its target.
                let flags = OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC;
                match openat(current.as_raw_fd(), *name, flags, Mode::empty()) {
                    Ok(fd) => current = own(fd),
                    Err(Errno::ENOENT) => return Ok(Resolved::Missing),
                    Err(e) => return Err(io(walked.as_path(), e)),
                }
            }
            Err(e) => return Err(io(walked.as_path(), e)),
        }
    }

    Ok(Resolved::Pinned(PinnedPath {
        path: path.to_path_buf(),
        fd: current,
    }))
}

/// Without `O_PATH` there is nothing to pin; the helper cannot mount on
/// these platforms anyway.
#[cfg(not(target_os = "linux"))]
pub fn resolve_beneath(root: &Path, path: &Path, _expect: Expect) -> Result<Resolved, ResolveError> {
    if !path.starts_with(root) {
        return Err(ResolveError::NotBeneath {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        });
    }
    Ok(Resolved::Missing)
}
