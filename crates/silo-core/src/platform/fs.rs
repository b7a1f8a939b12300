use std::fs::File;
use std::path::Path;

/// Apply permission bits to a path.
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// Change owner and group without following symlinks. Failing with EPERM is
/// common for unprivileged restores; callers decide whether that matters.
pub fn apply_owner(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte")
        })?;
        let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (path, uid, gid);
        Ok(())
    }
}

pub fn create_symlink(link_target: &Path, path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_target, path)
    }

    #[cfg(not(unix))]
    {
        let _ = (link_target, path);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlinks are not supported on this platform",
        ))
    }
}

pub fn create_hardlink(existing: &Path, new: &Path) -> std::io::Result<()> {
    std::fs::hard_link(existing, new)
}

/// Create a fifo node.
pub fn create_fifo(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        mknod(path, libc::S_IFIFO | (mode & 0o7777) as libc::mode_t, 0)
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Err(unsupported("fifo"))
    }
}

/// Create a block or character device node.
pub fn create_device(path: &Path, mode: u32, device: u64, char_device: bool) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let kind = if char_device {
            libc::S_IFCHR
        } else {
            libc::S_IFBLK
        };
        mknod(path, kind | (mode & 0o7777) as libc::mode_t, device)
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode, device, char_device);
        Err(unsupported("device node"))
    }
}

#[cfg(unix)]
fn mknod(path: &Path, mode: libc::mode_t, device: u64) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte")
    })?;
    let rc = unsafe { libc::mknod(c_path.as_ptr(), mode, device as libc::dev_t) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn unsupported(what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{what} is not supported on this platform"),
    )
}

/// Set access and modification times, not following symlinks.
pub fn set_times(path: &Path, atime_ns: Option<i64>, mtime_ns: i64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte")
        })?;
        let to_timespec = |ns: i64| libc::timespec {
            tv_sec: ns.div_euclid(1_000_000_000) as libc::time_t,
            tv_nsec: ns.rem_euclid(1_000_000_000) as libc::c_long,
        };
        let times = [
            atime_ns.map(to_timespec).unwrap_or(libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            }),
            to_timespec(mtime_ns),
        ];
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (path, atime_ns, mtime_ns);
        Ok(())
    }
}

/// Reserve space for a file about to be written, reducing fragmentation for
/// large restores. Best-effort: unsupported filesystems are fine.
pub fn preallocate(file: &File, size: u64) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        if size == 0 {
            return Ok(());
        }
        let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, size as libc::off_t) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            // filesystem doesn't support fallocate; writes will extend it
            Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => Ok(()),
            _ => Err(err),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, size);
        Ok(())
    }
}

pub fn set_xattr(path: &Path, name: &str, value: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        xattr::set(path, name, value)
    }

    #[cfg(not(unix))]
    {
        let _ = (path, name, value);
        Ok(())
    }
}

pub fn get_xattr(path: &Path, name: &str) -> std::io::Result<Option<Vec<u8>>> {
    #[cfg(unix)]
    {
        xattr::get(path, name)
    }

    #[cfg(not(unix))]
    {
        let _ = (path, name);
        Ok(None)
    }
}

pub fn list_xattrs(path: &Path) -> std::io::Result<Vec<String>> {
    #[cfg(unix)]
    {
        Ok(xattr::list(path)?
            .filter_map(|n| n.into_string().ok())
            .collect())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_times_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stamped");
        std::fs::write(&path, b"x").unwrap();

        let target_ns: i64 = 1_700_000_000_000_000_000;
        set_times(&path, Some(target_ns), target_ns).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        let mtime = meta
            .modified()
            .unwrap()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(mtime.as_secs(), 1_700_000_000);
    }

    #[test]
    fn set_times_pre_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old");
        std::fs::write(&path, b"x").unwrap();
        // one second before the epoch
        assert!(set_times(&path, None, -1_000_000_000).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_and_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"t").unwrap();
        apply_mode(&target, 0o640).unwrap();
        assert_eq!(
            std::fs::metadata(&target).unwrap().permissions().mode() & 0o777,
            0o640
        );

        let link = dir.path().join("link");
        create_symlink(Path::new("target"), &link).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("target"));
    }

    #[cfg(unix)]
    #[test]
    fn fifo_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        create_fifo(&path, 0o600).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn preallocate_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        let file = File::create(&path).unwrap();
        preallocate(&file, 4096).unwrap();
    }
}
