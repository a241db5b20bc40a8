use crate::Error;
use nix::fcntl::PosixFadviseAdvice;
use std::os::fd::AsRawFd;
use std::{fs::OpenOptions, os::unix::fs::OpenOptionsExt, path::Path};

/// Check if a file path is accepted based on the prefix lists.
///
/// A prefix starting with `!` denies; the longest matching prefix wins; paths
/// matching no prefix are accepted.
///
/// <section class="warning">
/// Make sure that the prefixes are sorted before calling this function.
/// </section>
///
/// # Examples
///
/// ```
/// # use kernel::utils::accept_file;
/// let mut exeprefixes = [
///     "/usr/bin",
///     "/usr/sbin",
///     // accept anything in `acceptedfolder` inside the `personal` folder
///     "/home/user/personal/acceptedfolder",
///     // ignore everything else in the personal dir
///     "!/home/user/personal",
/// ];
/// exeprefixes.sort();
///
/// assert!(accept_file("/usr/bin/ls", &exeprefixes));
/// assert!(accept_file("/home/user/foobar", &exeprefixes));
/// assert!(!accept_file("/home/user/personal/notaccept", &exeprefixes));
/// assert!(accept_file("/home/user/personal/acceptedfolder/file", &exeprefixes));
/// // a path that matches no prefix is accepted
/// assert!(accept_file("/no/match", &[] as &[&str]));
/// ```
#[inline]
pub fn accept_file<T, U>(path: impl AsRef<Path>, prefixes: T) -> bool
where
    T: IntoIterator<Item = U>,
    U: AsRef<str>,
{
    let path = path.as_ref();

    let mut best: Option<(bool, usize)> = None;

    for prefix in prefixes {
        let prefix = prefix.as_ref();
        let (neg, prefix) = prefix
            .strip_prefix('!')
            .map(|p| (true, p))
            .unwrap_or((false, prefix));
        let prefix_path = Path::new(prefix);
        if path.starts_with(prefix_path) {
            let len = prefix.len();
            if best.map(|(_, l)| l).unwrap_or(0) < len {
                best = Some((!neg, len));
            }
        }
    }

    best.map(|(accept, _)| accept).unwrap_or(true)
}

/// Sanitize a file path reported by procfs.
///
/// Paths with no root are rejected. The prelink suffix is stripped. Paths
/// with the `(deleted)` marker are rejected.
///
/// # Examples
///
/// ```
/// # use kernel::utils::sanitize_file;
/// # use std::path::Path;
/// let path = Path::new("/bin/bash.#prelink#.12345");
/// assert_eq!(sanitize_file(path), Some(Path::new("/bin/bash")));
///
/// let deleted = Path::new("/usr/bin/bash (deleted)");
/// assert_eq!(sanitize_file(deleted), None);
///
/// let relative = Path::new("relative/path");
/// assert_eq!(sanitize_file(relative), None);
/// ```
#[inline]
pub fn sanitize_file(path: &Path) -> Option<&Path> {
    if !path.has_root() {
        return None;
    }
    if path.to_str().is_some_and(|s| s.contains("(deleted)")) {
        return None;
    }
    // convert /bin/bash.#prelink#.12345 to /bin/bash
    let new_path = path.to_str().and_then(|x| x.split(".#prelink#.").next())?;
    Some(Path::new(new_path))
}

/// Convert bytes to kilobytes, rounding up.
///
/// # Examples
///
/// ```
/// # use kernel::utils::kb;
/// assert_eq!(kb(0), 0);
/// assert_eq!(kb(1023), 1);
/// assert_eq!(kb(1024), 1);
/// assert_eq!(kb(1025), 2);
/// ```
pub const fn kb(x: u64) -> u64 {
    x.div_ceil(1024)
}

/// Hint the kernel to populate the page cache for a file region.
///
/// This internally uses [`posix_fadvise`][fadvise] with
/// `POSIX_FADV_WILLNEED` advice. The file is opened with `O_NOATIME` so the
/// hint leaves no access-time trace.
///
/// [fadvise]: nix::fcntl::posix_fadvise
#[inline]
pub fn readahead(path: impl AsRef<Path>, offset: i64, length: i64) -> Result<(), Error> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NOATIME)
        .open(path)?;

    nix::fcntl::posix_fadvise(
        file.as_raw_fd(),
        offset,
        length,
        PosixFadviseAdvice::POSIX_FADV_WILLNEED,
    )?;
    Ok(())
}
