//! `file://` URI codec for the state file.
//!
//! Paths are URI-encoded on disk so whitespace and control characters
//! survive the whitespace-separated record format.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

const SCHEME: &str = "file://";

fn is_uri_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'/' | b'-'
                | b'.'
                | b'_'
                | b'~'
                | b'+'
                | b'('
                | b')'
                | b'!'
                | b'$'
                | b'&'
                | b'\''
                | b'*'
                | b','
                | b';'
                | b'='
                | b':'
                | b'@'
        )
}

pub fn to_file_uri(path: &Path) -> String {
    let bytes = path.as_os_str().as_bytes();
    let mut out = String::with_capacity(SCHEME.len() + bytes.len());
    out.push_str(SCHEME);
    for &b in bytes {
        if is_uri_safe(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub fn from_file_uri(uri: &str) -> Option<PathBuf> {
    let rest = uri.strip_prefix(SCHEME)?;
    // we never write an authority component; the path must be absolute
    if !rest.starts_with('/') {
        return None;
    }

    let mut bytes = Vec::with_capacity(rest.len());
    let mut chars = rest.bytes();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let decode = |c: u8| (c as char).to_digit(16);
            let value = decode(hi)? * 16 + decode(lo)?;
            bytes.push(value as u8);
        } else {
            bytes.push(b);
        }
    }
    Some(PathBuf::from(OsString::from_vec(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn plain_paths_pass_through() {
        let uri = to_file_uri(Path::new("/usr/lib/libc.so.6"));
        assert_eq!(uri, "file:///usr/lib/libc.so.6");
        assert_eq!(
            from_file_uri(&uri).unwrap(),
            PathBuf::from("/usr/lib/libc.so.6")
        );
    }

    #[test]
    fn whitespace_is_escaped() {
        let path = Path::new("/opt/My App/bin/app");
        let uri = to_file_uri(path);
        assert!(!uri.contains(' '));
        assert_eq!(from_file_uri(&uri).unwrap(), path);
    }

    #[test]
    fn rejects_foreign_uris() {
        assert_eq!(from_file_uri("http://example.com/x"), None);
        assert_eq!(from_file_uri("file://host/path"), None);
        assert_eq!(from_file_uri("/no/scheme"), None);
    }

    #[test]
    fn rejects_truncated_escapes() {
        assert_eq!(from_file_uri("file:///bad%2"), None);
        assert_eq!(from_file_uri("file:///bad%zz"), None);
    }

    proptest! {
        #[test]
        fn roundtrips_arbitrary_absolute_paths(
            segments in prop::collection::vec("[ -~]{1,20}", 1..5)
        ) {
            let mut path = PathBuf::from("/");
            for segment in &segments {
                // '/' inside a segment would change the path structure
                let segment = segment.replace('/', "_");
                path.push(segment);
            }
            let uri = to_file_uri(&path);
            prop_assert!(uri.split_whitespace().count() == 1);
            prop_assert_eq!(from_file_uri(&uri).unwrap(), path);
        }
    }
}
