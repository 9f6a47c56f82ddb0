//! Pure path algebra for the forward-slash namespace.
//!
//! Every path handed to a back-end has been through [`clean`] and is
//! absolute relative to that back-end's own root. There are no drive
//! letters and no platform separators; `/` is the only separator.

use tracing::warn;

/// The only path separator in the virtual namespace.
pub const SEPARATOR: char = '/';

/// Reports whether `c` is the path separator.
pub fn is_path_separator(c: char) -> bool {
    c == SEPARATOR
}

/// Reports whether the path is absolute.
pub fn is_abs(path: &str) -> bool {
    path.starts_with(SEPARATOR)
}

/// Returns the shortest path name equivalent to `path` by purely lexical
/// processing: `.` elements are dropped, `..` elements collapse the
/// preceding element, trailing slashes are stripped (except for the root)
/// and leading `..` elements are preserved for non-absolute inputs.
///
/// The empty path cleans to `.`.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_owned();
    }

    let bytes = path.as_bytes();
    let rooted = bytes[0] == b'/';
    let n = bytes.len();

    let mut out: Vec<u8> = Vec::with_capacity(n);
    let mut r = 0;
    let mut dotdot = 0;
    if rooted {
        out.push(b'/');
        r = 1;
        dotdot = 1;
    }

    while r < n {
        if bytes[r] == b'/' {
            // empty element
            r += 1;
        } else if bytes[r] == b'.' && (r + 1 == n || bytes[r + 1] == b'/') {
            // . element
            r += 1;
        } else if bytes[r] == b'.'
            && r + 1 < n
            && bytes[r + 1] == b'.'
            && (r + 2 == n || bytes[r + 2] == b'/')
        {
            // .. element: backtrack if possible
            r += 2;
            if out.len() > dotdot {
                let mut w = out.len() - 1;
                while w > dotdot && out[w] != b'/' {
                    w -= 1;
                }
                out.truncate(w);
            } else if !rooted {
                // cannot backtrack; keep the leading .. element
                if !out.is_empty() {
                    out.push(b'/');
                }
                out.extend_from_slice(b"..");
                dotdot = out.len();
            }
        } else {
            // real element
            if (rooted && out.len() != 1) || (!rooted && !out.is_empty()) {
                out.push(b'/');
            }
            while r < n && bytes[r] != b'/' {
                out.push(bytes[r]);
                r += 1;
            }
        }
    }

    if out.is_empty() {
        return ".".to_owned();
    }
    // splits only ever happen on ASCII '/', so the output stays valid UTF-8
    String::from_utf8(out).expect("clean preserves utf-8")
}

/// Joins any number of elements into a single cleaned path, skipping empty
/// elements. A lone `/` first element contributes only its rootedness.
///
/// Absolute elements after the first indicate a caller bug; they are logged
/// and joined as-is (the extra separator collapses during cleaning).
pub fn join(elems: &[&str]) -> String {
    let mut first = true;
    let mut joined = String::new();
    for elem in elems {
        if elem.is_empty() {
            continue;
        }
        if !first && is_abs(elem) {
            warn!(element = *elem, "joining an absolute path element after the first");
        }
        if !first {
            joined.push(SEPARATOR);
        }
        joined.push_str(elem);
        first = false;
    }
    if joined.is_empty() {
        return String::new();
    }
    clean(&joined)
}

/// Splits `path` into a cleaned directory and the final element.
///
/// `split("/")` is `("/", "")`; a path without a separator splits into
/// `(".", path)`.
pub fn split(path: &str) -> (String, String) {
    let p = clean(path);
    if p == "/" {
        return ("/".to_owned(), String::new());
    }
    match p.rfind(SEPARATOR) {
        None => (".".to_owned(), p),
        Some(0) => ("/".to_owned(), p[1..].to_owned()),
        Some(idx) => {
            let file = p[idx + 1..].to_owned();
            (p[..idx].to_owned(), file)
        }
    }
}

/// Returns all but the last element of `path`.
///
/// `dir("/")` is `"/"`. For a bare name without a separator the result is
/// `"."` and a warning is logged; callers that need the pair should use
/// [`split`] instead.
pub fn dir(path: &str) -> String {
    if !path.contains(SEPARATOR) {
        warn!(path, "dir called on a path without a separator");
    }
    split(path).0
}

/// Returns the last element of `path`. Trailing slashes are removed first.
///
/// `base("/")` is `"/"`; the empty path yields `"."`.
pub fn base(path: &str) -> String {
    let p = clean(path);
    if p == "/" {
        return p;
    }
    match p.rfind(SEPARATOR) {
        None => p,
        Some(idx) => p[idx + 1..].to_owned(),
    }
}
