//! Path normalization for map keys.
//!
//! Paths captured by different build phases may disagree on separators, so
//! every path is normalized before it is used as a key or compared.

/// Normalize a file path to forward slashes.
///
/// Backslashes become `/`, runs of separators collapse to one, a leading
/// `./` is dropped and a Windows drive letter is lowercased.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_sep = false;

    for c in path.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
        } else {
            last_was_sep = false;
        }
        out.push(c);
    }

    let out = match out.strip_prefix("./") {
        Some(rest) => rest.to_string(),
        None => out,
    };

    lowercase_drive(out)
}

fn lowercase_drive(path: String) -> String {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_uppercase() {
        let mut lowered = path;
        lowered[..1].make_ascii_lowercase();
        return lowered;
    }
    path
}

/// Whether two paths refer to the same file after normalization.
pub fn same_file(a: &str, b: &str) -> bool {
    normalize_path(a) == normalize_path(b)
}
