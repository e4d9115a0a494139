//! File names derived from process ids.

/// Encode a process id as a file stem.
///
/// ASCII letters, digits and `-` pass through; every other byte, `_`
/// included, becomes `_xx` (lowercase hex). Distinct ids therefore never
/// share a file, and the result never contains a path separator.
pub fn file_stem(process_id: &str) -> String {
    let mut out = String::with_capacity(process_id.len());
    for byte in process_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push('_');
            out.push_str(&hex::encode([byte]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ids_are_unchanged() {
        assert_eq!(file_stem("survival-1"), "survival-1");
    }

    #[test]
    fn ids_that_differ_only_in_punctuation_stay_distinct() {
        assert_eq!(file_stem("a.b"), "a_2eb");
        assert_eq!(file_stem("a_b"), "a_5fb");
        assert_ne!(file_stem("a.b"), file_stem("a_b"));
        assert_ne!(file_stem("a_2eb"), file_stem("a.b"));
    }

    #[test]
    fn separators_are_escaped() {
        assert_eq!(file_stem("../etc"), "_2e_2e_2fetc");
        assert_eq!(file_stem("é"), "_c3_a9");
    }
}
