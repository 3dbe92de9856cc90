//! Generic `key=value`/bare-flag field scanning for command arguments
//! (`<VERB>[,<key>=<value>]*`). Fields may arrive in any order and any
//! subset may be present; this module only locates the byte range of a
//! field's value so the typed parsers in [`crate::proto::parse`] can do the
//! actual conversion. Ported from the original firmware's `api_parse.c`
//! field-scan helper, generalized from its per-command switch into a single
//! reusable scan.

/// A field starts either at the beginning of the remainder or right after a
/// `,` separator; it may never match mid-token (so `SET_CFG,odr_hz=100`
/// doesn't spuriously match a field named `hz`).
fn is_boundary(s: &[u8], pos: usize) -> bool {
    pos == 0 || s[pos - 1] == b','
}

/// Find `key=` at a field boundary and return the remainder starting right
/// after the `=`, suitable for handing to a [`crate::proto::parse`] parser.
/// `s` must be NUL-terminated (see [`crate::command`]'s line-copy step) so
/// a value at the end of the line still has a terminator to parse against.
pub fn find_field<'a>(s: &'a [u8], key: &str) -> Option<&'a [u8]> {
    let kb = key.as_bytes();
    let mut i = 0;
    while i + kb.len() < s.len() {
        if is_boundary(s, i) && s[i..i + kb.len()] == *kb && s[i + kb.len()] == b'=' {
            return Some(&s[i + kb.len() + 1..]);
        }
        i += 1;
    }
    None
}

/// True if the bare token `flag` appears at a field boundary, terminated by
/// `,`, NUL, or end of slice (and not immediately followed by `=`, which
/// would make it a `key=value` field instead).
pub fn has_flag(s: &[u8], flag: &str) -> bool {
    let fb = flag.as_bytes();
    let mut i = 0;
    while i + fb.len() <= s.len() {
        if is_boundary(s, i) && s[i..i + fb.len()] == *fb {
            match s.get(i + fb.len()) {
                None | Some(0) | Some(b',') => return true,
                _ => {}
            }
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_field_anywhere_in_order() {
        let s = b"burst_ms=500,hb_ms=200\0";
        assert_eq!(find_field(s, "hb_ms"), Some(&b"200\0"[..]));
        assert_eq!(find_field(s, "burst_ms"), Some(&b"500,hb_ms=200\0"[..]));
    }

    #[test]
    fn does_not_match_mid_token() {
        let s = b"odr_hz=100\0";
        assert_eq!(find_field(s, "hz"), None);
    }

    #[test]
    fn missing_field_is_none() {
        assert_eq!(find_field(b"odr_hz=100\0", "burst_ms"), None);
    }

    #[test]
    fn flag_detection_requires_boundary_and_terminator() {
        let s = b"phase=hold_zero,FORCE\0";
        assert!(has_flag(s, "FORCE"));
        assert!(!has_flag(s, "hold_zero"));
        assert!(!has_flag(b"FORCED\0", "FORCE"));
    }
}
