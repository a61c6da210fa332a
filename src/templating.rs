//! Script Templating - Placeholder Substitution
//!
//! The base script carries bare placeholder tokens. Each field produces one
//! substitution map; every token occurrence is replaced in a single
//! left-to-right pass, so substituted text is never scanned again.

use crate::field::{Field, KeycapKind};

pub const TOKEN_MAIN: &str = "LLB";
pub const TOKEN_SHIFT: &str = "LLT";
pub const TOKEN_FN: &str = "LRT";
pub const TOKEN_CENTER: &str = "LC";
pub const TOKEN_MODEL_PATH: &str = "MODEL_PATH";
pub const TOKEN_CENTER_ROTATION: &str = "CENTER_ROTATION";
pub const TOKEN_NEED_BUMP: &str = "NEED_BUMP";

/// Escape text for embedding inside a script string literal
pub fn escape_script_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\'' => escaped.push_str("\\'"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if c.is_control() => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Inverse of [`escape_script_string`]
pub fn unescape_script_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(marker @ ('x' | 'u' | 'U')) => {
                let width = match marker {
                    'x' => 2,
                    'u' => 4,
                    _ => 6,
                };
                let digits: String = chars.clone().take(width).collect();
                match decode_code_point(&digits, width) {
                    Some(decoded) => {
                        out.push(decoded);
                        chars.nth(width - 1);
                    }
                    None => out.push(marker),
                }
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// `\x`, `\u` and `\U` escapes carry exactly `width` hex digits
fn decode_code_point(digits: &str, width: usize) -> Option<char> {
    if digits.len() != width || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok().and_then(char::from_u32)
}

/// Ordered token -> value pairs for one field
pub fn substitutions(field: &Field) -> Vec<(&'static str, String)> {
    let general = field.kind == KeycapKind::General;
    let centered = field.kind == KeycapKind::Centered;
    let label = |on: bool, text: &str| if on { escape_script_string(text) } else { String::new() };

    vec![
        (TOKEN_MAIN, label(general, &field.main)),
        (TOKEN_SHIFT, label(general, &field.shift)),
        (TOKEN_FN, label(general, &field.fn_label)),
        (TOKEN_CENTER, label(centered, &field.center)),
        (TOKEN_MODEL_PATH, field.model.shape_path().to_string()),
        (TOKEN_CENTER_ROTATION, field.angle.to_string()),
        (TOKEN_NEED_BUMP, field.need_bump.to_string()),
    ]
}

/// Replace every occurrence of every token.
///
/// At each position the longest matching token wins, so overlapping tokens
/// resolve deterministically.
pub fn substitute(template: &str, replacements: &[(&str, String)]) -> String {
    let mut ordered: Vec<&(&str, String)> =
        replacements.iter().filter(|(token, _)| !token.is_empty()).collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while let Some(c) = rest.chars().next() {
        for (token, value) in &ordered {
            if rest.starts_with(token) {
                out.push_str(value);
                rest = &rest[token.len()..];
                continue 'scan;
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

pub fn render_field_script(template: &str, field: &Field) -> String {
    substitute(template, &substitutions(field))
}

/// Replace characters that are illegal in filenames with words
pub fn make_filename_safe(name: &str) -> String {
    let mut safe = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '/' => safe.push_str("slash"),
            '\\' => safe.push_str("backslash"),
            ':' => safe.push_str("colon"),
            '*' => safe.push_str("asterisk"),
            '?' => safe.push_str("question"),
            '"' => safe.push_str("quote"),
            '<' => safe.push_str("less"),
            '>' => safe.push_str("greater"),
            '|' => safe.push_str("pipe"),
            other => safe.push(other),
        }
    }
    safe
}

pub fn artifact_filename(field: &Field) -> String {
    let bump = if field.need_bump { "Bump" } else { "" };
    let tag = field.model.tag();

    match field.kind {
        KeycapKind::General => format!(
            "Keycap_{}_{}_{}_{}_{}.stl",
            make_filename_safe(&field.main),
            make_filename_safe(&field.shift),
            make_filename_safe(&field.fn_label),
            bump,
            tag
        ),
        KeycapKind::Centered => format!(
            "Keycap_{}_{}_{}_{}.stl",
            make_filename_safe(&field.center),
            field.angle,
            bump,
            tag
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::KeycapModel;

    #[test]
    fn test_escape_specials() {
        assert_eq!(escape_script_string(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape_script_string("a\\b"), "a\\\\b");
        assert_eq!(escape_script_string("x\ny\tz"), "x\\ny\\tz");
        assert_eq!(escape_script_string("it's"), "it\\'s");
    }

    #[test]
    fn test_unescape_inverts_escape() {
        for sample in ["", "plain", "\\", "\"\"", "line\nbreak", "\ttab\r", "mixed \\\" '\n"] {
            assert_eq!(unescape_script_string(&escape_script_string(sample)), sample);
        }
    }

    #[test]
    fn test_other_control_chars_use_unicode_escape() {
        assert_eq!(escape_script_string("a\u{1b}[0m"), "a\\u001b[0m");
        assert_eq!(escape_script_string("nul\0"), "nul\\u0000");
        for sample in ["\u{1b}[1mbold", "\0", "bell\u{7}", "\\u0041 literal"] {
            let escaped = escape_script_string(sample);
            assert!(!escaped.chars().any(char::is_control));
            assert_eq!(unescape_script_string(&escaped), sample);
        }
    }

    #[test]
    fn test_unescape_hex_forms() {
        assert_eq!(unescape_script_string("\\x41\\u03a9\\U01f600"), "AΩ😀");
        assert_eq!(unescape_script_string("\\uzz"), "uzz");
    }

        #[test]
    fn test_substitute_global() {
        let template = "LLB + LLB + LLB";
        let out = substitute(template, &[("LLB", "x".to_string())]);
        assert_eq!(out, "x + x + x");
    }

    #[test]
    fn test_substituted_text_not_rescanned() {
        let field = Field::general("LC", "", "");
        let out = render_field_script("[LLB|LC]", &field);
        assert_eq!(out, "[LC|]");
    }

    #[test]
    fn test_centered_blanks_corner_labels() {
        let mut field = Field::centered("▲", 30).with_model(KeycapModel::Flat);
        field.main = "ignored".to_string();
        let out = render_field_script("LLB|LC|CENTER_ROTATION|MODEL_PATH|NEED_BUMP", &field);
        assert_eq!(out, "|▲|30|Cap_Flat.stl|false");
    }

    #[test]
    fn test_filename_general() {
        let field = Field::general("Q", "", "");
        assert_eq!(artifact_filename(&field), "Keycap_Q____U.stl");
    }

    #[test]
    fn test_filename_centered_bump() {
        let field = Field::centered("▲", 30)
            .with_bump(true)
            .with_model(KeycapModel::Flat);
        assert_eq!(artifact_filename(&field), "Keycap_▲_30_Bump_F.stl");
    }

    #[test]
    fn test_filename_safe_words() {
        assert_eq!(make_filename_safe("a/b\\c"), "aslashbbackslashc");
        assert_eq!(make_filename_safe("<?>"), "lessquestiongreater");
        assert_eq!(make_filename_safe("|:*\""), "pipecolonasteriskquote");
    }
}
