//! Character data handling: decoding, entity references, and re-escaping

use std::borrow::Cow;

use crate::config::MalformedAction;
use crate::error::LoadError;

/// Longest entity name considered before a reference is treated as malformed
const MAX_REFERENCE_LEN: usize = 64;

/// How malformed entity references are handled.
#[derive(Debug, Clone)]
pub struct EntityPolicy {
    /// Fail instead of repairing
    pub fatal: bool,
    /// Written in place of a malformed reference
    pub replacement: String,
}

/// One piece of raw (still escaped) character data.
#[derive(Debug, PartialEq)]
enum Piece<'a> {
    Literal(&'a str),
    /// Predefined or numeric reference, already resolved
    Char(char),
    /// Named reference the document's DTD would define
    Named(&'a str),
    /// `&` that does not start a well-formed reference
    Broken(&'a str),
}

/// Split raw character data at entity references.
fn pieces(raw: &str) -> impl Iterator<Item = Piece<'_>> {
    let mut rest = raw;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let Some(amp) = rest.find('&') else {
            let lit = rest;
            rest = "";
            return Some(Piece::Literal(lit));
        };
        if amp > 0 {
            let lit = &rest[..amp];
            rest = &rest[amp..];
            return Some(Piece::Literal(lit));
        }
        let (piece, used) = reference(rest);
        rest = &rest[used..];
        Some(piece)
    })
}

/// Parse a reference at the start of `s` (which begins with `&`).
///
/// Returns the piece and the number of bytes consumed.
fn reference(s: &str) -> (Piece<'_>, usize) {
    let body = &s[1..];
    let name_len = body
        .char_indices()
        .take_while(|&(i, c)| i < MAX_REFERENCE_LEN && is_name_char(c))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    let name = &body[..name_len];
    if !body[name_len..].starts_with(';') || name.is_empty() {
        return (Piece::Broken(&s[..1 + name_len]), 1 + name_len);
    }
    let used = name_len + 2;
    let resolved = match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => match name.strip_prefix('#') {
            Some(num) => {
                let code = match num.strip_prefix('x') {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => num.parse::<u32>().ok(),
                };
                match code.and_then(char::from_u32) {
                    Some(c) => Some(c),
                    None => return (Piece::Broken(&s[..used]), used),
                }
            }
            None => None,
        },
    };
    match resolved {
        Some(c) => (Piece::Char(c), used),
        None if is_name_start(name) => (Piece::Named(name), used),
        None => (Piece::Broken(&s[..used]), used),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '#')
}

fn is_name_start(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == ':')
        && !name.contains('#')
}

fn broken(policy: &EntityPolicy, text: &str) -> Result<(), LoadError> {
    if policy.fatal {
        return Err(LoadError::Entity(format!("malformed reference {text:?}")));
    }
    log::debug!("replacing malformed reference {text:?}");
    Ok(())
}

/// Re-serialize raw text content: resolved references are re-escaped, named
/// references pass through as `&name;`.
pub fn write_text(raw: &str, policy: &EntityPolicy, out: &mut Vec<u8>) -> Result<(), LoadError> {
    for piece in pieces(raw) {
        match piece {
            Piece::Literal(s) => escape_into(s, false, out),
            Piece::Char(c) => escape_into(c.encode_utf8(&mut [0; 4]), false, out),
            Piece::Named(name) => {
                out.push(b'&');
                out.extend_from_slice(name.as_bytes());
                out.push(b';');
            }
            Piece::Broken(s) => {
                broken(policy, s)?;
                escape_into(&policy.replacement, false, out);
            }
        }
    }
    Ok(())
}

/// Resolve raw text or attribute content to its value.
///
/// Named references the reader cannot resolve are kept literally.
pub fn unescape(raw: &str, policy: &EntityPolicy) -> Result<String, LoadError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut value = String::with_capacity(raw.len());
    for piece in pieces(raw) {
        match piece {
            Piece::Literal(s) => value.push_str(s),
            Piece::Char(c) => value.push(c),
            Piece::Named(name) => {
                value.push('&');
                value.push_str(name);
                value.push(';');
            }
            Piece::Broken(s) => {
                broken(policy, s)?;
                value.push_str(&policy.replacement);
            }
        }
    }
    Ok(value)
}

/// Escape markup characters. Attribute mode also escapes `"`.
pub fn escape_into(s: &str, attribute: bool, out: &mut Vec<u8>) {
    for b in s.bytes() {
        match b {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' if !attribute => out.extend_from_slice(b"&gt;"),
            b'"' if attribute => out.extend_from_slice(b"&quot;"),
            _ => out.push(b),
        }
    }
}

/// Decode input bytes as UTF-8, applying the malformed-input action.
pub fn decode(bytes: &[u8], action: MalformedAction) -> Result<Cow<'_, str>, LoadError> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(Cow::Borrowed(s)),
        Err(e) => {
            if action == MalformedAction::Report {
                return Err(LoadError::Malformed(format!(
                    "invalid UTF-8 after {} valid bytes",
                    e.valid_up_to()
                )));
            }
            let mut s = String::with_capacity(bytes.len());
            for chunk in bytes.utf8_chunks() {
                s.push_str(chunk.valid());
                if !chunk.invalid().is_empty() && action == MalformedAction::Replace {
                    s.push(char::REPLACEMENT_CHARACTER);
                }
            }
            Ok(Cow::Owned(s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenient() -> EntityPolicy {
        EntityPolicy {
            fatal: false,
            replacement: String::new(),
        }
    }

    fn strict() -> EntityPolicy {
        EntityPolicy {
            fatal: true,
            replacement: String::new(),
        }
    }

    fn text(raw: &str, policy: &EntityPolicy) -> Result<String, LoadError> {
        let mut out = Vec::new();
        write_text(raw, policy, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(text("hello world", &strict()).unwrap(), "hello world");
    }

    #[test]
    fn predefined_references_reescaped() {
        assert_eq!(
            text("a &amp; b &lt; c &gt; d", &strict()).unwrap(),
            "a &amp; b &lt; c &gt; d"
        );
        assert_eq!(text("&quot;q&apos;", &strict()).unwrap(), "\"q'");
    }

    #[test]
    fn bare_gt_escaped() {
        assert_eq!(text("a > b", &strict()).unwrap(), "a &gt; b");
    }

    #[test]
    fn numeric_references_resolved() {
        assert_eq!(text("caf&#233;", &strict()).unwrap(), "café");
        assert_eq!(text("&#x41;&#66;", &strict()).unwrap(), "AB");
        assert_eq!(text("&#38;", &strict()).unwrap(), "&amp;");
    }

    #[test]
    fn named_references_pass_through() {
        assert_eq!(
            text("x&nbsp;y &copy;", &strict()).unwrap(),
            "x&nbsp;y &copy;"
        );
    }

    #[test]
    fn broken_reference_fatal() {
        let err = text("AT&T rocks", &strict()).unwrap_err();
        assert!(matches!(err, LoadError::Entity(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn broken_reference_replaced() {
        assert_eq!(text("AT&T rocks", &lenient()).unwrap(), " rocks");
        let policy = EntityPolicy {
            fatal: false,
            replacement: "&".into(),
        };
        assert_eq!(text("AT&T rocks", &policy).unwrap(), "AT&amp; rocks");
        assert_eq!(text("bad &#xZZ; ref", &lenient()).unwrap(), "bad  ref");
    }

    #[test]
    fn unescape_values() {
        assert_eq!(unescape("1 &amp; 2", &strict()).unwrap(), "1 & 2");
        assert_eq!(unescape("x&nbsp;y", &strict()).unwrap(), "x&nbsp;y");
        assert_eq!(unescape("plain", &strict()).unwrap(), "plain");
    }

    #[test]
    fn escape_attribute_mode() {
        let mut out = Vec::new();
        escape_into("a\"b<c>&", true, &mut out);
        assert_eq!(out, b"a&quot;b&lt;c>&amp;");
    }

    #[test]
    fn decode_actions() {
        let bytes = b"ok\xffok";
        assert!(matches!(
            decode(bytes, MalformedAction::Report),
            Err(LoadError::Malformed(_))
        ));
        assert_eq!(
            decode(bytes, MalformedAction::Replace).unwrap(),
            "ok\u{FFFD}ok"
        );
        assert_eq!(decode(bytes, MalformedAction::Ignore).unwrap(), "okok");
        assert!(matches!(
            decode(b"fine", MalformedAction::Report).unwrap(),
            Cow::Borrowed("fine")
        ));
    }
}
