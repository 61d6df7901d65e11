//! Line grammar of the Tor control protocol.
//!
//! Pure parsing helpers shared by the command replies and the event stream.
//! Nothing here performs I/O.
//!
//! # Reply Lines
//!
//! Every line Tor writes on the control port has the shape
//! `<3-digit code><separator><text>`:
//!
//! ```text
//!   250 OK                      ◄── final line of a reply
//!   250-version=0.4.8.10        ◄── one of several reply lines
//!   250+ns/all=                 ◄── data block follows, ends with "."
//!   650 CIRC 12 BUILT ...       ◄── asynchronous event
//! ```
//!
//! # Quote-Aware Fields
//!
//! [`split_fields`] splits on a delimiter except inside double-quoted spans,
//! which is what SETCONF values, AUTHENTICATE arguments and log messages need.

/// Splits `line` at `delimiter`, treating double-quoted spans as opaque.
///
/// Quotes toggle the escaped state and stay part of the field. A missing
/// closing quote leaves the rest of the line quoted. Consecutive delimiters
/// produce empty fields; an empty line produces no fields at all.
///
/// ```rust
/// use torctl_rs::codec::split_fields;
///
/// assert_eq!(split_fields("a \"b c\" d", ' '), vec!["a", "\"b c\"", "d"]);
/// assert!(split_fields("", ' ').is_empty());
/// ```
pub fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    if line.is_empty() {
        return Vec::new();
    }

    let mut fields = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in line.chars() {
        if c == '"' {
            escaped = !escaped;
        }
        if c == delimiter && !escaped {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);

    fields
}

/// Separator between the status code and the text of a reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `' '`: last line of a reply.
    End,
    /// `'-'`: more reply lines follow.
    Continuation,
    /// `'+'`: a dot-terminated data block follows.
    Data,
}

/// One classified control-protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine<'a> {
    /// Three-digit status code.
    pub code: u16,
    /// Separator following the code.
    pub separator: Separator,
    /// Text after the separator.
    pub text: &'a str,
}

impl<'a> ReplyLine<'a> {
    /// Classifies a line (without its trailing CRLF).
    ///
    /// Returns `None` when the line does not start with a three-digit code
    /// or carries an unknown separator.
    pub fn parse(line: &'a str) -> Option<Self> {
        let code_part = line.get(..3)?;
        if !code_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let code = code_part.parse().ok()?;

        let separator = match line.as_bytes().get(3) {
            None | Some(b' ') => Separator::End,
            Some(b'-') => Separator::Continuation,
            Some(b'+') => Separator::Data,
            Some(_) => return None,
        };

        Some(Self {
            code,
            separator,
            text: line.get(4..).unwrap_or(""),
        })
    }

    /// Returns true for 2xx codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Returns true when `code` is a 2xx status code.
pub fn is_success_code(code: u16) -> bool {
    (200..300).contains(&code)
}

/// Splits `key=value` at the first `=`, trimming both sides.
///
/// A line without `=` yields the trimmed key and `None`.
pub fn parse_key_value(line: &str) -> (String, Option<String>) {
    match line.split_once('=') {
        Some((key, value)) => (key.trim().to_string(), Some(value.trim().to_string())),
        None => (line.trim().to_string(), None),
    }
}

/// Quotes a control-protocol argument when it contains a space.
///
/// Embedded backslashes and quotes are escaped inside the quoted form.
pub fn quote_value(value: &str) -> String {
    if value.contains(' ') {
        quote_string(value)
    } else {
        value.to_string()
    }
}

/// Always wraps `value` in double quotes, escaping `\` and `"`.
pub fn quote_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '\\' || c == '"' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Removes one level of surrounding double quotes, if present.
pub fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn unquoted_split_matches_std_split(line in "[a-z ]{1,40}") {
            let ours = split_fields(&line, ' ');
            let std: Vec<String> = line.split(' ').map(String::from).collect();
            prop_assert_eq!(ours, std);
        }

        #[test]
        fn split_preserves_every_non_delimiter_char(line in "[a-z \"]{0,40}") {
            let fields = split_fields(&line, ' ');
            let rejoined: usize = fields.iter().map(|f| f.len()).sum();
            let non_split = line.len() - (fields.len().saturating_sub(1));
            prop_assert_eq!(rejoined, non_split);
        }

        #[test]
        fn quoted_value_is_one_field(value in "[a-z ]{0,20}") {
            let line = format!("SETCONF k={}", quote_value(&value));
            let fields = split_fields(&line, ' ');
            prop_assert_eq!(fields.len(), 2);
        }
    }
}
