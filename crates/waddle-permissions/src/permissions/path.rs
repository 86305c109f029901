//! Permission path grammar
//!
//! Shared parsing and formatting rules for domain-prefixed dotted paths:
//!
//! ```text
//! [<sign>]<domain>::<segment>(.<segment>)*[.*]
//! ```
//!
//! `<sign>` is `+` or `-` and only meaningful for branches. A lone `*`
//! (optionally signed) is the superuser branch and carries no domain.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::PermissionError;

/// Separator between the domain token and the dotted path.
pub const DOMAIN_SEPARATOR: &str = "::";

/// Separator between path segments.
pub const SEGMENT_SEPARATOR: char = '.';

/// The bare wildcard segment.
pub const WILDCARD: &str = "*";

/// Namespace a permission belongs to.
///
/// `Unknown` is a sink for foreign or unparseable prefixes: values carrying it
/// can be constructed but are never valid, so they never match or get matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Core,
    Application,
    #[default]
    Unknown,
}

impl Domain {
    /// Prefix token used in the textual grammar, `None` for `Unknown`.
    pub fn token(&self) -> Option<&'static str> {
        match self {
            Domain::Core => Some("core"),
            Domain::Application => Some("app"),
            Domain::Unknown => None,
        }
    }

    /// Resolve a prefix token. Unregistered tokens degrade to `Unknown`.
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "core" => Domain::Core,
            "app" => Domain::Application,
            _ => Domain::Unknown,
        }
    }

    /// Two-bit code used by the binary wire format.
    pub(crate) fn wire_code(&self) -> u8 {
        match self {
            Domain::Unknown => 0,
            Domain::Core => 1,
            Domain::Application => 2,
        }
    }

    pub(crate) fn from_wire_code(code: u8) -> Self {
        match code & 0b11 {
            1 => Domain::Core,
            2 => Domain::Application,
            _ => Domain::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Domain::Unknown)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token().unwrap_or("unknown"))
    }
}

impl FromStr for Domain {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Domain::from_token(s) {
            Domain::Unknown => Err(PermissionError::InvalidPath(format!(
                "Unknown domain: {}",
                s
            ))),
            domain => Ok(domain),
        }
    }
}

/// Sign of a branch. Absent in the text means additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Additive,
    Subtractive,
}

impl Mode {
    /// Canonical sign prefix. Additive is the default and formats as nothing.
    pub fn sign(&self) -> &'static str {
        match self {
            Mode::Additive => "",
            Mode::Subtractive => "-",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Additive => write!(f, "additive"),
            Mode::Subtractive => write!(f, "subtractive"),
        }
    }
}

/// Result of splitting a permission string into its grammar components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParsedPath<'a> {
    Superuser {
        mode: Mode,
    },
    Scoped {
        mode: Mode,
        domain: Domain,
        path: &'a str,
        wildcard_level: usize,
    },
}

/// Split the optional sign off the front of a branch string.
pub(crate) fn split_sign(s: &str) -> (Mode, &str) {
    if let Some(rest) = s.strip_prefix('-') {
        (Mode::Subtractive, rest)
    } else if let Some(rest) = s.strip_prefix('+') {
        (Mode::Additive, rest)
    } else {
        (Mode::Additive, s)
    }
}

/// Find the first `::`, i.e. a `:` immediately followed by another `:`.
fn find_separator(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    (0..bytes.len().saturating_sub(1)).find(|&i| bytes[i] == b':' && bytes[i + 1] == b':')
}

/// Number of `.`-separated segments in a path, 0 for an empty path.
pub fn level(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split(SEGMENT_SEPARATOR).count()
    }
}

/// Segment count up to and including the first bare `*`, 0 without one.
pub fn wildcard_level(path: &str) -> usize {
    path.split(SEGMENT_SEPARATOR)
        .position(|segment| segment == WILDCARD)
        .map(|index| index + 1)
        .unwrap_or(0)
}

/// Parse `[<sign>]<domain>::<path>` or `[<sign>]*`.
///
/// Fails on an empty or whitespace-only prefix, an unregistered prefix token,
/// a missing or repeated `::`, an empty path or segment, and a `*` anywhere
/// but as the bare final segment.
pub(crate) fn parse(s: &str) -> Result<ParsedPath<'_>, PermissionError> {
    let (mode, body) = split_sign(s);

    if body == WILDCARD {
        return Ok(ParsedPath::Superuser { mode });
    }

    let separator = find_separator(body).ok_or_else(|| {
        PermissionError::InvalidPath(format!("Missing '{}' in permission: {}", DOMAIN_SEPARATOR, s))
    })?;

    let prefix = &body[..separator];
    let path = &body[separator + DOMAIN_SEPARATOR.len()..];

    if prefix.trim().is_empty() {
        return Err(PermissionError::InvalidPath(format!(
            "Empty domain prefix in permission: {}",
            s
        )));
    }

    let domain = Domain::from_token(prefix);
    if !domain.is_known() {
        return Err(PermissionError::InvalidPath(format!(
            "Unknown domain '{}' in permission: {}",
            prefix, s
        )));
    }

    if find_separator(path).is_some() {
        return Err(PermissionError::InvalidPath(format!(
            "Ambiguous '{}' in permission: {}",
            DOMAIN_SEPARATOR, s
        )));
    }

    if path.is_empty() {
        return Err(PermissionError::InvalidPath(format!(
            "Empty path in permission: {}",
            s
        )));
    }

    let segments: Vec<&str> = path.split(SEGMENT_SEPARATOR).collect();
    let last = segments.len() - 1;
    for (index, segment) in segments.iter().enumerate() {
        if segment.trim().is_empty() {
            return Err(PermissionError::InvalidPath(format!(
                "Empty segment in permission: {}",
                s
            )));
        }
        if segment.contains('*') && (index != last || *segment != WILDCARD) {
            return Err(PermissionError::InvalidPath(format!(
                "Wildcard must be the bare final segment in permission: {}",
                s
            )));
        }
    }

    Ok(ParsedPath::Scoped {
        mode,
        domain,
        path,
        wildcard_level: wildcard_level(path),
    })
}

/// Write `<domain>::<path>`, the inverse of [`parse`] for scoped paths.
pub(crate) fn write_scoped(f: &mut fmt::Formatter<'_>, domain: Domain, path: &str) -> fmt::Result {
    write!(f, "{}{}{}", domain, DOMAIN_SEPARATOR, path)
}

/// Case-insensitive comparison used for path equality and containment.
pub(crate) fn paths_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Case-insensitive `starts_with`.
pub(crate) fn starts_with_ignore_case(path: &str, prefix: &str) -> bool {
    path.len() >= prefix.len()
        && path.is_char_boundary(prefix.len())
        && path[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_tokens() {
        assert_eq!(Domain::from_token("core"), Domain::Core);
        assert_eq!(Domain::from_token("APP"), Domain::Application);
        assert_eq!(Domain::from_token("plugin"), Domain::Unknown);
        assert_eq!(Domain::Application.to_string(), "app");
        assert!("plugin".parse::<Domain>().is_err());
    }

    #[test]
    fn test_wildcard_level() {
        assert_eq!(wildcard_level("request.*"), 2);
        assert_eq!(wildcard_level("a.b.c.*"), 4);
        assert_eq!(wildcard_level("a"), 0);
        assert_eq!(wildcard_level("*"), 1);
    }

    #[test]
    fn test_level() {
        assert_eq!(level(""), 0);
        assert_eq!(level("a"), 1);
        assert_eq!(level("a.b.c"), 3);
    }

    #[test]
    fn test_parse_scoped() {
        let parsed = parse("-app::request.*").unwrap();
        assert_eq!(
            parsed,
            ParsedPath::Scoped {
                mode: Mode::Subtractive,
                domain: Domain::Application,
                path: "request.*",
                wildcard_level: 2,
            }
        );
    }

    #[test]
    fn test_parse_superuser() {
        assert_eq!(parse("*").unwrap(), ParsedPath::Superuser { mode: Mode::Additive });
        assert_eq!(parse("+*").unwrap(), ParsedPath::Superuser { mode: Mode::Additive });
        assert_eq!(parse("-*").unwrap(), ParsedPath::Superuser { mode: Mode::Subtractive });
    }

    #[test]
    fn test_single_colon_is_not_a_separator() {
        assert!(parse("app:a.b").is_err());
        let parsed = parse("app::a:b").unwrap();
        assert!(matches!(parsed, ParsedPath::Scoped { path: "a:b", .. }));
    }

    #[test]
    fn test_domain_wide_wildcard() {
        let parsed = parse("-core::*").unwrap();
        assert!(matches!(
            parsed,
            ParsedPath::Scoped {
                mode: Mode::Subtractive,
                domain: Domain::Core,
                path: "*",
                wildcard_level: 1,
            }
        ));
    }

    #[test]
    fn test_parse_rejects_grammar_violations() {
        for input in [
            "",
            "app::",
            "::a.b",
            "  ::a.b",
            "plugin::a",
            "app::a::b",
            "app::a..b",
            "app::a.",
            "app::a.*.b",
            "app::a*",
            "app::**",
            "-",
        ] {
            assert!(parse(input).is_err(), "expected '{}' to be rejected", input);
        }
    }
}
