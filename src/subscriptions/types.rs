//! Subscription triplet type and the subscription-file line format.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wildcard component, legal in any triplet position.
pub const WILDCARD: &str = "*";

/// A `(class, instance, user)` address identifying a notice's topic and
/// destination. `"*"` is a wildcard in any position.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triplet {
    pub class: String,
    pub instance: String,
    pub user: String,
}

impl Triplet {
    pub fn new(
        class: impl Into<String>,
        instance: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            instance: instance.into(),
            user: user.into(),
        }
    }

    /// Render as a subscription-file line (without newline).
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.class, self.instance, self.user)
    }
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.class, self.instance, self.user)
    }
}

/// A parsed subscription-file line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubLine {
    pub triplet: Triplet,
    /// Leading `!` marks an unsubscribe line. The marker is parsed but
    /// not yet honored; the manager treats the line as a subscription.
    pub unsubscribe: bool,
}

/// Parse one subscription-file line: `class,instance,user`, with an
/// optional trailing comment starting at `#`.
///
/// Returns `None` for blank/comment-only lines and for lines that don't
/// have exactly three components.
pub fn parse_line(line: &str) -> Option<SubLine> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (line, unsubscribe) = match line.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (line, false),
    };

    let mut parts = line.split(',').map(str::trim);
    let class = parts.next()?;
    let instance = parts.next()?;
    let user = parts.next()?;
    if parts.next().is_some() || class.is_empty() {
        return None;
    }

    Some(SubLine {
        triplet: Triplet::new(class, instance, user),
        unsubscribe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_line() {
        let parsed = parse_line("help,linux,*").unwrap();
        assert_eq!(parsed.triplet, Triplet::new("help", "linux", "*"));
        assert!(!parsed.unsubscribe);
    }

    #[test]
    fn test_parse_with_comment() {
        let parsed = parse_line("help,linux,* # kernel questions").unwrap();
        assert_eq!(parsed.triplet, Triplet::new("help", "linux", "*"));
    }

    #[test]
    fn test_parse_unsubscribe_marker() {
        let parsed = parse_line("!offtopic,*,*").unwrap();
        assert_eq!(parsed.triplet, Triplet::new("offtopic", "*", "*"));
        assert!(parsed.unsubscribe);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   # only a comment").is_none());
        assert!(parse_line("help,linux").is_none());
        assert!(parse_line("a,b,c,d").is_none());
    }

    #[test]
    fn test_line_roundtrip() {
        let triplet = Triplet::new("help", "linux", "someone");
        let parsed = parse_line(&triplet.to_line()).unwrap();
        assert_eq!(parsed.triplet, triplet);
    }
}
