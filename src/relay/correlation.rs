//! Correlation tokens linking an outbound command to its reply.

use std::fmt;

use uuid::Uuid;

/// Unique identifier carried in the `id` field of a command frame and echoed
/// back by the peer in its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the id echoed by the peer.
    ///
    /// Returns `None` for anything that is not one of our ids.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn display_parses_back() {
        let id = CorrelationId::new();
        assert_eq!(CorrelationId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn foreign_ids_do_not_parse() {
        assert_eq!(CorrelationId::parse("42"), None);
        assert_eq!(CorrelationId::parse(""), None);
    }
}
