use std::fmt::Display;

/// Opaque identifier a participant picks at session start.
///
/// Uniqueness is not enforced anywhere in the protocol; two peers picking the
/// same identifier are indistinguishable on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty or whitespace only.
    ///
    /// The codec never rejects such identifiers; a session refuses to start
    /// with one.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blank() {
        assert!(PeerId::from("").is_blank());
        assert!(PeerId::from("  ").is_blank());
        assert!(!PeerId::from("alice").is_blank());
    }
}
