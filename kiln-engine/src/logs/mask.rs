// Secret masking
// Longest-match literal replacement applied on ingest, before chunks reach
// storage or any subscriber.

/// A set of literals to mask with a fixed token.
#[derive(Debug, Clone)]
pub struct MaskSet {
    token: String,
    /// Longest first, so overlapping secrets mask greedily.
    literals: Vec<String>,
}

impl MaskSet {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            literals: Vec::new(),
        }
    }

    /// Register a literal. Empty and single-character values are ignored;
    /// masking them would shred ordinary output.
    pub fn add(&mut self, literal: impl Into<String>) {
        let literal = literal.into();
        if literal.len() < 2 || self.literals.contains(&literal) {
            return;
        }
        let at = self
            .literals
            .iter()
            .position(|l| l.len() < literal.len())
            .unwrap_or(self.literals.len());
        self.literals.insert(at, literal);
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    /// Replace every registered literal in the text with the token.
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for literal in &self.literals {
            if out.contains(literal.as_str()) {
                out = out.replace(literal.as_str(), &self.token);
            }
        }
        out
    }
}
