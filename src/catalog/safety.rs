use regex::RegexSet;

use super::Technique;

/// Decides whether a technique is non-destructive enough for safe-mode
/// executions. Evaluated once when an execution starts; catalog changes do
/// not affect in-flight runs.
pub trait SafetyClassifier: Send + Sync {
    fn is_safe(&self, technique: &Technique) -> bool;
}

/// Information about a destructive-pattern match.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DestructiveMatch {
    pub reason: String,
    pub command: String,
}

/// Classifies technique commands against a set of destructive patterns.
/// A technique is safe iff no pattern matches its command.
pub struct PatternSafetyClassifier {
    patterns: RegexSet,
    pattern_reasons: Vec<String>,
}

impl PatternSafetyClassifier {
    /// Create a new classifier from a list of (pattern, reason) tuples.
    /// The RegexSet is compiled once for efficient multi-pattern matching.
    pub fn new(patterns: &[(String, String)]) -> Result<Self, regex::Error> {
        let (regexes, reasons): (Vec<_>, Vec<_>) = patterns.iter().cloned().unzip();
        Ok(Self {
            patterns: RegexSet::new(&regexes)?,
            pattern_reasons: reasons,
        })
    }

    /// Check a command string. Returns Some(DestructiveMatch) if any pattern
    /// matches, None if the command is considered safe.
    pub fn check(&self, command: &str) -> Option<DestructiveMatch> {
        let matches: Vec<_> = self.patterns.matches(command).into_iter().collect();
        if matches.is_empty() {
            None
        } else {
            Some(DestructiveMatch {
                reason: self.pattern_reasons[matches[0]].clone(),
                command: command.to_string(),
            })
        }
    }
}

impl SafetyClassifier for PatternSafetyClassifier {
    fn is_safe(&self, technique: &Technique) -> bool {
        self.check(&technique.command).is_none()
    }
}
