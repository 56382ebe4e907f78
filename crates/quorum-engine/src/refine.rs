use regex::Regex;

use quorum_core::{ConfigError, RefinementConfig};

/// Why the refinement loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConvergenceReason {
    /// The latest review raised zero critical issues.
    Success,
    /// Issue count failed to drop between iterations.
    NoProgress { previous: usize, current: usize },
    /// Iteration budget exhausted with issues still open.
    MaxIterations,
}

impl ConvergenceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoProgress { .. } => "no_progress",
            Self::MaxIterations => "max_iterations",
        }
    }
}

/// Finds critical issues in a review: contiguous blocks containing a
/// critical keyword (lowercased match) or matching an issue pattern.
pub struct IssueDetector {
    keywords: Vec<String>,
    patterns: Vec<Regex>,
}

impl IssueDetector {
    pub fn new(config: &RefinementConfig) -> Result<Self, ConfigError> {
        let patterns = config
            .issue_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    detail: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            keywords: config.critical_keywords.iter().map(|k| k.to_lowercase()).collect(),
            patterns,
        })
    }

    /// The critical blocks of a review, in document order.
    pub fn extract<'a>(&self, review: &'a str) -> Vec<&'a str> {
        review
            .split("\n\n")
            .map(str::trim)
            .filter(|block| !block.is_empty())
            .filter(|block| self.is_critical(block))
            .collect()
    }

    pub fn count(&self, review: &str) -> usize {
        self.extract(review).len()
    }

    fn is_critical(&self, block: &str) -> bool {
        let lowered = block.to_lowercase();
        self.keywords.iter().any(|kw| lowered.contains(kw))
            || self.patterns.iter().any(|p| p.is_match(block))
    }
}

/// The builder's follow-up prompt for one refinement iteration.
pub fn refinement_prompt(original_prompt: &str, issues: &[&str]) -> String {
    let issue_list = issues
        .iter()
        .enumerate()
        .map(|(i, issue)| format!("{}. {issue}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Original request: {original_prompt}\n\n\
         Your previous answer was reviewed and these critical issues were raised:\n\
         {issue_list}\n\n\
         Produce a revised answer that resolves every issue above while keeping what already works."
    )
}

/// One convergence check. `previous` is the issue count going into the
/// iteration, `current` the count after it.
pub fn check_convergence(
    previous: usize,
    current: usize,
    iteration: u32,
    max_iterations: u32,
) -> Option<ConvergenceReason> {
    if current == 0 {
        return Some(ConvergenceReason::Success);
    }
    if current >= previous {
        return Some(ConvergenceReason::NoProgress { previous, current });
    }
    if iteration >= max_iterations {
        return Some(ConvergenceReason::MaxIterations);
    }
    None
}
