use chrono::Utc;

use quorum_core::{RunResult, Tokenizer};

use crate::critics::SelectedCritic;

/// Consensus weight at or above which a section gets the priority marker.
const PRIORITY_WEIGHT: f64 = 1.5;

/// Merge critic outputs into one weighted review artifact plus a synthetic
/// `multi-critic` RunResult aggregating usage. Sections are ordered weight
/// descending, then critic name, so the consensus text is deterministic
/// regardless of completion order.
pub fn merge_consensus(
    agent_label: &str,
    critic_input: &str,
    results: &[(SelectedCritic, RunResult)],
    tokenizer: Tokenizer,
    session_id: Option<&str>,
) -> RunResult {
    let mut ordered: Vec<&(SelectedCritic, RunResult)> = results.iter().collect();
    ordered.sort_by(|a, b| {
        b.0.weight
            .partial_cmp(&a.0.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.name.cmp(&b.0.name))
    });

    let mut sections = Vec::new();
    let mut token_lines = Vec::new();
    for (critic, result) in &ordered {
        let marker = if critic.weight >= PRIORITY_WEIGHT {
            "[PRIORITY] "
        } else {
            ""
        };
        sections.push(format!(
            "=== {marker}{} (weight {:.1}) ===\n{}",
            critic.name, critic.weight, result.response
        ));
        token_lines.push(format!(
            "{}={}",
            critic.name,
            tokenizer.count(&result.response)
        ));
    }
    sections.push(format!(
        "--- consensus of {} critic{}; tokens per critic: {} ---",
        ordered.len(),
        if ordered.len() == 1 { "" } else { "s" },
        token_lines.join(", ")
    ));
    let merged = sections.join("\n\n");

    let mut models: Vec<&str> = ordered.iter().map(|(_, r)| r.model.as_str()).collect();
    models.dedup();

    RunResult {
        agent: agent_label.to_string(),
        model: models.join("+"),
        provider: "consensus".into(),
        prompt: critic_input.to_string(),
        response: merged,
        prompt_tokens: results.iter().map(|(_, r)| r.prompt_tokens).sum(),
        completion_tokens: results.iter().map(|(_, r)| r.completion_tokens).sum(),
        total_tokens: results.iter().map(|(_, r)| r.total_tokens).sum(),
        // Critics ran in parallel; wall clock is the slowest one.
        duration_ms: results
            .iter()
            .map(|(_, r)| r.duration_ms)
            .fold(0.0, f64::max),
        estimated_cost_usd: results.iter().map(|(_, r)| r.estimated_cost_usd).sum(),
        fallback_used: results.iter().any(|(_, r)| r.fallback_used),
        original_model: None,
        fallback_reason: None,
        injected_context_tokens: 0,
        session_context_tokens: 0,
        knowledge_context_tokens: 0,
        session_id: session_id.map(str::to_string),
        timestamp: Utc::now().to_rfc3339(),
        log_file: None,
    }
}
