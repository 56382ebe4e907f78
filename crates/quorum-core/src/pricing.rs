use tracing::warn;

/// USD per 1M tokens, (input, output), keyed by `provider/model`.
const COST_TABLE: &[(&str, f64, f64)] = &[
    ("anthropic/claude-3-5-sonnet-20241022", 3.0, 15.0),
    ("anthropic/claude-3-5-haiku-20241022", 0.8, 4.0),
    ("openai/gpt-4o", 2.5, 10.0),
    ("openai/gpt-4o-mini", 0.15, 0.6),
    ("google/gemini-1.5-pro", 1.25, 5.0),
    ("google/gemini-1.5-flash", 0.075, 0.3),
    ("google/gemini-2.0-flash-exp", 0.0, 0.0),
    ("google/gemini-2.0-pro-exp", 0.0, 0.0),
];

/// Per-token (input, output) USD rates for a model, or None when unknown.
pub fn rates(model: &str) -> Option<(f64, f64)> {
    COST_TABLE
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|(_, input, output)| (input / 1_000_000.0, output / 1_000_000.0))
}

/// Estimated call cost. Unknown models are priced at zero and logged once
/// per call at warn level so the gap is visible in accounting.
pub fn estimate_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    match rates(model) {
        Some((input, output)) => {
            prompt_tokens as f64 * input + completion_tokens as f64 * output
        }
        None => {
            warn!(model, "no cost table entry; estimating cost as 0");
            0.0
        }
    }
}
