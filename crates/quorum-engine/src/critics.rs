use tracing::{info, instrument};

use quorum_core::CriticsConfig;

/// One critic chosen for a review round.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectedCritic {
    pub name: String,
    pub weight: f64,
    pub score: usize,
}

/// Keyword-relevance critic selection with min/max cardinality.
///
/// Scores are case-insensitive substring occurrence counts over the prompt
/// and builder output. Ties keep the configured order. When dynamic
/// selection is off the full static list is returned.
#[instrument(skip(prompt, builder_output, config))]
pub fn select_critics(
    prompt: &str,
    builder_output: &str,
    config: &CriticsConfig,
) -> Vec<SelectedCritic> {
    if config.members.is_empty() {
        return Vec::new();
    }

    if !config.dynamic_selection {
        return config
            .members
            .iter()
            .map(|c| SelectedCritic {
                name: c.name.clone(),
                weight: c.weight,
                score: 0,
            })
            .collect();
    }

    let haystack = format!("{prompt}\n{builder_output}").to_lowercase();

    let mut scored: Vec<SelectedCritic> = config
        .members
        .iter()
        .map(|c| {
            let score: usize = c
                .keywords
                .iter()
                .map(|kw| occurrences(&haystack, &kw.to_lowercase()))
                .sum();
            SelectedCritic {
                name: c.name.clone(),
                weight: c.weight,
                score,
            }
        })
        .collect();

    let skipped: Vec<String> = scored
        .iter()
        .filter(|c| c.score == 0)
        .map(|c| c.name.clone())
        .collect();

    scored.retain(|c| c.score > 0);
    // Stable sort: equal scores keep configured order.
    scored.sort_by(|a, b| b.score.cmp(&a.score));

    // Pad up to min_critics from the configured fallbacks, then from the
    // remaining members in configured order.
    if scored.len() < config.min_critics {
        let pool = config
            .fallback_critics
            .iter()
            .chain(config.members.iter().map(|c| &c.name));
        for name in pool {
            if scored.len() >= config.min_critics {
                break;
            }
            if scored.iter().any(|c| &c.name == name) {
                continue;
            }
            if let Some(member) = config.members.iter().find(|c| &c.name == name) {
                scored.push(SelectedCritic {
                    name: member.name.clone(),
                    weight: member.weight,
                    score: 0,
                });
            }
        }
    }

    if scored.len() > config.max_critics {
        scored.truncate(config.max_critics);
    }

    info!(
        selected = ?scored.iter().map(|c| format!("{}:{}", c.name, c.score)).collect::<Vec<_>>(),
        skipped = ?skipped,
        "critic selection"
    );

    scored
}

/// Non-overlapping substring occurrence count.
fn occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::CriticConfig;

    fn config() -> CriticsConfig {
        CriticsConfig {
            members: vec![
                CriticConfig {
                    name: "security".into(),
                    weight: 1.5,
                    keywords: vec!["jwt".into(), "auth".into(), "password".into()],
                },
                CriticConfig {
                    name: "performance".into(),
                    weight: 1.0,
                    keywords: vec!["cache".into(), "query".into(), "latency".into()],
                },
                CriticConfig {
                    name: "quality".into(),
                    weight: 1.0,
                    keywords: vec!["refactor".into(), "design pattern".into()],
                },
            ],
            dynamic_selection: true,
            reselect_each_iteration: true,
            min_critics: 1,
            max_critics: 3,
            fallback_critics: vec!["quality".into()],
        }
    }

    #[test]
    fn static_list_when_dynamic_disabled() {
        let mut cfg = config();
        cfg.dynamic_selection = false;
        let selected = select_critics("anything", "at all", &cfg);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].name, "security");
    }

    #[test]
    fn keyword_hits_select_and_rank() {
        let cfg = config();
        let selected = select_critics(
            "Build a JWT auth endpoint",
            "Here is the auth flow with JWT and a query cache",
            &cfg,
        );
        // security: jwt x2 + auth x2 = 4; performance: cache + query = 2
        assert_eq!(selected[0].name, "security");
        assert_eq!(selected[0].score, 4);
        assert_eq!(selected[1].name, "performance");
        assert_eq!(selected[1].score, 2);
        assert!(!selected.iter().any(|c| c.name == "quality"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let cfg = config();
        let selected = select_critics("JWT AUTH", "", &cfg);
        assert_eq!(selected[0].name, "security");
        assert_eq!(selected[0].score, 2);
    }

    #[test]
    fn no_hits_pads_from_fallbacks() {
        let cfg = config();
        let selected = select_critics("Render a static HTML landing page", "plain markup", &cfg);
        assert_eq!(selected.len(), cfg.min_critics);
        assert_eq!(selected[0].name, "quality");
        assert_eq!(selected[0].score, 0);
    }

    #[test]
    fn min_two_pads_beyond_fallbacks() {
        let mut cfg = config();
        cfg.min_critics = 2;
        let selected = select_critics("nothing relevant here", "", &cfg);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].name, "quality"); // fallback first
        assert_eq!(selected[1].name, "security"); // then configured order
    }

    #[test]
    fn max_critics_truncates_lowest_scores() {
        let mut cfg = config();
        cfg.max_critics = 1;
        let selected = select_critics("jwt auth cache query refactor", "", &cfg);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "security");
    }

    #[test]
    fn ties_keep_configured_order() {
        let cfg = config();
        // One hit each for security (jwt) and performance (cache).
        let selected = select_critics("jwt cache", "", &cfg);
        assert_eq!(selected[0].name, "security");
        assert_eq!(selected[1].name, "performance");
    }

    #[test]
    fn landing_page_scenario_skips_security() {
        let cfg = config();
        let selected = select_critics(
            "Render a static HTML landing page",
            "Use a design pattern for the template cache",
            &cfg,
        );
        let names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();
        assert!(!names.contains(&"security"));
        assert!(names.iter().all(|n| *n == "performance" || *n == "quality"));
        assert!(selected.len() >= cfg.min_critics);
    }

    #[test]
    fn occurrence_counting() {
        assert_eq!(occurrences("jwt and jwt again", "jwt"), 2);
        assert_eq!(occurrences("nothing", "jwt"), 0);
        assert_eq!(occurrences("aaa", "aa"), 1); // non-overlapping
        assert_eq!(occurrences("text", ""), 0);
    }

    #[test]
    fn empty_member_list_selects_nothing() {
        let cfg = CriticsConfig::default();
        assert!(select_critics("jwt", "auth", &cfg).is_empty());
    }
}
