//! Complexity scoring, tier mapping and provider/model routing (§4.C).

use crate::prd::{Priority, PrdItem};
use crate::provider::{Provider, ProviderSlot, Tier};
use crate::rate_limiter::RateLimiter;

const ESCALATE_SUBSTRINGS: [&str; 14] = [
    "refactor",
    "migration",
    "architecture",
    "redesign",
    "rewrite",
    "security",
    "authentication",
    "authorization",
    "performance",
    "database",
    "schema",
    "integration",
    "api design",
    "state management",
];

const DEESCALATE_SUBSTRINGS: [&str; 17] = [
    "typo",
    "tooltip",
    "color",
    "padding",
    "margin",
    "spacing",
    "rename",
    "comment",
    "documentation",
    "readme",
    "copy",
    "icon",
    "label",
    "text",
    "string",
    "css",
    "style",
];

/// Pure function: scores a backlog item 0–100.
pub fn score_complexity(item: &PrdItem) -> u32 {
    let mut score: i32 = 50;

    if let Some(hint) = item.complexity_hint.as_deref() {
        return match hint {
            "low" => 20,
            "medium" => 50,
            "high" => 80,
            _ => 50,
        };
    }

    score += match item.priority {
        Priority::High => 10,
        Priority::Low => -10,
        Priority::Medium => 0,
    };

    let desc_len = item.description.len();
    score += if desc_len > 500 {
        15
    } else if desc_len > 200 {
        5
    } else if desc_len < 50 {
        -10
    } else {
        0
    };

    let criteria_count = item.acceptance_criteria.len();
    score += if criteria_count > 8 {
        15
    } else if criteria_count > 4 {
        5
    } else if criteria_count <= 1 {
        -10
    } else {
        0
    };

    if let Some(hours) = item.estimated_hours {
        score += if hours >= 4.0 {
            20
        } else if hours >= 2.0 {
            10
        } else if hours < 0.5 {
            -15
        } else {
            0
        };
    }

    if !item.judges.is_empty() {
        score += 10;
    }

    let haystack = format!(
        "{} {}",
        item.name.as_deref().unwrap_or_default(),
        item.description
    )
    .to_lowercase();

    if ESCALATE_SUBSTRINGS.iter().any(|s| haystack.contains(s)) {
        score += 8;
    }
    if DEESCALATE_SUBSTRINGS.iter().any(|s| haystack.contains(s)) {
        score -= 8;
    }

    if item.depends_on.len() > 2 {
        score += 10;
    }

    score.clamp(0, 100) as u32
}

/// `<40 -> low`, `[40,70) -> medium`, `>=70 -> high`.
pub fn score_to_tier(score: u32) -> Tier {
    if score < 40 {
        Tier::Low
    } else if score < 70 {
        Tier::Medium
    } else {
        Tier::High
    }
}

/// Primary slot then fallbacks, in order, per tier.
fn routing_table(tier: Tier) -> &'static [(Provider, &'static str)] {
    match tier {
        Tier::High => &[
            (Provider::Claude, "opus"),
            (Provider::Gemini, "pro"),
            (Provider::Claude, "sonnet"),
        ],
        Tier::Medium => &[
            (Provider::Claude, "sonnet"),
            (Provider::Codex, "default"),
            (Provider::Gemini, "pro"),
            (Provider::Cursor, "default"),
        ],
        Tier::Low => &[
            (Provider::Claude, "haiku"),
            (Provider::Gemini, "flash"),
            (Provider::Codex, "default"),
        ],
    }
}

const ALL_TIERS: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];

/// Consults the requested tier's routing table in order, then falls back to
/// scanning the other tiers (preserving the requested tier label) so work
/// is never stranded when the natural slot is at capacity.
pub fn find_available_slot(tier: Tier, limiter: &RateLimiter) -> Option<ProviderSlot> {
    for &(provider, model) in routing_table(tier) {
        if limiter.try_acquire(provider.as_str(), model) {
            return Some(ProviderSlot::new(provider, model, tier));
        }
    }
    for &other_tier in &ALL_TIERS {
        if other_tier == tier {
            continue;
        }
        for &(provider, model) in routing_table(other_tier) {
            if limiter.try_acquire(provider.as_str(), model) {
                return Some(ProviderSlot::new(provider, model, tier));
            }
        }
    }
    None
}

/// Scores the item, maps to a tier, applies escalation across `retry_count`
/// steps if `escalate_on_retry`, and raises the score to the escalated
/// tier's floor if escalation moved the tier past what the raw score gives.
pub fn build_tier(item: &PrdItem, escalate_on_retry: bool, retry_count: u32) -> (u32, Tier) {
    let raw_score = score_complexity(item);
    let mut tier = score_to_tier(raw_score);

    if escalate_on_retry {
        for _ in 0..retry_count {
            tier = tier.escalate();
        }
    }

    let score = match tier {
        Tier::Low => raw_score,
        Tier::Medium => raw_score.max(40),
        Tier::High => raw_score.max(70),
    };

    (score, tier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn item(description: &str) -> PrdItem {
        PrdItem {
            id: "T-1".to_string(),
            name: None,
            description: description.to_string(),
            priority: Priority::Medium,
            category: None,
            status: crate::prd::Status::Pending,
            passes: None,
            depends_on: vec![],
            acceptance_criteria: vec![],
            estimated_hours: None,
            provider_override: None,
            validation_override: None,
            complexity_hint: None,
            judges: vec![],
            validation_result: None,
            judge_result: None,
            completed_at: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn manual_hint_dominates() {
        let mut i = item("anything");
        i.complexity_hint = Some("low".to_string());
        assert_eq!(score_complexity(&i), 20);
        i.complexity_hint = Some("high".to_string());
        assert_eq!(score_complexity(&i), 80);
    }

    #[test]
    fn score_clamps_to_0_100() {
        let mut i = item("x");
        i.priority = Priority::Low;
        i.estimated_hours = Some(0.1);
        let score = score_complexity(&i);
        assert!(score <= 100);
    }

    #[test]
    fn tier_mapping_matches_boundaries() {
        assert_eq!(score_to_tier(39), Tier::Low);
        assert_eq!(score_to_tier(40), Tier::Medium);
        assert_eq!(score_to_tier(69), Tier::Medium);
        assert_eq!(score_to_tier(70), Tier::High);
    }

    #[test]
    fn escalation_raises_score_floor() {
        let mut i = item("fix a typo");
        i.priority = Priority::Low;
        let (_, tier_no_escalate) = build_tier(&i, false, 3);
        assert_eq!(tier_no_escalate, score_to_tier(score_complexity(&i)));

        let (score, tier) = build_tier(&i, true, 3);
        assert_eq!(tier, Tier::High);
        assert!(score >= 70);
    }

    #[test]
    fn find_available_slot_falls_back_across_tiers() {
        let limiter = RateLimiter::new();
        limiter.configure("claude", "haiku", 0);
        limiter.configure("gemini", "flash", 0);
        limiter.configure("codex", "default", 0);
        limiter.configure("claude", "sonnet", 1);

        let slot = find_available_slot(Tier::Low, &limiter).unwrap();
        assert_eq!(slot.tier, Tier::Low);
        assert_eq!(slot.provider, Provider::Claude);
        assert_eq!(slot.model, "sonnet");
    }

    #[test]
    fn find_available_slot_returns_none_when_nothing_acquirable() {
        let limiter = RateLimiter::new();
        assert!(find_available_slot(Tier::Medium, &limiter).is_none());
    }
}
