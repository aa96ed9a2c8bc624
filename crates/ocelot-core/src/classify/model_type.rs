//! Scored model-type resolution from hard and soft signals.
//!
//! Hard signals (architecture rule matches, `config.model_type` rule matches)
//! dominate; soft signals (pipeline tags, caller hints) only adjust
//! confidence and never decide the type on their own.

use crate::types::ModelType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Architecture-pattern rule row (active rows of `model_type_arch_rules`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ArchRule {
    pub pattern: String,
    /// One of `exact`, `prefix`, `suffix`, `wildcard`
    pub match_style: String,
    pub model_type: String,
    pub priority: i64,
}

/// `config.model_type` rule row (active rows of `model_type_config_rules`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigRule {
    pub config_model_type: String,
    pub model_type: String,
    pub priority: i64,
}

/// Hard signals extracted from the artifact itself.
#[derive(Debug, Clone, Default)]
pub struct TypeSignals {
    /// `architectures[]` from config.json or `general.architecture` from GGUF
    pub architectures: Vec<String>,
    /// `model_type` from config.json
    pub config_model_type: Option<String>,
}

/// Resolution outcome with provenance and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelTypeResolution {
    pub model_type: ModelType,
    pub source: String,
    pub confidence: f64,
    pub review_reasons: Vec<String>,
}

/// Score thresholds and increments.
const PRIMARY_HARD_SCORE: f64 = 0.70;
const SECOND_HARD_BONUS: f64 = 0.20;
const AGREEING_SOFT_BONUS: f64 = 0.10;
const CONFLICTING_SOFT_PENALTY: f64 = 0.20;
const AUTO_ACCEPT_THRESHOLD: f64 = 0.85;
const REJECT_THRESHOLD: f64 = 0.60;

/// Resolve the model type from rule tables plus soft hints.
///
/// Conflicting hard signals always yield `unknown` with the
/// `model-type-conflict` review reason; a score below the reject threshold
/// yields `unknown` with `model-type-unresolved`.
pub fn resolve_model_type(
    arch_rules: &[ArchRule],
    config_rules: &[ConfigRule],
    signals: &TypeSignals,
    soft_hints: &[&str],
) -> ModelTypeResolution {
    let arch_votes = architecture_votes(&signals.architectures, arch_rules);
    let config_vote = config_vote(signals.config_model_type.as_deref(), config_rules);

    let mut hard_types = HashSet::new();
    for (_, mt) in &arch_votes {
        if *mt != ModelType::Unknown {
            hard_types.insert(*mt);
        }
    }
    if let Some(mt) = config_vote {
        if mt != ModelType::Unknown {
            hard_types.insert(mt);
        }
    }

    if hard_types.len() > 1 {
        return ModelTypeResolution {
            model_type: ModelType::Unknown,
            source: "model-type-hard-conflict".to_string(),
            confidence: 0.0,
            review_reasons: vec!["model-type-conflict".to_string()],
        };
    }

    let Some(resolved) = hard_types.into_iter().next() else {
        return unresolved();
    };

    let mut score = PRIMARY_HARD_SCORE;
    let hard_signal_count = arch_votes.len() + usize::from(config_vote.is_some());
    if hard_signal_count >= 2 {
        score += SECOND_HARD_BONUS;
    }

    for hint in collect_soft_hints(soft_hints) {
        if hint == resolved {
            score += AGREEING_SOFT_BONUS;
        } else {
            score -= CONFLICTING_SOFT_PENALTY;
        }
    }
    score = score.clamp(0.0, 1.0);

    if score < REJECT_THRESHOLD {
        return unresolved();
    }

    let mut review_reasons = Vec::new();
    if score < AUTO_ACCEPT_THRESHOLD {
        review_reasons.push("model-type-low-confidence".to_string());
    }

    let source = if !arch_votes.is_empty() && config_vote.is_some() {
        "arch-config-rules"
    } else if !arch_votes.is_empty() {
        "arch-rules"
    } else {
        "config-rules"
    };

    ModelTypeResolution {
        model_type: resolved,
        source: source.to_string(),
        confidence: score,
        review_reasons,
    }
}

fn unresolved() -> ModelTypeResolution {
    ModelTypeResolution {
        model_type: ModelType::Unknown,
        source: "unresolved".to_string(),
        confidence: 0.0,
        review_reasons: vec!["model-type-unresolved".to_string()],
    }
}

fn architecture_votes(architectures: &[String], rules: &[ArchRule]) -> Vec<(String, ModelType)> {
    let mut votes = Vec::new();
    for arch in architectures {
        let arch_norm = arch.trim().to_lowercase();
        if arch_norm.is_empty() {
            continue;
        }

        let mut matches: Vec<&ArchRule> = rules
            .iter()
            .filter(|rule| arch_matches_rule(&arch_norm, rule))
            .collect();
        matches.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.pattern.len().cmp(&a.pattern.len()))
                .then_with(|| a.pattern.cmp(&b.pattern))
        });

        if let Some(rule) = matches.first() {
            votes.push((arch.clone(), parse_model_type(&rule.model_type)));
        }
    }
    votes
}

fn config_vote(config_model_type: Option<&str>, rules: &[ConfigRule]) -> Option<ModelType> {
    let value = config_model_type?.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    rules
        .iter()
        .find(|rule| rule.config_model_type.eq_ignore_ascii_case(&value))
        .map(|rule| parse_model_type(&rule.model_type))
}

/// Soft hints deduplicate: a pipeline tag and a caller hint agreeing on the
/// same type count once.
fn collect_soft_hints(hints: &[&str]) -> Vec<ModelType> {
    let mut set = HashSet::new();
    for hint in hints {
        let mt = parse_model_type(hint);
        if mt != ModelType::Unknown {
            set.insert(mt);
        }
    }
    set.into_iter().collect()
}

fn parse_model_type(value: &str) -> ModelType {
    value.trim().parse().unwrap_or(ModelType::Unknown)
}

fn arch_matches_rule(architecture: &str, rule: &ArchRule) -> bool {
    let pattern = rule.pattern.trim().to_lowercase();
    match rule.match_style.as_str() {
        "exact" => architecture == pattern,
        "prefix" => architecture.starts_with(&pattern),
        "suffix" => architecture.ends_with(&pattern),
        "wildcard" => wildcard_match(architecture, &pattern),
        _ => false,
    }
}

fn wildcard_match(value: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return value == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut offset = 0usize;

    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }

        if idx == 0 && !pattern.starts_with('*') {
            if !value.starts_with(part) {
                return false;
            }
            offset = part.len();
            continue;
        }

        if idx == parts.len() - 1 && !pattern.ends_with('*') {
            let Some(start) = value[offset..].rfind(part).map(|p| offset + p) else {
                return false;
            };
            if start + part.len() != value.len() {
                return false;
            }
            offset = start + part.len();
            continue;
        }

        let Some(found) = value[offset..].find(part) else {
            return false;
        };
        offset += found + part.len();
    }

    true
}
