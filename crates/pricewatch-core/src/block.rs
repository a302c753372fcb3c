//! Anti-bot block detection from status codes, CAPTCHA markers and page text.

use std::fmt;

use serde::Serialize;

use crate::SoftBlockSignals;

/// Unambiguous challenge phrases; any match in title or body is a block.
const SOFT_BLOCK_PATTERNS: [&str; 6] = [
    "robot check",
    "verify you are human",
    "sorry, we just need to make sure you're not a robot",
    "to discuss automated access to amazon data",
    "enter the characters you see below",
    "/errors/validatecaptcha",
];

/// Only consulted when the page shows no core product signal.
const SOFT_BLOCK_WEAK_HINTS: [&str; 4] = ["captcha", "robot", "automated access", "verify you are human"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "matched", rename_all = "snake_case")]
pub enum SoftBlockReason {
    ExplicitPattern(&'static str),
    WeakHint(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Status(u16),
    CaptchaForm,
    SoftBlock(SoftBlockReason),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "status={code}"),
            Self::CaptchaForm => f.write_str("captcha"),
            Self::SoftBlock(SoftBlockReason::ExplicitPattern(p)) => write!(f, "soft_block(pattern={p:?})"),
            Self::SoftBlock(SoftBlockReason::WeakHint(h)) => write!(f, "soft_block(hint={h:?})"),
        }
    }
}

/// Every detector that fired for one fetch attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockAssessment {
    pub reasons: Vec<BlockReason>,
}

impl BlockAssessment {
    pub fn is_blocked(&self) -> bool {
        !self.reasons.is_empty()
    }
}

impl fmt::Display for BlockAssessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reasons = self.reasons.iter().map(ToString::to_string).collect::<Vec<_>>();
        f.write_str(&reasons.join(", "))
    }
}

pub fn is_blocked_status(status: Option<u16>) -> bool {
    matches!(status, Some(403 | 503))
}

/// OR of the status, CAPTCHA-form and soft-signal detectors, keeping each reason.
pub fn assess_block(status: Option<u16>, has_captcha_form: bool, signals: &SoftBlockSignals) -> BlockAssessment {
    let mut reasons = Vec::new();
    if let Some(code) = status.filter(|_| is_blocked_status(status)) {
        reasons.push(BlockReason::Status(code));
    }
    if has_captcha_form {
        reasons.push(BlockReason::CaptchaForm);
    }
    if let Some(reason) = soft_block_reason(signals) {
        reasons.push(BlockReason::SoftBlock(reason));
    }
    BlockAssessment { reasons }
}

pub fn is_soft_blocked_signals(signals: &SoftBlockSignals) -> bool {
    soft_block_reason(signals).is_some()
}

struct MatchText<'a> {
    title: String,
    body: String,
    signals: &'a SoftBlockSignals,
}

enum Verdict {
    Blocked(SoftBlockReason),
    NotBlocked,
}

type Stage = fn(&MatchText<'_>) -> Option<Verdict>;

// Order matters: the core-signal gate must run before weak hints, otherwise
// product pages that merely mention "robot" get flagged.
const SOFT_BLOCK_STAGES: [Stage; 3] = [explicit_pattern_stage, core_signal_stage, weak_hint_stage];

pub fn soft_block_reason(signals: &SoftBlockSignals) -> Option<SoftBlockReason> {
    let text = MatchText {
        title: normalize_for_match(signals.title_text.as_deref()),
        body: normalize_for_match(signals.body_text.as_deref()),
        signals,
    };
    SOFT_BLOCK_STAGES
        .iter()
        .find_map(|stage| stage(&text))
        .and_then(|verdict| match verdict {
            Verdict::Blocked(reason) => Some(reason),
            Verdict::NotBlocked => None,
        })
}

fn explicit_pattern_stage(text: &MatchText<'_>) -> Option<Verdict> {
    SOFT_BLOCK_PATTERNS
        .iter()
        .copied()
        .find(|p| text.title.contains(p) || text.body.contains(p))
        .map(|p| Verdict::Blocked(SoftBlockReason::ExplicitPattern(p)))
}

fn core_signal_stage(text: &MatchText<'_>) -> Option<Verdict> {
    text.signals.has_core_product_signal().then_some(Verdict::NotBlocked)
}

fn weak_hint_stage(text: &MatchText<'_>) -> Option<Verdict> {
    SOFT_BLOCK_WEAK_HINTS
        .iter()
        .copied()
        .find(|h| text.body.contains(h))
        .map(|h| Verdict::Blocked(SoftBlockReason::WeakHint(h)))
}

fn normalize_for_match(value: Option<&str>) -> String {
    value
        .map(|v| crate::price::normalize_text(v).to_lowercase())
        .unwrap_or_default()
}
