//! Local SMS rewriting: filler stripping, length budgeting and tone-dial
//! remixes of a template.

use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const SMS_BUDGET: usize = 160;

static FILLERS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\bdue to the fact that\b", "because"),
        (r"(?i)\bat this point in time\b", "now"),
        (r"(?i)\bin order to\b", "to"),
        (r"(?i)\bwould you be open to\b", "open to"),
        (r"(?i)\bi just wanted to\s+", ""),
        (r"(?i)\bjust wanted to\s+", ""),
        (r"(?i)\b(?:kind|sort) of\s+", ""),
        (
            r"(?i)\b(?:actually|basically|really|very|literally|honestly|totally|just)\s+",
            "",
        ),
    ]
    .into_iter()
    .map(|(pattern, with)| (Regex::new(pattern).expect("Invalid filler regex"), with))
    .collect()
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([,.!?;:])").expect("Invalid punctuation regex"));
static DOUBLED_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(?:\s*,)+").expect("Invalid comma regex"));
static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*").expect("Invalid sentence regex"));

fn tidy(text: &str) -> String {
    let mut out = text.to_string();
    for (re, with) in FILLERS.iter() {
        out = re.replace_all(&out, *with).into_owned();
    }
    out = WHITESPACE.replace_all(&out, " ").into_owned();
    out = SPACE_BEFORE_PUNCT.replace_all(&out, "$1").into_owned();
    out = DOUBLED_COMMA.replace_all(&out, ",").into_owned();

    let out = out.trim();
    let mut chars = out.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Shrinks `message` to at most `budget` characters. Filler is stripped
/// first; if that is not enough the text is cut at a sentence end in the
/// last 30% of the budget, otherwise at a word boundary with an ellipsis.
pub fn compress(message: &str, budget: usize) -> String {
    let text = tidy(message);
    if text.chars().count() <= budget {
        return text;
    }
    if budget <= 3 {
        return text.chars().take(budget).collect();
    }

    let head: String = text.chars().take(budget - 3).collect();

    if let Some(end) = head.rfind(['.', '!', '?']) {
        let kept = &head[..=end];
        if kept.chars().count() * 10 > budget * 7 {
            return kept.to_string();
        }
    }

    match head.rfind(' ') {
        Some(space) if space > 0 => {
            let kept = head[..space].trim_end_matches([',', ';', ':', '-', ' ']);
            format!("{kept}...")
        }
        _ => format!("{head}..."),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemixSettings {
    #[serde(default = "mid")]
    pub humor: u8,
    #[serde(default = "mid")]
    pub directness: u8,
    #[serde(default = "mid")]
    pub authority: u8,
    #[serde(default = "mid")]
    pub urgency: u8,
}

fn mid() -> u8 {
    50
}

impl Default for RemixSettings {
    fn default() -> Self {
        Self {
            humor: 50,
            directness: 50,
            authority: 50,
            urgency: 50,
        }
    }
}

impl RemixSettings {
    pub fn clamped(self) -> Self {
        Self {
            humor: self.humor.min(100),
            directness: self.directness.min(100),
            authority: self.authority.min(100),
            urgency: self.urgency.min(100),
        }
    }

    fn jittered<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let mut dial = |v: u8| (i16::from(v) + rng.gen_range(-10..=10)).clamp(0, 100) as u8;
        Self {
            humor: dial(self.humor),
            directness: dial(self.directness),
            authority: dial(self.authority),
            urgency: dial(self.urgency),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Low,
    Medium,
    High,
    Max,
}

pub fn tier(value: u8) -> Tier {
    match value {
        0..=24 => Tier::Low,
        25..=49 => Tier::Medium,
        50..=74 => Tier::High,
        _ => Tier::Max,
    }
}

struct Tiered {
    low: &'static [&'static str],
    medium: &'static [&'static str],
    high: &'static [&'static str],
    max: &'static [&'static str],
}

impl Tiered {
    fn at(&self, t: Tier) -> &'static [&'static str] {
        match t {
            Tier::Low => self.low,
            Tier::Medium => self.medium,
            Tier::High => self.high,
            Tier::Max => self.max,
        }
    }
}

const OPENERS: Tiered = Tiered {
    low: &["Hi", "Hey", "Hello"],
    medium: &["Look,", "Honestly,", "Between us,"],
    high: &["Straight up,", "Here's the deal,", "I'll be direct,"],
    max: &["No fluff:", "Bottom line:", "Read this twice."],
};

const CLOSERS: Tiered = Tiered {
    low: &["Thoughts?", "Open to it?", "Let me know either way."],
    medium: &["Ready to talk?", "Worth a call this week?", "What's holding you back?"],
    high: &["Your move.", "Clock's ticking.", "Don't sit on this."],
    max: &["Now or never.", "Last call on this.", "Fortune favors the bold."],
};

const HUMOR: Tiered = Tiered {
    low: &[],
    medium: &["(Not a robot, promise.)", "Did my last text vanish?"],
    high: &[
        "Starting to think you're playing hard to get.",
        "Should I try a carrier pigeon?",
    ],
    max: &[
        "I checked, your phone works. Asked NASA.",
        "Plot twist: you're on a reality show and winning.",
    ],
};

/// Blunt, money-first.
pub const MR_WONDERFUL: &[&str] = &[
    "Money doesn't care about feelings.",
    "Free advice: take the meeting.",
    "Here's what you're missing.",
];

/// Closer pressure.
pub const GLENGARRY: &[&str] = &[
    "Coffee is for closers.",
    "Always be closing.",
    "First prize is a meeting.",
];

/// Confidence and FOMO.
pub const STRATTON: &[&str] = &[
    "Winners act. Others make excuses.",
    "Every day you wait costs you.",
    "This is how deals get made.",
];

fn pick<R: Rng + ?Sized>(phrases: &[&'static str], rng: &mut R) -> Option<&'static str> {
    phrases.choose(rng).copied()
}

/// One rewrite of `template` driven by the tone dials, compressed to an
/// SMS budget.
pub fn remix<R: Rng + ?Sized>(template: &str, settings: &RemixSettings, rng: &mut R) -> String {
    let settings = settings.clamped();
    let mut content = template.trim().to_string();

    if let Some(opener) = pick(OPENERS.at(tier(settings.directness)), rng) {
        if !content.starts_with(opener) {
            if let Some(p) = content.find([',', '!', '.', '?']) {
                let rest = content[p + 1..].trim();
                if p > 0 && p < 30 && !rest.is_empty() {
                    content = format!("{opener} {rest}");
                }
            }
        }
    }

    if settings.humor > 60 {
        if let Some(joke) = pick(HUMOR.at(tier(settings.humor)), rng) {
            let mut sentences: Vec<String> = SENTENCE
                .find_iter(&content)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if sentences.len() > 2 {
                let at = sentences.len() / 2;
                sentences.insert(at, joke.to_string());
                content = sentences.join(" ");
            }
        }
    }

    let authority = if settings.authority > 70 {
        let style = match rng.gen_range(0..3) {
            0 => MR_WONDERFUL,
            1 => GLENGARRY,
            _ => STRATTON,
        };
        pick(style, rng)
    } else {
        None
    };

    let closer = if settings.urgency > 40 {
        pick(CLOSERS.at(tier(settings.urgency)), rng)
    } else {
        None
    };

    if authority.is_some() || closer.is_some() {
        if let Some(last) = content.rfind('.').filter(|&i| i > 0) {
            content.truncate(last + 1);
        }
        for phrase in [authority, closer].into_iter().flatten() {
            content.push(' ');
            content.push_str(phrase);
        }
    }

    compress(&content, SMS_BUDGET)
}

#[derive(Debug, Clone, Serialize)]
pub struct RemixVariation {
    pub content: String,
    pub characters: usize,
    pub settings: RemixSettings,
}

/// `n` remixes, each with every dial nudged by up to ten points.
pub fn variations<R: Rng + ?Sized>(
    template: &str,
    settings: &RemixSettings,
    n: usize,
    rng: &mut R,
) -> Vec<RemixVariation> {
    (0..n)
        .map(|_| {
            let dials = settings.clamped().jittered(rng);
            let content = remix(template, &dials, rng);
            RemixVariation {
                characters: content.chars().count(),
                content,
                settings: dials,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn strips_filler_and_tidies() {
        assert_eq!(
            compress("hi Ana , I just wanted to  really check in order to help.", 160),
            "Hi Ana, check to help."
        );
    }

    #[test]
    fn short_text_is_untouched_apart_from_tidying() {
        assert_eq!(compress("Open to a call?", 160), "Open to a call?");
    }

    #[test]
    fn prefers_late_sentence_break() {
        let text = format!("{}. And then some more words here", "word ".repeat(28).trim());
        let out = compress(&text, 160);
        assert!(out.ends_with('.'));
        assert!(out.chars().count() <= 160);
    }

    #[test]
    fn falls_back_to_word_boundary_with_ellipsis() {
        let text = "alpha ".repeat(40);
        let out = compress(&text, 50);
        assert!(out.ends_with("..."));
        assert!(out.chars().count() <= 50);
        assert!(!out.contains("alp..."));
    }

    #[test]
    fn hard_cuts_a_single_long_word() {
        let out = compress(&"x".repeat(200), 20);
        assert_eq!(out, format!("{}...", "X".to_string() + &"x".repeat(16)));
    }

    #[test]
    fn tiers_follow_thresholds() {
        assert_eq!(tier(0), Tier::Low);
        assert_eq!(tier(24), Tier::Low);
        assert_eq!(tier(25), Tier::Medium);
        assert_eq!(tier(74), Tier::High);
        assert_eq!(tier(75), Tier::Max);
    }

    #[test]
    fn remix_applies_dials_and_stays_in_budget() {
        let mut rng = StdRng::seed_from_u64(7);
        let settings = RemixSettings {
            humor: 0,
            directness: 0,
            authority: 0,
            urgency: 90,
        };
        let out = remix(
            "Hello there, I help owners sell. We close fast. Interested?",
            &settings,
            &mut rng,
        );
        assert!(OPENERS.low.iter().any(|o| out.starts_with(o)));
        assert!(CLOSERS.max.iter().any(|c| out.ends_with(c)));
        assert!(out.chars().count() <= SMS_BUDGET);
    }

    #[test]
    fn calm_dials_leave_the_ending_alone() {
        let mut rng = StdRng::seed_from_u64(1);
        let settings = RemixSettings {
            humor: 0,
            directness: 0,
            authority: 0,
            urgency: 0,
        };
        let out = remix(
            "Quick question, are you still running the shop today.",
            &settings,
            &mut rng,
        );
        assert!(out.ends_with("running the shop today."));
    }

    #[test]
    fn variations_stay_within_jitter() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = RemixSettings::default();
        let vars = variations("Hi Ana, got a minute?", &base, 4, &mut rng);
        assert_eq!(vars.len(), 4);
        for v in vars {
            assert!(v.settings.humor.abs_diff(base.humor) <= 10);
            assert!(v.settings.urgency.abs_diff(base.urgency) <= 10);
            assert!(v.characters <= SMS_BUDGET);
        }
    }
}
