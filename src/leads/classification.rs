//! Keyword classifier for inbound SMS replies.
//!
//! Rules are checked from highest priority down and the first match wins.
//! Keywords match whole words, case-insensitively, so "hello" is not
//! profanity and "I know" is not a refusal.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseKind {
    Profanity,
    OptOut,
    WrongNumber,
    NotInterested,
    EmailCapture,
    CalledPhoneLine,
    Question,
    Assistance,
    Interested,
    ThankYou,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Highlight {
    Green,
    Blue,
}

impl ResponseKind {
    /// Highest first.
    pub const ALL: [ResponseKind; 11] = [
        Self::Profanity,
        Self::OptOut,
        Self::WrongNumber,
        Self::NotInterested,
        Self::EmailCapture,
        Self::CalledPhoneLine,
        Self::Question,
        Self::Assistance,
        Self::Interested,
        Self::ThankYou,
        Self::Other,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Profanity => "profanity",
            Self::OptOut => "opt-out",
            Self::WrongNumber => "wrong-number",
            Self::NotInterested => "not-interested",
            Self::EmailCapture => "email-capture",
            Self::CalledPhoneLine => "called-phone-line",
            Self::Question => "question",
            Self::Assistance => "assistance",
            Self::Interested => "interested",
            Self::ThankYou => "thank-you",
            Self::Other => "other",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Profanity => "Profanity",
            Self::OptOut => "Opt-Out",
            Self::WrongNumber => "Wrong Number",
            Self::NotInterested => "Not Interested",
            Self::EmailCapture => "Email Capture",
            Self::CalledPhoneLine => "Called Phone Line",
            Self::Question => "Question",
            Self::Assistance => "Assistance Request",
            Self::Interested => "Interested",
            Self::ThankYou => "Thank You",
            Self::Other => "Other Response",
        }
    }

    pub fn priority(self) -> u32 {
        match self {
            Self::Profanity => 200,
            Self::OptOut => 190,
            Self::WrongNumber => 185,
            Self::NotInterested => 180,
            Self::EmailCapture => 100,
            Self::CalledPhoneLine => 95,
            Self::Question => 85,
            Self::Assistance => 80,
            Self::Interested => 50,
            Self::ThankYou => 30,
            Self::Other => 0,
        }
    }

    /// Suppressed replies are hidden from the operator inbox.
    pub fn suppressed(self) -> bool {
        matches!(
            self,
            Self::Profanity | Self::OptOut | Self::WrongNumber | Self::NotInterested
        )
    }

    pub fn highlight(self) -> Option<Highlight> {
        match self {
            Self::EmailCapture
            | Self::CalledPhoneLine
            | Self::Question
            | Self::Assistance
            | Self::Interested => Some(Highlight::Green),
            Self::ThankYou => Some(Highlight::Blue),
            _ => None,
        }
    }

    /// Worth an operator notification.
    pub fn actionable(self) -> bool {
        self.highlight() == Some(Highlight::Green)
    }

    fn matches(self, message: &str) -> bool {
        match self {
            Self::Profanity => PROFANITY.is_match(message),
            Self::OptOut => OPT_OUT.is_match(message),
            Self::WrongNumber => WRONG_NUMBER.is_match(message),
            Self::NotInterested => NOT_INTERESTED.is_match(message),
            Self::EmailCapture => EMAIL.is_match(message),
            Self::CalledPhoneLine => {
                let trimmed = message.trim_start();
                trimmed.starts_with("[CALL]")
                    || trimmed.starts_with("[INBOUND]")
                    || CALLED_BACK.is_match(message)
            }
            Self::Question => message.contains('?'),
            Self::Assistance => ASSISTANCE.is_match(message),
            Self::Interested => INTERESTED.is_match(message),
            Self::ThankYou => THANK_YOU.is_match(message),
            Self::Other => true,
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ResponseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.id() == s)
            .ok_or_else(|| format!("unknown classification: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub kind: ResponseKind,
    pub name: &'static str,
    pub suppressed: bool,
    /// Carries an opt-out keyword, even when a higher rule won.
    pub opt_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub all_emails: Vec<String>,
}

fn keyword_regex(words: &[&str]) -> Regex {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).expect("Invalid keyword regex")
}

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("Invalid email regex")
});

static PROFANITY: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "fuck", "fucking", "shit", "ass", "bitch", "damn", "hell", "crap", "dick", "piss",
        "bastard",
    ])
});

static OPT_OUT: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "stop",
        "unsubscribe",
        "cancel",
        "end",
        "quit",
        "optout",
        "opt out",
        "remove",
    ])
});

static WRONG_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "wrong number",
        "wrong person",
        "not me",
        "who is this",
        "don't know",
        "dont know",
        "never heard",
        "don't text",
        "dont text",
    ])
});

static NOT_INTERESTED: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&["no", "not interested", "no thanks", "pass", "decline"])
});

static CALLED_BACK: LazyLock<Regex> =
    LazyLock::new(|| keyword_regex(&["inbound call", "called back", "call from"]));

static ASSISTANCE: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&["help", "assist", "assistance", "support", "can you", "could you", "please"])
});

static INTERESTED: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "yes", "interested", "call", "info", "more", "details", "tell me", "sure",
    ])
});

static THANK_YOU: LazyLock<Regex> =
    LazyLock::new(|| keyword_regex(&["thank", "thanks", "thank you", "ty", "thx"]));

pub fn classify(message: &str) -> Classification {
    let kind = ResponseKind::ALL
        .iter()
        .copied()
        .find(|k| k.matches(message))
        .unwrap_or(ResponseKind::Other);

    let all_emails = if kind == ResponseKind::EmailCapture {
        extract_emails(message)
    } else {
        Vec::new()
    };

    Classification {
        kind,
        name: kind.name(),
        suppressed: kind.suppressed(),
        opt_out: kind == ResponseKind::OptOut || is_opt_out(message),
        email: all_emails.first().cloned(),
        all_emails,
    }
}

pub fn is_opt_out(message: &str) -> bool {
    OPT_OUT.is_match(message)
}

pub fn extract_emails(message: &str) -> Vec<String> {
    EMAIL
        .find_iter(message)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_wins() {
        // "stop" beats the question mark and the interest keyword
        assert_eq!(classify("yes? no, STOP").kind, ResponseKind::OptOut);
        assert_eq!(classify("Wrong number, who?").kind, ResponseKind::WrongNumber);
        assert_eq!(classify("what's the price?").kind, ResponseKind::Question);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        assert_eq!(classify("hello there").kind, ResponseKind::Other);
        assert_eq!(classify("I know the place").kind, ResponseKind::Other);
        assert_eq!(classify("Stopping by later").kind, ResponseKind::Other);
        assert_eq!(classify("Opt  out").kind, ResponseKind::OptOut);
    }

    #[test]
    fn profane_stop_still_opts_out() {
        let c = classify("STOP texting me, damn it");
        assert_eq!(c.kind, ResponseKind::Profanity);
        assert!(c.suppressed);
        assert!(c.opt_out);

        assert!(!classify("damn right I'm interested").opt_out);
        assert!(classify("unsubscribe").opt_out);
    }

    #[test]
    fn captures_emails() {
        let c = classify("sure, send it to Jane.Doe@Example.com or jd@work.io");
        assert_eq!(c.kind, ResponseKind::EmailCapture);
        assert_eq!(c.email.as_deref(), Some("jane.doe@example.com"));
        assert_eq!(c.all_emails.len(), 2);
        assert!(!c.suppressed);
    }

    #[test]
    fn call_markers_and_acknowledgements() {
        assert_eq!(
            classify("[CALL] 45s inbound").kind,
            ResponseKind::CalledPhoneLine
        );
        assert_eq!(classify("Could you send it").kind, ResponseKind::Assistance);
        assert_eq!(classify("yes please").kind, ResponseKind::Assistance);
        assert_eq!(classify("Yes").kind, ResponseKind::Interested);
        assert_eq!(classify("thanks!").kind, ResponseKind::ThankYou);
    }

    #[test]
    fn suppression_and_round_trip_ids() {
        assert!(ResponseKind::Profanity.suppressed());
        assert!(!ResponseKind::Question.suppressed());
        for kind in ResponseKind::ALL {
            assert_eq!(kind.id().parse::<ResponseKind>(), Ok(kind));
        }
    }
}
