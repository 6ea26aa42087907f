use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::leads::Lead;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}|\{([A-Za-z0-9_]+)\}")
        .expect("Invalid placeholder regex")
});

/// `first_name`, `firstName` and `FIRSTNAME` all name the same variable.
fn var_key(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Substitutes `{{key}}` and `{key}`. Unknown placeholders stay as written.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let lookup: HashMap<String, &str> = vars
        .iter()
        .map(|(k, v)| (var_key(k), v.as_str()))
        .collect();

    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match lookup.get(&var_key(name)) {
                Some(value) => (*value).to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = PLACEHOLDER
        .captures_iter(template)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .collect();
    names.dedup();
    names
}

pub fn lead_vars(lead: &Lead) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let mut put = |k: &str, v: Option<&str>| {
        if let Some(v) = v.filter(|v| !v.is_empty()) {
            vars.insert(k.to_string(), v.to_string());
        }
    };
    put("firstName", lead.first_name.as_deref());
    put("lastName", lead.last_name.as_deref());
    put("companyName", lead.company.as_deref());
    put("company", lead.company.as_deref());
    put("industry", lead.sector.as_deref());
    put("city", lead.city.as_deref());
    put("state", lead.state.as_deref());
    put("phone", lead.phone.as_deref());
    put("email", lead.email.as_deref());
    let full = lead.full_name();
    put("fullName", Some(full.as_str()));
    vars
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    Opener,
    FollowUp,
    Nudge,
    ValueOffer,
}

impl TemplateCategory {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "opener" => Some(Self::Opener),
            "follow_up" | "followup" => Some(Self::FollowUp),
            "nudge" => Some(Self::Nudge),
            "value_offer" => Some(Self::ValueOffer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SmsTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub category: TemplateCategory,
    pub agent: &'static str,
    pub body: &'static str,
}

pub const LIBRARY: &[SmsTemplate] = &[
    SmsTemplate {
        id: "opener_direct",
        name: "Direct opener",
        category: TemplateCategory::Opener,
        agent: "gianna",
        body: "{{firstName}}, quick one: would you consider an offer for {{companyName}} this year? Happy to share what similar owners got.",
    },
    SmsTemplate {
        id: "opener_local",
        name: "Local opener",
        category: TemplateCategory::Opener,
        agent: "gianna",
        body: "Hi {{firstName}}, I work with {{industry}} owners around {{city}}. Open to a short chat about where the market is?",
    },
    SmsTemplate {
        id: "opener_question",
        name: "Permission question",
        category: TemplateCategory::Opener,
        agent: "gianna",
        body: "{{firstName}}, mind if I ask one question about {{companyName}}? Reply STOP to opt out.",
    },
    SmsTemplate {
        id: "follow_up_checkin",
        name: "Check-in",
        category: TemplateCategory::FollowUp,
        agent: "gianna",
        body: "{{firstName}}, circling back on my note from earlier this week. Still worth a 15 minute call?",
    },
    SmsTemplate {
        id: "follow_up_email",
        name: "Ask for email",
        category: TemplateCategory::FollowUp,
        agent: "gianna",
        body: "Thanks {{firstName}}. What's the best email to send the details to?",
    },
    SmsTemplate {
        id: "nudge_light",
        name: "Light nudge",
        category: TemplateCategory::Nudge,
        agent: "cathy",
        body: "{{firstName}}, did my last text get lost in the shuffle? No pressure, just say the word.",
    },
    SmsTemplate {
        id: "nudge_last",
        name: "Last try",
        category: TemplateCategory::Nudge,
        agent: "cathy",
        body: "Last one from me {{firstName}}. If timing is off, reply later and I'll pick it up.",
    },
    SmsTemplate {
        id: "value_valuation",
        name: "Free valuation",
        category: TemplateCategory::ValueOffer,
        agent: "gianna",
        body: "{{firstName}}, we put together free valuation reports for {{industry}} owners. Want me to send yours?",
    },
    SmsTemplate {
        id: "value_report",
        name: "Market report",
        category: TemplateCategory::ValueOffer,
        agent: "sabrina",
        body: "{{firstName}}, new {{state}} market report just came out. Reply with your email and it's yours.",
    },
];

pub fn template(id: &str) -> Option<&'static SmsTemplate> {
    LIBRARY.iter().find(|t| t.id == id)
}

pub fn by_category(category: TemplateCategory) -> Vec<&'static SmsTemplate> {
    LIBRARY.iter().filter(|t| t.category == category).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Encoding {
    Gsm7,
    Ucs2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub encoding: Encoding,
    /// Septets for GSM-7 (extension characters count twice), UTF-16 units
    /// for UCS-2.
    pub units: usize,
    pub segments: usize,
    pub per_segment: usize,
}

const GSM_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";
const GSM_EXTENDED: &str = "^{}\\[~]|€\u{000C}";

pub fn segments(text: &str) -> SegmentInfo {
    let mut septets = 0usize;
    let mut gsm = true;
    for c in text.chars() {
        if GSM_BASIC.contains(c) {
            septets += 1;
        } else if GSM_EXTENDED.contains(c) {
            septets += 2;
        } else {
            gsm = false;
            break;
        }
    }

    let (encoding, units, single, multi) = if gsm {
        (Encoding::Gsm7, septets, 160, 153)
    } else {
        (Encoding::Ucs2, text.encode_utf16().count(), 70, 67)
    };

    let (segments, per_segment) = match units {
        0 => (0, single),
        n if n <= single => (1, single),
        n => (n.div_ceil(multi), multi),
    };

    SegmentInfo {
        encoding,
        units,
        segments,
        per_segment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_both_brace_styles_case_insensitively() {
        let v = vars(&[("firstName", "Ana"), ("company_name", "Ruiz Roofing")]);
        assert_eq!(
            render("Hi {{ FIRST_NAME }}, is {companyName} hiring? {unknown}", &v),
            "Hi Ana, is Ruiz Roofing hiring? {unknown}"
        );
    }

    #[test]
    fn lists_placeholders() {
        assert_eq!(
            placeholders("{{firstName}} at {company}"),
            vec!["firstName".to_string(), "company".to_string()]
        );
    }

    #[test]
    fn library_lookup() {
        assert!(template("nudge_light").is_some());
        assert_eq!(by_category(TemplateCategory::Opener).len(), 3);
        assert_eq!(TemplateCategory::parse("follow-up"), Some(TemplateCategory::FollowUp));
    }

    #[test]
    fn counts_gsm_segments() {
        let one = segments(&"a".repeat(160));
        assert_eq!((one.encoding, one.segments), (Encoding::Gsm7, 1));

        let two = segments(&"a".repeat(161));
        assert_eq!((two.segments, two.per_segment), (2, 153));

        // extension characters take two septets
        assert_eq!(segments("{}").units, 4);
        assert_eq!(segments("").segments, 0);
    }

    #[test]
    fn counts_ucs2_segments() {
        let info = segments(&format!("{} 🙂", "a".repeat(68)));
        assert_eq!(info.encoding, Encoding::Ucs2);
        assert_eq!(info.units, 71);
        assert_eq!((info.segments, info.per_segment), (2, 67));
    }
}
