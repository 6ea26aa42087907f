//! SIC code to sector mapping. Exact four-digit codes come from the bundled
//! USBizData table; anything else falls back to the range its two-digit
//! major group sits in.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const SIC_TABLE: &str = include_str!("../../data/sic_codes.csv");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SicCode {
    pub code: String,
    pub description: String,
    pub count: u64,
    pub sector: String,
    pub subsector: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub bucket_id: Option<String>,
}

fn empty_as_none<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.filter(|s| !s.trim().is_empty()))
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Sector {
    pub id: &'static str,
    pub name: &'static str,
}

pub const SECTORS: &[Sector] = &[
    Sector { id: "construction-contractors", name: "Construction & Contractors" },
    Sector { id: "manufacturing", name: "Manufacturing" },
    Sector { id: "transportation-logistics", name: "Transportation & Logistics" },
    Sector { id: "retail-stores", name: "Retail Stores" },
    Sector { id: "automotive", name: "Automotive" },
    Sector { id: "restaurants-food", name: "Restaurants & Food Service" },
    Sector { id: "financial-services", name: "Financial Services" },
    Sector { id: "real-estate", name: "Real Estate" },
    Sector { id: "hotels-hospitality", name: "Hotels & Hospitality" },
    Sector { id: "personal-services", name: "Personal Services" },
    Sector { id: "business-services", name: "Business Services" },
    Sector { id: "recreation-entertainment", name: "Recreation & Entertainment" },
    Sector { id: "healthcare-medical", name: "Healthcare & Medical" },
    Sector { id: "education", name: "Education & Training" },
    Sector { id: "professional-services", name: "Professional Services" },
];

/// `(first, last, sector)` over two-digit major groups. Scanned in order, so
/// narrow ranges sit before the division that contains them.
const MAJOR_GROUPS: &[(u8, u8, &str)] = &[
    (15, 17, "construction-contractors"),
    (20, 39, "manufacturing"),
    (40, 47, "transportation-logistics"),
    (55, 55, "automotive"),
    (58, 58, "restaurants-food"),
    (52, 59, "retail-stores"),
    (65, 65, "real-estate"),
    (60, 67, "financial-services"),
    (70, 70, "hotels-hospitality"),
    (72, 72, "personal-services"),
    (73, 73, "business-services"),
    (75, 75, "automotive"),
    (79, 79, "recreation-entertainment"),
    (80, 80, "healthcare-medical"),
    (81, 81, "professional-services"),
    (82, 82, "education"),
    (87, 87, "professional-services"),
];

static CODES: LazyLock<Vec<SicCode>> = LazyLock::new(|| {
    let mut reader = csv::Reader::from_reader(SIC_TABLE.as_bytes());
    let mut codes = Vec::new();
    for row in reader.deserialize::<SicCode>() {
        match row {
            Ok(code) => codes.push(code),
            Err(e) => warn!("Skipping malformed SIC row: {e}"),
        }
    }
    info!("Loaded {} SIC code definitions", codes.len());
    codes
});

pub fn all() -> &'static [SicCode] {
    &CODES
}

/// Where a code landed and how.
#[derive(Debug, Clone, Serialize)]
pub struct SicMatch {
    pub code: String,
    pub sector: &'static str,
    pub exact: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<&'static SicCode>,
}

pub fn lookup(raw: &str) -> Option<SicMatch> {
    let code: String = raw.chars().filter(char::is_ascii_digit).collect();
    if code.len() < 2 {
        return None;
    }

    if code.len() >= 4 {
        if let Some(detail) = CODES.iter().find(|c| c.code == code[..4]) {
            return Some(SicMatch {
                code: code[..4].to_string(),
                sector: sector_id(&detail.sector)?,
                exact: true,
                detail: Some(detail),
            });
        }
    }

    // suffixes like "5899-01" are not part of the four-digit code
    let group: u8 = code[..2].parse().ok()?;
    let code = code[..code.len().min(4)].to_string();
    MAJOR_GROUPS
        .iter()
        .find(|(lo, hi, _)| (*lo..=*hi).contains(&group))
        .map(|&(_, _, sector)| SicMatch {
            code,
            sector,
            exact: false,
            detail: None,
        })
}

pub fn sector_for(raw: &str) -> Option<&'static str> {
    lookup(raw).map(|m| m.sector)
}

fn sector_id(slug: &str) -> Option<&'static str> {
    SECTORS.iter().find(|s| s.id == slug).map(|s| s.id)
}

pub fn sector(id: &str) -> Option<&'static Sector> {
    SECTORS.iter().find(|s| s.id == id)
}

pub fn codes_for_sector(sector: &str) -> Vec<&'static SicCode> {
    CODES.iter().filter(|c| c.sector == sector).collect()
}

pub fn sector_count(sector: &str) -> u64 {
    codes_for_sector(sector).iter().map(|c| c.count).sum()
}

pub fn search(query: &str) -> Vec<&'static SicCode> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return Vec::new();
    }
    CODES
        .iter()
        .filter(|c| c.code.starts_with(&q) || c.description.to_lowercase().contains(&q))
        .collect()
}

/// Codes with at least 50k records, largest first.
pub fn high_volume() -> Vec<&'static SicCode> {
    let mut codes: Vec<_> = CODES.iter().filter(|c| c.count >= 50_000).collect();
    codes.sort_by(|a, b| b.count.cmp(&a.count));
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_loads_and_maps_to_known_sectors() {
        assert!(all().len() > 200);
        for code in all() {
            assert!(sector(&code.sector).is_some(), "unknown sector {}", code.sector);
        }
    }

    #[test]
    fn exact_match_first() {
        let m = lookup("1711").unwrap();
        assert!(m.exact);
        assert_eq!(m.sector, "construction-contractors");
        assert_eq!(
            m.detail.and_then(|d| d.bucket_id.as_deref()),
            Some("us-construction-plumbers-hvac")
        );
    }

    #[test]
    fn falls_back_to_major_group() {
        let m = lookup("SIC 5899-01").unwrap();
        assert!(!m.exact);
        assert_eq!(m.sector, "restaurants-food");
        assert_eq!(m.code, "5899");
        assert_eq!(lookup("58").unwrap().code, "58");

        assert_eq!(sector_for("5999"), Some("retail-stores"));
        assert_eq!(sector_for("2011"), Some("manufacturing"));
        assert_eq!(sector_for("99"), None);
        assert_eq!(sector_for("x"), None);
    }

    #[test]
    fn search_and_volume() {
        assert!(search("plumbing").iter().any(|c| c.code == "1711"));
        assert!(search("   ").is_empty());

        let top = high_volume();
        assert!(top.windows(2).all(|w| w[0].count >= w[1].count));
        assert!(top.iter().all(|c| c.count >= 50_000));
        assert!(sector_count("construction-contractors") > 440_197);
    }
}
