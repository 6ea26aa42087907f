use std::collections::HashMap;

use super::DriveError;
use crate::leads::LeadInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    FirstName,
    LastName,
    FullName,
    Company,
    Phone,
    Email,
    Address,
    City,
    State,
    Zip,
    SicCode,
    Sector,
    Notes,
}

/// Header spellings seen in list-vendor exports, compared after
/// lowercasing and dropping everything but letters and digits.
const ALIASES: &[(Column, &[&str])] = &[
    (Column::FirstName, &["firstname", "first", "fname", "contactfirstname", "ownerfirstname"]),
    (Column::LastName, &["lastname", "last", "lname", "surname", "contactlastname", "ownerlastname"]),
    (Column::FullName, &["name", "fullname", "contactname", "ownername", "contact"]),
    (Column::Company, &["company", "companyname", "business", "businessname", "organization", "organizationname"]),
    (Column::Phone, &["phone", "phonenumber", "mobile", "mobilephone", "cell", "cellphone", "telephone", "primaryphone", "directphone"]),
    (Column::Email, &["email", "emailaddress", "primaryemail", "contactemail"]),
    (Column::Address, &["address", "address1", "street", "streetaddress", "mailingaddress"]),
    (Column::City, &["city", "town"]),
    (Column::State, &["state", "st", "province", "region"]),
    (Column::Zip, &["zip", "zipcode", "postalcode", "postal", "zip5"]),
    (Column::SicCode, &["sic", "siccode", "primarysic", "primarysiccode"]),
    (Column::Sector, &["sector", "industry", "category"]),
    (Column::Notes, &["notes", "note", "comments"]),
];

fn squash(header: &str) -> String {
    header
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn column_for(header: &str) -> Option<Column> {
    let key = squash(header);
    ALIASES
        .iter()
        .find(|(_, names)| names.contains(&key.as_str()))
        .map(|(column, _)| *column)
}

fn split_name(full: &str) -> (Option<String>, Option<String>) {
    let mut parts = full.split_whitespace();
    let first = parts.next().map(String::from);
    let rest: Vec<&str> = parts.collect();
    let last = (!rest.is_empty()).then(|| rest.join(" "));
    (first, last)
}

#[derive(Debug, Default)]
pub struct ParsedCsv {
    pub rows: Vec<LeadInput>,
    /// Headers that matched no known column.
    pub ignored_headers: Vec<String>,
    pub malformed_rows: usize,
}

/// Maps a CSV export onto lead inputs. The first header that resolves to a
/// column wins; unknown headers are reported back.
pub fn parse_leads_csv(bytes: &[u8]) -> Result<ParsedCsv, DriveError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| DriveError::Csv(e.to_string()))?
        .clone();

    let mut columns: HashMap<Column, usize> = HashMap::new();
    let mut parsed = ParsedCsv::default();
    for (i, header) in headers.iter().enumerate() {
        match column_for(header) {
            Some(column) => {
                columns.entry(column).or_insert(i);
            }
            None if !header.is_empty() => parsed.ignored_headers.push(header.to_string()),
            None => {}
        }
    }
    if !columns.contains_key(&Column::Phone) && !columns.contains_key(&Column::Email) {
        return Err(DriveError::Csv(
            "file needs a phone or email column".to_string(),
        ));
    }

    for record in reader.records() {
        let Ok(record) = record else {
            parsed.malformed_rows += 1;
            continue;
        };
        let get = |column: Column| -> Option<String> {
            columns
                .get(&column)
                .and_then(|&i| record.get(i))
                .map(str::to_string)
                .filter(|v| !v.is_empty())
        };

        let (mut first_name, mut last_name) = (get(Column::FirstName), get(Column::LastName));
        if first_name.is_none() && last_name.is_none() {
            if let Some(full) = get(Column::FullName) {
                (first_name, last_name) = split_name(&full);
            }
        }

        parsed.rows.push(LeadInput {
            first_name,
            last_name,
            company: get(Column::Company),
            phone: get(Column::Phone),
            email: get(Column::Email),
            address: get(Column::Address),
            city: get(Column::City),
            state: get(Column::State),
            zip: get(Column::Zip),
            sic_code: get(Column::SicCode),
            sector: get(Column::Sector),
            notes: get(Column::Notes),
            ..Default::default()
        });
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_vendor_headers() {
        let csv = "Contact Name,Company Name,Phone Number,E-mail Address,Zip Code,SIC Code,Fax\n\
                   Maria  Ruiz,Ruiz Roofing,(512) 555-0101,maria@ruiz.com,78701,1761,\n\
                   ,Acme HVAC,,ops@acme.com,,,555\n";
        let parsed = parse_leads_csv(csv.as_bytes()).unwrap();

        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.ignored_headers, vec!["Fax".to_string()]);

        let maria = &parsed.rows[0];
        assert_eq!(maria.first_name.as_deref(), Some("Maria"));
        assert_eq!(maria.last_name.as_deref(), Some("Ruiz"));
        assert_eq!(maria.phone.as_deref(), Some("(512) 555-0101"));
        assert_eq!(maria.sic_code.as_deref(), Some("1761"));

        let acme = &parsed.rows[1];
        assert_eq!(acme.first_name, None);
        assert_eq!(acme.phone, None);
        assert_eq!(acme.email.as_deref(), Some("ops@acme.com"));
    }

    #[test]
    fn explicit_first_and_last_beat_full_name() {
        let csv = "First Name,Last Name,Name,Cell\nAna,Lopez,Someone Else,5125550102\n";
        let parsed = parse_leads_csv(csv.as_bytes()).unwrap();
        assert_eq!(parsed.rows[0].first_name.as_deref(), Some("Ana"));
        assert_eq!(parsed.rows[0].last_name.as_deref(), Some("Lopez"));
    }

    #[test]
    fn needs_a_contact_column() {
        let err = parse_leads_csv(b"Company,City\nAcme,Austin\n").unwrap_err();
        assert!(matches!(err, DriveError::Csv(_)));
    }
}
