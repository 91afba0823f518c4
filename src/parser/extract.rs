use chrono::NaiveDate;
use serde::Serialize;

use super::normalize::{resolve_title, ActionType, Country, VisaCategory};
use super::tables::{Cell, Table};

pub const CURRENT: &str = "C";
pub const UNAVAILABLE: &str = "U";

/// Non-key fields of a stored cutoff. Exactly one reading applies: a parsed
/// date, current, unavailable, or an opaque literal with everything unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CutoffFields {
    pub cutoff_value: String,
    pub cutoff_date: Option<NaiveDate>,
    pub is_current: bool,
    pub is_unavailable: bool,
}

impl CutoffFields {
    /// "C" resolves to the bulletin's own publication date so a chart can
    /// plot it as "caught up as of this month".
    pub fn from_cell(cell: &Cell, publication_date: NaiveDate) -> Self {
        match cell {
            Cell::Date(d) => CutoffFields {
                cutoff_value: d.format("%Y-%m-%d").to_string(),
                cutoff_date: Some(*d),
                is_current: false,
                is_unavailable: false,
            },
            Cell::Text(t) if t == CURRENT => CutoffFields {
                cutoff_value: CURRENT.to_string(),
                cutoff_date: Some(publication_date),
                is_current: true,
                is_unavailable: false,
            },
            Cell::Text(t) if t == UNAVAILABLE => CutoffFields {
                cutoff_value: UNAVAILABLE.to_string(),
                cutoff_date: None,
                is_current: false,
                is_unavailable: true,
            },
            Cell::Text(t) => {
                tracing::debug!("Unrecognized cutoff value {:?}, storing as-is", t);
                CutoffFields {
                    cutoff_value: t.clone(),
                    cutoff_date: None,
                    is_current: false,
                    is_unavailable: false,
                }
            }
        }
    }
}

/// One candidate row for the cutoff store, before it is tied to a bulletin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CutoffRecord {
    #[serde(serialize_with = "ser_category")]
    pub visa_category: VisaCategory,
    pub visa_class: String,
    #[serde(serialize_with = "ser_action")]
    pub action_type: ActionType,
    #[serde(serialize_with = "ser_country")]
    pub country: Country,
    #[serde(flatten)]
    pub fields: CutoffFields,
}

fn ser_category<S: serde::Serializer>(v: &VisaCategory, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(v.code())
}

fn ser_action<S: serde::Serializer>(v: &ActionType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(v.code())
}

fn ser_country<S: serde::Serializer>(v: &Country, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(v.code())
}

/// Flatten one table into per-country records. Unknown titles give nothing;
/// unknown country columns are dropped cell by cell.
pub fn extract_records(table: &Table, publication_date: NaiveDate) -> Vec<CutoffRecord> {
    let Some((visa_category, action_type)) = resolve_title(&table.title) else {
        tracing::debug!("Skipping table with unknown title {:?}", table.title);
        return Vec::new();
    };

    // headers[0] labels the class column
    let countries: Vec<Option<Country>> = table
        .headers
        .iter()
        .skip(1)
        .map(|h| Country::from_header(h))
        .collect();

    let mut results = Vec::new();
    for row in &table.rows {
        let Some((class_cell, values)) = row.split_first() else {
            continue;
        };
        let visa_class = class_cell.to_string();

        for (country, value) in countries.iter().zip(values) {
            let Some(country) = country else { continue };
            results.push(CutoffRecord {
                visa_category,
                visa_class: visa_class.clone(),
                action_type,
                country: *country,
                fields: CutoffFields::from_cell(value, publication_date),
            });
        }
    }
    results
}
