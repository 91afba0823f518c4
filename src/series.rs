use std::collections::BTreeMap;

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;

use crate::db::{self, canonical_bulletin_url, SeriesRow};
use crate::parser::normalize::{
    normalize_for_display, normalize_legacy_name, ActionType, Country, EmploymentClass, FamilyClass,
    VisaCategory,
};
use crate::projection::{calculate_projection, ProjectionResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesPoint {
    pub publication_date: NaiveDate,
    pub cutoff_date: Option<NaiveDate>,
    pub bulletin_url: String,
}

/// One logical visa class, merged across its historical spellings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisaClassSeries {
    /// Family code (`F2A`) or the first raw employment label seen.
    pub visa_class: String,
    pub label: String,
    pub points: Vec<SeriesPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<ProjectionResult>,
}

impl VisaClassSeries {
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|p| p.publication_date).collect()
    }

    pub fn cutoffs(&self) -> Vec<Option<NaiveDate>> {
        self.points.iter().map(|p| p.cutoff_date).collect()
    }

    pub fn project(&mut self, target: NaiveDate) {
        self.projection = calculate_projection(&self.dates(), &self.cutoffs(), target);
    }
}

/// Grouping key and label for a raw class, or `None` if it is not one of
/// the tracked classes.
fn canonical_class(category: VisaCategory, raw: &str) -> Option<(String, String)> {
    match category {
        VisaCategory::FamilySponsored => {
            let code = normalize_legacy_name(raw);
            let class = FamilyClass::parse(&code)?;
            Some((class.code().to_string(), class.label().to_string()))
        }
        VisaCategory::EmploymentBased => {
            let class = EmploymentClass::classify(raw)?;
            Some((class.label().to_string(), class.label().to_string()))
        }
    }
}

fn matches_filter(category: VisaCategory, raw: &str, key: &str, filter: &str) -> bool {
    if raw == filter || key == filter {
        return true;
    }
    match canonical_class(category, filter) {
        Some((filter_key, _)) => filter_key == key,
        None => false,
    }
}

/// Group stored rows into per-class series. Rows must be ordered by
/// publication date; the first variant seen for a month wins.
pub fn aggregate_series(
    category: VisaCategory,
    rows: &[SeriesRow],
    class_filter: Option<&str>,
) -> Vec<VisaClassSeries> {
    let mut grouped: BTreeMap<String, VisaClassSeries> = BTreeMap::new();

    for row in rows {
        let Some((key, label)) = canonical_class(category, &row.visa_class) else {
            tracing::debug!("Skipping unrecognized class {:?}", row.visa_class);
            continue;
        };
        if let Some(f) = class_filter {
            if !matches_filter(category, &row.visa_class, &key, f) {
                continue;
            }
        }

        let series = grouped.entry(label.clone()).or_insert_with(|| VisaClassSeries {
            visa_class: match category {
                VisaCategory::FamilySponsored => key.clone(),
                VisaCategory::EmploymentBased => row.visa_class.clone(),
            },
            label,
            points: Vec::new(),
            projection: None,
        });

        if series
            .points
            .iter()
            .any(|p| p.publication_date == row.publication_date)
        {
            continue;
        }

        let cutoff_date = if row.is_current {
            Some(row.publication_date)
        } else if row.is_unavailable {
            None
        } else {
            row.cutoff_date
        };
        series.points.push(SeriesPoint {
            publication_date: row.publication_date,
            cutoff_date,
            bulletin_url: row
                .url
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| canonical_bulletin_url(row.publication_date)),
        });
    }

    // BTreeMap keeps the label order
    grouped
        .into_values()
        .map(|mut s| {
            s.points.sort_by_key(|p| p.publication_date);
            s
        })
        .collect()
}

/// Series for one category/country/action type, optionally narrowed to a
/// single class (raw label, family code or display label).
pub fn get_series(
    conn: &Connection,
    category: VisaCategory,
    country: Country,
    action_type: ActionType,
    class_filter: Option<&str>,
) -> Result<Vec<VisaClassSeries>> {
    let rows = db::fetch_series_rows(conn, category, country, action_type)?;
    Ok(aggregate_series(category, &rows, class_filter))
}

/// One representative raw label per distinct display name, sorted by
/// display name. Labels that do not classify keep their raw text.
pub fn dedup_employment_classes(raw_classes: &[String]) -> Vec<(String, String)> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for raw in raw_classes {
        seen.entry(normalize_for_display(raw))
            .or_insert_with(|| raw.clone());
    }
    seen.into_iter().map(|(display, raw)| (raw, display)).collect()
}

/// Class choices for a category as `(value, label)` pairs.
pub fn visa_classes_for_category(conn: &Connection, category: VisaCategory) -> Result<Vec<(String, String)>> {
    match category {
        VisaCategory::FamilySponsored => Ok(FamilyClass::ALL
            .iter()
            .map(|c| (c.code().to_string(), c.label().to_string()))
            .collect()),
        VisaCategory::EmploymentBased => {
            let raw = db::fetch_distinct_classes(conn, category)?;
            Ok(dedup_employment_classes(&raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(class: &str, pub_date: NaiveDate, value: &str) -> SeriesRow {
        let (cutoff_date, is_current, is_unavailable) = match value {
            "C" => (Some(pub_date), true, false),
            "U" => (None, false, true),
            v => (NaiveDate::parse_from_str(v, "%Y-%m-%d").ok(), false, false),
        };
        SeriesRow {
            visa_class: class.to_string(),
            publication_date: pub_date,
            url: None,
            cutoff_date,
            is_current,
            is_unavailable,
        }
    }

    #[test]
    fn employment_variants_merge() {
        let rows = vec![
            row("1st", date(2010, 1, 1), "2008-01-01"),
            row("1 st", date(2011, 1, 1), "2009-01-01"),
            row("EB-1", date(2012, 1, 1), "C"),
            row("2nd", date(2012, 1, 1), "2007-05-01"),
            row("Footnote", date(2012, 1, 1), "C"),
        ];
        let series = aggregate_series(VisaCategory::EmploymentBased, &rows, None);
        assert_eq!(series.len(), 2);

        let eb1 = &series[0];
        assert_eq!(eb1.label, "EB-1: Priority Workers");
        assert_eq!(eb1.visa_class, "1st");
        assert_eq!(
            eb1.cutoffs(),
            vec![Some(date(2008, 1, 1)), Some(date(2009, 1, 1)), Some(date(2012, 1, 1))]
        );
        assert_eq!(series[1].label, "EB-2: Professionals with Advanced Degrees");
    }

    #[test]
    fn duplicate_months_keep_first_variant() {
        let rows = vec![
            row("1 st", date(2010, 1, 1), "2008-01-01"),
            row("1st", date(2010, 1, 1), "2001-01-01"),
        ];
        let series = aggregate_series(VisaCategory::EmploymentBased, &rows, None);
        assert_eq!(series[0].points.len(), 1);
        assert_eq!(series[0].points[0].cutoff_date, Some(date(2008, 1, 1)));
    }

    #[test]
    fn family_legacy_and_modern_merge() {
        let rows = vec![
            row("1st", date(2005, 1, 1), "2001-01-01"),
            row("F1", date(2020, 1, 1), "2014-01-01"),
            row("3 rd", date(2005, 1, 1), "U"),
            row("Unknown", date(2005, 1, 1), "C"),
        ];
        let series = aggregate_series(VisaCategory::FamilySponsored, &rows, None);
        let codes: Vec<&str> = series.iter().map(|s| s.visa_class.as_str()).collect();
        assert_eq!(codes, vec!["F1", "F3"]);
        assert_eq!(series[0].dates(), vec![date(2005, 1, 1), date(2020, 1, 1)]);
        assert_eq!(series[1].cutoffs(), vec![None]);
    }

    #[test]
    fn class_filter_accepts_any_spelling() {
        let rows = vec![
            row("1st", date(2010, 1, 1), "2008-01-01"),
            row("2nd", date(2010, 1, 1), "2007-01-01"),
        ];
        for f in ["1st", "EB-1", "EB-1: Priority Workers"] {
            let s = aggregate_series(VisaCategory::EmploymentBased, &rows, Some(f));
            assert_eq!(s.len(), 1, "{}", f);
            assert_eq!(s[0].label, "EB-1: Priority Workers");
        }
        let fam = vec![row("2A", date(2010, 1, 1), "C"), row("F1", date(2010, 1, 1), "C")];
        let s = aggregate_series(VisaCategory::FamilySponsored, &fam, Some("F2A"));
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].visa_class, "F2A");
        assert!(aggregate_series(VisaCategory::FamilySponsored, &fam, Some("F4")).is_empty());
    }

    #[test]
    fn missing_url_uses_canonical() {
        let rows = vec![row("F1", date(2023, 11, 1), "C")];
        let s = aggregate_series(VisaCategory::FamilySponsored, &rows, None);
        assert!(s[0].points[0].bulletin_url.contains("/2024/visa-bulletin-for-november-2023.html"));
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(aggregate_series(VisaCategory::EmploymentBased, &[], None).is_empty());
    }

    #[test]
    fn projection_attaches() {
        let rows: Vec<SeriesRow> = (1..=12)
            .map(|m| row("F1", date(2024, m, 1), &format!("2015-{:02}-01", m)))
            .collect();
        let mut s = aggregate_series(VisaCategory::FamilySponsored, &rows, None);
        s[0].project(date(2016, 6, 1));
        let p = s[0].projection.as_ref().unwrap();
        assert_eq!(p.status, crate::projection::ProjectionStatus::Projected);
        assert!(p.estimated_date.is_some());
    }

    #[test]
    fn dedup_employment_display_names() {
        let raw: Vec<String> = ["1st", "1 st", "EB-1", "2nd", "Certain Religious Workers", "5th Rural"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let d = dedup_employment_classes(&raw);
        let eb1: Vec<_> = d.iter().filter(|(_, l)| l == "EB-1: Priority Workers").collect();
        assert_eq!(eb1.len(), 1);
        assert_eq!(eb1[0].0, "1st");
        assert_eq!(d.len(), 4);
        let labels: Vec<&str> = d.iter().map(|(_, l)| l.as_str()).collect();
        let mut sorted = labels.clone();
        sorted.sort();
        assert_eq!(labels, sorted);
    }
}
