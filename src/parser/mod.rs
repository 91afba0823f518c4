pub mod extract;
pub mod normalize;
pub mod tables;

use chrono::NaiveDate;

use extract::CutoffRecord;
use tables::Table;
pub use tables::extract_tables;

pub struct ParsedPage {
    pub tables: Vec<Table>,
    pub records: Vec<CutoffRecord>,
}

/// Two-pass pipeline: bulletin HTML → tables → cutoff records.
pub fn process_page(html: &str, publication_date: NaiveDate) -> ParsedPage {
    let tables = extract_tables(html);
    let records = tables
        .iter()
        .flat_map(|t| extract::extract_records(t, publication_date))
        .collect();
    ParsedPage { tables, records }
}
