use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};

use super::normalize::{collapse_ws, normalize_legacy_name, TableKind};

static TABLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").unwrap());
static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static TD_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static HEADER_CELL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td, th").unwrap());

/// Underlined prose fragment that sits between some headings and their table.
const FILLER_TITLE: &str = "earlier than";
/// How many `<u>` elements to step back over before giving up on a table.
const MAX_TITLE_LOOKBACK: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Date(NaiveDate),
    Text(String),
}

impl Cell {
    pub fn parse(raw: &str) -> Cell {
        match convert_to_date(raw) {
            Some(d) => Cell::Date(d),
            None => Cell::Text(raw.to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(t) => Some(t),
            Cell::Date(_) => None,
        }
    }
}

/// Dates print as `DDMONYY`, the way the bulletin writes them.
impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Date(d) => write!(f, "{}", d.format("%d%b%y").to_string().to_uppercase()),
            Cell::Text(t) => f.write_str(t),
        }
    }
}

/// One classified bulletin table. `title` is a `TableKind` code; the first
/// cell of every row is the visa class label.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(title: &str, headers: &[&str], rows: Vec<Vec<Cell>>) -> Self {
        Table {
            title: title.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows,
        }
    }
}

/// `DDMonYY` → date. "01APR01" is 2001-04-01. Anything else is not a date.
pub fn convert_to_date(value: &str) -> Option<NaiveDate> {
    let v = value.trim();
    if v.len() < 6 || v.len() > 7 || !v.is_ascii() {
        return None;
    }
    NaiveDate::parse_from_str(v, "%d%b%y").ok()
}

/// Text of an element with its text nodes joined by single spaces, all
/// whitespace (NBSP included) collapsed, trimmed.
pub fn element_text(el: ElementRef) -> String {
    let joined = el
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    collapse_ws(&joined)
}

fn row_cells(row: ElementRef, sel: &Selector) -> Vec<Cell> {
    row.select(sel).map(|c| Cell::parse(&element_text(c))).collect()
}

// ── Modern format (2015+) ──

/// Walk back from the table through preceding `<u>` elements, skipping the
/// filler fragment, and return the first real underlined title. The search
/// stops before the `MAX_TITLE_LOOKBACK`th element.
fn find_title(underlines_before: &[ElementRef]) -> Option<String> {
    for (i, u) in underlines_before.iter().rev().enumerate() {
        if i + 1 >= MAX_TITLE_LOOKBACK {
            return None;
        }
        let text = element_text(*u);
        if text != FILLER_TITLE {
            return Some(text);
        }
    }
    None
}

fn extract_table(table: ElementRef, underlines_before: &[ElementRef]) -> Option<Table> {
    let title = find_title(underlines_before)?;

    let trs: Vec<ElementRef> = table.select(&ROW_SEL).collect();
    let first = trs.first()?;
    if first.select(&TD_SEL).count() <= 1 {
        return None;
    }

    let kind = TableKind::from_heading(&title)?;

    let mut rows: Vec<Vec<Cell>> = trs
        .iter()
        .map(|tr| row_cells(*tr, &TD_SEL))
        .filter(|cols| !cols.is_empty())
        .collect();
    if rows.len() < 2 {
        return None;
    }
    let headers = rows.remove(0).iter().map(Cell::to_string).collect();

    Some(Table {
        title: kind.code().to_string(),
        headers,
        rows,
    })
}

// ── Legacy format (2001-2015) ──

fn extract_table_legacy(table: ElementRef) -> Option<Table> {
    let trs: Vec<ElementRef> = table.select(&ROW_SEL).collect();
    if trs.len() <= 1 {
        return None;
    }

    let header_cells: Vec<ElementRef> = trs[0].select(&HEADER_CELL_SEL).collect();
    let first = header_cells.first()?;
    let first_text = element_text(*first).to_lowercase();

    let kind = if first_text.contains("family") {
        TableKind::FamilyFinalAction
    } else if first_text.contains("employment") {
        TableKind::EmploymentFinalAction
    } else {
        return None;
    };
    let is_family = kind == TableKind::FamilyFinalAction;

    let mut rows = Vec::new();
    for tr in &trs[1..] {
        let mut cols = row_cells(*tr, &TD_SEL);
        if cols.len() <= 1 {
            continue;
        }
        if is_family {
            if let Some(class) = cols.first().and_then(Cell::as_text).filter(|c| !c.is_empty()) {
                cols[0] = Cell::Text(normalize_legacy_name(class));
            }
        }
        rows.push(cols);
    }
    if rows.is_empty() {
        return None;
    }

    let headers = header_cells.iter().map(|c| element_text(*c)).collect();
    Some(Table {
        title: kind.code().to_string(),
        headers,
        rows,
    })
}

/// Parse every tracked table out of a bulletin page. Modern headings are
/// tried first; the legacy first-cell classification only runs when the
/// page produced no modern table at all.
pub fn extract_tables(html: &str) -> Vec<Table> {
    let document = Html::parse_document(html);

    // Document-order walk: remember each <u> seen so far, and for every
    // <table> the underlines that precede it.
    let mut underlines: Vec<ElementRef> = Vec::new();
    let mut tables: Vec<(ElementRef, usize)> = Vec::new();
    for el in document.root_element().descendants().filter_map(ElementRef::wrap) {
        match el.value().name() {
            "u" => underlines.push(el),
            "table" => tables.push((el, underlines.len())),
            _ => {}
        }
    }

    let modern: Vec<Table> = tables
        .iter()
        .filter_map(|(t, seen)| extract_table(*t, &underlines[..*seen]))
        .collect();
    if !modern.is_empty() {
        return modern;
    }

    let legacy: Vec<Table> = document
        .select(&TABLE_SEL)
        .filter_map(extract_table_legacy)
        .collect();
    if !legacy.is_empty() {
        tracing::debug!("Used legacy table layout ({} tables)", legacy.len());
    }
    legacy
}
