use std::sync::LazyLock;

use regex::Regex;

static ALL_AREAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ALL CHARGEABILITY").unwrap());
static CHINA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^CHINA(\s*-\s*|\s+)MAINLAND|^CHINA$").unwrap());
static INDIA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^INDIA$").unwrap());
static MEXICO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^MEXICO$").unwrap());
static PHILIPPINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PHILIPPINES$").unwrap());
static CENTRAL_AMERICA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^EL SALVADOR\b").unwrap());

/// Collapse every whitespace run (including NBSP and the `Â ` mojibake some
/// pages carry) into one ASCII space.
pub fn collapse_ws(s: &str) -> String {
    s.replace("Â\u{a0}", " ")
        .replace("Â ", " ")
        .split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Visa category / action type / table kind ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisaCategory {
    FamilySponsored,
    EmploymentBased,
}

impl VisaCategory {
    pub const ALL: [VisaCategory; 2] = [VisaCategory::FamilySponsored, VisaCategory::EmploymentBased];

    pub fn code(self) -> &'static str {
        match self {
            VisaCategory::FamilySponsored => "family_sponsored",
            VisaCategory::EmploymentBased => "employment_based",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VisaCategory::FamilySponsored => "Family-Sponsored",
            VisaCategory::EmploymentBased => "Employment-Based",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    FinalAction,
    Filing,
}

impl ActionType {
    pub const ALL: [ActionType; 2] = [ActionType::FinalAction, ActionType::Filing];

    pub fn code(self) -> &'static str {
        match self {
            ActionType::FinalAction => "final_action",
            ActionType::Filing => "filing",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ActionType::FinalAction => "Final Action",
            ActionType::Filing => "Dates for Filing",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.code() == code)
    }
}

/// The four tables a bulletin publishes. Legacy bulletins only carry the two
/// final-action variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    FamilyFinalAction,
    FamilyFiling,
    EmploymentFinalAction,
    EmploymentFiling,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::FamilyFinalAction,
        TableKind::FamilyFiling,
        TableKind::EmploymentFinalAction,
        TableKind::EmploymentFiling,
    ];

    pub fn code(self) -> &'static str {
        match self {
            TableKind::FamilyFinalAction => "family_sponsored_final_actions",
            TableKind::FamilyFiling => "family_sponsored_dates_for_filing",
            TableKind::EmploymentFinalAction => "employment_based_final_action",
            TableKind::EmploymentFiling => "employment_based_dates_for_filing",
        }
    }

    /// Underlined heading printed above the table in modern bulletins.
    pub fn heading(self) -> &'static str {
        match self {
            TableKind::FamilyFinalAction => "FINAL ACTION DATES FOR FAMILY-SPONSORED PREFERENCE CASES",
            TableKind::FamilyFiling => "DATES FOR FILING FAMILY-SPONSORED VISA APPLICATIONS",
            TableKind::EmploymentFinalAction => "FINAL ACTION DATES FOR EMPLOYMENT-BASED PREFERENCE CASES",
            TableKind::EmploymentFiling => "DATES FOR FILING OF EMPLOYMENT-BASED VISA APPLICATIONS",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn from_heading(heading: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.heading() == heading)
    }

    pub fn category(self) -> VisaCategory {
        match self {
            TableKind::FamilyFinalAction | TableKind::FamilyFiling => VisaCategory::FamilySponsored,
            TableKind::EmploymentFinalAction | TableKind::EmploymentFiling => {
                VisaCategory::EmploymentBased
            }
        }
    }

    pub fn action_type(self) -> ActionType {
        match self {
            TableKind::FamilyFinalAction | TableKind::EmploymentFinalAction => ActionType::FinalAction,
            TableKind::FamilyFiling | TableKind::EmploymentFiling => ActionType::Filing,
        }
    }
}

/// Table title code → (category, action type). `None` for anything that is
/// not one of the four known codes.
pub fn resolve_title(title: &str) -> Option<(VisaCategory, ActionType)> {
    TableKind::from_code(title).map(|k| (k.category(), k.action_type()))
}

// ── Country ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Country {
    All,
    China,
    India,
    Mexico,
    Philippines,
    ElSalvadorGuatemalaHonduras,
}

impl Country {
    pub const ALL: [Country; 6] = [
        Country::All,
        Country::China,
        Country::India,
        Country::Mexico,
        Country::Philippines,
        Country::ElSalvadorGuatemalaHonduras,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Country::All => "all",
            Country::China => "china",
            Country::India => "india",
            Country::Mexico => "mexico",
            Country::Philippines => "philippines",
            Country::ElSalvadorGuatemalaHonduras => "el_salvador_guatemala_honduras",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Country::All => "All Chargeability Areas",
            Country::China => "China (mainland born)",
            Country::India => "India",
            Country::Mexico => "Mexico",
            Country::Philippines => "Philippines",
            Country::ElSalvadorGuatemalaHonduras => "El Salvador/Guatemala/Honduras",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code().eq_ignore_ascii_case(code))
    }

    /// Map a column header to its chargeability area. Headers drift in
    /// spacing, hyphenation and line breaks between bulletins.
    pub fn from_header(header: &str) -> Option<Self> {
        let collapsed = collapse_ws(header);
        if let Some(c) = Self::from_code(&collapsed) {
            return Some(c);
        }
        let h = collapsed.to_uppercase();
        let found = if ALL_AREAS_RE.is_match(&h) {
            Some(Country::All)
        } else if CHINA_RE.is_match(&h) {
            Some(Country::China)
        } else if INDIA_RE.is_match(&h) {
            Some(Country::India)
        } else if MEXICO_RE.is_match(&h) {
            Some(Country::Mexico)
        } else if PHILIPPINES_RE.is_match(&h) {
            Some(Country::Philippines)
        } else if CENTRAL_AMERICA_RE.is_match(&h) {
            Some(Country::ElSalvadorGuatemalaHonduras)
        } else {
            None
        };
        if found.is_none() {
            tracing::debug!("Unrecognized country header: {:?}", header);
        }
        found
    }
}

// ── Family-sponsored classes ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyClass {
    F1,
    F2A,
    F2B,
    F3,
    F4,
}

impl FamilyClass {
    pub const ALL: [FamilyClass; 5] = [
        FamilyClass::F1,
        FamilyClass::F2A,
        FamilyClass::F2B,
        FamilyClass::F3,
        FamilyClass::F4,
    ];

    pub fn code(self) -> &'static str {
        match self {
            FamilyClass::F1 => "F1",
            FamilyClass::F2A => "F2A",
            FamilyClass::F2B => "F2B",
            FamilyClass::F3 => "F3",
            FamilyClass::F4 => "F4",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FamilyClass::F1 => "F1: Unmarried Sons/Daughters of U.S. Citizens",
            FamilyClass::F2A => "F2A: Spouses/Children of Permanent Residents",
            FamilyClass::F2B => "F2B: Unmarried Sons/Daughters (21+) of Permanent Residents",
            FamilyClass::F3 => "F3: Married Sons/Daughters of U.S. Citizens",
            FamilyClass::F4 => "F4: Brothers/Sisters of Adult U.S. Citizens",
        }
    }

    /// Accepts both the legacy ordinal labels ("1st", "2 A", "4 th") and the
    /// modern codes.
    pub fn parse(raw: &str) -> Option<Self> {
        let compact: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
            .collect::<String>()
            .to_uppercase();
        match compact.as_str() {
            "1ST" | "F1" => Some(FamilyClass::F1),
            "2A" | "F2A" => Some(FamilyClass::F2A),
            "2B" | "F2B" => Some(FamilyClass::F2B),
            "3RD" | "F3" => Some(FamilyClass::F3),
            "4TH" | "F4" => Some(FamilyClass::F4),
            _ => None,
        }
    }
}

/// Legacy family label → modern code; unknown labels come back unchanged.
pub fn normalize_legacy_name(raw: &str) -> String {
    match FamilyClass::parse(raw) {
        Some(class) => class.code().to_string(),
        None => raw.to_string(),
    }
}

// ── Employment-based classes ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmploymentClass {
    Eb1,
    Eb2,
    Eb3,
    Eb3OtherWorkers,
    Eb3ScheduleA,
    Eb4,
    Eb4ReligiousWorkers,
    Eb4Translators,
    Eb5Unreserved,
    Eb5Rural,
    Eb5HighUnemployment,
    Eb5Infrastructure,
    Eb5TargetedEmployment,
}

impl EmploymentClass {
    pub fn label(self) -> &'static str {
        match self {
            EmploymentClass::Eb1 => "EB-1: Priority Workers",
            EmploymentClass::Eb2 => "EB-2: Professionals with Advanced Degrees",
            EmploymentClass::Eb3 => "EB-3: Skilled Workers and Professionals",
            EmploymentClass::Eb3OtherWorkers => "EB-3: Other Workers",
            EmploymentClass::Eb3ScheduleA => "EB-3: Schedule A Workers",
            EmploymentClass::Eb4 => "EB-4: Special Immigrants",
            EmploymentClass::Eb4ReligiousWorkers => "EB-4: Religious Workers",
            EmploymentClass::Eb4Translators => "EB-4: Iraqi/Afghani Translators",
            EmploymentClass::Eb5Unreserved => "EB-5: Unreserved",
            EmploymentClass::Eb5Rural => "EB-5: Rural (20%)",
            EmploymentClass::Eb5HighUnemployment => "EB-5: High Unemployment (10%)",
            EmploymentClass::Eb5Infrastructure => "EB-5: Infrastructure (2%)",
            EmploymentClass::Eb5TargetedEmployment => {
                "EB-5: Targeted Employment Areas/Regional Centers"
            }
        }
    }

    /// Keyword classification of a raw employment row label. Order matters:
    /// named subcategories first, then the 1-4 preference prefix, then the
    /// EB-5 family with its set-aside keywords.
    ///
    /// ```text
    /// "1 st"                                  -> EB-1
    /// "5th Set Aside: (Rural - 20%)"          -> EB-5 Rural
    /// "5th Non-Regional Center (C5 and T5)"   -> EB-5 Unreserved
    /// ```
    pub fn classify(raw: &str) -> Option<Self> {
        let lower = collapse_ws(raw).to_lowercase();
        if lower.is_empty() {
            return None;
        }

        if lower.contains("religious") {
            return Some(EmploymentClass::Eb4ReligiousWorkers);
        }
        if lower.contains("other workers") {
            return Some(EmploymentClass::Eb3OtherWorkers);
        }
        if lower.contains("schedule a") {
            return Some(EmploymentClass::Eb3ScheduleA);
        }
        if lower.contains("translator") {
            return Some(EmploymentClass::Eb4Translators);
        }
        if lower.contains("targeted employment") && !lower.contains("non-regional") {
            return Some(EmploymentClass::Eb5TargetedEmployment);
        }

        let compact: String = lower.chars().filter(|c| *c != ' ' && *c != '-').collect();
        let stripped = compact.strip_prefix("eb").unwrap_or(&compact);
        match stripped.chars().next() {
            Some('1') => return Some(EmploymentClass::Eb1),
            Some('2') => return Some(EmploymentClass::Eb2),
            Some('3') => return Some(EmploymentClass::Eb3),
            Some('4') => return Some(EmploymentClass::Eb4),
            Some('5') => {}
            _ => return None,
        }

        let class = if lower.contains("rural") {
            EmploymentClass::Eb5Rural
        } else if lower.contains("unemployment") {
            EmploymentClass::Eb5HighUnemployment
        } else if lower.contains("infrastructure") {
            EmploymentClass::Eb5Infrastructure
        } else if lower.contains("non-regional") || lower.contains("unreserved") {
            EmploymentClass::Eb5Unreserved
        } else if lower.contains("targeted")
            || lower.contains("regional center")
            || lower.contains("pilot")
        {
            EmploymentClass::Eb5TargetedEmployment
        } else {
            EmploymentClass::Eb5Unreserved
        };
        Some(class)
    }
}

/// Raw employment label → canonical display name, or the raw label unchanged
/// when no category matches.
pub fn normalize_for_display(raw: &str) -> String {
    match EmploymentClass::classify(raw) {
        Some(class) => class.label().to_string(),
        None => raw.to_string(),
    }
}

// ── Display labels ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Category,
    ActionType,
    Country,
    FamilyClass,
    EmploymentClass,
}

/// Human label for a stored code. Unregistered values are returned as-is.
pub fn display_label(kind: LabelKind, value: &str) -> String {
    let label = match kind {
        LabelKind::Category => VisaCategory::from_code(value).map(|c| c.label()),
        LabelKind::ActionType => ActionType::from_code(value).map(|a| a.label()),
        LabelKind::Country => Country::from_code(value).map(|c| c.label()),
        LabelKind::FamilyClass => FamilyClass::parse(value).map(|f| f.label()),
        LabelKind::EmploymentClass => EmploymentClass::classify(value).map(|e| e.label()),
    };
    label.map(str::to_string).unwrap_or_else(|| value.to_string())
}
