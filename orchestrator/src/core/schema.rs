//! Declarative extraction schemas.
//!
//! A schema names the fields a stage wants out of free-form provider text, the
//! type of each field (which also selects its reconciliation strategy), and the
//! ordered text-pattern rules used to find it.

/// Field type. Selects both the extraction conversion and the merge strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// One of a closed set of lowercase choices. Merged by plurality vote.
    Categorical {
        choices: &'static [&'static str],
        default: Option<&'static str>,
    },
    /// Bounded number. Merged by mean, rounded to `precision` decimals.
    Numeric {
        min: f64,
        max: f64,
        precision: u32,
        default: Option<f64>,
    },
    /// Capped list of short strings. Merged by case-insensitive union.
    TextList { max: usize },
    /// Prose. Merged by taking the longest value.
    FreeText,
    /// Yes/no. Merged by strict majority; ties resolve to `false`.
    Boolean,
}

/// Text-pattern rule. Rules for a field are tried in order; the first hit wins.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// `Label: value` lines, including markdown-decorated labels.
    Labeled(&'static [&'static str]),
    /// Numbered or bulleted items under a header line.
    Section(&'static [&'static str]),
    /// File paths mentioned under a header line.
    SectionPaths(&'static [&'static str]),
    /// Every numbered line in the text.
    Numbered,
    /// Keyword occurrence counts per choice; most hits wins, earlier group on ties.
    KeywordVote(&'static [(&'static str, &'static [&'static str])]),
    /// `N/10` or `N out of 10`.
    OutOfTen,
    /// Repository-like file paths anywhere in the text.
    FilePaths,
    /// Body of the first fenced code block tagged with this language.
    Fenced(&'static str),
    /// True when any `require` term appears and no `forbid` term does; absent
    /// when the text mentions neither.
    Presence {
        require: &'static [&'static str],
        forbid: &'static [&'static str],
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub rules: Vec<Rule>,
}

impl FieldSpec {
    pub fn new(name: &'static str, kind: FieldKind, rules: Vec<Rule>) -> Self {
        Self { name, kind, rules }
    }

    pub fn categorical(
        name: &'static str,
        choices: &'static [&'static str],
        default: Option<&'static str>,
        rules: Vec<Rule>,
    ) -> Self {
        Self::new(name, FieldKind::Categorical { choices, default }, rules)
    }

    pub fn numeric(
        name: &'static str,
        range: (f64, f64),
        precision: u32,
        default: Option<f64>,
        rules: Vec<Rule>,
    ) -> Self {
        let (min, max) = range;
        Self::new(
            name,
            FieldKind::Numeric {
                min,
                max,
                precision,
                default,
            },
            rules,
        )
    }

    pub fn list(name: &'static str, max: usize, rules: Vec<Rule>) -> Self {
        Self::new(name, FieldKind::TextList { max }, rules)
    }

    pub fn text(name: &'static str, rules: Vec<Rule>) -> Self {
        Self::new(name, FieldKind::FreeText, rules)
    }

    pub fn flag(name: &'static str, rules: Vec<Rule>) -> Self {
        Self::new(name, FieldKind::Boolean, rules)
    }
}

/// Named, ordered set of fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub id: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(id: &'static str, fields: Vec<FieldSpec>) -> Self {
        Self { id, fields }
    }
}

/// Round to `precision` decimal places.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision.min(12) as i32);
    (value * scale).round() / scale
}

/// Clamp then round a numeric value to the field's declared range and precision.
pub fn normalize_number(value: f64, min: f64, max: f64, precision: u32) -> f64 {
    round_to(value.clamp(min, max), precision).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_precision() {
        assert_eq!(round_to(6.5, 0), 7.0);
        assert_eq!(round_to(0.8349, 2), 0.83);
        assert_eq!(round_to(7.0, 0), 7.0);
    }

    #[test]
    fn normalize_clamps_before_rounding() {
        assert_eq!(normalize_number(14.0, 0.0, 10.0, 0), 10.0);
        assert_eq!(normalize_number(-3.0, 0.0, 10.0, 0), 0.0);
        assert_eq!(normalize_number(0.996, 0.0, 1.0, 2), 1.0);
    }
}
