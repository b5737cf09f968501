//! Pivot materializer — flattens N parallel per-window table instances
//! into one wide table keyed by a shared row identity, with declarative
//! percentage-baseline rules per column.
//!
//! Baseline selection is centralized here as per-shape rules; columns never
//! carry their own ad hoc percentage logic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use clubroom_core::types::DimensionRow;

/// Maximum baselines a single cell may carry.
pub const MAX_BASELINES: usize = 3;

/// One table instance for one time window, keyed by natural row identity
/// (country name, username, UTM tag, state name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowTable {
    pub label: String,
    pub rows: Vec<KeyedRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedRow {
    pub key: String,
    pub values: HashMap<String, f64>,
}

impl WindowTable {
    /// Adapt count-style rows into a single-column window table.
    pub fn from_dimension_rows(label: impl Into<String>, rows: &[DimensionRow]) -> Self {
        Self {
            label: label.into(),
            rows: rows
                .iter()
                .map(|r| KeyedRow {
                    key: r.key().to_string(),
                    values: HashMap::from([("count".to_string(), r.count as f64)]),
                })
                .collect(),
        }
    }
}

/// Denominator used for one percentage of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    /// The row's own first column, same window.
    FirstColumn,
    /// A named sibling column, same row and window.
    Sibling(String),
    /// A fixed denominator.
    Constant(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRule {
    pub source: String,
    pub baselines: Vec<Baseline>,
}

impl ColumnRule {
    pub fn plain(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            baselines: Vec::new(),
        }
    }

    pub fn with_baselines(source: impl Into<String>, baselines: Vec<Baseline>) -> Self {
        Self {
            source: source.into(),
            baselines,
        }
    }
}

/// Declarative pivot rules for one report shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRules {
    pub name: String,
    pub columns: Vec<ColumnRule>,
    /// Prepend a synthetic TOTAL row summing every numeric column.
    pub total_row: bool,
}

impl ShapeRules {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnRule>) -> Self {
        Self {
            name: name.into(),
            columns,
            total_row: false,
        }
    }

    /// Geography split by room type — the one shape with a TOTAL row.
    pub fn geography_by_room_type() -> Self {
        Self {
            name: "geography_by_room_type".into(),
            columns: vec![
                ColumnRule::plain("total_rooms"),
                ColumnRule::with_baselines("social_rooms", vec![Baseline::FirstColumn]),
                ColumnRule::with_baselines("club_rooms", vec![Baseline::FirstColumn]),
            ],
            total_row: true,
        }
    }

    /// Funnel stages pivoted across windows: each stage shows % of
    /// pageviews and % of the previous stage.
    pub fn funnel_stages() -> Self {
        let stages = [
            "pageview",
            "click_scan",
            "install",
            "register",
            "verify",
            "join_club",
            "participate",
        ];
        let mut columns = vec![ColumnRule::plain(stages[0])];
        for pair in stages.windows(2) {
            columns.push(ColumnRule::with_baselines(
                pair[1],
                vec![Baseline::FirstColumn, Baseline::Sibling(pair[0].to_string())],
            ));
        }
        Self {
            name: "funnel_stages".into(),
            columns,
            total_row: false,
        }
    }

    /// Single count column, no percentages — used by the simple
    /// consolidated tables (countries, states, inviters, UTM tags).
    pub fn counts(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: vec![ColumnRule::plain("count")],
            total_row: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellValue {
    pub raw: f64,
    /// One percentage per baseline of the column's rule, in rule order.
    pub pct: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotRow {
    pub row_key: String,
    pub cells: HashMap<String, CellValue>,
}

/// Column id for a source column in a given window instance.
fn column_id(source: &str, window_index: usize) -> String {
    format!("{source}_w{window_index}")
}

fn ratio(raw: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        100.0 * raw / denominator
    }
}

/// Flatten parallel window instances into wide pivot rows.
///
/// Rows sharing a key are merged across windows; a key absent from one
/// window yields zero cells there rather than a dropped row. Row order is
/// first-seen across instances; the TOTAL row, when requested, is
/// prepended.
pub fn materialize(instances: &[WindowTable], rules: &ShapeRules) -> Vec<PivotRow> {
    // Row values per key, per window index.
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Vec<Option<&KeyedRow>>> = HashMap::new();
    for (wi, table) in instances.iter().enumerate() {
        for row in &table.rows {
            let slots = by_key.entry(row.key.clone()).or_insert_with(|| {
                order.push(row.key.clone());
                vec![None; instances.len()]
            });
            slots[wi] = Some(row);
        }
    }

    let value_of = |row: Option<&KeyedRow>, source: &str| -> f64 {
        row.and_then(|r| r.values.get(source).copied()).unwrap_or(0.0)
    };

    let build_row = |key: &str, window_values: &dyn Fn(usize, &str) -> f64| -> PivotRow {
        let mut cells = HashMap::new();
        for wi in 0..instances.len() {
            for rule in &rules.columns {
                let raw = window_values(wi, &rule.source);
                let pct = rule
                    .baselines
                    .iter()
                    .take(MAX_BASELINES)
                    .map(|baseline| {
                        let denominator = match baseline {
                            Baseline::FirstColumn => rules
                                .columns
                                .first()
                                .map(|first| window_values(wi, &first.source))
                                .unwrap_or(0.0),
                            Baseline::Sibling(name) => window_values(wi, name),
                            Baseline::Constant(value) => *value,
                        };
                        ratio(raw, denominator)
                    })
                    .collect();
                cells.insert(column_id(&rule.source, wi), CellValue { raw, pct });
            }
        }
        PivotRow {
            row_key: key.to_string(),
            cells,
        }
    };

    let mut rows: Vec<PivotRow> = order
        .iter()
        .map(|key| {
            let slots = &by_key[key];
            build_row(key, &|wi, source| value_of(slots[wi], source))
        })
        .collect();

    if rules.total_row {
        // Sum each source column across merged rows, per window.
        let mut sums: HashMap<(usize, String), f64> = HashMap::new();
        for slots in by_key.values() {
            for (wi, slot) in slots.iter().enumerate() {
                for rule in &rules.columns {
                    *sums.entry((wi, rule.source.clone())).or_insert(0.0) +=
                        value_of(*slot, &rule.source);
                }
            }
        }
        let total = build_row("TOTAL", &|wi, source| {
            sums.get(&(wi, source.to_string())).copied().unwrap_or(0.0)
        });
        rows.insert(0, total);
    }

    rows
}
