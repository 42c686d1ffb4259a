//! Raw price-list grid to normalized catalog.

use quote_core::{Catalog, CatalogRow, QuoteError, CATALOG_COLUMNS};
use quote_source::{RawCell, RawTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Group labels kept as-is regardless of their sub-label.
pub const PASS_THROUGH_GROUPS: [&str; 4] = ["Product", "Description", "Cut-Off", "Pack"];
/// Group labels whose columns are split per currency (finished goods, bulk slabs).
pub const CURRENCY_GROUPS: [&str; 2] = ["成品", "大板"];
pub const CURRENCY_CODES: [&str; 2] = ["RMB", "USD"];

const PRICE_ABSENT_TOKEN: &str = "/";

static EMPTY_CELL: RawCell = RawCell::Empty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeaderDepth {
    One,
    #[default]
    Two,
}

impl HeaderDepth {
    pub fn rows(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Index of the first header row within the sheet's used range. The row
    /// above it is the sheet title in the price lists we receive.
    pub header_row: usize,
    pub header_rows: HeaderDepth,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            header_row: 1,
            header_rows: HeaderDepth::Two,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnLabel {
    Single(String),
    Pair { group: String, sub: Option<String> },
}

impl ColumnLabel {
    pub fn pair(group: &str, sub: Option<&str>) -> Self {
        Self::Pair {
            group: group.to_string(),
            sub: sub.map(str::to_string),
        }
    }
}

/// Collapses a header label to the single key used by the catalog schema.
pub fn flatten_column(label: &ColumnLabel) -> String {
    let (group, sub) = match label {
        ColumnLabel::Single(name) => return name.trim().to_string(),
        ColumnLabel::Pair { group, sub } => (group.trim(), sub.as_deref().map(str::trim)),
    };
    // spreadsheet exports write blank sub-labels as "nan"
    let sub = sub
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("nan"))
        .unwrap_or("");

    if PASS_THROUGH_GROUPS.contains(&group) {
        return group.to_string();
    }
    if CURRENCY_GROUPS.contains(&group) && CURRENCY_CODES.contains(&sub) {
        return format!("{group}_{sub}");
    }
    if sub.is_empty() {
        group.to_string()
    } else {
        format!("{group}_{sub}")
    }
}

/// Splits the grid into column labels and data records.
///
/// Merged group cells arrive blank after their first column, so a blank group
/// label above a non-blank sub-label inherits the group to its left.
pub fn locate_headers<'a>(
    table: &'a RawTable,
    options: &NormalizeOptions,
) -> Result<(Vec<ColumnLabel>, &'a [Vec<RawCell>]), QuoteError> {
    let depth = options.header_rows.rows();
    let first = options.header_row;
    let data_start = first.checked_add(depth).ok_or_else(|| {
        QuoteError::SourceFormat(format!("header row {first} is out of range"))
    })?;

    if table.rows.len() < data_start {
        return Err(QuoteError::SourceFormat(format!(
            "expected {depth} header row(s) starting at row {first}, sheet has {} row(s)",
            table.rows.len()
        )));
    }
    let header_blank = table.rows[first..data_start]
        .iter()
        .all(|row| row.iter().all(RawCell::is_blank));
    if header_blank {
        return Err(QuoteError::SourceFormat(format!(
            "header rows {first}..{data_start} are empty"
        )));
    }
    if table.rows.len() == data_start {
        return Err(QuoteError::SourceFormat(
            "no data rows below the header".to_string(),
        ));
    }

    let width = table.width();
    let labels: Vec<ColumnLabel> = match options.header_rows {
        HeaderDepth::One => (0..width)
            .map(|col| ColumnLabel::Single(table.cell(first, col).as_text().unwrap_or_default()))
            .collect(),
        HeaderDepth::Two => {
            let mut last_group: Option<String> = None;
            (0..width)
                .map(|col| {
                    let sub = table.cell(first + 1, col).as_text();
                    let group = match table.cell(first, col).as_text() {
                        Some(group) => {
                            last_group = Some(group.clone());
                            group
                        }
                        None if sub.is_some() => last_group.clone().unwrap_or_default(),
                        None => String::new(),
                    };
                    ColumnLabel::Pair { group, sub }
                })
                .collect()
        }
    };

    Ok((labels, &table.rows[data_start..]))
}

/// "/" and anything that does not parse as a finite, non-negative number are
/// treated as an unknown price.
pub fn coerce_price(cell: &RawCell) -> Option<f64> {
    let value = match cell {
        RawCell::Number(value) => *value,
        RawCell::Text(text) => {
            let text = text.trim();
            if text == PRICE_ABSENT_TOKEN {
                return None;
            }
            text.parse::<f64>().ok()?
        }
        RawCell::Empty => return None,
    };
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Forward-fills absent entries from the nearest preceding present one.
pub fn group_fill(values: &mut [Option<String>]) {
    let mut last: Option<String> = None;
    for value in values.iter_mut() {
        if value.is_some() {
            last = value.clone();
        } else {
            *value = last.clone();
        }
    }
}

fn cell_at(record: &[RawCell], column: Option<usize>) -> &RawCell {
    column
        .and_then(|idx| record.get(idx))
        .unwrap_or(&EMPTY_CELL)
}

/// Normalizes a raw price-list grid into the catalog. Deterministic; the
/// only failure is a grid without usable header and data rows.
pub fn normalize(table: &RawTable, options: &NormalizeOptions) -> Result<Catalog, QuoteError> {
    let (labels, records) = locate_headers(table, options)?;
    let keys = labels.iter().map(flatten_column).collect::<Vec<_>>();

    // first occurrence wins when two labels flatten to the same key
    let columns = CATALOG_COLUMNS.map(|key| keys.iter().position(|k| k == key));
    for (name, column) in CATALOG_COLUMNS.iter().zip(columns.iter()) {
        if column.is_none() {
            debug!(column = *name, "column missing from source, filled as absent");
        }
    }
    let ignored = keys
        .iter()
        .filter(|k| !k.is_empty() && !CATALOG_COLUMNS.contains(&k.as_str()))
        .collect::<Vec<_>>();
    if !ignored.is_empty() {
        debug!(?ignored, "dropping columns outside the catalog schema");
    }

    let [product, description, cut_off, pack, finished_rmb, finished_usd, bulk_rmb, bulk_usd] = columns;

    let mut products = records
        .iter()
        .map(|record| cell_at(record, product).as_text())
        .collect::<Vec<_>>();
    group_fill(&mut products);

    let catalog = records
        .iter()
        .zip(products)
        .map(|(record, product)| CatalogRow {
            product,
            description: cell_at(record, description).as_text(),
            cut_off: cell_at(record, cut_off).as_text(),
            pack: cell_at(record, pack).as_text(),
            finished_price_usd: coerce_price(cell_at(record, finished_usd)),
            finished_price_rmb: coerce_price(cell_at(record, finished_rmb)),
            bulk_price_usd: coerce_price(cell_at(record, bulk_usd)),
            bulk_price_rmb: coerce_price(cell_at(record, bulk_rmb)),
        })
        .filter(CatalogRow::is_retained)
        .collect::<Catalog>();

    info!(raw_rows = records.len(), catalog_rows = catalog.len(), "normalized price list");
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> RawCell {
        RawCell::Text(value.to_string())
    }

    fn header() -> Vec<Vec<RawCell>> {
        vec![
            vec![text("Price list 2026")],
            vec![
                text("Product"),
                text("Description"),
                text("Cut-Off"),
                text("Pack"),
                text("成品"),
                RawCell::Empty,
                text("大板"),
                RawCell::Empty,
            ],
            vec![
                RawCell::Empty,
                text("ignored"),
                RawCell::Empty,
                RawCell::Empty,
                text("RMB"),
                text("USD"),
                text("RMB"),
                text("USD"),
            ],
        ]
    }

    fn table_with(records: Vec<Vec<RawCell>>) -> RawTable {
        let mut rows = header();
        rows.extend(records);
        RawTable::new(rows)
    }

    #[test]
    fn pass_through_groups_ignore_sub_label() {
        for group in PASS_THROUGH_GROUPS {
            for sub in [None, Some(""), Some("USD"), Some("anything")] {
                assert_eq!(flatten_column(&ColumnLabel::pair(group, sub)), group);
            }
        }
    }

    #[test]
    fn currency_groups_merge_with_code() {
        assert_eq!(flatten_column(&ColumnLabel::pair("成品", Some("USD"))), "成品_USD");
        assert_eq!(flatten_column(&ColumnLabel::pair(" 大板 ", Some(" RMB "))), "大板_RMB");
        assert_eq!(flatten_column(&ColumnLabel::pair("Remark", Some("nan"))), "Remark");
        assert_eq!(flatten_column(&ColumnLabel::pair("Weight", Some("kg"))), "Weight_kg");
        assert_eq!(flatten_column(&ColumnLabel::Single("  Pack ".into())), "Pack");
    }

    #[test]
    fn price_coercion() {
        assert_eq!(coerce_price(&text("/")), None);
        assert_eq!(coerce_price(&text("abc")), None);
        assert_eq!(coerce_price(&text("12.50")), Some(12.5));
        assert_eq!(coerce_price(&RawCell::Number(0.0)), Some(0.0));
        assert_eq!(coerce_price(&RawCell::Number(-3.0)), None);
        assert_eq!(coerce_price(&text("NaN")), None);
        assert_eq!(coerce_price(&RawCell::Empty), None);
    }

    #[test]
    fn group_fill_carries_until_next_value() {
        let mut values = vec![
            Some("A".to_string()),
            None,
            None,
            Some("B".to_string()),
            None,
        ];
        group_fill(&mut values);
        let filled = values.iter().map(|v| v.as_deref().unwrap()).collect::<Vec<_>>();
        assert_eq!(filled, vec!["A", "A", "A", "B", "B"]);

        let mut leading = vec![None, Some("C".to_string())];
        group_fill(&mut leading);
        assert_eq!(leading[0], None);
    }

    #[test]
    fn empty_rows_are_removed_and_price_only_rows_kept() {
        let catalog = normalize(
            &table_with(vec![
                vec![text("Alpha"), text("desc")],
                vec![RawCell::Empty; 8],
                vec![
                    RawCell::Empty,
                    RawCell::Empty,
                    text("0-1mm"),
                    RawCell::Empty,
                    RawCell::Empty,
                    RawCell::Empty,
                    RawCell::Empty,
                    RawCell::Number(5.0),
                ],
            ]),
            &NormalizeOptions::default(),
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        let bulk_only = catalog.get(1).unwrap();
        assert_eq!(bulk_only.product.as_deref(), Some("Alpha"));
        assert_eq!(bulk_only.bulk_price_usd, Some(5.0));
        assert_eq!(bulk_only.finished_price_usd, None);
    }

    #[test]
    fn missing_price_columns_are_synthesized() {
        let table = RawTable::new(vec![
            vec![],
            vec![text("Product"), text("Pack")],
            vec![RawCell::Empty, RawCell::Empty],
            vec![text("Beta"), text("bag")],
        ]);
        let catalog = normalize(&table, &NormalizeOptions::default()).unwrap();
        let row = catalog.get(0).unwrap();
        assert_eq!(row.pack.as_deref(), Some("bag"));
        assert!(!row.has_any_price());
    }

    #[test]
    fn single_level_header_is_used_verbatim() {
        let table = RawTable::new(vec![
            vec![text("Product"), text("Description"), text("成品_USD")],
            vec![text("Gamma"), text("fine"), RawCell::Number(3.5)],
        ]);
        let options = NormalizeOptions {
            header_row: 0,
            header_rows: HeaderDepth::One,
        };
        let catalog = normalize(&table, &options).unwrap();
        assert_eq!(catalog.get(0).unwrap().finished_price_usd, Some(3.5));
    }

    #[test]
    fn malformed_sources_fail() {
        let too_short = RawTable::new(vec![vec![text("title")], vec![text("Product")]]);
        let err = normalize(&too_short, &NormalizeOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "source_format");

        let no_data = RawTable::new(header());
        assert!(matches!(
            normalize(&no_data, &NormalizeOptions::default()),
            Err(QuoteError::SourceFormat(_))
        ));

        let blank_header = RawTable::new(vec![
            vec![text("title")],
            vec![RawCell::Empty],
            vec![RawCell::Empty],
            vec![text("x")],
        ]);
        assert!(normalize(&blank_header, &NormalizeOptions::default()).is_err());
    }

    #[test]
    fn duplicate_flattened_keys_take_the_first_column() {
        let table = RawTable::new(vec![
            vec![text("title")],
            vec![text("Product"), text("Description"), text("Pack"), text("Pack")],
            vec![RawCell::Empty, RawCell::Empty, RawCell::Empty, text("nan")],
            vec![text("Alpha"), text("desc"), text("25kg/bag"), text("1mt drum")],
            vec![text("Beta"), text("desc"), RawCell::Empty, text("1mt drum")],
        ]);
        let catalog = normalize(&table, &NormalizeOptions::default()).unwrap();
        assert_eq!(catalog.get(0).unwrap().pack.as_deref(), Some("25kg/bag"));
        // the second Pack column never fills a gap in the first
        assert_eq!(catalog.get(1).unwrap().pack, None);
    }

    #[test]
    fn out_of_range_header_row_is_a_format_error() {
        let options = NormalizeOptions {
            header_row: usize::MAX,
            header_rows: HeaderDepth::Two,
        };
        let err = normalize(&table_with(vec![vec![text("Alpha")]]), &options).unwrap_err();
        assert_eq!(err.kind(), "source_format");
    }

    #[test]
    fn merged_group_cells_cover_their_sub_columns() {
        let table = table_with(vec![vec![]]);
        let (labels, _) = locate_headers(&table, &NormalizeOptions::default()).unwrap();
        let keys = labels.iter().map(flatten_column).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec!["Product", "Description", "Cut-Off", "Pack", "成品_RMB", "成品_USD", "大板_RMB", "大板_USD"]
        );
    }
}
