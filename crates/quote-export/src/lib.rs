//! Quotation documents.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use quote_core::{Quotation, QuotationItem};
use rust_xlsxwriter::{Color, Format, FormatAlign, FormatPattern, Workbook, Worksheet};
use tracing::debug;

pub const CRATE_NAME: &str = "quote-export";

pub const SHEET_NAME: &str = "Quotation";
pub const TITLE: &str = "QUOTATION";
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Zero-based row of the item table header (row 7 in the sheet).
pub const HEADER_ROW: u32 = 6;
pub const ITEM_HEADERS: [&str; 10] = [
    "No.",
    "Product",
    "Specimen",
    "Format",
    "Pack",
    "Qty",
    "Finished USD",
    "Finished RMB",
    "Bulk USD",
    "Bulk RMB",
];
const COLUMN_WIDTHS: [f64; 10] = [5.0, 30.0, 15.0, 15.0, 15.0, 8.0, 15.0, 15.0, 15.0, 15.0];

pub fn export_file_name(quotation: &Quotation) -> String {
    let number = quotation
        .quotation_number
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect::<String>();
    format!("quotation_{number}.xlsx")
}

/// Renders the quotation as an XLSX workbook: title, quotation block,
/// then one table row per item. Bulk cells stay blank when no bulk price
/// was quoted.
pub fn write_quotation_xlsx(quotation: &Quotation, date: NaiveDate) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME).context("naming quotation worksheet")?;

    write_title_block(sheet, quotation, date)?;
    write_item_table(sheet, &quotation.items)?;
    for (col, width) in COLUMN_WIDTHS.iter().enumerate() {
        sheet
            .set_column_width(col as u16, *width)
            .context("setting column width")?;
    }

    let bytes = workbook.save_to_buffer().context("finalizing quotation workbook")?;
    debug!(
        quotation = %quotation.quotation_number,
        items = quotation.items.len(),
        bytes = bytes.len(),
        "rendered quotation workbook"
    );
    Ok(bytes)
}

pub fn save_quotation_xlsx(quotation: &Quotation, date: NaiveDate, path: &Path) -> Result<()> {
    let bytes = write_quotation_xlsx(quotation, date)?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn write_title_block(sheet: &mut Worksheet, quotation: &Quotation, date: NaiveDate) -> Result<()> {
    let title_format = Format::new()
        .set_bold()
        .set_font_size(16)
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter);
    sheet
        .merge_range(0, 0, 0, (ITEM_HEADERS.len() - 1) as u16, TITLE, &title_format)
        .context("writing title")?;

    let info = [
        ("Quotation Number:", quotation.quotation_number.clone()),
        ("Customer Name:", quotation.customer_name.clone()),
        ("Date:", date.format("%Y-%m-%d").to_string()),
    ];
    for (offset, (label, value)) in info.iter().enumerate() {
        let row = 2 + offset as u32;
        sheet.write_string(row, 0, *label).context("writing quotation label")?;
        sheet.write_string(row, 1, value).context("writing quotation value")?;
    }
    Ok(())
}

fn write_item_table(sheet: &mut Worksheet, items: &[QuotationItem]) -> Result<()> {
    let header_format = Format::new()
        .set_bold()
        .set_pattern(FormatPattern::Solid)
        .set_background_color(Color::RGB(0xCCCCCC))
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter);
    for (col, header) in ITEM_HEADERS.iter().enumerate() {
        sheet
            .write_string_with_format(HEADER_ROW, col as u16, *header, &header_format)
            .context("writing item header row")?;
    }

    for (idx, item) in items.iter().enumerate() {
        let row = HEADER_ROW + 1 + idx as u32;
        sheet
            .write_number(row, 0, (idx + 1) as f64)
            .context("writing item number")?;
        for (col, text) in [&item.product, &item.specimen, &item.format, &item.pack]
            .into_iter()
            .enumerate()
        {
            sheet
                .write_string(row, 1 + col as u16, text.as_str())
                .context("writing item text")?;
        }
        sheet
            .write_number(row, 5, f64::from(item.quantity))
            .context("writing quantity")?;
        sheet
            .write_number(row, 6, item.final_usd_finished)
            .context("writing finished USD")?;
        sheet
            .write_number(row, 7, item.final_rmb_finished)
            .context("writing finished RMB")?;

        for (col, value) in [(8u16, item.final_usd_bulk), (9u16, item.final_rmb_bulk)] {
            if let Some(price) = value.filter(|p| *p != 0.0) {
                sheet.write_number(row, col, price).context("writing bulk price")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
    use std::io::Cursor;

    fn item(product: &str, bulk: Option<f64>) -> QuotationItem {
        QuotationItem {
            product: product.to_string(),
            specimen: "0-1mm".to_string(),
            format: "25kg/bag".to_string(),
            pack: "25kg/bag".to_string(),
            quantity: 3,
            final_usd_finished: 9.02,
            final_rmb_finished: 72.3695,
            final_usd_bulk: bulk,
            final_rmb_bulk: bulk.map(|b| b * 7.1 * 1.13),
        }
    }

    fn quotation() -> Quotation {
        Quotation {
            quotation_number: "QT-1700000000000".to_string(),
            customer_name: "Foundry Co.".to_string(),
            items: vec![item("Fused Silica", Some(6.93)), item("Zircon Flour", None)],
        }
    }

    fn read_back(bytes: Vec<u8>) -> calamine::Range<Data> {
        let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes)).expect("open xlsx");
        workbook.worksheet_range(SHEET_NAME).expect("quotation sheet")
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    #[test]
    fn workbook_layout() {
        let bytes = write_quotation_xlsx(&quotation(), date()).unwrap();
        let range = read_back(bytes);

        assert_eq!(range.get_value((0, 0)), Some(&Data::String(TITLE.into())));
        assert_eq!(
            range.get_value((2, 1)),
            Some(&Data::String("QT-1700000000000".into()))
        );
        assert_eq!(range.get_value((3, 1)), Some(&Data::String("Foundry Co.".into())));
        assert_eq!(range.get_value((4, 1)), Some(&Data::String("2026-03-01".into())));
        for (col, header) in ITEM_HEADERS.iter().enumerate() {
            assert_eq!(
                range.get_value((HEADER_ROW, col as u32)),
                Some(&Data::String(header.to_string()))
            );
        }
        assert_eq!(range.get_value((7, 0)), Some(&Data::Float(1.0)));
        assert_eq!(range.get_value((7, 1)), Some(&Data::String("Fused Silica".into())));
        assert_eq!(range.get_value((7, 5)), Some(&Data::Float(3.0)));
        assert_eq!(range.get_value((7, 8)), Some(&Data::Float(6.93)));
        assert_eq!(range.get_value((8, 0)), Some(&Data::Float(2.0)));
    }

    #[test]
    fn bulk_cells_blank_without_bulk_price() {
        let range = read_back(write_quotation_xlsx(&quotation(), date()).unwrap());
        assert!(matches!(range.get_value((8, 8)), None | Some(Data::Empty)));
        assert!(matches!(range.get_value((8, 9)), None | Some(Data::Empty)));
    }

    #[test]
    fn empty_quotation_still_renders_header() {
        let empty = Quotation {
            items: vec![],
            ..quotation()
        };
        let range = read_back(write_quotation_xlsx(&empty, date()).unwrap());
        assert_eq!(
            range.get_value((HEADER_ROW, 9)),
            Some(&Data::String("Bulk RMB".into()))
        );
    }

    #[test]
    fn saves_to_path_with_safe_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(export_file_name(&quotation()));
        save_quotation_xlsx(&quotation(), date(), &path).unwrap();
        assert!(path.ends_with("quotation_QT-1700000000000.xlsx"));
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        let odd = Quotation {
            quotation_number: "QT/1 2".into(),
            ..quotation()
        };
        assert_eq!(export_file_name(&odd), "quotation_QT_1_2.xlsx");
    }
}
