use std::fmt::Write as _;
use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One JSON document per line.
pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_table(header: &[&str], rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    for row in rows {
        table.add_row(row);
    }
    println!("{table}");
}

/// Lowercase hex, truncated past `limit` bytes.
pub fn hex_preview(data: &[u8], limit: usize) -> String {
    let mut out = String::with_capacity(data.len().min(limit) * 2 + 4);
    for byte in data.iter().take(limit) {
        let _ = write!(out, "{byte:02x}");
    }
    if data.len() > limit {
        let _ = write!(out, "..(+{})", data.len() - limit);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_preview_truncates() {
        assert_eq!(hex_preview(&[], 4), "");
        assert_eq!(hex_preview(&[0x0a, 0xff], 4), "0aff");
        assert_eq!(hex_preview(&[1, 2, 3, 4, 5, 6], 4), "01020304..(+2)");
    }
}
