use crate::Result;
use anyhow::Context;

/// Find a named column in a CSV header row.
pub(crate) fn header_index(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .with_context(|| format!("file has no \"{}\" column", name))
}

/// Render an optional value for CSV output; missing becomes an empty field.
pub(crate) fn csv_opt(value: Option<impl ToString>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Print an underlined section heading to stdout.
pub fn header(title: &str) {
    println!("\n{}", title);
    println!("{}\n", "=".repeat(title.len()));
}
