// Output formatting for CLI

use anyhow::Result;
use serde::Serialize;

#[derive(Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            "yaml" => OutputFormat::Yaml,
            _ => OutputFormat::Text,
        }
    }

    /// Print `value` in a structured format; text output is left to each command
    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        match self {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
            OutputFormat::Text => {}
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<14} {}", format!("{}:", label), value);
}

/// Print a table header
pub fn print_table_header(columns: &[(&str, usize)]) {
    let header: String = columns
        .iter()
        .map(|(name, width)| format!("{:<width$}", name, width = width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", header);
}

/// Print a table row, truncating cells wider than their column
pub fn print_table_row(values: &[(&str, usize)]) {
    let row: String = values
        .iter()
        .map(|(val, width)| {
            let s = if val.chars().count() > *width && *width > 3 {
                let kept: String = val.chars().take(width - 3).collect();
                format!("{kept}...")
            } else {
                val.to_string()
            };
            format!("{:<width$}", s, width = width)
        })
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", row);
}
