use colored::*;
use prettytable::{color, format, Attr, Cell, Row, Table};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::registry::{AllocKind, AllocationRecord};
use crate::site::Untracked;

/// One live allocation as seen by a report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Leak {
    #[serde(with = "serde_address")]
    pub address: usize,
    pub size: usize,
    pub align: usize,
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub kind: AllocKind,
}

impl Leak {
    pub(crate) fn new(address: usize, record: &AllocationRecord) -> Self {
        Self {
            address,
            size: record.size,
            align: record.align,
            file: record.site.file.to_string(),
            line: record.site.line,
            label: record.site.label.map(str::to_string),
            kind: record.kind,
        }
    }

    pub fn location(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }
}

/// Point-in-time copy of the registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct LeakReport {
    pub leak_count: usize,
    pub total_bytes: usize,
    pub leaks: Vec<Leak>,
}

impl LeakReport {
    pub fn new(leaks: Vec<Leak>) -> Self {
        Self {
            leak_count: leaks.len(),
            total_bytes: leaks.iter().map(|leak| leak.size).sum(),
            leaks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Leaks whose call site is in `file`.
    pub fn from_file<'a>(&'a self, file: &'a str) -> impl Iterator<Item = &'a Leak> + 'a {
        self.leaks.iter().filter(move |leak| leak.file == file)
    }
}

mod serde_address {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(address: &usize, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#x}", address))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<usize, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(&raw);
        usize::from_str_radix(digits, 16).map_err(de::Error::custom)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log(THRESHOLD).floor() as usize).min(UNITS.len() - 1);
    let unit_value = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", unit_value, UNITS[unit_index])
    }
}

/// Writes a tracker diagnostic to stderr.
pub(crate) fn warn(args: fmt::Arguments<'_>) {
    let _untracked = Untracked::enter();
    eprintln!(
        "{} {} {}",
        "[memtrack]".blue().bold(),
        "warning:".yellow().bold(),
        args
    );
}

/// Trait for implementing custom leak report output.
///
/// Implement this trait to send reports somewhere other than stdout, e.g. a
/// log pipeline or a file picked up by CI.
///
/// # Examples
///
/// ```rust
/// use memtrack::{LeakReport, Reporter};
/// use std::error::Error;
///
/// struct CountOnly;
///
/// impl Reporter for CountOnly {
///     fn report(&self, report: &LeakReport) -> Result<(), Box<dyn Error>> {
///         println!("{} live allocations", report.leak_count);
///         Ok(())
///     }
/// }
///
/// memtrack::report_with(&CountOnly).unwrap();
/// ```
pub trait Reporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>>;
}

/// Built-in report layouts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    #[default]
    Text,
    Table,
    Json,
    JsonPretty,
}

impl Format {
    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            Format::Text => 0,
            Format::Table => 1,
            Format::Json => 2,
            Format::JsonPretty => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Format::Table,
            2 => Format::Json,
            3 => Format::JsonPretty,
            _ => Format::Text,
        }
    }

    pub fn reporter(self) -> Box<dyn Reporter> {
        match self {
            Format::Text => Box::new(TextReporter),
            Format::Table => Box::new(TableReporter),
            Format::Json => Box::new(JsonReporter),
            Format::JsonPretty => Box::new(JsonPrettyReporter),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFormatError(String);

impl fmt::Display for ParseFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown report format `{}` (expected `text`, `table`, `json` or `json-pretty`)",
            self.0
        )
    }
}

impl std::error::Error for ParseFormatError {}

impl FromStr for Format {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Format::Text),
            "table" => Ok(Format::Table),
            "json" => Ok(Format::Json),
            "json-pretty" | "json_pretty" | "pretty" => Ok(Format::JsonPretty),
            _ => Err(ParseFormatError(s.to_string())),
        }
    }
}

fn use_colors() -> bool {
    std::env::var("NO_COLOR").is_err()
}

fn no_leaks_message() -> String {
    format!(
        "{} {}",
        "[memtrack]".blue().bold(),
        ">>> No memory leaks detected. <<<".green().bold()
    )
}

fn leaks_header(report: &LeakReport) -> String {
    format!(
        "{} {} ({} allocations, {})",
        "[memtrack]".blue().bold(),
        ">>> Memory leaks detected <<<".red().bold(),
        report.leak_count,
        format_bytes(report.total_bytes as u64)
    )
}

/// One line per live allocation, in the order the snapshot holds them.
pub fn render_text(report: &LeakReport) -> String {
    if report.is_empty() {
        return no_leaks_message();
    }

    let mut out = leaks_header(report);
    for leak in &report.leaks {
        out.push_str(&format!(
            "\n\t- Leak at address {:#x} of size {} bytes. Allocated at {}",
            leak.address,
            leak.size,
            leak.location().yellow()
        ));
        if let Some(label) = &leak.label {
            out.push_str(&format!(" in {}", label.cyan()));
        }
        if leak.kind == AllocKind::Array {
            out.push_str(" [array]");
        }
    }
    out
}

pub fn render_table(report: &LeakReport) -> Table {
    let use_colors = use_colors();

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);

    let header_cells: Vec<Cell> = ["Address", "Size", "Kind", "Location", "Label"]
        .into_iter()
        .map(|header| {
            if use_colors {
                Cell::new(header)
                    .with_style(Attr::Bold)
                    .with_style(Attr::ForegroundColor(color::CYAN))
            } else {
                Cell::new(header).with_style(Attr::Bold)
            }
        })
        .collect();
    table.set_titles(Row::new(header_cells));

    for leak in &report.leaks {
        table.add_row(Row::new(vec![
            Cell::new(&format!("{:#x}", leak.address)),
            Cell::new(&format_bytes(leak.size as u64)),
            Cell::new(leak.kind.as_str()),
            Cell::new(&leak.location()),
            Cell::new(leak.label.as_deref().unwrap_or("-")),
        ]));
    }

    table
}

pub struct TextReporter;

impl Reporter for TextReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("\n{}", render_text(report));
        Ok(())
    }
}

pub struct TableReporter;

impl Reporter for TableReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        if report.is_empty() {
            println!("\n{}", no_leaks_message());
            return Ok(());
        }

        println!("\n{}", leaks_header(report));
        render_table(report).printstd();
        Ok(())
    }
}

pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string(report)?);
        Ok(())
    }
}

pub struct JsonPrettyReporter;

impl Reporter for JsonPrettyReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }
}
