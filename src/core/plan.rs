/*
 * Rename plans: one entry per layer saying what it should be called and where it
 * belongs. Entries either come from the classification pipeline (addressing layers
 * by id) or from an editable CSV file (addressing top-level layers by index).
 *
 * The CSV dialect is the one spreadsheet tools produce: a header row, comma
 * separated fields, optional double quotes around fields that contain commas
 * (with `""` for a literal quote), and possibly a UTF-8 byte-order mark.
 */
use super::layer_tree::LayerId;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const PLAN_HEADER: &str = "index,new_name,category,visual_tier";
const MIN_FIELDS: usize = 3;
const BOM: char = '\u{feff}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanTarget {
    /// Position among the document's top-level layers, as the plan was written.
    Index(i64),
    Node(LayerId),
    /// The index column could not be read as a number.
    Unparsed(String),
}

impl std::fmt::Display for PlanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanTarget::Index(index) => write!(f, "index {index}"),
            PlanTarget::Node(id) => write!(f, "layer {id}"),
            PlanTarget::Unparsed(text) => write!(f, "index '{text}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePlanEntry {
    pub target: PlanTarget,
    pub new_name: String,
    pub category: Option<String>,
    pub visual_tier: Option<String>,
}

impl RenamePlanEntry {
    pub fn new(target: PlanTarget, new_name: &str, category: Option<&str>, visual_tier: Option<&str>) -> Self {
        let non_empty = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        RenamePlanEntry {
            target,
            new_name: new_name.to_string(),
            category: non_empty(category),
            visual_tier: non_empty(visual_tier),
        }
    }
}

#[derive(Debug)]
pub enum PlanError {
    Io(io::Error),
    NotFound(PathBuf),
    Empty(PathBuf),
}

impl From<io::Error> for PlanError {
    fn from(err: io::Error) -> Self {
        PlanError::Io(err)
    }
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::Io(e) => write!(f, "Plan file I/O error: {e}"),
            PlanError::NotFound(path) => write!(f, "Plan file {path:?} does not exist"),
            PlanError::Empty(path) => write!(f, "Plan file {path:?} contains no usable rows"),
        }
    }
}

impl std::error::Error for PlanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlanError::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlanError>;

pub trait PlanSourceOperations: Send + Sync {
    fn load_plan(&self) -> Result<Vec<RenamePlanEntry>>;
}

pub struct CoreCsvPlanSource {
    path: PathBuf,
}

impl CoreCsvPlanSource {
    pub fn new(path: &Path) -> Self {
        CoreCsvPlanSource {
            path: path.to_path_buf(),
        }
    }
}

impl PlanSourceOperations for CoreCsvPlanSource {
    fn load_plan(&self) -> Result<Vec<RenamePlanEntry>> {
        if !self.path.exists() {
            return Err(PlanError::NotFound(self.path.clone()));
        }
        let content = fs::read_to_string(&self.path)?;
        let entries = parse_plan(&content);
        if entries.is_empty() {
            return Err(PlanError::Empty(self.path.clone()));
        }
        log::debug!("PlanSource: Read {} plan row(s) from {:?}", entries.len(), self.path);
        Ok(entries)
    }
}

/*
 * Splits one CSV line into fields. Quotes only have meaning at the start of a
 * field; inside a quoted field `""` is a literal quote and commas do not split.
 */
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.trim().is_empty() => {
                current.clear();
                in_quotes = true;
            }
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/*
 * Parses plan text. The first line is a header and is skipped; blank lines and
 * rows with fewer than three fields are ignored. Row order is preserved.
 */
pub fn parse_plan(content: &str) -> Vec<RenamePlanEntry> {
    let content = content.strip_prefix(BOM).unwrap_or(content);
    content
        .lines()
        .skip(1)
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = split_csv_line(line);
            if fields.len() < MIN_FIELDS {
                log::debug!("PlanSource: Ignoring short row '{line}'");
                return None;
            }
            let index_text = fields[0].trim();
            let target = match index_text.parse::<i64>() {
                Ok(index) => PlanTarget::Index(index),
                Err(_) => PlanTarget::Unparsed(index_text.to_string()),
            };
            Some(RenamePlanEntry::new(
                target,
                fields[1].trim(),
                Some(fields[2].as_str()),
                fields.get(3).map(String::as_str),
            ))
        })
        .collect()
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/*
 * Writes the entries that address a layer by index, header first. Entries
 * targeting layer ids have no stable textual form and are left out. Returns the
 * number of rows written.
 */
pub fn write_plan(writer: &mut impl Write, entries: &[RenamePlanEntry]) -> io::Result<usize> {
    writeln!(writer, "{PLAN_HEADER}")?;
    let mut written = 0;
    for entry in entries {
        let PlanTarget::Index(index) = entry.target else {
            continue;
        };
        writeln!(
            writer,
            "{index},{},{},{}",
            quote_field(&entry.new_name),
            quote_field(entry.category.as_deref().unwrap_or_default()),
            quote_field(entry.visual_tier.as_deref().unwrap_or_default())
        )?;
        written += 1;
    }
    Ok(written)
}

/*
 * Writes a plan file that `parse_plan` reads back.
 *
 * Args:
 *     path: Destination file, replaced if it exists.
 *     entries: Entries to write; only index targets are kept.
 *
 * Returns:
 *     The number of rows written, or an error if the file cannot be written.
 */
pub fn write_plan_csv(path: &Path, entries: &[RenamePlanEntry]) -> Result<usize> {
    let mut buffer = Vec::new();
    let written = write_plan(&mut buffer, entries)?;
    fs::write(path, buffer)?;
    log::info!("PlanSource: Wrote {written} plan row(s) to {path:?}");
    Ok(written)
}
