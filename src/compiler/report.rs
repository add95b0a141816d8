//! Elm `--report=json` decoding and plain-text rendering.
//!
//! Two report kinds exist:
//!
//! ```text
//! {"type": "compile-errors", "errors": [{"path", "name", "problems": [...]}]}
//! {"type": "error", "path": "elm.json" | null, "title", "message": [...]}
//! ```
//!
//! Messages are arrays of plain strings and styled chunks.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Report {
    CompileErrors { errors: Vec<ModuleErrors> },
    Error {
        path: Option<String>,
        title: String,
        message: Vec<MessageChunk>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleErrors {
    pub path: String,
    pub problems: Vec<Problem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Problem {
    pub title: String,
    pub region: Region,
    pub message: Vec<MessageChunk>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Region {
    pub start: Position,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageChunk {
    Plain(String),
    /// Styling (bold, underline, color) is dropped when rendering.
    Styled { string: String },
}

impl MessageChunk {
    fn text(&self) -> &str {
        match self {
            Self::Plain(s) | Self::Styled { string: s } => s,
        }
    }
}

impl Report {
    /// Decode a report from compiler stderr, `None` if it is not one.
    pub fn parse(stderr: &str) -> Option<Self> {
        serde_json::from_str(stderr.trim()).ok()
    }

    /// Render the report the way the compiler prints it, without colors.
    pub fn render(&self) -> String {
        match self {
            Self::CompileErrors { errors } => errors
                .iter()
                .flat_map(|module| {
                    module.problems.iter().map(move |problem| {
                        let location = format!(
                            "{}:{}:{}",
                            module.path, problem.region.start.line, problem.region.start.column
                        );
                        render_block(&problem.title, Some(&location), &problem.message)
                    })
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
            Self::Error {
                path,
                title,
                message,
            } => render_block(title, path.as_deref(), message),
        }
    }

    /// Number of problems, for status summaries.
    pub fn problem_count(&self) -> usize {
        match self {
            Self::CompileErrors { errors } => errors.iter().map(|e| e.problems.len()).sum(),
            Self::Error { .. } => 1,
        }
    }
}

fn render_block(title: &str, location: Option<&str>, message: &[MessageChunk]) -> String {
    let header = match location {
        Some(location) => format!("-- {title} {} {location}", "-".repeat(8)),
        None => format!("-- {title} {}", "-".repeat(8)),
    };
    let body: String = message.iter().map(MessageChunk::text).collect();
    format!("{header}\n\n{}", body.trim_end())
}
