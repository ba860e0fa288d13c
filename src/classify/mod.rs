//! Structured error classification.
//!
//! Turns raw stderr from a failed sandbox run into a `ParsedError`:
//! error type and message, traceback frames, the source context around the
//! failing line, a category from a static lookup table with
//! keyword-heuristic overrides, and ranked remediation suggestions.
//! `validate_syntax` is callable standalone so the orchestrator can
//! short-circuit before ever touching the sandbox.

mod undefined;

pub use undefined::find_undefined_names;

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// Traceback frames look like: File "workflow.py", line 42, in main
static FRAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)(?:, in (.+))?"#).unwrap());

// Word-boundary matching: `token` must hit "Invalid token" but not the
// identifier `slak_token` inside a NameError message.
static AUTH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(401|403|unauthorized|forbidden|invalid_auth|token|credentials?)\b")
        .unwrap()
});

static RATE_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|\brate[ _-]?limit|\btoo many requests\b|\bthrottl").unwrap()
});

/// Failure taxonomy used across classification, debugging, and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Syntax,
    Import,
    Logic,
    SchemaMismatch,
    Auth,
    RateLimit,
    Network,
    MissingParam,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Import => "import",
            Self::Logic => "logic",
            Self::SchemaMismatch => "schema_mismatch",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::MissingParam => "missing_param",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "syntax" => Ok(Self::Syntax),
            "import" => Ok(Self::Import),
            "logic" => Ok(Self::Logic),
            "schema_mismatch" => Ok(Self::SchemaMismatch),
            "auth" => Ok(Self::Auth),
            "rate_limit" => Ok(Self::RateLimit),
            "network" => Ok(Self::Network),
            "missing_param" => Ok(Self::MissingParam),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid error category: {}", s)),
        }
    }
}

/// One frame of a parsed traceback, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackFrame {
    pub file: String,
    pub line: usize,
    pub function: String,
}

/// Structured classification of a failure. Derived deterministically from
/// (stderr, source); never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedError {
    pub error_type: String,
    pub message: String,
    pub line_number: Option<usize>,
    pub code_context: String,
    pub frames: Vec<TracebackFrame>,
    pub category: ErrorCategory,
    pub suggestions: Vec<String>,
}

impl Default for ParsedError {
    fn default() -> Self {
        Self {
            error_type: String::new(),
            message: String::new(),
            line_number: None,
            code_context: String::new(),
            frames: Vec::new(),
            category: ErrorCategory::Unknown,
            suggestions: Vec::new(),
        }
    }
}

/// Map a raw error type name to a category via the static table.
fn table_category(error_type: &str) -> Option<ErrorCategory> {
    match error_type {
        "ModuleNotFoundError" | "ImportError" => Some(ErrorCategory::Import),
        "SyntaxError" | "IndentationError" | "TabError" => Some(ErrorCategory::Syntax),
        "NameError" | "AttributeError" | "TypeError" | "ValueError" | "IndexError" => {
            Some(ErrorCategory::Logic)
        }
        "KeyError" | "JSONDecodeError" | "json.decoder.JSONDecodeError" => {
            Some(ErrorCategory::SchemaMismatch)
        }
        "ConnectionError" | "TimeoutError" | "httpx.ConnectError" | "httpx.ReadTimeout"
        | "aiohttp.ClientError" | "ssl.SSLError" => Some(ErrorCategory::Network),
        "PermissionError" => Some(ErrorCategory::Auth),
        "FileNotFoundError" => Some(ErrorCategory::MissingParam),
        _ => None,
    }
}

/// Determine the category from the raw type and message. Keyword overrides
/// take precedence over the table: auth first, then rate-limit; an
/// unrecognized type defaults to a logic error.
pub fn categorize(error_type: &str, message: &str) -> ErrorCategory {
    if AUTH_PATTERN.is_match(message) {
        return ErrorCategory::Auth;
    }
    if RATE_LIMIT_PATTERN.is_match(message) {
        return ErrorCategory::RateLimit;
    }
    table_category(error_type).unwrap_or(ErrorCategory::Logic)
}

/// Parse stderr output into a structured `ParsedError`.
pub fn parse_error(stderr: &str, source: &str) -> ParsedError {
    if stderr.trim().is_empty() {
        return ParsedError {
            message: "No error output".to_string(),
            ..ParsedError::default()
        };
    }

    let mut error = ParsedError::default();

    // The final non-continuation line carries the actual error.
    let error_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("During handling"))
        .unwrap_or("");

    if let Some((ty, msg)) = error_line.split_once(": ") {
        error.error_type = ty.trim().to_string();
        error.message = msg.trim().to_string();
    } else {
        error.message = error_line.to_string();
    }

    for cap in FRAME_REGEX.captures_iter(stderr) {
        let line: usize = cap[2].parse().unwrap_or(0);
        error.frames.push(TracebackFrame {
            file: cap[1].to_string(),
            line,
            function: cap
                .get(3)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "<module>".to_string()),
        });
        // The deepest frame's line number is the primary location.
        error.line_number = Some(line);
    }

    if let Some(line) = error.line_number {
        error.code_context = context_window(source, line);
    }

    error.category = categorize(&error.error_type, &error.message);
    error.suggestions = suggest_fixes(&error);
    error
}

/// Slice a small context window around a 1-based line: two lines before,
/// one after, with the failing line marked.
fn context_window(source: &str, line_number: usize) -> String {
    if source.is_empty() || line_number == 0 {
        return String::new();
    }
    let lines: Vec<&str> = source.split('\n').collect();
    let start = line_number.saturating_sub(3);
    let end = (line_number + 1).min(lines.len());
    let mut out = Vec::new();
    for (i, text) in lines.iter().enumerate().take(end).skip(start) {
        let marker = if i + 1 == line_number { " >> " } else { "    " };
        out.push(format!("{}{}: {}", marker, i + 1, text));
    }
    out.join("\n")
}

/// Parse the candidate source as Python. Returns `None` only when the
/// parser itself cannot run; syntax errors still yield a tree.
pub(crate) fn parse_python(source: &str) -> Option<tree_sitter::Tree> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .ok()?;
    parser.parse(source, None)
}

/// Find the first error or missing node in a parse tree.
fn first_error_node<'a>(node: tree_sitter::Node<'a>) -> Option<tree_sitter::Node<'a>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = first_error_node(child) {
            return Some(found);
        }
    }
    None
}

/// Validate Python syntax. Returns `None` for valid source, or a
/// `ParsedError` with the failing line. Deterministic and idempotent; safe
/// to call before any sandbox invocation.
pub fn validate_syntax(source: &str) -> Option<ParsedError> {
    let tree = match parse_python(source) {
        Some(tree) => tree,
        None => {
            return Some(ParsedError {
                error_type: "SyntaxError".to_string(),
                message: "source could not be parsed".to_string(),
                category: ErrorCategory::Syntax,
                ..ParsedError::default()
            });
        }
    };

    if !tree.root_node().has_error() {
        return None;
    }

    let node = first_error_node(tree.root_node());
    let line_number = node.map(|n| n.start_position().row + 1);
    let message = match node {
        Some(n) if n.is_missing() => format!("expected '{}'", n.kind()),
        _ => "invalid syntax".to_string(),
    };

    let mut error = ParsedError {
        error_type: "SyntaxError".to_string(),
        message,
        line_number,
        category: ErrorCategory::Syntax,
        ..ParsedError::default()
    };
    if let Some(line) = line_number {
        error.code_context = context_window(source, line);
        error.suggestions.push(format!(
            "Syntax error at line {}: {}",
            line, error.message
        ));
    }
    error
        .suggestions
        .push("Check for mismatched brackets, missing colons, or invalid indentation".to_string());
    Some(error)
}

/// Ranked remediation hints per category.
fn suggest_fixes(error: &ParsedError) -> Vec<String> {
    let mut suggestions = Vec::new();
    match error.category {
        ErrorCategory::Import => {
            let module = error
                .message
                .split('\'')
                .nth(1)
                .unwrap_or(&error.message)
                .to_string();
            suggestions.push(format!("Install the missing module: pip install {}", module));
            suggestions.push("Check if the module name is spelled correctly".to_string());
        }
        ErrorCategory::Syntax => {
            suggestions
                .push("Check for mismatched parentheses, brackets, or quotes".to_string());
            suggestions.push("Verify indentation is consistent (spaces vs tabs)".to_string());
            if let Some(line) = error.line_number {
                suggestions.push(format!("Focus on line {} and the line before it", line));
            }
        }
        ErrorCategory::Auth => {
            suggestions.push("Verify the API token/key is correct and not expired".to_string());
            suggestions
                .push("Check the Authorization header format (Bearer vs Basic)".to_string());
            suggestions.push("Ensure the token has the required scopes/permissions".to_string());
        }
        ErrorCategory::SchemaMismatch => {
            suggestions
                .push("Check the API response format - it may have changed".to_string());
            suggestions
                .push("Verify the request body structure matches the API spec".to_string());
            suggestions
                .push("Add response validation and defensive access (dict.get())".to_string());
        }
        ErrorCategory::Network => {
            suggestions.push("Verify the API URL is correct and reachable".to_string());
            suggestions.push("Add retry logic with exponential backoff".to_string());
        }
        ErrorCategory::RateLimit => {
            suggestions.push("Add delays between API calls (asyncio.sleep)".to_string());
            suggestions.push("Implement exponential backoff retry logic".to_string());
            suggestions
                .push("Check API documentation for rate limit windows".to_string());
        }
        ErrorCategory::Logic => {
            suggestions.push("Check variable names for typos".to_string());
            suggestions
                .push("Verify function arguments match the expected signature".to_string());
        }
        ErrorCategory::MissingParam => {
            suggestions.push("Verify all required parameters are provided".to_string());
            suggestions.push("Check file paths and environment variables".to_string());
        }
        ErrorCategory::Unknown => {}
    }
    suggestions
}
