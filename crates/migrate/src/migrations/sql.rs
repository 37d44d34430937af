//! SQL script helpers: section parsing, statement splitting, and templates
//! for migrations written as plain SQL.

use chrono::Utc;
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::definitions::MigrationId;

/// The `-- Up` and `-- Down` parts of a migration script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSections {
    pub up: String,
    pub down: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

fn section_marker(line: &str) -> Option<Section> {
    let body = line.trim().strip_prefix("--")?.trim().to_lowercase();
    match body.as_str() {
        "up" | "up migration" | "migrate up" => Some(Section::Up),
        "down" | "down migration" | "migrate down" => Some(Section::Down),
        _ => None,
    }
}

/// Split a migration script into its up and down sections.
///
/// Comment-only lines are dropped; anything before the first marker is
/// treated as a header.
pub fn parse_sections(content: &str) -> ScriptSections {
    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut current = Section::Preamble;

    for line in content.lines() {
        if let Some(section) = section_marker(line) {
            current = section;
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }

        match current {
            Section::Up => up.push(line),
            Section::Down => down.push(line),
            Section::Preamble => {}
        }
    }

    let down = down.join("\n").trim().to_string();
    ScriptSections {
        up: up.join("\n").trim().to_string(),
        down: if down.is_empty() { None } else { Some(down) },
    }
}

/// Split a SQL script into individual statements.
///
/// Semicolons inside string literals, quoted identifiers, and comments do
/// not terminate a statement. Trailing semicolons are stripped and
/// comment-only fragments are dropped.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let dialect = GenericDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).with_unescape(false).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::warn!(
                target: "keel::migrate",
                error = %e,
                "SQL tokenizing failed, using naive semicolon splitting"
            );
            return sql
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    };

    let mut statements = Vec::new();
    let mut current = String::new();

    for token in tokens {
        match token {
            Token::SemiColon => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            Token::Whitespace(_) if current.is_empty() => {}
            Token::EOF => {}
            other => current.push_str(&other.to_string()),
        }
    }

    let tail = current.trim();
    if !tail.is_empty() && !is_comment_only(tail) {
        statements.push(tail.to_string());
    }

    statements
}

fn is_comment_only(fragment: &str) -> bool {
    fragment.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with("--")
    }) || (fragment.starts_with("/*") && fragment.ends_with("*/"))
}

/// Whether `name` is safe to interpolate as an unquoted SQL identifier
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Normalize a free-form migration name to `snake_case`
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// A fresh migration identifier from the current time in milliseconds
pub fn next_migration_id() -> MigrationId {
    MigrationId::new(Utc::now().timestamp_millis())
}

/// File name for a SQL migration script
pub fn migration_file_name(id: MigrationId, name: &str) -> String {
    format!("{}_{}.sql", id, normalize_name(name))
}

/// Create migration template content
pub fn migration_template(id: MigrationId, name: &str) -> String {
    format!(
        "-- Migration: {}\n\
         -- ID: {}\n\
         -- Created: {}\n\n\
         -- Up\n\
         -- Add your schema changes here\n\n\n\
         -- Down\n\
         -- Add rollback statements here\n\n",
        name,
        id,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}
