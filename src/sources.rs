//! Loaders for the static rule tables: flat files and SQLite queries.

use crate::config::RuleSource;
use crate::rate_limiter::UserLimit;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("query `{query}` against {database} failed: {source}")]
    Sql {
        database: PathBuf,
        query: String,
        source: rusqlite::Error,
    },
}

/// How the entries of a list file are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    /// One address per line.
    Lines,
    /// Every whitespace-separated field is an entry (virtusertable style).
    Fields,
}

pub fn load_set(source: &RuleSource, format: ListFormat) -> Result<HashSet<String>, LoadError> {
    match source {
        RuleSource::File { path } => {
            let content = read_file(path)?;
            Ok(parse_set(&content, format))
        }
        RuleSource::Sql { database, query } => {
            let rows = query_rows(database, query)?;
            Ok(rows
                .into_iter()
                .filter_map(|row| row.into_iter().next().and_then(text_value))
                .map(|entry| entry.trim().to_lowercase())
                .filter(|entry| !entry.is_empty())
                .collect())
        }
    }
}

pub fn load_limits(
    source: &RuleSource,
    default_duration: u64,
) -> Result<HashMap<String, UserLimit>, LoadError> {
    match source {
        RuleSource::File { path } => {
            let content = read_file(path)?;
            Ok(parse_limits(&content, default_duration))
        }
        RuleSource::Sql { database, query } => {
            let rows = query_rows(database, query)?;
            let mut limits = HashMap::new();
            for row in rows {
                let mut columns = row.into_iter();
                let identity = match columns.next().and_then(text_value) {
                    Some(identity) => identity.trim().to_lowercase(),
                    None => continue,
                };
                let limit = match columns.next().and_then(integer_value) {
                    Some(limit) => limit,
                    None => {
                        log::warn!("Skipping limit row for {identity}: no usable limit");
                        continue;
                    }
                };
                let duration_seconds = columns
                    .next()
                    .and_then(integer_value)
                    .unwrap_or(default_duration);
                limits.insert(
                    identity,
                    UserLimit {
                        limit,
                        duration_seconds,
                    },
                );
            }
            Ok(limits)
        }
    }
}

fn read_file(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn meaningful_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

pub fn parse_set(content: &str, format: ListFormat) -> HashSet<String> {
    let mut entries = HashSet::new();
    for line in meaningful_lines(content) {
        let line = line.to_lowercase();
        match format {
            ListFormat::Lines => {
                entries.insert(line);
            }
            ListFormat::Fields => {
                entries.extend(line.split_whitespace().map(str::to_string));
            }
        }
    }
    entries
}

/// Parses `<identity> <limit> <duration>` lines.
pub fn parse_limits(content: &str, default_duration: u64) -> HashMap<String, UserLimit> {
    let mut limits = HashMap::new();
    for line in meaningful_lines(content) {
        let line = line.to_lowercase();
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            continue;
        }

        let limit = match fields[1].parse::<u64>() {
            Ok(limit) => limit,
            Err(_) => {
                log::warn!("Skipping limit for {}: bad limit {:?}", fields[0], fields[1]);
                continue;
            }
        };
        let duration_seconds = fields[2].parse::<u64>().unwrap_or(default_duration);

        limits.insert(
            fields[0].to_string(),
            UserLimit {
                limit,
                duration_seconds,
            },
        );
    }
    limits
}

fn query_rows(database: &Path, query: &str) -> Result<Vec<Vec<Value>>, LoadError> {
    let sql_error = |source| LoadError::Sql {
        database: database.to_path_buf(),
        query: query.to_string(),
        source,
    };

    let conn = Connection::open_with_flags(database, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(sql_error)?;
    let mut stmt = conn.prepare(query).map_err(sql_error)?;
    let column_count = stmt.column_count();

    let rows = stmt
        .query_map([], |row| {
            (0..column_count)
                .map(|i| row.get::<_, Value>(i))
                .collect::<Result<Vec<_>, _>>()
        })
        .map_err(sql_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_error)?;

    Ok(rows)
}

fn text_value(value: Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn integer_value(value: Value) -> Option<u64> {
    match value {
        Value::Integer(i) => u64::try_from(i).ok(),
        Value::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}
