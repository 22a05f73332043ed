use anyhow::Result;
use pgshard_core::ShardId;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

const SHARD_HINT: &str = "pgshard_shard";

pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    let dialect = PostgreSqlDialect {};
    let statements = Parser::parse_sql(&dialect, sql)?;
    Ok(statements)
}

/// Split a query string on top-level semicolons, skipping quoted text,
/// comments and dollar-quoted bodies. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 1;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                if let Some(tag_len) = dollar_tag(&bytes[i..]) {
                    let tag = &bytes[i..i + tag_len];
                    i += tag_len;
                    while i < bytes.len() && !bytes[i..].starts_with(tag) {
                        i += 1;
                    }
                    i += tag_len.saturating_sub(1);
                }
            }
            b';' => {
                push_statement(&mut out, &sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < sql.len() {
        push_statement(&mut out, &sql[start..]);
    }
    out
}

fn push_statement<'a>(out: &mut Vec<&'a str>, part: &'a str) {
    if !strip_comments(part).trim().is_empty() {
        out.push(part.trim());
    }
}

/// Length of a `$tag$` opener at the start of `bytes`, if it is one.
fn dollar_tag(bytes: &[u8]) -> Option<usize> {
    let end = bytes[1..].iter().position(|b| *b == b'$')? + 1;
    let tag = &bytes[1..end];
    if tag.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_')
        && !tag.first().is_some_and(|b| b.is_ascii_digit())
    {
        Some(end + 1)
    } else {
        None
    }
}

/// Text with leading comments removed.
pub fn strip_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = match after.find('\n') {
                Some(pos) => after[pos + 1..].trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = match after.find("*/") {
                Some(pos) => after[pos + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

/// Shard forced by a leading `/* pgshard_shard: N */` comment.
pub fn shard_hint(sql: &str) -> Option<ShardId> {
    let mut rest = sql.trim_start();
    while let Some(after) = rest.strip_prefix("/*") {
        let end = after.find("*/")?;
        let body = after[..end].trim();
        if let Some(value) = body.strip_prefix(SHARD_HINT) {
            let value = value.trim_start().strip_prefix(':').unwrap_or(value);
            return value.trim().parse().ok();
        }
        rest = after[end + 2..].trim_start();
    }
    None
}

/// First keyword of a statement, uppercased.
pub fn first_keyword(sql: &str) -> String {
    strip_comments(sql)
        .trim_start_matches('(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}
