//! Leading-keyword statement classification.
//!
//! Statements are tokenized with [sqlparser](https://docs.rs/sqlparser/) using the
//! engine's dialect, so comments, string literals and quoted identifiers never
//! influence the result. This is a heuristic over the token stream, not a parse.
//! Input the tokenizer rejects (unterminated literals or identifiers) is refused,
//! since statement boundaries inside it cannot be located.

use crate::error::{DbError, DbResult};
use crate::models::DriverFamily;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::debug;

/// Broad statement category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, VALUES, TABLE, SHOW, DESCRIBE, EXPLAIN
    Query,
    /// INSERT, UPDATE, DELETE, MERGE, REPLACE
    Modification { returning: bool },
    /// CREATE, ALTER, DROP, TRUNCATE, RENAME, COMMENT
    Definition,
    /// BEGIN, START, COMMIT, ROLLBACK, SAVEPOINT, RELEASE
    Transaction,
    /// SET, USE, LOCK, UNLOCK, RESET, DISCARD, ATTACH, DETACH, PRAGMA assignments
    Session,
    /// Anything else (CALL, GRANT, VACUUM, ...), run as non-row-returning
    Other,
}

/// Result of classifying one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedStatement {
    pub kind: StatementKind,
    /// Uppercased leading keyword.
    pub keyword: String,
}

impl ClassifiedStatement {
    /// Whether the statement is executed as a row-returning query.
    pub fn returns_rows(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Query | StatementKind::Modification { returning: true }
        )
    }

    /// Whether running the statement changes session state that must not
    /// leak to the next borrower of the connection.
    pub fn alters_session(&self) -> bool {
        matches!(self.kind, StatementKind::Transaction | StatementKind::Session)
    }
}

/// Get the SQL dialect for a driver family.
fn get_dialect(family: DriverFamily) -> Box<dyn Dialect> {
    match family {
        DriverFamily::Postgres => Box::new(PostgreSqlDialect {}),
        DriverFamily::MySql => Box::new(MySqlDialect {}),
        DriverFamily::Sqlite => Box::new(SQLiteDialect {}),
    }
}

/// Classify a single statement.
///
/// Fails with a validation error for empty input and for input holding more
/// than one statement.
pub fn classify(sql: &str, family: DriverFamily) -> DbResult<ClassifiedStatement> {
    if sql.trim().is_empty() {
        return Err(DbError::validation("SQL statement is empty."));
    }

    let dialect = get_dialect(family);
    let tokens = match Tokenizer::new(dialect.as_ref(), sql).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(driver = %family, error = %e, "Tokenizer rejected statement");
            return Err(DbError::validation(format!(
                "SQL statement could not be tokenized: {}",
                e
            )));
        }
    };

    let tokens: Vec<Token> = tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();
    if tokens.iter().all(|t| matches!(t, Token::SemiColon)) {
        return Err(DbError::validation(
            "SQL statement contains no executable statement.",
        ));
    }

    let classified = classify_tokens(&tokens);
    reject_multiple_statements(&tokens, &classified)?;
    Ok(classified)
}

fn classify_tokens(tokens: &[Token]) -> ClassifiedStatement {
    let Some((start, keyword)) = leading_keyword(tokens) else {
        return ClassifiedStatement {
            kind: StatementKind::Other,
            keyword: String::new(),
        };
    };

    if keyword == "WITH" {
        // The statement after the CTE list decides
        return match statement_after_ctes(&tokens[start + 1..]) {
            Some((offset, inner)) => {
                let kind = kind_for(&inner, &tokens[start + 1 + offset..]);
                ClassifiedStatement {
                    kind,
                    keyword: inner,
                }
            }
            None => ClassifiedStatement {
                kind: StatementKind::Query,
                keyword,
            },
        };
    }

    let kind = kind_for(&keyword, &tokens[start..]);
    ClassifiedStatement { kind, keyword }
}

/// First unquoted word, skipping opening parentheses.
fn leading_keyword(tokens: &[Token]) -> Option<(usize, String)> {
    for (idx, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen => continue,
            Token::Word(w) if w.quote_style.is_none() => {
                return Some((idx, w.value.to_ascii_uppercase()));
            }
            _ => return None,
        }
    }
    None
}

/// First top-level statement keyword following a CTE list.
fn statement_after_ctes(tokens: &[Token]) -> Option<(usize, String)> {
    const STATEMENTS: &[&str] = &[
        "SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "VALUES", "TABLE", "REPLACE",
    ];

    let mut depth = 0i32;
    for (idx, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            Token::Word(w) if depth == 0 && w.quote_style.is_none() => {
                let upper = w.value.to_ascii_uppercase();
                if STATEMENTS.contains(&upper.as_str()) {
                    return Some((idx, upper));
                }
            }
            _ => {}
        }
    }
    None
}

fn kind_for(keyword: &str, statement: &[Token]) -> StatementKind {
    match keyword {
        "SELECT" | "VALUES" | "TABLE" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" => {
            StatementKind::Query
        }
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "REPLACE" | "UPSERT" => {
            StatementKind::Modification {
                returning: has_top_level_word(statement, "RETURNING"),
            }
        }
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT" => {
            StatementKind::Definition
        }
        "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "END" => {
            StatementKind::Transaction
        }
        "SET" | "USE" | "LOCK" | "UNLOCK" | "RESET" | "DISCARD" | "ATTACH" | "DETACH" => {
            StatementKind::Session
        }
        "PRAGMA" => {
            if has_top_level(statement, |t| matches!(t, Token::Eq)) {
                StatementKind::Session
            } else {
                StatementKind::Query
            }
        }
        _ => StatementKind::Other,
    }
}

fn has_top_level_word(tokens: &[Token], word: &str) -> bool {
    has_top_level(tokens, |t| {
        matches!(t, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(word))
    })
}

fn has_top_level(tokens: &[Token], pred: impl Fn(&Token) -> bool) -> bool {
    let mut depth = 0i32;
    for token in tokens {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            Token::SemiColon if depth == 0 => return false,
            t if depth == 0 && pred(t) => return true,
            _ => {}
        }
    }
    false
}

/// A top-level `;` followed by anything but more semicolons is a second statement.
///
/// Inside CREATE statements, BEGIN/CASE ... END blocks (trigger bodies) are
/// treated as nesting.
fn reject_multiple_statements(tokens: &[Token], classified: &ClassifiedStatement) -> DbResult<()> {
    let track_blocks = classified.kind == StatementKind::Definition;
    let mut depth = 0i32;
    let mut blocks = 0i32;
    let mut terminated = false;

    for token in tokens {
        if terminated {
            if matches!(token, Token::SemiColon) {
                continue;
            }
            return Err(DbError::validation(
                "Multiple statements are not supported. Send one statement per request.",
            ));
        }
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            Token::Word(w) if track_blocks && w.quote_style.is_none() => {
                if w.value.eq_ignore_ascii_case("BEGIN") || w.value.eq_ignore_ascii_case("CASE") {
                    blocks += 1;
                } else if w.value.eq_ignore_ascii_case("END") {
                    blocks -= 1;
                }
            }
            Token::SemiColon if depth <= 0 && blocks <= 0 => terminated = true,
            _ => {}
        }
    }
    Ok(())
}
