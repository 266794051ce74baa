//! Splits an annotated SQL migration file into Up and Down statements.
//!
//! The file is read line by line. Annotation lines start with `--` followed by one of:
//!
//! ```text
//! -- +goose Up
//! -- +goose Down
//! -- +goose StatementBegin
//! -- +goose StatementEnd
//! -- +goose NO TRANSACTION
//! ```
//!
//! Outside a `StatementBegin`/`StatementEnd` block a statement ends on a line whose last
//! word before any `--` comment ends with `;`. Inside a block, semicolons are ignored and
//! the whole block becomes one statement.

use crate::error::Error;
use crate::result::Direction;

/// The statements of one SQL migration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSql {
    pub up: Vec<String>,
    pub down: Vec<String>,
    /// False when the file carries `-- +goose NO TRANSACTION`.
    pub use_tx: bool,
}

impl ParsedSql {
    pub fn statements(&self, direction: Direction) -> &[String] {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Up,
    BeginUp,
    EndUp,
    Down,
    BeginDown,
    EndDown,
}

impl State {
    fn direction(self) -> Option<Direction> {
        match self {
            State::Start => None,
            State::Up | State::BeginUp | State::EndUp => Some(Direction::Up),
            State::Down | State::BeginDown | State::EndDown => Some(Direction::Down),
        }
    }

    fn in_block(self) -> bool {
        matches!(self, State::BeginUp | State::BeginDown)
    }
}

enum Annotation {
    Up,
    Down,
    StatementBegin,
    StatementEnd,
    NoTransaction,
}

/// Returns `Some` for annotation lines, `None` for any other line.
fn annotation(line: &str) -> Option<Result<Annotation, String>> {
    let cmd = line.strip_prefix("--")?.trim();
    let rest = cmd.strip_prefix("+goose")?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(match rest.trim() {
        "Up" => Ok(Annotation::Up),
        "Down" => Ok(Annotation::Down),
        "StatementBegin" => Ok(Annotation::StatementBegin),
        "StatementEnd" => Ok(Annotation::StatementEnd),
        "NO TRANSACTION" => Ok(Annotation::NoTransaction),
        other => Err(format!("unknown annotation '-- +goose {}'", other)),
    })
}

/// True when the last word before any `--` comment ends with a semicolon.
pub fn ends_with_semicolon(line: &str) -> bool {
    let mut prev = "";
    for word in line.split_whitespace() {
        if word.starts_with("--") {
            break;
        }
        prev = word;
    }
    prev.ends_with(';')
}

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with("--")
}

/// Parses both directions of `text` in a single pass. `path` is only used in errors.
pub fn parse_sql(path: &str, text: &str) -> Result<ParsedSql, Error> {
    let fail = |line_no: usize, message: String| Error::SqlParse {
        path: path.to_string(),
        message: format!("line {}: {}", line_no, message),
    };

    let mut parsed = ParsedSql {
        use_tx: true,
        ..ParsedSql::default()
    };
    let mut state = State::Start;
    let mut buf = String::new();

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;

        if let Some(found) = annotation(line) {
            match found.map_err(|msg| fail(line_no, msg))? {
                Annotation::Up => {
                    if state != State::Start {
                        return Err(fail(line_no, "duplicate '-- +goose Up' annotation".into()));
                    }
                    state = State::Up;
                    continue;
                }
                Annotation::Down => {
                    if !matches!(state, State::Up | State::EndUp) {
                        return Err(fail(
                            line_no,
                            "'-- +goose Down' must follow a single '-- +goose Up' section".into(),
                        ));
                    }
                    if !buf.trim().is_empty() {
                        return Err(fail(
                            line_no,
                            format!("unfinished SQL statement before Down: {:?}: missing semicolon?", buf.trim()),
                        ));
                    }
                    buf.clear();
                    state = State::Down;
                    continue;
                }
                Annotation::StatementBegin => {
                    state = match state {
                        State::Up | State::EndUp => State::BeginUp,
                        State::Down | State::EndDown => State::BeginDown,
                        _ => {
                            return Err(fail(
                                line_no,
                                "'-- +goose StatementBegin' must be inside an Up or Down section"
                                    .into(),
                            ))
                        }
                    };
                    continue;
                }
                Annotation::StatementEnd => {
                    state = match state {
                        State::BeginUp => State::EndUp,
                        State::BeginDown => State::EndDown,
                        _ => {
                            return Err(fail(
                                line_no,
                                "'-- +goose StatementEnd' must follow '-- +goose StatementBegin'"
                                    .into(),
                            ))
                        }
                    };
                    flush(&mut parsed, state, &mut buf);
                    continue;
                }
                Annotation::NoTransaction => {
                    parsed.use_tx = false;
                    continue;
                }
            }
        }

        // Leading comments and blank lines before a statement are dropped.
        if buf.is_empty() && is_comment_or_blank(line) {
            continue;
        }

        if state == State::Start {
            return Err(fail(
                line_no,
                "no '-- +goose Up' annotation found before SQL".into(),
            ));
        }

        buf.push_str(line);
        buf.push('\n');

        if !state.in_block() && ends_with_semicolon(line) {
            flush(&mut parsed, state, &mut buf);
        }
    }

    if state.in_block() {
        #[cfg(feature = "tracing")]
        tracing::warn!(path, "Reached end of file inside '-- +goose StatementBegin' block; flushing it as a statement");
        flush(&mut parsed, state, &mut buf);
    }

    if state == State::Start && !text.trim().is_empty() {
        return Err(Error::SqlParse {
            path: path.to_string(),
            message: "no '-- +goose Up' annotation found".to_string(),
        });
    }

    if !buf.trim().is_empty() {
        return Err(Error::SqlParse {
            path: path.to_string(),
            message: format!(
                "unfinished SQL statement at end of file: {:?}: missing semicolon?",
                buf.trim()
            ),
        });
    }

    Ok(parsed)
}

/// Parses `text` and returns the statements of one direction plus the transaction mode.
pub fn parse(path: &str, text: &str, direction: Direction) -> Result<(Vec<String>, bool), Error> {
    let parsed = parse_sql(path, text)?;
    let use_tx = parsed.use_tx;
    let statements = match direction {
        Direction::Up => parsed.up,
        Direction::Down => parsed.down,
    };
    Ok((statements, use_tx))
}

fn flush(parsed: &mut ParsedSql, state: State, buf: &mut String) {
    let statement = buf.trim();
    if !statement.is_empty() {
        match state.direction() {
            Some(Direction::Up) => parsed.up.push(statement.to_string()),
            Some(Direction::Down) => parsed.down.push(statement.to_string()),
            None => {}
        }
    }
    buf.clear();
}
