use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::ValidationError;
use crate::model::*;

/// How a statement names a provider: internal id or public slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRef {
    Id(Ulid),
    Slug(String),
}

/// What an `INSERT INTO bookings` row asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingTarget {
    /// Slot and holder token: confirm the caller's hold.
    Confirm { slot_id: Ulid, holder_token: String },
    /// Slot only: book it in one step.
    Direct { slot_id: Ulid },
    /// No slot: contact-only booking for the provider to schedule.
    Manual { provider: ProviderRef, session_type: SessionType },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProvider {
        id: Option<Ulid>,
        slug: String,
        timezone: String,
    },
    /// One statement replaces the scope's whole pattern set.
    UpsertPatterns {
        provider_id: Ulid,
        session_type: SessionType,
        patterns: Vec<PatternDraft>,
    },
    DeletePatterns {
        provider_id: Ulid,
        session_type: SessionType,
    },
    InsertGenerationRun {
        provider_id: Ulid,
        session_type: SessionType,
    },
    InsertHold {
        slot_id: Ulid,
        holder_token: String,
        ttl_ms: Option<Ms>,
    },
    DeleteHold {
        slot_id: Ulid,
        holder_token: String,
    },
    InsertBooking {
        id: Option<Ulid>,
        target: BookingTarget,
        contact: ContactDetails,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectProviders {
        slug: Option<String>,
    },
    SelectPatterns {
        provider: ProviderRef,
        session_type: SessionType,
    },
    SelectAvailableDates {
        provider: ProviderRef,
        session_type: SessionType,
    },
    SelectAvailableTimes {
        provider: ProviderRef,
        session_type: SessionType,
        date: NaiveDate,
    },
    SelectSlots {
        provider: ProviderRef,
        session_type: SessionType,
        date: Option<NaiveDate>,
    },
    SelectBookings {
        provider: ProviderRef,
    },
    SelectStaleness {
        provider: ProviderRef,
        session_type: SessionType,
    },
    SelectGenerationWarnings {
        provider: ProviderRef,
        session_type: SessionType,
    },
    SelectSessionTypes,
}

// Column order when an INSERT omits its column list.
const PROVIDER_COLUMNS: &[&str] = &["id", "slug", "timezone"];
const PATTERN_COLUMNS: &[&str] = &[
    "id",
    "provider_id",
    "session_type",
    "day_of_week",
    "start_time",
    "end_time",
    "timezone",
    "is_active",
];
const GENERATION_RUN_COLUMNS: &[&str] = &["provider_id", "session_type"];
const HOLD_COLUMNS: &[&str] = &["slot_id", "holder_token", "ttl_ms"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "slot_id",
    "holder_token",
    "provider_id",
    "provider_slug",
    "session_type",
    "client_name",
    "client_email",
    "client_phone",
    "client_notes",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Delete,
    Select,
}

/// Statement kind and target table, without interpreting any values.
/// Prepared statements are described this way before their parameters are
/// bound.
pub fn statement_target(sql: &str) -> Option<(StatementKind, String)> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => Some((StatementKind::Insert, insert_table_name(insert).ok()?)),
        Statement::Delete(delete) => Some((StatementKind::Delete, delete_table_name(delete).ok()?)),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                let table = table_factor_name(&select.from.first()?.relation).ok()?;
                Some((StatementKind::Select, table))
            }
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "providers" => {
            let columns = insert_columns(insert, "providers", PROVIDER_COLUMNS)?;
            let rows = extract_insert_rows(insert)?;
            let row = single_row("providers", &columns, &rows)?;
            Ok(Command::InsertProvider {
                id: row.id()?,
                slug: parse_string(row.require("slug")?)?,
                timezone: parse_string(row.require("timezone")?)?,
            })
        }
        "patterns" => parse_pattern_rows(insert),
        "generation_runs" => {
            let columns = insert_columns(insert, "generation_runs", GENERATION_RUN_COLUMNS)?;
            let rows = extract_insert_rows(insert)?;
            let row = single_row("generation_runs", &columns, &rows)?;
            Ok(Command::InsertGenerationRun {
                provider_id: parse_ulid(row.require("provider_id")?)?,
                session_type: parse_session_type(row.require("session_type")?)?,
            })
        }
        "holds" => {
            let columns = insert_columns(insert, "holds", HOLD_COLUMNS)?;
            let rows = extract_insert_rows(insert)?;
            let row = single_row("holds", &columns, &rows)?;
            Ok(Command::InsertHold {
                slot_id: parse_ulid(row.require("slot_id")?)?,
                holder_token: parse_string(row.require("holder_token")?)?,
                ttl_ms: row.get("ttl_ms").map(parse_i64_or_null).transpose()?.flatten(),
            })
        }
        "bookings" => {
            let columns = insert_columns(insert, "bookings", BOOKING_COLUMNS)?;
            let rows = extract_insert_rows(insert)?;
            let row = single_row("bookings", &columns, &rows)?;
            parse_booking_row(&row)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_pattern_rows(insert: &ast::Insert) -> Result<Command, SqlError> {
    let columns = insert_columns(insert, "patterns", PATTERN_COLUMNS)?;
    let rows = extract_insert_rows(insert)?;

    let mut scope: Option<(Ulid, SessionType)> = None;
    let mut patterns = Vec::with_capacity(rows.len());
    for (i, values) in rows.iter().enumerate() {
        let row = Row::new("patterns", &columns, values)?;
        let at_row = |e: SqlError| e.at_row(i);

        let provider_id = parse_ulid(row.require("provider_id")?).map_err(at_row)?;
        let session_type = parse_session_type(row.require("session_type")?).map_err(at_row)?;
        match scope {
            None => scope = Some((provider_id, session_type)),
            Some(s) if s != (provider_id, session_type) => {
                return Err(SqlError::Unsupported(
                    "all pattern rows must share provider_id and session_type".into(),
                ));
            }
            Some(_) => {}
        }

        let day = parse_i64(row.require("day_of_week")?).map_err(at_row)?;
        patterns.push(PatternDraft {
            id: row.id().map_err(at_row)?,
            day_of_week: u8::try_from(day)
                .map_err(|_| SqlError::Parse(format!("row {i}: day_of_week {day} out of range")))?,
            start_time: parse_time(row.require("start_time")?).map_err(at_row)?,
            end_time: parse_time(row.require("end_time")?).map_err(at_row)?,
            timezone: row
                .get("timezone")
                .map(parse_string_or_null)
                .transpose()
                .map_err(at_row)?
                .flatten(),
            is_active: row.get("is_active").map(parse_bool).transpose().map_err(at_row)?.unwrap_or(true),
        });
    }

    // VALUES always carries at least one row.
    let (provider_id, session_type) = scope.ok_or(SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::UpsertPatterns { provider_id, session_type, patterns })
}

fn parse_booking_row(row: &Row<'_>) -> Result<Command, SqlError> {
    let slot_id = row.get("slot_id").map(parse_ulid_or_null).transpose()?.flatten();
    let holder_token = row.get("holder_token").map(parse_string_or_null).transpose()?.flatten();

    let target = match (slot_id, holder_token) {
        (Some(slot_id), Some(holder_token)) => BookingTarget::Confirm { slot_id, holder_token },
        (Some(slot_id), None) => BookingTarget::Direct { slot_id },
        (None, Some(_)) => return Err(SqlError::MissingColumn("slot_id")),
        (None, None) => {
            let provider = match (row.get("provider_id"), row.get("provider_slug")) {
                (Some(id), _) => ProviderRef::Id(parse_ulid(id)?),
                (None, Some(slug)) => ProviderRef::Slug(parse_string(slug)?),
                (None, None) => return Err(SqlError::MissingColumn("provider_id")),
            };
            BookingTarget::Manual {
                provider,
                session_type: parse_session_type(row.require("session_type")?)?,
            }
        }
    };

    let contact = ContactDetails {
        name: row.get("client_name").map(parse_string).transpose()?.unwrap_or_default(),
        email: row.get("client_email").map(parse_string).transpose()?.unwrap_or_default(),
        phone: row.get("client_phone").map(parse_string_or_null).transpose()?.flatten(),
        notes: row.get("client_notes").map(parse_string_or_null).transpose()?.flatten(),
    };

    Ok(Command::InsertBooking {
        id: row.id()?,
        target,
        contact,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "patterns" => Ok(Command::DeletePatterns {
            provider_id: parse_ulid(filters.require("provider_id")?)?,
            session_type: parse_session_type(filters.require("session_type")?)?,
        }),
        "holds" => Ok(Command::DeleteHold {
            slot_id: parse_ulid(filters.require("slot_id")?)?,
            holder_token: parse_string(filters.require("holder_token")?)?,
        }),
        "bookings" => Ok(Command::DeleteBooking { id: parse_ulid(filters.require("id")?)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "session_types" => Ok(Command::SelectSessionTypes),
        "providers" => Ok(Command::SelectProviders {
            slug: filters.get("slug").map(parse_string).transpose()?,
        }),
        "bookings" => Ok(Command::SelectBookings { provider: filters.provider()? }),
        "patterns" => Ok(Command::SelectPatterns {
            provider: filters.provider()?,
            session_type: filters.session_type()?,
        }),
        "available_dates" => Ok(Command::SelectAvailableDates {
            provider: filters.provider()?,
            session_type: filters.session_type()?,
        }),
        "available_times" => Ok(Command::SelectAvailableTimes {
            provider: filters.provider()?,
            session_type: filters.session_type()?,
            date: parse_date(filters.require("date")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            provider: filters.provider()?,
            session_type: filters.session_type()?,
            date: filters.get("date").map(parse_date).transpose()?,
        }),
        "staleness" => Ok(Command::SelectStaleness {
            provider: filters.provider()?,
            session_type: filters.session_type()?,
        }),
        "generation_warnings" => Ok(Command::SelectGenerationWarnings {
            provider: filters.provider()?,
            session_type: filters.session_type()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Rows and filters ──────────────────────────────────────────

/// One VALUES row addressed by column name.
struct Row<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, columns: &'a [String], values: &'a [Expr]) -> Result<Self, SqlError> {
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        Ok(Self { columns, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns.iter().position(|c| c == column).map(|i| &self.values[i])
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// Client-chosen id; absent or NULL lets the server pick one.
    fn id(&self) -> Result<Option<Ulid>, SqlError> {
        Ok(self.get("id").map(parse_ulid_or_null).transpose()?.flatten())
    }
}

fn single_row<'a>(table: &'static str, columns: &'a [String], rows: &'a [Vec<Expr>]) -> Result<Row<'a>, SqlError> {
    match rows {
        [values] => Row::new(table, columns, values),
        _ => Err(SqlError::Unsupported(format!("{table}: one row per INSERT"))),
    }
}

/// Equality filters joined by AND.
struct Filters<'a> {
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut pairs = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut pairs)?;
        }
        Ok(Self { pairs })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.pairs.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn provider(&self) -> Result<ProviderRef, SqlError> {
        if let Some(id) = self.get("provider_id") {
            return Ok(ProviderRef::Id(parse_ulid(id)?));
        }
        if let Some(slug) = self.get("provider_slug") {
            return Ok(ProviderRef::Slug(parse_string(slug)?));
        }
        Err(SqlError::MissingFilter("provider_id"))
    }

    fn session_type(&self) -> Result<SessionType, SqlError> {
        parse_session_type(self.require("session_type")?)
    }
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op: BinaryOperator::Eq, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

/// The statement's column list, or the table's default order when omitted.
fn insert_columns(
    insert: &ast::Insert,
    table: &'static str,
    known: &[&'static str],
) -> Result<Vec<String>, SqlError> {
    if insert.columns.is_empty() {
        return Ok(known.iter().map(|c| c.to_string()).collect());
    }
    insert
        .columns
        .iter()
        .map(|ident| {
            let column = ident.value.to_lowercase();
            if known.contains(&column.as_str()) {
                Ok(column)
            } else {
                Err(SqlError::UnknownColumn { table, column })
            }
        })
        .collect()
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_string(expr).map(Some) }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_ulid(expr).map(Some) }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_string(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_i64(expr).map(Some) }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_session_type(expr: &Expr) -> Result<SessionType, SqlError> {
    Ok(parse_string(expr)?.parse()?)
}

fn parse_time(expr: &Expr) -> Result<chrono::NaiveTime, SqlError> {
    Ok(parse_wall_time(&parse_string(expr)?)?)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| SqlError::Parse(format!("bad date {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl SqlError {
    fn at_row(self, row: usize) -> Self {
        match self {
            SqlError::Parse(s) => SqlError::Parse(format!("row {row}: {s}")),
            other => other,
        }
    }
}
