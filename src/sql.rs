use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Host decision recorded through the `decisions` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Reject,
    Complete,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        name: Option<String>,
        schedule: WeeklySchedule,
        utc_offset_secs: i32,
    },
    DeleteVehicle {
        id: Ulid,
    },
    ReplaceSchedule {
        vehicle_id: Ulid,
        schedule: WeeklySchedule,
    },
    UpsertOverride {
        vehicle_id: Ulid,
        day: CalendarDate,
        available: bool,
    },
    ClearOverride {
        vehicle_id: Ulid,
        day: CalendarDate,
    },
    SubmitBooking {
        vehicle_id: Ulid,
        start_date: CalendarDate,
        end_date: CalendarDate,
        pickup_time: Option<NaiveTime>,
        return_time: Option<NaiveTime>,
        note: Option<String>,
        channel: Option<String>,
    },
    Decide {
        booking_id: Ulid,
        decision: Decision,
        reason: Option<String>,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectVehicles,
    SelectOverrides {
        vehicle_id: Ulid,
    },
    SelectBookings {
        vehicle_id: Ulid,
    },
    SelectDayStatus {
        vehicle_id: Ulid,
        day: CalendarDate,
    },
    SelectCalendar {
        vehicle_id: Ulid,
        year: i32,
        month: u32,
    },
    SelectCalendarSummary {
        vehicle_id: Ulid,
        year: i32,
        month: u32,
        months: u32,
    },
    SelectBookable {
        vehicle_id: Ulid,
        start_date: CalendarDate,
        end_date: CalendarDate,
    },
    SelectDisabledDates {
        vehicle_id: Ulid,
        horizon: Option<u32>,
    },
    SelectActiveRentals {
        vehicle_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmt = parse_statement(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

/// Which statement kind touches which table, for describing result columns
/// before parameters are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Select(String),
    Insert(String),
}

pub fn target_table(sql: &str) -> Option<Target> {
    match parse_statement(sql).ok()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select
                .from
                .first()
                .and_then(|t| table_factor_name(&t.relation).ok())
                .map(Target::Select),
            _ => None,
        },
        Statement::Insert(insert) => insert_table_name(&insert).ok().map(Target::Insert),
        _ => None,
    }
}

/// Positional VALUES row where trailing columns may be omitted.
struct Row<'a> {
    table: &'static str,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, values: &'a [Expr], required: usize) -> Result<Self, SqlError> {
        if values.len() < required {
            return Err(SqlError::WrongArity(table, required, values.len()));
        }
        Ok(Self { table, values })
    }

    fn get(&self, i: usize) -> Option<&'a Expr> {
        self.values.get(i).filter(|e| !is_null(e))
    }

    fn required(&self, i: usize) -> Result<&'a Expr, SqlError> {
        self.get(i)
            .ok_or(SqlError::WrongArity(self.table, i + 1, self.values.len()))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "vehicles" => {
            let row = Row::new("vehicles", &values, 1)?;
            let default = WeeklySchedule::default();
            let schedule = WeeklySchedule {
                days: row.get(2).map(parse_weekdays).transpose()?.unwrap_or(default.days),
                start: row.get(3).map(parse_time).transpose()?.unwrap_or(default.start),
                end: row.get(4).map(parse_time).transpose()?.unwrap_or(default.end),
            };
            Ok(Command::InsertVehicle {
                id: parse_ulid(row.required(0)?)?,
                name: row.get(1).map(parse_string).transpose()?,
                schedule,
                utc_offset_secs: row.get(5).map(parse_offset).transpose()?.unwrap_or(0),
            })
        }
        "schedules" => {
            let row = Row::new("schedules", &values, 4)?;
            Ok(Command::ReplaceSchedule {
                vehicle_id: parse_ulid(row.required(0)?)?,
                schedule: WeeklySchedule {
                    days: parse_weekdays(row.required(1)?)?,
                    start: parse_time(row.required(2)?)?,
                    end: parse_time(row.required(3)?)?,
                },
            })
        }
        "overrides" => {
            let row = Row::new("overrides", &values, 3)?;
            Ok(Command::UpsertOverride {
                vehicle_id: parse_ulid(row.required(0)?)?,
                day: parse_date(row.required(1)?)?,
                available: parse_bool(row.required(2)?)?,
            })
        }
        "bookings" => {
            let row = Row::new("bookings", &values, 3)?;
            Ok(Command::SubmitBooking {
                vehicle_id: parse_ulid(row.required(0)?)?,
                start_date: parse_date(row.required(1)?)?,
                end_date: parse_date(row.required(2)?)?,
                pickup_time: row.get(3).map(parse_time).transpose()?,
                return_time: row.get(4).map(parse_time).transpose()?,
                note: row.get(5).map(parse_string).transpose()?,
                channel: row.get(6).map(parse_string).transpose()?,
            })
        }
        "decisions" => {
            let row = Row::new("decisions", &values, 2)?;
            let decision = match parse_string(row.required(1)?)?.to_lowercase().as_str() {
                "confirm" | "confirmed" => Decision::Confirm,
                "reject" | "rejected" => Decision::Reject,
                "complete" | "completed" => Decision::Complete,
                other => return Err(SqlError::Parse(format!("unknown decision: {other}"))),
            };
            Ok(Command::Decide {
                booking_id: parse_ulid(row.required(0)?)?,
                decision,
                reason: row.get(2).map(parse_string).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "vehicles" => Ok(Command::DeleteVehicle {
            id: parse_ulid(filters.required("id")?)?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            id: parse_ulid(filters.required("id")?)?,
        }),
        "overrides" => Ok(Command::ClearOverride {
            vehicle_id: parse_ulid(filters.required("vehicle_id")?)?,
            day: parse_date(filters.required("day")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;
    let vehicle_id = || parse_ulid(filters.required("vehicle_id")?);

    match table.as_str() {
        "vehicles" => Ok(Command::SelectVehicles),
        "overrides" => Ok(Command::SelectOverrides {
            vehicle_id: vehicle_id()?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            vehicle_id: vehicle_id()?,
        }),
        "day_status" => Ok(Command::SelectDayStatus {
            vehicle_id: vehicle_id()?,
            day: parse_date(filters.required("day")?)?,
        }),
        "calendar" => Ok(Command::SelectCalendar {
            vehicle_id: vehicle_id()?,
            year: parse_i32(filters.required("year")?)?,
            month: parse_u32(filters.required("month")?)?,
        }),
        "calendar_summary" => Ok(Command::SelectCalendarSummary {
            vehicle_id: vehicle_id()?,
            year: parse_i32(filters.required("year")?)?,
            month: parse_u32(filters.required("month")?)?,
            months: filters.get("months").map(parse_u32).transpose()?.unwrap_or(1),
        }),
        "bookable" => Ok(Command::SelectBookable {
            vehicle_id: vehicle_id()?,
            start_date: parse_date(filters.required("start_date")?)?,
            end_date: parse_date(filters.required("end_date")?)?,
        }),
        "disabled_dates" => Ok(Command::SelectDisabledDates {
            vehicle_id: vehicle_id()?,
            horizon: filters.get("horizon").map(parse_u32).transpose()?,
        }),
        "active_rentals" => Ok(Command::SelectActiveRentals {
            vehicle_id: filters.get("vehicle_id").map(parse_ulid).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms joined by AND. Other predicates are rejected.
struct Filters<'a> {
    eq: BTreeMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut eq = BTreeMap::new();
        if let Some(expr) = selection {
            collect_eq_filters(expr, &mut eq)?;
        }
        Ok(Self { eq })
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.eq.get(col).copied()
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }
}

fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut BTreeMap<String, &'a Expr>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(col, right);
            Ok(())
        }
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// First VALUES row. Multi-row inserts are refused: each booking is its
/// own submission with its own conflict check.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
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

/// Literal text of a string or number value.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(other) => Err(SqlError::Parse(format!("expected literal, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date(expr: &Expr) -> Result<CalendarDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = literal_text(expr)?.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_weekdays(expr: &Expr) -> Result<Weekdays, SqlError> {
    literal_text(expr)?
        .parse()
        .map_err(|e: ParseWeekdaysError| SqlError::Parse(e.to_string()))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Seconds east of UTC, or `'+HH:MM'` / `'-HH:MM'`.
fn parse_offset(expr: &Expr) -> Result<i32, SqlError> {
    let signed = match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) if s.starts_with(['+', '-']) => Some(s),
        _ => None,
    };
    if let Some(s) = signed {
        let (h, m) = s[1..]
            .split_once(':')
            .ok_or_else(|| SqlError::Parse(format!("bad offset {s:?}")))?;
        let h: i32 = h.parse().map_err(|_| SqlError::Parse(format!("bad offset {s:?}")))?;
        let m: i32 = m.parse().map_err(|_| SqlError::Parse(format!("bad offset {s:?}")))?;
        let secs = h * 3600 + m * 60;
        return Ok(if s.starts_with('-') { -secs } else { secs });
    }
    parse_i32(expr)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
