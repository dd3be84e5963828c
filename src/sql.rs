use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::BookingRequest;
use crate::model::*;

/// Which bookings a `SELECT ... FROM bookings` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    /// No filter: everything for an administrator, own bookings for a member.
    Visible,
    Id(Ulid),
    User(Ulid),
    Machine(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Option<Ulid>,
        name: Option<String>,
        is_admin: bool,
        returning: bool,
    },
    UpdateUser {
        id: Ulid,
        name: Option<String>,
        is_admin: Option<bool>,
        returning: bool,
    },
    SelectUsers {
        id: Option<Ulid>,
    },
    InsertCertification {
        user_id: Ulid,
        machine_id: Ulid,
    },
    DeleteCertification {
        user_id: Ulid,
        machine_id: Ulid,
    },
    SelectCertifications {
        /// None means the session's own user.
        user_id: Option<Ulid>,
    },
    InsertMachine {
        id: Option<Ulid>,
        name: Option<String>,
        kind: String,
        requires_certification: bool,
        returning: bool,
    },
    UpdateMachine {
        id: Ulid,
        patch: MachinePatch,
        returning: bool,
    },
    DeleteMachine {
        id: Ulid,
    },
    SelectMachines {
        id: Option<Ulid>,
    },
    InsertBooking {
        request: BookingRequest,
        returning: bool,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: String,
        returning: bool,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectSlots {
        machine_id: Ulid,
        date: String,
    },
}

/// The row shape a statement produces, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultTable {
    Users,
    Certifications,
    Machines,
    Bookings,
    Slots,
}

impl ResultTable {
    fn from_name(table: &str) -> Option<Self> {
        match table {
            "users" => Some(ResultTable::Users),
            "certifications" => Some(ResultTable::Certifications),
            "machines" => Some(ResultTable::Machines),
            "bookings" => Some(ResultTable::Bookings),
            "slots" => Some(ResultTable::Slots),
            _ => None,
        }
    }
}

const USER_COLUMNS: &[&str] = &["id", "name", "is_admin"];
const CERTIFICATION_COLUMNS: &[&str] = &["user_id", "machine_id"];
const MACHINE_COLUMNS: &[&str] = &["id", "name", "type", "requires_certification"];
const BOOKING_COLUMNS: &[&str] = &["machine_id", "date", "time", "user_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmt = parse_single(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row shape for describe requests. Works on statements that still carry
/// `$n` placeholders.
pub fn result_table(sql: &str) -> Option<ResultTable> {
    let stmt = parse_single(sql).ok()?;
    let table = match &stmt {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        Statement::Insert(insert) if insert.returning.is_some() => insert_table_name(insert).ok()?,
        Statement::Update {
            table,
            returning: Some(_),
            ..
        } => table_factor_name(&table.relation).ok()?,
        _ => return None,
    };
    ResultTable::from_name(&table)
}

fn parse_single(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "users" => {
            let row = insert_row(insert, "users", USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: row.ulid_or_null("id")?,
                name: row.text("name")?,
                is_admin: row.bool_or("is_admin", false)?,
                returning,
            })
        }
        "certifications" => {
            let row = insert_row(insert, "certifications", CERTIFICATION_COLUMNS)?;
            Ok(Command::InsertCertification {
                user_id: row.ulid("user_id")?,
                machine_id: row.ulid("machine_id")?,
            })
        }
        "machines" => {
            let row = insert_row(insert, "machines", MACHINE_COLUMNS)?;
            Ok(Command::InsertMachine {
                id: row.ulid_or_null("id")?,
                name: row.text("name")?,
                kind: row.text("type")?.unwrap_or_default(),
                requires_certification: row.bool_or("requires_certification", false)?,
                returning,
            })
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    user_id: row.ulid_or_null("user_id")?,
                    machine_id: row.ulid_or_null("machine_id")?,
                    date: row.text("date")?,
                    time: row.text("time")?,
                },
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column/value pairs of a single-row INSERT. Without a column list the
/// values are taken positionally against `defaults`.
fn insert_row(insert: &ast::Insert, table: &'static str, defaults: &[&str]) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| column_alias(&c.value)).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    for col in &columns {
        if !defaults.contains(&col.as_str()) {
            return Err(SqlError::UnknownColumn(table, col.clone()));
        }
    }
    Ok(Row(columns.into_iter().zip(row.iter().cloned()).collect()))
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let filters = where_filters(selection)?;
    let id = filters.ulid("id")?;

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .map(|c| column_alias(&c))
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((col, assignment.value.clone()));
    }
    let set = Row(set);

    match table.as_str() {
        "bookings" => {
            filters.only(&["id"], "bookings")?;
            set.only(&["status"], "bookings")?;
            let status = set
                .text("status")?
                .ok_or(SqlError::MissingValue("status"))?;
            Ok(Command::UpdateBookingStatus { id, status, returning })
        }
        "users" => {
            filters.only(&["id"], "users")?;
            set.only(&["name", "is_admin"], "users")?;
            Ok(Command::UpdateUser {
                id,
                name: set.text("name")?,
                is_admin: set.bool_opt("is_admin")?,
                returning,
            })
        }
        "machines" => {
            filters.only(&["id"], "machines")?;
            set.only(
                &["name", "type", "status", "requires_certification", "maintenance_note"],
                "machines",
            )?;
            let status = set
                .text("status")?
                .map(|s| MachineStatus::from_str(&s).map_err(|e| SqlError::InvalidValue(e.to_string())))
                .transpose()?;
            let maintenance_note = match set.get("maintenance_note") {
                Some(expr) => Some(parse_text(expr)?),
                None => None,
            };
            Ok(Command::UpdateMachine {
                id,
                patch: MachinePatch {
                    name: set.text("name")?,
                    kind: set.text("type")?,
                    status,
                    requires_certification: set.bool_opt("requires_certification")?,
                    maintenance_note,
                },
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;

    match table.as_str() {
        "bookings" => {
            filters.only(&["id"], "bookings")?;
            Ok(Command::DeleteBooking { id: filters.ulid("id")? })
        }
        "machines" => {
            filters.only(&["id"], "machines")?;
            Ok(Command::DeleteMachine { id: filters.ulid("id")? })
        }
        "certifications" => {
            filters.only(CERTIFICATION_COLUMNS, "certifications")?;
            Ok(Command::DeleteCertification {
                user_id: filters.ulid("user_id")?,
                machine_id: filters.ulid("machine_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
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

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "users" => {
            filters.only(&["id"], "users")?;
            Ok(Command::SelectUsers { id: filters.ulid_opt("id")? })
        }
        "machines" => {
            filters.only(&["id"], "machines")?;
            Ok(Command::SelectMachines { id: filters.ulid_opt("id")? })
        }
        "certifications" => {
            filters.only(&["user_id"], "certifications")?;
            Ok(Command::SelectCertifications {
                user_id: filters.ulid_opt("user_id")?,
            })
        }
        "bookings" => {
            filters.only(&["id", "user_id", "machine_id"], "bookings")?;
            let id = filters.ulid_opt("id")?;
            let user_id = filters.ulid_opt("user_id")?;
            let machine_id = filters.ulid_opt("machine_id")?;
            let filter = match (id, user_id, machine_id) {
                (None, None, None) => BookingFilter::Visible,
                (Some(id), None, None) => BookingFilter::Id(id),
                (None, Some(u), None) => BookingFilter::User(u),
                (None, None, Some(m)) => BookingFilter::Machine(m),
                _ => {
                    return Err(SqlError::Unsupported(
                        "filter bookings by one of id, user_id or machine_id".into(),
                    ));
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        "slots" => {
            filters.only(&["machine_id", "date"], "slots")?;
            Ok(Command::SelectSlots {
                machine_id: filters.ulid("machine_id")?,
                date: filters.text("date")?.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms joined by AND. Anything else in a WHERE is rejected,
/// and each command rejects columns it does not filter on.
fn where_filters(selection: &Option<Expr>) -> Result<Row, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut out)?;
    }
    Ok(Row(out))
}

fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
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
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Rows ──────────────────────────────────────────────────────

/// Named values from a VALUES row, a SET list or a WHERE clause.
struct Row(Vec<(String, Expr)>);

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn only(&self, allowed: &[&str], table: &'static str) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((col, _)) => Err(SqlError::UnknownColumn(table, col.clone())),
            None => Ok(()),
        }
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.ulid_opt(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn ulid_opt(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn ulid_or_null(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        match self.get(col) {
            Some(expr) => parse_ulid_or_null(expr),
            None => Ok(None),
        }
    }

    fn text(&self, col: &str) -> Result<Option<String>, SqlError> {
        match self.get(col) {
            Some(expr) => parse_text(expr),
            None => Ok(None),
        }
    }

    fn bool_opt(&self, col: &str) -> Result<Option<bool>, SqlError> {
        self.get(col).map(parse_bool).transpose()
    }

    fn bool_or(&self, col: &str, default: bool) -> Result<bool, SqlError> {
        Ok(self.bool_opt(col)?.unwrap_or(default))
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// `kind` is accepted as a synonym for the machine `type` column.
fn column_alias(col: &str) -> String {
    match col.to_lowercase().as_str() {
        "kind" => "type".to_string(),
        other => other.to_string(),
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(column_alias(&ident.value)),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| column_alias(&i.value)),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::InvalidValue(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

/// Strings and bare numbers are both text; NULL is None.
fn parse_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.to_string())),
        Some(value) => Err(SqlError::InvalidValue(format!("expected text, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::InvalidValue(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
    /// Well-formed SQL carrying a value of the wrong shape.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const U: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const M: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_user() {
        let sql = format!("INSERT INTO users (id, name, is_admin) VALUES ('{U}', 'Ada', true)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertUser {
                id: Some(ulid(U)),
                name: Some("Ada".into()),
                is_admin: true,
                returning: false,
            }
        );
    }

    #[test]
    fn parse_insert_user_positional_defaults() {
        let sql = format!("INSERT INTO users VALUES ('{U}', 'Ada')");
        match parse_sql(&sql).unwrap() {
            Command::InsertUser { is_admin, .. } => assert!(!is_admin),
            other => panic!("expected InsertUser, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_machine_columns_any_order() {
        let sql = format!(
            "INSERT INTO machines (requires_certification, type, name, id) VALUES (true, 'laser', 'Epilog', '{M}') RETURNING *"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertMachine {
                id: Some(ulid(M)),
                name: Some("Epilog".into()),
                kind: "laser".into(),
                requires_certification: true,
                returning: true,
            }
        );
    }

    #[test]
    fn parse_insert_machine_without_id() {
        let sql = "INSERT INTO machines (name, type) VALUES ('Prusa', '3d_printer')";
        match parse_sql(sql).unwrap() {
            Command::InsertMachine { id, requires_certification, .. } => {
                assert_eq!(id, None);
                assert!(!requires_certification);
            }
            other => panic!("expected InsertMachine, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            "INSERT INTO bookings (machine_id, date, time) VALUES ('{M}', '2024-06-01', '10:00') RETURNING *"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                request: BookingRequest::new(ulid(M), "2024-06-01", "10:00"),
                returning: true,
            }
        );
    }

    #[test]
    fn parse_insert_booking_on_behalf() {
        let sql = format!(
            "INSERT INTO bookings (machine_id, date, time, user_id) VALUES ('{M}', '2024-06-01T00:00:00Z', '10:00', '{U}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request, returning } => {
                assert_eq!(request.user_id, Some(ulid(U)));
                assert_eq!(request.date.as_deref(), Some("2024-06-01T00:00:00Z"));
                assert!(!returning);
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_null_fields_left_to_engine() {
        let sql = "INSERT INTO bookings (machine_id, date, time) VALUES (NULL, NULL, '10:00')";
        match parse_sql(sql).unwrap() {
            Command::InsertBooking { request, .. } => {
                assert_eq!(request.machine_id, None);
                assert_eq!(request.date, None);
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_rejects_unknown_column_and_arity() {
        let sql = format!("INSERT INTO bookings (machine_id, slot) VALUES ('{M}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("bookings", _))));

        let sql = format!("INSERT INTO users (id) VALUES ('{U}', 'Ada')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("users", 1, 2))));
    }

    #[test]
    fn parse_multi_row_insert_unsupported() {
        let sql = format!("INSERT INTO certifications VALUES ('{U}', '{M}'), ('{U}', '{M}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_certification_grant_and_revoke() {
        let sql = format!("INSERT INTO certifications (user_id, machine_id) VALUES ('{U}', '{M}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCertification { user_id: ulid(U), machine_id: ulid(M) }
        );
        let sql = format!("DELETE FROM certifications WHERE machine_id = '{M}' AND user_id = '{U}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteCertification { user_id: ulid(U), machine_id: ulid(M) }
        );
    }

    #[test]
    fn parse_update_booking_status() {
        let sql = format!("UPDATE bookings SET status = 'approved' WHERE id = '{U}' RETURNING *");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateBookingStatus {
                id: ulid(U),
                status: "approved".into(),
                returning: true,
            }
        );
    }

    #[test]
    fn parse_update_booking_other_columns_rejected() {
        let sql = format!("UPDATE bookings SET time = '11:00' WHERE id = '{U}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("bookings", _))));
        let sql = "UPDATE bookings SET status = 'approved'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn where_terms_outside_the_command_are_rejected() {
        let sql = format!("DELETE FROM bookings WHERE id = '{U}' AND status = 'pending'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::UnknownColumn("bookings", c)) if c == "status"
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE status = 'pending'"),
            Err(SqlError::UnknownColumn("bookings", _))
        ));
        let sql = format!("UPDATE machines SET status = 'available' WHERE id = '{M}' AND name = 'Saw'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("machines", _))));
        let sql = format!("SELECT * FROM slots WHERE machine_id = '{M}' AND date = '2024-06-01' AND time = '10:00'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("slots", _))));
        let sql = format!("SELECT * FROM users WHERE id = '{U}' AND is_admin = true");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("users", _))));
    }

    #[test]
    fn parse_update_machine_patch() {
        let sql = format!(
            "UPDATE machines SET status = 'out of order', maintenance_note = 'laser tube', type = 'laser' WHERE id = '{M}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateMachine { id, patch, .. } => {
                assert_eq!(id, ulid(M));
                assert_eq!(patch.status, Some(MachineStatus::OutOfOrder));
                assert_eq!(patch.maintenance_note, Some(Some("laser tube".into())));
                assert_eq!(patch.kind.as_deref(), Some("laser"));
                assert_eq!(patch.name, None);
            }
            other => panic!("expected UpdateMachine, got {other:?}"),
        }

        let sql = format!("UPDATE machines SET maintenance_note = NULL WHERE id = '{M}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateMachine { patch, .. } => assert_eq!(patch.maintenance_note, Some(None)),
            other => panic!("expected UpdateMachine, got {other:?}"),
        }

        let sql = format!("UPDATE machines SET status = 'on fire' WHERE id = '{M}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_update_user() {
        let sql = format!("UPDATE users SET is_admin = true WHERE id = '{U}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateUser { id: ulid(U), name: None, is_admin: Some(true), returning: false }
        );
    }

    #[test]
    fn parse_delete_booking_and_machine() {
        let sql = format!("DELETE FROM bookings WHERE id = '{U}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: ulid(U) });
        let sql = format!("DELETE FROM machines WHERE id = '{M}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteMachine { id: ulid(M) });
        assert!(parse_sql("DELETE FROM users WHERE id = 'x'").is_err());
    }

    #[test]
    fn parse_select_bookings_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { filter: BookingFilter::Visible }
        );
        let sql = format!("SELECT * FROM bookings WHERE user_id = '{U}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings { filter: BookingFilter::User(ulid(U)) }
        );
        let sql = format!("SELECT id, status FROM bookings WHERE machine_id = '{M}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings { filter: BookingFilter::Machine(ulid(M)) }
        );
        let sql = format!("SELECT * FROM bookings WHERE id = '{U}' AND machine_id = '{M}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        let sql = format!("SELECT * FROM bookings WHERE id = '{U}' OR id = '{M}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!("SELECT * FROM slots WHERE machine_id = '{M}' AND date = '2024-06-01'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots { machine_id: ulid(M), date: "2024-06-01".into() }
        );
        let sql = format!("SELECT * FROM slots WHERE machine_id = '{M}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_select_registries() {
        assert_eq!(parse_sql("SELECT * FROM users").unwrap(), Command::SelectUsers { id: None });
        assert_eq!(parse_sql("SELECT * FROM machines").unwrap(), Command::SelectMachines { id: None });
        assert_eq!(
            parse_sql("SELECT * FROM certifications").unwrap(),
            Command::SelectCertifications { user_id: None }
        );
    }

    #[test]
    fn parse_bad_ulid_is_invalid_value() {
        let sql = "SELECT * FROM bookings WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn result_table_for_describe() {
        assert_eq!(
            result_table("SELECT * FROM bookings WHERE id = $1"),
            Some(ResultTable::Bookings)
        );
        assert_eq!(
            result_table("INSERT INTO bookings (machine_id, date, time) VALUES ($1, $2, $3) RETURNING *"),
            Some(ResultTable::Bookings)
        );
        assert_eq!(
            result_table("UPDATE machines SET status = $1 WHERE id = $2 RETURNING *"),
            Some(ResultTable::Machines)
        );
        assert_eq!(result_table("INSERT INTO bookings VALUES ($1, $2, $3)"), None);
        assert_eq!(result_table("DELETE FROM bookings WHERE id = $1"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM holds"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
