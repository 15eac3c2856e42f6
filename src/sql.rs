use sqlparser::ast::{
    self, Expr, FromTable, FunctionArg, FunctionArgExpr, ObjectNamePart, SetExpr, Statement,
    TableFactor, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;
use crate::store::ClaimRequest;

/// Parsed store procedure call.
#[derive(Debug, PartialEq)]
pub enum Command {
    RenewLease {
        resource_id: ResourceId,
        token: Token,
        now: Ms,
        expires_at: Ms,
    },
    ClaimSlot(ClaimRequest),
    SlotUsage {
        resource_id: ResourceId,
        token: Option<Token>,
        now: Ms,
    },
    SelectSlots {
        resource_id: ResourceId,
    },
    DeleteExpired {
        now: Ms,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Query(query) => parse_select(query),
        Statement::Delete(delete) => parse_delete(delete),
        other => Err(SqlError::Unsupported(format!("{other}"))),
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

    let TableFactor::Table { name, args, .. } = &from.relation else {
        return Err(SqlError::Parse("complex table expression".into()));
    };
    let relation =
        object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;

    match args {
        Some(args) => {
            let values = function_args(&args.args)?;
            parse_procedure(&relation, &values)
        }
        None if relation == "slots" => {
            let resource_id = select
                .selection
                .as_ref()
                .and_then(|sel| find_eq_filter(sel, "resource_id"))
                .ok_or(SqlError::MissingFilter("resource_id"))?;
            Ok(Command::SelectSlots {
                resource_id: parse_resource_id(resource_id)?,
            })
        }
        None => Err(SqlError::UnknownRelation(relation)),
    }
}

fn parse_procedure(name: &str, args: &[&Expr]) -> Result<Command, SqlError> {
    match name {
        "renew_lease" => {
            expect_arity("renew_lease", args, 4)?;
            Ok(Command::RenewLease {
                resource_id: parse_resource_id(args[0])?,
                token: parse_token(args[1])?,
                now: parse_timestamp(args[2])?,
                expires_at: parse_timestamp(args[3])?,
            })
        }
        "claim_slot" => {
            expect_arity("claim_slot", args, 6)?;
            let user_id = parse_string_or_null(args[3])?
                .map(|s| UserId::parse(&s))
                .transpose()?;
            Ok(Command::ClaimSlot(ClaimRequest {
                resource_id: parse_resource_id(args[0])?,
                slot: parse_u32(args[1])?,
                token: parse_token(args[2])?,
                user_id,
                now: parse_timestamp(args[4])?,
                expires_at: parse_timestamp(args[5])?,
            }))
        }
        "slot_usage" => {
            expect_arity("slot_usage", args, 3)?;
            let token = parse_string_or_null(args[1])?
                .map(|s| Token::parse(&s))
                .transpose()?;
            Ok(Command::SlotUsage {
                resource_id: parse_resource_id(args[0])?,
                token,
                now: parse_timestamp(args[2])?,
            })
        }
        other => Err(SqlError::UnknownRelation(other.to_string())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let table = match tables.first().map(|t| &t.relation) {
        Some(TableFactor::Table { name, .. }) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))?
        }
        Some(_) => return Err(SqlError::Parse("complex table expression".into())),
        None => return Err(SqlError::Parse("DELETE without table".into())),
    };
    if table != "slots" {
        return Err(SqlError::UnknownRelation(table));
    }

    match &delete.selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::LtEq,
            right,
        }) if expr_column_name(left).as_deref() == Some("expires_at") => {
            Ok(Command::DeleteExpired {
                now: parse_timestamp(right)?,
            })
        }
        _ => Err(SqlError::MissingFilter("expires_at <=")),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn function_args(args: &[FunctionArg]) -> Result<Vec<&Expr>, SqlError> {
    args.iter()
        .map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e),
            _ => Err(SqlError::Parse("only positional arguments are supported".into())),
        })
        .collect()
}

fn expect_arity(name: &'static str, args: &[&Expr], expected: usize) -> Result<(), SqlError> {
    if args.len() != expected {
        return Err(SqlError::WrongArity(name, expected, args.len()));
    }
    Ok(())
}

/// Find `column = <value>` anywhere in an AND-chain.
fn find_eq_filter<'a>(expr: &'a Expr, column: &str) -> Option<&'a Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => find_eq_filter(left, column).or_else(|| find_eq_filter(right, column)),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Some(right),
        Expr::Nested(inner) => find_eq_filter(inner, column),
        _ => None,
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_resource_id(expr: &Expr) -> Result<ResourceId, SqlError> {
    Ok(ResourceId::parse(&parse_string(expr)?)?)
}

fn parse_token(expr: &Expr) -> Result<Token, SqlError> {
    Ok(Token::parse(&parse_string(expr)?)?)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    let ms = parse_i64(expr)?;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(SqlError::Parse(format!("timestamp {ms} out of range")));
    }
    Ok(ms)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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
    #[error("unknown relation: {0}")]
    UnknownRelation(String),
    #[error("{0}: expected {1} arguments, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}
