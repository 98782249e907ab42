//! A small SQL dialect over in-memory tables.
//!
//! Parameters (`?` positional, `$n` numbered) are bound while parsing, so a parsed
//! [`Statement`] is self-contained. Every write records inverse [`UndoOp`]s; a failing statement
//! replays its own entries, and transactions replay the whole log.

use super::filter::{compare, sort_order, values_equal};
use crate::traits::{CloudError, CloudResult, ExecuteResult, ResourceId, Row, SortOrder};
use regex::RegexBuilder;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ColumnDef {
    pub(crate) name: String,
    pub(crate) ty: ColumnType,
    pub(crate) primary_key: bool,
    pub(crate) not_null: bool,
    pub(crate) unique: bool,
    pub(crate) default: Option<Value>,
}

impl ColumnDef {
    fn auto_assigned(&self) -> bool {
        self.primary_key && self.ty == ColumnType::Integer
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Table {
    pub(crate) columns: Vec<ColumnDef>,
    rows: BTreeMap<u64, Row>,
    next_rowid: u64,
    last_auto: i64,
}

impl Table {
    fn new(columns: Vec<ColumnDef>) -> Self {
        Self {
            columns,
            rows: BTreeMap::new(),
            next_rowid: 1,
            last_auto: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn require_column(&self, table: &str, name: &str) -> CloudResult<()> {
        if self.column(name).is_none() {
            return Err(CloudError::validation(format!("no such column: {table}.{name}")));
        }
        Ok(())
    }

    /// Coerce values to column types and enforce `NOT NULL`, `PRIMARY KEY` and `UNIQUE`.
    fn check_row(&self, table: &str, row: &mut Row, except: Option<u64>) -> CloudResult<()> {
        for column in &self.columns {
            let value = row.entry(column.name.clone()).or_insert(Value::Null);
            *value = coerce(table, column, value.take())?;
            if value.is_null() {
                if column.not_null || column.primary_key {
                    return Err(CloudError::validation(format!(
                        "NOT NULL constraint failed: {table}.{}",
                        column.name
                    )));
                }
                continue;
            }
            if column.unique || column.primary_key {
                let clash = self.rows.iter().any(|(rowid, other)| {
                    Some(*rowid) != except
                        && other
                            .get(&column.name)
                            .is_some_and(|existing| values_equal(existing, value))
                });
                if clash {
                    return Err(CloudError::conflict(format!(
                        "UNIQUE constraint failed: {table}.{}",
                        column.name
                    ))
                    .with_resource(ResourceId::new("table", table)));
                }
            }
        }
        Ok(())
    }
}

fn coerce(table: &str, column: &ColumnDef, value: Value) -> CloudResult<Value> {
    let mismatch = |value: &Value| {
        CloudError::validation(format!(
            "type mismatch for {table}.{}: {value} is not {:?}",
            column.name, column.ty
        ))
    };
    Ok(match (column.ty, value) {
        (_, Value::Null) => Value::Null,
        (ColumnType::Json, value) => value,
        (ColumnType::Text, value @ Value::String(_)) => value,
        (ColumnType::Boolean, value @ Value::Bool(_)) => value,
        (ColumnType::Boolean, Value::Number(n)) if n.as_i64() == Some(0) => Value::Bool(false),
        (ColumnType::Boolean, Value::Number(n)) if n.as_i64() == Some(1) => Value::Bool(true),
        (ColumnType::Integer, Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Value::from(i),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(f as i64),
            _ => return Err(mismatch(&Value::Number(n))),
        },
        (ColumnType::Real, Value::Number(n)) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| mismatch(&Value::Number(n.clone())))?,
        (_, other) => return Err(mismatch(&other)),
    })
}

/// Storage the executor runs against: committed tables, or a transaction's working set.
pub(crate) trait TableSet {
    fn table(&self, name: &str) -> Option<&Table>;
    fn table_mut(&mut self, name: &str) -> Option<&mut Table>;
    fn create_table(&mut self, name: &str, table: Table);
    fn drop_table(&mut self, name: &str) -> Option<Table>;
}

impl TableSet for BTreeMap<String, Table> {
    fn table(&self, name: &str) -> Option<&Table> {
        self.get(name)
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.get_mut(name)
    }

    fn create_table(&mut self, name: &str, table: Table) {
        self.insert(name.to_string(), table);
    }

    fn drop_table(&mut self, name: &str) -> Option<Table> {
        self.remove(name)
    }
}

/// Inverse of one applied change.
#[derive(Debug, Clone)]
pub(crate) enum UndoOp {
    Insert {
        table: String,
        rowid: u64,
        next_rowid: u64,
        last_auto: i64,
    },
    Update {
        table: String,
        rowid: u64,
        previous: Row,
    },
    Delete {
        table: String,
        rowid: u64,
        row: Row,
    },
    CreateTable {
        table: String,
    },
    DropTable {
        table: String,
        previous: Table,
    },
}

/// Replay undo entries newest first.
pub(crate) fn rollback(tables: &mut dyn TableSet, undo: Vec<UndoOp>) {
    for op in undo.into_iter().rev() {
        match op {
            UndoOp::Insert {
                table,
                rowid,
                next_rowid,
                last_auto,
            } => {
                if let Some(t) = tables.table_mut(&table) {
                    t.rows.remove(&rowid);
                    t.next_rowid = next_rowid;
                    t.last_auto = last_auto;
                }
            }
            UndoOp::Update {
                table,
                rowid,
                previous: row,
            }
            | UndoOp::Delete { table, rowid, row } => {
                if let Some(t) = tables.table_mut(&table) {
                    t.rows.insert(rowid, row);
                }
            }
            UndoOp::CreateTable { table } => {
                tables.drop_table(&table);
            }
            UndoOp::DropTable { table, previous } => tables.create_table(&table, previous),
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Column(String),
    Negate(Box<Expr>),
    Arith(Box<Expr>, ArithOp, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
}

impl Expr {
    fn columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Literal(_) => {}
            Self::Column(name) => out.push(name),
            Self::Negate(e) | Self::Not(e) | Self::IsNull { expr: e, .. } => e.columns(out),
            Self::Arith(a, _, b) | Self::Compare(a, _, b) | Self::And(a, b) | Self::Or(a, b) => {
                a.columns(out);
                b.columns(out);
            }
            Self::InList { expr, list, .. } => {
                expr.columns(out);
                list.iter().for_each(|e| e.columns(out));
            }
            Self::Like { expr, pattern, .. } => {
                expr.columns(out);
                pattern.columns(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Projection {
    All,
    Columns(Vec<(String, String)>), // (source, output name)
    Count(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Select {
    pub(crate) table: String,
    pub(crate) projection: Projection,
    pub(crate) filter: Option<Expr>,
    pub(crate) order_by: Vec<(String, SortOrder)>,
    pub(crate) limit: Option<usize>,
    pub(crate) offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    CreateTable {
        name: String,
        if_not_exists: bool,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    Select(Select),
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Option<Expr>,
    },
    Delete {
        table: String,
        filter: Option<Expr>,
    },
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Str(String),
    Number(String),
    Positional,
    Numbered(usize),
    Symbol(&'static str),
}

const SYMBOLS: [&str; 17] = [
    "<=", ">=", "<>", "!=", "==", "(", ")", ",", ";", "*", "=", "<", ">", "+", "-", "/", ".",
];

fn tokenize(sql: &str) -> CloudResult<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '\'' {
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(CloudError::validation("unterminated string literal")),
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        text.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
        } else if c == '"' || c == '`' {
            let end = chars[i + 1..]
                .iter()
                .position(|ch| *ch == c)
                .ok_or_else(|| CloudError::validation("unterminated quoted identifier"))?;
            tokens.push(Token::Quoted(chars[i + 1..i + 1 + end].iter().collect()));
            i += end + 2;
        } else if c == '?' {
            tokens.push(Token::Positional);
            i += 1;
        } else if c == '$' {
            let start = i + 1;
            i = start;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let n: usize = chars[start..i]
                .iter()
                .collect::<String>()
                .parse()
                .map_err(|_| CloudError::validation("expected a parameter number after '$'"))?;
            if n == 0 {
                return Err(CloudError::validation("parameter numbers start at $1"));
            }
            tokens.push(Token::Numbered(n));
        } else if c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit))
        {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                i += 1;
                if i < chars.len() && matches!(chars[i], '+' | '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let symbol = SYMBOLS
                .iter()
                .find(|s| rest.starts_with(**s))
                .ok_or_else(|| CloudError::validation(format!("unexpected character {c:?}")))?;
            tokens.push(Token::Symbol(symbol));
            i += symbol.len();
        }
    }
    Ok(tokens)
}

/// Split a script on `;` outside string literals and quoted identifiers.
pub(crate) fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        match (quote, c) {
            (None, '\'' | '"' | '`') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, ';') => {
                statements.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    statements.push(&sql[start..]);
    statements
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a [Value],
    positional: usize,
    numbered: usize,
}

/// Parse one statement and bind its parameters.
pub(crate) fn parse(sql: &str, params: &[Value]) -> CloudResult<Statement> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
        params,
        positional: 0,
        numbered: 0,
    };
    let statement = parser.statement()?;
    parser.eat_symbol(";");
    if let Some(token) = parser.peek() {
        return Err(CloudError::validation(format!(
            "unexpected trailing input near {token:?}"
        )));
    }
    let used = parser.positional.max(parser.numbered);
    if used != params.len() {
        return Err(CloudError::validation(format!(
            "statement uses {used} parameter(s) but {} were supplied",
            params.len()
        )));
    }
    Ok(statement)
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, expected: &str) -> CloudError {
        match self.peek() {
            Some(token) => CloudError::validation(format!("expected {expected} near {token:?}")),
            None => CloudError::validation(format!("expected {expected} at end of statement")),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.peek_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> CloudResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(keyword))
        }
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        let found = matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_symbol(&mut self, symbol: &str) -> CloudResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.error(&format!("'{symbol}'")))
        }
    }

    fn identifier(&mut self) -> CloudResult<String> {
        match self.peek() {
            Some(Token::Word(w) | Token::Quoted(w)) => {
                let name = w.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("identifier")),
        }
    }

    /// Column reference, possibly qualified (`t.col`); the qualifier is dropped.
    fn column_name(&mut self) -> CloudResult<String> {
        let mut name = self.identifier()?;
        while self.eat_symbol(".") {
            name = self.identifier()?;
        }
        Ok(name)
    }

    fn comma_separated<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> CloudResult<T>,
    ) -> CloudResult<Vec<T>> {
        let mut items = vec![item(self)?];
        while self.eat_symbol(",") {
            items.push(item(self)?);
        }
        Ok(items)
    }

    fn statement(&mut self) -> CloudResult<Statement> {
        if self.eat_keyword("CREATE") {
            self.create_table()
        } else if self.eat_keyword("DROP") {
            self.expect_keyword("TABLE")?;
            let if_exists = self.eat_keyword("IF");
            if if_exists {
                self.expect_keyword("EXISTS")?;
            }
            Ok(Statement::DropTable {
                name: self.identifier()?,
                if_exists,
            })
        } else if self.eat_keyword("INSERT") {
            self.insert()
        } else if self.eat_keyword("SELECT") {
            self.select().map(Statement::Select)
        } else if self.eat_keyword("UPDATE") {
            self.update()
        } else if self.eat_keyword("DELETE") {
            self.expect_keyword("FROM")?;
            let table = self.identifier()?;
            Ok(Statement::Delete {
                table,
                filter: self.where_clause()?,
            })
        } else {
            Err(self.error("CREATE, DROP, INSERT, SELECT, UPDATE or DELETE"))
        }
    }

    fn create_table(&mut self) -> CloudResult<Statement> {
        self.expect_keyword("TABLE")?;
        let if_not_exists = self.eat_keyword("IF");
        if if_not_exists {
            self.expect_keyword("NOT")?;
            self.expect_keyword("EXISTS")?;
        }
        let name = self.identifier()?;
        self.expect_symbol("(")?;

        let mut columns: Vec<ColumnDef> = Vec::new();
        loop {
            if self.eat_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                self.expect_symbol("(")?;
                let key = self.identifier()?;
                self.expect_symbol(")")?;
                let column = columns
                    .iter_mut()
                    .find(|c| c.name == key)
                    .ok_or_else(|| CloudError::validation(format!("no such column: {key}")))?;
                column.primary_key = true;
            } else if self.eat_keyword("UNIQUE") {
                self.expect_symbol("(")?;
                let key = self.identifier()?;
                self.expect_symbol(")")?;
                let column = columns
                    .iter_mut()
                    .find(|c| c.name == key)
                    .ok_or_else(|| CloudError::validation(format!("no such column: {key}")))?;
                column.unique = true;
            } else {
                columns.push(self.column_def()?);
            }
            if !self.eat_symbol(",") {
                break;
            }
        }
        self.expect_symbol(")")?;

        Ok(Statement::CreateTable {
            name,
            if_not_exists,
            columns,
        })
    }

    fn column_def(&mut self) -> CloudResult<ColumnDef> {
        let name = self.identifier()?;
        let type_name = self.identifier()?.to_ascii_uppercase();
        let ty = match type_name.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "SMALLINT" | "SERIAL" => ColumnType::Integer,
            "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" | "DECIMAL" => {
                self.eat_keyword("PRECISION");
                ColumnType::Real
            }
            "TEXT" | "VARCHAR" | "CHAR" | "STRING" | "UUID" | "TIMESTAMP" | "DATE"
            | "DATETIME" => ColumnType::Text,
            "BOOLEAN" | "BOOL" => ColumnType::Boolean,
            "JSON" | "JSONB" => ColumnType::Json,
            other => return Err(CloudError::validation(format!("unsupported column type {other}"))),
        };
        if self.eat_symbol("(") {
            // Length and precision arguments are accepted and ignored.
            while !self.eat_symbol(")") {
                if self.advance().is_none() {
                    return Err(self.error("')'"));
                }
            }
        }

        let mut column = ColumnDef {
            name,
            ty,
            primary_key: false,
            not_null: false,
            unique: false,
            default: None,
        };
        loop {
            if self.eat_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                column.primary_key = true;
            } else if self.eat_keyword("NOT") {
                self.expect_keyword("NULL")?;
                column.not_null = true;
            } else if self.eat_keyword("NULL") {
                column.not_null = false;
            } else if self.eat_keyword("UNIQUE") {
                column.unique = true;
            } else if self.eat_keyword("AUTOINCREMENT") || self.eat_keyword("AUTO_INCREMENT") {
                if !column.auto_assigned() {
                    return Err(CloudError::validation(
                        "AUTOINCREMENT is only allowed on an INTEGER PRIMARY KEY",
                    ));
                }
            } else if self.eat_keyword("DEFAULT") {
                column.default = Some(match self.unary()? {
                    Expr::Literal(value) => value,
                    _ => return Err(CloudError::validation("DEFAULT must be a literal")),
                });
            } else {
                break;
            }
        }
        Ok(column)
    }

    fn insert(&mut self) -> CloudResult<Statement> {
        self.expect_keyword("INTO")?;
        let table = self.identifier()?;
        let columns = if self.eat_symbol("(") {
            let names = self.comma_separated(Self::identifier)?;
            self.expect_symbol(")")?;
            Some(names)
        } else {
            None
        };
        self.expect_keyword("VALUES")?;
        let rows = self.comma_separated(|p| {
            p.expect_symbol("(")?;
            let values = p.comma_separated(Self::expr)?;
            p.expect_symbol(")")?;
            Ok(values)
        })?;
        Ok(Statement::Insert {
            table,
            columns,
            rows,
        })
    }

    fn select(&mut self) -> CloudResult<Select> {
        let projection = if self.eat_symbol("*") {
            Projection::All
        } else if self.peek_keyword("COUNT") {
            self.pos += 1;
            self.expect_symbol("(")?;
            self.expect_symbol("*")?;
            self.expect_symbol(")")?;
            let alias = if self.eat_keyword("AS") {
                self.identifier()?
            } else {
                "count".to_string()
            };
            Projection::Count(alias)
        } else {
            Projection::Columns(self.comma_separated(|p| {
                let source = p.column_name()?;
                let output = if p.eat_keyword("AS") {
                    p.identifier()?
                } else {
                    source.clone()
                };
                Ok((source, output))
            })?)
        };
        self.expect_keyword("FROM")?;
        let table = self.identifier()?;
        let filter = self.where_clause()?;

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            order_by = self.comma_separated(|p| {
                let column = p.column_name()?;
                let order = if p.eat_keyword("DESC") {
                    SortOrder::Descending
                } else {
                    p.eat_keyword("ASC");
                    SortOrder::Ascending
                };
                Ok((column, order))
            })?;
        }

        let mut limit = None;
        let mut offset = 0;
        if self.eat_keyword("LIMIT") {
            limit = Some(self.count_literal()?);
            if self.eat_keyword("OFFSET") {
                offset = self.count_literal()?;
            }
        }

        Ok(Select {
            table,
            projection,
            filter,
            order_by,
            limit,
            offset,
        })
    }

    fn count_literal(&mut self) -> CloudResult<usize> {
        match self.unary()? {
            Expr::Literal(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| CloudError::validation("LIMIT and OFFSET must be non-negative integers")),
            _ => Err(CloudError::validation("LIMIT and OFFSET must be integer literals or parameters")),
        }
    }

    fn update(&mut self) -> CloudResult<Statement> {
        let table = self.identifier()?;
        self.expect_keyword("SET")?;
        let assignments = self.comma_separated(|p| {
            let column = p.column_name()?;
            p.expect_symbol("=")?;
            Ok((column, p.expr()?))
        })?;
        Ok(Statement::Update {
            table,
            assignments,
            filter: self.where_clause()?,
        })
    }

    fn where_clause(&mut self) -> CloudResult<Option<Expr>> {
        if self.eat_keyword("WHERE") {
            self.expr().map(Some)
        } else {
            Ok(None)
        }
    }

    fn expr(&mut self) -> CloudResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("OR") {
            left = Expr::Or(Box::new(left), Box::new(self.and_expr()?));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> CloudResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("AND") {
            left = Expr::And(Box::new(left), Box::new(self.not_expr()?));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> CloudResult<Expr> {
        if self.eat_keyword("NOT") {
            Ok(Expr::Not(Box::new(self.not_expr()?)))
        } else {
            self.predicate()
        }
    }

    fn predicate(&mut self) -> CloudResult<Expr> {
        let left = self.additive()?;

        let op = match self.peek() {
            Some(Token::Symbol("=" | "==")) => Some(CmpOp::Eq),
            Some(Token::Symbol("!=" | "<>")) => Some(CmpOp::Ne),
            Some(Token::Symbol("<")) => Some(CmpOp::Lt),
            Some(Token::Symbol("<=")) => Some(CmpOp::Le),
            Some(Token::Symbol(">")) => Some(CmpOp::Gt),
            Some(Token::Symbol(">=")) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let right = self.additive()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("IN") {
            self.expect_symbol("(")?;
            let list = self.comma_separated(Self::additive)?;
            self.expect_symbol(")")?;
            Ok(Expr::InList {
                expr: Box::new(left),
                list,
                negated,
            })
        } else if self.eat_keyword("LIKE") {
            Ok(Expr::Like {
                expr: Box::new(left),
                pattern: Box::new(self.additive()?),
                negated,
            })
        } else if self.eat_keyword("BETWEEN") {
            let low = self.additive()?;
            self.expect_keyword("AND")?;
            let high = self.additive()?;
            let between = Expr::And(
                Box::new(Expr::Compare(Box::new(left.clone()), CmpOp::Ge, Box::new(low))),
                Box::new(Expr::Compare(Box::new(left), CmpOp::Le, Box::new(high))),
            );
            Ok(if negated {
                Expr::Not(Box::new(between))
            } else {
                between
            })
        } else if negated {
            Err(self.error("IN, LIKE or BETWEEN after NOT"))
        } else {
            Ok(left)
        }
    }

    fn additive(&mut self) -> CloudResult<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_symbol("+") {
                ArithOp::Add
            } else if self.eat_symbol("-") {
                ArithOp::Sub
            } else {
                return Ok(left);
            };
            left = Expr::Arith(Box::new(left), op, Box::new(self.multiplicative()?));
        }
    }

    fn multiplicative(&mut self) -> CloudResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_symbol("*") {
                ArithOp::Mul
            } else if self.eat_symbol("/") {
                ArithOp::Div
            } else {
                return Ok(left);
            };
            left = Expr::Arith(Box::new(left), op, Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> CloudResult<Expr> {
        if self.eat_symbol("-") {
            return Ok(match self.unary()? {
                Expr::Literal(Value::Number(n)) => Expr::Literal(negate_number(&n)?),
                other => Expr::Negate(Box::new(other)),
            });
        }
        if self.eat_symbol("(") {
            let inner = self.expr()?;
            self.expect_symbol(")")?;
            return Ok(inner);
        }

        match self.peek().cloned() {
            Some(Token::Number(text)) => {
                self.pos += 1;
                parse_number(&text).map(Expr::Literal)
            }
            Some(Token::Str(text)) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::String(text)))
            }
            Some(Token::Positional) => {
                self.pos += 1;
                self.positional += 1;
                self.bind(self.positional)
            }
            Some(Token::Numbered(n)) => {
                self.pos += 1;
                self.numbered = self.numbered.max(n);
                self.bind(n)
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("NULL") => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Null))
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("TRUE") => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("FALSE") => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Some(Token::Word(_) | Token::Quoted(_)) => self.column_name().map(Expr::Column),
            _ => Err(self.error("expression")),
        }
    }

    fn bind(&self, n: usize) -> CloudResult<Expr> {
        self.params
            .get(n - 1)
            .cloned()
            .map(Expr::Literal)
            .ok_or_else(|| {
                CloudError::validation(format!(
                    "missing parameter {n} ({} supplied)",
                    self.params.len()
                ))
            })
    }
}

fn parse_number(text: &str) -> CloudResult<Value> {
    let invalid = || CloudError::validation(format!("invalid number literal {text}"));
    if text.contains(['.', 'e', 'E']) {
        let f: f64 = text.parse().map_err(|_| invalid())?;
        Number::from_f64(f).map(Value::Number).ok_or_else(invalid)
    } else {
        text.parse::<i64>().map(Value::from).map_err(|_| invalid())
    }
}

fn negate_number(n: &Number) -> CloudResult<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::from(-i));
    }
    n.as_f64()
        .and_then(|f| Number::from_f64(-f))
        .map(Value::Number)
        .ok_or_else(|| CloudError::validation(format!("cannot negate {n}")))
}

// ============================================================================
// Evaluation
// ============================================================================

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|f| f != 0.0)),
        _ => Some(true),
    }
}

fn bool_value(value: Option<bool>) -> Value {
    value.map_or(Value::Null, Value::Bool)
}

fn arithmetic(a: &Value, op: ArithOp, b: &Value) -> CloudResult<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(CloudError::validation(format!(
            "arithmetic requires numbers, got {a} and {b}"
        )));
    };
    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        let result = match op {
            ArithOp::Add => x.checked_add(y),
            ArithOp::Sub => x.checked_sub(y),
            ArithOp::Mul => x.checked_mul(y),
            ArithOp::Div if y == 0 => return Ok(Value::Null),
            ArithOp::Div => x.checked_div(y),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| CloudError::validation("integer overflow"));
    }
    let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
    let result = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div if y == 0.0 => return Ok(Value::Null),
        ArithOp::Div => x / y,
    };
    Ok(Number::from_f64(result).map_or(Value::Null, Value::Number))
}

fn like(value: &str, pattern: &str) -> CloudResult<bool> {
    let mut regex = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    let compiled = RegexBuilder::new(&regex)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| CloudError::validation(format!("invalid LIKE pattern: {e}")))?;
    Ok(compiled.is_match(value))
}

pub(crate) fn eval(expr: &Expr, row: &Row) -> CloudResult<Value> {
    Ok(match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Column(name) => row
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::validation(format!("no such column: {name}")))?,
        Expr::Negate(inner) => match eval(inner, row)? {
            Value::Null => Value::Null,
            Value::Number(n) => negate_number(&n)?,
            other => return Err(CloudError::validation(format!("cannot negate {other}"))),
        },
        Expr::Arith(a, op, b) => arithmetic(&eval(a, row)?, *op, &eval(b, row)?)?,
        Expr::Compare(a, op, b) => {
            let (a, b) = (eval(a, row)?, eval(b, row)?);
            if a.is_null() || b.is_null() {
                Value::Null
            } else {
                Value::Bool(match op {
                    CmpOp::Eq => values_equal(&a, &b),
                    CmpOp::Ne => !values_equal(&a, &b),
                    CmpOp::Lt => compare(&a, &b) == Some(Ordering::Less),
                    CmpOp::Le => compare(&a, &b).is_some_and(Ordering::is_le),
                    CmpOp::Gt => compare(&a, &b) == Some(Ordering::Greater),
                    CmpOp::Ge => compare(&a, &b).is_some_and(Ordering::is_ge),
                })
            }
        }
        Expr::And(a, b) => {
            let (a, b) = (truth(&eval(a, row)?), truth(&eval(b, row)?));
            bool_value(match (a, b) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            })
        }
        Expr::Or(a, b) => {
            let (a, b) = (truth(&eval(a, row)?), truth(&eval(b, row)?));
            bool_value(match (a, b) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            })
        }
        Expr::Not(inner) => bool_value(truth(&eval(inner, row)?).map(|b| !b)),
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let value = eval(expr, row)?;
            if value.is_null() {
                Value::Null
            } else {
                let mut found = false;
                for candidate in list {
                    found |= values_equal(&value, &eval(candidate, row)?);
                }
                Value::Bool(found != *negated)
            }
        }
        Expr::IsNull { expr, negated } => Value::Bool(eval(expr, row)?.is_null() != *negated),
        Expr::Like {
            expr,
            pattern,
            negated,
        } => match (eval(expr, row)?, eval(pattern, row)?) {
            (Value::String(value), Value::String(pattern)) => {
                Value::Bool(like(&value, &pattern)? != *negated)
            }
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            _ => return Err(CloudError::validation("LIKE requires text operands")),
        },
    })
}

fn row_matches(filter: Option<&Expr>, row: &Row) -> CloudResult<bool> {
    match filter {
        None => Ok(true),
        Some(expr) => Ok(truth(&eval(expr, row)?) == Some(true)),
    }
}

fn check_columns(table: &Table, name: &str, expr: Option<&Expr>) -> CloudResult<()> {
    if let Some(expr) = expr {
        let mut referenced = Vec::new();
        expr.columns(&mut referenced);
        for column in referenced {
            table.require_column(name, column)?;
        }
    }
    Ok(())
}

fn missing_table(name: &str) -> CloudError {
    CloudError::not_found(ResourceId::new("table", name))
}

// ============================================================================
// Execution
// ============================================================================

/// Run a `SELECT`.
pub(crate) fn run_query(tables: &dyn TableSet, select: &Select) -> CloudResult<Vec<Row>> {
    let table = tables
        .table(&select.table)
        .ok_or_else(|| missing_table(&select.table))?;
    check_columns(table, &select.table, select.filter.as_ref())?;
    for (column, _) in &select.order_by {
        table.require_column(&select.table, column)?;
    }
    if let Projection::Columns(columns) = &select.projection {
        for (source, _) in columns {
            table.require_column(&select.table, source)?;
        }
    }

    let mut rows = Vec::new();
    for row in table.rows.values() {
        if row_matches(select.filter.as_ref(), row)? {
            rows.push(row);
        }
    }

    if let Projection::Count(alias) = &select.projection {
        let mut result = Row::new();
        result.insert(alias.clone(), Value::from(rows.len() as u64));
        return Ok(vec![result]);
    }

    if !select.order_by.is_empty() {
        rows.sort_by(|a, b| {
            select
                .order_by
                .iter()
                .map(|(column, order)| sort_order(a.get(column), b.get(column), *order))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        });
    }

    let rows = rows
        .into_iter()
        .skip(select.offset)
        .take(select.limit.unwrap_or(usize::MAX));
    Ok(match &select.projection {
        Projection::Columns(columns) => rows
            .map(|row| {
                columns
                    .iter()
                    .map(|(source, output)| {
                        (output.clone(), row.get(source).cloned().unwrap_or(Value::Null))
                    })
                    .collect()
            })
            .collect(),
        _ => rows.cloned().collect(),
    })
}

/// Run a write statement as one atomic unit, appending its undo entries to `log` on success.
pub(crate) fn execute_atomic(
    tables: &mut dyn TableSet,
    statement: Statement,
    log: &mut Vec<UndoOp>,
) -> CloudResult<ExecuteResult> {
    let mut undo = Vec::new();
    match run_write(tables, statement, &mut undo) {
        Ok(result) => {
            log.extend(undo);
            Ok(result)
        }
        Err(err) => {
            rollback(tables, undo);
            Err(err)
        }
    }
}

fn run_write(
    tables: &mut dyn TableSet,
    statement: Statement,
    undo: &mut Vec<UndoOp>,
) -> CloudResult<ExecuteResult> {
    match statement {
        Statement::Select(_) => Err(CloudError::validation(
            "SELECT is read-only; use query instead of execute",
        )),
        Statement::CreateTable {
            name,
            if_not_exists,
            columns,
        } => create_table(tables, name, if_not_exists, columns, undo),
        Statement::DropTable { name, if_exists } => match tables.drop_table(&name) {
            Some(previous) => {
                undo.push(UndoOp::DropTable {
                    table: name,
                    previous,
                });
                Ok(ExecuteResult::default())
            }
            None if if_exists => Ok(ExecuteResult::default()),
            None => Err(missing_table(&name)),
        },
        Statement::Insert {
            table,
            columns,
            rows,
        } => insert(tables, &table, columns, rows, undo),
        Statement::Update {
            table,
            assignments,
            filter,
        } => update(tables, &table, &assignments, filter.as_ref(), undo),
        Statement::Delete { table, filter } => delete(tables, &table, filter.as_ref(), undo),
    }
}

fn create_table(
    tables: &mut dyn TableSet,
    name: String,
    if_not_exists: bool,
    columns: Vec<ColumnDef>,
    undo: &mut Vec<UndoOp>,
) -> CloudResult<ExecuteResult> {
    if tables.table(&name).is_some() {
        if if_not_exists {
            return Ok(ExecuteResult::default());
        }
        return Err(CloudError::already_exists(ResourceId::new("table", &name)));
    }
    if columns.iter().filter(|c| c.primary_key).count() > 1 {
        return Err(CloudError::validation("only one PRIMARY KEY column is supported"));
    }
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].iter().any(|c| c.name == column.name) {
            return Err(CloudError::validation(format!(
                "duplicate column name: {}",
                column.name
            )));
        }
    }
    tables.create_table(&name, Table::new(columns));
    undo.push(UndoOp::CreateTable { table: name });
    Ok(ExecuteResult::default())
}

fn insert(
    tables: &mut dyn TableSet,
    name: &str,
    columns: Option<Vec<String>>,
    rows: Vec<Vec<Expr>>,
    undo: &mut Vec<UndoOp>,
) -> CloudResult<ExecuteResult> {
    let table = tables.table_mut(name).ok_or_else(|| missing_table(name))?;
    let targets = match columns {
        Some(columns) => {
            for column in &columns {
                table.require_column(name, column)?;
            }
            columns
        }
        None => table.columns.iter().map(|c| c.name.clone()).collect(),
    };

    let mut result = ExecuteResult::default();
    let empty = Row::new();
    for values in rows {
        if values.len() != targets.len() {
            return Err(CloudError::validation(format!(
                "{} values for {} columns",
                values.len(),
                targets.len()
            )));
        }

        let mut row: Row = table
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.default.clone().unwrap_or(Value::Null)))
            .collect();
        for (column, expr) in targets.iter().zip(&values) {
            row.insert(column.clone(), eval(expr, &empty)?);
        }

        let (next_rowid, last_auto) = (table.next_rowid, table.last_auto);
        let key_column = table
            .columns
            .iter()
            .find(|c| c.auto_assigned())
            .map(|c| c.name.clone());
        if let Some(key) = &key_column
            && row.get(key).is_none_or(Value::is_null)
        {
            row.insert(key.clone(), Value::from(table.last_auto + 1));
        }
        table.check_row(name, &mut row, None)?;
        // Read the key back after coercion so explicit `2.0` counts as 2.
        let auto_id = key_column
            .as_ref()
            .and_then(|key| row.get(key))
            .and_then(Value::as_i64);
        if let Some(id) = auto_id {
            table.last_auto = table.last_auto.max(id);
            result.last_insert_id = Some(id);
        }

        let rowid = table.next_rowid;
        table.next_rowid += 1;
        table.rows.insert(rowid, row);
        undo.push(UndoOp::Insert {
            table: name.to_string(),
            rowid,
            next_rowid,
            last_auto,
        });
        result.rows_affected += 1;
    }
    Ok(result)
}

fn update(
    tables: &mut dyn TableSet,
    name: &str,
    assignments: &[(String, Expr)],
    filter: Option<&Expr>,
    undo: &mut Vec<UndoOp>,
) -> CloudResult<ExecuteResult> {
    let table = tables.table_mut(name).ok_or_else(|| missing_table(name))?;
    check_columns(table, name, filter)?;
    for (column, expr) in assignments {
        table.require_column(name, column)?;
        check_columns(table, name, Some(expr))?;
    }

    let mut targets = Vec::new();
    for (rowid, row) in &table.rows {
        if row_matches(filter, row)? {
            targets.push(*rowid);
        }
    }

    for rowid in &targets {
        let Some(previous) = table.rows.get(rowid).cloned() else {
            continue;
        };
        let mut updated = previous.clone();
        for (column, expr) in assignments {
            updated.insert(column.clone(), eval(expr, &previous)?);
        }
        table.check_row(name, &mut updated, Some(*rowid))?;
        table.rows.insert(*rowid, updated);
        undo.push(UndoOp::Update {
            table: name.to_string(),
            rowid: *rowid,
            previous,
        });
    }
    Ok(ExecuteResult {
        rows_affected: targets.len() as u64,
        last_insert_id: None,
    })
}

fn delete(
    tables: &mut dyn TableSet,
    name: &str,
    filter: Option<&Expr>,
    undo: &mut Vec<UndoOp>,
) -> CloudResult<ExecuteResult> {
    let table = tables.table_mut(name).ok_or_else(|| missing_table(name))?;
    check_columns(table, name, filter)?;

    let mut targets = Vec::new();
    for (rowid, row) in &table.rows {
        if row_matches(filter, row)? {
            targets.push(*rowid);
        }
    }
    for rowid in &targets {
        if let Some(row) = table.rows.remove(rowid) {
            undo.push(UndoOp::Delete {
                table: name.to_string(),
                rowid: *rowid,
                row,
            });
        }
    }
    Ok(ExecuteResult {
        rows_affected: targets.len() as u64,
        last_insert_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ErrorKind;
    use serde_json::json;

    fn exec(tables: &mut BTreeMap<String, Table>, sql: &str, params: &[Value]) -> CloudResult<ExecuteResult> {
        let statement = parse(sql, params)?;
        execute_atomic(tables, statement, &mut Vec::new())
    }

    fn query(tables: &BTreeMap<String, Table>, sql: &str, params: &[Value]) -> CloudResult<Vec<Row>> {
        match parse(sql, params)? {
            Statement::Select(select) => run_query(tables, &select),
            other => panic!("not a select: {other:?}"),
        }
    }

    fn users() -> BTreeMap<String, Table> {
        let mut tables = BTreeMap::new();
        exec(
            &mut tables,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE, age INT, active BOOLEAN DEFAULT TRUE)",
            &[],
        )
        .unwrap();
        exec(
            &mut tables,
            "INSERT INTO users (email, age) VALUES ('ada@example.com', 36), ('alan@example.com', 41), ('grace@example.com', NULL)",
            &[],
        )
        .unwrap();
        tables
    }

    #[test]
    fn tokenizes_literals_and_symbols() {
        let tokens = tokenize("SELECT 'it''s', 1.5e3 FROM t WHERE a <= $2 -- trailing").unwrap();
        assert!(tokens.contains(&Token::Str("it's".to_string())));
        assert!(tokens.contains(&Token::Number("1.5e3".to_string())));
        assert!(tokens.contains(&Token::Symbol("<=")));
        assert!(tokens.contains(&Token::Numbered(2)));
        assert_eq!(tokens.len(), 10);
    }

    #[test]
    fn autoincrement_and_defaults() {
        let tables = users();
        let rows = query(&tables, "SELECT id, active FROM users ORDER BY id", &[]).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
        assert!(rows.iter().all(|r| r["active"] == json!(true)));
    }

    #[test]
    fn where_clauses() {
        let tables = users();
        let count = |sql: &str, params: &[Value]| query(&tables, sql, params).unwrap().len();

        assert_eq!(count("SELECT * FROM users WHERE age > ?", &[json!(40)]), 1);
        assert_eq!(count("SELECT * FROM users WHERE age IS NULL", &[]), 1);
        assert_eq!(count("SELECT * FROM users WHERE age IN (36, 41) AND NOT email LIKE 'a%'", &[]), 0);
        assert_eq!(count("SELECT * FROM users WHERE email LIKE '%EXAMPLE.com'", &[]), 3);
        assert_eq!(count("SELECT * FROM users WHERE age BETWEEN 30 AND 40 OR id = $1", &[json!(3)]), 2);
        // NULL never satisfies a comparison, not even a negated one
        assert_eq!(count("SELECT * FROM users WHERE NOT age > 100", &[]), 2);
    }

    #[test]
    fn count_order_limit_offset() {
        let tables = users();
        let rows = query(&tables, "SELECT COUNT(*) AS n FROM users WHERE age IS NOT NULL", &[]).unwrap();
        assert_eq!(rows[0]["n"], json!(2));

        let rows = query(&tables, "SELECT email AS who FROM users ORDER BY age DESC LIMIT 1 OFFSET 1", &[]).unwrap();
        assert_eq!(rows, vec![Row::from([("who".to_string(), json!("ada@example.com"))])]);
    }

    #[test]
    fn constraints() {
        let mut tables = users();
        let err = exec(&mut tables, "INSERT INTO users (email) VALUES ('ada@example.com')", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        let err = exec(&mut tables, "INSERT INTO users (age) VALUES (3)", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        let err = exec(&mut tables, "INSERT INTO users (email, age) VALUES ('x@example.com', 'old')", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        let err = exec(&mut tables, "INSERT INTO missing VALUES (1)", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn failing_statement_is_undone() {
        let mut tables = users();
        let before = tables.clone();

        // Second row collides with an existing email after the first was inserted.
        let err = exec(
            &mut tables,
            "INSERT INTO users (email) VALUES ('new@example.com'), ('alan@example.com')",
            &[],
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(tables, before);

        let err = exec(&mut tables, "UPDATE users SET email = 'same@example.com'", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(tables, before);
    }

    #[test]
    fn update_with_arithmetic_and_delete() {
        let mut tables = users();
        let result = exec(&mut tables, "UPDATE users SET age = age + 1 WHERE age IS NOT NULL", &[]).unwrap();
        assert_eq!(result.rows_affected, 2);
        let rows = query(&tables, "SELECT age FROM users WHERE id = 1", &[]).unwrap();
        assert_eq!(rows[0]["age"], json!(37));

        let result = exec(&mut tables, "DELETE FROM users WHERE email LIKE 'g%'", &[]).unwrap();
        assert_eq!(result.rows_affected, 1);
        let next = exec(&mut tables, "INSERT INTO users (email) VALUES (?)", &[json!("z@example.com")]).unwrap();
        assert_eq!(next.last_insert_id, Some(4));
    }

    #[test]
    fn parameter_count_must_match() {
        assert!(parse("SELECT * FROM t WHERE a = ?", &[]).is_err());
        assert!(parse("SELECT * FROM t WHERE a = ?", &[json!(1), json!(2)]).is_err());
        assert!(parse("SELECT * FROM t WHERE a = $2 OR b = $1", &[json!(1), json!(2)]).is_ok());
    }

    #[test]
    fn rejects_malformed_sql() {
        for sql in ["SELEC * FROM t", "SELECT * FROM", "INSERT INTO t VALUES (1", "SELECT * FROM t WHERE"] {
            let err = parse(sql, &[]).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Validation, "{sql}");
        }
        let mut tables = users();
        let err = exec(&mut tables, "SELECT * FROM users", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        let err = query(&tables, "SELECT nope FROM users", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn splits_scripts_outside_literals() {
        let parts = split_statements("CREATE TABLE a (x TEXT); INSERT INTO a VALUES ('1;2');\n");
        assert_eq!(parts, vec!["CREATE TABLE a (x TEXT)", "INSERT INTO a VALUES ('1;2')"]);
    }
}
