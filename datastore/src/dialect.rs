//! Per-backend SQL idioms: placeholder schemes, identifier quoting, paging,
//! and the function/operator translations the SQL generator consults while
//! walking a parse tree. One `Dialect` value is constructed at provider
//! setup and then shared read-only for the life of the process.

use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    MySql,
    Postgres,
    Oracle,
    /// ANSI-ish fallback used when no specific backend driver is configured
    /// (e.g. for the in-memory evaluator's SQL-text debug rendering).
    Default,
}

impl Dialect {
    pub fn from_driver_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Dialect::MySql,
            "postgres" | "postgresql" | "pg" => Dialect::Postgres,
            "oracle" | "oci" => Dialect::Oracle,
            _ => Dialect::Default,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Dialect::MySql => "MySQL",
            Dialect::Postgres => "PostgreSQL",
            Dialect::Oracle => "Oracle",
            Dialect::Default => "Default",
        }
    }

    /// Appends the placeholder for the `index`-th (1-based) bound parameter.
    pub fn write_placeholder(self, out: &mut String, index: usize) {
        match self {
            Dialect::MySql | Dialect::Default => out.push('?'),
            Dialect::Postgres => {
                let _ = write!(out, "${index}");
            }
            Dialect::Oracle => {
                let _ = write!(out, ":param{index}");
            }
        }
    }

    pub fn quote_identifier(self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
            Dialect::Postgres | Dialect::Default => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::Oracle => format!("\"{}\"", ident.replace('"', "\"\"").to_ascii_uppercase()),
        }
    }

    /// Renders `LIMIT`/`OFFSET` paging. `inner` is the already-built
    /// unpaged `SELECT ... FROM ... WHERE ... ORDER BY ...` statement body.
    pub fn render_paging(self, inner: &str, skip: Option<u64>, top: Option<u64>) -> String {
        match self {
            Dialect::MySql | Dialect::Postgres | Dialect::Default => {
                let mut sql = inner.to_string();
                if let Some(top) = top {
                    let _ = write!(sql, " LIMIT {top}");
                }
                if let Some(skip) = skip {
                    let _ = write!(sql, " OFFSET {skip}");
                }
                sql
            }
            Dialect::Oracle => {
                let skip = skip.unwrap_or(0);
                match top {
                    Some(top) if skip == 0 => {
                        format!("SELECT * FROM ({inner}) WHERE ROWNUM <= {top}")
                    }
                    Some(top) => format!(
                        "SELECT * FROM (SELECT ROWNUM rn, t.* FROM ({inner}) t) WHERE rn > {skip} AND rn <= {}",
                        skip + top
                    ),
                    None if skip > 0 => format!(
                        "SELECT * FROM (SELECT ROWNUM rn, t.* FROM ({inner}) t) WHERE rn > {skip}"
                    ),
                    None => inner.to_string(),
                }
            }
        }
    }

    /// Case-insensitive substring containment, e.g. for `contains(x,'y')`.
    pub fn ilike_contains(self, column_sql: &str, placeholder: &str) -> String {
        match self {
            Dialect::Postgres => format!("{column_sql} ILIKE {placeholder}"),
            Dialect::Oracle => format!("UPPER({column_sql}) LIKE UPPER({placeholder})"),
            Dialect::MySql | Dialect::Default => format!("LOWER({column_sql}) LIKE LOWER({placeholder})"),
        }
    }

    pub fn string_concat(self, lhs: &str, rhs: &str) -> String {
        match self {
            Dialect::Oracle => format!("({lhs} || {rhs})"),
            _ => format!("CONCAT({lhs}, {rhs})"),
        }
    }

    pub fn substring(self, value: &str, start: &str, len: Option<&str>) -> String {
        let fname = match self {
            Dialect::Oracle => "SUBSTR",
            _ => "SUBSTRING",
        };
        match len {
            Some(len) => format!("{fname}({value}, {start}, {len})"),
            None => format!("{fname}({value}, {start})"),
        }
    }

    pub fn datetime_extract(self, part: &str, value: &str) -> String {
        match self {
            Dialect::MySql => format!("{}({value})", part.to_ascii_uppercase()),
            _ => format!("EXTRACT({} FROM {value})", part.to_ascii_uppercase()),
        }
    }

    pub fn modulo(self, lhs: &str, rhs: &str) -> String {
        match self {
            Dialect::Oracle => format!("MOD({lhs}, {rhs})"),
            _ => format!("({lhs} % {rhs})"),
        }
    }

    pub fn current_timestamp(self) -> &'static str {
        match self {
            Dialect::Oracle => "SYSDATE",
            Dialect::Postgres => "NOW()",
            Dialect::MySql | Dialect::Default => "CURRENT_TIMESTAMP",
        }
    }

    pub fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_schemes_differ_per_dialect() {
        let mut s = String::new();
        Dialect::MySql.write_placeholder(&mut s, 1);
        assert_eq!(s, "?");
        let mut s = String::new();
        Dialect::Postgres.write_placeholder(&mut s, 3);
        assert_eq!(s, "$3");
        let mut s = String::new();
        Dialect::Oracle.write_placeholder(&mut s, 2);
        assert_eq!(s, ":param2");
    }

    #[test]
    fn oracle_paging_wraps_with_rownum() {
        let sql = Dialect::Oracle.render_paging("SELECT * FROM t", Some(10), Some(5));
        assert!(sql.contains("ROWNUM"));
        assert!(sql.contains("rn > 10"));
        assert!(sql.contains("rn <= 15"));
    }

    #[test]
    fn oracle_top_only_paging_uses_single_level_rownum() {
        let sql = Dialect::Oracle.render_paging("SELECT * FROM t", None, Some(5));
        assert_eq!(sql, "SELECT * FROM (SELECT * FROM t) WHERE ROWNUM <= 5");

        let sql = Dialect::Oracle.render_paging("SELECT * FROM t", Some(0), Some(5));
        assert_eq!(sql, "SELECT * FROM (SELECT * FROM t) WHERE ROWNUM <= 5");
    }

    #[test]
    fn mysql_paging_uses_limit_offset() {
        let sql = Dialect::MySql.render_paging("SELECT * FROM t", Some(10), Some(5));
        assert_eq!(sql, "SELECT * FROM t LIMIT 5 OFFSET 10");
    }

    #[test]
    fn only_postgres_supports_returning() {
        assert!(Dialect::Postgres.supports_returning());
        assert!(!Dialect::Oracle.supports_returning());
        assert!(!Dialect::MySql.supports_returning());
    }
}
