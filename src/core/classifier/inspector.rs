// src/core/classifier/inspector.rs

//! The SQL oracle consumed by the classifier.
//!
//! The proxy does not parse SQL grammar; it consults a `SqlInspector` for
//! statement semantics. `HeuristicInspector` is the built-in keyword-based
//! implementation; deployments embedding a full parser can inject their own.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use super::route_info::TypeMask;

/// Statement semantics produced by an inspector.
#[derive(Debug, Clone, Default)]
pub struct SqlInfo {
    pub type_mask: TypeMask,
    /// Table created by a CREATE TEMPORARY TABLE, db-qualified as written.
    pub created_tmp_table: Option<String>,
    /// Tables removed by a DROP TABLE.
    pub dropped_tables: Vec<String>,
    /// Tables the statement reads or writes.
    pub accessed_tables: Vec<String>,
}

/// The pluggable statement oracle.
pub trait SqlInspector: Send + Sync {
    fn classify(&self, sql: &str) -> SqlInfo;
}

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("static classifier regex")
}

static RE_CREATE_TMP: Lazy<Regex> =
    Lazy::new(|| ci(r"^\s*CREATE\s+TEMPORARY\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?`?([\w.]+)`?"));
static RE_DROP_TABLE: Lazy<Regex> =
    Lazy::new(|| ci(r"^\s*DROP\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+EXISTS\s+)?(.+)"));
static RE_BEGIN: Lazy<Regex> = Lazy::new(|| ci(r"^\s*(BEGIN|START\s+TRANSACTION)\b(.*)"));
static RE_SET_AUTOCOMMIT: Lazy<Regex> =
    Lazy::new(|| ci(r"^\s*SET\s+(?:@@(?:SESSION\.)?)?AUTOCOMMIT\s*(?::=|=)\s*(\S+)"));
static RE_SET_USERVAR: Lazy<Regex> = Lazy::new(|| ci(r"^\s*SET\s+@[A-Za-z0-9_]"));
static RE_SET_SYSVAR: Lazy<Regex> =
    Lazy::new(|| ci(r"^\s*SET\s+(GLOBAL|SESSION|@@)"));
static RE_SELECT_USERVAR: Lazy<Regex> = Lazy::new(|| ci(r"@[A-Za-z0-9_]+"));
static RE_SELECT_SYSVAR: Lazy<Regex> = Lazy::new(|| ci(r"@@[A-Za-z0-9_.]+"));
static RE_FOR_UPDATE: Lazy<Regex> =
    Lazy::new(|| ci(r"\b(FOR\s+UPDATE|LOCK\s+IN\s+SHARE\s+MODE)\s*;?\s*$"));
static RE_TABLES: Lazy<Regex> =
    Lazy::new(|| ci(r"\b(?:FROM|JOIN|INTO|UPDATE)\s+`?([\w.]+)`?"));
static RE_LOAD_DATA: Lazy<Regex> = Lazy::new(|| ci(r"^\s*LOAD\s+DATA\s+(LOCAL\s+)?INFILE\b"));

/// Keyword-based inspector. Deliberately conservative: anything it cannot
/// recognize is classified as a write so it lands on the master.
#[derive(Debug, Default)]
pub struct HeuristicInspector;

impl HeuristicInspector {
    fn first_word(sql: &str) -> String {
        sql.trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase()
    }

    fn collect_tables(sql: &str, out: &mut Vec<String>) {
        for cap in RE_TABLES.captures_iter(sql) {
            out.push(cap[1].to_string());
        }
    }
}

impl SqlInspector for HeuristicInspector {
    fn classify(&self, sql: &str) -> SqlInfo {
        let mut info = SqlInfo::default();
        let word = Self::first_word(sql);

        if let Some(cap) = RE_BEGIN.captures(sql) {
            info.type_mask |= TypeMask::BEGIN_TRX;
            let tail = cap[2].to_ascii_uppercase();
            if tail.contains("READ ONLY") {
                info.type_mask |= TypeMask::READ_ONLY_TRX;
            } else if tail.contains("READ WRITE") {
                info.type_mask |= TypeMask::READ_WRITE_TRX;
            }
            return info;
        }

        match word.as_str() {
            "COMMIT" => {
                info.type_mask |= TypeMask::COMMIT;
                return info;
            }
            "ROLLBACK" => {
                info.type_mask |= TypeMask::ROLLBACK;
                return info;
            }
            _ => {}
        }

        if let Some(cap) = RE_SET_AUTOCOMMIT.captures(sql) {
            let value = cap[1].trim_end_matches(';').to_ascii_uppercase();
            info.type_mask |= TypeMask::SESSION_WRITE;
            if value == "0" || value == "OFF" || value == "FALSE" {
                info.type_mask |= TypeMask::DISABLE_AUTOCOMMIT;
            } else {
                info.type_mask |= TypeMask::ENABLE_AUTOCOMMIT;
            }
            return info;
        }

        match word.as_str() {
            "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "HANDLER" => {
                info.type_mask |= TypeMask::READ;
                if RE_FOR_UPDATE.is_match(sql) {
                    info.type_mask |= TypeMask::WRITE;
                }
                if RE_SELECT_SYSVAR.is_match(sql) {
                    info.type_mask |= TypeMask::SYSVAR_READ;
                } else if RE_SELECT_USERVAR.is_match(sql) {
                    info.type_mask |= TypeMask::USERVAR_READ;
                }
                Self::collect_tables(sql, &mut info.accessed_tables);
            }
            "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "TRUNCATE" | "ALTER" | "RENAME"
            | "CALL" | "GRANT" | "REVOKE" | "OPTIMIZE" | "ANALYZE" => {
                info.type_mask |= TypeMask::WRITE;
                Self::collect_tables(sql, &mut info.accessed_tables);
            }
            "CREATE" => {
                info.type_mask |= TypeMask::WRITE;
                if let Some(cap) = RE_CREATE_TMP.captures(sql) {
                    info.type_mask |= TypeMask::CREATE_TMP_TABLE;
                    info.created_tmp_table = Some(cap[1].to_string());
                }
            }
            "DROP" => {
                info.type_mask |= TypeMask::WRITE;
                if let Some(cap) = RE_DROP_TABLE.captures(sql) {
                    for table in cap[1].split(',') {
                        let name = table
                            .trim()
                            .trim_end_matches(';')
                            .trim_matches('`')
                            .to_string();
                        if !name.is_empty() {
                            info.dropped_tables.push(name);
                        }
                    }
                }
            }
            "SET" => {
                info.type_mask |= TypeMask::SESSION_WRITE;
                if RE_SET_SYSVAR.is_match(sql) {
                    info.type_mask |= TypeMask::GSYSVAR_WRITE;
                } else if RE_SET_USERVAR.is_match(sql) {
                    info.type_mask |= TypeMask::USERVAR_WRITE;
                }
            }
            "USE" => {
                info.type_mask |= TypeMask::SESSION_WRITE;
            }
            "PREPARE" => {
                info.type_mask |= TypeMask::PREPARE_STMT | TypeMask::SESSION_WRITE;
            }
            "EXECUTE" => {
                info.type_mask |= TypeMask::EXEC_STMT;
            }
            "DEALLOCATE" => {
                info.type_mask |= TypeMask::SESSION_WRITE;
            }
            "LOCK" | "UNLOCK" | "FLUSH" => {
                info.type_mask |= TypeMask::SESSION_WRITE;
            }
            "LOAD" => {
                info.type_mask |= TypeMask::WRITE;
                if let Some(cap) = RE_LOAD_DATA.captures(sql)
                    && cap.get(1).is_some()
                {
                    info.type_mask |= TypeMask::LOAD_DATA_LOCAL;
                }
                Self::collect_tables(sql, &mut info.accessed_tables);
            }
            _ => {
                info.type_mask |= TypeMask::WRITE;
            }
        }
        info
    }
}
