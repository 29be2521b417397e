//! Filter / query compiler.
//!
//! A filter is an OR of AND-ed field clauses (disjunctive normal form)
//! over the message table. Compilation canonicalizes the clause set and
//! derives a stable identity (`FilterId`) from a structural hash, so
//! identical definitions always compile to the same fid regardless of
//! clause or field order.

use crate::error::{RelayError, Result};
use crate::types::{MarkStatus, Message, MessageId};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// A client-supplied clause: field name to value, AND-ed together.
pub type ClauseSpec = HashMap<String, JsonValue>;

/// Stable identity of a compiled filter.
///
/// First 8 bytes of the SHA-256 of the canonicalized clause set, so it is
/// stable across runs and processes. Rendered as 16 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(pub u64);

impl FilterId {
    /// Parse the hex form handed out to clients. An unparsable fid cannot
    /// name a registered filter, so it surfaces as not-found.
    pub fn parse(s: &str) -> Result<Self> {
        u64::from_str_radix(s, 16)
            .map(FilterId)
            .map_err(|_| RelayError::FilterNotFound(s.to_string()))
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

impl fmt::Debug for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterId({})", hex::encode(self.0.to_be_bytes()))
    }
}

/// The supported filter fields, each with a typed normalizer and a SQL
/// comparison. Unknown names fail at compile time, not query time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Field {
    Class,
    Instance,
    User,
    Sender,
    Read,
    Body,
    After,
    Before,
}

impl Field {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "cls" => Ok(Field::Class),
            "instance" => Ok(Field::Instance),
            "user" => Ok(Field::User),
            "sender" => Ok(Field::Sender),
            "read" => Ok(Field::Read),
            "message" => Ok(Field::Body),
            "after" => Ok(Field::After),
            "before" => Ok(Field::Before),
            other => Err(RelayError::UnknownField(other.to_string())),
        }
    }

    /// Canonical name used in the structural hash.
    fn name(self) -> &'static str {
        match self {
            Field::Class => "cls",
            Field::Instance => "instance",
            Field::User => "user",
            Field::Sender => "sender",
            Field::Read => "read",
            Field::Body => "message",
            Field::After => "after",
            Field::Before => "before",
        }
    }

    /// SQL comparison with one parameter placeholder.
    fn comparison(self) -> &'static str {
        match self {
            Field::Class => "cls = ?",
            Field::Instance => "instance = ?",
            Field::User => "recipient = ?",
            Field::Sender => "sender = ?",
            Field::Read => "read = ?",
            Field::Body => "body LIKE ?",
            Field::After => "timestamp > ?",
            Field::Before => "timestamp < ?",
        }
    }

    /// Normalize a clause value into its bound SQL parameter.
    fn normalize(self, value: &JsonValue) -> Result<SqlValue> {
        let invalid = |reason: &str| RelayError::InvalidClause {
            field: self.name().to_string(),
            reason: reason.to_string(),
        };
        match self {
            Field::Class | Field::Instance | Field::User | Field::Sender => value
                .as_str()
                .map(|s| SqlValue::Text(s.to_string()))
                .ok_or_else(|| invalid("expected a string")),
            Field::Read => match value {
                JsonValue::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
                JsonValue::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                    Ok(SqlValue::Integer(n.as_i64().unwrap()))
                }
                _ => Err(invalid("expected a boolean")),
            },
            Field::Body => value
                .as_str()
                .map(|s| SqlValue::Text(format!("%{}%", s)))
                .ok_or_else(|| invalid("expected a substring")),
            Field::After | Field::Before => value
                .as_i64()
                .map(SqlValue::Integer)
                .ok_or_else(|| invalid("expected a timestamp in microseconds")),
        }
    }
}

/// One normalized field comparison within a clause.
#[derive(Clone, Debug)]
struct Term {
    field: Field,
    param: SqlValue,
}

impl Term {
    /// Canonical text form, feeding the structural hash. Value kind is
    /// tagged so `read=1` and a hypothetical text "1" can't collide.
    fn canonical(&self) -> String {
        let value = match &self.param {
            SqlValue::Text(s) => format!("t{}", s),
            SqlValue::Integer(i) => format!("i{}", i),
            other => format!("?{:?}", other),
        };
        format!("{}\u{1}{}", self.field.name(), value)
    }
}

/// A compiled, immutable predicate over stored messages.
///
/// All result-producing operations order by ascending timestamp (id as
/// tiebreak) and take `(offset, perpage)`, where a negative perpage means
/// "all remaining".
#[derive(Clone, Debug)]
pub struct Filter {
    fid: FilterId,
    /// OR-of-parenthesized-clauses, without the leading `WHERE`.
    /// `None` matches everything.
    predicate: Option<String>,
    params: Vec<SqlValue>,
}

impl Filter {
    /// Compile a clause list. Unknown fields and malformed values are
    /// rejected here; `regex: true` markers fail fast as unsupported.
    pub fn compile(clauses: &[ClauseSpec]) -> Result<Self> {
        let mut compiled: Vec<(String, String, Vec<SqlValue>)> = Vec::new();
        let mut match_all = clauses.is_empty();

        for clause in clauses {
            let mut terms = Vec::new();
            for (name, value) in clause {
                if name == "regex" {
                    match value {
                        JsonValue::Bool(false) | JsonValue::Null => continue,
                        _ => return Err(RelayError::RegexUnsupported),
                    }
                }
                let field = Field::parse(name)?;
                terms.push(Term {
                    field,
                    param: field.normalize(value)?,
                });
            }

            // An empty clause AND-s nothing, so it matches everything and
            // absorbs the whole disjunction. Other clauses are still
            // validated above before we get here.
            if terms.is_empty() {
                match_all = true;
                continue;
            }

            terms.sort_by(|a, b| {
                a.field
                    .cmp(&b.field)
                    .then_with(|| a.canonical().cmp(&b.canonical()))
            });
            terms.dedup_by_key(|t| t.canonical());

            let canonical = terms
                .iter()
                .map(Term::canonical)
                .collect::<Vec<_>>()
                .join("\u{1e}");
            let sql = terms
                .iter()
                .map(|t| t.field.comparison())
                .collect::<Vec<_>>()
                .join(" AND ");
            let params = terms.into_iter().map(|t| t.param).collect();
            compiled.push((canonical, sql, params));
        }

        if match_all {
            return Ok(Self {
                fid: FilterId(structural_hash("")),
                predicate: None,
                params: Vec::new(),
            });
        }

        // Clause-set semantics: order-independent, duplicates collapse.
        compiled.sort_by(|a, b| a.0.cmp(&b.0));
        compiled.dedup_by(|a, b| a.0 == b.0);

        let canonical = compiled
            .iter()
            .map(|c| c.0.as_str())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        let predicate = compiled
            .iter()
            .map(|c| format!("({})", c.1))
            .collect::<Vec<_>>()
            .join(" OR ");
        let params = compiled.into_iter().flat_map(|c| c.2).collect();

        Ok(Self {
            fid: FilterId(structural_hash(&canonical)),
            predicate: Some(predicate),
            params,
        })
    }

    /// The filter's stable identity.
    pub fn fid(&self) -> FilterId {
        self.fid
    }

    /// True if this is the match-everything predicate.
    pub fn matches_all(&self) -> bool {
        self.predicate.is_none()
    }

    fn where_clause(&self) -> String {
        match &self.predicate {
            Some(p) => format!(" WHERE ({})", p),
            None => String::new(),
        }
    }

    /// WHERE clause with an extra AND-ed condition.
    pub(crate) fn where_with(&self, extra: &str) -> String {
        match &self.predicate {
            Some(p) => format!(" WHERE ({}) AND {}", p, extra),
            None => format!(" WHERE {}", extra),
        }
    }

    /// Predicate parameters followed by `tail`.
    pub(crate) fn params_and(&self, tail: &[SqlValue]) -> Vec<SqlValue> {
        self.params.iter().cloned().chain(tail.iter().cloned()).collect()
    }

    // --- Query Operations ---

    /// Matching messages in timestamp order.
    pub fn get(&self, conn: &Connection, offset: i64, perpage: i64) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages{} ORDER BY timestamp, id LIMIT ? OFFSET ?",
            crate::store::MESSAGE_COLUMNS,
            self.where_clause()
        );
        let mut stmt = conn.prepare(&sql)?;
        let params = self.params_and(&[SqlValue::Integer(perpage), SqlValue::Integer(offset)]);
        let rows = stmt.query_map(params_from_iter(params), crate::store::row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Matching ids in timestamp order.
    pub fn get_ids(&self, conn: &Connection, offset: i64, perpage: i64) -> Result<Vec<MessageId>> {
        let sql = format!(
            "SELECT id FROM messages{} ORDER BY timestamp, id LIMIT ? OFFSET ?",
            self.where_clause()
        );
        let mut stmt = conn.prepare(&sql)?;
        let params = self.params_and(&[SqlValue::Integer(perpage), SqlValue::Integer(offset)]);
        let rows = stmt.query_map(params_from_iter(params), |row| row.get(0).map(MessageId))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Number of matches within the page.
    pub fn count(&self, conn: &Connection, offset: i64, perpage: i64) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT id FROM messages{} LIMIT ? OFFSET ?)",
            self.where_clause()
        );
        let params = self.params_and(&[SqlValue::Integer(perpage), SqlValue::Integer(offset)]);
        conn.query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(Into::into)
    }

    /// `(unread, total)` over the full predicate.
    pub fn counts(&self, conn: &Connection) -> Result<(i64, i64)> {
        let sql = format!(
            "SELECT COALESCE(SUM(read = 0), 0), COUNT(*) FROM messages{}",
            self.where_clause()
        );
        conn.query_row(&sql, params_from_iter(self.params.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map_err(Into::into)
    }

    /// Delete every match; returns the count removed.
    pub fn delete(&self, conn: &Connection) -> Result<usize> {
        let sql = format!("DELETE FROM messages{}", self.where_clause());
        conn.execute(&sql, params_from_iter(self.params.iter()))
            .map_err(Into::into)
    }

    /// Set the read flag on every match; returns the count updated.
    pub fn mark(&self, conn: &Connection, status: MarkStatus) -> Result<usize> {
        let sql = format!(
            "UPDATE messages SET read = {}{}",
            status.as_flag(),
            self.where_clause()
        );
        conn.execute(&sql, params_from_iter(self.params.iter()))
            .map_err(Into::into)
    }

    /// 0-based position, in the filter's timestamp-ordered result set, of
    /// the earliest unread match, or -1 if none are unread. Returns
    /// `(offset, total)`.
    ///
    /// Pure count queries; the result set is never materialized.
    pub fn oldest_unread_offset(&self, conn: &Connection) -> Result<(i64, i64)> {
        let (unread, total) = self.counts(conn)?;
        if unread == 0 {
            return Ok((-1, total));
        }

        let oldest_unread = format!(
            "SELECT MIN(timestamp) FROM messages{}",
            self.where_with("read = 0")
        );
        let sql = format!(
            "SELECT COUNT(*) FROM messages{}",
            self.where_with(&format!("timestamp < ({})", oldest_unread))
        );
        // Predicate parameters appear twice: outer count, then subquery.
        let params = self.params_and(&self.params);
        let offset = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok((offset, total))
    }
}

fn structural_hash(canonical: &str) -> u64 {
    let digest = Sha256::digest(canonical.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn clause(pairs: &[(&str, JsonValue)]) -> ClauseSpec {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_fid_ignores_field_order() {
        let a = Filter::compile(&[clause(&[
            ("cls", json!("help")),
            ("read", json!(false)),
        ])])
        .unwrap();
        let b = Filter::compile(&[clause(&[
            ("read", json!(false)),
            ("cls", json!("help")),
        ])])
        .unwrap();
        assert_eq!(a.fid(), b.fid());
    }

    #[test]
    fn test_fid_ignores_clause_order_and_duplicates() {
        let c1 = clause(&[("cls", json!("help"))]);
        let c2 = clause(&[("sender", json!("alice"))]);

        let a = Filter::compile(&[c1.clone(), c2.clone()]).unwrap();
        let b = Filter::compile(&[c2.clone(), c1.clone(), c2]).unwrap();
        assert_eq!(a.fid(), b.fid());
    }

    #[test]
    fn test_distinct_filters_get_distinct_fids() {
        let a = Filter::compile(&[clause(&[("cls", json!("help"))])]).unwrap();
        let b = Filter::compile(&[clause(&[("cls", json!("offtopic"))])]).unwrap();
        let c = Filter::compile(&[clause(&[("instance", json!("help"))])]).unwrap();
        assert_ne!(a.fid(), b.fid());
        assert_ne!(a.fid(), c.fid());
    }

    #[test]
    fn test_empty_compiles_to_match_all() {
        let empty_list = Filter::compile(&[]).unwrap();
        let empty_clause = Filter::compile(&[ClauseSpec::new()]).unwrap();

        assert!(empty_list.matches_all());
        assert!(empty_clause.matches_all());
        assert_eq!(empty_list.fid(), empty_clause.fid());

        let real = Filter::compile(&[clause(&[("cls", json!("help"))])]).unwrap();
        assert_ne!(empty_list.fid(), real.fid());
    }

    #[test]
    fn test_unknown_field_rejected_at_compile_time() {
        let result = Filter::compile(&[clause(&[("flavor", json!("spicy"))])]);
        assert!(matches!(result, Err(RelayError::UnknownField(f)) if f == "flavor"));
    }

    #[test]
    fn test_regex_clause_rejected() {
        let result = Filter::compile(&[clause(&[
            ("message", json!("hel+o")),
            ("regex", json!(true)),
        ])]);
        assert!(matches!(result, Err(RelayError::RegexUnsupported)));

        // An explicit false marker is inert.
        let ok = Filter::compile(&[clause(&[
            ("message", json!("hello")),
            ("regex", json!(false)),
        ])]);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_value_type_checked_at_compile_time() {
        let result = Filter::compile(&[clause(&[("after", json!("yesterday"))])]);
        assert!(matches!(result, Err(RelayError::InvalidClause { .. })));

        let result = Filter::compile(&[clause(&[("read", json!("yes"))])]);
        assert!(matches!(result, Err(RelayError::InvalidClause { .. })));
    }

    #[test]
    fn test_count_is_restricted_to_the_page() {
        let store = crate::store::MessageStore::in_memory().unwrap();
        for i in 0..4 {
            store
                .insert(&crate::types::NewMessage {
                    sender: "alice".into(),
                    body: format!("m{i}"),
                    class: "help".into(),
                    timestamp: Some(crate::types::Timestamp(1_000 + i)),
                    ..Default::default()
                })
                .unwrap();
        }
        let filter = Filter::compile(&[clause(&[("cls", json!("help"))])]).unwrap();

        store
            .with_conn(|conn| {
                assert_eq!(filter.count(conn, 0, -1)?, 4);
                // The count covers the page, not the whole predicate.
                assert_eq!(filter.count(conn, 1, 2)?, 2);
                assert_eq!(filter.count(conn, 3, 5)?, 1);
                assert_eq!(filter.count(conn, 4, -1)?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_fid_parse_roundtrip() {
        let f = Filter::compile(&[clause(&[("cls", json!("help"))])]).unwrap();
        let rendered = f.fid().to_string();
        assert_eq!(rendered.len(), 16);
        assert_eq!(FilterId::parse(&rendered).unwrap(), f.fid());
    }

    #[test]
    fn test_fid_parse_garbage_is_not_found() {
        assert!(matches!(
            FilterId::parse("not-a-fid"),
            Err(RelayError::FilterNotFound(_))
        ));
    }

    proptest! {
        #[test]
        fn test_fid_permutation_invariant(order in Just(vec![
            clause(&[("cls", json!("help")), ("instance", json!("linux")), ("read", json!(false))]),
            clause(&[("sender", json!("alice"))]),
            clause(&[("message", json!("lunch")), ("after", json!(1_000_000))]),
        ]).prop_shuffle()) {
            let reference = Filter::compile(&[
                clause(&[("sender", json!("alice"))]),
                clause(&[("message", json!("lunch")), ("after", json!(1_000_000))]),
                clause(&[("read", json!(false)), ("cls", json!("help")), ("instance", json!("linux"))]),
            ]).unwrap();
            let shuffled = Filter::compile(&order).unwrap();
            prop_assert_eq!(shuffled.fid(), reference.fid());
        }
    }
}
