use std::ops::{BitAnd, BitOr, Not};
use std::sync::LazyLock;

use regex::Regex;

static EXACT_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\p{Co}]+").unwrap());
static PARTIAL_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\p{Co}%_]+").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SearchQuery {
    Text(TextQuery),
    And(Vec<SearchQuery>),
    Or(Vec<SearchQuery>),
    Not(Box<SearchQuery>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextQuery {
    pub text: String,
    /// Restricts matches to one metadata field, e.g. `title`.
    pub field: Option<String>,
    pub partial: bool,
}

pub fn define_text_query(text: &str, field: Option<&str>, partial: bool) -> SearchQuery {
    SearchQuery::Text(TextQuery {
        text: text.to_string(),
        field: field.map(str::to_string),
        partial,
    })
}

impl From<&str> for SearchQuery {
    fn from(text: &str) -> Self {
        define_text_query(text, None, false)
    }
}

impl From<String> for SearchQuery {
    fn from(text: String) -> Self {
        SearchQuery::Text(TextQuery {
            text,
            field: None,
            partial: false,
        })
    }
}

impl BitAnd for SearchQuery {
    type Output = SearchQuery;

    fn bitand(self, rhs: SearchQuery) -> SearchQuery {
        match self {
            SearchQuery::And(mut children) => {
                children.push(rhs);
                SearchQuery::And(children)
            }
            other => SearchQuery::And(vec![other, rhs]),
        }
    }
}

impl BitOr for SearchQuery {
    type Output = SearchQuery;

    fn bitor(self, rhs: SearchQuery) -> SearchQuery {
        match self {
            SearchQuery::Or(mut children) => {
                children.push(rhs);
                SearchQuery::Or(children)
            }
            other => SearchQuery::Or(vec![other, rhs]),
        }
    }
}

impl Not for SearchQuery {
    type Output = SearchQuery;

    fn not(self) -> SearchQuery {
        SearchQuery::Not(Box::new(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFilter {
    pub clause: String,
    pub parameters: Vec<String>,
}

/// Returns `None` when the query holds no searchable token at all.
pub fn search_filter(query: &SearchQuery) -> Option<SqlFilter> {
    let query = sanitize(query)?;
    let mut parameters = Vec::new();
    let clause = build_clause(&query, &mut parameters);
    Some(SqlFilter { clause, parameters })
}

fn tokenize(text: &str, partial: bool) -> Vec<String> {
    let separators = if partial {
        &*PARTIAL_SEPARATORS
    } else {
        &*EXACT_SEPARATORS
    };
    let lowered = text.to_lowercase();
    let mut tokens: Vec<String> = Vec::new();
    for token in separators.split(&lowered).filter(|token| !token.is_empty()) {
        if !tokens.iter().any(|seen| seen == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// Splits text queries into one query per token and drops empty branches.
fn sanitize(query: &SearchQuery) -> Option<SearchQuery> {
    match query {
        SearchQuery::Text(text) => {
            let mut tokens = tokenize(&text.text, text.partial)
                .into_iter()
                .map(|token| {
                    SearchQuery::Text(TextQuery {
                        text: token,
                        field: text.field.clone(),
                        partial: text.partial,
                    })
                })
                .collect::<Vec<_>>();
            match tokens.len() {
                0 => None,
                1 => tokens.pop(),
                _ => Some(SearchQuery::And(tokens)),
            }
        }
        SearchQuery::And(children) => combine(children, SearchQuery::And),
        SearchQuery::Or(children) => combine(children, SearchQuery::Or),
        SearchQuery::Not(child) => sanitize(child).map(|child| SearchQuery::Not(Box::new(child))),
    }
}

fn combine(
    children: &[SearchQuery],
    wrap: fn(Vec<SearchQuery>) -> SearchQuery,
) -> Option<SearchQuery> {
    let mut kept = children.iter().filter_map(sanitize).collect::<Vec<_>>();
    match kept.len() {
        0 => None,
        1 => kept.pop(),
        _ => Some(wrap(kept)),
    }
}

fn build_clause(query: &SearchQuery, parameters: &mut Vec<String>) -> String {
    match query {
        SearchQuery::Text(text) => {
            let operator = if text.partial { "LIKE" } else { "=" };
            parameters.push(text.text.clone());
            match &text.field {
                Some(field) => {
                    parameters.push(field.clone());
                    format!(
                        "paths.pid IN (SELECT pid FROM links \
                         LEFT JOIN tokens ON tokens.tid = links.tid \
                         LEFT JOIN fields ON fields.fid = links.fid \
                         WHERE tokens.token {operator} ? AND fields.field = ?)"
                    )
                }
                None => format!(
                    "paths.pid IN (SELECT pid FROM links \
                     LEFT JOIN tokens ON tokens.tid = links.tid \
                     WHERE tokens.token {operator} ?)"
                ),
            }
        }
        SearchQuery::And(children) => join_clauses(children, " AND ", parameters),
        SearchQuery::Or(children) => join_clauses(children, " OR ", parameters),
        SearchQuery::Not(child) => format!("NOT {}", build_clause(child, parameters)),
    }
}

fn join_clauses(children: &[SearchQuery], separator: &str, parameters: &mut Vec<String>) -> String {
    let clauses = children
        .iter()
        .map(|child| build_clause(child, parameters))
        .collect::<Vec<_>>();
    format!("({})", clauses.join(separator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_on_punctuation() {
        assert_eq!(tokenize("Mouse brain, 10X-Genomics", false), vec![
            "mouse", "brain", "10x", "genomics"
        ]);
        assert_eq!(tokenize("neur%", true), vec!["neur%"]);
        assert_eq!(tokenize("neur%", false), vec!["neur"]);
    }

    #[test]
    fn multi_token_text_becomes_conjunction() {
        let filter = search_filter(&SearchQuery::from("human pancreas")).unwrap();
        assert!(filter.clause.starts_with('('));
        assert!(filter.clause.contains(" AND "));
        assert_eq!(filter.parameters, vec!["human", "pancreas"]);
    }

    #[test]
    fn field_and_partial_change_the_comparison() {
        let filter = search_filter(&define_text_query("Brain%", Some("title"), true)).unwrap();
        assert!(filter.clause.contains("tokens.token LIKE ?"));
        assert!(filter.clause.contains("fields.field = ?"));
        assert_eq!(filter.parameters, vec!["brain%", "title"]);
    }

    #[test]
    fn operators_compose() {
        let query = SearchQuery::from("brain") | SearchQuery::from("pancreas");
        let query = query & !SearchQuery::from("mouse");
        let filter = search_filter(&query).unwrap();
        assert!(filter.clause.contains(" OR "));
        assert!(filter.clause.contains("NOT paths.pid IN"));
        assert_eq!(filter.parameters, vec!["brain", "pancreas", "mouse"]);
    }

    #[test]
    fn empty_queries_vanish() {
        assert!(search_filter(&SearchQuery::from("  ,;  ")).is_none());
        let filter = search_filter(&(SearchQuery::from("!!") & SearchQuery::from("brain"))).unwrap();
        assert_eq!(filter.parameters, vec!["brain"]);
        assert!(!filter.clause.starts_with('('));
    }
}
