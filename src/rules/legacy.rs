//! Legacy rule grammar.
//!
//! ```text
//! rule   := clause (';' clause)*
//! clause := matcher ':' value (',' value)*
//! ```
//!
//! Clauses are ANDed, values within a clause are ORed. Hosts and methods
//! compare case-insensitively, paths case-sensitively.

use super::RequestTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Host(Vec<String>),
    Path(Vec<String>),
    PathPrefix(Vec<String>),
    Method(Vec<String>),
}

impl Clause {
    fn matches(&self, target: &RequestTarget) -> bool {
        match self {
            Clause::Host(hosts) => hosts.iter().any(|h| *h == target.host),
            Clause::Path(paths) => paths.iter().any(|p| *p == target.path),
            Clause::PathPrefix(prefixes) => {
                prefixes.iter().any(|p| target.path.starts_with(p.as_str()))
            }
            Clause::Method(methods) => methods.iter().any(|m| *m == target.method),
        }
    }

    fn pattern_name(&self) -> &'static str {
        match self {
            Clause::Host(_) => "Host",
            Clause::Path(_) => "Path",
            Clause::PathPrefix(_) => "PathPrefix",
            Clause::Method(_) => "Method",
        }
    }

    fn values(&self) -> &[String] {
        match self {
            Clause::Host(v) | Clause::Path(v) | Clause::PathPrefix(v) | Clause::Method(v) => v,
        }
    }
}

/// A compiled legacy rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRule {
    clauses: Vec<Clause>,
}

impl LegacyRule {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err("empty expression".into());
        }

        let clauses = expr
            .split(';')
            .enumerate()
            .map(|(index, clause)| {
                parse_clause(clause).map_err(|e| format!("clause {}: {e}", index + 1))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { clauses })
    }

    pub fn matches(&self, target: &RequestTarget) -> bool {
        self.clauses.iter().all(|clause| clause.matches(target))
    }

    /// The same rule in the pattern grammar.
    pub fn to_pattern(&self) -> String {
        self.clauses
            .iter()
            .map(|clause| {
                let name = clause.pattern_name();
                let calls: Vec<String> = clause
                    .values()
                    .iter()
                    .map(|value| format!("{name}({})", quote(value)))
                    .collect();
                if calls.len() == 1 {
                    calls.concat()
                } else {
                    format!("({})", calls.join(" || "))
                }
            })
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

fn parse_clause(clause: &str) -> Result<Clause, String> {
    let clause = clause.trim();
    let (name, values) = clause
        .split_once(':')
        .ok_or_else(|| format!("expected 'Matcher:value' but found '{clause}'"))?;

    let values: Vec<String> = values.split(',').map(|v| v.trim().to_string()).collect();
    if values.iter().any(String::is_empty) {
        return Err(format!("{} has an empty value", name.trim()));
    }

    match name.trim() {
        "Host" => Ok(Clause::Host(
            values.iter().map(|v| v.to_ascii_lowercase()).collect(),
        )),
        "Path" => Ok(Clause::Path(require_paths(values)?)),
        "PathPrefix" => Ok(Clause::PathPrefix(require_paths(values)?)),
        "Method" => Ok(Clause::Method(
            values.iter().map(|v| v.to_ascii_uppercase()).collect(),
        )),
        other => Err(format!(
            "unknown matcher '{other}' (expected Host, Path, PathPrefix or Method)"
        )),
    }
}

fn require_paths(values: Vec<String>) -> Result<Vec<String>, String> {
    match values.iter().find(|v| !v.starts_with('/')) {
        Some(bad) => Err(format!("path '{bad}' must start with '/'")),
        None => Ok(values),
    }
}

/// Quote a value as a pattern-grammar string literal.
fn quote(value: &str) -> String {
    if value.contains('`') {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        format!("`{value}`")
    }
}
