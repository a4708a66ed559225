//! Request rules: decide whether a proxied request needs a session.
//!
//! Two expression grammars are supported and exactly one is active per
//! process, chosen by `rules.syntax`:
//!
//! - **legacy**: `Host:a.com,b.com;PathPrefix:/api` (`;` is AND, `,` is OR)
//! - **pattern**: `Host(`a.com`) && (PathPrefix(`/api`) || !Method(`GET`))`
//!
//! Any legacy expression has an equivalent pattern expression (see
//! [`LegacyRule::to_pattern`]) and both evaluate it identically.
//!
//! Rules are checked in declaration order and the first match decides. The
//! pass-through prefixes are checked before any rule and always allow.

mod legacy;
mod pattern;

use http::HeaderMap;
pub use legacy::LegacyRule;
pub use pattern::PatternRule;

use crate::config::{RuleAction, RuleSyntax, RulesConfig};

/// Outcome of rule evaluation for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    /// Forward without a session.
    Allow,
    /// A valid session is required.
    RequireAuth,
}

/// What produced a [`RuleDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource<'a> {
    PassThrough(&'a str),
    Rule(&'a str),
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation<'a> {
    pub decision: RuleDecision,
    pub source: MatchSource<'a>,
}

/// A rule expression that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rule '{rule}': {message}")]
pub struct RuleError {
    pub rule: String,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Request target
// ─────────────────────────────────────────────────────────────────────────────

/// The parts of a proxied request that rules can match on.
#[derive(Debug, Clone, Default)]
pub struct RequestTarget {
    /// Uppercase HTTP method.
    pub method: String,
    /// Lowercase host without port.
    pub host: String,
    /// Path with dot segments resolved, without query.
    pub path: String,
    /// Decoded query pairs.
    pub query: Vec<(String, String)>,
    raw_query: Option<String>,
    pub headers: HeaderMap,
}

impl RequestTarget {
    pub fn new(method: &str, host: &str, uri: &str) -> Self {
        let (raw_path, raw_query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };
        let query = raw_query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            method: method.to_ascii_uppercase(),
            host: normalize_host(host),
            path: normalize_path(raw_path),
            query,
            raw_query: raw_query.filter(|q| !q.is_empty()).map(str::to_string),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Path plus the original query, as seen by the upstream.
    pub fn path_and_query(&self) -> String {
        match &self.raw_query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    if host.starts_with('[') {
        // Bracketed IPv6 literal, possibly followed by a port.
        return match host.find(']') {
            Some(end) => host[..=end].to_string(),
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name.to_string()
        }
        _ => host,
    }
}

/// Resolve `.` and `..` segments, including percent-encoded ones, so prefix
/// rules cannot be side-stepped.
fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".into();
    }
    let owned;
    let path = if path.starts_with('/') {
        path
    } else {
        owned = format!("/{path}");
        owned.as_str()
    };
    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_dot = false;
    for segment in path.split('/').skip(1) {
        trailing_dot = true;
        match dot_segment(segment) {
            Some(DotSegment::Current) => {}
            Some(DotSegment::Parent) => {
                segments.pop();
            }
            None => {
                trailing_dot = false;
                segments.push(segment);
            }
        }
    }
    // A trailing dot segment still names a directory.
    if trailing_dot {
        segments.push("");
    }
    format!("/{}", segments.join("/"))
}

enum DotSegment {
    Current,
    Parent,
}

/// Classify `.`/`..`, treating `%2e` (any case) as a dot.
fn dot_segment(segment: &str) -> Option<DotSegment> {
    if segment.len() > 6 {
        return None;
    }
    match segment.to_ascii_lowercase().replace("%2e", ".").as_str() {
        "." => Some(DotSegment::Current),
        ".." => Some(DotSegment::Parent),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Matcher
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct NamedRule<M> {
    name: String,
    action: RuleAction,
    matcher: M,
}

#[derive(Debug)]
enum CompiledRules {
    Legacy(Vec<NamedRule<LegacyRule>>),
    Pattern(Vec<NamedRule<PatternRule>>),
}

/// Compiled, immutable rule set.
#[derive(Debug)]
pub struct RuleMatcher {
    pass_through: Vec<String>,
    default_action: RuleAction,
    rules: CompiledRules,
}

impl RuleMatcher {
    /// Compile every configured rule. Any malformed expression fails the
    /// whole set.
    pub fn compile(config: &RulesConfig) -> Result<Self, RuleError> {
        let rules = match config.syntax {
            RuleSyntax::Legacy => CompiledRules::Legacy(compile_all(config, LegacyRule::parse)?),
            RuleSyntax::Pattern => {
                CompiledRules::Pattern(compile_all(config, PatternRule::parse)?)
            }
        };

        Ok(Self {
            pass_through: config.pass_through.clone(),
            default_action: config.default_action,
            rules,
        })
    }

    pub fn syntax(&self) -> RuleSyntax {
        match self.rules {
            CompiledRules::Legacy(_) => RuleSyntax::Legacy,
            CompiledRules::Pattern(_) => RuleSyntax::Pattern,
        }
    }

    pub fn decide(&self, target: &RequestTarget) -> RuleDecision {
        self.evaluate(target).decision
    }

    pub fn evaluate(&self, target: &RequestTarget) -> Evaluation<'_> {
        if let Some(prefix) = self
            .pass_through
            .iter()
            .find(|prefix| target.path.starts_with(prefix.as_str()))
        {
            return Evaluation {
                decision: RuleDecision::Allow,
                source: MatchSource::PassThrough(prefix),
            };
        }

        let matched = match &self.rules {
            CompiledRules::Legacy(rules) => first_match(rules, |m| m.matches(target)),
            CompiledRules::Pattern(rules) => first_match(rules, |m| m.matches(target)),
        };

        match matched {
            Some((name, action)) => Evaluation {
                decision: action.into(),
                source: MatchSource::Rule(name),
            },
            None => Evaluation {
                decision: self.default_action.into(),
                source: MatchSource::Default,
            },
        }
    }
}

impl From<RuleAction> for RuleDecision {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Allow => RuleDecision::Allow,
            RuleAction::Auth => RuleDecision::RequireAuth,
        }
    }
}

fn compile_all<M>(
    config: &RulesConfig,
    parse: impl Fn(&str) -> Result<M, String>,
) -> Result<Vec<NamedRule<M>>, RuleError> {
    config
        .rules
        .iter()
        .map(|rule| {
            let matcher = parse(&rule.rule).map_err(|message| RuleError {
                rule: rule.name.clone(),
                message,
            })?;
            Ok(NamedRule {
                name: rule.name.clone(),
                action: rule.action,
                matcher,
            })
        })
        .collect()
}

fn first_match<M>(
    rules: &[NamedRule<M>],
    matches: impl Fn(&M) -> bool,
) -> Option<(&str, RuleAction)> {
    rules
        .iter()
        .find(|rule| matches(&rule.matcher))
        .map(|rule| (rule.name.as_str(), rule.action))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::config::RuleConfig;

    fn rules(
        syntax: RuleSyntax,
        default_action: RuleAction,
        entries: &[(&str, RuleAction, &str)],
    ) -> RulesConfig {
        RulesConfig {
            default_action,
            syntax,
            pass_through: Vec::new(),
            rules: entries
                .iter()
                .map(|(name, action, rule)| RuleConfig {
                    name: name.to_string(),
                    action: *action,
                    rule: rule.to_string(),
                })
                .collect(),
        }
    }

    fn get(host: &str, uri: &str) -> RequestTarget {
        RequestTarget::new("GET", host, uri)
    }

    #[rstest]
    #[case(RuleSyntax::Legacy, "PathPrefix:/healthz")]
    #[case(RuleSyntax::Pattern, "PathPrefix(`/healthz`)")]
    fn test_public_healthz_with_default_auth(#[case] syntax: RuleSyntax, #[case] expr: &str) {
        let matcher = RuleMatcher::compile(&rules(
            syntax,
            RuleAction::Auth,
            &[("public", RuleAction::Allow, expr)],
        ))
        .unwrap();

        let health = matcher.evaluate(&get("app.example.com", "/healthz"));
        assert_eq!(health.decision, RuleDecision::Allow);
        assert_eq!(health.source, MatchSource::Rule("public"));

        let dashboard = matcher.evaluate(&get("app.example.com", "/dashboard"));
        assert_eq!(dashboard.decision, RuleDecision::RequireAuth);
        assert_eq!(dashboard.source, MatchSource::Default);
    }

    #[test]
    fn test_first_declared_rule_wins() {
        let matcher = RuleMatcher::compile(&rules(
            RuleSyntax::Pattern,
            RuleAction::Allow,
            &[
                ("admin", RuleAction::Auth, "PathPrefix(`/public/admin`)"),
                ("public", RuleAction::Allow, "PathPrefix(`/public`)"),
            ],
        ))
        .unwrap();

        let eval = matcher.evaluate(&get("x", "/public/admin/users"));
        assert_eq!(eval.decision, RuleDecision::RequireAuth);
        assert_eq!(eval.source, MatchSource::Rule("admin"));

        let eval = matcher.evaluate(&get("x", "/public/index.html"));
        assert_eq!(eval.source, MatchSource::Rule("public"));
    }

    #[test]
    fn test_pass_through_beats_auth_rules() {
        let mut config = rules(
            RuleSyntax::Legacy,
            RuleAction::Auth,
            &[("everything", RuleAction::Auth, "PathPrefix:/")],
        );
        config.pass_through = vec!["/.well-known/".into()];
        let matcher = RuleMatcher::compile(&config).unwrap();

        let eval = matcher.evaluate(&get("x", "/.well-known/acme-challenge/abc"));
        assert_eq!(eval.decision, RuleDecision::Allow);
        assert_eq!(eval.source, MatchSource::PassThrough("/.well-known/"));
        assert_eq!(matcher.decide(&get("x", "/other")), RuleDecision::RequireAuth);
    }

    #[test]
    fn test_dot_segments_cannot_escape_allow_prefix() {
        let matcher = RuleMatcher::compile(&rules(
            RuleSyntax::Legacy,
            RuleAction::Auth,
            &[("public", RuleAction::Allow, "PathPrefix:/public/")],
        ))
        .unwrap();

        assert_eq!(
            matcher.decide(&get("x", "/public/../admin")),
            RuleDecision::RequireAuth
        );
        assert_eq!(
            matcher.decide(&get("x", "/admin/../public/file")),
            RuleDecision::Allow
        );
        for encoded in ["/public/%2e%2e/admin", "/public/%2E%2e/admin", "/public/.%2E/admin"] {
            assert_eq!(
                matcher.decide(&get("x", encoded)),
                RuleDecision::RequireAuth,
                "{encoded}"
            );
        }
        assert_eq!(
            matcher.decide(&get("x", "/admin/%2e%2e/public/file")),
            RuleDecision::Allow
        );
    }

    #[test]
    fn test_encoded_dot_segments_are_resolved() {
        assert_eq!(normalize_path("/a/%2e/b/%2E%2E/c"), "/a/c");
        assert_eq!(normalize_path("/a/b/%2e%2e"), "/a/");
        assert_eq!(normalize_path("/a/%2e%2ex/b"), "/a/%2e%2ex/b");
    }

    #[test]
    fn test_malformed_rule_names_rule() {
        let err = RuleMatcher::compile(&rules(
            RuleSyntax::Legacy,
            RuleAction::Auth,
            &[("broken", RuleAction::Allow, "Nope:/x")],
        ))
        .unwrap_err();

        assert_eq!(err.rule, "broken");
    }

    #[rstest]
    #[case("Example.COM:8443", "example.com")]
    #[case("example.com", "example.com")]
    #[case("[::1]:8080", "[::1]")]
    #[case("  host ", "host")]
    fn test_host_normalization(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_host(raw), expected);
    }

    #[rstest]
    #[case("", "/")]
    #[case("/", "/")]
    #[case("/a/./b", "/a/b")]
    #[case("/a/../../b", "/b")]
    #[case("/a/b/..", "/a/")]
    #[case("/a//b", "/a//b")]
    fn test_path_normalization(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_path(raw), expected);
    }

    #[test]
    fn test_request_target_splits_query() {
        let target = RequestTarget::new("post", "h", "/search?q=rust&page=2");
        assert_eq!(target.method, "POST");
        assert_eq!(target.path, "/search");
        assert_eq!(
            target.query,
            vec![("q".into(), "rust".into()), ("page".into(), "2".into())]
        );
        assert_eq!(target.path_and_query(), "/search?q=rust&page=2");
    }

    // Legacy and pattern rule sets built from the same legacy expressions
    // must classify every request the same way.
    #[rstest]
    #[case("Host:app.example.com")]
    #[case("Host:app.example.com,api.example.com")]
    #[case("PathPrefix:/api")]
    #[case("PathPrefix:/api,/static/")]
    #[case("Path:/login")]
    #[case("Host:app.example.com;PathPrefix:/public")]
    #[case("Method:GET,HEAD;PathPrefix:/docs")]
    #[case("Host:API.Example.com;Path:/v1/status,/v2/status")]
    #[case("PathPrefix:/Case")]
    fn test_legacy_and_pattern_agree(#[case] legacy_expr: &str) {
        let legacy = LegacyRule::parse(legacy_expr).unwrap();
        let translated = legacy.to_pattern();

        let legacy_set = RuleMatcher::compile(&rules(
            RuleSyntax::Legacy,
            RuleAction::Auth,
            &[("r", RuleAction::Allow, legacy_expr)],
        ))
        .unwrap();
        let pattern_set = RuleMatcher::compile(&rules(
            RuleSyntax::Pattern,
            RuleAction::Auth,
            &[("r", RuleAction::Allow, translated.as_str())],
        ))
        .unwrap();

        let hosts = ["app.example.com", "API.example.com:443", "api.example.com", "other.org"];
        let paths = [
            "/", "/api", "/api/v1", "/apiary", "/static/app.js", "/login", "/login/x",
            "/public", "/public/a", "/docs/index", "/v1/status", "/v2/status", "/case",
            "/Case/x",
        ];
        let methods = ["GET", "HEAD", "POST"];

        for host in hosts {
            for path in paths {
                for method in methods {
                    let target = RequestTarget::new(method, host, path);
                    assert_eq!(
                        legacy_set.decide(&target),
                        pattern_set.decide(&target),
                        "{method} {host}{path}: `{legacy_expr}` vs `{translated}`"
                    );
                }
            }
        }
    }
}
