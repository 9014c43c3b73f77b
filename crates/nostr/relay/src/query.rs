//! Filter compilation
//!
//! Turns the filters of a REQ into a bounded, storage-independent query:
//! per-filter predicate sets joined as a union, one effective limit, and the
//! time at which visibility (expiry) is judged. Storage backends render a
//! [`CompiledQuery`] into their own query language.

use crate::config::Limits;
use crate::subscription::Filter;
use thiserror::Error;

/// Length of a full hex id or pubkey.
const FULL_HEX_LEN: usize = 64;

/// Filter rejections, raised before any storage access.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("empty filter: at least one condition besides limit is required")]
    Empty,

    #[error("too many {field}: {len} (max {max})")]
    Cardinality {
        field: String,
        len: usize,
        max: usize,
    },

    #[error("invalid prefix {0:?}: expected up to 64 lowercase hex characters")]
    InvalidPrefix(String),

    #[error("prefix {prefix:?} shorter than {min} characters")]
    PrefixTooShort { prefix: String, min: usize },
}

impl FilterError {
    /// Message for the NOTICE sent back on a rejected REQ.
    pub fn reason(&self) -> String {
        format!("invalid: {}", self)
    }
}

/// Match on an id or pubkey column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexMatch {
    /// Full-length value.
    Exact(String),
    /// Prefix, as the inclusive range it spans.
    Range { lower: String, upper: String },
}

impl HexMatch {
    fn from_prefix(prefix: &str) -> Self {
        if prefix.len() == FULL_HEX_LEN {
            Self::Exact(prefix.to_string())
        } else {
            let pad = FULL_HEX_LEN - prefix.len();
            Self::Range {
                lower: format!("{}{}", prefix, "0".repeat(pad)),
                upper: format!("{}{}", prefix, "f".repeat(pad)),
            }
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::Exact(exact) => value == exact,
            Self::Range { lower, upper } => value >= lower.as_str() && value <= upper.as_str(),
        }
    }
}

/// Predicates of one filter. All present predicates must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFilter {
    pub ids: Option<Vec<HexMatch>>,
    /// Matched against the signer and the delegator.
    pub authors: Option<Vec<HexMatch>>,
    pub kinds: Option<Vec<u16>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Per tag name, the accepted values. Every entry must be satisfied.
    pub tags: Vec<(String, Vec<String>)>,
    /// Case-insensitive substring of the content.
    pub search: Option<String>,
}

/// A bounded query over stored events.
///
/// Results are the union of `filters`, newest first, at most `limit` rows,
/// never including deleted rows or rows expired at `now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub filters: Vec<CompiledFilter>,
    pub limit: usize,
    pub now: u64,
}

impl CompiledQuery {
    /// True when no filter can match anything.
    pub fn is_unsatisfiable(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Bounds applied while compiling.
#[derive(Debug, Clone)]
pub struct QueryLimits {
    pub max_ids: usize,
    pub max_authors: usize,
    pub max_kinds: usize,
    pub max_tag_keys: usize,
    pub max_tag_values: usize,
    pub max_limit: usize,
    pub default_limit: usize,
    pub min_prefix_length: usize,
}

impl From<&Limits> for QueryLimits {
    fn from(limits: &Limits) -> Self {
        Self {
            max_ids: limits.max_ids,
            max_authors: limits.max_authors,
            max_kinds: limits.max_kinds,
            max_tag_keys: limits.max_tag_keys,
            max_tag_values: limits.max_tag_values,
            max_limit: limits.max_limit,
            default_limit: limits.default_limit,
            min_prefix_length: limits.min_prefix_length,
        }
    }
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self::from(&Limits::default())
    }
}

/// Compiles client filters into [`CompiledQuery`] values.
#[derive(Debug, Clone, Default)]
pub struct QueryCompiler {
    limits: QueryLimits,
}

impl QueryCompiler {
    pub fn new(limits: QueryLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    /// Validate and compile the filters of one subscription.
    ///
    /// Filters that cannot match anything (an empty `ids` list, say) are
    /// dropped from the union. The effective limit is the largest `limit`
    /// among the filters, or the default when none has one, clamped to
    /// `[1, max_limit]`.
    pub fn compile(&self, filters: &[Filter], now: u64) -> Result<CompiledQuery, FilterError> {
        let mut compiled = Vec::with_capacity(filters.len());
        for filter in filters {
            if let Some(branch) = self.compile_filter(filter)? {
                compiled.push(branch);
            }
        }

        let requested = filters
            .iter()
            .filter_map(|f| f.limit)
            .max()
            .unwrap_or(self.limits.default_limit);
        let limit = requested.clamp(1, self.limits.max_limit.max(1));

        Ok(CompiledQuery {
            filters: compiled,
            limit,
            now,
        })
    }

    /// Compile one filter. `Ok(None)` means it can never match.
    pub fn compile_filter(&self, filter: &Filter) -> Result<Option<CompiledFilter>, FilterError> {
        if !filter.has_predicates() {
            return Err(FilterError::Empty);
        }
        self.check_cardinality(filter)?;

        let mut out = CompiledFilter {
            kinds: filter.kinds.clone(),
            since: filter.since,
            until: filter.until,
            search: filter.search.clone(),
            ..CompiledFilter::default()
        };

        if let Some(ref ids) = filter.ids {
            out.ids = Some(self.compile_prefixes(ids)?);
        }
        if let Some(ref authors) = filter.authors {
            out.authors = Some(self.compile_prefixes(authors)?);
        }

        let mut tags: Vec<(String, Vec<String>)> = filter
            .tag_filters()
            .map(|(name, values)| (name.to_string(), values.to_vec()))
            .collect();
        tags.sort();
        out.tags = tags;

        let never_matches = out.ids.as_ref().is_some_and(Vec::is_empty)
            || out.authors.as_ref().is_some_and(Vec::is_empty)
            || out.kinds.as_ref().is_some_and(Vec::is_empty)
            || out.tags.iter().any(|(_, values)| values.is_empty())
            || matches!((out.since, out.until), (Some(since), Some(until)) if since > until);

        Ok((!never_matches).then_some(out))
    }

    fn check_cardinality(&self, filter: &Filter) -> Result<(), FilterError> {
        let check = |field: &str, len: usize, max: usize| {
            if len > max {
                Err(FilterError::Cardinality {
                    field: field.to_string(),
                    len,
                    max,
                })
            } else {
                Ok(())
            }
        };

        check("ids", filter.ids.as_ref().map_or(0, Vec::len), self.limits.max_ids)?;
        check(
            "authors",
            filter.authors.as_ref().map_or(0, Vec::len),
            self.limits.max_authors,
        )?;
        check("kinds", filter.kinds.as_ref().map_or(0, Vec::len), self.limits.max_kinds)?;
        check("tag keys", filter.tag_filters().count(), self.limits.max_tag_keys)?;
        for (name, values) in filter.tag_filters() {
            check(&format!("#{} values", name), values.len(), self.limits.max_tag_values)?;
        }
        Ok(())
    }

    fn compile_prefixes(&self, prefixes: &[String]) -> Result<Vec<HexMatch>, FilterError> {
        let mut out: Vec<HexMatch> = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            let valid = prefix.len() <= FULL_HEX_LEN
                && prefix.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
            if !valid {
                return Err(FilterError::InvalidPrefix(prefix.clone()));
            }
            if prefix.len() < self.limits.min_prefix_length {
                return Err(FilterError::PrefixTooShort {
                    prefix: prefix.clone(),
                    min: self.limits.min_prefix_length,
                });
            }
            let compiled = HexMatch::from_prefix(prefix);
            if !out.contains(&compiled) {
                out.push(compiled);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(json: &str) -> Filter {
        serde_json::from_str(json).unwrap()
    }

    fn compiler() -> QueryCompiler {
        QueryCompiler::default()
    }

    #[test]
    fn test_empty_filter_rejected() {
        assert_eq!(compiler().compile(&[filter("{}")], 0), Err(FilterError::Empty));
        assert_eq!(
            compiler().compile(&[filter(r#"{"limit":10}"#)], 0),
            Err(FilterError::Empty)
        );
        // one bad filter rejects the whole subscription
        assert_eq!(
            compiler().compile(&[filter(r#"{"kinds":[1]}"#), filter("{}")], 0),
            Err(FilterError::Empty)
        );
    }

    #[test]
    fn test_full_length_prefix_is_exact() {
        let id = "a".repeat(64);
        let query = compiler()
            .compile(&[filter(&format!(r#"{{"ids":["{}"]}}"#, id))], 0)
            .unwrap();
        assert_eq!(query.filters[0].ids, Some(vec![HexMatch::Exact(id)]));
    }

    #[test]
    fn test_short_prefix_is_range() {
        let query = compiler().compile(&[filter(r#"{"authors":["abc"]}"#)], 0).unwrap();
        let expected = HexMatch::Range {
            lower: format!("abc{}", "0".repeat(61)),
            upper: format!("abc{}", "f".repeat(61)),
        };
        assert_eq!(query.filters[0].authors, Some(vec![expected.clone()]));

        assert!(expected.contains(&format!("abc{}", "7".repeat(61))));
        assert!(!expected.contains(&format!("abd{}", "0".repeat(61))));
        assert!(!expected.contains(&format!("abb{}", "f".repeat(61))));
    }

    #[test]
    fn test_invalid_prefixes() {
        assert!(matches!(
            compiler().compile(&[filter(r#"{"ids":["ABC"]}"#)], 0),
            Err(FilterError::InvalidPrefix(_))
        ));
        assert!(matches!(
            compiler().compile(&[filter(&format!(r#"{{"ids":["{}"]}}"#, "a".repeat(65)))], 0),
            Err(FilterError::InvalidPrefix(_))
        ));
        assert!(matches!(
            compiler().compile(&[filter(r#"{"authors":["' OR 1=1 --"]}"#)], 0),
            Err(FilterError::InvalidPrefix(_))
        ));

        let strict = QueryCompiler::new(QueryLimits {
            min_prefix_length: 4,
            ..QueryLimits::default()
        });
        assert!(matches!(
            strict.compile(&[filter(r#"{"authors":["ab"]}"#)], 0),
            Err(FilterError::PrefixTooShort { .. })
        ));
    }

    #[test]
    fn test_cardinality_caps() {
        let small = QueryCompiler::new(QueryLimits {
            max_kinds: 2,
            max_tag_keys: 1,
            max_tag_values: 2,
            ..QueryLimits::default()
        });

        assert_eq!(
            small.compile(&[filter(r#"{"kinds":[1,2,3]}"#)], 0),
            Err(FilterError::Cardinality {
                field: "kinds".to_string(),
                len: 3,
                max: 2
            })
        );
        assert!(matches!(
            small.compile(&[filter(r##"{"#e":["a"],"#p":["b"]}"##)], 0),
            Err(FilterError::Cardinality { .. })
        ));
        assert!(matches!(
            small.compile(&[filter(r##"{"#e":["a","b","c"]}"##)], 0),
            Err(FilterError::Cardinality { .. })
        ));
        assert!(small.compile(&[filter(r##"{"#e":["a","b"],"kinds":[1,2]}"##)], 0).is_ok());
    }

    #[test]
    fn test_limit_selection() {
        let c = QueryCompiler::new(QueryLimits {
            max_limit: 100,
            default_limit: 20,
            ..QueryLimits::default()
        });

        let q = c.compile(&[filter(r#"{"kinds":[1]}"#)], 0).unwrap();
        assert_eq!(q.limit, 20);

        let q = c
            .compile(&[filter(r#"{"kinds":[1],"limit":5}"#), filter(r#"{"kinds":[2],"limit":50}"#)], 0)
            .unwrap();
        assert_eq!(q.limit, 50);

        let q = c.compile(&[filter(r#"{"kinds":[1],"limit":100000}"#)], 0).unwrap();
        assert_eq!(q.limit, 100);

        let q = c.compile(&[filter(r#"{"kinds":[1],"limit":0}"#)], 0).unwrap();
        assert_eq!(q.limit, 1);
    }

    #[test]
    fn test_unsatisfiable_branches_dropped() {
        let q = compiler()
            .compile(&[filter(r#"{"ids":[]}"#), filter(r#"{"kinds":[1]}"#)], 0)
            .unwrap();
        assert_eq!(q.filters.len(), 1);

        let q = compiler()
            .compile(&[filter(r#"{"since":200,"until":100}"#), filter(r##"{"#e":[]}"##)], 0)
            .unwrap();
        assert!(q.is_unsatisfiable());
    }

    #[test]
    fn test_tags_and_search_carried() {
        let q = compiler()
            .compile(&[filter(r##"{"#p":["x"],"#e":["y","z"],"search":"hello"}"##)], 0)
            .unwrap();
        let f = &q.filters[0];
        assert_eq!(
            f.tags,
            vec![
                ("e".to_string(), vec!["y".to_string(), "z".to_string()]),
                ("p".to_string(), vec!["x".to_string()]),
            ]
        );
        assert_eq!(f.search.as_deref(), Some("hello"));
    }

    #[test]
    fn test_reason_prefix() {
        assert!(FilterError::Empty.reason().starts_with("invalid: "));
    }
}
