//! PostgREST-style query description shared by the HTTP client, the cache
//! keying in the gateway and in-memory evaluation.

use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Eq { column: String, value: String },
    Neq { column: String, value: String },
    Gte { column: String, value: String },
    Lte { column: String, value: String },
    In { column: String, values: Vec<String> },
    IsNull { column: String },
    /// Case-insensitive match where `*` is a wildcard.
    Ilike { column: String, pattern: String },
    Or { any: Vec<Filter> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Query {
    columns: Option<String>,
    filters: Vec<Filter>,
    order: Vec<Order>,
    limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push(Filter::Eq {
            column: column.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn neq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push(Filter::Neq {
            column: column.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn gte(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push(Filter::Gte {
            column: column.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn lte(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push(Filter::Lte {
            column: column.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn in_<I, T>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.filters.push(Filter::In {
            column: column.to_string(),
            values: values.into_iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.filters.push(Filter::IsNull {
            column: column.to_string(),
        });
        self
    }

    pub fn ilike(mut self, column: &str, pattern: &str) -> Self {
        self.filters.push(Filter::Ilike {
            column: column.to_string(),
            pattern: pattern.to_string(),
        });
        self
    }

    pub fn or(mut self, any: Vec<Filter>) -> Self {
        self.filters.push(Filter::Or { any });
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }

    /// Stable key for caching; identical builders produce identical keys.
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Render as PostgREST query parameters.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            self.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];
        params.extend(self.filters.iter().map(render_param));
        if !self.order.is_empty() {
            let order: Vec<String> = self
                .order
                .iter()
                .map(|o| {
                    format!(
                        "{}.{}",
                        o.column,
                        if o.ascending { "asc" } else { "desc" }
                    )
                })
                .collect();
            params.push(("order".to_string(), order.join(",")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }

    /// Whether `row` satisfies every filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| filter_matches(f, row))
    }

    /// Evaluate filters, ordering and limit against rows held in memory.
    pub fn apply(&self, rows: &[Value]) -> Vec<Value> {
        let mut out: Vec<Value> = rows.iter().filter(|r| self.matches(r)).cloned().collect();
        if !self.order.is_empty() {
            out.sort_by(|a, b| {
                for o in &self.order {
                    let ord = compare_values(a.get(&o.column), b.get(&o.column));
                    let ord = if o.ascending { ord } else { ord.reverse() };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

fn render_param(filter: &Filter) -> (String, String) {
    match filter {
        Filter::Eq { column, value } => (column.clone(), format!("eq.{}", value)),
        Filter::Neq { column, value } => (column.clone(), format!("neq.{}", value)),
        Filter::Gte { column, value } => (column.clone(), format!("gte.{}", value)),
        Filter::Lte { column, value } => (column.clone(), format!("lte.{}", value)),
        Filter::In { column, values } => (column.clone(), format!("in.({})", values.join(","))),
        Filter::IsNull { column } => (column.clone(), "is.null".to_string()),
        Filter::Ilike { column, pattern } => (column.clone(), format!("ilike.{}", pattern)),
        Filter::Or { any } => {
            let inner: Vec<String> = any.iter().map(render_inline).collect();
            ("or".to_string(), format!("({})", inner.join(",")))
        }
    }
}

fn render_inline(filter: &Filter) -> String {
    match filter {
        Filter::Or { any } => {
            let inner: Vec<String> = any.iter().map(render_inline).collect();
            format!("or({})", inner.join(","))
        }
        other => {
            let (column, op) = render_param(other);
            format!("{}.{}", column, op)
        }
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn filter_matches(filter: &Filter, row: &Value) -> bool {
    let cell = |column: &str| row.get(column).and_then(render_value);
    match filter {
        Filter::Eq { column, value } => cell(column).as_deref() == Some(value.as_str()),
        Filter::Neq { column, value } => cell(column).as_deref() != Some(value.as_str()),
        Filter::Gte { column, value } => cell(column)
            .map(|c| compare_text(&c, value) != Ordering::Less)
            .unwrap_or(false),
        Filter::Lte { column, value } => cell(column)
            .map(|c| compare_text(&c, value) != Ordering::Greater)
            .unwrap_or(false),
        Filter::In { column, values } => cell(column)
            .map(|c| values.iter().any(|v| *v == c))
            .unwrap_or(false),
        Filter::IsNull { column } => cell(column).is_none(),
        Filter::Ilike { column, pattern } => cell(column)
            .map(|c| ilike(&c, pattern))
            .unwrap_or(false),
        Filter::Or { any } => any.iter().any(|f| filter_matches(f, row)),
    }
}

fn ilike(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return text == pattern;
    }
    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(part) {
                return false;
            }
            pos = part.len();
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    match parts.last() {
        Some(last) if !last.is_empty() => text.ends_with(last),
        _ => true,
    }
}

fn compare_text(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.and_then(render_value), b.and_then(render_value)) {
        (Some(x), Some(y)) => compare_text(&x, &y),
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}
