/// Pure `$` references resolved without a script engine
///
/// `$json.a.b`, `$json["k"]`, `$node["Name"].json.x`, `$input.item.json.x`,
/// `$execution.id`, `$itemIndex`... are turned into a JSONPath over the scope
/// document and selected with `jsonpath_lib`. The referenced value keeps its type.

use serde_json::Value;

/// Root names a reference may start with
pub const ROOTS: &[&str] = &[
    "json",
    "node",
    "input",
    "execution",
    "workflow",
    "itemIndex",
    "runIndex",
    "parameter",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `$root.path[...]` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    root: String,
    path: Vec<PathSegment>,
}

impl Reference {
    /// Parse `expr` if it is nothing but a reference
    pub fn parse(expr: &str) -> Option<Self> {
        let rest = expr.trim().strip_prefix('$')?;
        let root_len = ident_len(rest);
        let root = &rest[..root_len];
        if !ROOTS.contains(&root) {
            return None;
        }

        let mut path = Vec::new();
        let mut tail = &rest[root_len..];
        while !tail.is_empty() {
            if let Some(after) = tail.strip_prefix('.') {
                let len = ident_len(after);
                if len == 0 {
                    return None;
                }
                path.push(PathSegment::Key(after[..len].to_string()));
                tail = &after[len..];
            } else if let Some(after) = tail.strip_prefix('[') {
                let close = after.find(']')?;
                path.push(parse_bracket(after[..close].trim())?);
                tail = &after[close + 1..];
            } else {
                return None;
            }
        }

        Some(Self {
            root: root.to_string(),
            path,
        })
    }

    /// Bracket-notation JSONPath, e.g. `$['node']['Name']['json']['x']`
    pub fn to_json_path(&self) -> String {
        let mut out = format!("$['{}']", self.root);
        for segment in &self.path {
            match segment {
                PathSegment::Key(key) => out.push_str(&format!("['{}']", key)),
                PathSegment::Index(index) => out.push_str(&format!("[{}]", index)),
            }
        }
        out
    }

    /// Select the referenced value; anything missing is null
    pub fn select(&self, document: &Value) -> Value {
        let path = self.to_json_path();
        match jsonpath_lib::select(document, &path) {
            Ok(found) => found.first().map(|value| (*value).clone()).unwrap_or(Value::Null),
            Err(e) => {
                tracing::debug!("🔍 JSONPath '{}' failed: {:?}", path, e);
                Value::Null
            }
        }
    }
}

fn ident_len(input: &str) -> usize {
    input
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(input.len())
}

fn parse_bracket(inner: &str) -> Option<PathSegment> {
    let quoted = inner.len() >= 2
        && ((inner.starts_with('"') && inner.ends_with('"')) || (inner.starts_with('\'') && inner.ends_with('\'')));

    if quoted {
        let key = &inner[1..inner.len() - 1];
        if key.contains(['"', '\'', '\\', '[', ']']) {
            return None;
        }
        return Some(PathSegment::Key(key.to_string()));
    }

    inner.parse::<usize>().ok().map(PathSegment::Index)
}
