/// `{{ expr }}` placeholder parsing

/// One piece of a parameter string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    /// Trimmed expression body between `{{` and `}}`
    Expr(&'a str),
}

/// Split a string into text and placeholder segments
///
/// An unterminated `{{` is kept as text.
pub fn split_template(input: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        let body = &rest[open + 2..open + 2 + close];
        segments.push(Segment::Expr(body.trim()));
        rest = &rest[open + 2 + close + 2..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    segments
}

pub fn has_placeholder(input: &str) -> bool {
    split_template(input)
        .iter()
        .any(|segment| matches!(segment, Segment::Expr(_)))
}

/// Body of a string that is exactly one placeholder
pub fn whole_expression(input: &str) -> Option<&str> {
    match split_template(input.trim()).as_slice() {
        [Segment::Expr(body)] => Some(*body),
        _ => None,
    }
}

/// True when the body carries no reference, operator, call or quote syntax
///
/// Such a placeholder (`{{ hello world }}`) is unwrapped to its literal text.
pub fn is_bare_literal(body: &str) -> bool {
    const SYNTAX: &[char] = &[
        '$', '+', '-', '*', '/', '%', '<', '>', '=', '!', '&', '|', '?', ':', '(', ')', '[', ']', '"', '\'', '`',
        '~', '^', '#',
    ];
    !body.is_empty() && !body.contains(SYNTAX) && !body.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_mixed_text() {
        let segments = split_template("Hello {{ $json.name }}, you are {{$json.age}}!");
        assert_eq!(
            segments,
            vec![
                Segment::Text("Hello "),
                Segment::Expr("$json.name"),
                Segment::Text(", you are "),
                Segment::Expr("$json.age"),
                Segment::Text("!"),
            ]
        );
    }

    #[test]
    fn test_unterminated_placeholder_is_text() {
        assert_eq!(split_template("a {{ b"), vec![Segment::Text("a {{ b")]);
        assert!(!has_placeholder("a {{ b"));
    }

    #[test]
    fn test_whole_expression_and_literals() {
        assert_eq!(whole_expression("{{ hello }}"), Some("hello"));
        assert_eq!(whole_expression("x {{ hello }}"), None);
        assert!(is_bare_literal("hello world"));
        assert!(!is_bare_literal("$json.a"));
        assert!(!is_bare_literal("1 + 2"));
        assert!(!is_bare_literal("upper(x)"));
        assert!(!is_bare_literal("'quoted'"));
    }
}
