use serde_json::Value;

/// One line of control-plane output after sanitizing.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    /// Valid JSON; `text` is the sanitized line as printed.
    Structured { text: String, value: Value },
    Diagnostic(String),
}

impl OutputLine {
    /// The sanitized line as it should appear in a log stream.
    pub fn into_text(self) -> String {
        match self {
            OutputLine::Structured { text, .. } | OutputLine::Diagnostic(text) => text,
        }
    }
}

/// Strips control characters (including ANSI escape sequences) and
/// surrounding whitespace. Tabs become spaces.
pub fn sanitize_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        if ch == '\t' {
            out.push(' ');
            continue;
        }
        if ch.is_control() || ch == '\u{feff}' {
            continue;
        }
        out.push(ch);
    }
    out.trim().to_string()
}

/// Sanitizes `raw` and decides whether it is JSON. Blank lines yield `None`.
pub fn classify_line(raw: &str) -> Option<OutputLine> {
    let clean = sanitize_line(raw);
    if clean.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(&clean) {
        Ok(value) => Some(OutputLine::Structured { text: clean, value }),
        Err(_) => Some(OutputLine::Diagnostic(clean)),
    }
}

/// Joins sanitized stdout lines and parses them as one JSON document.
pub fn parse_json_document(lines: &[String]) -> Option<Value> {
    let joined = lines
        .iter()
        .map(|line| sanitize_line(line))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if joined.is_empty() {
        return None;
    }
    serde_json::from_str(&joined).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_ansi_and_control_bytes() {
        assert_eq!(
            sanitize_line("\u{1b}[31m[ERROR]\u{1b}[0m disk\u{0} full\r"),
            "[ERROR] disk full"
        );
        assert_eq!(sanitize_line("\u{feff}  hello\tworld  "), "hello world");
    }

    #[test]
    fn classify_splits_json_from_diagnostics() {
        assert_eq!(
            classify_line(r#"  {"Name":"a"} "#),
            Some(OutputLine::Structured {
                text: r#"{"Name":"a"}"#.to_string(),
                value: serde_json::json!({"Name": "a"}),
            })
        );
        assert_eq!(
            classify_line("Starting a..."),
            Some(OutputLine::Diagnostic("Starting a...".to_string()))
        );
        assert_eq!(classify_line(" \r\n"), None);
    }

    #[test]
    fn scalars_are_json_too() {
        for (raw, value) in [
            ("42", serde_json::json!(42)),
            ("true", serde_json::json!(true)),
            (r#""x""#, serde_json::json!("x")),
        ] {
            assert_eq!(
                classify_line(raw),
                Some(OutputLine::Structured {
                    text: raw.to_string(),
                    value,
                })
            );
        }
    }

    #[test]
    fn log_text_keeps_the_printed_form() {
        let line = classify_line("\u{1b}[32m{ \"k\" : 1 }\u{1b}[0m").expect("line");
        assert!(matches!(line, OutputLine::Structured { .. }));
        assert_eq!(line.into_text(), r#"{ "k" : 1 }"#);
    }

    #[test]
    fn json_document_may_span_lines() {
        let lines = vec![
            "[".to_string(),
            "  {\"Name\": \"a\", \"State\": \"Running\"}".to_string(),
            "]\r".to_string(),
        ];
        let value = parse_json_document(&lines).expect("json");
        assert_eq!(value[0]["Name"], "a");
        assert!(parse_json_document(&["Access denied".to_string()]).is_none());
        assert!(parse_json_document(&[]).is_none());
    }
}
