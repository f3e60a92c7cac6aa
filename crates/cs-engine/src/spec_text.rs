//! Block-style YAML text of an operation spec.
//!
//! The output follows the layout of the backend's own YAML dumper (sorted
//! keys, indent 4, sequences inside mappings not indented, `-   ` before
//! mapping items). The backend's parser additionally expects every line that
//! starts with a space or `-` to be shifted right by four spaces.

use serde_json::{Map, Value};
use std::fmt::Write;

const INDENT: usize = 4;

/// Full `base_file` text: block YAML with the extra four-space shift.
pub fn render_base_file(document: &Value) -> String {
    shift_nested_lines(&to_block_yaml(document))
}

/// Prefix every line starting with a space or `-` with four spaces.
pub fn shift_nested_lines(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            if line.starts_with(' ') || line.starts_with('-') {
                format!("    {line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plain block YAML of a JSON value.
pub fn to_block_yaml(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(map) if !map.is_empty() => write_mapping(&mut out, map, 0, false),
        Value::Array(items) if !items.is_empty() => write_sequence(&mut out, items, 0, false),
        other => {
            out.push_str(&scalar(other));
            out.push('\n');
        }
    }
    out
}

fn pad(out: &mut String, indent: usize) {
    out.extend(std::iter::repeat(' ').take(indent));
}

/// `inline` means the cursor already sits at `indent` (after a `-   `).
fn write_mapping(out: &mut String, map: &Map<String, Value>, indent: usize, inline: bool) {
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 || !inline {
            pad(out, indent);
        }
        out.push_str(&string_scalar(key));
        out.push(':');
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                out.push('\n');
                write_mapping(out, inner, indent + INDENT, false);
            }
            Value::Array(items) if !items.is_empty() => {
                out.push('\n');
                write_sequence(out, items, indent, false);
            }
            other => {
                out.push(' ');
                out.push_str(&scalar(other));
                out.push('\n');
            }
        }
    }
}

fn write_sequence(out: &mut String, items: &[Value], indent: usize, inline: bool) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 || !inline {
            pad(out, indent);
        }
        match item {
            Value::Object(map) if !map.is_empty() => {
                out.push_str("-   ");
                write_mapping(out, map, indent + INDENT, true);
            }
            Value::Array(inner) if !inner.is_empty() => {
                out.push_str("-   ");
                write_sequence(out, inner, indent + INDENT, true);
            }
            other => {
                out.push_str("- ");
                out.push_str(&scalar(other));
                out.push('\n');
            }
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => float_scalar(f),
            _ => n.to_string(),
        },
        Value::String(s) => string_scalar(s),
        Value::Array(_) => "[]".to_string(),
        Value::Object(_) => "{}".to_string(),
    }
}

fn float_scalar(f: f64) -> String {
    if f.is_nan() {
        ".nan".to_string()
    } else if f.is_infinite() {
        let text = if f > 0.0 { ".inf" } else { "-.inf" };
        text.to_string()
    } else {
        let mut text = String::new();
        let _ = write!(text, "{f:?}");
        text
    }
}

fn string_scalar(s: &str) -> String {
    if needs_quotes(s) {
        format!("'{}'", s.replace('\'', "''"))
    } else {
        s.to_string()
    }
}

fn needs_quotes(s: &str) -> bool {
    const RESERVED: [&str; 13] = [
        "null", "~", "true", "false", "yes", "no", "on", "off", "y", "n", ".inf", "-.inf", ".nan",
    ];
    const LEADING: &[char] = &[
        '-', '?', ':', ',', '[', ']', '{', '}', '#', '&', '*', '!', '|', '>', '\'', '"', '%', '@', '`',
    ];

    if s.is_empty() || s.trim() != s {
        return true;
    }
    if RESERVED.contains(&s.to_lowercase().as_str()) {
        return true;
    }
    if s.parse::<f64>().is_ok() || s.parse::<i64>().is_ok() {
        return true;
    }
    if s.starts_with('-') {
        if s.len() == 1 || s.starts_with("- ") || s.starts_with("---") {
            return true;
        }
    } else if s.starts_with(LEADING) {
        return true;
    }
    s.contains(": ") || s.contains(" #") || s.ends_with(':') || s.contains('\n') || s.contains('\t')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "type": "node_chain",
            "input_path": "data",
            "node_chain": [
                {"node": "Src"},
                {"node": "Filt", "parameters": {"order": "${Filt_order}"}},
                {"node": "PerformanceSinkNode", "parameters": {
                    "classes_names": ["Standard", "Target"],
                    "ir_class": "Target"
                }}
            ],
            "parameter_settings": [{"Filt_order": 3, "Filt_ratio": 0.25}]
        })
    }

    #[test]
    fn test_block_yaml_layout() {
        let expected = "\
input_path: data
node_chain:
-   node: Src
-   node: Filt
    parameters:
        order: ${Filt_order}
-   node: PerformanceSinkNode
    parameters:
        classes_names:
        - Standard
        - Target
        ir_class: Target
parameter_settings:
-   Filt_order: 3
    Filt_ratio: 0.25
type: node_chain
";
        assert_eq!(to_block_yaml(&document()), expected);
    }

    #[test]
    fn test_base_file_shifts_nested_lines() {
        let expected = "\
input_path: data
node_chain:
    -   node: Src
    -   node: Filt
        parameters:
            order: ${Filt_order}
    -   node: PerformanceSinkNode
        parameters:
            classes_names:
            - Standard
            - Target
            ir_class: Target
parameter_settings:
    -   Filt_order: 3
        Filt_ratio: 0.25
type: node_chain
";
        assert_eq!(render_base_file(&document()), expected);
    }

    #[test]
    fn test_empty_collections_and_scalars() {
        let text = to_block_yaml(&json!({"parameter_settings": [], "parameters": {}, "flag": true, "none": null}));
        assert_eq!(text, "flag: true\nnone: null\nparameter_settings: []\nparameters: {}\n");
    }

    #[test]
    fn test_strings_are_quoted_when_ambiguous() {
        assert_eq!(string_scalar("plain"), "plain");
        assert_eq!(string_scalar("true"), "'true'");
        assert_eq!(string_scalar("1.5"), "'1.5'");
        assert_eq!(string_scalar(""), "''");
        assert_eq!(string_scalar("a: b"), "'a: b'");
        assert_eq!(string_scalar("it's"), "it's");
        assert_eq!(string_scalar("*ref"), "'*ref'");
        assert_eq!(string_scalar("'q'"), "'''q'''");
    }

    #[test]
    fn test_float_scalars() {
        assert_eq!(float_scalar(1.0), "1.0");
        assert_eq!(float_scalar(f64::INFINITY), ".inf");
        assert_eq!(float_scalar(f64::NEG_INFINITY), "-.inf");
        assert_eq!(float_scalar(f64::NAN), ".nan");
    }
}
