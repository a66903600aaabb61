//! Fixed-format response templates.
//!
//! Devices on this setup answer with short human readable lines such as
//! `21.50 *C, 45.20 %\r\n`. A [`ResponseTemplate`] describes such a line with
//! literal text and named numeric placeholders:
//!
//! ```text
//! {temperature:f} *C, {humidity:f} %\r\n
//! ```
//!
//! The template is compiled once into an anchored regex. Literal text is
//! escaped, so units and punctuation must match byte for byte; a reply that
//! deviates anywhere is rejected as a whole. There is no partial match.
//!
//! Placeholder types:
//! - `{name:f}` floating point (`1`, `-2.5`, `.5`, `1e-3`, `nan`, `inf`)
//! - `{name:d}` signed integer
//!
//! `{{` and `}}` produce literal braces.

use crate::error::{AppResult, DaqError};
use regex::Regex;

const FLOAT_PATTERN: &str =
    r"[-+]?(?:(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][-+]?[0-9]+)?|(?i:nan|inf(?:inity)?))";
const INT_PATTERN: &str = r"[-+]?[0-9]+";

/// A compiled response template with named numeric fields.
#[derive(Debug, Clone)]
pub struct ResponseTemplate {
    source: String,
    regex: Regex,
    fields: Vec<String>,
}

/// Field values extracted from one response, in template order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFields {
    values: Vec<(String, f64)>,
}

impl ParsedFields {
    /// Value of a named field.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| *value)
    }

    /// Value of a named field, or an error naming the missing field.
    pub fn require(&self, name: &str) -> AppResult<f64> {
        self.get(name)
            .ok_or_else(|| DaqError::Configuration(format!("template has no field '{}'", name)))
    }

    /// Iterates `(name, value)` pairs in template order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the template had no fields.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

enum Token {
    Literal(String),
    Field { name: String, kind: char },
}

impl ResponseTemplate {
    /// Compiles a template string.
    ///
    /// # Errors
    /// Returns `DaqError::Configuration` for unbalanced braces, unknown
    /// placeholder types, invalid or duplicate field names.
    pub fn compile(template: &str) -> AppResult<Self> {
        let tokens = tokenize(template)?;

        let mut pattern = String::from("^");
        let mut fields: Vec<String> = Vec::new();
        for token in tokens {
            match token {
                Token::Literal(text) => pattern.push_str(&regex::escape(&text)),
                Token::Field { name, kind } => {
                    if fields.contains(&name) {
                        return Err(DaqError::Configuration(format!(
                            "duplicate field '{}' in template {:?}",
                            name, template
                        )));
                    }
                    let body = match kind {
                        'f' => FLOAT_PATTERN,
                        'd' => INT_PATTERN,
                        other => {
                            return Err(DaqError::Configuration(format!(
                                "unknown placeholder type ':{}' in template {:?}",
                                other, template
                            )))
                        }
                    };
                    pattern.push_str(&format!("(?P<{}>{})", name, body));
                    fields.push(name);
                }
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|e| {
            DaqError::Configuration(format!("failed to compile template {:?}: {}", template, e))
        })?;

        Ok(Self {
            source: template.to_string(),
            regex,
            fields,
        })
    }

    /// Parses one raw response line.
    ///
    /// # Errors
    /// `DaqError::Parse` if the line does not match the template exactly.
    pub fn parse(&self, response: &str) -> AppResult<ParsedFields> {
        let captures = self.regex.captures(response).ok_or_else(|| DaqError::Parse {
            response: response.to_string(),
            template: self.source.clone(),
        })?;

        let mut values = Vec::with_capacity(self.fields.len());
        for name in &self.fields {
            let text = captures
                .name(name)
                .map(|m| m.as_str())
                .ok_or_else(|| DaqError::Parse {
                    response: response.to_string(),
                    template: self.source.clone(),
                })?;
            let value = text
                .parse::<f64>()
                .map_err(|_| DaqError::InvalidNumber(text.to_string()))?;
            values.push((name.clone(), value));
        }

        Ok(ParsedFields { values })
    }

    /// Field names in template order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The original template text.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn tokenize(template: &str) -> AppResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut spec = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    spec.push(inner);
                }
                if !closed {
                    return Err(DaqError::Configuration(format!(
                        "unterminated placeholder in template {:?}",
                        template
                    )));
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(parse_placeholder(&spec, template)?);
            }
            '}' => {
                return Err(DaqError::Configuration(format!(
                    "unmatched '}}' in template {:?}",
                    template
                )))
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn parse_placeholder(spec: &str, template: &str) -> AppResult<Token> {
    let (name, kind) = spec.split_once(':').ok_or_else(|| {
        DaqError::Configuration(format!(
            "placeholder '{{{}}}' needs a type (:f or :d) in template {:?}",
            spec, template
        ))
    })?;

    let valid_name = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_name {
        return Err(DaqError::Configuration(format!(
            "invalid field name '{}' in template {:?}",
            name, template
        )));
    }

    let mut kind_chars = kind.chars();
    match (kind_chars.next(), kind_chars.next()) {
        (Some(k), None) => Ok(Token::Field {
            name: name.to_string(),
            kind: k,
        }),
        _ => Err(DaqError::Configuration(format!(
            "unknown placeholder type ':{}' in template {:?}",
            kind, template
        ))),
    }
}

/// Parses a bare numeric reply (`" 20.00\r\n"`), ignoring surrounding whitespace.
pub fn parse_number(response: &str) -> AppResult<f64> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err(DaqError::Parse {
            response: response.to_string(),
            template: "<number>".to_string(),
        });
    }
    trimmed
        .parse::<f64>()
        .map_err(|_| DaqError::InvalidNumber(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parses_two_field_sensor_line() {
        let template = ResponseTemplate::compile("{temperature:f} *C, {humidity:f} %\r\n").unwrap();
        let fields = template.parse("21.50 *C, 45.20 %\r\n").unwrap();
        assert_eq!(fields.get("temperature"), Some(21.50));
        assert_eq!(fields.get("humidity"), Some(45.20));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn parses_three_field_sensor_line_in_template_order() {
        let template =
            ResponseTemplate::compile("{temperature:f} *C, {pressure:f} hPa, {humidity:f} %\r\n")
                .unwrap();
        let fields = template.parse("-3.25 *C, 1013.2 hPa, 40 %\r\n").unwrap();
        let names: Vec<&str> = fields.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["temperature", "pressure", "humidity"]);
        assert_eq!(fields.get("temperature"), Some(-3.25));
        assert_eq!(fields.get("pressure"), Some(1013.2));
        assert_eq!(fields.get("humidity"), Some(40.0));
    }

    #[test]
    fn accepts_exponent_and_non_ascii_literals() {
        let template = ResponseTemplate::compile("Current position: {pos:f}°\r\n").unwrap();
        let fields = template.parse("Current position: 1.5e1°\r\n").unwrap();
        assert_eq!(fields.get("pos"), Some(15.0));
    }

    #[test]
    fn rejects_wrong_literal_text() {
        let template = ResponseTemplate::compile("{temperature:f} *C, {humidity:f} %\r\n").unwrap();
        let err = template.parse("21.50 C, 45.20 %\r\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn rejects_missing_field_and_missing_terminator() {
        let template = ResponseTemplate::compile("{temperature:f} *C, {humidity:f} %\r\n").unwrap();
        assert!(template.parse("21.50 *C, %\r\n").is_err());
        assert!(template.parse("21.50 *C, 45.20 %").is_err());
        assert!(template.parse("21.50 *C, 45.20 %\r\nextra").is_err());
    }

    #[test]
    fn rejects_empty_line() {
        let template = ResponseTemplate::compile("{temperature:f} *C\r\n").unwrap();
        assert!(template.parse("").is_err());
    }

    #[test]
    fn integer_placeholder_rejects_fraction() {
        let template = ResponseTemplate::compile("N={count:d}").unwrap();
        assert_eq!(template.parse("N=-12").unwrap().get("count"), Some(-12.0));
        assert!(template.parse("N=1.5").is_err());
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let template = ResponseTemplate::compile("(x) {v:f} [a.b]?").unwrap();
        assert!(template.parse("(x) 1 [a.b]?").is_ok());
        assert!(template.parse("(x) 1 [aXb]?").is_err());
    }

    #[test]
    fn escaped_braces() {
        let template = ResponseTemplate::compile("{{{v:f}}}").unwrap();
        assert_eq!(template.parse("{2}").unwrap().get("v"), Some(2.0));
    }

    #[test]
    fn invalid_templates_are_configuration_errors() {
        for bad in ["{x}", "{x:q}", "{x:f", "x}", "{1x:f}", "{a:f}{a:f}"] {
            let err = ResponseTemplate::compile(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{}", bad);
        }
    }

    #[test]
    fn bare_numbers() {
        assert_eq!(parse_number(" 20.00\r\n").unwrap(), 20.0);
        assert_eq!(parse_number("-1\n").unwrap(), -1.0);
        assert!(parse_number("\r\n").is_err());
        assert!(parse_number("ERR\r\n").is_err());
    }
}
