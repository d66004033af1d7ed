//! OF-021: Template text parser.
//!
//! Accepts the OpenNebula template syntax:
//! - `#` comments to end of line
//! - `KEY = value`, `KEY = "quoted value"` (quoted values may span lines,
//!   with `\"` and `\\` escapes)
//! - `KEY = [ A = "1", B = 2 ]`, pairs separated by commas and/or newlines

use super::{DynTemplate, Element, Pair, Vector};
use crate::error::{Error, Result};

/// Parse template text into a [`DynTemplate`].
pub fn parse(text: &str) -> Result<DynTemplate> {
    let mut cursor = Cursor::new(text);
    let mut template = DynTemplate::new();

    loop {
        cursor.skip_blank();
        if cursor.peek().is_none() {
            break;
        }
        let key = cursor.key()?;
        cursor.skip_inline_space();
        cursor.expect('=')?;
        cursor.skip_inline_space();
        if cursor.peek() == Some('[') {
            cursor.bump();
            let pairs = parse_vector_body(&mut cursor)?;
            template.elements.push(Element::Vector(Vector { key, pairs }));
        } else {
            let value = cursor.value(false)?;
            template.elements.push(Element::Pair(Pair { key, value }));
        }
        cursor.end_of_element()?;
    }

    Ok(template)
}

fn parse_vector_body(cursor: &mut Cursor) -> Result<Vec<Pair>> {
    let mut pairs = Vec::new();
    loop {
        cursor.skip_blank();
        match cursor.peek() {
            Some(']') => {
                cursor.bump();
                return Ok(pairs);
            }
            Some(',') if !pairs.is_empty() => {
                cursor.bump();
                continue;
            }
            None => return Err(cursor.error("unterminated vector")),
            _ => {}
        }
        let key = cursor.key()?;
        cursor.skip_inline_space();
        cursor.expect('=')?;
        cursor.skip_inline_space();
        let value = cursor.value(true)?;
        pairs.push(Pair { key, value });
    }
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Template {
            line: self.line,
            message: message.into(),
        }
    }

    fn skip_inline_space(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\r')) {
            self.bump();
        }
    }

    /// Skip whitespace, newlines and comments.
    fn skip_blank(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn expect(&mut self, want: char) -> Result<()> {
        match self.peek() {
            Some(c) if c == want => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{want}', found '{c}'"))),
            None => Err(self.error(format!("expected '{want}', found end of input"))),
        }
    }

    fn key(&mut self) -> Result<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            self.bump();
        }
        if self.pos == start {
            return Err(match self.peek() {
                Some(c) => self.error(format!("expected attribute name, found '{c}'")),
                None => self.error("expected attribute name"),
            });
        }
        Ok(self.chars[start..self.pos]
            .iter()
            .collect::<String>()
            .to_uppercase())
    }

    fn value(&mut self, in_vector: bool) -> Result<String> {
        if self.peek() == Some('"') {
            self.bump();
            return self.quoted();
        }
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || (in_vector && matches!(c, ',' | ']')) {
                break;
            }
            out.push(c);
            self.bump();
        }
        Ok(out)
    }

    fn quoted(&mut self) -> Result<String> {
        let opened_at = self.line;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some(c @ ('"' | '\\')) => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => break,
                },
                Some('"') => return Ok(out),
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(Error::Template {
            line: opened_at,
            message: "unterminated quoted value".to_string(),
        })
    }

    /// After an element only blanks, a comment or a newline may follow.
    fn end_of_element(&mut self) -> Result<()> {
        self.skip_inline_space();
        match self.peek() {
            None | Some('\n') | Some('#') => Ok(()),
            Some(c) => Err(self.error(format!("unexpected '{c}' after value"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_of021_parse_pairs_and_vectors() {
        let text = r#"
# web template
NAME = "web"
memory = 1024
DISK = [ IMAGE_ID = "4", SIZE = 2048 ]
CONTEXT = [
  NETWORK = "YES",
  SSH_PUBLIC_KEY = "$USER[SSH_PUBLIC_KEY]"
]
"#;
        let t = parse(text).unwrap();
        assert_eq!(t.get_str("NAME"), Some("web"));
        assert_eq!(t.get_str("MEMORY"), Some("1024"));
        let disk = t.get_vector("DISK").unwrap();
        assert_eq!(disk.get_str("IMAGE_ID"), Some("4"));
        assert_eq!(disk.get_str("SIZE"), Some("2048"));
        let ctx = t.get_vector("CONTEXT").unwrap();
        assert_eq!(ctx.get_str("SSH_PUBLIC_KEY"), Some("$USER[SSH_PUBLIC_KEY]"));
        assert_eq!(t.elements.len(), 4);
    }

    #[test]
    fn test_of021_multiline_quoted_and_escapes() {
        let text = "START_SCRIPT = \"echo \\\"a\\\"\nexit 0\"\nX=1";
        let t = parse(text).unwrap();
        assert_eq!(t.get_str("START_SCRIPT"), Some("echo \"a\"\nexit 0"));
        assert_eq!(t.get_str("X"), Some("1"));
    }

    #[test]
    fn test_of021_newline_separated_vector_pairs() {
        let t = parse("OS=[\n ARCH=x86_64\n BOOT=disk0\n]").unwrap();
        let os = t.get_vector("OS").unwrap();
        assert_eq!(os.pairs.len(), 2);
        assert_eq!(os.get_str("BOOT"), Some("disk0"));
    }

    #[test]
    fn test_of021_empty_vector_and_empty_value() {
        let t = parse("EMPTY=[]\nBLANK=\"\"").unwrap();
        assert!(t.get_vector("EMPTY").unwrap().pairs.is_empty());
        assert_eq!(t.get_str("BLANK"), Some(""));
    }

    #[test]
    fn test_of021_errors_report_line() {
        let err = parse("A=1\nB 2").unwrap_err();
        match err {
            Error::Template { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("expected '='"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse("A=\"open").is_err());
        assert!(parse("V=[ A=1").is_err());
        assert!(parse("= 1").is_err());
        assert!(parse("A=1 B=2").is_err());
    }

    #[test]
    fn test_of021_trailing_comment() {
        let t = parse("CPU = 0.5 # half a core\nVCPU=1").unwrap();
        assert_eq!(t.get_str("CPU"), Some("0.5"));
        assert_eq!(t.get_str("VCPU"), Some("1"));
    }

    #[test]
    fn test_of021_render_then_parse_real_template() {
        let text = "NAME=\"vm\"\nNIC=[\n  NETWORK_ID=\"0\",\n  IP=\"10.0.0.2\" ]\n";
        let t = parse(text).unwrap();
        assert_eq!(t.render(), text);
    }

    fn arb_key() -> impl Strategy<Value = String> {
        "[A-Z][A-Z0-9_]{0,8}"
    }

    fn arb_value() -> impl Strategy<Value = String> {
        "[ -~\n]{0,16}"
    }

    fn arb_element() -> impl Strategy<Value = Element> {
        prop_oneof![
            (arb_key(), arb_value()).prop_map(|(key, value)| Element::Pair(Pair { key, value })),
            (arb_key(), prop::collection::vec((arb_key(), arb_value()), 0..4)).prop_map(
                |(key, pairs)| Element::Vector(Vector {
                    key,
                    pairs: pairs
                        .into_iter()
                        .map(|(key, value)| Pair { key, value })
                        .collect(),
                })
            ),
        ]
    }

    proptest! {
        #[test]
        fn test_of021_parse_inverts_render(elements in prop::collection::vec(arb_element(), 0..6)) {
            let t = DynTemplate { elements };
            let reparsed = parse(&t.render()).unwrap();
            prop_assert_eq!(reparsed, t);
        }
    }
}
