//! Reader and writer for Valve's KeyValues text format (`.acf` / `.vdf`).
//!
//! A document is a single root key followed by a brace-delimited block.
//! Blocks keep their entries in file order so a decode/encode cycle only
//! normalises whitespace and quoting.

use crate::error::FormatError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcfValue {
    Str(String),
    Block(AcfBlock),
}

impl AcfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AcfValue::Str(value) => Some(value),
            AcfValue::Block(_) => None,
        }
    }

    pub fn as_block(&self) -> Option<&AcfBlock> {
        match self {
            AcfValue::Block(block) => Some(block),
            AcfValue::Str(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcfBlock {
    entries: Vec<(String, AcfValue)>,
}

impl AcfBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AcfValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// First entry with `key`; keys are case-sensitive.
    pub fn get(&self, key: &str) -> Option<&AcfValue> {
        self.entries
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AcfValue::as_str)
    }

    pub fn get_block(&self, key: &str) -> Option<&AcfBlock> {
        self.get(key).and_then(AcfValue::as_block)
    }

    pub fn push(&mut self, key: impl Into<String>, value: AcfValue) {
        self.entries.push((key.into(), value));
    }

    /// Replaces the first `key` in place, or appends it.
    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        let value = AcfValue::Str(value.into());
        match self.entries.iter_mut().find(|(entry_key, _)| entry_key == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Nested block under `key`, created (or replacing a scalar) if needed.
    pub fn block_entry(&mut self, key: &str) -> &mut AcfBlock {
        let index = match self.entries.iter().position(|(entry_key, _)| entry_key == key) {
            Some(index) => index,
            None => {
                self.entries
                    .push((key.to_string(), AcfValue::Block(AcfBlock::new())));
                self.entries.len() - 1
            }
        };
        let slot = &mut self.entries[index].1;
        if !matches!(slot, AcfValue::Block(_)) {
            *slot = AcfValue::Block(AcfBlock::new());
        }
        match slot {
            AcfValue::Block(block) => block,
            AcfValue::Str(_) => unreachable!("slot holds a block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcfDocument {
    pub root_key: String,
    pub root: AcfBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text { value: String, line: usize },
    Open { line: usize },
    Close { line: usize },
}

pub fn decode(text: &str) -> Result<AcfDocument, FormatError> {
    let tokens = tokenize(text)?;
    let mut iter = tokens.into_iter();

    let (root_key, root_line) = match iter.next() {
        None => return Err(FormatError::MissingRoot),
        Some(Token::Text { value, line }) => (value, line),
        Some(Token::Open { line }) | Some(Token::Close { line }) => {
            return Err(FormatError::UnexpectedBrace { line })
        }
    };

    let root = match iter.next() {
        Some(Token::Open { line }) => parse_block(&mut iter, line)?,
        Some(Token::Text { line, .. }) | Some(Token::Close { line }) => {
            return Err(FormatError::MissingValue {
                key: root_key,
                line,
            })
        }
        None => {
            return Err(FormatError::MissingValue {
                key: root_key,
                line: root_line,
            })
        }
    };

    if let Some(token) = iter.next() {
        return Err(FormatError::TrailingData {
            line: token_line(&token),
        });
    }

    Ok(AcfDocument { root_key, root })
}

pub fn encode(document: &AcfDocument) -> String {
    let mut out = String::new();
    push_quoted(&mut out, &document.root_key);
    out.push('\n');
    write_block(&mut out, &document.root, 0);
    out
}

fn parse_block(
    tokens: &mut impl Iterator<Item = Token>,
    open_line: usize,
) -> Result<AcfBlock, FormatError> {
    let mut block = AcfBlock::new();
    loop {
        let key = match tokens.next() {
            None => return Err(FormatError::UnbalancedBraces { line: open_line }),
            Some(Token::Close { .. }) => return Ok(block),
            Some(Token::Open { line }) => return Err(FormatError::UnexpectedBrace { line }),
            Some(Token::Text { value, line }) => (value, line),
        };

        match tokens.next() {
            Some(Token::Text { value, .. }) => block.push(key.0, AcfValue::Str(value)),
            Some(Token::Open { line }) => {
                let nested = parse_block(tokens, line)?;
                block.push(key.0, AcfValue::Block(nested));
            }
            Some(Token::Close { .. }) | None => {
                return Err(FormatError::MissingValue {
                    key: key.0,
                    line: key.1,
                })
            }
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, FormatError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(ch) = chars.next() {
        match ch {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '{' => tokens.push(Token::Open { line }),
            '}' => tokens.push(Token::Close { line }),
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '"' => {
                let start = line;
                let mut value = String::new();
                let mut closed = false;
                while let Some(next) = chars.next() {
                    match next {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some('\\') => value.push('\\'),
                            Some('"') => value.push('"'),
                            Some(other) => {
                                if other == '\n' {
                                    line += 1;
                                }
                                value.push('\\');
                                value.push(other);
                            }
                            None => break,
                        },
                        '\n' => {
                            line += 1;
                            value.push('\n');
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(FormatError::UnterminatedString { line: start });
                }
                tokens.push(Token::Text { value, line: start });
            }
            other => {
                let mut value = String::from(other);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '"' | '{' | '}') {
                        break;
                    }
                    value.push(next);
                    chars.next();
                }
                tokens.push(Token::Text { value, line });
            }
        }
    }

    Ok(tokens)
}

fn token_line(token: &Token) -> usize {
    match token {
        Token::Text { line, .. } | Token::Open { line } | Token::Close { line } => *line,
    }
}

fn write_block(out: &mut String, block: &AcfBlock, depth: usize) {
    push_indent(out, depth);
    out.push_str("{\n");
    for (key, value) in block.iter() {
        push_indent(out, depth + 1);
        push_quoted(out, key);
        match value {
            AcfValue::Str(value) => {
                out.push_str("\t\t");
                push_quoted(out, value);
                out.push('\n');
            }
            AcfValue::Block(nested) => {
                out.push('\n');
                write_block(out, nested, depth + 1);
            }
        }
    }
    push_indent(out, depth);
    out.push_str("}\n");
}

fn push_indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn push_quoted(out: &mut String, value: &str) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\"AppState\"\n{\n\t\"appid\"\t\t\"2357570\"\n\t\"name\"\t\t\"Overwatch® 2\"\n\t\"StateFlags\"\t\t\"6\"\n\t\"buildid\"\t\t\"100\"\n\t\"InstalledDepots\"\n\t{\n\t\t\"2357571\"\n\t\t{\n\t\t\t\"manifest\"\t\t\"111\"\n\t\t\t\"size\"\t\t\"2048\"\n\t\t}\n\t}\n}\n";

    #[test]
    fn decodes_nested_manifest() {
        let doc = decode(SAMPLE).unwrap();
        assert_eq!(doc.root_key, "AppState");
        assert_eq!(doc.root.get_str("appid"), Some("2357570"));
        assert_eq!(doc.root.get_str("name"), Some("Overwatch® 2"));
        let depot = doc
            .root
            .get_block("InstalledDepots")
            .and_then(|depots| depots.get_block("2357571"))
            .unwrap();
        assert_eq!(depot.get_str("manifest"), Some("111"));
        assert_eq!(depot.get_str("size"), Some("2048"));
    }

    #[test]
    fn encodes_in_steam_layout() {
        let doc = decode(SAMPLE).unwrap();
        assert_eq!(encode(&doc), SAMPLE);
    }

    #[test]
    fn round_trip_is_stable() {
        let loose = "AppState { appid 10 // comment\n \"name\" \"A \\\"quoted\\\" \\\\ name\" Empty { } }";
        let doc = decode(loose).unwrap();
        let once = encode(&doc);
        let twice = encode(&decode(&once).unwrap());
        assert_eq!(once, twice);
        assert_eq!(decode(&once).unwrap(), doc);
        assert_eq!(doc.root.get_str("name"), Some("A \"quoted\" \\ name"));
        assert!(doc.root.get_block("Empty").unwrap().iter().next().is_none());
    }

    #[test]
    fn keys_are_case_sensitive() {
        let doc = decode("\"AppState\" { \"buildid\" \"1\" \"BuildID\" \"2\" }").unwrap();
        assert_eq!(doc.root.get_str("buildid"), Some("1"));
        assert_eq!(doc.root.get_str("BuildID"), Some("2"));
        assert_eq!(doc.root.get_str("BUILDID"), None);
    }

    #[test]
    fn set_str_replaces_in_place() {
        let mut doc = decode(SAMPLE).unwrap();
        doc.root.set_str("StateFlags", "4");
        doc.root.set_str("TargetBuildID", "200");
        let keys: Vec<&str> = doc.root.iter().map(|(key, _)| key).collect();
        assert_eq!(
            keys,
            vec!["appid", "name", "StateFlags", "buildid", "InstalledDepots", "TargetBuildID"]
        );
        assert_eq!(doc.root.get_str("StateFlags"), Some("4"));
    }

    #[test]
    fn block_entry_creates_missing_blocks() {
        let mut block = AcfBlock::new();
        block.block_entry("InstalledDepots").block_entry("9").set_str("size", "1");
        block.block_entry("InstalledDepots").block_entry("9").set_str("manifest", "2");
        let depot = block
            .get_block("InstalledDepots")
            .and_then(|depots| depots.get_block("9"))
            .unwrap();
        assert_eq!(depot.iter().count(), 2);
        assert_eq!(depot.get_str("manifest"), Some("2"));
    }

    #[test]
    fn rejects_unbalanced_braces() {
        let err = decode("\"AppState\"\n{\n\t\"appid\" \"1\"\n").unwrap_err();
        assert_eq!(err, FormatError::UnbalancedBraces { line: 2 });
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = decode("\"AppState\"\n{\n\t\"appid\n}").unwrap_err();
        assert_eq!(err, FormatError::UnterminatedString { line: 3 });
    }

    #[test]
    fn rejects_key_without_value() {
        let err = decode("\"AppState\" { \"appid\" }").unwrap_err();
        assert!(matches!(err, FormatError::MissingValue { ref key, .. } if key == "appid"));
    }

    #[test]
    fn rejects_empty_and_trailing_input() {
        assert_eq!(decode("  \n// nothing\n").unwrap_err(), FormatError::MissingRoot);
        assert_eq!(
            decode("\"A\" { }\n}").unwrap_err(),
            FormatError::TrailingData { line: 2 }
        );
        assert_eq!(
            decode("{ }").unwrap_err(),
            FormatError::UnexpectedBrace { line: 1 }
        );
    }
}
