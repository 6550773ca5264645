//! Incremental element framing for an XML document that never ends.
//!
//! The feed server opens its root element once and then streams children into
//! it for as long as the connection lives. A conventional parser waits for the
//! end of the document before it reports success; this one reports every
//! complete child of the root as soon as its matching close tag arrives.
//!
//! # Framing
//!
//! ```text
//! <?xml version="1.0"?>        skipped (prolog)
//! <Root a="1">                 -> RootOpen(b"<Root a=\"1\">")
//!   <Msg id="1">A</Msg>        -> Child(b"<Msg id=\"1\">A</Msg>")
//!   <Ping/>                    -> Child(b"<Ping/>")
//! </Root>                      -> ProtocolError(RootClosed)
//! ```
//!
//! Markup is tokenized by `quick_xml`, one token at a time over the unread
//! part of the buffer. A token cut off by the end of the buffer is retried once
//! more bytes arrive. Payloads are the exact byte spans of the input. Nothing
//! is decoded or re-serialized, so attributes, namespace prefixes, CDATA
//! sections and entity references survive untouched.

use quick_xml::errors::{Error as XmlError, SyntaxError};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Upper bound for a single buffered element unless configured otherwise.
pub const DEFAULT_MAX_ELEMENT_SIZE: usize = 16 * 1024 * 1024;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One framing result produced by [`StreamingElementParser::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementEvent {
    /// The server's root open tag, exactly as received.
    RootOpen(Vec<u8>),
    /// One complete child of the root element, exactly as received.
    Child(Vec<u8>),
    /// The stream violated the framing rules. Always the last event of a parser.
    ProtocolError(ParseError),
}

/// Reasons why the byte stream cannot be framed any further.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("character data before the root element")]
    TextBeforeRoot,

    #[error("character data directly inside the root element")]
    TextInRoot,

    #[error("root element </{0}> was closed")]
    RootClosed(String),

    #[error("second root element <{0}> on the same connection")]
    SecondRoot(String),

    #[error("mismatched close tag: expected </{expected}>, found </{found}>")]
    MismatchedClose { expected: String, found: String },

    #[error("malformed markup: {0}")]
    Malformed(String),

    #[error("element exceeds the limit of {0} bytes")]
    ElementTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prolog,
    InRoot,
    Failed,
}

#[derive(Debug)]
enum Token {
    Text { blank: bool },
    Skip,
    XmlDecl,
    Doctype,
    CData,
    Start { name: Vec<u8>, empty: bool },
    End { name: Vec<u8> },
}

/// Byte-stream tokenizer that turns an endless document into element events.
///
/// A parser belongs to exactly one connection. Each reconnect starts a new
/// document and therefore a new parser.
#[derive(Debug)]
pub struct StreamingElementParser {
    buf: Vec<u8>,
    pos: usize,
    phase: Phase,
    bom_checked: bool,
    root_name: Vec<u8>,
    open: Vec<Vec<u8>>,
    child_start: usize,
    max_element_size: usize,
}

impl Default for StreamingElementParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ELEMENT_SIZE)
    }
}

impl StreamingElementParser {
    pub fn new(max_element_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            phase: Phase::Prolog,
            bom_checked: false,
            root_name: Vec::new(),
            open: Vec::new(),
            child_start: 0,
            max_element_size,
        }
    }

    /// Nesting depth: 0 before the root, 1 between children, more inside one.
    pub fn depth(&self) -> usize {
        match self.phase {
            Phase::Prolog => 0,
            Phase::InRoot | Phase::Failed => 1 + self.open.len(),
        }
    }

    /// Bytes held back because they belong to an incomplete token or child.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends `bytes` to the stream and returns every event they complete.
    ///
    /// After a [`ElementEvent::ProtocolError`] the parser is spent and ignores
    /// further input.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ElementEvent> {
        let mut events = Vec::new();
        if self.phase == Phase::Failed {
            return events;
        }

        self.buf.extend_from_slice(bytes);
        if let Err(e) = self.process(&mut events) {
            self.phase = Phase::Failed;
            self.buf.clear();
            self.open.clear();
            self.pos = 0;
            events.push(ElementEvent::ProtocolError(e));
        }
        events
    }

    fn process(&mut self, events: &mut Vec<ElementEvent>) -> Result<(), ParseError> {
        if !self.skip_bom() {
            return Ok(());
        }

        while self.pos < self.buf.len() {
            let Some((token, len)) = next_token(&self.buf[self.pos..])? else {
                break;
            };
            let start = self.pos;
            let end = start + len;
            // Bounded per token here and on the unread tail below
            let span_start = if self.open.is_empty() {
                start
            } else {
                self.child_start
            };
            self.check_size(end - span_start)?;
            self.pos = end;

            match self.phase {
                Phase::Prolog => self.on_prolog(token, start, events)?,
                Phase::InRoot if self.open.is_empty() => {
                    self.on_root_level(token, start, events)?
                }
                Phase::InRoot => self.on_child(token, events)?,
                Phase::Failed => return Ok(()),
            }
        }

        self.compact();
        self.check_size(self.buf.len())
    }

    /// Steps over a UTF-8 byte order mark at the very start of the stream.
    /// Returns `false` while the first bytes could still turn out to be one.
    fn skip_bom(&mut self) -> bool {
        if self.bom_checked {
            return true;
        }
        let head = &self.buf[..self.buf.len().min(UTF8_BOM.len())];
        if head.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(head) {
            return false;
        }
        if head == UTF8_BOM {
            self.pos = UTF8_BOM.len();
        }
        self.bom_checked = true;
        true
    }

    fn on_prolog(
        &mut self,
        token: Token,
        start: usize,
        events: &mut Vec<ElementEvent>,
    ) -> Result<(), ParseError> {
        match token {
            Token::Text { blank: true } | Token::Skip | Token::XmlDecl | Token::Doctype => Ok(()),
            Token::Text { blank: false } | Token::CData => Err(ParseError::TextBeforeRoot),
            Token::End { name } => Err(ParseError::Malformed(format!(
                "close tag </{}> before the root element",
                lossy(&name)
            ))),
            Token::Start { name, empty: true } => Err(ParseError::RootClosed(lossy(&name))),
            Token::Start { name, empty: false } => {
                self.root_name = name;
                self.phase = Phase::InRoot;
                events.push(ElementEvent::RootOpen(self.buf[start..self.pos].to_vec()));
                Ok(())
            }
        }
    }

    fn on_root_level(
        &mut self,
        token: Token,
        start: usize,
        events: &mut Vec<ElementEvent>,
    ) -> Result<(), ParseError> {
        match token {
            Token::Text { blank: true } | Token::Skip => Ok(()),
            Token::Text { blank: false } | Token::CData => Err(ParseError::TextInRoot),
            Token::XmlDecl => Err(ParseError::SecondRoot(format!(
                "?xml (inside <{}>)",
                lossy(&self.root_name)
            ))),
            Token::Doctype => Err(ParseError::Malformed(
                "DOCTYPE inside the root element".to_string(),
            )),
            Token::End { name } if name == self.root_name => {
                Err(ParseError::RootClosed(lossy(&name)))
            }
            Token::End { name } => Err(ParseError::MismatchedClose {
                expected: lossy(&self.root_name),
                found: lossy(&name),
            }),
            Token::Start { name, .. } if name == self.root_name => {
                Err(ParseError::SecondRoot(lossy(&name)))
            }
            Token::Start { empty: true, .. } => {
                events.push(ElementEvent::Child(self.buf[start..self.pos].to_vec()));
                Ok(())
            }
            Token::Start { name, empty: false } => {
                self.child_start = start;
                self.open.push(name);
                Ok(())
            }
        }
    }

    fn on_child(&mut self, token: Token, events: &mut Vec<ElementEvent>) -> Result<(), ParseError> {
        match token {
            Token::Text { .. } | Token::Skip | Token::CData => Ok(()),
            Token::XmlDecl => Err(ParseError::Malformed(
                "XML declaration inside an element".to_string(),
            )),
            Token::Doctype => Err(ParseError::Malformed(
                "DOCTYPE inside an element".to_string(),
            )),
            Token::Start { empty: true, .. } => Ok(()),
            Token::Start { name, empty: false } => {
                self.open.push(name);
                Ok(())
            }
            Token::End { name } => {
                // `open` is non-empty whenever this handler runs.
                let expected = self.open.last().map(Vec::as_slice).unwrap_or_default();
                if name == expected {
                    self.open.pop();
                    if self.open.is_empty() {
                        let element = self.buf[self.child_start..self.pos].to_vec();
                        events.push(ElementEvent::Child(element));
                    }
                    Ok(())
                } else if name == self.root_name {
                    Err(ParseError::RootClosed(lossy(&name)))
                } else {
                    Err(ParseError::MismatchedClose {
                        expected: lossy(expected),
                        found: lossy(&name),
                    })
                }
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), ParseError> {
        if len > self.max_element_size {
            Err(ParseError::ElementTooLarge(self.max_element_size))
        } else {
            Ok(())
        }
    }

    /// Drops everything that can no longer become part of an event.
    fn compact(&mut self) {
        let keep_from = if self.open.is_empty() {
            self.pos
        } else {
            self.child_start
        };
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            self.pos -= keep_from;
            self.child_start = self.child_start.saturating_sub(keep_from);
        }
    }
}

fn token_reader(input: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(input);
    let config = reader.config_mut();
    // Nesting is tracked across reads by the parser itself.
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    reader
}

/// Reads the token at the start of `input` and returns it with its length.
/// `Ok(None)` means the token is cut off and more bytes are needed.
fn next_token(input: &[u8]) -> Result<Option<(Token, usize)>, ParseError> {
    let mut reader = token_reader(input);
    let event = match reader.read_event() {
        Ok(event) => event,
        Err(e) => return incomplete_or_malformed(input, e),
    };
    let len = reader.buffer_position() as usize;

    let token = match event {
        // Text only ends at the next '<'
        Event::Text(_) if len == input.len() => return Ok(None),
        Event::Text(text) => Token::Text {
            blank: text.iter().all(u8::is_ascii_whitespace),
        },
        Event::CData(_) => Token::CData,
        Event::Comment(_) | Event::PI(_) => Token::Skip,
        Event::Decl(_) => Token::XmlDecl,
        Event::DocType(_) => Token::Doctype,
        Event::Start(tag) => Token::Start {
            name: checked_start(&tag)?,
            empty: false,
        },
        Event::Empty(tag) => Token::Start {
            name: checked_start(&tag)?,
            empty: true,
        },
        Event::End(tag) => {
            let name = tag.name();
            validate_name(name.as_ref())?;
            Token::End {
                name: name.as_ref().to_vec(),
            }
        }
        Event::Eof => return Ok(None),
    };
    Ok(Some((token, len)))
}

fn incomplete_or_malformed(
    input: &[u8],
    error: XmlError,
) -> Result<Option<(Token, usize)>, ParseError> {
    match error {
        XmlError::Syntax(
            SyntaxError::UnclosedTag
            | SyntaxError::UnclosedComment
            | SyntaxError::UnclosedCData
            | SyntaxError::UnclosedDoctype
            | SyntaxError::UnclosedPIOrXmlDecl,
        ) => Ok(None),
        // A bare "<!" cannot be classified yet
        XmlError::Syntax(SyntaxError::InvalidBangMarkup) if input.len() <= 2 => Ok(None),
        other => Err(ParseError::Malformed(format!(
            "{} at {:?}",
            other,
            lossy(&input[..input.len().min(24)])
        ))),
    }
}

/// Checks the tag name and every attribute, returning the name.
fn checked_start(tag: &BytesStart<'_>) -> Result<Vec<u8>, ParseError> {
    let name = tag.name();
    validate_name(name.as_ref())?;
    for attribute in tag.attributes() {
        let attribute = attribute.map_err(|e| {
            ParseError::Malformed(format!("<{}>: {}", lossy(name.as_ref()), e))
        })?;
        validate_name(attribute.key.as_ref())?;
        if attribute.value.contains(&b'<') {
            return Err(ParseError::Malformed(format!(
                "'<' in value of attribute {} of <{}>",
                lossy(attribute.key.as_ref()),
                lossy(name.as_ref())
            )));
        }
    }
    Ok(name.as_ref().to_vec())
}

fn validate_name(name: &[u8]) -> Result<(), ParseError> {
    match name.first() {
        None => Err(ParseError::Malformed("missing name".to_string())),
        Some(b) if b.is_ascii_digit() || *b == b'-' || *b == b'.' => Err(ParseError::Malformed(
            format!("invalid name {:?}", lossy(name)),
        )),
        Some(_) => Ok(()),
    }
}

/// Parses the start tag at the beginning of a complete element.
pub fn start_tag(element: &[u8]) -> Option<BytesStart<'_>> {
    match token_reader(element).read_event().ok()? {
        Event::Start(tag) | Event::Empty(tag) => Some(tag),
        _ => None,
    }
}

/// Qualified name of an element, e.g. `roi:Msg`.
pub fn element_name(element: &[u8]) -> Option<&[u8]> {
    let len = start_tag(element)?.name().as_ref().len();
    // The name directly follows the '<'
    element.get(1..1 + len)
}

/// Name without namespace prefix.
pub fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}

/// Unescaped value of attribute `name` on the element's start tag.
pub fn attribute(element: &[u8], name: &str) -> Option<String> {
    let tag = start_tag(element)?;
    let value = tag
        .attributes()
        .flatten()
        .find(|attribute| attribute.key.as_ref() == name.as_bytes())?
        .unescape_value()
        .ok()?
        .into_owned();
    Some(value)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
