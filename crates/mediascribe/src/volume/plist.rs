//! Minimal XML property-list reader for `diskutil -plist` output.

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event};
use quick_xml::Reader;

use crate::error::ProbeError;

#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    String(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Date(String),
    Data(String),
    Array(Vec<PlistValue>),
    Dict(Vec<(String, PlistValue)>),
}

impl PlistValue {
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        match self {
            PlistValue::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlistValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PlistValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

enum Frame {
    Array(Vec<PlistValue>),
    Dict {
        entries: Vec<(String, PlistValue)>,
        pending_key: Option<String>,
    },
}

struct Builder {
    stack: Vec<Frame>,
    documents: Vec<PlistValue>,
}

impl Builder {
    fn emit(&mut self, value: PlistValue) {
        match self.stack.last_mut() {
            Some(Frame::Array(items)) => items.push(value),
            Some(Frame::Dict {
                entries,
                pending_key,
            }) => {
                if let Some(key) = pending_key.take() {
                    entries.push((key, value));
                }
            }
            None => self.documents.push(value),
        }
    }

    fn set_key(&mut self, key: String) {
        if let Some(Frame::Dict { pending_key, .. }) = self.stack.last_mut() {
            *pending_key = Some(key);
        }
    }

    fn close(&mut self) {
        let value = match self.stack.pop() {
            Some(Frame::Array(items)) => PlistValue::Array(items),
            Some(Frame::Dict { entries, .. }) => PlistValue::Dict(entries),
            None => return,
        };
        self.emit(value);
    }
}

fn parse_error(reason: String) -> ProbeError {
    ProbeError::Parse {
        what: "plist",
        reason,
    }
}

/// Text for a `&name;` or `&#NN;` reference inside a scalar.
fn resolve_reference(reference: &BytesRef) -> Result<String, ProbeError> {
    if let Some(ch) = reference
        .resolve_char_ref()
        .map_err(|e| parse_error(format!("invalid character reference: {}", e)))?
    {
        return Ok(ch.to_string());
    }
    let name = reference
        .decode()
        .map_err(|e| parse_error(format!("invalid entity reference: {}", e)))?;
    resolve_predefined_entity(&name)
        .map(str::to_string)
        .ok_or_else(|| parse_error(format!("unknown entity '&{};'", name)))
}

/// Parses every top-level value in `xml`. `diskutil` may print several
/// `<plist>` documents back to back, so all of them are returned in order.
pub fn parse_documents(xml: &str) -> Result<Vec<PlistValue>, ProbeError> {
    // Not trimmed: entity references split a scalar into several text
    // events and the spaces around them belong to the value.
    let mut reader = Reader::from_str(xml);

    let mut builder = Builder {
        stack: Vec::new(),
        documents: Vec::new(),
    };
    let mut text = String::new();
    let mut in_scalar = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"array" => builder.stack.push(Frame::Array(Vec::new())),
                b"dict" => builder.stack.push(Frame::Dict {
                    entries: Vec::new(),
                    pending_key: None,
                }),
                b"key" | b"string" | b"integer" | b"real" | b"date" | b"data" => {
                    in_scalar = true;
                    text.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"true" => builder.emit(PlistValue::Bool(true)),
                b"false" => builder.emit(PlistValue::Bool(false)),
                b"string" => builder.emit(PlistValue::String(String::new())),
                b"array" => builder.emit(PlistValue::Array(Vec::new())),
                b"dict" => builder.emit(PlistValue::Dict(Vec::new())),
                b"key" => builder.set_key(String::new()),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_scalar {
                    let decoded = e
                        .decode()
                        .map_err(|e| parse_error(format!("invalid text: {}", e)))?;
                    text.push_str(&decoded);
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_scalar {
                    text.push_str(&resolve_reference(&e)?);
                }
            }
            Ok(Event::End(ref e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"array" | b"dict" => builder.close(),
                    b"key" => {
                        in_scalar = false;
                        builder.set_key(std::mem::take(&mut text));
                    }
                    b"string" => {
                        in_scalar = false;
                        builder.emit(PlistValue::String(std::mem::take(&mut text)));
                    }
                    b"integer" => {
                        in_scalar = false;
                        let raw = std::mem::take(&mut text);
                        let value = raw.trim().parse::<i64>().map_err(|e| {
                            parse_error(format!("invalid integer '{}': {}", raw, e))
                        })?;
                        builder.emit(PlistValue::Integer(value));
                    }
                    b"real" => {
                        in_scalar = false;
                        let raw = std::mem::take(&mut text);
                        let value = raw
                            .trim()
                            .parse::<f64>()
                            .map_err(|e| parse_error(format!("invalid real '{}': {}", raw, e)))?;
                        builder.emit(PlistValue::Real(value));
                    }
                    b"date" => {
                        in_scalar = false;
                        let raw = std::mem::take(&mut text);
                        builder.emit(PlistValue::Date(raw.trim().to_string()));
                    }
                    b"data" => {
                        in_scalar = false;
                        let raw = std::mem::take(&mut text);
                        builder.emit(PlistValue::Data(raw.split_whitespace().collect()));
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_error(format!("XML parsing error: {}", e))),
            _ => {}
        }
    }

    if !builder.stack.is_empty() {
        return Err(parse_error("unterminated array or dict".to_string()));
    }

    Ok(builder.documents)
}
