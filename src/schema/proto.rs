//! Protobuf Definition Parser
//!
//! Parses `.proto` text (proto2 and proto3) into message descriptors. The first
//! top-level message is the root record; its descriptor drives both the field
//! tree and binary decoding during ingestion.
//!
//! Supported: nested messages and enums, `oneof`, `map<K, V>`, field options,
//! `google.protobuf.Timestamp`. Services, extensions and options are skipped;
//! groups and recursive messages are rejected.

use crate::error::{BqError, Result};
use crate::schema::field::{Field, FieldType, Nullability};
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum message nesting depth
const MAX_DEPTH: usize = 32;

const TIMESTAMP_TYPE: &str = "google.protobuf.Timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoSyntax {
    Proto2,
    Proto3,
}

/// Field label after applying syntax rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// proto3 singular field without presence tracking
    Implicit,
    Optional,
    Required,
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Double,
    Float,
    Int32,
    Int64,
    UInt32,
    UInt64,
    SInt32,
    SInt64,
    Fixed32,
    Fixed64,
    SFixed32,
    SFixed64,
    Bool,
    String,
    Bytes,
}

impl ScalarType {
    pub fn from_name(name: &str) -> Option<Self> {
        let scalar = match name {
            "double" => ScalarType::Double,
            "float" => ScalarType::Float,
            "int32" => ScalarType::Int32,
            "int64" => ScalarType::Int64,
            "uint32" => ScalarType::UInt32,
            "uint64" => ScalarType::UInt64,
            "sint32" => ScalarType::SInt32,
            "sint64" => ScalarType::SInt64,
            "fixed32" => ScalarType::Fixed32,
            "fixed64" => ScalarType::Fixed64,
            "sfixed32" => ScalarType::SFixed32,
            "sfixed64" => ScalarType::SFixed64,
            "bool" => ScalarType::Bool,
            "string" => ScalarType::String,
            "bytes" => ScalarType::Bytes,
            _ => return None,
        };
        Some(scalar)
    }

    /// Logical type this scalar is stored as
    pub fn logical_type(&self) -> FieldType {
        match self {
            ScalarType::Double | ScalarType::Float => FieldType::Float64,
            ScalarType::Bool => FieldType::Bool,
            ScalarType::String | ScalarType::Bytes => FieldType::String,
            ScalarType::Int32
            | ScalarType::Int64
            | ScalarType::UInt32
            | ScalarType::UInt64
            | ScalarType::SInt32
            | ScalarType::SInt64
            | ScalarType::Fixed32
            | ScalarType::Fixed64
            | ScalarType::SFixed32
            | ScalarType::SFixed64 => FieldType::Int64,
        }
    }

    /// Numeric scalars may be packed in repeated fields
    pub fn is_packable(&self) -> bool {
        !matches!(self, ScalarType::String | ScalarType::Bytes)
    }

    fn is_valid_map_key(&self) -> bool {
        !matches!(self, ScalarType::Double | ScalarType::Float | ScalarType::Bytes)
    }
}

/// Unresolved field type as written in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Scalar(ScalarType),
    Named(String),
    Map(ScalarType, Box<TypeRef>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub number: u32,
    pub label: Label,
    pub type_ref: TypeRef,
    pub oneof: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<(String, i32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub messages: Vec<MessageDef>,
    pub enums: Vec<EnumDef>,
}

/// Parsed `.proto` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoFile {
    pub syntax: ProtoSyntax,
    pub package: Option<String>,
    pub messages: Vec<MessageDef>,
    pub enums: Vec<EnumDef>,
}

#[derive(Debug)]
pub struct EnumDescriptor {
    pub name: String,
    pub values: HashMap<i32, String>,
}

/// Resolved kind of a message field
#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(ScalarType),
    Enum(Arc<EnumDescriptor>),
    Message(Arc<MessageDescriptor>),
    Timestamp,
    Map {
        key: ScalarType,
        value: Box<FieldKind>,
    },
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub number: u32,
    pub label: Label,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub fn is_repeated(&self) -> bool {
        self.label == Label::Repeated || matches!(self.kind, FieldKind::Map { .. })
    }
}

/// Fully resolved message
#[derive(Debug)]
pub struct MessageDescriptor {
    /// Package-qualified name
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl MessageDescriptor {
    pub fn field_by_number(&self, number: u32) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.number == number)
    }

    /// Field tree of this message
    pub fn to_fields(&self) -> Vec<Field> {
        self.fields.iter().map(field_from_descriptor).collect()
    }
}

fn logical_type_of(kind: &FieldKind) -> FieldType {
    match kind {
        FieldKind::Scalar(scalar) => scalar.logical_type(),
        FieldKind::Enum(_) => FieldType::String,
        FieldKind::Timestamp => FieldType::Timestamp,
        FieldKind::Message(message) => FieldType::Record(message.to_fields()),
        FieldKind::Map { key, value } => FieldType::Record(vec![
            Field::nullable("key", key.logical_type()),
            Field::nullable("value", logical_type_of(value)),
        ]),
    }
}

fn field_from_descriptor(descriptor: &FieldDescriptor) -> Field {
    let element = logical_type_of(&descriptor.kind);
    if descriptor.is_repeated() {
        return Field::repeated(descriptor.name.clone(), element);
    }
    let nullability = match descriptor.label {
        Label::Required => Nullability::Required,
        _ => Nullability::Nullable,
    };
    Field::new(descriptor.name.clone(), element, nullability)
}

/// Parsed file plus its resolved root message
#[derive(Debug, Clone)]
pub struct ProtoSchema {
    pub file: ProtoFile,
    pub root: Arc<MessageDescriptor>,
}

impl ProtoSchema {
    pub fn fields(&self) -> Vec<Field> {
        self.root.to_fields()
    }
}

/// Parse `.proto` text and resolve its first top-level message
pub fn parse_proto(source: &str) -> Result<ProtoSchema> {
    let file = parse_proto_file(source)?;
    let root = resolve_root(&file)?;
    Ok(ProtoSchema { file, root })
}

fn schema_error(line: usize, message: impl AsRef<str>) -> BqError {
    BqError::SchemaValidationFailed(format!("proto line {}: {}", line, message.as_ref()))
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Symbol(char),
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err(schema_error(line, "unterminated block comment"));
                }
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    break;
                }
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
        } else if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None | Some('\n') => return Err(schema_error(line, "unterminated string")),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| schema_error(line, "unterminated string"))?;
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push((Token::Str(value), line));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push((Token::Ident(chars[start..i].iter().collect()), line));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push((Token::Number(chars[start..i].iter().collect()), line));
        } else {
            tokens.push((Token::Symbol(c), line));
            i += 1;
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    syntax: ProtoSyntax,
}

impl Parser {
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, line)| *line)
            .unwrap_or(1)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .map(|(t, _)| t.clone())
            .ok_or_else(|| schema_error(self.line(), "unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn is_symbol(&self, symbol: char) -> bool {
        matches!(self.peek(), Some(Token::Symbol(c)) if *c == symbol)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == keyword)
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<()> {
        let line = self.line();
        match self.next()? {
            Token::Symbol(c) if c == symbol => Ok(()),
            other => Err(schema_error(line, format!("expected '{}', found {:?}", symbol, other))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        let line = self.line();
        match self.next()? {
            Token::Ident(s) => Ok(s),
            other => Err(schema_error(line, format!("expected identifier, found {:?}", other))),
        }
    }

    /// Type name, possibly fully qualified with a leading dot
    fn expect_type_name(&mut self) -> Result<String> {
        if self.is_symbol('.') {
            self.pos += 1;
            return Ok(format!(".{}", self.expect_ident()?));
        }
        self.expect_ident()
    }

    fn expect_integer(&mut self) -> Result<i64> {
        let line = self.line();
        let negative = if self.is_symbol('-') {
            self.pos += 1;
            true
        } else {
            false
        };
        let text = match self.next()? {
            Token::Number(text) => text,
            other => return Err(schema_error(line, format!("expected number, found {:?}", other))),
        };
        let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16)
        } else if text.len() > 1 && text.starts_with('0') {
            i64::from_str_radix(&text[1..], 8)
        } else {
            text.parse::<i64>()
        }
        .map_err(|_| schema_error(line, format!("invalid integer '{}'", text)))?;
        Ok(if negative { -value } else { value })
    }

    /// Skip to the end of the current statement, across nested braces
    fn skip_statement(&mut self) -> Result<()> {
        let mut depth = 0usize;
        loop {
            match self.next()? {
                Token::Symbol('{') => depth += 1,
                Token::Symbol('}') => depth = depth.saturating_sub(1),
                Token::Symbol(';') if depth == 0 => return Ok(()),
                _ => {}
            }
        }
    }

    /// Skip a `{ ... }` block following the current position
    fn skip_block(&mut self) -> Result<()> {
        while !self.is_symbol('{') {
            self.next()?;
        }
        let mut depth = 0usize;
        loop {
            match self.next()? {
                Token::Symbol('{') => depth += 1,
                Token::Symbol('}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    /// Skip `[ ... ]` field options if present
    fn skip_field_options(&mut self) -> Result<()> {
        if !self.is_symbol('[') {
            return Ok(());
        }
        let mut depth = 0usize;
        loop {
            match self.next()? {
                Token::Symbol('[') => depth += 1,
                Token::Symbol(']') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    fn parse_file(&mut self) -> Result<ProtoFile> {
        let mut package = None;
        let mut messages = Vec::new();
        let mut enums = Vec::new();

        while let Some(token) = self.peek().cloned() {
            let line = self.line();
            match token {
                Token::Symbol(';') => self.pos += 1,
                Token::Ident(keyword) => match keyword.as_str() {
                    "syntax" => {
                        self.pos += 1;
                        self.expect_symbol('=')?;
                        self.syntax = match self.next()? {
                            Token::Str(s) if s == "proto3" => ProtoSyntax::Proto3,
                            Token::Str(s) if s == "proto2" => ProtoSyntax::Proto2,
                            other => {
                                return Err(schema_error(
                                    line,
                                    format!("unsupported syntax {:?}", other),
                                ))
                            }
                        };
                        self.expect_symbol(';')?;
                    }
                    "package" => {
                        self.pos += 1;
                        package = Some(self.expect_ident()?);
                        self.expect_symbol(';')?;
                    }
                    "import" | "option" => {
                        self.pos += 1;
                        self.skip_statement()?;
                    }
                    "message" => {
                        self.pos += 1;
                        messages.push(self.parse_message()?);
                    }
                    "enum" => {
                        self.pos += 1;
                        enums.push(self.parse_enum()?);
                    }
                    "service" | "extend" => {
                        self.pos += 1;
                        self.skip_block()?;
                    }
                    other => {
                        return Err(schema_error(
                            line,
                            format!("unexpected '{}' at top level", other),
                        ))
                    }
                },
                other => {
                    return Err(schema_error(
                        line,
                        format!("unexpected {:?} at top level", other),
                    ))
                }
            }
        }

        Ok(ProtoFile {
            syntax: self.syntax,
            package,
            messages,
            enums,
        })
    }

    fn parse_message(&mut self) -> Result<MessageDef> {
        let name = self.expect_ident()?;
        self.expect_symbol('{')?;

        let mut message = MessageDef {
            name,
            fields: Vec::new(),
            messages: Vec::new(),
            enums: Vec::new(),
        };

        loop {
            let line = self.line();
            if self.is_symbol('}') {
                self.pos += 1;
                return Ok(message);
            }
            if self.is_symbol(';') {
                self.pos += 1;
                continue;
            }
            let keyword = match self.peek() {
                Some(Token::Ident(s)) => s.clone(),
                Some(other) => {
                    return Err(schema_error(line, format!("unexpected {:?} in message", other)))
                }
                None => return Err(schema_error(line, "unterminated message")),
            };
            match keyword.as_str() {
                "message" => {
                    self.pos += 1;
                    message.messages.push(self.parse_message()?);
                }
                "enum" => {
                    self.pos += 1;
                    message.enums.push(self.parse_enum()?);
                }
                "option" | "reserved" | "extensions" => {
                    self.pos += 1;
                    self.skip_statement()?;
                }
                "extend" => {
                    self.pos += 1;
                    self.skip_block()?;
                }
                "oneof" => {
                    self.pos += 1;
                    let oneof_name = self.expect_ident()?;
                    self.expect_symbol('{')?;
                    while !self.is_symbol('}') {
                        if self.is_keyword("option") {
                            self.pos += 1;
                            self.skip_statement()?;
                            continue;
                        }
                        let field = self.parse_field(Label::Optional, Some(oneof_name.clone()))?;
                        message.fields.push(field);
                    }
                    self.pos += 1;
                }
                "map" if matches!(self.tokens.get(self.pos + 1), Some((Token::Symbol('<'), _))) => {
                    self.pos += 1;
                    message.fields.push(self.parse_map_field()?);
                }
                "optional" | "required" | "repeated" => {
                    self.pos += 1;
                    let label = match keyword.as_str() {
                        "required" => Label::Required,
                        "repeated" => Label::Repeated,
                        _ => Label::Optional,
                    };
                    message.fields.push(self.parse_field(label, None)?);
                }
                _ => {
                    let label = match self.syntax {
                        ProtoSyntax::Proto3 => Label::Implicit,
                        ProtoSyntax::Proto2 => Label::Optional,
                    };
                    message.fields.push(self.parse_field(label, None)?);
                }
            }
        }
    }

    fn parse_field(&mut self, label: Label, oneof: Option<String>) -> Result<FieldDef> {
        let line = self.line();
        let type_name = self.expect_type_name()?;
        if type_name == "group" {
            return Err(schema_error(line, "groups are not supported"));
        }
        let name = self.expect_ident()?;
        self.expect_symbol('=')?;
        let number = self.expect_integer()?;
        self.skip_field_options()?;
        self.expect_symbol(';')?;

        let number = u32::try_from(number)
            .ok()
            .filter(|n| *n >= 1 && *n <= 536_870_911)
            .ok_or_else(|| {
                schema_error(line, format!("invalid field number {} for '{}'", number, name))
            })?;

        let type_ref = match ScalarType::from_name(&type_name) {
            Some(scalar) => TypeRef::Scalar(scalar),
            None => TypeRef::Named(type_name),
        };

        Ok(FieldDef {
            name,
            number,
            label,
            type_ref,
            oneof,
        })
    }

    fn parse_map_field(&mut self) -> Result<FieldDef> {
        let line = self.line();
        self.expect_symbol('<')?;
        let key_name = self.expect_ident()?;
        let key = ScalarType::from_name(&key_name)
            .filter(|k| k.is_valid_map_key())
            .ok_or_else(|| schema_error(line, format!("invalid map key type '{}'", key_name)))?;
        self.expect_symbol(',')?;
        let value_name = self.expect_type_name()?;
        self.expect_symbol('>')?;
        let value = match ScalarType::from_name(&value_name) {
            Some(scalar) => TypeRef::Scalar(scalar),
            None => TypeRef::Named(value_name),
        };

        let name = self.expect_ident()?;
        self.expect_symbol('=')?;
        let number = self.expect_integer()?;
        self.skip_field_options()?;
        self.expect_symbol(';')?;

        let number = u32::try_from(number)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| schema_error(line, format!("invalid field number for '{}'", name)))?;

        Ok(FieldDef {
            name,
            number,
            label: Label::Repeated,
            type_ref: TypeRef::Map(key, Box::new(value)),
            oneof: None,
        })
    }

    fn parse_enum(&mut self) -> Result<EnumDef> {
        let name = self.expect_ident()?;
        self.expect_symbol('{')?;
        let mut values = Vec::new();

        loop {
            if self.is_symbol('}') {
                self.pos += 1;
                return Ok(EnumDef { name, values });
            }
            if self.is_symbol(';') {
                self.pos += 1;
                continue;
            }
            if self.is_keyword("option") || self.is_keyword("reserved") {
                self.pos += 1;
                self.skip_statement()?;
                continue;
            }
            let value_name = self.expect_ident()?;
            self.expect_symbol('=')?;
            let number = self.expect_integer()?;
            self.skip_field_options()?;
            self.expect_symbol(';')?;
            let number = i32::try_from(number).map_err(|_| {
                schema_error(self.line(), format!("enum value {} out of range", number))
            })?;
            values.push((value_name, number));
        }
    }
}

/// Parse `.proto` text without resolving types
pub fn parse_proto_file(source: &str) -> Result<ProtoFile> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        syntax: ProtoSyntax::Proto2,
    };
    parser.parse_file()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Symbol<'a> {
    Message(&'a MessageDef),
    Enum(&'a EnumDef),
}

struct Resolver<'a> {
    symbols: HashMap<String, Symbol<'a>>,
    messages: HashMap<String, Arc<MessageDescriptor>>,
    enums: HashMap<String, Arc<EnumDescriptor>>,
    stack: Vec<String>,
}

fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", scope, name)
    }
}

fn collect_symbols<'a>(
    scope: &str,
    messages: &'a [MessageDef],
    enums: &'a [EnumDef],
    symbols: &mut HashMap<String, Symbol<'a>>,
) {
    for e in enums {
        symbols.insert(qualify(scope, &e.name), Symbol::Enum(e));
    }
    for m in messages {
        let full = qualify(scope, &m.name);
        collect_symbols(&full, &m.messages, &m.enums, symbols);
        symbols.insert(full, Symbol::Message(m));
    }
}

impl<'a> Resolver<'a> {
    /// Find a type name from inside message `scope`, innermost scope first
    fn lookup(&self, name: &str, scope: &str) -> Option<(String, Symbol<'a>)> {
        if let Some(absolute) = name.strip_prefix('.') {
            return self.symbols.get(absolute).map(|s| (absolute.to_string(), *s));
        }
        let mut current = scope.to_string();
        loop {
            let candidate = qualify(&current, name);
            if let Some(symbol) = self.symbols.get(&candidate) {
                return Some((candidate, *symbol));
            }
            if current.is_empty() {
                return None;
            }
            current = match current.rfind('.') {
                Some(idx) => current[..idx].to_string(),
                None => String::new(),
            };
        }
    }

    fn message(&mut self, full_name: &str) -> Result<Arc<MessageDescriptor>> {
        if let Some(descriptor) = self.messages.get(full_name) {
            return Ok(descriptor.clone());
        }
        if self.stack.iter().any(|n| n == full_name) {
            return Err(BqError::SchemaValidationFailed(format!(
                "message '{}' is recursive",
                full_name
            )));
        }
        if self.stack.len() >= MAX_DEPTH {
            return Err(BqError::SchemaValidationFailed(format!(
                "message nesting deeper than {} levels",
                MAX_DEPTH
            )));
        }
        let def: &'a MessageDef = match self.symbols.get(full_name) {
            Some(Symbol::Message(def)) => *def,
            _ => {
                return Err(BqError::SchemaValidationFailed(format!(
                    "unknown message '{}'",
                    full_name
                )))
            }
        };

        self.stack.push(full_name.to_string());
        let mut fields = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let kind = self.kind(&field.type_ref, full_name, &field.name)?;
            fields.push(FieldDescriptor {
                name: field.name.clone(),
                number: field.number,
                label: field.label,
                kind,
            });
        }
        self.stack.pop();

        let descriptor = Arc::new(MessageDescriptor {
            name: full_name.to_string(),
            fields,
        });
        self.messages.insert(full_name.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    fn enumeration(&mut self, full_name: &str, def: &EnumDef) -> Arc<EnumDescriptor> {
        self.enums
            .entry(full_name.to_string())
            .or_insert_with(|| {
                Arc::new(EnumDescriptor {
                    name: full_name.to_string(),
                    values: def.values.iter().map(|(n, v)| (*v, n.clone())).collect(),
                })
            })
            .clone()
    }

    fn kind(&mut self, type_ref: &TypeRef, scope: &str, field_name: &str) -> Result<FieldKind> {
        match type_ref {
            TypeRef::Scalar(scalar) => Ok(FieldKind::Scalar(*scalar)),
            TypeRef::Map(key, value) => Ok(FieldKind::Map {
                key: *key,
                value: Box::new(self.kind(value, scope, field_name)?),
            }),
            TypeRef::Named(name) => {
                if name.trim_start_matches('.') == TIMESTAMP_TYPE {
                    return Ok(FieldKind::Timestamp);
                }
                match self.lookup(name, scope) {
                    Some((full, Symbol::Message(_))) => {
                        Ok(FieldKind::Message(self.message(&full)?))
                    }
                    Some((full, Symbol::Enum(def))) => {
                        Ok(FieldKind::Enum(self.enumeration(&full, def)))
                    }
                    None => Err(BqError::SchemaValidationFailed(format!(
                        "field '{}' references unknown type '{}'",
                        field_name, name
                    ))),
                }
            }
        }
    }
}

fn resolve_root(file: &ProtoFile) -> Result<Arc<MessageDescriptor>> {
    let root = file.messages.first().ok_or_else(|| {
        BqError::SchemaValidationFailed("proto definition contains no message".to_string())
    })?;

    let package = file.package.clone().unwrap_or_default();
    let mut symbols = HashMap::new();
    collect_symbols(&package, &file.messages, &file.enums, &mut symbols);

    let mut resolver = Resolver {
        symbols,
        messages: HashMap::new(),
        enums: HashMap::new(),
        stack: Vec::new(),
    };
    resolver.message(&qualify(&package, &root.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_PROTO: &str = r#"
        syntax = "proto3";
        package demo.v1;

        import "google/protobuf/timestamp.proto";
        option go_package = "example.com/demo";

        // A user record
        message User {
            string id = 1;
            int64 age = 2 [deprecated = true];
            Address address = 3;
            repeated string tags = 4;
            Status status = 5;
            google.protobuf.Timestamp created_at = 6;
            map<string, int64> counters = 7;
            oneof contact {
                string email = 8;
                string phone = 9;
            }
            optional bytes avatar = 10;

            message Address {
                string city = 1;
                uint32 zip = 2;
            }
        }

        enum Status {
            STATUS_UNKNOWN = 0;
            STATUS_ACTIVE = 1;
        }

        message Unrelated { double x = 1; }
    "#;

    #[test]
    fn test_parse_and_resolve_root() {
        let schema = parse_proto(USER_PROTO).unwrap();
        assert_eq!(schema.file.syntax, ProtoSyntax::Proto3);
        assert_eq!(schema.root.name, "demo.v1.User");
        assert_eq!(schema.root.fields.len(), 10);

        let address = schema.root.field_by_number(3).unwrap();
        match &address.kind {
            FieldKind::Message(m) => assert_eq!(m.name, "demo.v1.User.Address"),
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(matches!(schema.root.field_by_number(6).unwrap().kind, FieldKind::Timestamp));
        assert_eq!(schema.root.field_by_number(8).unwrap().label, Label::Optional);
        assert_eq!(schema.root.field_by_number(1).unwrap().label, Label::Implicit);
    }

    #[test]
    fn test_field_tree_mapping() {
        let fields = parse_proto(USER_PROTO).unwrap().fields();
        let by_name = |n: &str| fields.iter().find(|f| f.name == n).unwrap().clone();

        assert_eq!(by_name("id").field_type, FieldType::String);
        assert_eq!(by_name("age").field_type, FieldType::Int64);
        assert_eq!(by_name("status").field_type, FieldType::String);
        assert_eq!(by_name("created_at").field_type, FieldType::Timestamp);
        assert_eq!(by_name("avatar").field_type, FieldType::String);
        assert_eq!(
            by_name("tags").field_type,
            FieldType::Repeated(Box::new(FieldType::String))
        );
        match by_name("counters").field_type {
            FieldType::Repeated(inner) => match *inner {
                FieldType::Record(kv) => {
                    assert_eq!(kv[0].name, "key");
                    assert_eq!(kv[1].field_type, FieldType::Int64);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        let address = by_name("address");
        assert!(address.is_nullable());
        assert_eq!(address.field_type.subfields().unwrap().len(), 2);
    }

    #[test]
    fn test_proto2_required() {
        let schema = parse_proto(
            r#"syntax = "proto2";
               message Event { required string id = 1; optional int32 n = 2 [default = 5]; }"#,
        )
        .unwrap();
        let fields = schema.fields();
        assert_eq!(fields[0].nullability, Nullability::Required);
        assert_eq!(fields[1].nullability, Nullability::Nullable);
    }

    #[test]
    fn test_errors() {
        assert!(parse_proto("syntax = \"proto3\";").is_err());
        assert!(parse_proto("message A { Missing m = 1; }").is_err());
        assert!(parse_proto("message A { A self = 1; }").is_err());
        assert!(parse_proto("message A { string s = 0; }").is_err());
        assert!(parse_proto("message A { string s = 1 }").is_err());
        assert!(parse_proto("message A { /* open").is_err());
    }
}
