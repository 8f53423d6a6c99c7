//! Stream IR text parser.
//!
//! A hand-written recursive-descent parser over the generic op syntax
//! `%r = name(%operands) await(%timepoints) {key = attr, ...}`. Value operands
//! must be defined before use. Placement annotations (`slices`, `ranges`) may
//! name values defined later in the function and are resolved once the whole
//! body has been read.

use hashbrown::HashMap;

use super::*;
use crate::core::error::{CompileError, CompileResult};

pub fn parse_module(text: &str) -> CompileResult<Module> {
    let parser = Parser::new(text);
    parser.parse()
}

/// Parse a single function, for tests and tools working on one body.
pub fn parse_function(text: &str) -> CompileResult<Function> {
    let mut module = parse_module(text)?;
    match module.functions.len() {
        1 => Ok(module.functions.remove(0)),
        n => Err(CompileError::Parse { line: 1, reason: format!("expected exactly one function, found {n}") }),
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    module: Module,

    // Per-function maps
    values: HashMap<&'a str, ValueId>,
    pending: Vec<Pending<'a>>,
}

/// Annotation whose value names are resolved at the end of the function.
enum Pending<'a> {
    Slices { op: OpId, slices: Vec<(&'a str, IndexExpr, IndexExpr)> },
    Ranges { op: OpId, ranges: Vec<(&'a str, &'a str, IndexExpr, IndexExpr)> },
}

/// Parsed attribute value, typed by its syntax.
#[derive(Debug)]
enum Attr<'a> {
    Index(IndexExpr),
    List(Vec<IndexExpr>),
    Desc(TensorDesc),
    Descs(Vec<TensorDesc>),
    Scalar(ScalarExpr),
    Constant(ConstantData),
    Element(ElementType),
    Symbol(&'a str),
    Str(&'a str),
    Ident(&'a str),
    Slices(Vec<(&'a str, IndexExpr, IndexExpr)>),
    Ranges(Vec<(&'a str, &'a str, IndexExpr, IndexExpr)>),
}

/// Attribute dictionary of one op. Every attribute must be consumed by the
/// op builder; leftovers are reported as unknown.
#[derive(Default)]
struct Attrs<'a> {
    entries: Vec<(&'a str, Attr<'a>)>,
}

impl<'a> Attrs<'a> {
    fn take(&mut self, key: &str) -> Option<Attr<'a>> {
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(pos).1)
    }

    fn required(&mut self, key: &str) -> Result<Attr<'a>, String> {
        self.take(key).ok_or_else(|| format!("missing attribute '{key}'"))
    }

    fn index(&mut self, key: &str) -> Result<IndexExpr, String> {
        match self.required(key)? {
            Attr::Index(e) => Ok(e),
            other => Err(format!("attribute '{key}' must be an index expression, found {other:?}")),
        }
    }

    fn list(&mut self, key: &str) -> Result<Vec<IndexExpr>, String> {
        match self.required(key)? {
            Attr::List(l) => Ok(l),
            other => Err(format!("attribute '{key}' must be a list, found {other:?}")),
        }
    }

    fn desc(&mut self, key: &str) -> Result<TensorDesc, String> {
        match self.required(key)? {
            Attr::Desc(d) => Ok(d),
            other => Err(format!("attribute '{key}' must be a tensor descriptor, found {other:?}")),
        }
    }

    fn descs(&mut self, key: &str) -> Result<Vec<TensorDesc>, String> {
        match self.required(key)? {
            Attr::Descs(d) => Ok(d),
            other => Err(format!("attribute '{key}' must be a list of tensor descriptors, found {other:?}")),
        }
    }

    fn tensor_type(&mut self, key: &str) -> Result<TensorType, String> {
        let desc = self.desc(key)?;
        if !desc.dims.is_empty() {
            return Err(format!("attribute '{key}' takes a tensor type without dynamic dims"));
        }
        Ok(desc.ty)
    }

    fn scalar(&mut self, key: &str) -> Result<ScalarExpr, String> {
        match self.required(key)? {
            Attr::Scalar(s) => Ok(s),
            other => Err(format!("attribute '{key}' must be a scalar, found {other:?}")),
        }
    }

    fn constant(&mut self, key: &str) -> Result<ConstantData, String> {
        match self.required(key)? {
            Attr::Constant(c) => Ok(c),
            other => Err(format!("attribute '{key}' must be a dense constant, found {other:?}")),
        }
    }

    fn element(&mut self, key: &str) -> Result<ElementType, String> {
        match self.required(key)? {
            Attr::Element(e) => Ok(e),
            other => Err(format!("attribute '{key}' must be an element type, found {other:?}")),
        }
    }

    fn symbol(&mut self, key: &str) -> Result<String, String> {
        match self.required(key)? {
            Attr::Symbol(s) => Ok(s.to_string()),
            other => Err(format!("attribute '{key}' must be a @symbol, found {other:?}")),
        }
    }

    fn string(&mut self, key: &str) -> Result<&'a str, String> {
        match self.required(key)? {
            Attr::Str(s) => Ok(s),
            other => Err(format!("attribute '{key}' must be a string, found {other:?}")),
        }
    }

    fn ident(&mut self, key: &str) -> Result<&'a str, String> {
        match self.required(key)? {
            Attr::Ident(s) => Ok(s),
            other => Err(format!("attribute '{key}' must be a keyword, found {other:?}")),
        }
    }

    fn finish(self) -> Result<(), String> {
        match self.entries.first() {
            Some((key, _)) => Err(format!("unknown attribute '{key}'")),
            None => Ok(()),
        }
    }
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0, module: Module::new(), values: HashMap::new(), pending: Vec::new() }
    }

    fn parse(mut self) -> CompileResult<Module> {
        self.skip_whitespace();
        while !self.is_eof() {
            let result = match self.read_identifier() {
                Ok("global") => self.parse_global(),
                Ok("func") => self.parse_function(FuncKind::Func),
                Ok("initializer") => self.parse_function(FuncKind::Initializer),
                Ok("executable") => self.parse_function(FuncKind::Executable),
                Ok(other) => Err(format!("expected 'global', 'func', 'initializer' or 'executable', found '{other}'")),
                Err(e) => Err(e),
            };
            if let Err(reason) = result {
                return Err(self.error(reason));
            }
            self.skip_whitespace();
        }
        Ok(self.module)
    }

    fn error(&self, reason: String) -> CompileError {
        let context_start = self.pos.saturating_sub(20);
        let context_end = (self.pos + 20).min(self.text.len());
        log::debug!(
            "parse error context: '{}'",
            self.text.get(context_start..context_end).unwrap_or_default()
        );
        CompileError::Parse { line: self.line(), reason }
    }

    fn line(&self) -> usize {
        self.text[..self.pos].matches('\n').count() + 1
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Skip comment line
                while let Some(ch) = self.current_char() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.current_char()
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), String> {
        if !self.try_read(ch) {
            return Err(format!("expected '{}' but found {:?}", ch, self.current_char()));
        }
        Ok(())
    }

    fn try_str(&mut self, s: &str) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    /// Consumes `keyword` if it appears as a whole word.
    fn try_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace();
        let rest = self.rest();
        if rest.starts_with(keyword) {
            let next = rest[keyword.len()..].chars().next();
            if !next.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                self.pos += keyword.len();
                return true;
            }
        }
        false
    }

    fn read_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if !pred(ch) {
                break;
            }
            self.advance();
        }
        &self.text[start..self.pos]
    }

    fn read_identifier(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace();
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(format!("expected identifier but found '{ch}'")),
            None => return Err("expected identifier but found EOF".to_string()),
        }
        Ok(self.read_while(|c| c.is_alphanumeric() || c == '_'))
    }

    /// Op names may contain dots (`async.fill`).
    fn read_op_name(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace();
        let name = self.read_while(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if name.is_empty() {
            return Err(format!("expected op name but found {:?}", self.current_char()));
        }
        Ok(name)
    }

    fn read_sigil_name(&mut self, sigil: char) -> Result<&'a str, String> {
        self.expect(sigil)?;
        let name = self.read_while(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if name.is_empty() {
            return Err(format!("expected name after '{sigil}'"));
        }
        Ok(name)
    }

    fn read_decimal(&mut self) -> Result<u64, String> {
        self.skip_whitespace();
        let digits = self.read_while(|c| c.is_ascii_digit());
        digits.parse().map_err(|_| format!("expected number but found {:?}", self.current_char()))
    }

    /// Numeric literal token: decimal, hex, negative or float.
    fn read_literal(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace();
        let start = self.pos;
        if self.current_char() == Some('-') {
            self.advance();
        }
        let mut prev = ' ';
        while let Some(ch) = self.current_char() {
            let exponent_sign = (ch == '+' || ch == '-') && (prev == 'e' || prev == 'E');
            if !(ch.is_alphanumeric() || ch == '.' || exponent_sign) {
                break;
            }
            prev = ch;
            self.advance();
        }
        let token = &self.text[start..self.pos];
        if token.is_empty() || token == "-" {
            return Err(format!("expected literal but found {:?}", self.current_char()));
        }
        Ok(token)
    }

    fn lookup(&self, name: &str) -> Result<ValueId, String> {
        self.values.get(name).copied().ok_or_else(|| format!("use of undefined value %{name}"))
    }

    fn read_value(&mut self) -> Result<ValueId, String> {
        let name = self.read_sigil_name('%')?;
        self.lookup(name)
    }

    fn read_value_list(&mut self, close: char) -> Result<Vec<ValueId>, String> {
        let mut values = Vec::new();
        if self.try_read(close) {
            return Ok(values);
        }
        loop {
            values.push(self.read_value()?);
            if self.try_read(close) {
                return Ok(values);
            }
            self.expect(',')?;
        }
    }

    // ---- types ----

    fn parse_element_type(&mut self) -> Result<ElementType, String> {
        let name = self.read_identifier()?;
        ElementType::parse(name).ok_or_else(|| format!("unknown element type '{name}'"))
    }

    /// `tensor<4x?xi8>` or `tensor<8xf32, #packed>`; `tensor<` already consumed.
    fn parse_tensor_type_body(&mut self) -> Result<TensorType, String> {
        let mut dims = Vec::new();
        loop {
            self.skip_whitespace();
            match self.current_char() {
                Some('?') => {
                    self.advance();
                    dims.push(Dim::Dynamic);
                }
                Some(c) if c.is_ascii_digit() => dims.push(Dim::Static(self.read_decimal()?)),
                _ => break,
            }
            if self.current_char() != Some('x') {
                return Err("expected 'x' after tensor dimension".to_string());
            }
            self.advance();
        }
        let element = self.parse_element_type()?;
        let mut ty = TensorType::new(dims, element);
        if self.try_read(',') {
            self.expect('#')?;
            ty.encoding = TensorEncoding::Named(self.read_identifier()?.to_string());
        }
        self.expect('>')?;
        Ok(ty)
    }

    fn parse_desc(&mut self) -> Result<TensorDesc, String> {
        if !self.try_str("tensor<") {
            return Err("expected tensor type".to_string());
        }
        let ty = self.parse_tensor_type_body()?;
        let mut dims = Vec::new();
        if self.current_char() == Some('{') {
            self.advance();
            if !self.try_read('}') {
                loop {
                    dims.push(self.parse_index()?);
                    if self.try_read('}') {
                        break;
                    }
                    self.expect(',')?;
                }
            }
        }
        if dims.len() != ty.dynamic_dim_count() {
            return Err(format!("{ty} has {} dynamic dims but {} values were given", ty.dynamic_dim_count(), dims.len()));
        }
        Ok(TensorDesc::new(ty, dims))
    }

    fn parse_type(&mut self) -> Result<Type, String> {
        if self.try_str("tensor<") {
            return Ok(Type::Tensor(self.parse_tensor_type_body()?));
        }
        if self.try_str("view<") {
            if !self.try_str("tensor<") {
                return Err("expected tensor type in view".to_string());
            }
            let ty = self.parse_tensor_type_body()?;
            self.expect('>')?;
            return Ok(Type::View(ty));
        }
        let name = self.read_identifier()?;
        Ok(match name {
            "index" => Type::Index,
            "timepoint" => Type::Timepoint,
            "external" => Type::External,
            "binding" => Type::Binding,
            "resource" => {
                if self.current_char() == Some('<') {
                    self.advance();
                    self.skip_whitespace();
                    let lifetime = if self.current_char() == Some('*') {
                        self.advance();
                        "*"
                    } else {
                        self.read_identifier()?
                    };
                    self.expect('>')?;
                    Type::Resource(Lifetime::parse(lifetime).ok_or_else(|| format!("unknown lifetime '{lifetime}'"))?)
                } else {
                    Type::Resource(Lifetime::Unknown)
                }
            }
            other => Type::Scalar(ElementType::parse(other).ok_or_else(|| format!("unknown type '{other}'"))?),
        })
    }

    // ---- expressions ----

    /// `16`, `%n`, `(a + b)`, `(a * b)`.
    fn parse_index(&mut self) -> Result<IndexExpr, String> {
        match self.peek() {
            Some('%') => Ok(IndexExpr::Value(self.read_value()?)),
            Some('(') => {
                self.advance();
                let lhs = self.parse_index()?;
                let expr = if self.try_read('+') {
                    IndexExpr::add(lhs, self.parse_index()?)
                } else if self.try_read('*') {
                    IndexExpr::mul(lhs, self.parse_index()?)
                } else {
                    return Err(format!("expected '+' or '*' but found {:?}", self.current_char()));
                };
                self.expect(')')?;
                Ok(expr)
            }
            Some(c) if c.is_ascii_digit() => Ok(IndexExpr::Const(self.read_decimal()?)),
            other => Err(format!("expected index expression but found {other:?}")),
        }
    }

    fn parse_index_list(&mut self) -> Result<Vec<IndexExpr>, String> {
        self.expect('[')?;
        let mut list = Vec::new();
        if self.try_read(']') {
            return Ok(list);
        }
        loop {
            list.push(self.parse_index()?);
            if self.try_read(']') {
                return Ok(list);
            }
            self.expect(',')?;
        }
    }

    /// `[tensor<4xi8>, tensor<?xf32>{%n}]`
    fn parse_desc_list(&mut self) -> Result<Vec<TensorDesc>, String> {
        self.expect('[')?;
        let mut list = Vec::new();
        if self.try_read(']') {
            return Ok(list);
        }
        loop {
            list.push(self.parse_desc()?);
            if self.try_read(']') {
                return Ok(list);
            }
            self.expect(',')?;
        }
    }

    /// `1 : i8`, `%v`, `extui<i8>(...)`, `trunci<i8>(...)`, `bitcast<i32>(...)`.
    fn parse_scalar(&mut self) -> Result<ScalarExpr, String> {
        if self.peek() == Some('%') {
            let id = self.read_value()?;
            return Ok(ScalarExpr::Value { id, ty: self.scalar_value_type(id)? });
        }
        for (keyword, conv) in [("bitcast<", 0), ("extui<", 1), ("trunci<", 2)] {
            if self.try_str(keyword) {
                let to = self.parse_element_type()?;
                self.expect('>')?;
                self.expect('(')?;
                let inner = self.parse_scalar()?;
                self.expect(')')?;
                return Ok(match conv {
                    0 => inner.bitcast(to),
                    1 => inner.extu(to),
                    _ => inner.trunc(to),
                });
            }
        }
        let literal = self.read_literal()?;
        self.expect(':')?;
        let ty = self.parse_element_type()?;
        Ok(ScalarExpr::constant(ty, literal_bits(literal, ty)?))
    }

    fn scalar_value_type(&self, id: ValueId) -> Result<ElementType, String> {
        let ty = self.module.functions.last().map(|f| f.value_type(id).clone());
        match ty {
            Some(Type::Scalar(ty)) => Ok(ty),
            Some(other) => Err(format!("scalar operand has non-scalar type {other}")),
            None => Err("scalar outside of a function".to_string()),
        }
    }

    /// `dense<1> : i1` or `dense<[1, 0, 1]> : i8`.
    fn parse_constant(&mut self) -> Result<ConstantData, String> {
        if !self.try_str("dense<") {
            return Err("expected dense constant".to_string());
        }
        let mut literals = Vec::new();
        let splat = !self.try_read('[');
        if splat {
            literals.push(self.read_literal()?);
        } else if !self.try_read(']') {
            loop {
                literals.push(self.read_literal()?);
                if self.try_read(']') {
                    break;
                }
                self.expect(',')?;
            }
        }
        self.expect('>')?;
        self.expect(':')?;
        let element = self.parse_element_type()?;
        let bits = literals.iter().map(|l| literal_bits(l, element)).collect::<Result<Vec<_>, _>>()?;
        let elements = if splat { Elements::Splat(bits[0]) } else { Elements::Dense(bits) };
        Ok(ConstantData { element, elements })
    }

    // ---- attributes ----

    fn parse_attrs(&mut self) -> Result<Attrs<'a>, String> {
        let mut attrs = Attrs::default();
        if self.try_read('}') {
            return Ok(attrs);
        }
        loop {
            let key = self.read_identifier()?;
            self.expect('=')?;
            let value = self.parse_attr(key)?;
            if attrs.entries.iter().any(|(k, _)| *k == key) {
                return Err(format!("duplicate attribute '{key}'"));
            }
            attrs.entries.push((key, value));
            if self.try_read('}') {
                return Ok(attrs);
            }
            self.expect(',')?;
        }
    }

    fn parse_attr(&mut self, key: &str) -> Result<Attr<'a>, String> {
        match key {
            "slices" => return self.parse_slices().map(Attr::Slices),
            "ranges" => return self.parse_ranges().map(Attr::Ranges),
            "operands" => return self.parse_desc_list().map(Attr::Descs),
            _ => {}
        }
        self.skip_whitespace();
        let rest = self.rest();
        if rest.starts_with("dense<") {
            return self.parse_constant().map(Attr::Constant);
        }
        if rest.starts_with("tensor<") {
            return self.parse_desc().map(Attr::Desc);
        }
        if matches!(key, "pattern" | "value") {
            return self.parse_scalar().map(Attr::Scalar);
        }
        match self.current_char() {
            Some('[') => self.parse_index_list().map(Attr::List),
            Some('@') => self.read_sigil_name('@').map(Attr::Symbol),
            Some('"') => {
                self.advance();
                let s = self.read_while(|c| c != '"');
                self.expect('"')?;
                Ok(Attr::Str(s))
            }
            Some(c) if c.is_alphabetic() => {
                let ident = self.read_identifier()?;
                match ElementType::parse(ident) {
                    Some(ty) if matches!(key, "type" | "to") => Ok(Attr::Element(ty)),
                    _ => Ok(Attr::Ident(ident)),
                }
            }
            _ => self.parse_index().map(Attr::Index),
        }
    }

    /// `[%a at 0 len 16, ...]`
    fn parse_slices(&mut self) -> Result<Vec<(&'a str, IndexExpr, IndexExpr)>, String> {
        self.expect('[')?;
        let mut slices = Vec::new();
        if self.try_read(']') {
            return Ok(slices);
        }
        loop {
            let name = self.read_sigil_name('%')?;
            if !self.try_keyword("at") {
                return Err("expected 'at' in slice".to_string());
            }
            let offset = self.parse_index()?;
            if !self.try_keyword("len") {
                return Err("expected 'len' in slice".to_string());
            }
            let length = self.parse_index()?;
            slices.push((name, offset, length));
            if self.try_read(']') {
                return Ok(slices);
            }
            self.expect(',')?;
        }
    }

    /// `[%r in %storage[off, end), ...]`
    fn parse_ranges(&mut self) -> Result<Vec<(&'a str, &'a str, IndexExpr, IndexExpr)>, String> {
        self.expect('[')?;
        let mut ranges = Vec::new();
        if self.try_read(']') {
            return Ok(ranges);
        }
        loop {
            let resource = self.read_sigil_name('%')?;
            if !self.try_keyword("in") {
                return Err("expected 'in' in range".to_string());
            }
            let storage = self.read_sigil_name('%')?;
            self.expect('[')?;
            let offset = self.parse_index()?;
            self.expect(',')?;
            let end = self.parse_index()?;
            self.expect(')')?;
            ranges.push((resource, storage, offset, end));
            if self.try_read(']') {
                return Ok(ranges);
            }
            self.expect(',')?;
        }
    }

    // ---- module structure ----

    fn parse_global(&mut self) -> Result<(), String> {
        let name = self.read_sigil_name('@')?;
        if self.module.global(name).is_some() {
            return Err(format!("duplicate global @{name}"));
        }
        self.expect(':')?;
        let ty = self.parse_type()?;
        self.module.globals.push(Global { name: name.to_string(), ty });
        Ok(())
    }

    fn parse_function(&mut self, kind: FuncKind) -> Result<(), String> {
        let name = self.read_sigil_name('@')?;
        if self.module.function(name).is_some() {
            return Err(format!("duplicate function definition @{name}"));
        }

        // Reset per-function state
        self.values.clear();
        self.pending.clear();
        self.module.functions.push(Function::new(name, kind));

        self.expect('(')?;
        if !self.try_read(')') {
            loop {
                let arg = self.read_sigil_name('%')?;
                self.expect(':')?;
                let ty = self.parse_type()?;
                let id = self.func().add_arg(arg, ty);
                self.define(arg, id)?;
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }

        self.expect('{')?;
        while !self.try_read('}') {
            if self.is_eof() {
                return Err(format!("unterminated function @{name}"));
            }
            self.parse_op(false)?;
        }
        self.resolve_pending()
    }

    fn func(&mut self) -> &mut Function {
        self.module.functions.last_mut().expect("parsing inside a function")
    }

    fn define(&mut self, name: &'a str, id: ValueId) -> Result<(), String> {
        if self.values.insert(name, id).is_some() {
            return Err(format!("redefinition of %{name}"));
        }
        Ok(())
    }

    fn parse_op(&mut self, in_wave: bool) -> Result<OpId, String> {
        let result_name = if self.peek() == Some('%') {
            let name = self.read_sigil_name('%')?;
            self.expect('=')?;
            Some(name)
        } else {
            None
        };
        let op_name = self.read_op_name()?;
        if op_name == "wave" {
            if in_wave {
                return Err("waves cannot be nested".to_string());
            }
            return self.parse_wave(result_name);
        }

        let operands = if self.try_read('(') { self.read_value_list(')')? } else { Vec::new() };
        let mut awaits = Vec::new();
        let mut attrs = Attrs::default();
        loop {
            if self.try_keyword("await") {
                self.expect('(')?;
                awaits = self.read_value_list(')')?;
            } else if self.try_read('{') {
                attrs = self.parse_attrs()?;
            } else {
                break;
            }
        }

        let affinity = match attrs.take("affinity") {
            Some(Attr::Str(s)) => Some(s.to_string()),
            Some(other) => return Err(format!("affinity must be a string, found {other:?}")),
            None => None,
        };
        let slices = match attrs.take("slices") {
            Some(Attr::Slices(s)) => s,
            _ => Vec::new(),
        };
        let ranges = match attrs.take("ranges") {
            Some(Attr::Ranges(r)) => r,
            _ => Vec::new(),
        };

        let kind = build_kind(op_name, operands, &mut attrs)?;
        attrs.finish()?;
        self.check_globals(&kind)?;

        let func = self.func();
        let id = if in_wave {
            func.create_op(kind, result_name.unwrap_or("v"))
        } else {
            func.append(kind, result_name.unwrap_or("v"))
        };
        func.set_affinity(id, affinity);
        if !awaits.is_empty() {
            func.set_awaits(id, awaits);
        }
        let results = func.op(id).results.clone();
        match (result_name, results.as_slice()) {
            (Some(name), [result]) => self.define(name, *result)?,
            (None, _) => {}
            (Some(name), _) => return Err(format!("{op_name} produces no result to bind to %{name}")),
        }
        if !slices.is_empty() {
            self.pending.push(Pending::Slices { op: id, slices });
        }
        if !ranges.is_empty() {
            self.pending.push(Pending::Ranges { op: id, ranges });
        }
        Ok(id)
    }

    fn check_globals(&self, kind: &OpKind) -> Result<(), String> {
        if let OpKind::GlobalLoad { global } | OpKind::GlobalStore { global, .. } = kind {
            if self.module.global(global).is_none() {
                return Err(format!("unknown global @{global}"));
            }
        }
        Ok(())
    }

    /// `wave <index> [await(...)] { ops }`
    fn parse_wave(&mut self, result_name: Option<&'a str>) -> Result<OpId, String> {
        let index = self.read_decimal()? as u32;
        let mut awaits = Vec::new();
        if self.try_keyword("await") {
            self.expect('(')?;
            awaits = self.read_value_list(')')?;
        }
        self.expect('{')?;
        let mut members = Vec::new();
        while !self.try_read('}') {
            if self.is_eof() {
                return Err("unterminated wave".to_string());
            }
            members.push(self.parse_op(true)?);
        }
        let func = self.func();
        let wave = func.append(OpKind::Wave { index, members: Vec::new() }, result_name.unwrap_or("t"));
        func.set_wave_members(wave, members);
        func.set_awaits(wave, awaits);
        let result = func.op(wave).result();
        if let Some(name) = result_name {
            self.define(name, result)?;
        }
        Ok(wave)
    }

    fn resolve_pending(&mut self) -> Result<(), String> {
        for pending in std::mem::take(&mut self.pending) {
            match pending {
                Pending::Slices { op, slices } => {
                    let resolved = slices
                        .into_iter()
                        .map(|(name, offset, length)| Ok(Slice { value: self.lookup(name)?, offset, length }))
                        .collect::<Result<Vec<_>, String>>()?;
                    let func = self.func();
                    let mut kind = func.op(op).kind.clone();
                    match &mut kind {
                        OpKind::ResourceAlloc { slices, .. } | OpKind::ResourceConstants { slices, .. } => {
                            *slices = resolved
                        }
                        other => return Err(format!("{} does not take slices", other.name())),
                    }
                    func.set_kind(op, kind);
                }
                Pending::Ranges { op, ranges } => {
                    let resolved = ranges
                        .into_iter()
                        .map(|(resource, storage, offset, end)| {
                            Ok(ResolvedRange { resource: self.lookup(resource)?, storage: self.lookup(storage)?, offset, end })
                        })
                        .collect::<Result<Vec<_>, String>>()?;
                    self.func().set_ranges(op, resolved);
                }
            }
        }
        Ok(())
    }
}

/// Raw bits of a literal interpreted as `ty`.
fn literal_bits(literal: &str, ty: ElementType) -> Result<u64, String> {
    if let Some(hex) = literal.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).map(|v| v & ty.mask()).map_err(|e| format!("bad hex literal '{literal}': {e}"));
    }
    match ty {
        ElementType::Float { bits: 32 } => {
            literal.parse::<f32>().map(|f| f.to_bits() as u64).map_err(|e| format!("bad f32 literal '{literal}': {e}"))
        }
        ElementType::Float { bits: 64 } => {
            literal.parse::<f64>().map(f64::to_bits).map_err(|e| format!("bad f64 literal '{literal}': {e}"))
        }
        ElementType::Float { .. } => Err(format!("{ty} literals must be written as hex bits, found '{literal}'")),
        ElementType::Int { .. } => {
            if literal.starts_with('-') {
                literal.parse::<i64>().map(|v| v as u64 & ty.mask()).map_err(|e| format!("bad literal '{literal}': {e}"))
            } else {
                literal.parse::<u64>().map(|v| v & ty.mask()).map_err(|e| format!("bad literal '{literal}': {e}"))
            }
        }
    }
}

fn expect_operands(op: &str, found: usize, count: usize) -> Result<(), String> {
    if found != count {
        return Err(format!("{op} takes {count} operand(s), found {found}"));
    }
    Ok(())
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("hex data must have an even number of digits".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| format!("bad hex data: {e}")))
        .collect()
}

/// Builds an op kind from its name, positional operands and attributes.
fn build_kind(name: &str, operands: Vec<ValueId>, attrs: &mut Attrs<'_>) -> Result<OpKind, String> {
    use OpKind::*;
    let found = operands.len();
    let n = move |count| expect_operands(name, found, count);
    let kind = match name {
        "tensor.import" => {
            n(1)?;
            TensorImport { source: operands[0], result: attrs.desc("result")? }
        }
        "tensor.export" => {
            n(1)?;
            TensorExport { source: operands[0], source_desc: attrs.desc("source")?, source_size: attrs.index("source_size")? }
        }
        "tensor.sizeof" => {
            n(0)?;
            TensorSizeOf { desc: attrs.desc("desc")? }
        }
        "tensor.constant" => {
            n(0)?;
            TensorConstant { result: attrs.desc("result")?, value: attrs.constant("value")? }
        }
        "tensor.splat" => {
            n(0)?;
            TensorSplat { result: attrs.desc("result")?, result_size: attrs.index("result_size")?, value: attrs.scalar("value")? }
        }
        "tensor.clone" => {
            n(1)?;
            TensorClone {
                source: operands[0],
                source_desc: attrs.desc("source")?,
                source_size: attrs.index("source_size")?,
                result: attrs.desc("result")?,
                result_size: attrs.index("result_size")?,
            }
        }
        "tensor.slice" => {
            n(1)?;
            TensorSlice {
                source: operands[0],
                source_desc: attrs.desc("source")?,
                source_size: attrs.index("source_size")?,
                start: attrs.list("start")?,
                lengths: attrs.list("lengths")?,
                result: attrs.desc("result")?,
                result_size: attrs.index("result_size")?,
            }
        }
        "tensor.fill" => {
            n(1)?;
            TensorFill {
                target: operands[0],
                target_desc: attrs.desc("target")?,
                target_size: attrs.index("target_size")?,
                start: attrs.list("start")?,
                lengths: attrs.list("lengths")?,
                value: attrs.scalar("value")?,
            }
        }
        "tensor.update" => {
            n(2)?;
            TensorUpdate {
                target: operands[0],
                target_desc: attrs.desc("target")?,
                target_size: attrs.index("target_size")?,
                start: attrs.list("start")?,
                update: operands[1],
                update_desc: attrs.desc("update")?,
                update_size: attrs.index("update_size")?,
            }
        }
        "tensor.load" => {
            n(1)?;
            TensorLoad {
                source: operands[0],
                source_desc: attrs.desc("source")?,
                source_size: attrs.index("source_size")?,
                indices: attrs.list("indices")?,
            }
        }
        "tensor.store" => {
            n(1)?;
            TensorStore {
                target: operands[0],
                target_desc: attrs.desc("target")?,
                target_size: attrs.index("target_size")?,
                indices: attrs.list("indices")?,
                value: attrs.scalar("value")?,
            }
        }
        "tensor.dispatch" => {
            let (operand_descs, operand_sizes) = (attrs.descs("operands")?, attrs.list("operand_sizes")?);
            if operand_descs.len() != operands.len() || operand_sizes.len() != operands.len() {
                return Err(format!(
                    "tensor.dispatch has {} operands but {} descriptors and {} sizes",
                    operands.len(),
                    operand_descs.len(),
                    operand_sizes.len()
                ));
            }
            TensorDispatch {
                entry: attrs.symbol("entry")?,
                operands,
                operand_descs,
                operand_sizes,
                result: attrs.desc("result")?,
                result_size: attrs.index("result_size")?,
            }
        }
        "resource.import" => {
            n(1)?;
            ResourceImport { source: operands[0], size: attrs.index("size")? }
        }
        "resource.export" => {
            n(1)?;
            ResourceExport { source: operands[0], size: attrs.index("size")? }
        }
        "async.constant" => {
            n(0)?;
            AsyncConstant { value: attrs.constant("value")?, size: attrs.index("size")? }
        }
        "async.splat" => {
            n(0)?;
            AsyncSplat { pattern: attrs.scalar("pattern")?, size: attrs.index("size")? }
        }
        "builtin.splat_i64" => {
            n(0)?;
            BuiltinSplatI64 { pattern: attrs.scalar("pattern")?, size: attrs.index("size")? }
        }
        "async.clone" => {
            n(1)?;
            AsyncClone { source: operands[0], source_size: attrs.index("source_size")?, result_size: attrs.index("result_size")? }
        }
        "async.slice" => {
            n(1)?;
            AsyncSlice {
                source: operands[0],
                source_size: attrs.index("source_size")?,
                offset: attrs.index("offset")?,
                end: attrs.index("end")?,
                length: attrs.index("length")?,
            }
        }
        "async.fill" | "builtin.fill_i64" => {
            n(1)?;
            let (target, target_size, offset, end, length, pattern) = (
                operands[0],
                attrs.index("target_size")?,
                attrs.index("offset")?,
                attrs.index("end")?,
                attrs.index("length")?,
                attrs.scalar("pattern")?,
            );
            if name == "async.fill" {
                AsyncFill { target, target_size, offset, end, length, pattern }
            } else {
                BuiltinFillI64 { target, target_size, offset, end, length, pattern }
            }
        }
        "async.update" => {
            n(2)?;
            AsyncUpdate {
                target: operands[0],
                target_size: attrs.index("target_size")?,
                offset: attrs.index("offset")?,
                end: attrs.index("end")?,
                update: operands[1],
                update_size: attrs.index("update_size")?,
            }
        }
        "async.load" => {
            n(1)?;
            AsyncLoad {
                source: operands[0],
                source_size: attrs.index("source_size")?,
                offset: attrs.index("offset")?,
                ty: attrs.element("type")?,
            }
        }
        "async.store" => {
            n(1)?;
            AsyncStore {
                target: operands[0],
                target_size: attrs.index("target_size")?,
                offset: attrs.index("offset")?,
                value: attrs.scalar("value")?,
            }
        }
        "async.dispatch" => {
            let operand_sizes = attrs.list("operand_sizes")?;
            if operand_sizes.len() != operands.len() {
                return Err(format!("async.dispatch has {} operands but {} sizes", operands.len(), operand_sizes.len()));
            }
            let bindings = match attrs.take("bindings") {
                Some(Attr::List(list)) => list
                    .iter()
                    .map(|e| e.constant().map(|c| c as u32).ok_or_else(|| "bindings must be constants".to_string()))
                    .collect::<Result<Vec<_>, _>>()?,
                Some(other) => return Err(format!("bindings must be a list, found {other:?}")),
                None => Vec::new(),
            };
            AsyncDispatch {
                entry: attrs.symbol("entry")?,
                operands,
                operand_sizes,
                result_size: attrs.index("result_size")?,
                bindings,
            }
        }
        "resource.alloc" => {
            n(0)?;
            let lifetime = attrs.ident("lifetime")?;
            ResourceAlloc {
                size: attrs.index("size")?,
                lifetime: Lifetime::parse(lifetime).ok_or_else(|| format!("unknown lifetime '{lifetime}'"))?,
                slices: Vec::new(),
            }
        }
        "resource.constants" => {
            n(0)?;
            ResourceConstants { data: decode_hex(attrs.string("data")?)?, slices: Vec::new() }
        }
        "global.load" => {
            n(0)?;
            GlobalLoad { global: attrs.symbol("global")? }
        }
        "global.store" => {
            n(1)?;
            GlobalStore { global: attrs.symbol("global")?, value: operands[0] }
        }
        "return" => Return { values: operands },
        "binding.subspan" => {
            n(1)?;
            BindingSubspan { binding: operands[0], offset: attrs.index("offset")?, ty: attrs.tensor_type("type")? }
        }
        "dispatch.load" => {
            n(1)?;
            DispatchLoad { source: operands[0] }
        }
        "dispatch.store" => {
            n(2)?;
            DispatchStore { value: operands[0], target: operands[1] }
        }
        "dispatch.compute" => DispatchCompute {
            name: attrs.string("name")?.to_string(),
            inputs: operands,
            ty: attrs.tensor_type("type")?,
        },
        "arith.trunci" => {
            n(1)?;
            TruncI { source: operands[0], to: attrs.element("to")? }
        }
        "arith.extui" => {
            n(1)?;
            ExtUI { source: operands[0], to: attrs.element("to")? }
        }
        other => return Err(format!("unknown op '{other}'")),
    };
    Ok(kind)
}
