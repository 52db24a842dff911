use crate::error::{LispError, LispResult};
use crate::heap::Heap;
use crate::symbol::{sym, SymbolTable};
use crate::value::{SymbolId, Value};

/// One element of a backquoted list.
enum Segment {
    /// `x` or `,x`: contributes one element.
    Item(Value),
    /// `,@x`: contributes every element of x.
    Splice(Value),
}

/// Parses source text into `Value` structures on the heap.
pub struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
    heap: &'a mut Heap,
    symbols: &'a mut SymbolTable,
    /// Backquotes currently open around the read position.
    quasi_depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a str, heap: &'a mut Heap, symbols: &'a mut SymbolTable) -> Self {
        Reader {
            input: input.as_bytes(),
            pos: 0,
            heap,
            symbols,
            quasi_depth: 0,
        }
    }

    /// Read one expression. Returns None at EOF.
    pub fn read(&mut self) -> LispResult<Option<Value>> {
        self.skip_whitespace_and_comments();
        if self.pos >= self.input.len() {
            return Ok(None);
        }
        let val = self.read_expr()?;
        Ok(Some(val))
    }

    /// Return current position in input.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read all expressions from input.
    pub fn read_all(&mut self) -> LispResult<Vec<Value>> {
        let mut results = Vec::new();
        while let Some(val) = self.read()? {
            results.push(val);
        }
        Ok(results)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn error(&self, msg: impl Into<String>) -> LispError {
        LispError::ReadError(format!("{} at offset {}", msg.into(), self.pos))
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while matches!(self.peek(), Some(ch) if ch.is_ascii_whitespace()) {
                self.pos += 1;
            }
            if self.peek() == Some(b';') {
                while !matches!(self.peek(), None | Some(b'\n')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn read_expr(&mut self) -> LispResult<Value> {
        self.skip_whitespace_and_comments();

        let ch = self.peek().ok_or_else(|| self.error("unexpected EOF"))?;

        match ch {
            b'(' => self.read_list(),
            b')' => Err(self.error("unexpected ')'")),
            b'\'' => {
                self.advance();
                self.read_wrapped(sym::QUOTE)
            }
            b'`' => self.read_backquote(),
            b',' => self.read_comma(),
            b'"' => Err(self.error("strings are not supported")),
            b'|' => self.read_escaped_symbol(),
            b'#' => self.read_dispatch(),
            _ => self.read_word(),
        }
    }

    /// Read a list: (a b c) or (a . b) or (a b . c)
    fn read_list(&mut self) -> LispResult<Value> {
        self.advance(); // consume '('

        let mut elements = Vec::new();
        let mut dot_tail = None;

        loop {
            self.skip_whitespace_and_comments();

            match self.peek() {
                None => return Err(self.error("unterminated list")),
                Some(b')') => {
                    self.advance();
                    break;
                }
                Some(b'.') if self.is_dot_separator() => {
                    if elements.is_empty() {
                        return Err(self.error("nothing before '.'"));
                    }
                    self.advance(); // consume '.'
                    dot_tail = Some(self.read_expr()?);
                    self.skip_whitespace_and_comments();
                    if self.advance() != Some(b')') {
                        return Err(self.error("expected ')' after dotted tail"));
                    }
                    break;
                }
                Some(_) => elements.push(self.read_expr()?),
            }
        }

        self.heap.list_with_tail(&elements, dot_tail.unwrap_or(Value::Nil))
    }

    /// A '.' followed by whitespace, ')' or EOF separates a dotted tail.
    fn is_dot_separator(&self) -> bool {
        match self.input.get(self.pos + 1) {
            None => true,
            Some(&next) => next.is_ascii_whitespace() || next == b')',
        }
    }

    /// Read the next expression as `(head expr)`.
    fn read_wrapped(&mut self, head: SymbolId) -> LispResult<Value> {
        let expr = self.read_expr()?;
        self.heap.list(&[Value::Symbol(head), expr])
    }

    /// `#'x` is `(function x)`; no other dispatch syntax exists.
    fn read_dispatch(&mut self) -> LispResult<Value> {
        self.advance(); // consume '#'
        match self.advance() {
            Some(b'\'') => self.read_wrapped(sym::FUNCTION),
            Some(ch) => Err(self.error(format!("unknown syntax #{}", ch as char))),
            None => Err(self.error("unexpected EOF after '#'")),
        }
    }

    // ========================================================================
    // Backquote
    // ========================================================================

    /// Read backquote: `expr -> expand at read time into list construction.
    fn read_backquote(&mut self) -> LispResult<Value> {
        self.advance(); // consume '`'
        self.quasi_depth += 1;
        let expr = self.read_expr();
        self.quasi_depth -= 1;
        self.expand_backquote(expr?)
    }

    /// Read comma: ,expr or ,@expr, kept as a marker form until the
    /// enclosing backquote expands it.
    fn read_comma(&mut self) -> LispResult<Value> {
        if self.quasi_depth == 0 {
            return Err(self.error("comma outside backquote"));
        }
        self.advance(); // consume ','
        let marker = if self.peek() == Some(b'@') {
            self.advance(); // consume '@'
            "unquote-splicing"
        } else {
            "unquote"
        };
        let marker = self.symbols.intern(marker);
        self.quasi_depth -= 1;
        let form = self.read_wrapped(marker);
        self.quasi_depth += 1;
        form
    }

    /// The x of `(marker x)`.
    fn unquoted(&self, val: Value, marker: &str) -> Option<Value> {
        let Value::Pair(id) = val else { return None };
        let head = self.symbols.lookup(marker)?;
        if self.heap.car(id) != Value::Symbol(head) {
            return None;
        }
        match self.heap.list_to_vec(self.heap.cdr(id)).as_deref() {
            Some([x]) => Some(*x),
            _ => None,
        }
    }

    fn expand_backquote(&mut self, expr: Value) -> LispResult<Value> {
        if let Some(x) = self.unquoted(expr, "unquote") {
            return Ok(x);
        }
        if self.unquoted(expr, "unquote-splicing").is_some() {
            return Err(self.error(",@ outside a list"));
        }
        match expr {
            Value::Pair(_) => self.expand_backquote_list(expr),
            Value::Symbol(_) => self.make_quoted(expr),
            _ => Ok(expr),
        }
    }

    /// Expand a backquoted list, handling , and ,@ inside.
    fn expand_backquote_list(&mut self, list: Value) -> LispResult<Value> {
        let mut segments = Vec::new();
        let mut current = list;

        while let Value::Pair(id) = current {
            // `(a . ,b)` reads as (a unquote b)
            if self.unquoted(current, "unquote").is_some() {
                break;
            }
            let car = self.heap.car(id);
            if let Some(x) = self.unquoted(car, "unquote-splicing") {
                segments.push(Segment::Splice(x));
            } else {
                segments.push(Segment::Item(self.expand_backquote(car)?));
            }
            current = self.heap.cdr(id);
        }

        let tail = if current.is_nil() {
            Value::Nil
        } else {
            self.expand_backquote(current)?
        };

        if tail.is_nil() && segments.iter().all(|s| matches!(s, Segment::Item(_))) {
            let mut items = vec![Value::Symbol(sym::LIST)];
            items.extend(segments.iter().map(|s| match s {
                Segment::Item(x) | Segment::Splice(x) => *x,
            }));
            return self.heap.list(&items);
        }

        // (cons a (append b ... tail))
        let mut result = tail;
        for segment in segments.iter().rev() {
            result = match *segment {
                Segment::Item(x) => self.heap.list(&[Value::Symbol(sym::CONS), x, result])?,
                Segment::Splice(x) if result.is_nil() => x,
                Segment::Splice(x) => self.heap.list(&[Value::Symbol(sym::APPEND), x, result])?,
            };
        }
        Ok(result)
    }

    /// Make (quote val)
    fn make_quoted(&mut self, val: Value) -> LispResult<Value> {
        self.heap.list(&[Value::Symbol(sym::QUOTE), val])
    }

    // ========================================================================
    // Atoms
    // ========================================================================

    /// Read an escaped symbol: |symbol name|
    fn read_escaped_symbol(&mut self) -> LispResult<Value> {
        self.advance(); // consume '|'
        let start = self.pos;
        loop {
            match self.advance() {
                Some(b'|') => break,
                Some(_) => {}
                None => return Err(self.error("unterminated |symbol|")),
            }
        }
        let name = std::str::from_utf8(&self.input[start..self.pos - 1])
            .map_err(|_| self.error("invalid UTF-8 in symbol name"))?
            .to_string();
        Ok(Value::from_symbol(self.symbols.intern(&name)))
    }

    /// Read a word: symbol or integer.
    fn read_word(&mut self) -> LispResult<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(ch) if !is_delimiter(ch)) {
            self.pos += 1;
        }

        let word = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.error("invalid UTF-8"))?
            .to_string();

        if word.is_empty() {
            return Err(self.error("empty word"));
        }
        if word == "." {
            return Err(self.error("unexpected '.'"));
        }

        if let Some(n) = self.try_parse_number(&word)? {
            return Ok(n);
        }

        Ok(Value::from_symbol(self.symbols.intern(&word)))
    }

    /// Integers are an optional sign followed by digits; everything else is
    /// a symbol.
    fn try_parse_number(&self, word: &str) -> LispResult<Option<Value>> {
        let digits = word.strip_prefix(['+', '-']).unwrap_or(word);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        word.parse::<i64>()
            .map(|n| Some(Value::Int(n)))
            .map_err(|_| self.error(format!("integer {} out of range", word)))
    }
}

fn is_delimiter(ch: u8) -> bool {
    ch.is_ascii_whitespace() || matches!(ch, b'(' | b')' | b'\'' | b'`' | b',' | b'"' | b';')
}

/// Read a single expression from a string.
pub fn read_str(input: &str, heap: &mut Heap, symbols: &mut SymbolTable) -> LispResult<Value> {
    let mut reader = Reader::new(input, heap, symbols);
    reader
        .read()?
        .ok_or_else(|| LispError::ReadError("empty input".into()))
}

/// Read all expressions from a string.
pub fn read_all(input: &str, heap: &mut Heap, symbols: &mut SymbolTable) -> LispResult<Vec<Value>> {
    let mut reader = Reader::new(input, heap, symbols);
    reader.read_all()
}

/// Read one expression starting at byte offset `pos`.
/// Returns `Ok(Some((value, new_pos)))` or `Ok(None)` if only whitespace/comments remain.
pub fn read_one_at(
    input: &str,
    pos: usize,
    heap: &mut Heap,
    symbols: &mut SymbolTable,
) -> LispResult<Option<(Value, usize)>> {
    let rest = input
        .get(pos..)
        .ok_or_else(|| LispError::ReadError(format!("offset {} is not a character boundary", pos)))?;
    let mut reader = Reader::new(rest, heap, symbols);
    match reader.read()? {
        Some(val) => Ok(Some((val, pos + reader.position()))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::printer::print_val;
    use crate::world::World;

    fn world() -> World {
        World::new(&Config::default()).unwrap()
    }

    fn read_print(w: &mut World, src: &str) -> String {
        let val = read_str(src, &mut w.heap, &mut w.symbols).unwrap();
        print_val(val, w)
    }

    #[test]
    fn reads_atoms() {
        let mut w = world();
        let vals = read_all("42 -7 +3 nil t foo 1+ - :key", &mut w.heap, &mut w.symbols).unwrap();
        assert_eq!(vals[0], Value::Int(42));
        assert_eq!(vals[1], Value::Int(-7));
        assert_eq!(vals[2], Value::Int(3));
        assert_eq!(vals[3], Value::Nil);
        assert_eq!(vals[4], Value::True);
        assert_eq!(print_val(vals[5], &w), "foo");
        assert!(vals[6].is_symbol());
        assert!(vals[7].is_symbol());
        let key = vals[8].as_symbol().unwrap();
        assert!(w.symbols.is_keyword(key));
    }

    #[test]
    fn reads_lists_and_dotted_pairs() {
        let mut w = world();
        assert_eq!(read_print(&mut w, "(a (b c) . d)"), "(a (b c) . d)");
        assert_eq!(read_print(&mut w, "()"), "nil");
        assert_eq!(read_print(&mut w, "(a ; comment\n b)"), "(a b)");
    }

    #[test]
    fn reads_quote_and_function_sugar() {
        let mut w = world();
        let val = read_str("'x", &mut w.heap, &mut w.symbols).unwrap();
        assert_eq!(w.heap.car_val(val).unwrap(), Value::Symbol(sym::QUOTE));
        assert_eq!(read_print(&mut w, "#'car"), "#'car");
    }

    #[test]
    fn expands_backquote() {
        let mut w = world();
        assert_eq!(read_print(&mut w, "`(+ ,x ,x)"), "(list '+ x x)");
        assert_eq!(read_print(&mut w, "`(a ,@b c)"), "(cons 'a (append b (cons 'c nil)))");
        assert_eq!(read_print(&mut w, "`(a ,@b)"), "(cons 'a b)");
        assert_eq!(read_print(&mut w, "`x"), "'x");
        assert_eq!(read_print(&mut w, "`5"), "5");
    }

    #[test]
    fn escaped_symbols_keep_their_text() {
        let mut w = world();
        assert_eq!(read_print(&mut w, "|hello world|"), "|hello world|");
    }

    #[test]
    fn malformed_input_is_a_read_error() {
        let mut w = world();
        for src in ["(a b", ")", "\"str\"", ",x", "(. a)", "99999999999999999999", "#x"] {
            assert!(
                matches!(read_str(src, &mut w.heap, &mut w.symbols), Err(LispError::ReadError(_))),
                "{}",
                src
            );
        }
    }

    #[test]
    fn read_one_at_walks_the_input() {
        let mut w = world();
        let src = "(a) b";
        let (first, pos) = read_one_at(src, 0, &mut w.heap, &mut w.symbols).unwrap().unwrap();
        assert_eq!(print_val(first, &w), "(a)");
        let (second, pos) = read_one_at(src, pos, &mut w.heap, &mut w.symbols).unwrap().unwrap();
        assert_eq!(print_val(second, &w), "b");
        assert!(read_one_at(src, pos, &mut w.heap, &mut w.symbols).unwrap().is_none());
    }

    #[test]
    fn read_returns_none_at_end() {
        let mut w = world();
        let mut reader = Reader::new("1 ; trailing", &mut w.heap, &mut w.symbols);
        assert_eq!(reader.read().unwrap(), Some(Value::Int(1)));
        assert_eq!(reader.read().unwrap(), None);
        assert_eq!(reader.position(), 12);
    }
}
