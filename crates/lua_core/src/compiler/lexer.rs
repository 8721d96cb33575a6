//! Hand-written single-pass lexer (§4.9). Grounded on the `Reader`-over-bytes
//! idiom in the teacher's `compiler/parser/lexer.rs`: a cursor over the raw
//! source bytes, line counted as it advances, with no intermediate string
//! allocation for whitespace/comments.

use super::token::{Token, TokenKind, KEYWORDS};
use super::SyntaxError;

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    chunk_name: &'a str,
}

type LexResult<T> = Result<T, SyntaxError>;

impl<'a> Lexer<'a> {
    pub fn new(src: &'a [u8], chunk_name: &'a str) -> Self {
        let mut pos = 0;
        // Skip a leading shebang line, matching the teacher's front end.
        if src.starts_with(b"#") {
            while pos < src.len() && src[pos] != b'\n' {
                pos += 1;
            }
        }
        Lexer { src, pos, line: 1, chunk_name }
    }

    pub fn tokenize(mut self) -> LexResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn err<T>(&self, msg: impl Into<String>) -> LexResult<T> {
        Err(SyntaxError::new(self.line, msg))
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) -> LexResult<()> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.pos += 2;
                    if self.peek() == Some(b'[') {
                        if let Some(level) = self.long_bracket_level() {
                            self.read_long_bracket(level)?;
                            continue;
                        }
                    }
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// At a `[`, check for `=*[` and return the number of `=`s, without
    /// consuming anything if it isn't actually a long-bracket opener.
    fn long_bracket_level(&mut self) -> Option<usize> {
        let start = self.pos;
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut i = self.pos + 1;
        let mut level = 0;
        while self.src.get(i) == Some(&b'=') {
            level += 1;
            i += 1;
        }
        if self.src.get(i) == Some(&b'[') {
            self.pos = i + 1;
            Some(level)
        } else {
            self.pos = start;
            None
        }
    }

    /// Reads the body of a `[=*[ ... ]=*]` block, cursor already past the
    /// opener. A newline immediately after the opener is skipped (§4.9's
    /// "long bracket literal, the usual skip-first-newline rule").
    fn read_long_bracket(&mut self, level: usize) -> LexResult<Vec<u8>> {
        if self.peek() == Some(b'\r') {
            self.advance();
            if self.peek() == Some(b'\n') {
                self.advance();
            }
        } else if self.peek() == Some(b'\n') {
            self.advance();
        }
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return self.err("unfinished long bracket"),
                Some(b']') => {
                    let save = self.pos;
                    self.pos += 1;
                    let mut eq = 0;
                    while self.peek() == Some(b'=') {
                        eq += 1;
                        self.pos += 1;
                    }
                    if eq == level && self.peek() == Some(b']') {
                        self.pos += 1;
                        return Ok(out);
                    }
                    self.pos = save;
                    out.push(self.advance().unwrap());
                }
                Some(_) => out.push(self.advance().unwrap()),
            }
        }
    }

    fn next_token(&mut self) -> LexResult<Token> {
        self.skip_trivia()?;
        let line = self.line;
        let Some(c) = self.peek() else {
            return Ok(Token { kind: TokenKind::Eof, line });
        };
        let kind = match c {
            b'0'..=b'9' => self.read_number()?,
            b'"' | b'\'' => self.read_short_string(c)?,
            b'[' if matches!(self.peek_at(1), Some(b'[') | Some(b'=')) => {
                if let Some(level) = self.long_bracket_level() {
                    TokenKind::Str(self.read_long_bracket(level)?)
                } else {
                    self.advance();
                    TokenKind::LBracket
                }
            }
            c if c.is_ascii_alphabetic() || c == b'_' => self.read_name(),
            _ => self.read_symbol()?,
        };
        Ok(Token { kind, line })
    }

    fn read_name(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        for (kw, kind) in KEYWORDS {
            if *kw == text {
                return kind.clone();
            }
        }
        TokenKind::Name(text.to_string())
    }

    fn read_number(&mut self) -> LexResult<TokenKind> {
        let start = self.pos;
        let mut is_float = false;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.pos += 2;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            if self.peek() == Some(b'.') {
                is_float = true;
                self.pos += 1;
                while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                    self.pos += 1;
                }
            }
            if matches!(self.peek(), Some(b'p') | Some(b'P')) {
                is_float = true;
                self.pos += 1;
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.pos += 1;
                }
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            return if is_float {
                parse_hex_float(text).map(TokenKind::Float).ok_or_else(|| {
                    SyntaxError::new(self.line, format!("malformed number near '{text}'"))
                })
            } else {
                i64::from_str_radix(&text[2..], 16)
                    .map(TokenKind::Int)
                    .or_else(|_| u64::from_str_radix(&text[2..], 16).map(|v| TokenKind::Int(v as i64)))
                    .map_err(|_| SyntaxError::new(self.line, format!("malformed number near '{text}'")))
            };
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| SyntaxError::new(self.line, format!("malformed number near '{text}'")))
        } else {
            match text.parse::<i64>() {
                Ok(i) => Ok(TokenKind::Int(i)),
                Err(_) => text
                    .parse::<f64>()
                    .map(TokenKind::Float)
                    .map_err(|_| SyntaxError::new(self.line, format!("malformed number near '{text}'"))),
            }
        }
    }

    fn read_short_string(&mut self, quote: u8) -> LexResult<TokenKind> {
        self.advance();
        let mut out = Vec::new();
        loop {
            match self.advance() {
                None => return self.err("unfinished string"),
                Some(c) if c == quote => break,
                Some(b'\n') => return self.err("unfinished string"),
                Some(b'\\') => self.read_escape(&mut out)?,
                Some(c) => out.push(c),
            }
        }
        Ok(TokenKind::Str(out))
    }

    fn read_escape(&mut self, out: &mut Vec<u8>) -> LexResult<()> {
        match self.advance() {
            None => self.err("unfinished string"),
            Some(b'n') => Ok(out.push(b'\n')),
            Some(b't') => Ok(out.push(b'\t')),
            Some(b'r') => Ok(out.push(b'\r')),
            Some(b'a') => Ok(out.push(0x07)),
            Some(b'b') => Ok(out.push(0x08)),
            Some(b'f') => Ok(out.push(0x0c)),
            Some(b'v') => Ok(out.push(0x0b)),
            Some(b'\\') => Ok(out.push(b'\\')),
            Some(b'"') => Ok(out.push(b'"')),
            Some(b'\'') => Ok(out.push(b'\'')),
            Some(b'\n') => Ok(out.push(b'\n')),
            Some(b'z') => {
                while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
                    self.advance();
                }
                Ok(())
            }
            Some(b'x') => {
                let mut v: u32 = 0;
                for _ in 0..2 {
                    let d = self.advance().and_then(|c| (c as char).to_digit(16));
                    let Some(d) = d else { return self.err("hexadecimal digit expected") };
                    v = v * 16 + d;
                }
                Ok(out.push(v as u8))
            }
            Some(b'u') => {
                if self.advance() != Some(b'{') {
                    return self.err("missing '{' in \\u{xxxx}");
                }
                let mut v: u32 = 0;
                let mut ndigits = 0;
                while let Some(d) = self.peek().and_then(|c| (c as char).to_digit(16)) {
                    v = v.saturating_mul(16).saturating_add(d);
                    ndigits += 1;
                    self.advance();
                }
                if ndigits == 0 {
                    return self.err("hexadecimal digit expected");
                }
                if self.advance() != Some(b'}') {
                    return self.err("missing '}' in \\u{xxxx}");
                }
                match char::from_u32(v) {
                    Some(ch) => {
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                        Ok(())
                    }
                    None => self.err("UTF-8 value too large"),
                }
            }
            Some(c) if c.is_ascii_digit() => {
                let mut v: u32 = (c - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d) if d.is_ascii_digit() => {
                            v = v * 10 + (d - b'0') as u32;
                            self.advance();
                        }
                        _ => break,
                    }
                }
                if v > 255 {
                    return self.err("decimal escape too large");
                }
                Ok(out.push(v as u8))
            }
            Some(c) => self.err(format!("invalid escape sequence '\\{}'", c as char)),
        }
    }

    fn read_symbol(&mut self) -> LexResult<TokenKind> {
        let c = self.advance().unwrap();
        Ok(match c {
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => {
                if self.eat(b'/') {
                    TokenKind::DSlash
                } else {
                    TokenKind::Slash
                }
            }
            b'%' => TokenKind::Percent,
            b'^' => TokenKind::Caret,
            b'#' => TokenKind::Hash,
            b'&' => TokenKind::Amp,
            b'~' => {
                if self.eat(b'=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Tilde
                }
            }
            b'|' => TokenKind::Pipe,
            b'<' => {
                if self.eat(b'<') {
                    TokenKind::Shl
                } else if self.eat(b'=') {
                    TokenKind::LessEq
                } else {
                    TokenKind::Less
                }
            }
            b'>' => {
                if self.eat(b'>') {
                    TokenKind::Shr
                } else if self.eat(b'=') {
                    TokenKind::GreaterEq
                } else {
                    TokenKind::Greater
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b':' => {
                if self.eat(b':') {
                    TokenKind::DColon
                } else {
                    TokenKind::Colon
                }
            }
            b';' => TokenKind::Semi,
            b',' => TokenKind::Comma,
            b'.' => {
                if self.eat(b'.') {
                    if self.eat(b'.') {
                        TokenKind::Ellipsis
                    } else {
                        TokenKind::Concat
                    }
                } else if matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.pos -= 1;
                    return self.read_number();
                } else {
                    TokenKind::Dot
                }
            }
            other => return self.err(format!("unexpected symbol near '{}'", other as char)),
        })
    }
}

fn parse_hex_float(text: &str) -> Option<f64> {
    // `0x1.8p3`-style hex floats aren't in `f64::from_str`; parse by hand.
    let body = &text[2..];
    let (mantissa, exp) = match body.find(|c| c == 'p' || c == 'P') {
        Some(i) => (&body[..i], body[i + 1..].parse::<i32>().ok()?),
        None => (body, 0),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
        None => (mantissa, ""),
    };
    let mut value = 0f64;
    for c in int_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        value += c.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    Some(value * 2f64.powi(exp))
}
