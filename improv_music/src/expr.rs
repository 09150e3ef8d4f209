// Restricted arithmetic evaluator for repairing model output.
//
// Language models often write `"time": 0.6 + 1.8` or `"time": "0.6 + 1.8"`
// where a number belongs. This module evaluates such expressions with a
// small recursive-descent parser. There are no identifiers, no function
// calls and no name lookup: only numbers, `+ - * /`, exponentiation
// (`^` or `**`, right-associative) and parentheses.
//
// Grammar:
//   expr  := term (('+' | '-') term)*
//   term  := unary (('*' | '/') unary)*
//   unary := ('+' | '-') unary | power
//   power := atom (('^' | '**') unary)?
//   atom  := number | '(' expr ')'
//
// Nesting depth is capped at `MAX_EXPR_DEPTH` so hostile input such as a
// long run of `(` or `-` cannot exhaust the stack.

use crate::error::ExprError;

/// Maximum parenthesis/unary nesting accepted by the evaluator.
pub const MAX_EXPR_DEPTH: usize = 64;

/// Decimal places kept when printing an evaluated result.
pub const RESULT_DECIMAL_PLACES: i32 = 6;

/// Evaluate an arithmetic expression to a finite `f64`.
pub fn evaluate(text: &str) -> Result<f64, ExprError> {
    let mut parser = Parser {
        bytes: text.as_bytes(),
        pos: 0,
        depth: 0,
    };
    parser.skip_ws();
    if parser.at_end() {
        return Err(ExprError::Empty);
    }
    let value = parser.expr()?;
    parser.skip_ws();
    if let Some(c) = parser.peek() {
        return Err(if c == b')' {
            ExprError::Unbalanced
        } else {
            parser.unexpected()
        });
    }
    if !value.is_finite() {
        return Err(ExprError::NonFinite);
    }
    Ok(value)
}

/// True if the text contains an operator beyond an optional leading sign,
/// i.e. it is an expression rather than a plain numeric literal.
pub fn is_compound(text: &str) -> bool {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix(['-', '+'])
        .unwrap_or(trimmed);
    body.contains(['+', '-', '*', '/', '^', '(', ')'])
}

/// Round a result for re-insertion into JSON text.
///
/// Keeps `RESULT_DECIMAL_PLACES` decimals so `0.6 + 1.8` prints as `2.4`
/// rather than `2.4000000000000004`.
pub fn round_result(value: f64) -> f64 {
    let scale = 10f64.powi(RESULT_DECIMAL_PLACES);
    let rounded = (value * scale).round() / scale;
    // Avoid printing "-0".
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Render an evaluated value as a JSON number literal.
pub fn format_number(value: f64) -> String {
    let rounded = round_result(value);
    if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
        format!("{}", rounded as i64)
    } else {
        format!("{rounded}")
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn expr(&mut self) -> Result<f64, ExprError> {
        let mut value = self.term()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, ExprError> {
        let mut value = self.unary()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'*') if self.peek_at(1) != Some(b'*') => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let divisor = self.unary()?;
                    if divisor == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    value /= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self) -> Result<f64, ExprError> {
        self.skip_ws();
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                self.nested(|p| p.unary()).map(|v| -v)
            }
            Some(b'+') => {
                self.pos += 1;
                self.nested(|p| p.unary())
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, ExprError> {
        let base = self.atom()?;
        self.skip_ws();
        let op_len = match (self.peek(), self.peek_at(1)) {
            (Some(b'^'), _) => 1,
            (Some(b'*'), Some(b'*')) => 2,
            _ => return Ok(base),
        };
        self.pos += op_len;
        let exponent = self.nested(|p| p.unary())?;
        let value = base.powf(exponent);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ExprError::NonFinite)
        }
    }

    fn atom(&mut self) -> Result<f64, ExprError> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.nested(|p| p.expr())?;
                self.skip_ws();
                if self.peek() == Some(b')') {
                    self.pos += 1;
                    Ok(value)
                } else {
                    Err(ExprError::Unbalanced)
                }
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(b')') => Err(ExprError::Unbalanced),
            Some(_) => Err(self.unexpected()),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn number(&mut self) -> Result<f64, ExprError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        // The slice only holds ASCII digits and dots.
        let literal = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default();
        literal
            .parse::<f64>()
            .map_err(|_| ExprError::BadNumber(literal.to_string()))
    }

    /// Run a sub-parse one nesting level deeper.
    fn nested(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<f64, ExprError>,
    ) -> Result<f64, ExprError> {
        if self.depth >= MAX_EXPR_DEPTH {
            return Err(ExprError::TooDeep(MAX_EXPR_DEPTH));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn unexpected(&self) -> ExprError {
        // Decode the full character at `pos` for the message; input may be
        // arbitrary UTF-8 even though only ASCII is accepted.
        let found = std::str::from_utf8(&self.bytes[self.pos..])
            .ok()
            .and_then(|rest| rest.chars().next())
            .unwrap_or('\u{FFFD}');
        ExprError::UnexpectedChar {
            found,
            offset: self.pos,
        }
    }
}
