//! Recursive-descent parser producing the expression AST.
//!
//! Precedence, lowest first: `||`, `&&`, `!`, comparison / `in`, member access.

use regex::Regex;

use super::lexer::{tokenize, Spanned, Token};
use super::{ParseError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StringMethod {
    StartsWith,
    EndsWith,
    Contains,
}

impl StringMethod {
    pub(crate) fn name(self) -> &'static str {
        match self {
            StringMethod::StartsWith => "startsWith",
            StringMethod::EndsWith => "endsWith",
            StringMethod::Contains => "contains",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Literal(Value),
    Attribute(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(CompareOp, Box<Node>, Box<Node>),
    In(Box<Node>, Vec<Node>),
    Method(StringMethod, Box<Node>, Box<Node>),
    /// `target.matches("pattern")`; the pattern must be a literal and is
    /// compiled once at parse time.
    Matches(Box<Node>, Regex),
}

/// Bound on AST depth. Parenthesised groups, `!`, method calls and every
/// `&&` / `||` link each count one level, so evaluation and drop of any
/// accepted tree stay well inside a thread's stack.
pub(crate) const MAX_DEPTH: usize = 128;

pub(crate) fn parse(src: &str) -> Result<Node, ParseError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(ParseError::new(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: src.len(),
        depth: 0,
    };
    let node = parser.or()?;
    if let Some(extra) = parser.tokens.get(parser.pos) {
        return Err(ParseError::new(
            extra.offset,
            format!("unexpected token {:?}", extra.token),
        ));
    }
    Ok(node)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |s| s.offset)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ParseError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(ParseError::new(self.offset(), format!("expected {what}")))
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(ParseError::new(self.offset(), "expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn or(&mut self) -> Result<Node, ParseError> {
        let base = self.depth;
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            self.enter()?;
            let rhs = self.and()?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Node, ParseError> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        while self.eat(&Token::And) {
            self.enter()?;
            let rhs = self.unary()?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node, ParseError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Node, ParseError> {
        let lhs = self.member()?;

        if self.eat(&Token::In) {
            self.expect(Token::LBracket, "'[' after 'in'")?;
            let mut items = Vec::new();
            if !self.eat(&Token::RBracket) {
                loop {
                    items.push(self.member()?);
                    if self.eat(&Token::RBracket) {
                        break;
                    }
                    self.expect(Token::Comma, "',' or ']' in list")?;
                }
            }
            return Ok(Node::In(Box::new(lhs), items));
        }

        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.member()?;
        Ok(Node::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    /// Primary followed by any number of `.name(...)` method calls.
    fn member(&mut self) -> Result<Node, ParseError> {
        let base = self.depth;
        let mut node = self.primary()?;

        while self.peek() == Some(&Token::Dot) {
            let offset = self.offset();
            self.enter()?;
            self.pos += 1;
            let name = match self.peek() {
                Some(Token::Ident(name)) => name.clone(),
                _ => return Err(ParseError::new(self.offset(), "expected method name after '.'")),
            };
            self.pos += 1;
            self.expect(Token::LParen, "'(' after method name")?;
            let arg_offset = self.offset();
            let arg = self.or()?;
            self.expect(Token::RParen, "')' after method argument")?;

            node = match name.as_str() {
                "startsWith" => Node::Method(StringMethod::StartsWith, Box::new(node), Box::new(arg)),
                "endsWith" => Node::Method(StringMethod::EndsWith, Box::new(node), Box::new(arg)),
                "contains" => Node::Method(StringMethod::Contains, Box::new(node), Box::new(arg)),
                "matches" => {
                    let Node::Literal(Value::String(pattern)) = arg else {
                        return Err(ParseError::new(
                            arg_offset,
                            "matches() requires a string literal pattern",
                        ));
                    };
                    let regex = Regex::new(&pattern).map_err(|e| {
                        ParseError::new(arg_offset, format!("invalid pattern: {e}"))
                    })?;
                    Node::Matches(Box::new(node), regex)
                }
                other => {
                    return Err(ParseError::new(offset, format!("unknown method '{other}'")));
                }
            };
        }

        self.depth = base;
        Ok(node)
    }

    fn primary(&mut self) -> Result<Node, ParseError> {
        let offset = self.offset();
        let Some(token) = self.peek().cloned() else {
            return Err(ParseError::new(offset, "unexpected end of expression"));
        };
        self.pos += 1;

        match token {
            Token::Str(s) => Ok(Node::Literal(Value::String(s))),
            Token::Int(n) => Ok(Node::Literal(Value::Int(n))),
            Token::True => Ok(Node::Literal(Value::Bool(true))),
            Token::False => Ok(Node::Literal(Value::Bool(false))),
            Token::LParen => {
                self.enter()?;
                let inner = self.or()?;
                self.expect(Token::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            Token::Ident(first) => {
                // Extend the dotted attribute path as long as the segment
                // after the dot is not itself a method call.
                let mut path = first;
                while self.peek() == Some(&Token::Dot) {
                    let is_segment = matches!(
                        (self.tokens.get(self.pos + 1), self.tokens.get(self.pos + 2)),
                        (Some(Spanned { token: Token::Ident(_), .. }), next)
                            if !matches!(next, Some(Spanned { token: Token::LParen, .. }))
                    );
                    if !is_segment {
                        break;
                    }
                    if let Some(Spanned {
                        token: Token::Ident(segment),
                        ..
                    }) = self.tokens.get(self.pos + 1)
                    {
                        path.push('.');
                        path.push_str(segment);
                    }
                    self.pos += 2;
                }
                Ok(Node::Attribute(path))
            }
            other => Err(ParseError::new(offset, format!("unexpected token {other:?}"))),
        }
    }
}
