//! Path-query interpreter over a [`Document`].
//!
//! Implements the subset of XPath 1.0 that extraction rules use:
//!
//! | Construct | Example |
//! |-----------|---------|
//! | Relative / absolute paths | `chapter/verse`, `/book`, `//verse` |
//! | Abbreviations | `.`, `..`, `@n`, `.//p` |
//! | Axes | `ancestor::chapter`, `following-sibling::*` |
//! | Node tests | `name`, `p:name`, `*`, `text()`, `node()` |
//! | Predicates | `[1]`, `[last()]`, `[@type='x']`, `[title]` |
//! | Union | `chapter \| appendix` |
//! | Functions | `normalize-space`, `string`, `concat`, `name`, `local-name`, `count`, `contains`, `starts-with`, `not`, `position`, `last` |
//!
//! Unprefixed name tests match on local name regardless of namespace.
//! Prefixed tests resolve through the supplied namespace map and compare
//! namespace URIs, falling back to the lexical prefix when unmapped.

use std::collections::BTreeMap;

use thiserror::Error;

use super::{Document, NodeId, NodeKind};

/// Prefix → namespace URI bindings for prefixed name tests.
pub type Namespaces = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid selector '{expr}': {reason}")]
pub struct SelectorError {
    pub expr: String,
    pub reason: String,
}

/// A parsed selector expression.
#[derive(Debug, Clone)]
pub struct Selector {
    source: String,
    expr: Expr,
}

/// One selected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    Node(NodeId),
    Attr { owner: NodeId, index: usize },
}

impl Item {
    fn order_key(&self) -> (NodeId, usize) {
        match *self {
            Item::Node(id) => (id, 0),
            Item::Attr { owner, index } => (owner, index + 1),
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Items(Vec<Item>),
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone)]
enum Expr {
    Path(PathExpr),
    Union(Vec<Expr>),
    Literal(String),
    Number(f64),
    Call(Function, Vec<Expr>),
    Compare { negate: bool, left: Box<Expr>, right: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    NormalizeSpace,
    String,
    Concat,
    Name,
    LocalName,
    Count,
    Contains,
    StartsWith,
    Not,
    Position,
    Last,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "normalize-space" => Function::NormalizeSpace,
            "string" => Function::String,
            "concat" => Function::Concat,
            "name" => Function::Name,
            "local-name" => Function::LocalName,
            "count" => Function::Count,
            "contains" => Function::Contains,
            "starts-with" => Function::StartsWith,
            "not" => Function::Not,
            "position" => Function::Position,
            "last" => Function::Last,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
struct PathExpr {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfNode,
    Parent,
    Ancestor,
    AncestorOrSelf,
    Attribute,
    FollowingSibling,
    PrecedingSibling,
}

impl Axis {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "self" => Axis::SelfNode,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "attribute" => Axis::Attribute,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
enum NodeTest {
    Name { prefix: Option<String>, local: String },
    Wildcard { prefix: Option<String> },
    Text,
    AnyNode,
}

/// Evaluation context: current item plus its position within the set.
#[derive(Clone, Copy)]
struct Ctx {
    item: Item,
    position: usize,
    size: usize,
}

impl Selector {
    pub fn parse(expr: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(expr).map_err(|reason| SelectorError {
            expr: expr.to_string(),
            reason,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let parsed = parser
            .parse_expr()
            .and_then(|e| {
                if parser.pos < parser.tokens.len() {
                    Err(format!("unexpected token {:?}", parser.tokens[parser.pos]))
                } else {
                    Ok(e)
                }
            })
            .map_err(|reason| SelectorError {
                expr: expr.to_string(),
                reason,
            })?;
        Ok(Self {
            source: expr.to_string(),
            expr: parsed,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Nodes selected from `context`, in document order. Attribute and
    /// scalar results are ignored.
    pub fn select_nodes(&self, doc: &Document, context: NodeId, ns: &Namespaces) -> Vec<NodeId> {
        match self.evaluate(doc, context, ns) {
            Value::Items(items) => items
                .into_iter()
                .filter_map(|i| match i {
                    Item::Node(id) => Some(id),
                    Item::Attr { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Every result coerced to trimmed text, dropping empty values.
    pub fn strings(&self, doc: &Document, context: NodeId, ns: &Namespaces) -> Vec<String> {
        match self.evaluate(doc, context, ns) {
            Value::Items(items) => items
                .iter()
                .map(|i| item_string(doc, i).trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            other => {
                let s = value_string(doc, &other).trim().to_string();
                if s.is_empty() {
                    Vec::new()
                } else {
                    vec![s]
                }
            }
        }
    }

    /// First non-empty string result.
    pub fn first_string(&self, doc: &Document, context: NodeId, ns: &Namespaces) -> Option<String> {
        self.strings(doc, context, ns).into_iter().next()
    }

    fn evaluate(&self, doc: &Document, context: NodeId, ns: &Namespaces) -> Value {
        let eval = Evaluator { doc, ns };
        eval.eval(
            &self.expr,
            Ctx {
                item: Item::Node(context),
                position: 1,
                size: 1,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Pipe,
    Eq,
    NotEq,
    Star,
    ColonColon,
    Colon,
    Name(String),
    Literal(String),
    Number(f64),
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '.' if chars.get(i + 1) == Some(&'.') => {
                tokens.push(Token::DotDot);
                i += 2;
            }
            '.' if chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                let (num, next) = read_number(&chars, i)?;
                tokens.push(Token::Number(num));
                i = next;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '@' => {
                tokens.push(Token::At);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                tokens.push(Token::ColonColon);
                i += 2;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '\'' | '"' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|ch| *ch == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Literal(chars[i + 1..i + 1 + close].iter().collect()));
                i += close + 2;
            }
            c if c.is_ascii_digit() => {
                let (num, next) = read_number(&chars, i)?;
                tokens.push(Token::Number(num));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.'))
                {
                    i += 1;
                }
                // A trailing '.' belongs to the next token (e.g. `a/.`).
                while i > start + 1 && chars[i - 1] == '.' {
                    i -= 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

fn read_number(chars: &[char], start: usize) -> Result<(f64, usize), String> {
    let mut i = start;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, i))
        .map_err(|_| format!("bad number '{}'", text))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(format!("expected {:?}, found {:?}", want, t)),
            None => Err(format!("expected {:?}, found end of input", want)),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        let left = self.parse_union()?;
        let negate = match self.peek() {
            Some(Token::Eq) => false,
            Some(Token::NotEq) => true,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_union()?;
        Ok(Expr::Compare {
            negate,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_union(&mut self) -> Result<Expr, String> {
        let first = self.parse_primary()?;
        if self.peek() != Some(&Token::Pipe) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            parts.push(self.parse_primary()?);
        }
        Ok(Expr::Union(parts))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.peek().cloned() {
            Some(Token::Literal(s)) => {
                self.pos += 1;
                Ok(Expr::Literal(s))
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Expr::Number(n))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(name))
                if self.peek_at(1) == Some(&Token::LParen) && name != "text" && name != "node" =>
            {
                let func = Function::lookup(&name)
                    .ok_or_else(|| format!("unknown function '{}'", name))?;
                self.pos += 2;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Call(func, args))
            }
            Some(_) => self.parse_path().map(Expr::Path),
            None => Err("empty expression".to_string()),
        }
    }

    fn parse_path(&mut self) -> Result<PathExpr, String> {
        let mut steps = Vec::new();
        let absolute = match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                if !self.starts_step() {
                    return Ok(PathExpr {
                        absolute: true,
                        steps,
                    });
                }
                true
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(descendant_or_self());
                true
            }
            _ => false,
        };

        steps.push(self.parse_step()?);
        loop {
            match self.peek() {
                Some(Token::Slash) => {
                    self.pos += 1;
                    steps.push(self.parse_step()?);
                }
                Some(Token::DoubleSlash) => {
                    self.pos += 1;
                    steps.push(descendant_or_self());
                    steps.push(self.parse_step()?);
                }
                _ => break,
            }
        }
        Ok(PathExpr { absolute, steps })
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_))
        )
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        match self.peek() {
            Some(Token::Dot) => {
                self.pos += 1;
                return Ok(Step {
                    axis: Axis::SelfNode,
                    test: NodeTest::AnyNode,
                    predicates: Vec::new(),
                });
            }
            Some(Token::DotDot) => {
                self.pos += 1;
                return Ok(Step {
                    axis: Axis::Parent,
                    test: NodeTest::AnyNode,
                    predicates: Vec::new(),
                });
            }
            _ => {}
        }

        let axis = if self.peek() == Some(&Token::At) {
            self.pos += 1;
            Axis::Attribute
        } else if let (Some(Token::Name(name)), Some(Token::ColonColon)) =
            (self.peek().cloned(), self.peek_at(1))
        {
            self.pos += 2;
            Axis::lookup(&name).ok_or_else(|| format!("unknown axis '{}'", name))?
        } else {
            Axis::Child
        };

        let test = self.parse_node_test()?;
        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            predicates.push(self.parse_expr()?);
            self.expect(Token::RBracket)?;
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_node_test(&mut self) -> Result<NodeTest, String> {
        match self.next() {
            Some(Token::Star) => Ok(NodeTest::Wildcard { prefix: None }),
            Some(Token::Name(name)) => {
                if self.peek() == Some(&Token::LParen) && (name == "text" || name == "node") {
                    self.pos += 1;
                    self.expect(Token::RParen)?;
                    return Ok(if name == "text" {
                        NodeTest::Text
                    } else {
                        NodeTest::AnyNode
                    });
                }
                if self.peek() == Some(&Token::Colon) {
                    self.pos += 1;
                    return match self.next() {
                        Some(Token::Star) => Ok(NodeTest::Wildcard { prefix: Some(name) }),
                        Some(Token::Name(local)) => Ok(NodeTest::Name {
                            prefix: Some(name),
                            local,
                        }),
                        other => Err(format!("expected local name after prefix, found {:?}", other)),
                    };
                }
                Ok(NodeTest::Name {
                    prefix: None,
                    local: name,
                })
            }
            Some(other) => Err(format!("expected node test, found {:?}", other)),
            None => Err("expected node test, found end of input".to_string()),
        }
    }
}

fn descendant_or_self() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::AnyNode,
        predicates: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

struct Evaluator<'a> {
    doc: &'a Document,
    ns: &'a Namespaces,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr, ctx: Ctx) -> Value {
        match expr {
            Expr::Literal(s) => Value::Str(s.clone()),
            Expr::Number(n) => Value::Num(*n),
            Expr::Path(path) => Value::Items(self.eval_path(path, ctx.item)),
            Expr::Union(parts) => {
                let mut items = Vec::new();
                for part in parts {
                    if let Value::Items(found) = self.eval(part, ctx) {
                        items.extend(found);
                    }
                }
                Value::Items(sort_dedup(items))
            }
            Expr::Compare {
                negate,
                left,
                right,
            } => {
                let l = self.eval(left, ctx);
                let r = self.eval(right, ctx);
                Value::Bool(self.compare(&l, &r) != *negate)
            }
            Expr::Call(func, args) => self.call(*func, args, ctx),
        }
    }

    fn compare(&self, l: &Value, r: &Value) -> bool {
        match (l, r) {
            (Value::Items(a), Value::Items(b)) => a.iter().any(|x| {
                let xs = item_string(self.doc, x);
                b.iter().any(|y| item_string(self.doc, y) == xs)
            }),
            (Value::Items(items), other) | (other, Value::Items(items)) => {
                items.iter().any(|i| {
                    let s = item_string(self.doc, i);
                    match other {
                        Value::Num(n) => s.trim().parse::<f64>().is_ok_and(|v| v == *n),
                        Value::Bool(b) => *b,
                        _ => s == value_string(self.doc, other),
                    }
                })
            }
            (Value::Num(a), b) | (b, Value::Num(a)) => {
                value_string(self.doc, b).trim().parse::<f64>().is_ok_and(|v| v == *a)
            }
            (a, b) => value_string(self.doc, a) == value_string(self.doc, b),
        }
    }

    fn call(&self, func: Function, args: &[Expr], ctx: Ctx) -> Value {
        let arg_string = |idx: usize| -> String {
            match args.get(idx) {
                Some(e) => value_string(self.doc, &self.eval(e, ctx)),
                None => item_string(self.doc, &ctx.item),
            }
        };
        let arg_item = |idx: usize| -> Option<Item> {
            match args.get(idx) {
                Some(e) => match self.eval(e, ctx) {
                    Value::Items(items) => items.into_iter().next(),
                    _ => None,
                },
                None => Some(ctx.item),
            }
        };

        match func {
            Function::NormalizeSpace => Value::Str(
                arg_string(0)
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            Function::String => Value::Str(arg_string(0)),
            Function::Concat => Value::Str(
                args.iter()
                    .map(|e| value_string(self.doc, &self.eval(e, ctx)))
                    .collect(),
            ),
            Function::Name | Function::LocalName => {
                let name = arg_item(0)
                    .map(|item| match item {
                        Item::Node(id) => match self.doc.element(id) {
                            Some(el) if func == Function::Name => el.qualified_name(),
                            Some(el) => el.local.clone(),
                            None => String::new(),
                        },
                        Item::Attr { owner, index } => self
                            .doc
                            .element(owner)
                            .map(|el| {
                                let a = &el.attrs[index];
                                if func == Function::Name {
                                    a.name.clone()
                                } else {
                                    a.local.clone()
                                }
                            })
                            .unwrap_or_default(),
                    })
                    .unwrap_or_default();
                Value::Str(name)
            }
            Function::Count => match args.first().map(|e| self.eval(e, ctx)) {
                Some(Value::Items(items)) => Value::Num(items.len() as f64),
                _ => Value::Num(0.0),
            },
            Function::Contains => Value::Bool(arg_string(0).contains(&arg_string(1))),
            Function::StartsWith => Value::Bool(arg_string(0).starts_with(&arg_string(1))),
            Function::Not => Value::Bool(
                !args
                    .first()
                    .map(|e| truthy(&self.eval(e, ctx)))
                    .unwrap_or(false),
            ),
            Function::Position => Value::Num(ctx.position as f64),
            Function::Last => Value::Num(ctx.size as f64),
        }
    }

    fn eval_path(&self, path: &PathExpr, start: Item) -> Vec<Item> {
        let mut current = if path.absolute {
            vec![Item::Node(self.doc.document_node())]
        } else {
            vec![start]
        };
        for step in &path.steps {
            let mut next = Vec::new();
            for item in &current {
                next.extend(self.eval_step(step, *item));
            }
            current = sort_dedup(next);
        }
        current
    }

    fn eval_step(&self, step: &Step, context: Item) -> Vec<Item> {
        let mut candidates: Vec<Item> = self
            .axis_items(step.axis, context)
            .into_iter()
            .filter(|item| self.node_test(&step.test, step.axis, item))
            .collect();

        for pred in &step.predicates {
            let size = candidates.len();
            candidates = candidates
                .into_iter()
                .enumerate()
                .filter(|(idx, item)| {
                    let ctx = Ctx {
                        item: *item,
                        position: idx + 1,
                        size,
                    };
                    match self.eval(pred, ctx) {
                        Value::Num(n) => (n - (idx + 1) as f64).abs() < f64::EPSILON,
                        other => truthy(&other),
                    }
                })
                .map(|(_, item)| item)
                .collect();
        }
        candidates
    }

    /// Items along an axis, in axis order (reverse axes nearest-first).
    fn axis_items(&self, axis: Axis, context: Item) -> Vec<Item> {
        let doc = self.doc;
        let id = match context {
            Item::Node(id) => id,
            Item::Attr { owner, .. } => {
                return match axis {
                    Axis::Parent => vec![Item::Node(owner)],
                    Axis::SelfNode => vec![context],
                    _ => Vec::new(),
                }
            }
        };
        let nodes: Vec<NodeId> = match axis {
            Axis::Child => doc.node(id).children.clone(),
            Axis::Descendant => doc.descendants(id),
            Axis::DescendantOrSelf => {
                let mut v = vec![id];
                v.extend(doc.descendants(id));
                v
            }
            Axis::SelfNode => vec![id],
            Axis::Parent => doc.parent(id).into_iter().collect(),
            Axis::Ancestor => doc.ancestors(id).collect(),
            Axis::AncestorOrSelf => std::iter::once(id).chain(doc.ancestors(id)).collect(),
            Axis::FollowingSibling | Axis::PrecedingSibling => {
                let Some(parent) = doc.parent(id) else {
                    return Vec::new();
                };
                let siblings = &doc.node(parent).children;
                let pos = siblings.iter().position(|s| *s == id).unwrap_or(0);
                if axis == Axis::FollowingSibling {
                    siblings[pos + 1..].to_vec()
                } else {
                    siblings[..pos].iter().rev().copied().collect()
                }
            }
            Axis::Attribute => {
                return doc
                    .element(id)
                    .map(|el| {
                        (0..el.attrs.len())
                            .map(|index| Item::Attr { owner: id, index })
                            .collect()
                    })
                    .unwrap_or_default();
            }
        };
        nodes.into_iter().map(Item::Node).collect()
    }

    fn node_test(&self, test: &NodeTest, axis: Axis, item: &Item) -> bool {
        match *item {
            Item::Attr { owner, index } => {
                let Some(attr) = self.doc.element(owner).map(|el| &el.attrs[index]) else {
                    return false;
                };
                match test {
                    NodeTest::AnyNode | NodeTest::Wildcard { prefix: None } => true,
                    NodeTest::Wildcard { prefix: Some(p) } => attr.name.starts_with(&format!("{}:", p)),
                    NodeTest::Name { prefix: None, local } => &attr.local == local,
                    NodeTest::Name {
                        prefix: Some(p),
                        local,
                    } => attr.name == format!("{}:{}", p, local),
                    NodeTest::Text => false,
                }
            }
            Item::Node(id) => {
                if axis == Axis::Attribute {
                    return false;
                }
                let kind = &self.doc.node(id).kind;
                match test {
                    NodeTest::AnyNode => true,
                    NodeTest::Text => matches!(kind, NodeKind::Text(_)),
                    NodeTest::Wildcard { prefix } => match kind {
                        NodeKind::Element(el) => self.prefix_matches(prefix.as_deref(), el),
                        _ => false,
                    },
                    NodeTest::Name { prefix, local } => match kind {
                        NodeKind::Element(el) => {
                            &el.local == local && self.prefix_matches(prefix.as_deref(), el)
                        }
                        _ => false,
                    },
                }
            }
        }
    }

    fn prefix_matches(&self, prefix: Option<&str>, el: &super::Element) -> bool {
        match prefix {
            None => true,
            Some(p) => match self.ns.get(p) {
                Some(uri) => el.namespace.as_deref() == Some(uri.as_str()),
                None => el.prefix.as_deref() == Some(p),
            },
        }
    }
}

fn sort_dedup(mut items: Vec<Item>) -> Vec<Item> {
    items.sort_by_key(Item::order_key);
    items.dedup();
    items
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Items(items) => !items.is_empty(),
        Value::Str(s) => !s.is_empty(),
        Value::Num(n) => *n != 0.0 && !n.is_nan(),
        Value::Bool(b) => *b,
    }
}

fn item_string(doc: &Document, item: &Item) -> String {
    match *item {
        Item::Node(id) => doc.string_value(id),
        Item::Attr { owner, index } => doc
            .element(owner)
            .map(|el| el.attrs[index].value.clone())
            .unwrap_or_default(),
    }
}

fn value_string(doc: &Document, value: &Value) -> String {
    match value {
        Value::Items(items) => items
            .first()
            .map(|i| item_string(doc, i))
            .unwrap_or_default(),
        Value::Str(s) => s.clone(),
        Value::Num(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", *n as i64),
        Value::Num(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
    }
}
