//! Right-hand sides written as text, e.g. `["v", "-g_over_l * sin(theta)"]`.
//!
//! Source strings are tokenized, parsed into an [`Expr`] tree by recursive
//! descent, and compiled into stack [`Bytecode`]. [`ExpressionSystem`] runs
//! one program per state component and implements [`DynamicalSystem`], so a
//! compiled system can be handed straight to the integrator.

use crate::traits::{DynamicalSystem, Scalar};
use std::cell::RefCell;
use std::collections::HashMap;
use thiserror::Error;

/// Name bound to the current time inside expressions.
pub const TIME_SYMBOL: &str = "t";

/// Deepest nesting of subexpressions the parser accepts.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedCharacter { found: char, offset: usize },
    #[error("malformed number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str },
    #[error("unexpected end of expression, expected {expected}")]
    UnexpectedEnd { expected: &'static str },
    #[error("unknown variable or parameter '{0}'")]
    UnknownIdentifier(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("duplicate name '{0}'")]
    DuplicateName(String),
    #[error("expected {expected} equations (one per variable), got {found}")]
    EquationCount { expected: usize, found: usize },
    #[error("expected {expected} parameter values, got {found}")]
    ParameterCount { expected: usize, found: usize },
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("equation {index}: {error}")]
    InEquation {
        index: usize,
        error: Box<ExpressionError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Abs,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "exp" => Function::Exp,
            "ln" | "log" => Function::Ln,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            _ => return None,
        })
    }

    fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Identifier(String),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    Const(f64),
    Var(usize),
    Param(usize),
    Time,
    Neg,
    Binary(BinaryOp),
    Call(Function),
}

/// A compiled expression: a postfix program for a small value stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    /// Runs the program. `stack` is scratch space reused between calls.
    pub fn evaluate<T: Scalar>(&self, t: T, vars: &[T], params: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();
        for op in &self.ops {
            let value = match *op {
                OpCode::Const(c) => T::from_f64(c).unwrap(),
                OpCode::Var(i) => vars[i],
                OpCode::Param(i) => params[i],
                OpCode::Time => t,
                OpCode::Neg => -pop(stack),
                OpCode::Call(f) => f.apply(pop(stack)),
                OpCode::Binary(op) => {
                    let b = pop(stack);
                    let a = pop(stack);
                    match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => a / b,
                        BinaryOp::Pow => a.powf(b),
                    }
                }
            };
            stack.push(value);
        }
        stack.pop().unwrap_or_else(T::zero)
    }
}

// Compiled programs are balanced, so the stack never underflows; NaN keeps a
// corrupted program visible instead of panicking.
fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::nan)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {n}"),
            Token::Identifier(name) => format!("identifier '{name}'"),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::Caret => "'^'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some(&(_, d)) = chars.peek() {
                let exponent_sign =
                    (d == '+' || d == '-') && literal.ends_with(|e: char| e == 'e' || e == 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    literal.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = literal
                .parse()
                .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                found => return Err(ExpressionError::UnexpectedCharacter { found, offset }),
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

/// Parses one expression.
///
/// Grammar, loosest binding first:
/// `sum := product (('+'|'-') product)*`,
/// `product := unary (('*'|'/') unary)*`,
/// `unary := '-' unary | power`,
/// `power := primary ('^' unary)?` (right associative),
/// `primary := number | identifier | identifier '(' sum ')' | '(' sum ')'`.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.sum()?;
    match parser.next() {
        None => Ok(expr),
        Some(token) => Err(ExpressionError::UnexpectedToken {
            found: token.describe(),
            expected: "end of expression",
        }),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    // Nesting of the tree under construction; bounds recursion here and in
    // the compiler and drop glue.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn expect_closing(&mut self) -> Result<(), ExpressionError> {
        match self.next() {
            Some(Token::RParen) => Ok(()),
            Some(token) => Err(ExpressionError::UnexpectedToken {
                found: token.describe(),
                expected: "')'",
            }),
            None => Err(ExpressionError::UnexpectedEnd { expected: "')'" }),
        }
    }

    fn sum(&mut self) -> Result<Expr, ExpressionError> {
        let depth = self.depth;
        let mut left = self.product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => {
                    self.depth = depth;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.descend()?;
            let right = self.product()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn product(&mut self) -> Result<Expr, ExpressionError> {
        let depth = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => {
                    self.depth = depth;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.descend()?;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        self.descend()?;
        let expr = if let Some(Token::Minus) = self.peek() {
            self.pos += 1;
            Expr::Negate(Box::new(self.unary()?))
        } else {
            self.power()?
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn power(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let function = Function::lookup(&name)
                        .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                    let arg = self.sum()?;
                    self.expect_closing()?;
                    Ok(Expr::Call(function, Box::new(arg)))
                } else {
                    Ok(Expr::Identifier(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.sum()?;
                self.expect_closing()?;
                Ok(expr)
            }
            Some(token) => Err(ExpressionError::UnexpectedToken {
                found: token.describe(),
                expected: "a number, name or '('",
            }),
            None => Err(ExpressionError::UnexpectedEnd {
                expected: "a number, name or '('",
            }),
        }
    }
}

/// Resolves names to variable and parameter slots and emits bytecode.
#[derive(Debug, Clone)]
pub struct Compiler {
    var_map: HashMap<String, usize>,
    param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Result<Self, ExpressionError> {
        let mut var_map = HashMap::new();
        let mut param_map = HashMap::new();
        for (i, name) in var_names.iter().enumerate() {
            if name == TIME_SYMBOL || var_map.insert(name.clone(), i).is_some() {
                return Err(ExpressionError::DuplicateName(name.clone()));
            }
        }
        for (i, name) in param_names.iter().enumerate() {
            if name == TIME_SYMBOL
                || var_map.contains_key(name)
                || param_map.insert(name.clone(), i).is_some()
            {
                return Err(ExpressionError::DuplicateName(name.clone()));
            }
        }
        Ok(Self { var_map, param_map })
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, ExpressionError> {
        let mut ops = Vec::new();
        self.emit(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn emit(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), ExpressionError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::Const(*n)),
            Expr::Identifier(name) => {
                let op = if let Some(&i) = self.var_map.get(name) {
                    OpCode::Var(i)
                } else if let Some(&i) = self.param_map.get(name) {
                    OpCode::Param(i)
                } else if name == TIME_SYMBOL {
                    OpCode::Time
                } else {
                    return Err(ExpressionError::UnknownIdentifier(name.clone()));
                };
                ops.push(op);
            }
            Expr::Negate(operand) => {
                self.emit(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Binary(op, left, right) => {
                self.emit(left, ops)?;
                self.emit(right, ops)?;
                ops.push(OpCode::Binary(*op));
            }
            Expr::Call(function, arg) => {
                self.emit(arg, ops)?;
                ops.push(OpCode::Call(*function));
            }
        }
        Ok(())
    }
}

/// A [`DynamicalSystem`] whose components are compiled expressions.
pub struct ExpressionSystem<T: Scalar> {
    pub equations: Vec<Bytecode>,
    pub params: Vec<T>,
    // Scratch stack reused across evaluations; makes the type !Sync.
    stack: RefCell<Vec<T>>,
}

impl<T: Scalar> ExpressionSystem<T> {
    pub fn new(equations: Vec<Bytecode>, params: Vec<T>) -> Self {
        Self {
            equations,
            params,
            stack: RefCell::new(Vec::with_capacity(32)),
        }
    }

    /// Parses and compiles one equation per variable.
    ///
    /// ```
    /// use odekit_core::expression::ExpressionSystem;
    /// use odekit_core::traits::DynamicalSystem;
    ///
    /// let system = ExpressionSystem::<f64>::build(
    ///     &["v", "-g_over_l * sin(theta)"],
    ///     &["theta", "v"],
    ///     &[("g_over_l", 10.0)],
    /// )
    /// .unwrap();
    /// let mut out = [0.0; 2];
    /// system.apply(0.0, &[0.0, 1.0], &mut out);
    /// assert_eq!(out, [1.0, 0.0]);
    /// ```
    pub fn build<S: AsRef<str>>(
        equations: &[S],
        var_names: &[&str],
        params: &[(&str, f64)],
    ) -> Result<Self, ExpressionError> {
        if equations.len() != var_names.len() {
            return Err(ExpressionError::EquationCount {
                expected: var_names.len(),
                found: equations.len(),
            });
        }
        let var_names: Vec<String> = var_names.iter().map(|s| s.to_string()).collect();
        let param_names: Vec<String> = params.iter().map(|(name, _)| name.to_string()).collect();
        let compiler = Compiler::new(&var_names, &param_names)?;

        let mut programs = Vec::with_capacity(equations.len());
        for (index, source) in equations.iter().enumerate() {
            let program = parse(source.as_ref())
                .and_then(|expr| compiler.compile(&expr))
                .map_err(|error| ExpressionError::InEquation {
                    index,
                    error: Box::new(error),
                })?;
            programs.push(program);
        }

        let values = params
            .iter()
            .map(|&(_, value)| T::from_f64(value).unwrap())
            .collect();
        Ok(Self::new(programs, values))
    }

    /// Replaces the parameter values, keeping their order.
    pub fn set_params(&mut self, params: Vec<T>) -> Result<(), ExpressionError> {
        if params.len() != self.params.len() {
            return Err(ExpressionError::ParameterCount {
                expected: self.params.len(),
                found: params.len(),
            });
        }
        self.params = params;
        Ok(())
    }
}

impl<T: Scalar> DynamicalSystem<T> for ExpressionSystem<T> {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        let mut stack = self.stack.borrow_mut();
        for (slot, program) in out.iter_mut().zip(&self.equations) {
            *slot = program.evaluate(t, x, &self.params, &mut stack);
        }
    }
}
