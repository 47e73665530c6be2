use crate::autodiff::{self, Dual};
use crate::traits::{Constraint, Scalar, ScalarMap};
use anyhow::{anyhow, bail, Result};
use nalgebra::DMatrix;
use std::cell::RefCell;
use std::collections::HashMap;

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes the ambient coordinate with the given index.
    LoadVar(usize),
    /// Pushes the value of a named parameter (by index).
    LoadParam(usize),
    Add,
    Sub,
    Mul,
    Div,
    /// Pops (b, a), pushes a ^ b.
    Pow,
    /// Pops a, pushes a ^ n for a compile-time integer exponent.
    Powi(i32),
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Neg,
}

/// A compiled sequence of operations producing one scalar.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based evaluator. Stateless; the caller owns the stack buffer.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, vars: &[T], params: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::from_f64(val).unwrap_or_else(T::nan)),
                OpCode::LoadVar(idx) => stack.push(vars[idx]),
                OpCode::LoadParam(idx) => stack.push(params[idx]),
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, |a, b| a.powf(b)),
                OpCode::Powi(n) => unary(stack, |a| a.powi(n)),
                OpCode::Sin => unary(stack, |a| a.sin()),
                OpCode::Cos => unary(stack, |a| a.cos()),
                OpCode::Tan => unary(stack, |a| a.tan()),
                OpCode::Exp => unary(stack, |a| a.exp()),
                OpCode::Ln => unary(stack, |a| a.ln()),
                OpCode::Sqrt => unary(stack, |a| a.sqrt()),
                OpCode::Neg => unary(stack, |a| -a),
            }
        }

        // Compiled bytecode always leaves exactly one value.
        stack.pop().unwrap_or_else(T::nan)
    }
}

fn unary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T) -> T) {
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a));
}

fn binary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T, T) -> T) {
    let b = stack.pop().unwrap_or_else(T::nan);
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a, b));
}

// --- AST & Parser ---

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>),
}

/// Resolves names to indices and lowers an `Expr` into `Bytecode`.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let param_map = param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { var_map, param_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else if name == "pi" {
                    ops.push(OpCode::LoadConst(std::f64::consts::PI));
                } else {
                    bail!("Unknown variable or parameter: {}", name);
                }
            }
            Expr::Binary(left, '^', right) => {
                self.compile_recursive(left, ops)?;
                match right.as_ref() {
                    Expr::Number(n) if n.fract() == 0.0 && n.abs() <= i32::MAX as f64 => {
                        ops.push(OpCode::Powi(*n as i32));
                    }
                    _ => {
                        self.compile_recursive(right, ops)?;
                        ops.push(OpCode::Pow);
                    }
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    _ => bail!("Unknown binary operator: {}", op),
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => bail!("Unknown unary operator: {}", op),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "ln" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    _ => bail!("Unknown function: {}", func),
                });
            }
        }
        Ok(())
    }
}

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        bail!("Unexpected trailing token {:?} in \"{}\"", token, input);
    }
    Ok(expr)
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

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign = (d == '-' || d == '+') && num_str.ends_with(['e', 'E']);
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| anyhow!("Invalid number literal \"{}\"", num_str))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => bail!("Unexpected character '{}' in \"{}\"", c, input),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Unary minus binds looser than '^': -x^2 == -(x^2).
    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    // Right associative: a^b^c == a^(b^c).
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    match self.consume() {
                        Some(Token::RParen) => Ok(Expr::Call(name, Box::new(arg))),
                        _ => bail!("Expected ')'"),
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(expr),
                    _ => bail!("Expected ')'"),
                }
            }
            Some(token) => bail!("Unexpected token {:?}", token),
            None => bail!("Unexpected end of expression"),
        }
    }
}

// --- ExpressionConstraint ---

/// An equality constraint written as text, one expression per row, each
/// required to evaluate to zero on the manifold.
pub struct ExpressionConstraint {
    pub equations: Vec<Bytecode>,
    pub var_names: Vec<String>,
    pub params: Vec<f64>,
    // Reused by f64 evaluation; makes the constraint !Sync.
    stack: RefCell<Vec<f64>>,
}

impl ExpressionConstraint {
    /// `var_names` name the ambient coordinates in order; `params` are named
    /// constants the expressions may refer to.
    pub fn new(var_names: &[&str], params: &[(&str, f64)], expressions: &[&str]) -> Result<Self> {
        if var_names.is_empty() {
            bail!("A constraint needs at least one ambient variable.");
        }
        if expressions.is_empty() {
            bail!("A constraint needs at least one equation.");
        }
        if expressions.len() >= var_names.len() {
            bail!(
                "{} equations over {} variables leave no manifold to plan on.",
                expressions.len(),
                var_names.len()
            );
        }

        let var_names: Vec<String> = var_names.iter().map(|s| s.to_string()).collect();
        let param_names: Vec<String> = params.iter().map(|(name, _)| name.to_string()).collect();
        let compiler = Compiler::new(&var_names, &param_names);
        let mut equations = Vec::with_capacity(expressions.len());
        for text in expressions {
            let expr = parse(text)?;
            equations.push(compiler.compile(&expr)?);
        }

        Ok(Self {
            equations,
            var_names,
            params: params.iter().map(|(_, value)| *value).collect(),
            stack: RefCell::new(Vec::with_capacity(64)),
        })
    }
}

impl ScalarMap<f64> for ExpressionConstraint {
    fn inputs(&self) -> usize {
        self.var_names.len()
    }

    fn outputs(&self) -> usize {
        self.equations.len()
    }

    fn evaluate(&self, x: &[f64], out: &mut [f64]) {
        let mut stack = self.stack.borrow_mut();
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = VM::execute(eq, x, &self.params, &mut stack);
        }
    }
}

impl ScalarMap<Dual> for ExpressionConstraint {
    fn inputs(&self) -> usize {
        self.var_names.len()
    }

    fn outputs(&self) -> usize {
        self.equations.len()
    }

    fn evaluate(&self, x: &[Dual], out: &mut [Dual]) {
        let params: Vec<Dual> = self.params.iter().map(|&p| Dual::constant(p)).collect();
        let mut stack = Vec::with_capacity(64);
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = VM::execute(eq, x, &params, &mut stack);
        }
    }
}

impl Constraint for ExpressionConstraint {
    fn ambient_dimension(&self) -> usize {
        self.var_names.len()
    }

    fn co_dimension(&self) -> usize {
        self.equations.len()
    }

    fn function(&self, x: &[f64], out: &mut [f64]) {
        ScalarMap::<f64>::evaluate(self, x, out);
    }

    fn jacobian(&self, x: &[f64]) -> DMatrix<f64> {
        autodiff::jacobian(self, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T>(result: Result<T>, needle: &str) {
        let Err(err) = result else {
            panic!("expected an error containing \"{needle}\"");
        };
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn eval(text: &str, vars: &[f64]) -> f64 {
        let names: Vec<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        let compiler = Compiler::new(&names[..vars.len()], &[]);
        let code = compiler.compile(&parse(text).expect("parse")).expect("compile");
        VM::execute(&code, vars, &[], &mut Vec::new())
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", &[]), 7.0);
        assert_eq!(eval("-x^2", &[3.0]), -9.0);
        assert_eq!(eval("2^3^2", &[]), 512.0);
        assert_eq!(eval("(1 - 2) - 3", &[]), -4.0);
        assert!((eval("1e-3 * 2", &[]) - 2e-3).abs() < 1e-15);
    }

    #[test]
    fn integer_powers_compile_to_powi() {
        let compiler = Compiler::new(&["x".to_string()], &[]);
        let code = compiler.compile(&parse("x^2").unwrap()).unwrap();
        assert_eq!(code.ops, vec![OpCode::LoadVar(0), OpCode::Powi(2)]);
    }

    #[test]
    fn compile_rejects_unknown_symbols() {
        let compiler = Compiler::new(&["x".to_string()], &[]);
        assert_err_contains(compiler.compile(&parse("x + w").unwrap()), "Unknown variable");
        assert_err_contains(compiler.compile(&parse("foo(x)").unwrap()), "Unknown function");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert_err_contains(parse("(x + 1"), "Expected ')'");
        assert_err_contains(parse("x $ y"), "Unexpected character");
        assert_err_contains(parse("x y"), "trailing token");
        assert_err_contains(parse(""), "end of expression");
    }

    #[test]
    fn expression_constraint_evaluates_and_differentiates() {
        let torus = ExpressionConstraint::new(
            &["x", "y", "z"],
            &[("R", 2.0), ("r", 1.0)],
            &["(sqrt(x^2 + y^2) - R)^2 + z^2 - r^2"],
        )
        .expect("torus constraint");
        assert_eq!(torus.ambient_dimension(), 3);
        assert_eq!(torus.manifold_dimension(), 2);
        assert!(torus.residual_norm(&[3.0, 0.0, 0.0]) < 1e-12);

        let x: [f64; 3] = [-2.5, 0.3, 0.4];
        let analytic = {
            let rho = (x[0] * x[0] + x[1] * x[1]).sqrt();
            let s = 2.0 * (rho - 2.0) / rho;
            [s * x[0], s * x[1], 2.0 * x[2]]
        };
        let jac = torus.jacobian(&x);
        for j in 0..3 {
            assert!((jac[(0, j)] - analytic[j]).abs() < 1e-12);
        }
    }

    #[test]
    fn expression_constraint_requires_positive_manifold_dimension() {
        assert_err_contains(
            ExpressionConstraint::new(&["x"], &[], &["x - 1"]),
            "no manifold",
        );
    }
}
