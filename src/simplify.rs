//! Textual simplification of rendered expressions.
//!
//! The symbolic printers emit fully parenthesised text such as
//! `(x0*(x1+x1))`. This module parses that text back into a small arithmetic
//! tree, applies the algebraic rewrites the printers make necessary
//! (duplicate-operand collapse, constant folding, coefficient hoisting) and
//! prints the result with minimal parentheses, e.g. `2*x0*x1`.
//!
//! Anything that fails to parse is returned unchanged; simplification is a
//! presentation pass and must never lose an expression.

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Num(f64),
    Sym(String),
    Add(Vec<Ast>),
    Sub(Box<Ast>, Box<Ast>),
    Mul(Vec<Ast>),
    Div(Box<Ast>, Box<Ast>),
    Call(String, Box<Ast>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit()
                        || bytes[i] == '.'
                        || bytes[i] == 'e'
                        || bytes[i] == 'E'
                        || ((bytes[i] == '+' || bytes[i] == '-')
                            && matches!(bytes[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                tokens.push(Token::Num(text.parse().ok()?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_alphanumeric() || bytes[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(bytes[start..i].iter().collect()));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Option<Ast> {
        let mut lhs = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.bump();
                    let rhs = self.term()?;
                    lhs = match lhs {
                        Ast::Add(mut terms) => {
                            terms.push(rhs);
                            Ast::Add(terms)
                        }
                        other => Ast::Add(vec![other, rhs]),
                    };
                }
                Token::Minus => {
                    self.bump();
                    let rhs = self.term()?;
                    lhs = Ast::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Some(lhs)
    }

    fn term(&mut self) -> Option<Ast> {
        let mut lhs = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.bump();
                    let rhs = self.factor()?;
                    lhs = match lhs {
                        Ast::Mul(mut factors) => {
                            factors.push(rhs);
                            Ast::Mul(factors)
                        }
                        other => Ast::Mul(vec![other, rhs]),
                    };
                }
                Token::Slash => {
                    self.bump();
                    let rhs = self.factor()?;
                    lhs = Ast::Div(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Some(lhs)
    }

    fn factor(&mut self) -> Option<Ast> {
        match self.bump()? {
            Token::Num(n) => Some(Ast::Num(n)),
            Token::Minus => {
                let inner = self.factor()?;
                Some(match inner {
                    Ast::Num(n) => Ast::Num(-n),
                    other => Ast::Sub(Box::new(Ast::Num(0.0)), Box::new(other)),
                })
            }
            Token::Open => {
                let inner = self.expr()?;
                match self.bump()? {
                    Token::Close => Some(inner),
                    _ => None,
                }
            }
            Token::Ident(name) => {
                if matches!(self.peek(), Some(Token::Open)) {
                    self.bump();
                    let arg = self.expr()?;
                    match self.bump()? {
                        Token::Close => Some(Ast::Call(name, Box::new(arg))),
                        _ => None,
                    }
                } else {
                    Some(Ast::Sym(name))
                }
            }
            _ => None,
        }
    }
}

fn simplify_ast(ast: Ast) -> Ast {
    match ast {
        Ast::Num(_) | Ast::Sym(_) => ast,
        Ast::Call(name, arg) => Ast::Call(name, Box::new(simplify_ast(*arg))),
        Ast::Sub(a, b) => {
            let a = simplify_ast(*a);
            let b = simplify_ast(*b);
            match (&a, &b) {
                _ if a == b => Ast::Num(0.0),
                (Ast::Num(x), Ast::Num(y)) => Ast::Num(x - y),
                (_, Ast::Num(y)) if *y == 0.0 => a,
                _ => Ast::Sub(Box::new(a), Box::new(b)),
            }
        }
        Ast::Div(a, b) => {
            let a = simplify_ast(*a);
            let b = simplify_ast(*b);
            match (&a, &b) {
                _ if a == b => Ast::Num(1.0),
                (Ast::Num(x), Ast::Num(y)) => Ast::Num(x / y),
                (Ast::Num(x), _) if *x == 0.0 => Ast::Num(0.0),
                (_, Ast::Num(y)) if *y == 1.0 => a,
                _ => Ast::Div(Box::new(a), Box::new(b)),
            }
        }
        Ast::Add(terms) => {
            let mut flat: Vec<Ast> = Vec::new();
            let mut constant = 0.0;
            for term in terms {
                match simplify_ast(term) {
                    Ast::Add(inner) => flat.extend(inner),
                    Ast::Num(n) => constant += n,
                    other => flat.push(other),
                }
            }
            // Collapse repeated terms into a coefficient.
            let mut grouped: Vec<(Ast, usize)> = Vec::new();
            for term in flat {
                if let Some(entry) = grouped.iter_mut().find(|(t, _)| *t == term) {
                    entry.1 += 1;
                } else {
                    grouped.push((term, 1));
                }
            }
            let mut out: Vec<Ast> = grouped
                .into_iter()
                .map(|(term, count)| {
                    if count == 1 {
                        term
                    } else {
                        simplify_ast(Ast::Mul(vec![Ast::Num(count as f64), term]))
                    }
                })
                .collect();
            if constant != 0.0 || out.is_empty() {
                out.push(Ast::Num(constant));
            }
            if out.len() == 1 {
                out.pop().unwrap()
            } else {
                Ast::Add(out)
            }
        }
        Ast::Mul(factors) => {
            let mut flat: Vec<Ast> = Vec::new();
            let mut constant = 1.0;
            for factor in factors {
                match simplify_ast(factor) {
                    Ast::Mul(inner) => {
                        for f in inner {
                            if let Ast::Num(n) = f {
                                constant *= n;
                            } else {
                                flat.push(f);
                            }
                        }
                    }
                    Ast::Num(n) => constant *= n,
                    other => flat.push(other),
                }
            }
            if constant == 0.0 {
                return Ast::Num(0.0);
            }
            let mut out: Vec<Ast> = Vec::new();
            if constant != 1.0 {
                out.push(Ast::Num(constant));
            }
            out.extend(flat);
            match out.len() {
                0 => Ast::Num(1.0),
                1 => out.pop().unwrap(),
                _ => Ast::Mul(out),
            }
        }
    }
}

fn precedence(ast: &Ast) -> u8 {
    match ast {
        Ast::Add(_) | Ast::Sub(..) => 1,
        Ast::Mul(_) | Ast::Div(..) => 2,
        _ => 3,
    }
}

fn print_child(child: &Ast, min_prec: u8) -> String {
    let text = print_ast(child);
    if precedence(child) < min_prec {
        format!("({text})")
    } else {
        text
    }
}

fn format_num(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn print_ast(ast: &Ast) -> String {
    match ast {
        Ast::Num(n) => format_num(*n),
        Ast::Sym(name) => name.clone(),
        Ast::Add(terms) => terms
            .iter()
            .map(|t| print_child(t, 1))
            .collect::<Vec<_>>()
            .join("+"),
        Ast::Sub(a, b) => format!("{}-{}", print_child(a, 1), print_child(b, 2)),
        Ast::Mul(factors) => factors
            .iter()
            .map(|f| print_child(f, 2))
            .collect::<Vec<_>>()
            .join("*"),
        Ast::Div(a, b) => format!("{}/{}", print_child(a, 2), print_child(b, 3)),
        Ast::Call(name, arg) => format!("{name}({})", print_ast(arg)),
    }
}

/// Simplify one rendered expression; returns the input unchanged when it
/// does not parse.
pub(crate) fn simplify_expression(input: &str) -> String {
    let Some(tokens) = tokenize(input) else {
        return input.to_string();
    };
    let mut parser = Parser { tokens, pos: 0 };
    let Some(ast) = parser.expr() else {
        return input.to_string();
    };
    if parser.pos != parser.tokens.len() {
        return input.to_string();
    }
    print_ast(&simplify_ast(ast))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_sum_collapses() {
        assert_eq!(simplify_expression("(x0+x0)"), "2*x0");
        assert_eq!(simplify_expression("(x0*(x1+x1))"), "2*x0*x1");
    }

    #[test]
    fn test_cancellation() {
        assert_eq!(simplify_expression("(x0-x0)"), "0");
        assert_eq!(simplify_expression("(x1/x1)"), "1");
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(simplify_expression("(2+3)"), "5");
        assert_eq!(simplify_expression("(x0*1)"), "x0");
        assert_eq!(simplify_expression("(x0*0)"), "0");
    }

    #[test]
    fn test_function_calls_keep_structure() {
        assert_eq!(simplify_expression("sin((x0+x0))"), "sin(2*x0)");
        assert_eq!(simplify_expression("exp(x0+x1)"), "exp(x0+x1)");
    }

    #[test]
    fn test_precedence_in_output() {
        assert_eq!(simplify_expression("((x0+x1)*x2)"), "(x0+x1)*x2");
        assert_eq!(simplify_expression("((x0-x1)/(x2+x3))"), "(x0-x1)/(x2+x3)");
    }

    #[test]
    fn test_unparseable_input_is_returned_unchanged() {
        assert_eq!(simplify_expression("(x0@x1)"), "(x0@x1)");
        assert_eq!(simplify_expression("(x0"), "(x0");
    }
}
