//! Expression trees: a tagged sum type with at most seven children per
//! function node, plus the builtin table and the registry of user-defined
//! functions.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{Error, Result};

pub const MAX_ARITY: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncKind {
    // infix operators
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Comma,
    // builtin functions
    Abs,
    Acos,
    Asin,
    Atan,
    Atan2,
    Ceil,
    Cos,
    Cosh,
    E,
    Exp,
    Fac,
    Floor,
    Log,
    Log10,
    Max,
    Min,
    Ncr,
    Npr,
    Pi,
    Sin,
    Sinh,
    Sqrt,
    Tan,
    Tanh,
    /// User-defined function, keyed into the context's registry.
    Custom(usize),
}

/// Immutable expression tree node.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprNode {
    Const(f64),
    /// Index into the expression's bound variables.
    Var(usize),
    Func {
        kind: FuncKind,
        args: SmallVec<[Box<ExprNode>; 2]>,
    },
}

impl ExprNode {
    pub fn func(kind: FuncKind, args: Vec<ExprNode>) -> Self {
        Self::Func {
            kind,
            args: args.into_iter().map(Box::new).collect(),
        }
    }
}

pub(crate) struct Builtin {
    pub name: &'static str,
    pub kind: FuncKind,
    pub arity: usize,
}

const fn b(name: &'static str, kind: FuncKind, arity: usize) -> Builtin {
    Builtin { name, kind, arity }
}

/// Must stay in alphabetical order: lookups binary-search by name.
pub(crate) static BUILTINS: &[Builtin] = &[
    b("abs", FuncKind::Abs, 1),
    b("absolute", FuncKind::Abs, 1),
    b("acos", FuncKind::Acos, 1),
    b("arccos", FuncKind::Acos, 1),
    b("arcsin", FuncKind::Asin, 1),
    b("arctan", FuncKind::Atan, 1),
    b("arctan2", FuncKind::Atan2, 2),
    b("asin", FuncKind::Asin, 1),
    b("atan", FuncKind::Atan, 1),
    b("atan2", FuncKind::Atan2, 2),
    b("ceil", FuncKind::Ceil, 1),
    b("cos", FuncKind::Cos, 1),
    b("cosh", FuncKind::Cosh, 1),
    b("e", FuncKind::E, 0),
    b("exp", FuncKind::Exp, 1),
    b("fac", FuncKind::Fac, 1),
    b("floor", FuncKind::Floor, 1),
    b("log", FuncKind::Log, 1),
    b("log10", FuncKind::Log10, 1),
    b("max", FuncKind::Max, 2),
    b("min", FuncKind::Min, 2),
    b("ncr", FuncKind::Ncr, 2),
    b("negate", FuncKind::Neg, 1),
    b("negative", FuncKind::Neg, 1),
    b("npr", FuncKind::Npr, 2),
    b("pi", FuncKind::Pi, 0),
    b("pow", FuncKind::Pow, 2),
    b("power", FuncKind::Pow, 2),
    b("sin", FuncKind::Sin, 1),
    b("sinh", FuncKind::Sinh, 1),
    b("sqrt", FuncKind::Sqrt, 1),
    b("tan", FuncKind::Tan, 1),
    b("tanh", FuncKind::Tanh, 1),
];

pub(crate) fn find_builtin(name: &str) -> Option<&'static Builtin> {
    BUILTINS
        .binary_search_by(|probe| probe.name.cmp(name))
        .ok()
        .map(|i| &BUILTINS[i])
}

pub(crate) fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

type UdfFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

pub struct Udf {
    pub(crate) name: String,
    pub(crate) arity: usize,
    pub(crate) f: UdfFn,
}

/// User-defined expression functions, dispatched by integer id.
#[derive(Default)]
pub struct UdfRegistry {
    funcs: Vec<Udf>,
}

impl UdfRegistry {
    pub fn register<F>(&mut self, name: &str, arity: usize, f: F) -> Result<usize>
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        if !valid_identifier(name) {
            return Err(Error::invalid_argument(
                "function names match [a-z][a-z0-9_]*",
            ));
        }
        if arity > MAX_ARITY {
            return Err(Error::invalid_argument("function arity is at most 7"));
        }
        if self.lookup(name).is_some() {
            return Err(Error::invalid_argument("function name already registered"));
        }
        self.funcs.push(Udf {
            name: name.to_owned(),
            arity,
            f: Arc::new(f),
        });
        Ok(self.funcs.len() - 1)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<usize> {
        self.funcs.iter().position(|u| u.name == name)
    }

    pub(crate) fn get(&self, id: usize) -> Option<&Udf> {
        self.funcs.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_sorted() {
        for w in BUILTINS.windows(2) {
            assert!(w[0].name < w[1].name, "{} !< {}", w[0].name, w[1].name);
        }
    }

    #[test]
    fn builtin_lookup() {
        assert_eq!(find_builtin("atan2").unwrap().arity, 2);
        assert_eq!(find_builtin("pi").unwrap().arity, 0);
        assert_eq!(find_builtin("power").unwrap().kind, FuncKind::Pow);
        assert!(find_builtin("nope").is_none());
    }

    #[test]
    fn registry_checks() {
        let mut reg = UdfRegistry::default();
        let id = reg.register("clip01", 1, |a| a[0].clamp(0.0, 1.0)).unwrap();
        assert_eq!(reg.lookup("clip01"), Some(id));
        assert!(reg.register("clip01", 1, |a| a[0]).is_err());
        assert!(reg.register("Bad", 1, |a| a[0]).is_err());
        assert!(reg.register("too_many", 8, |a| a[0]).is_err());
    }
}
