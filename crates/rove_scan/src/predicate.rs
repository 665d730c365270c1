//! Compiled predicate expressions.
//!
//! Predicates arrive as an opaque tag-byte program and compile into an
//! expression tree. Metadata evaluation is three-valued: operators that
//! only need index metadata decide immediately, operators that need bin
//! data report `Unknown` and force a bin-level pass after the record is
//! opened.

use crate::record::Record;

pub const TAG_AND: u8 = 0x01;
pub const TAG_OR: u8 = 0x02;
pub const TAG_NOT: u8 = 0x03;
pub const TAG_LAST_UPDATE_AFTER: u8 = 0x10;
pub const TAG_GENERATION_GE: u8 = 0x11;
pub const TAG_BIN_INT_EQ: u8 = 0x20;
pub const TAG_BIN_STR_EQ: u8 = 0x21;
pub const TAG_BIN_EXISTS: u8 = 0x22;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriState {
    True,
    False,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("short predicate program")]
    Short,
    #[error("unknown predicate tag {0}")]
    UnknownTag(u8),
    #[error("trailing bytes in predicate program")]
    Trailing,
    #[error("bad predicate operand: {0}")]
    BadOperand(&'static str),
}

#[derive(Debug)]
enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    LastUpdateAfter(u64),
    GenerationGe(u32),
    BinIntEq(String, i64),
    BinStrEq(String, String),
    BinExists(String),
}

/// A compiled predicate, owned by the job and dropped with it.
#[derive(Debug)]
pub struct Predicate {
    root: Expr,
}

impl Predicate {
    pub fn compile(program: &[u8]) -> Result<Self, PredicateError> {
        let mut offset = 0;
        let root = parse_expr(program, &mut offset)?;
        if offset != program.len() {
            return Err(PredicateError::Trailing);
        }
        Ok(Self { root })
    }

    /// Metadata-only verdict. `Unknown` means bin data is required.
    pub fn matches_metadata(&self, r: &Record) -> TriState {
        eval_meta(&self.root, r)
    }

    /// Full verdict with bin data available.
    pub fn matches_bins(&self, r: &Record) -> bool {
        eval_bins(&self.root, r)
    }
}

fn parse_expr(data: &[u8], offset: &mut usize) -> Result<Expr, PredicateError> {
    let tag = take(data, offset, 1)?[0];
    match tag {
        TAG_AND | TAG_OR => {
            let n = take(data, offset, 1)?[0] as usize;
            if n == 0 {
                return Err(PredicateError::BadOperand("empty conjunction"));
            }
            let mut children = Vec::with_capacity(n);
            for _ in 0..n {
                children.push(parse_expr(data, offset)?);
            }
            Ok(if tag == TAG_AND {
                Expr::And(children)
            } else {
                Expr::Or(children)
            })
        }
        TAG_NOT => Ok(Expr::Not(Box::new(parse_expr(data, offset)?))),
        TAG_LAST_UPDATE_AFTER => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(take(data, offset, 8)?);
            Ok(Expr::LastUpdateAfter(u64::from_be_bytes(buf)))
        }
        TAG_GENERATION_GE => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(take(data, offset, 4)?);
            Ok(Expr::GenerationGe(u32::from_be_bytes(buf)))
        }
        TAG_BIN_INT_EQ => {
            let name = take_name(data, offset)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(take(data, offset, 8)?);
            Ok(Expr::BinIntEq(name, i64::from_be_bytes(buf)))
        }
        TAG_BIN_STR_EQ => {
            let name = take_name(data, offset)?;
            let mut buf = [0u8; 2];
            buf.copy_from_slice(take(data, offset, 2)?);
            let len = u16::from_be_bytes(buf) as usize;
            let value = take(data, offset, len)?;
            let value = String::from_utf8(value.to_vec())
                .map_err(|_| PredicateError::BadOperand("string value not utf-8"))?;
            Ok(Expr::BinStrEq(name, value))
        }
        TAG_BIN_EXISTS => Ok(Expr::BinExists(take_name(data, offset)?)),
        other => Err(PredicateError::UnknownTag(other)),
    }
}

fn take<'a>(data: &'a [u8], offset: &mut usize, n: usize) -> Result<&'a [u8], PredicateError> {
    if *offset + n > data.len() {
        return Err(PredicateError::Short);
    }
    let out = &data[*offset..*offset + n];
    *offset += n;
    Ok(out)
}

fn take_name(data: &[u8], offset: &mut usize) -> Result<String, PredicateError> {
    let len = take(data, offset, 1)?[0] as usize;
    let name = take(data, offset, len)?;
    String::from_utf8(name.to_vec()).map_err(|_| PredicateError::BadOperand("bin name not utf-8"))
}

fn eval_meta(expr: &Expr, r: &Record) -> TriState {
    match expr {
        Expr::And(children) => {
            let mut unknown = false;
            for child in children {
                match eval_meta(child, r) {
                    TriState::False => return TriState::False,
                    TriState::Unknown => unknown = true,
                    TriState::True => {}
                }
            }
            if unknown {
                TriState::Unknown
            } else {
                TriState::True
            }
        }
        Expr::Or(children) => {
            let mut unknown = false;
            for child in children {
                match eval_meta(child, r) {
                    TriState::True => return TriState::True,
                    TriState::Unknown => unknown = true,
                    TriState::False => {}
                }
            }
            if unknown {
                TriState::Unknown
            } else {
                TriState::False
            }
        }
        Expr::Not(child) => match eval_meta(child, r) {
            TriState::True => TriState::False,
            TriState::False => TriState::True,
            TriState::Unknown => TriState::Unknown,
        },
        Expr::LastUpdateAfter(v) => bool_state(r.last_update_ms > *v),
        Expr::GenerationGe(v) => bool_state(r.generation >= *v),
        Expr::BinIntEq(..) | Expr::BinStrEq(..) | Expr::BinExists(..) => TriState::Unknown,
    }
}

fn eval_bins(expr: &Expr, r: &Record) -> bool {
    match expr {
        Expr::And(children) => children.iter().all(|c| eval_bins(c, r)),
        Expr::Or(children) => children.iter().any(|c| eval_bins(c, r)),
        Expr::Not(child) => !eval_bins(child, r),
        Expr::LastUpdateAfter(v) => r.last_update_ms > *v,
        Expr::GenerationGe(v) => r.generation >= *v,
        Expr::BinIntEq(name, v) => matches!(
            r.bin(name).map(|b| &b.value),
            Some(crate::record::Particle::Int(actual)) if actual == v
        ),
        Expr::BinStrEq(name, v) => matches!(
            r.bin(name).map(|b| &b.value),
            Some(crate::record::Particle::Str(actual)) if actual == v
        ),
        Expr::BinExists(name) => r.bin(name).is_some(),
    }
}

fn bool_state(v: bool) -> TriState {
    if v {
        TriState::True
    } else {
        TriState::False
    }
}

/// Program builders, used by clients and tests.
pub mod build {
    use super::*;

    pub fn and(children: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![TAG_AND, children.len() as u8];
        for child in children {
            out.extend_from_slice(child);
        }
        out
    }

    pub fn or(children: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![TAG_OR, children.len() as u8];
        for child in children {
            out.extend_from_slice(child);
        }
        out
    }

    pub fn not(child: Vec<u8>) -> Vec<u8> {
        let mut out = vec![TAG_NOT];
        out.extend_from_slice(&child);
        out
    }

    pub fn last_update_after(ms: u64) -> Vec<u8> {
        let mut out = vec![TAG_LAST_UPDATE_AFTER];
        out.extend_from_slice(&ms.to_be_bytes());
        out
    }

    pub fn generation_ge(generation: u32) -> Vec<u8> {
        let mut out = vec![TAG_GENERATION_GE];
        out.extend_from_slice(&generation.to_be_bytes());
        out
    }

    pub fn bin_int_eq(name: &str, value: i64) -> Vec<u8> {
        let mut out = vec![TAG_BIN_INT_EQ, name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&value.to_be_bytes());
        out
    }

    pub fn bin_str_eq(name: &str, value: &str) -> Vec<u8> {
        let mut out = vec![TAG_BIN_STR_EQ, name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    pub fn bin_exists(name: &str) -> Vec<u8> {
        let mut out = vec![TAG_BIN_EXISTS, name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out
    }
}
