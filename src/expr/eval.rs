//! Expression evaluation over chunked operands.
//!
//! Evaluation is lifted to flat 1-D panels: the chunk-wise strategy
//! decompresses whole chunks of every operand into temporaries, the
//! block-wise strategy decodes one codec block per operand at a time and
//! assembles output chunks in a staging buffer. Both strategies run the
//! same per-element kernels, so their outputs are bit-identical.

use std::cell::RefCell;

use rayon::prelude::*;
use smallvec::SmallVec;

use super::ast::{ExprNode, FuncKind, UdfRegistry, MAX_ARITY};
use super::parser;
use crate::codec::{self, CodecParams, Storage};
use crate::container::{Element, NdRead};
use crate::shape::{DType, DtShape};
use crate::{Container, Context, Error, EvalStrategy, Result};

enum Operand<'a> {
    Array(&'a Container),
    Scalar(f64),
}

struct BoundVar<'a> {
    name: String,
    op: Operand<'a>,
}

/// A compiled arithmetic expression with named operands.
///
/// Bind operands first, then [Expression::compile], then
/// [Expression::eval]; recompiling replaces the tree and the handle stays
/// reusable after rebinding.
pub struct Expression<'a> {
    ctx: &'a Context,
    vars: Vec<BoundVar<'a>>,
    tree: Option<ExprNode>,
}

impl<'a> Expression<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            vars: Vec::default(),
            tree: None,
        }
    }

    /// Bind an array operand.
    pub fn bind(&mut self, name: &str, c: &'a Container) -> Result<()> {
        self.bind_operand(name, Operand::Array(c))
    }

    pub fn bind_scalar(&mut self, name: &str, value: f64) -> Result<()> {
        self.bind_operand(name, Operand::Scalar(value))
    }

    fn bind_operand(&mut self, name: &str, op: Operand<'a>) -> Result<()> {
        if !super::ast::valid_identifier(name) {
            return Err(Error::invalid_argument(
                "variable names match [a-z][a-z0-9_]*",
            ));
        }
        if self.vars.iter().any(|v| v.name == name) {
            return Err(Error::invalid_argument("variable already bound"));
        }
        self.vars.push(BoundVar {
            name: name.to_owned(),
            op,
        });
        Ok(())
    }

    /// Parse `src` against the bound variable names. Replaces any previous
    /// tree.
    pub fn compile(&mut self, src: &str) -> Result<()> {
        let names: Vec<String> = self.vars.iter().map(|v| v.name.clone()).collect();
        self.tree = Some(parser::parse(src, &names, self.ctx.udfs())?);
        Ok(())
    }

    /// Evaluate into a fresh in-memory container.
    pub fn eval(&self) -> Result<Container> {
        self.eval_into_storage(&Storage::InMemory)
    }

    pub fn eval_into_storage(&self, storage: &Storage) -> Result<Container> {
        let tree = self.tree.as_ref().ok_or(Error::NotCompiled)?;
        let template = self.template()?;
        match template.dtype() {
            DType::F64 => self.eval_typed::<f64>(tree, template, storage),
            DType::F32 => self.eval_typed::<f32>(tree, template, storage),
        }
    }

    /// All array operands must agree on the full shape record; scalars
    /// broadcast and adopt the containers' dtype.
    fn template(&self) -> Result<DtShape> {
        let mut template: Option<&DtShape> = None;
        for v in &self.vars {
            let Operand::Array(c) = &v.op else {
                continue;
            };
            if !c.is_complete() {
                return Err(Error::invalid_argument(
                    "operand container is not fully written",
                ));
            }
            match template {
                None => template = Some(c.dtshape()),
                Some(t) if t == c.dtshape() => {}
                Some(_) => {
                    return Err(Error::invalid_argument(
                        "operand containers must share shape, chunking and dtype",
                    ))
                }
            }
        }
        template
            .cloned()
            .ok_or_else(|| Error::invalid_argument("expression binds no array operand"))
    }

    fn eval_typed<T: Element>(
        &self,
        tree: &ExprNode,
        template: DtShape,
        storage: &Storage,
    ) -> Result<Container> {
        let mut out = Container::empty(self.ctx, template.clone(), storage)?;
        let item_size = template.item_size();
        let chunk_items = template.chunk_items();
        let n_chunks = template.n_chunks();
        let udfs = self.ctx.udfs();

        // scalar value per variable slot; None marks an array operand
        let scalars: Vec<Option<T>> = self
            .vars
            .iter()
            .map(|v| match v.op {
                Operand::Array(_) => None,
                Operand::Scalar(s) => Some(T::from_f64(s)),
            })
            .collect();
        let first = self
            .vars
            .iter()
            .find_map(|v| match &v.op {
                Operand::Array(c) => Some(*c),
                Operand::Scalar(_) => None,
            })
            .expect("template ensured an array operand");

        match self.ctx.config().eval_strategy {
            EvalStrategy::Chunk => {
                let mut bufs: Vec<Option<Vec<T>>> = scalars
                    .iter()
                    .map(|s| match s {
                        None => Some(vec![T::zero(); chunk_items]),
                        Some(_) => None,
                    })
                    .collect();
                let pool = TempPool::default();
                for nchunk in 0..n_chunks {
                    let valid = first.sc().chunk_raw_len(nchunk)? / item_size;
                    for (v, buf) in self.vars.iter().zip(bufs.iter_mut()) {
                        if let (Operand::Array(c), Some(buf)) = (&v.op, buf) {
                            c.sc()
                                .decompress_chunk(nchunk, bytemuck::cast_slice_mut(buf.as_mut_slice()))?;
                        }
                    }
                    let panels: Vec<VarPanel<'_, T>> = scalars
                        .iter()
                        .zip(bufs.iter())
                        .map(|(s, buf)| match (s, buf) {
                            (Some(s), _) => VarPanel::Scalar(*s),
                            (None, Some(buf)) => VarPanel::Slice(&buf[..valid]),
                            (None, None) => unreachable!("array operand has a buffer"),
                        })
                        .collect();
                    let ev = Evaluator {
                        vars: &panels,
                        udfs,
                        len: valid,
                        pool: &pool,
                    };
                    let result = ev.eval_node(tree);
                    let bytes = ev.panel_bytes(&result);
                    out.sc_mut().append_raw(&bytes[..valid * item_size])?;
                    ev.release(result);
                }
            }
            EvalStrategy::Block => {
                let out_params = out.sc().params().clone();
                let panel_items = out_params.block_nbytes / item_size;
                // compressed frames plus decode parameters, per array operand
                let mut sources: Vec<Option<(CodecParams, bytes::Bytes)>> =
                    vec![None; self.vars.len()];
                for nchunk in 0..n_chunks {
                    let valid = first.sc().chunk_raw_len(nchunk)? / item_size;
                    for (nv, v) in self.vars.iter().enumerate() {
                        if let Operand::Array(c) = &v.op {
                            sources[nv] =
                                Some((c.sc().params().clone(), c.sc().chunk_bytes(nchunk)?));
                        }
                    }
                    let mut staging: Vec<T> = vec![T::zero(); valid];
                    let n_blocks = (valid + panel_items - 1) / panel_items;
                    let sources_ref = &sources;
                    let scalars_ref = &scalars;
                    let run_block = move |nblock: usize, out_slice: &mut [T]| -> Result<()> {
                        let offset = nblock * panel_items;
                        let len = out_slice.len();
                        let mut blocks: Vec<Option<Vec<T>>> =
                            Vec::with_capacity(sources_ref.len());
                        for source in sources_ref {
                            blocks.push(match source {
                                Some((params, frame)) => {
                                    let mut buf = vec![T::zero(); len];
                                    codec::frame_items_into(
                                        params,
                                        frame,
                                        offset,
                                        len,
                                        bytemuck::cast_slice_mut(buf.as_mut_slice()),
                                    )?;
                                    Some(buf)
                                }
                                None => None,
                            });
                        }
                        let panels: Vec<VarPanel<'_, T>> = scalars_ref
                            .iter()
                            .zip(blocks.iter())
                            .map(|(s, buf)| match (s, buf) {
                                (Some(s), _) => VarPanel::Scalar(*s),
                                (None, Some(buf)) => VarPanel::Slice(buf),
                                (None, None) => unreachable!("array operand has a block"),
                            })
                            .collect();
                        let pool = TempPool::default();
                        let ev = Evaluator {
                            vars: &panels,
                            udfs,
                            len,
                            pool: &pool,
                        };
                        let result = ev.eval_node(tree);
                        match &result {
                            Panel::Scalar(s) => out_slice.fill(*s),
                            Panel::Slice(s) => out_slice.copy_from_slice(&s[..len]),
                            Panel::Owned(v) => out_slice.copy_from_slice(&v[..len]),
                        }
                        ev.release(result);
                        Ok(())
                    };
                    if self.ctx.parallel() && n_blocks > 1 {
                        self.ctx.install(|| {
                            staging
                                .par_chunks_mut(panel_items)
                                .enumerate()
                                .try_for_each(|(nblock, slice)| run_block(nblock, slice))
                        })?;
                    } else {
                        for (nblock, slice) in staging.chunks_mut(panel_items).enumerate() {
                            run_block(nblock, slice)?;
                        }
                    }
                    let frame = codec::compress_frame(
                        &out_params,
                        valid * item_size,
                        &codec::SliceProducer::new(
                            bytemuck::cast_slice(&staging),
                            out_params.block_nbytes,
                        ),
                        false,
                    )?;
                    out.sc_mut().append_chunk(frame)?;
                }
            }
        }
        out.flush()?;
        Ok(out)
    }
}

/// Operand panel for one chunk or block, lifted to flat 1-D.
enum VarPanel<'p, T> {
    Scalar(T),
    Slice(&'p [T]),
}

enum Panel<'p, T> {
    Scalar(T),
    Slice(&'p [T]),
    Owned(Vec<T>),
}

/// Recycles per-chunk temporaries; the arena is reset by reuse rather than
/// by scope exit.
struct TempPool<T> {
    free: RefCell<Vec<Vec<T>>>,
}

impl<T> Default for TempPool<T> {
    fn default() -> Self {
        Self {
            free: RefCell::new(Vec::default()),
        }
    }
}

struct Evaluator<'e, T> {
    vars: &'e [VarPanel<'e, T>],
    udfs: &'e UdfRegistry,
    len: usize,
    pool: &'e TempPool<T>,
}

impl<'e, T: Element> Evaluator<'e, T> {
    fn alloc(&self) -> Vec<T> {
        let mut v = self
            .pool
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.len));
        v.clear();
        v
    }

    fn release(&self, p: Panel<'e, T>) {
        if let Panel::Owned(v) = p {
            self.pool.free.borrow_mut().push(v);
        }
    }

    /// Copy a panel into an owned temporary (no-op for owned panels).
    fn own(&self, p: Panel<'e, T>) -> Vec<T> {
        match p {
            Panel::Owned(v) => v,
            Panel::Slice(s) => {
                let mut v = self.alloc();
                v.extend_from_slice(&s[..self.len]);
                v
            }
            Panel::Scalar(x) => {
                let mut v = self.alloc();
                v.resize(self.len, x);
                v
            }
        }
    }

    fn panel_bytes<'p>(&self, p: &'p Panel<'e, T>) -> std::borrow::Cow<'p, [u8]> {
        match p {
            Panel::Scalar(x) => {
                std::borrow::Cow::Owned(bytemuck::cast_slice(&vec![*x; self.len]).to_vec())
            }
            Panel::Slice(s) => std::borrow::Cow::Borrowed(bytemuck::cast_slice(&s[..self.len])),
            Panel::Owned(v) => std::borrow::Cow::Borrowed(bytemuck::cast_slice(&v[..self.len])),
        }
    }

    fn eval_node(&self, node: &ExprNode) -> Panel<'e, T> {
        match node {
            ExprNode::Const(v) => Panel::Scalar(T::from_f64(*v)),
            ExprNode::Var(idx) => match &self.vars[*idx] {
                VarPanel::Scalar(x) => Panel::Scalar(*x),
                VarPanel::Slice(s) => Panel::Slice(*s),
            },
            ExprNode::Func { kind, args } => match args.len() {
                0 => Panel::Scalar(T::from_f64(nullary(*kind))),
                1 => {
                    let x = self.eval_node(&args[0]);
                    self.unary(*kind, x)
                }
                2 if !matches!(kind, FuncKind::Custom(_)) => {
                    let l = self.eval_node(&args[0]);
                    let r = self.eval_node(&args[1]);
                    self.binary(*kind, l, r)
                }
                _ => self.call(*kind, args),
            },
        }
    }

    fn unary(&self, kind: FuncKind, x: Panel<'e, T>) -> Panel<'e, T> {
        if let FuncKind::Custom(_) = kind {
            let args: SmallVec<[Panel<'e, T>; MAX_ARITY]> = SmallVec::from_iter([x]);
            return self.apply_custom(kind, args);
        }
        let f = fn1::<T>(kind);
        match x {
            Panel::Scalar(v) => Panel::Scalar(f(v)),
            other => {
                let mut out = self.own(other);
                for v in out.iter_mut() {
                    *v = f(*v);
                }
                Panel::Owned(out)
            }
        }
    }

    fn binary(&self, kind: FuncKind, l: Panel<'e, T>, r: Panel<'e, T>) -> Panel<'e, T> {
        if kind == FuncKind::Comma {
            self.release(l);
            return r;
        }
        let f = fn2::<T>(kind);
        match (l, r) {
            (Panel::Scalar(a), Panel::Scalar(b)) => Panel::Scalar(f(a, b)),
            (Panel::Scalar(a), r) => {
                let mut out = self.own(r);
                for v in out.iter_mut() {
                    *v = f(a, *v);
                }
                Panel::Owned(out)
            }
            (l, Panel::Scalar(b)) => {
                let mut out = self.own(l);
                for v in out.iter_mut() {
                    *v = f(*v, b);
                }
                Panel::Owned(out)
            }
            (Panel::Owned(mut lo), r) => {
                let rs = match &r {
                    Panel::Slice(s) => &s[..self.len],
                    Panel::Owned(v) => &v[..self.len],
                    Panel::Scalar(_) => unreachable!("handled above"),
                };
                for (a, b) in lo.iter_mut().zip(rs.iter()) {
                    *a = f(*a, *b);
                }
                self.release(r);
                Panel::Owned(lo)
            }
            (Panel::Slice(ls), Panel::Owned(mut ro)) => {
                for (b, a) in ro.iter_mut().zip(ls.iter()) {
                    *b = f(*a, *b);
                }
                Panel::Owned(ro)
            }
            (Panel::Slice(ls), Panel::Slice(rs)) => {
                let mut out = self.alloc();
                out.extend(
                    ls[..self.len]
                        .iter()
                        .zip(rs[..self.len].iter())
                        .map(|(a, b)| f(*a, *b)),
                );
                Panel::Owned(out)
            }
        }
    }

    /// Custom functions and anything above arity 2: evaluate children, then
    /// apply element-wise through f64.
    fn call(&self, kind: FuncKind, args: &SmallVec<[Box<ExprNode>; 2]>) -> Panel<'e, T> {
        let panels: SmallVec<[Panel<'e, T>; MAX_ARITY]> =
            args.iter().map(|a| self.eval_node(a)).collect();
        self.apply_custom(kind, panels)
    }

    fn apply_custom(
        &self,
        kind: FuncKind,
        panels: SmallVec<[Panel<'e, T>; MAX_ARITY]>,
    ) -> Panel<'e, T> {
        let FuncKind::Custom(id) = kind else {
            unreachable!("only custom functions take this path");
        };
        let udf = self.udfs.get(id).expect("compiled against this registry");
        let f = &udf.f;
        let all_scalar = panels.iter().all(|p| matches!(p, Panel::Scalar(_)));
        let mut argv = [0f64; MAX_ARITY];
        if all_scalar {
            for (slot, p) in argv.iter_mut().zip(panels.iter()) {
                if let Panel::Scalar(v) = p {
                    *slot = (*v).to_f64();
                }
            }
            return Panel::Scalar(T::from_f64(f(&argv[..panels.len()])));
        }
        let mut out = self.alloc();
        for i in 0..self.len {
            for (slot, p) in argv.iter_mut().zip(panels.iter()) {
                *slot = match p {
                    Panel::Scalar(v) => (*v).to_f64(),
                    Panel::Slice(s) => s[i].to_f64(),
                    Panel::Owned(v) => v[i].to_f64(),
                };
            }
            out.push(T::from_f64(f(&argv[..panels.len()])));
        }
        for p in panels {
            self.release(p);
        }
        Panel::Owned(out)
    }
}

fn nullary(kind: FuncKind) -> f64 {
    match kind {
        FuncKind::Pi => std::f64::consts::PI,
        FuncKind::E => std::f64::consts::E,
        _ => f64::NAN,
    }
}

fn op_abs<T: Element>(a: T) -> T {
    a.abs()
}
fn op_acos<T: Element>(a: T) -> T {
    a.acos()
}
fn op_asin<T: Element>(a: T) -> T {
    a.asin()
}
fn op_atan<T: Element>(a: T) -> T {
    a.atan()
}
fn op_ceil<T: Element>(a: T) -> T {
    a.ceil()
}
fn op_cos<T: Element>(a: T) -> T {
    a.cos()
}
fn op_cosh<T: Element>(a: T) -> T {
    a.cosh()
}
fn op_exp<T: Element>(a: T) -> T {
    a.exp()
}
fn op_fac<T: Element>(a: T) -> T {
    T::from_f64(fac64(a.to_f64()))
}
fn op_floor<T: Element>(a: T) -> T {
    a.floor()
}
fn op_ln<T: Element>(a: T) -> T {
    a.ln()
}
fn op_log10<T: Element>(a: T) -> T {
    a.log10()
}
fn op_neg<T: Element>(a: T) -> T {
    -a
}
fn op_sin<T: Element>(a: T) -> T {
    a.sin()
}
fn op_sinh<T: Element>(a: T) -> T {
    a.sinh()
}
fn op_sqrt<T: Element>(a: T) -> T {
    a.sqrt()
}
fn op_tan<T: Element>(a: T) -> T {
    a.tan()
}
fn op_tanh<T: Element>(a: T) -> T {
    a.tanh()
}
fn op_nan1<T: Element>(_a: T) -> T {
    T::nan()
}

fn fn1<T: Element>(kind: FuncKind) -> fn(T) -> T {
    match kind {
        FuncKind::Abs => op_abs::<T>,
        FuncKind::Acos => op_acos::<T>,
        FuncKind::Asin => op_asin::<T>,
        FuncKind::Atan => op_atan::<T>,
        FuncKind::Ceil => op_ceil::<T>,
        FuncKind::Cos => op_cos::<T>,
        FuncKind::Cosh => op_cosh::<T>,
        FuncKind::Exp => op_exp::<T>,
        FuncKind::Fac => op_fac::<T>,
        FuncKind::Floor => op_floor::<T>,
        FuncKind::Log => op_ln::<T>,
        FuncKind::Log10 => op_log10::<T>,
        FuncKind::Neg => op_neg::<T>,
        FuncKind::Sin => op_sin::<T>,
        FuncKind::Sinh => op_sinh::<T>,
        FuncKind::Sqrt => op_sqrt::<T>,
        FuncKind::Tan => op_tan::<T>,
        FuncKind::Tanh => op_tanh::<T>,
        _ => op_nan1::<T>,
    }
}

fn op_add<T: Element>(a: T, b: T) -> T {
    a + b
}
fn op_sub<T: Element>(a: T, b: T) -> T {
    a - b
}
fn op_mul<T: Element>(a: T, b: T) -> T {
    a * b
}
fn op_div<T: Element>(a: T, b: T) -> T {
    a / b
}
fn op_mod<T: Element>(a: T, b: T) -> T {
    a % b
}
fn op_pow<T: Element>(a: T, b: T) -> T {
    a.powf(b)
}
fn op_atan2<T: Element>(a: T, b: T) -> T {
    a.atan2(b)
}
fn op_max<T: Element>(a: T, b: T) -> T {
    a.max(b)
}
fn op_min<T: Element>(a: T, b: T) -> T {
    a.min(b)
}
fn op_ncr<T: Element>(a: T, b: T) -> T {
    T::from_f64(ncr64(a.to_f64(), b.to_f64()))
}
fn op_npr<T: Element>(a: T, b: T) -> T {
    T::from_f64(ncr64(a.to_f64(), b.to_f64()) * fac64(b.to_f64()))
}
fn op_nan2<T: Element>(_a: T, _b: T) -> T {
    T::nan()
}

fn fn2<T: Element>(kind: FuncKind) -> fn(T, T) -> T {
    match kind {
        FuncKind::Add => op_add::<T>,
        FuncKind::Sub => op_sub::<T>,
        FuncKind::Mul => op_mul::<T>,
        FuncKind::Div => op_div::<T>,
        FuncKind::Mod => op_mod::<T>,
        FuncKind::Pow => op_pow::<T>,
        FuncKind::Atan2 => op_atan2::<T>,
        FuncKind::Max => op_max::<T>,
        FuncKind::Min => op_min::<T>,
        FuncKind::Ncr => op_ncr::<T>,
        FuncKind::Npr => op_npr::<T>,
        _ => op_nan2::<T>,
    }
}

fn fac64(a: f64) -> f64 {
    if a < 0.0 {
        return f64::NAN;
    }
    if a > u32::MAX as f64 {
        return f64::INFINITY;
    }
    let ua = a as u64;
    let mut result: u64 = 1;
    for i in 1..=ua {
        if i > u64::MAX / result {
            return f64::INFINITY;
        }
        result *= i;
    }
    result as f64
}

fn ncr64(n: f64, r: f64) -> f64 {
    if n < 0.0 || r < 0.0 || n < r {
        return f64::NAN;
    }
    if n > u32::MAX as f64 || r > u32::MAX as f64 {
        return f64::INFINITY;
    }
    let un = n as u64;
    let mut ur = r as u64;
    if ur > un / 2 {
        ur = un - ur;
    }
    let mut result: u64 = 1;
    for i in 1..=ur {
        if result > u64::MAX / (un - ur + i) {
            return f64::INFINITY;
        }
        result *= un - ur + i;
        result /= i;
    }
    result as f64
}
