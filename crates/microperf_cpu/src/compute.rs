//! Local compute kernels and their operator wrappers

use anyhow::{bail, ensure};
use microperf::prelude::*;

use crate::{
    tensor::{CpuTensor, Element, TensorData},
    with_data, CpuBackend, CpuDevice,
};

// ============================================================================
// Kernels
// ============================================================================

pub fn binary<T: Element>(a: &[T], b: &[T], out: &mut [T], f: impl Fn(f32, f32) -> f32) {
    for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
        *o = T::from_f32(f(x.to_f32(), y.to_f32()));
    }
}

pub fn unary<T: Element>(x: &[T], out: &mut [T], f: impl Fn(f32) -> f32) {
    for (o, v) in out.iter_mut().zip(x) {
        *o = T::from_f32(f(v.to_f32()));
    }
}

/// Row-wise softmax over the last dimension
pub fn softmax<T: Element>(x: &[T], out: &mut [T], cols: usize) {
    for (row, out_row) in x.chunks_exact(cols).zip(out.chunks_exact_mut(cols)) {
        let max = row
            .iter()
            .map(|v| v.to_f32())
            .fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for (o, v) in out_row.iter_mut().zip(row) {
            let e = (v.to_f32() - max).exp();
            sum += e;
            *o = T::from_f32(e);
        }
        for o in out_row.iter_mut() {
            *o = T::from_f32(o.to_f32() / sum);
        }
    }
}

/// Row-wise layer normalization over the last dimension, with affine weight and bias
pub fn layernorm<T: Element>(x: &[T], weight: &[T], bias: &[T], out: &mut [T], cols: usize) {
    const EPS: f32 = 1e-5;
    for (row, out_row) in x.chunks_exact(cols).zip(out.chunks_exact_mut(cols)) {
        let mean = row.iter().map(|v| v.to_f32()).sum::<f32>() / cols as f32;
        let var = row
            .iter()
            .map(|v| (v.to_f32() - mean).powi(2))
            .sum::<f32>()
            / cols as f32;
        let inv_std = 1.0 / (var + EPS).sqrt();
        for (((o, v), w), b) in out_row.iter_mut().zip(row).zip(weight).zip(bias) {
            *o = T::from_f32((v.to_f32() - mean) * inv_std * w.to_f32() + b.to_f32());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKind {
    Sum,
    Max,
}

/// Reduce each row of the last dimension to a single value
pub fn reduce<T: Element>(x: &[T], out: &mut [T], cols: usize, kind: ReduceKind) {
    for (row, o) in x.chunks_exact(cols).zip(out.iter_mut()) {
        let vals = row.iter().map(|v| v.to_f32());
        *o = T::from_f32(match kind {
            ReduceKind::Sum => vals.sum(),
            ReduceKind::Max => vals.fold(f32::NEG_INFINITY, f32::max),
        });
    }
}

/// C[m, n] = A[m, k] @ B[k, n], row-major, accumulating in f32
pub fn gemm<T: Element>(a: &[T], b: &[T], c: &mut [T], m: usize, k: usize, n: usize) {
    let mut acc = vec![0.0f32; n];
    for i in 0..m {
        acc.fill(0.0);
        for p in 0..k {
            let a_ip = a[i * k + p].to_f32();
            for (acc_j, b_pj) in acc.iter_mut().zip(&b[p * n..(p + 1) * n]) {
                *acc_j += a_ip * b_pj.to_f32();
            }
        }
        for (c_ij, v) in c[i * n..(i + 1) * n].iter_mut().zip(&acc) {
            *c_ij = T::from_f32(*v);
        }
    }
}

/// f32 GEMM through matrixmultiply's blocked kernels
pub fn sgemm(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
) -> anyhow::Result<()> {
    let fits = |len: usize, rows: usize, cols: usize| {
        rows.checked_mul(cols).is_some_and(|elems| len >= elems)
    };
    ensure!(
        fits(a.len(), m, k) && fits(b.len(), k, n) && fits(c.len(), m, n),
        "sgemm operands too small for [{m}, {k}] @ [{k}, {n}]"
    );
    // SAFETY: every operand was checked to hold its full row-major matrix
    unsafe {
        matrixmultiply::sgemm(
            m,
            k,
            n,
            1.0,
            a.as_ptr(),
            k as isize,
            1,
            b.as_ptr(),
            n as isize,
            1,
            0.0,
            c.as_mut_ptr(),
            n as isize,
            1,
        );
    }
    Ok(())
}

fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

// ============================================================================
// Shape helpers
// ============================================================================

fn expect_inputs(op: &str, shapes: &[Vec<usize>], n: usize) -> anyhow::Result<()> {
    ensure!(
        shapes.len() == n,
        "{op} expects {n} input shape(s), got {}",
        shapes.len()
    );
    ensure!(
        shapes.iter().all(|s| !s.is_empty()),
        "{op} input shapes must have at least one dimension"
    );
    Ok(())
}

/// Byte count of `n` elements, saturating so oversized shapes fail provisioning
fn bytes(n: usize, dtype: DType) -> u64 {
    (n as u64).saturating_mul(dtype.sizeof() as u64)
}

/// (rows, last dim) of a shape
fn rows_cols(shape: &[usize]) -> (usize, usize) {
    let cols = shape.last().copied().unwrap_or(1);
    (numel(&shape[..shape.len().saturating_sub(1)]), cols)
}

fn last_dim(op: &str, shape: &[usize]) -> anyhow::Result<usize> {
    match shape.last() {
        Some(&cols) if cols > 0 => Ok(cols),
        _ => bail!("{op} needs a non-empty last dimension, got {shape:?}"),
    }
}

// ============================================================================
// Elementwise ops
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryKind {
    fn name(&self) -> &'static str {
        match self {
            BinaryKind::Add => "add",
            BinaryKind::Sub => "sub",
            BinaryKind::Mul => "mul",
            BinaryKind::Div => "div",
        }
    }

    fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            BinaryKind::Add => a + b,
            BinaryKind::Sub => a - b,
            BinaryKind::Mul => a * b,
            BinaryKind::Div => a / b,
        }
    }
}

/// out = a (op) b over two same-shaped inputs
#[derive(Debug)]
pub struct BinaryOp(pub BinaryKind);

impl Operator<CpuBackend> for BinaryOp {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        expect_inputs(self.name(), shapes, 2)?;
        ensure!(
            shapes[0] == shapes[1],
            "{} inputs must share a shape: {:?} vs {:?}",
            self.name(),
            shapes[0],
            shapes[1]
        );
        let n = numel(&shapes[0]);
        Ok(ByteSizes::io(
            shapes[0][0],
            bytes(n, dtype).saturating_mul(2),
            bytes(n, dtype),
        ))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        Ok(vec![
            CpuTensor::random(&shapes[0], dtype)?,
            CpuTensor::random(&shapes[1], dtype)?,
            CpuTensor::zeros(&shapes[0], dtype)?,
        ])
    }

    fn run(&self, _backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let [a, b, out] = tensors else {
            bail!("{} expects 3 tensors", self.name());
        };
        let kind = self.0;
        with_data!((&a.data, &b.data, &mut out.data), |a, b, out| {
            binary(a, b, out, |x, y| kind.apply(x, y))
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Exp,
    Sin,
    Cos,
    Gelu,
    Silu,
}

impl UnaryKind {
    fn name(&self) -> &'static str {
        match self {
            UnaryKind::Exp => "exp",
            UnaryKind::Sin => "sin",
            UnaryKind::Cos => "cos",
            UnaryKind::Gelu => "gelu",
            UnaryKind::Silu => "silu",
        }
    }

    fn apply(&self, x: f32) -> f32 {
        match self {
            UnaryKind::Exp => x.exp(),
            UnaryKind::Sin => x.sin(),
            UnaryKind::Cos => x.cos(),
            UnaryKind::Gelu => gelu(x),
            UnaryKind::Silu => silu(x),
        }
    }
}

#[derive(Debug)]
pub struct UnaryOp(pub UnaryKind);

impl Operator<CpuBackend> for UnaryOp {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        expect_inputs(self.name(), shapes, 1)?;
        let n = numel(&shapes[0]);
        Ok(ByteSizes::io(shapes[0][0], bytes(n, dtype), bytes(n, dtype)))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        Ok(vec![
            CpuTensor::random(&shapes[0], dtype)?,
            CpuTensor::zeros(&shapes[0], dtype)?,
        ])
    }

    fn run(&self, _backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let [x, out] = tensors else {
            bail!("{} expects 2 tensors", self.name());
        };
        let kind = self.0;
        with_data!((&x.data, &mut out.data), |x, out| {
            unary(x, out, |v| kind.apply(v))
        });
        Ok(())
    }
}

// ============================================================================
// Row-wise ops
// ============================================================================

#[derive(Debug, Default)]
pub struct Softmax;

impl Operator<CpuBackend> for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        expect_inputs(self.name(), shapes, 1)?;
        last_dim(self.name(), &shapes[0])?;
        let n = numel(&shapes[0]);
        Ok(ByteSizes::io(shapes[0][0], bytes(n, dtype), bytes(n, dtype)))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        Ok(vec![
            CpuTensor::random(&shapes[0], dtype)?,
            CpuTensor::zeros(&shapes[0], dtype)?,
        ])
    }

    fn run(&self, _backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let [x, out] = tensors else {
            bail!("softmax expects 2 tensors");
        };
        let cols = last_dim(self.name(), &x.shape)?;
        with_data!((&x.data, &mut out.data), |x, out| softmax(x, out, cols));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LayerNorm;

impl Operator<CpuBackend> for LayerNorm {
    fn name(&self) -> &'static str {
        "layernorm"
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        expect_inputs(self.name(), shapes, 1)?;
        let cols = last_dim(self.name(), &shapes[0])?;
        let n = numel(&shapes[0]);
        Ok(ByteSizes::io(
            shapes[0][0],
            bytes(n.saturating_add(cols.saturating_mul(2)), dtype),
            bytes(n, dtype),
        ))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        let cols = last_dim(self.name(), &shapes[0])?;
        Ok(vec![
            CpuTensor::random(&shapes[0], dtype)?,
            CpuTensor::random(&[cols], dtype)?,
            CpuTensor::random(&[cols], dtype)?,
            CpuTensor::zeros(&shapes[0], dtype)?,
        ])
    }

    fn run(&self, _backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let [x, w, b, out] = tensors else {
            bail!("layernorm expects 4 tensors");
        };
        let cols = last_dim(self.name(), &x.shape)?;
        with_data!((&x.data, &w.data, &b.data, &mut out.data), |x, w, b, out| {
            layernorm(x, w, b, out, cols)
        });
        Ok(())
    }
}

#[derive(Debug)]
pub struct ReduceOp(pub ReduceKind);

impl Operator<CpuBackend> for ReduceOp {
    fn name(&self) -> &'static str {
        match self.0 {
            ReduceKind::Sum => "reduce_sum",
            ReduceKind::Max => "reduce_max",
        }
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        expect_inputs(self.name(), shapes, 1)?;
        last_dim(self.name(), &shapes[0])?;
        let (rows, cols) = rows_cols(&shapes[0]);
        Ok(ByteSizes::io(
            shapes[0][0],
            bytes(rows.saturating_mul(cols), dtype),
            bytes(rows, dtype),
        ))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        let out_shape = &shapes[0][..shapes[0].len() - 1];
        Ok(vec![
            CpuTensor::random(&shapes[0], dtype)?,
            CpuTensor::zeros(out_shape, dtype)?,
        ])
    }

    fn run(&self, _backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let [x, out] = tensors else {
            bail!("{} expects 2 tensors", self.name());
        };
        let cols = last_dim(self.name(), &x.shape)?;
        let kind = self.0;
        with_data!((&x.data, &mut out.data), |x, out| reduce(x, out, cols, kind));
        Ok(())
    }
}

// ============================================================================
// Matmul
// ============================================================================

/// [M, K] @ [K, N]
#[derive(Debug, Default)]
pub struct Gemm;

fn gemm_dims(op: &str, a: &[usize], b: &[usize], batched: bool) -> anyhow::Result<[usize; 4]> {
    let rank = if batched { 3 } else { 2 };
    ensure!(
        a.len() == rank && b.len() == rank,
        "{op} expects rank-{rank} inputs, got {a:?} and {b:?}"
    );
    let (batch, a, b) = if batched {
        ensure!(a[0] == b[0], "{op} batch sizes differ: {} vs {}", a[0], b[0]);
        (a[0], &a[1..], &b[1..])
    } else {
        (1, a, b)
    };
    ensure!(
        a[1] == b[0],
        "{op} inner dimensions differ: {} vs {}",
        a[1],
        b[0]
    );
    Ok([batch, a[0], a[1], b[1]])
}

fn run_gemm(
    a: &CpuTensor,
    b: &CpuTensor,
    c: &mut CpuTensor,
    [batch, m, k, n]: [usize; 4],
) -> anyhow::Result<()> {
    let (mk, kn, mn) = (m * k, k * n, m * n);
    if let (TensorData::F32(a), TensorData::F32(b), TensorData::F32(c)) =
        (&a.data, &b.data, &mut c.data)
    {
        for i in 0..batch {
            sgemm(
                &a[i * mk..(i + 1) * mk],
                &b[i * kn..(i + 1) * kn],
                &mut c[i * mn..(i + 1) * mn],
                m,
                k,
                n,
            )?;
        }
        return Ok(());
    }
    with_data!((&a.data, &b.data, &mut c.data), |a, b, c| {
        for i in 0..batch {
            gemm(
                &a[i * mk..(i + 1) * mk],
                &b[i * kn..(i + 1) * kn],
                &mut c[i * mn..(i + 1) * mn],
                m,
                k,
                n,
            );
        }
    });
    Ok(())
}

fn gemm_sizes(dims: [usize; 4], dtype: DType) -> ByteSizes {
    let [batch, m, k, n] = dims;
    ByteSizes::io(
        batch.saturating_mul(m),
        bytes(
            batch.saturating_mul(m.saturating_mul(k).saturating_add(k.saturating_mul(n))),
            dtype,
        ),
        bytes(batch.saturating_mul(m).saturating_mul(n), dtype),
    )
}

fn gemm_tensors(
    dims: [usize; 4],
    shapes: &[Vec<usize>],
    dtype: DType,
) -> anyhow::Result<Vec<CpuTensor>> {
    let [batch, m, _, n] = dims;
    let out_shape = if shapes[0].len() == 3 {
        vec![batch, m, n]
    } else {
        vec![m, n]
    };
    Ok(vec![
        CpuTensor::random(&shapes[0], dtype)?,
        CpuTensor::random(&shapes[1], dtype)?,
        CpuTensor::zeros(&out_shape, dtype)?,
    ])
}

impl Operator<CpuBackend> for Gemm {
    fn name(&self) -> &'static str {
        "gemm"
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        expect_inputs(self.name(), shapes, 2)?;
        let dims = gemm_dims(self.name(), &shapes[0], &shapes[1], false)?;
        Ok(gemm_sizes(dims, dtype))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        let dims = gemm_dims(self.name(), &shapes[0], &shapes[1], false)?;
        gemm_tensors(dims, shapes, dtype)
    }

    fn run(&self, _backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let [a, b, c] = tensors else {
            bail!("gemm expects 3 tensors");
        };
        let dims = gemm_dims(self.name(), &a.shape, &b.shape, false)?;
        run_gemm(a, b, c, dims)
    }
}

/// [B, M, K] @ [B, K, N]
#[derive(Debug, Default)]
pub struct BatchGemm;

impl Operator<CpuBackend> for BatchGemm {
    fn name(&self) -> &'static str {
        "batch_gemm"
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        expect_inputs(self.name(), shapes, 2)?;
        let dims = gemm_dims(self.name(), &shapes[0], &shapes[1], true)?;
        Ok(gemm_sizes(dims, dtype))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        let dims = gemm_dims(self.name(), &shapes[0], &shapes[1], true)?;
        gemm_tensors(dims, shapes, dtype)
    }

    fn run(&self, _backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let [a, b, c] = tensors else {
            bail!("batch_gemm expects 3 tensors");
        };
        let dims = gemm_dims(self.name(), &a.shape, &b.shape, true)?;
        run_gemm(a, b, c, dims)
    }
}
