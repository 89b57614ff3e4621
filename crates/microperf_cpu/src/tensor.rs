//! Host-memory tensors

use anyhow::Context;
use microperf::prelude::*;
use rand::Rng;

/// Scalar types a [`CpuTensor`] can hold. Kernels accumulate in f32.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const DTYPE: DType;
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f32(self) -> f32 {
        self
    }
    fn from_f32(v: f32) -> Self {
        v
    }
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.random_range(-1.0..1.0)
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        f16::from_f32(rng.random_range(-1.0..1.0))
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::Bf16;
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        bf16::from_f32(rng.random_range(-1.0..1.0))
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v as i32
    }
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.random_range(-64..64)
    }
}

impl Element for i8 {
    const DTYPE: DType = DType::I8;
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v as i8
    }
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.random_range(-8..8)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
    I32(Vec<i32>),
    I8(Vec<i8>),
}

/// Match one or more `TensorData` operands that share a dtype, binding their buffers.
/// Bails when the operands' dtypes differ.
#[macro_export]
macro_rules! with_data {
    (($($x:expr),+ $(,)?), |$($v:ident),+| $body:expr) => {{
        use $crate::tensor::TensorData;
        #[allow(unreachable_patterns)]
        let out = match ($($x,)+) {
            ($(TensorData::F32($v),)+) => $body,
            ($(TensorData::F16($v),)+) => $body,
            ($(TensorData::Bf16($v),)+) => $body,
            ($(TensorData::I32($v),)+) => $body,
            ($(TensorData::I8($v),)+) => $body,
            _ => ::anyhow::bail!("operand dtypes differ"),
        };
        out
    }};
}

fn alloc<T: Element>(n: usize, mut fill: impl FnMut() -> T) -> anyhow::Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(n).with_context(|| {
        format!(
            "host allocation of {} bytes failed",
            n.saturating_mul(std::mem::size_of::<T>())
        )
    })?;
    v.extend(std::iter::repeat_with(&mut fill).take(n));
    Ok(v)
}

impl TensorData {
    fn filled(dtype: DType, n: usize, random: bool) -> anyhow::Result<Self> {
        fn make<T: Element>(n: usize, random: bool) -> anyhow::Result<Vec<T>> {
            if random {
                let mut rng = rand::rng();
                alloc(n, || T::sample(&mut rng))
            } else {
                alloc(n, T::default)
            }
        }
        Ok(match dtype {
            DType::F32 => TensorData::F32(make(n, random)?),
            DType::F16 => TensorData::F16(make(n, random)?),
            DType::Bf16 => TensorData::Bf16(make(n, random)?),
            DType::I32 => TensorData::I32(make(n, random)?),
            DType::I8 => TensorData::I8(make(n, random)?),
        })
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F16(_) => DType::F16,
            TensorData::Bf16(_) => DType::Bf16,
            TensorData::I32(_) => DType::I32,
            TensorData::I8(_) => DType::I8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F16(v) => v.len(),
            TensorData::Bf16(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A contiguous row-major tensor in host memory
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl CpuTensor {
    pub fn zeros(shape: &[usize], dtype: DType) -> anyhow::Result<Self> {
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::filled(dtype, numel(shape), false)?,
        })
    }

    /// Uniformly random contents (small integers for integer dtypes)
    pub fn random(shape: &[usize], dtype: DType) -> anyhow::Result<Self> {
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::filled(dtype, numel(shape), true)?,
        })
    }

    pub fn from_f32(shape: &[usize], values: &[f32], dtype: DType) -> anyhow::Result<Self> {
        anyhow::ensure!(
            numel(shape) == values.len(),
            "{} values do not fill shape {shape:?}",
            values.len()
        );
        let mut t = Self::zeros(shape, dtype)?;
        t.assign_f32(values)?;
        Ok(t)
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype().sizeof()
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        fn conv<T: Element>(v: &[T]) -> Vec<f32> {
            v.iter().map(|x| x.to_f32()).collect()
        }
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::F16(v) => conv(v),
            TensorData::Bf16(v) => conv(v),
            TensorData::I32(v) => conv(v),
            TensorData::I8(v) => conv(v),
        }
    }

    /// Overwrite the contents, converting from f32
    pub fn assign_f32(&mut self, values: &[f32]) -> anyhow::Result<()> {
        anyhow::ensure!(
            values.len() == self.numel(),
            "cannot assign {} values to a tensor of {} elements",
            values.len(),
            self.numel()
        );
        fn conv<T: Element>(dst: &mut [T], src: &[f32]) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = T::from_f32(*s);
            }
        }
        match &mut self.data {
            TensorData::F32(v) => v.copy_from_slice(values),
            TensorData::F16(v) => conv(v, values),
            TensorData::Bf16(v) => conv(v, values),
            TensorData::I32(v) => conv(v, values),
            TensorData::I8(v) => conv(v, values),
        }
        Ok(())
    }

    /// Copy another tensor's contents into this one (same dtype and element count)
    pub fn copy_from(&mut self, src: &CpuTensor) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.numel() == src.numel(),
            "copy size mismatch: {} vs {}",
            self.numel(),
            src.numel()
        );
        with_data!((&mut self.data, &src.data), |dst, src| {
            dst.copy_from_slice(src)
        });
        Ok(())
    }
}
