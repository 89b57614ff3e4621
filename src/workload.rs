//! Workload descriptors and the JSON files they are loaded from.

use std::path::Path;

use anyhow::{ensure, Context};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::op::DType;

/// One operator to benchmark over a matrix of shapes and dtypes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub operator: String,
    /// Upper bound on timed calls (and on pooled tensor-sets)
    pub iterations: usize,
    /// Each entry is the full list of input shapes for one call
    pub input_shape_groups: Vec<Vec<Vec<usize>>>,
    pub dtypes: Vec<DType>,
}

/// A single (shapes, dtype) point of a workload
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadCase {
    pub input_shapes: Vec<Vec<usize>>,
    pub dtype: DType,
}

impl Workload {
    pub fn new(operator: impl ToString, iterations: usize) -> Self {
        Self {
            operator: operator.to_string(),
            iterations,
            input_shape_groups: vec![],
            dtypes: vec![],
        }
    }

    pub fn with_shapes(mut self, shapes: Vec<Vec<usize>>) -> Self {
        self.input_shape_groups.push(shapes);
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtypes.push(dtype);
        self
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workload {}", path.display()))?;
        let workload: Self = serde_json::from_str(&json)
            .with_context(|| format!("invalid workload {}", path.display()))?;
        workload.validate()?;
        Ok(workload)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.operator.is_empty(), "workload has no operator");
        ensure!(
            self.iterations > 0,
            "workload `{}` must request at least one iteration",
            self.operator
        );
        ensure!(
            !self.input_shape_groups.is_empty(),
            "workload `{}` has no input shapes",
            self.operator
        );
        ensure!(
            !self.dtypes.is_empty(),
            "workload `{}` has no dtypes",
            self.operator
        );
        Ok(())
    }

    /// Every (shapes, dtype) combination, shapes-major
    pub fn cases(&self) -> Vec<WorkloadCase> {
        self.input_shape_groups
            .iter()
            .cartesian_product(self.dtypes.iter())
            .map(|(shapes, dtype)| WorkloadCase {
                input_shapes: shapes.clone(),
                dtype: *dtype,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_workload_file_format() {
        let workload: Workload = serde_json::from_str(
            r#"{
                "operator": "gemm",
                "iterations": 100,
                "input_shape_groups": [[[16, 32], [32, 8]], [[64, 64], [64, 64]]],
                "dtypes": ["float32", "bfloat16"]
            }"#,
        )
        .unwrap();
        assert!(workload.validate().is_ok());
        let cases = workload.cases();
        assert_eq!(cases.len(), 4);
        assert_eq!(cases[0].input_shapes, vec![vec![16, 32], vec![32, 8]]);
        assert_eq!(cases[0].dtype, DType::F32);
        assert_eq!(cases[1].dtype, DType::Bf16);
        assert_eq!(cases[3].input_shapes, vec![vec![64, 64], vec![64, 64]]);
    }

    #[test]
    fn rejects_unknown_dtype() {
        let res: Result<Workload, _> = serde_json::from_str(
            r#"{"operator": "add", "iterations": 1, "input_shape_groups": [[[4]]], "dtypes": ["complex"]}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn rejects_empty_workloads() {
        assert!(Workload::new("add", 10).validate().is_err());
        assert!(Workload::new("add", 0)
            .with_shapes(vec![vec![4]])
            .with_dtype(DType::F32)
            .validate()
            .is_err());
        assert!(Workload::new("add", 10)
            .with_shapes(vec![vec![4], vec![4]])
            .with_dtype(DType::F32)
            .validate()
            .is_ok());
    }
}
