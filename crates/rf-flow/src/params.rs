//! Named parameter maps
//!
//! Every learned tensor of a stack is addressed by its layer path, e.g.
//! `steps.2.mix.weight` or `steps.0.coupling.net.blocks.3.dilated.bias`.
//! The map is the persisted form of a model and the seam through which an
//! external optimizer writes updated values back.

use std::collections::BTreeMap;

use ndarray::{Array, Array1, Array2, Array3, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

use crate::conv::Conv1d;
use crate::error::{FlowError, FlowResult};
use crate::stack::FlowStack;

/// Dense row-major tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ParamTensor {
    pub fn from_array<D: Dimension>(array: &Array<f32, D>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn to_dyn(&self, name: &str) -> FlowResult<Array<f32, IxDyn>> {
        Array::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|e| {
            FlowError::shape(format!("{name} with shape {:?}", self.shape), e.to_string())
        })
    }

    fn to_fixed<D: Dimension>(&self, name: &str) -> FlowResult<Array<f32, D>> {
        self.to_dyn(name)?
            .into_dimensionality::<D>()
            .map_err(|_| {
                FlowError::shape(
                    format!("{name} of rank {}", D::NDIM.unwrap_or(0)),
                    format!("rank {}", self.shape.len()),
                )
            })
    }
}

/// Ordered `name -> tensor` map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterMap {
    tensors: BTreeMap<String, ParamTensor>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ParamTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ParamTensor> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ParamTensor> {
        self.tensors.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamTensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Scalar count over all tensors
    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(ParamTensor::len).sum()
    }

    fn take<D: Dimension>(&self, name: &str) -> FlowResult<Array<f32, D>> {
        self.get(name)
            .ok_or_else(|| FlowError::MissingParameter(name.to_string()))?
            .to_fixed(name)
    }
}

fn export_conv(map: &mut ParameterMap, prefix: &str, conv: &Conv1d) {
    map.insert(format!("{prefix}.weight"), ParamTensor::from_array(conv.weight()));
    if let Some(bias) = conv.bias() {
        map.insert(format!("{prefix}.bias"), ParamTensor::from_array(bias));
    }
}

fn conv_len(conv: &Conv1d) -> usize {
    conv.weight().len() + conv.bias().map_or(0, |b| b.len())
}

fn import_conv(
    map: &ParameterMap,
    prefix: &str,
    conv: &mut Conv1d,
    used: &mut Vec<String>,
) -> FlowResult<()> {
    let name = format!("{prefix}.weight");
    let weight: Array3<f32> = map.take(&name)?;
    conv.set_weight(weight)?;
    used.push(name);

    if conv.bias().is_some() {
        let name = format!("{prefix}.bias");
        let bias: Array1<f32> = map.take(&name)?;
        conv.set_bias(bias)?;
        used.push(name);
    }
    Ok(())
}

impl FlowStack {
    /// Snapshot of every learned tensor
    pub fn parameters(&self) -> ParameterMap {
        let mut map = ParameterMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            map.insert(
                format!("steps.{i}.mix.weight"),
                ParamTensor::from_array(step.mix.weight()),
            );

            let coupling = format!("steps.{i}.coupling");
            export_conv(&mut map, &format!("{coupling}.cond_proj"), &step.coupling.cond_proj);

            let net = &step.coupling.net;
            export_conv(&mut map, &format!("{coupling}.net.start"), &net.start);
            for (j, block) in net.blocks.iter().enumerate() {
                let prefix = format!("{coupling}.net.blocks.{j}");
                export_conv(&mut map, &format!("{prefix}.dilated"), &block.dilated);
                export_conv(&mut map, &format!("{prefix}.pointwise"), &block.pointwise);
            }
            export_conv(&mut map, &format!("{coupling}.net.end"), &net.end);
        }
        map
    }

    /// Count of learned scalars, without copying any tensor
    pub fn num_parameters(&self) -> usize {
        self.steps
            .iter()
            .map(|step| {
                let net = &step.coupling.net;
                step.mix.weight().len()
                    + conv_len(&step.coupling.cond_proj)
                    + conv_len(&net.start)
                    + net
                        .blocks
                        .iter()
                        .map(|b| conv_len(&b.dilated) + conv_len(&b.pointwise))
                        .sum::<usize>()
                    + conv_len(&net.end)
            })
            .sum()
    }

    /// Replace every learned tensor.
    ///
    /// All-or-nothing: names, shapes and mixing-matrix determinants are
    /// checked before anything is swapped in.
    pub fn load_parameters(&mut self, map: &ParameterMap) -> FlowResult<()> {
        let mut staged = self.steps.clone();
        let mut used = Vec::with_capacity(map.len());

        for (i, step) in staged.iter_mut().enumerate() {
            let name = format!("steps.{i}.mix.weight");
            let weight: Array2<f32> = map.take(&name)?;
            step.mix.set_weight(weight)?;
            used.push(name);

            let coupling = format!("steps.{i}.coupling");
            import_conv(
                map,
                &format!("{coupling}.cond_proj"),
                &mut step.coupling.cond_proj,
                &mut used,
            )?;

            let net = &mut step.coupling.net;
            import_conv(map, &format!("{coupling}.net.start"), &mut net.start, &mut used)?;
            for (j, block) in net.blocks.iter_mut().enumerate() {
                let prefix = format!("{coupling}.net.blocks.{j}");
                import_conv(map, &format!("{prefix}.dilated"), &mut block.dilated, &mut used)?;
                import_conv(map, &format!("{prefix}.pointwise"), &mut block.pointwise, &mut used)?;
            }
            import_conv(map, &format!("{coupling}.net.end"), &mut net.end, &mut used)?;
        }

        if let Some(extra) = map.names().find(|n| !used.iter().any(|u| u == n)) {
            return Err(FlowError::UnknownParameter(extra.to_string()));
        }

        self.steps = staged;
        Ok(())
    }
}
