//! Device addressing within a mesh.

use smallvec::SmallVec;
use snafu::ensure;

use crate::error::{InvalidDeviceSnafu, InvalidMeshSnafu, Result};

/// Target of a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceAddress {
    /// Flat device id.
    Logical(usize),
    /// Coordinates along every mesh axis.
    Mesh(SmallVec<[usize; 4]>),
}

impl From<usize> for DeviceAddress {
    fn from(id: usize) -> Self {
        Self::Logical(id)
    }
}

impl From<&[usize]> for DeviceAddress {
    fn from(coords: &[usize]) -> Self {
        Self::Mesh(SmallVec::from_slice(coords))
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Logical(id) => write!(f, "#{id}"),
            Self::Mesh(coords) => write!(f, "{:?}", coords.as_slice()),
        }
    }
}

/// Named axes of a device mesh; device ids are row-major over the axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshTopology {
    names: SmallVec<[String; 4]>,
    shape: SmallVec<[usize; 4]>,
}

impl MeshTopology {
    pub fn new(axes: &[(&str, usize)]) -> Result<Self> {
        ensure!(!axes.is_empty(), InvalidMeshSnafu { reason: "a mesh needs at least one axis" });
        for (index, (name, size)) in axes.iter().enumerate() {
            ensure!(*size > 0, InvalidMeshSnafu { reason: format!("axis '{name}' has size 0") });
            ensure!(
                axes[..index].iter().all(|(other, _)| other != name),
                InvalidMeshSnafu { reason: format!("duplicate axis '{name}'") }
            );
        }
        Ok(Self {
            names: axes.iter().map(|(name, _)| name.to_string()).collect(),
            shape: axes.iter().map(|(_, size)| *size).collect(),
        })
    }

    /// One-axis mesh named `x`.
    pub fn linear(devices: usize) -> Result<Self> {
        Self::new(&[("x", devices)])
    }

    pub fn num_devices(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn axis_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn resolve(&self, address: &DeviceAddress) -> Result<usize> {
        let invalid = |reason: String| InvalidDeviceSnafu { address: address.to_string(), reason };
        match address {
            DeviceAddress::Logical(id) => {
                ensure!(*id < self.num_devices(), invalid(format!("mesh has {} devices", self.num_devices())));
                Ok(*id)
            }
            DeviceAddress::Mesh(coords) => {
                ensure!(coords.len() == self.shape.len(), invalid(format!("mesh has rank {}", self.shape.len())));
                ensure!(
                    coords.iter().zip(&self.shape).all(|(c, d)| c < d),
                    invalid(format!("mesh shape is {:?}", self.shape.as_slice()))
                );
                Ok(coords.iter().zip(&self.shape).fold(0, |acc, (c, d)| acc * d + c))
            }
        }
    }

    pub fn coordinates(&self, device: usize) -> SmallVec<[usize; 4]> {
        let mut coords: SmallVec<[usize; 4]> = SmallVec::from_elem(0, self.shape.len());
        let mut rest = device;
        for (coord, dim) in coords.iter_mut().zip(&self.shape).rev() {
            *coord = rest % dim;
            rest /= dim;
        }
        coords
    }

    fn axis_position(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|axis| axis == name)
            .ok_or_else(|| InvalidMeshSnafu { reason: format!("no axis named '{name}'") }.build())
    }

    /// Coordinate of `device` along the named axis.
    pub fn axis_index(&self, device: usize, name: &str) -> Result<usize> {
        let position = self.axis_position(name)?;
        Ok(self.coordinates(device)[position])
    }

    pub fn axis_size(&self, name: &str) -> Result<usize> {
        Ok(self.shape[self.axis_position(name)?])
    }
}
