//! Particle properties and their column storage

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type of a stored property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    U64,
    I16,
    F64,
}

impl Dtype {
    /// Width of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            Dtype::U64 | Dtype::F64 => 8,
            Dtype::I16 => 2,
        }
    }

    /// On-disk tag
    pub fn code(&self) -> u8 {
        match self {
            Dtype::U64 => 1,
            Dtype::I16 => 2,
            Dtype::F64 => 3,
        }
    }

    /// Parse an on-disk tag
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Dtype::U64),
            2 => Ok(Dtype::I16),
            3 => Ok(Dtype::F64),
            other => Err(Error::Storage(format!("Unknown dtype code: {}", other))),
        }
    }
}

/// A tracked particle property
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Property {
    Id,
    X,
    Y,
    Z,
    Px,
    Py,
    Pz,
    Q,
    W,
    Chi,
    Ex,
    Ey,
    Ez,
    Bx,
    By,
    Bz,
}

impl Property {
    /// Every property, in catalogue order
    pub const ALL: [Property; 16] = [
        Property::Id,
        Property::X,
        Property::Y,
        Property::Z,
        Property::Px,
        Property::Py,
        Property::Pz,
        Property::Q,
        Property::W,
        Property::Chi,
        Property::Ex,
        Property::Ey,
        Property::Ez,
        Property::Bx,
        Property::By,
        Property::Bz,
    ];

    /// Spatial coordinates, in axis order
    pub const POSITIONS: [Property; 3] = [Property::X, Property::Y, Property::Z];

    /// Name used in queries and file names
    pub fn name(&self) -> &'static str {
        match self {
            Property::Id => "Id",
            Property::X => "x",
            Property::Y => "y",
            Property::Z => "z",
            Property::Px => "px",
            Property::Py => "py",
            Property::Pz => "pz",
            Property::Q => "q",
            Property::W => "w",
            Property::Chi => "chi",
            Property::Ex => "Ex",
            Property::Ey => "Ey",
            Property::Ez => "Ez",
            Property::Bx => "Bx",
            Property::By => "By",
            Property::Bz => "Bz",
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Property::Id => Dtype::U64,
            Property::Q => Dtype::I16,
            _ => Dtype::F64,
        }
    }

    /// Whether unit conversion factors apply to this property
    pub fn is_scalable(&self) -> bool {
        !matches!(self, Property::Id | Property::Q)
    }

    /// Bit used for this property in a property mask
    pub fn bit(&self) -> u32 {
        1 << (*self as u32)
    }

    /// Properties contained in a mask, in catalogue order
    pub fn from_mask(mask: u32) -> Vec<Property> {
        Property::ALL
            .iter()
            .copied()
            .filter(|p| mask & p.bit() != 0)
            .collect()
    }

    /// Mask for a set of properties
    pub fn mask(props: &[Property]) -> u32 {
        props.iter().fold(0, |acc, p| acc | p.bit())
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Property {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Property::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| Error::UnknownProperty(s.to_string()))
    }
}

/// A column of values for one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    U64(Vec<u64>),
    I16(Vec<i16>),
    F64(Vec<f64>),
}

impl Column {
    /// Column of `len` fill values for a dtype: 0 for integers, NaN for floats
    pub fn filled(dtype: Dtype, len: usize) -> Self {
        match dtype {
            Dtype::U64 => Column::U64(vec![0; len]),
            Dtype::I16 => Column::I16(vec![0; len]),
            Dtype::F64 => Column::F64(vec![f64::NAN; len]),
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Column::U64(_) => Dtype::U64,
            Column::I16(_) => Dtype::I16,
            Column::F64(_) => Dtype::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::U64(v) => v.len(),
            Column::I16(v) => v.len(),
            Column::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the elements in `start..end`
    pub fn slice(&self, start: usize, end: usize) -> Column {
        match self {
            Column::U64(v) => Column::U64(v[start..end].to_vec()),
            Column::I16(v) => Column::I16(v[start..end].to_vec()),
            Column::F64(v) => Column::F64(v[start..end].to_vec()),
        }
    }

    /// Reorder by a permutation: `out[i] = self[order[i]]`
    pub fn permute(&self, order: &[usize]) -> Column {
        match self {
            Column::U64(v) => Column::U64(order.iter().map(|&i| v[i]).collect()),
            Column::I16(v) => Column::I16(order.iter().map(|&i| v[i]).collect()),
            Column::F64(v) => Column::F64(order.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Write `self[i]` into `target[positions[i]]`
    pub fn scatter_into(&self, target: &mut Column, positions: &[usize]) -> Result<()> {
        match (self, target) {
            (Column::U64(src), Column::U64(dst)) => scatter(src, dst, positions),
            (Column::I16(src), Column::I16(dst)) => scatter(src, dst, positions),
            (Column::F64(src), Column::F64(dst)) => scatter(src, dst, positions),
            (src, dst) => {
                return Err(Error::Storage(format!(
                    "Column type mismatch: {:?} into {:?}",
                    src.dtype(),
                    dst.dtype()
                )))
            }
        }
        Ok(())
    }

    /// Append another column of the same dtype
    pub fn extend(&mut self, other: &Column) -> Result<()> {
        match (self, other) {
            (Column::U64(a), Column::U64(b)) => a.extend_from_slice(b),
            (Column::I16(a), Column::I16(b)) => a.extend_from_slice(b),
            (Column::F64(a), Column::F64(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(Error::Storage(format!(
                    "Column type mismatch: {:?} with {:?}",
                    a.dtype(),
                    b.dtype()
                )))
            }
        }
        Ok(())
    }

    /// Value at `i` widened to f64 (for expression evaluation)
    pub fn get_f64(&self, i: usize) -> f64 {
        match self {
            Column::U64(v) => v[i] as f64,
            Column::I16(v) => v[i] as f64,
            Column::F64(v) => v[i],
        }
    }

    /// Whole column widened to f64
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Column::U64(v) => v.iter().map(|&x| x as f64).collect(),
            Column::I16(v) => v.iter().map(|&x| x as f64).collect(),
            Column::F64(v) => v.clone(),
        }
    }
}

fn scatter<T: Copy>(src: &[T], dst: &mut [T], positions: &[usize]) {
    for (value, &pos) in src.iter().zip(positions) {
        dst[pos] = *value;
    }
}
