//! Particle records and columnar record batches

use crate::core::particle_id::ParticleId;
use crate::core::property::{Column, Property};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One particle observation at one time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Raw packed identifier (0 = unoccupied)
    pub id: u64,
    /// Position, 1 to 3 components
    pub position: Vec<f64>,
    pub momentum: [f64; 3],
    pub charge: i16,
    pub weight: f64,
    /// Quantum radiation parameter, when tracked
    pub chi: Option<f64>,
    /// Electric and magnetic field samples, when tracked
    pub fields: Option<FieldSample>,
}

/// Field values interpolated at the particle position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldSample {
    pub e: [f64; 3],
    pub b: [f64; 3],
}

impl Record {
    /// Decoded identifier
    pub fn particle_id(&self) -> ParticleId {
        ParticleId::decode(self.id)
    }

    /// Properties this record carries, in catalogue order
    pub fn properties(&self) -> Vec<Property> {
        let mut props = vec![Property::Id];
        props.extend(Property::POSITIONS.iter().take(self.position.len()));
        props.extend([Property::Px, Property::Py, Property::Pz, Property::Q, Property::W]);
        if self.chi.is_some() {
            props.push(Property::Chi);
        }
        if self.fields.is_some() {
            props.extend([
                Property::Ex,
                Property::Ey,
                Property::Ez,
                Property::Bx,
                Property::By,
                Property::Bz,
            ]);
        }
        props.sort();
        props
    }
}

/// Columnar batch of records sharing the same property set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    columns: BTreeMap<Property, Column>,
}

impl RecordBatch {
    /// Empty batch holding the given properties (`Id` is always included)
    pub fn empty(properties: &[Property]) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert(Property::Id, Column::U64(Vec::new()));
        for p in properties {
            columns.insert(*p, Column::filled(p.dtype(), 0));
        }
        Self { columns }
    }

    /// Build a batch from columns, checking lengths and dtypes
    pub fn from_columns(columns: BTreeMap<Property, Column>) -> Result<Self> {
        let len = match columns.get(&Property::Id) {
            Some(Column::U64(ids)) => ids.len(),
            Some(_) => return Err(Error::Storage("Id column must be u64".to_string())),
            None => return Err(Error::Storage("Record batch has no Id column".to_string())),
        };
        for (prop, col) in &columns {
            if col.dtype() != prop.dtype() {
                return Err(Error::Storage(format!(
                    "Column {} has dtype {:?}, expected {:?}",
                    prop,
                    col.dtype(),
                    prop.dtype()
                )));
            }
            if col.len() != len {
                return Err(Error::Storage(format!(
                    "Column {} has {} values, expected {}",
                    prop,
                    col.len(),
                    len
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Build a batch from row records; every record must carry the same properties
    pub fn from_records(records: &[Record]) -> Result<Self> {
        let props = match records.first() {
            Some(first) => first.properties(),
            None => return Ok(Self::empty(&[])),
        };
        let mut columns: BTreeMap<Property, Column> = props
            .iter()
            .map(|p| (*p, Column::filled(p.dtype(), 0)))
            .collect();

        for record in records {
            if record.properties() != props {
                return Err(Error::Storage(format!(
                    "Record {} carries a different property set",
                    record.particle_id()
                )));
            }
            for (prop, col) in columns.iter_mut() {
                push_value(col, *prop, record);
            }
        }
        Self::from_columns(columns)
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw identifiers
    pub fn ids(&self) -> &[u64] {
        match self.columns.get(&Property::Id) {
            Some(Column::U64(ids)) => ids,
            _ => &[],
        }
    }

    /// Properties present in this batch, in catalogue order
    pub fn properties(&self) -> Vec<Property> {
        self.columns.keys().copied().collect()
    }

    pub fn column(&self, prop: Property) -> Option<&Column> {
        self.columns.get(&prop)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&Property, &Column)> {
        self.columns.iter()
    }

    /// Rows `start..end` as a new batch
    pub fn slice(&self, start: usize, end: usize) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(p, c)| (*p, c.slice(start, end)))
                .collect(),
        }
    }

    /// Reorder rows by a permutation
    pub fn permute(&self, order: &[usize]) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(p, c)| (*p, c.permute(order)))
                .collect(),
        }
    }

    /// Keep only the given properties (plus `Id`)
    pub fn project(&self, props: &[Property]) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .filter(|(p, _)| **p == Property::Id || props.contains(p))
                .map(|(p, c)| (*p, c.clone()))
                .collect(),
        }
    }

    /// Convert back to row records
    pub fn records(&self) -> Vec<Record> {
        let f = |prop: Property, i: usize| self.columns.get(&prop).map(|c| c.get_f64(i));
        (0..self.len())
            .map(|i| {
                let position = Property::POSITIONS
                    .iter()
                    .filter_map(|p| f(*p, i))
                    .collect();
                let fields = match (f(Property::Ex, i), f(Property::Bx, i)) {
                    (Some(ex), Some(bx)) => Some(FieldSample {
                        e: [ex, f(Property::Ey, i).unwrap_or(f64::NAN), f(Property::Ez, i).unwrap_or(f64::NAN)],
                        b: [bx, f(Property::By, i).unwrap_or(f64::NAN), f(Property::Bz, i).unwrap_or(f64::NAN)],
                    }),
                    _ => None,
                };
                Record {
                    id: self.ids()[i],
                    position,
                    momentum: [
                        f(Property::Px, i).unwrap_or(f64::NAN),
                        f(Property::Py, i).unwrap_or(f64::NAN),
                        f(Property::Pz, i).unwrap_or(f64::NAN),
                    ],
                    charge: match self.columns.get(&Property::Q) {
                        Some(Column::I16(q)) => q[i],
                        _ => 0,
                    },
                    weight: f(Property::W, i).unwrap_or(f64::NAN),
                    chi: f(Property::Chi, i),
                    fields,
                }
            })
            .collect()
    }
}

fn push_value(col: &mut Column, prop: Property, record: &Record) {
    let fields = record.fields.unwrap_or(FieldSample {
        e: [f64::NAN; 3],
        b: [f64::NAN; 3],
    });
    match col {
        Column::U64(v) => v.push(record.id),
        Column::I16(v) => v.push(record.charge),
        Column::F64(v) => v.push(match prop {
            Property::X => record.position[0],
            Property::Y => record.position[1],
            Property::Z => record.position[2],
            Property::Px => record.momentum[0],
            Property::Py => record.momentum[1],
            Property::Pz => record.momentum[2],
            Property::W => record.weight,
            Property::Chi => record.chi.unwrap_or(f64::NAN),
            Property::Ex => fields.e[0],
            Property::Ey => fields.e[1],
            Property::Ez => fields.e[2],
            Property::Bx => fields.b[0],
            Property::By => fields.b[1],
            Property::Bz => fields.b[2],
            Property::Id | Property::Q => f64::NAN,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(local: u32, x: f64) -> Record {
        Record {
            id: ParticleId::new(0, local).encode(),
            position: vec![x, 0.5],
            momentum: [0.1, 0.2, 0.3],
            charge: -1,
            weight: 1.0,
            chi: None,
            fields: None,
        }
    }

    #[test]
    fn test_batch_from_records() {
        let batch = RecordBatch::from_records(&[record(1, 0.0), record(2, 1.0)]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.properties(),
            vec![
                Property::Id,
                Property::X,
                Property::Y,
                Property::Px,
                Property::Py,
                Property::Pz,
                Property::Q,
                Property::W
            ]
        );
        assert_eq!(batch.records(), vec![record(1, 0.0), record(2, 1.0)]);
    }

    #[test]
    fn test_mixed_property_sets_rejected() {
        let mut other = record(2, 1.0);
        other.chi = Some(0.3);
        assert!(RecordBatch::from_records(&[record(1, 0.0), other]).is_err());
    }

    #[test]
    fn test_from_columns_checks_lengths() {
        let mut columns = BTreeMap::new();
        columns.insert(Property::Id, Column::U64(vec![1, 2]));
        columns.insert(Property::X, Column::F64(vec![0.0]));
        assert!(RecordBatch::from_columns(columns).is_err());
    }

    #[test]
    fn test_slice_and_permute() {
        let batch =
            RecordBatch::from_records(&[record(3, 3.0), record(1, 1.0), record(2, 2.0)]).unwrap();
        let sorted = batch.permute(&[1, 2, 0]);
        assert_eq!(sorted.ids(), &[1, 2, 3]);
        assert_eq!(sorted.slice(1, 3).ids(), &[2, 3]);
        assert_eq!(batch.project(&[Property::X]).properties(), vec![Property::Id, Property::X]);
    }
}
