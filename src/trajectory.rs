//! Time-major trajectory tables and broken-trajectory detection
//!
//! A slot may be re-occupied by a different particle between two dumps.
//! Connecting the two occupants would show a jump faster than the speed
//! limit, so such boundaries are reported in a [`BreakTable`] together with
//! the speed that was computed.

use crate::config::TrackConfig;
use crate::core::property::{Column, Property};
use crate::error::{Error, Result};
use crate::query::selection::Selection;
use crate::storage::ordered::OrderedStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One boundary where a slot moved faster than the speed limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Break {
    /// Index into the table's times of the sample after the jump
    pub time_index: usize,
    /// Axis with the highest speed at this boundary
    pub axis: Property,
    pub speed: f64,
}

/// Broken trajectories, keyed by column (position in the table's slots)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakTable {
    breaks: BTreeMap<usize, Vec<Break>>,
}

impl BreakTable {
    /// Detect breaks from raw positions.
    ///
    /// `positions` maps an axis to its rows, one `Vec` of per-column values
    /// per time. NaN differences are not breaks.
    pub fn detect(
        times: &[u64],
        positions: &BTreeMap<Property, Vec<Vec<f64>>>,
        timestep: f64,
        speed_limit: f64,
    ) -> Self {
        let mut found: BTreeMap<usize, BTreeMap<usize, Break>> = BTreeMap::new();

        for (&axis, rows) in positions {
            for (i, pair) in rows.windows(2).enumerate() {
                let dt = times[i + 1].saturating_sub(times[i]) as f64 * timestep;
                for (column, (a, b)) in pair[0].iter().zip(&pair[1]).enumerate() {
                    let speed = ((b - a) / dt).abs();
                    if !(speed > speed_limit) {
                        continue;
                    }
                    let candidate = Break {
                        time_index: i + 1,
                        axis,
                        speed,
                    };
                    found
                        .entry(column)
                        .or_default()
                        .entry(i + 1)
                        .and_modify(|b| {
                            if candidate.speed > b.speed {
                                *b = candidate;
                            }
                        })
                        .or_insert(candidate);
                }
            }
        }

        Self {
            breaks: found
                .into_iter()
                .map(|(column, by_time)| (column, by_time.into_values().collect()))
                .collect(),
        }
    }

    pub fn is_broken(&self, column: usize) -> bool {
        self.breaks.contains_key(&column)
    }

    /// Breaks of a column, ascending by time-index
    pub fn breaks(&self, column: usize) -> &[Break] {
        self.breaks.get(&column).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of broken columns
    pub fn broken_count(&self) -> usize {
        self.breaks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[Break])> {
        self.breaks.iter().map(|(c, b)| (*c, b.as_slice()))
    }
}

/// Values of selected slots over a sequence of times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryTable {
    pub times: Vec<u64>,
    pub slots: Vec<u64>,
    /// One row per time, each with one value per slot
    pub columns: BTreeMap<Property, Vec<Column>>,
    pub breaks: BreakTable,
}

fn read(
    store: &mut OrderedStore,
    prop: Property,
    t: usize,
    selection: &Selection,
    slots: &[u64],
) -> Result<Column> {
    match selection {
        Selection::All => store.read_range(prop, t, 0, store.total_slots()),
        Selection::Slots(_) => store.read_slots(prop, t, slots),
    }
}

impl TrajectoryTable {
    /// Load `properties` of the selected slots at `time_indices`.
    ///
    /// Floating values of dead observations read as NaN and conversion
    /// factors are applied after break detection.
    pub fn load(
        store: &mut OrderedStore,
        selection: &Selection,
        properties: &[Property],
        time_indices: &[usize],
        config: &TrackConfig,
    ) -> Result<Self> {
        for prop in properties {
            if !store.properties().contains(prop) {
                return Err(Error::UnknownProperty(prop.name().to_string()));
            }
        }
        let slots = selection.to_slots(store.total_slots());
        let times = time_indices
            .iter()
            .map(|&t| {
                store
                    .times()
                    .time_at(t)
                    .ok_or_else(|| Error::Storage(format!("No time-index {} in store", t)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut columns: BTreeMap<Property, Vec<Column>> =
            properties.iter().map(|p| (*p, Vec::with_capacity(times.len()))).collect();
        for &t in time_indices {
            let ids = read(store, Property::Id, t, selection, &slots)?;
            let ids = match ids {
                Column::U64(ids) => ids,
                other => {
                    return Err(Error::Storage(format!("Id column has dtype {:?}", other.dtype())))
                }
            };
            for (prop, rows) in columns.iter_mut() {
                let row = match prop {
                    Property::Id => Column::U64(ids.clone()),
                    _ => match read(store, *prop, t, selection, &slots)? {
                        Column::F64(mut values) => {
                            for (v, id) in values.iter_mut().zip(&ids) {
                                if *id == 0 {
                                    *v = f64::NAN;
                                }
                            }
                            Column::F64(values)
                        }
                        other => other,
                    },
                };
                rows.push(row);
            }
        }

        let positions: BTreeMap<Property, Vec<Vec<f64>>> = Property::POSITIONS
            .iter()
            .filter_map(|axis| columns.get(axis).map(|rows| (*axis, rows.iter().map(Column::to_f64).collect())))
            .collect();
        let breaks = BreakTable::detect(&times, &positions, config.timestep, config.speed_limit);

        for (prop, rows) in columns.iter_mut() {
            let factor = config.factor(*prop);
            if factor == 1.0 {
                continue;
            }
            for row in rows.iter_mut() {
                if let Column::F64(values) = row {
                    values.iter_mut().for_each(|v| *v *= factor);
                }
            }
        }

        debug!(
            times = times.len(),
            slots = slots.len(),
            broken = breaks.broken_count(),
            "trajectory table loaded"
        );
        Ok(Self {
            times,
            slots,
            columns,
            breaks,
        })
    }

    pub fn n_times(&self) -> usize {
        self.times.len()
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    /// Values of a property at one time-index of the table
    pub fn row(&self, prop: Property, time_index: usize) -> Option<&Column> {
        self.columns.get(&prop)?.get(time_index)
    }

    /// One column's values of a property over time, widened to f64
    pub fn trajectory(&self, prop: Property, column: usize) -> Option<Vec<f64>> {
        let rows = self.columns.get(&prop)?;
        if column >= self.slots.len() {
            return None;
        }
        Some(rows.iter().map(|row| row.get_f64(column)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timeline::TimeAxis;
    use tempfile::TempDir;

    #[test]
    fn test_break_detection() {
        let times = [0, 1, 2];
        let mut positions = BTreeMap::new();
        // column 0 jumps at the last boundary, column 1 moves smoothly,
        // column 2 is dead in the middle
        positions.insert(
            Property::X,
            vec![vec![0.0, 0.0, 0.0], vec![0.5, 0.1, f64::NAN], vec![5.0, 0.2, 10.0]],
        );
        positions.insert(
            Property::Y,
            vec![vec![0.0, 0.0, 0.0], vec![0.0, 0.1, 0.0], vec![-9.0, 0.2, 0.0]],
        );

        let table = BreakTable::detect(&times, &positions, 1.0, 1.0);
        assert_eq!(table.broken_count(), 1);
        assert!(table.is_broken(0));
        assert!(!table.is_broken(1));
        assert!(!table.is_broken(2));
        assert_eq!(
            table.breaks(0),
            &[Break {
                time_index: 2,
                axis: Property::Y,
                speed: 9.0
            }]
        );
    }

    #[test]
    fn test_timestep_and_limit_scale_speed() {
        let times = [0, 10];
        let mut positions = BTreeMap::new();
        positions.insert(Property::Z, vec![vec![0.0], vec![5.0]]);
        // 5 over 10 steps of 0.1 is speed 5
        let table = BreakTable::detect(&times, &positions, 0.1, 1.0);
        assert_eq!(table.breaks(0)[0].speed, 5.0);
        let relaxed = BreakTable::detect(&times, &positions, 0.1, 10.0);
        assert_eq!(relaxed.broken_count(), 0);
    }

    #[test]
    fn test_load_masks_dead_and_scales() {
        let temp_dir = TempDir::new().unwrap();
        let props = [Property::Id, Property::X, Property::Q];
        let mut store =
            OrderedStore::create(temp_dir.path(), "ion", TimeAxis::new(vec![5, 6]), 3, vec![0], &props)
                .unwrap();
        store.write_row(Property::Id, 0, &Column::U64(vec![1, 2, 0])).unwrap();
        store.write_row(Property::Id, 1, &Column::U64(vec![1, 0, 3])).unwrap();
        store.write_row(Property::X, 0, &Column::F64(vec![0.0, 1.0, 7.0])).unwrap();
        store.write_row(Property::X, 1, &Column::F64(vec![0.5, 1.0, 2.0])).unwrap();
        store.write_row(Property::Q, 0, &Column::I16(vec![-1, -1, 0])).unwrap();

        let mut config = TrackConfig::default();
        config.conversion.insert("x".to_string(), 10.0);

        let table = TrajectoryTable::load(
            &mut store,
            &Selection::Slots(vec![1, 2]),
            &props,
            &[0, 1],
            &config,
        )
        .unwrap();
        assert_eq!(table.times, vec![5, 6]);
        assert_eq!(table.slots, vec![1, 2]);
        assert_eq!(table.row(Property::Id, 1), Some(&Column::U64(vec![0, 3])));
        assert_eq!(table.row(Property::Q, 0), Some(&Column::I16(vec![-1, 0])));

        let slot1 = table.trajectory(Property::X, 0).unwrap();
        assert_eq!(slot1[0], 10.0);
        assert!(slot1[1].is_nan());
        let slot2 = table.trajectory(Property::X, 1).unwrap();
        assert!(slot2[0].is_nan());
        assert_eq!(slot2[1], 20.0);
        assert_eq!(table.breaks.broken_count(), 0);

        let all = TrajectoryTable::load(&mut store, &Selection::All, &[Property::X], &[0, 1], &config)
            .unwrap();
        assert_eq!(all.n_slots(), 3);
        assert!(all.breaks.breaks(0).is_empty());
        assert!(table.trajectory(Property::X, 5).is_none());
    }

    #[test]
    fn test_unknown_property() {
        let temp_dir = TempDir::new().unwrap();
        let mut store =
            OrderedStore::create(temp_dir.path(), "ion", TimeAxis::new(vec![0]), 1, vec![0], &[]).unwrap();
        assert!(matches!(
            TrajectoryTable::load(
                &mut store,
                &Selection::All,
                &[Property::Chi],
                &[0],
                &TrackConfig::default()
            ),
            Err(Error::UnknownProperty(_))
        ));
    }
}
