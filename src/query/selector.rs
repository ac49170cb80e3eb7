//! Selector engine: `any(time_expr, particle_expr)` / `all(...)` clauses
//! combined by an outer expression, evaluated chunk by chunk over the store.

use super::expr::{eval, truthy, Env, Expr, Scope};
use super::parser::parse_expression;
use super::selection::Selection;
use crate::core::property::{Column, Property};
use crate::core::timeline::TimeAxis;
use crate::error::{Error, Result};
use crate::storage::ordered::OrderedStore;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a clause folds its per-time results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// True at one or more selected times
    Any,
    /// True at every selected time the particle exists, and alive at one
    /// of them at least
    All,
}

impl Combinator {
    fn keyword(&self) -> &'static str {
        match self {
            Combinator::Any => "any(",
            Combinator::All => "all(",
        }
    }
}

/// One parsed `any(...)`/`all(...)` clause
#[derive(Debug, Clone)]
pub struct Clause {
    pub combinator: Combinator,
    /// Source text of the whole clause
    pub text: String,
    /// Selected time-indices, ascending
    pub time_indices: Vec<usize>,
    pub predicate: Expr,
}

/// A parsed selector query
#[derive(Debug, Clone)]
pub struct Selector {
    clauses: Vec<Clause>,
    /// `None` when the query is empty and selects everything
    outer: Option<Expr>,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Index of `target` at bracket depth zero, scanning from `from`.
///
/// Returns `None` when brackets are unbalanced before `target` is reached.
fn find_closing(text: &str, from: usize, target: char) -> Option<usize> {
    let mut stack = Vec::new();
    for (i, c) in text[from..].char_indices() {
        if stack.is_empty() && c == target {
            return Some(from + i);
        }
        match c {
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(open) {
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

/// Next `any(`/`all(` at or after `from` that starts a word
fn next_clause(text: &str, from: usize) -> Option<(usize, Combinator)> {
    let mut prev = text[..from].chars().next_back();
    for (i, c) in text[from..].char_indices() {
        let at = from + i;
        if !prev.map(is_word_char).unwrap_or(false) {
            for combinator in [Combinator::Any, Combinator::All] {
                if text[at..].starts_with(combinator.keyword()) {
                    return Some((at, combinator));
                }
            }
        }
        prev = Some(c);
    }
    None
}

/// Resolve a time selector to ascending time-indices
fn time_indices(time_text: &str, times: &TimeAxis) -> Result<Vec<usize>> {
    let n = times.len();
    let indices = if let Some(colon) = find_closing(time_text, 0, ':') {
        let bound = |s: &str| -> Result<Option<i64>> {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<i64>()
                .map(Some)
                .map_err(|_| Error::selector("slice bounds must be integers", time_text))
        };
        let clamp = |b: i64| -> usize {
            let b = if b < 0 { b + n as i64 } else { b };
            b.clamp(0, n as i64) as usize
        };
        let start = bound(&time_text[..colon])?.map(clamp).unwrap_or(0);
        let end = bound(&time_text[colon + 1..])?.map(clamp).unwrap_or(n);
        (start..end.max(start)).collect()
    } else {
        let expr = parse_expression(time_text)?.resolve(Scope::Time, time_text)?;
        if expr.uses_time() {
            let values: Vec<f64> = times.times().iter().map(|&t| t as f64).collect();
            let env = Env {
                time: Some(values.as_slice()),
                ..Env::default()
            };
            eval(&expr, &env)?
                .into_array(n)
                .into_iter()
                .enumerate()
                .filter(|(_, v)| truthy(*v))
                .map(|(i, _)| i)
                .collect()
        } else {
            let index = eval(&expr, &Env::default())?.into_array(1)[0];
            if index.fract() != 0.0 || !index.is_finite() {
                return Err(Error::selector("time index must be an integer", time_text));
            }
            let index = index as i64;
            let resolved = if index < 0 { index + n as i64 } else { index };
            if resolved < 0 || resolved >= n as i64 {
                return Err(Error::selector(
                    format!("time index {} outside {} available times", index, n),
                    time_text,
                ));
            }
            vec![resolved as usize]
        }
    };
    if indices.is_empty() {
        return Err(Error::selector("time selector matches no time", time_text));
    }
    Ok(indices)
}

impl Selector {
    /// Parse a query against the properties and times of a store
    pub fn parse(query: &str, properties: &[Property], times: &TimeAxis) -> Result<Self> {
        let mut outer = String::new();
        let mut clauses = Vec::new();
        let mut pos = 0;

        while let Some((start, combinator)) = next_clause(query, pos) {
            outer.push_str(&query[pos..start]);
            let body = start + combinator.keyword().len();
            let comma = find_closing(query, body, ',')
                .ok_or_else(|| Error::selector("missing `,` in clause", &query[start..]))?;
            let end = find_closing(query, comma + 1, ')')
                .ok_or_else(|| Error::selector("missing `)` closing clause", &query[start..]))?;

            let text = &query[start..=end];
            let time_text = &query[body..comma];
            let particle_text = &query[comma + 1..end];
            let predicate = parse_expression(particle_text)?
                .resolve(Scope::Particle(properties), text)?;

            outer.push_str(&format!("#{}", clauses.len()));
            clauses.push(Clause {
                combinator,
                text: text.to_string(),
                time_indices: time_indices(time_text, times)?,
                predicate,
            });
            pos = end + 1;
        }
        outer.push_str(&query[pos..]);

        let outer = if outer.trim().is_empty() {
            None
        } else {
            Some(parse_expression(&outer)?.resolve(Scope::Outer, query)?)
        };
        Ok(Self { clauses, outer })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Whether the query is empty and matches every slot
    pub fn selects_everything(&self) -> bool {
        self.outer.is_none()
    }

    /// Evaluate over the store in chunks of `chunk_size` slots
    pub fn evaluate(
        &self,
        store: &mut OrderedStore,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Selection> {
        let outer = match &self.outer {
            Some(outer) => outer,
            None => return Ok(Selection::All),
        };
        let total = store.total_slots();
        let step = chunk_size.max(1) as u64;

        let mut slots = Vec::new();
        let mut start = 0;
        let mut chunks = 0;
        while start < total {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let len = step.min(total - start);
            let results = self
                .clauses
                .iter()
                .map(|clause| clause.evaluate_chunk(store, start, len))
                .collect::<Result<Vec<_>>>()?;
            let env = Env {
                clauses: &results,
                ..Env::default()
            };
            let combined = eval(outer, &env)?.into_array(len as usize);
            slots.extend(
                combined
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| truthy(**v))
                    .map(|(i, _)| start + i as u64),
            );
            start += len;
            chunks += 1;
        }
        debug!(clauses = self.clauses.len(), chunks, selected = slots.len(), "selector evaluated");
        Ok(Selection::Slots(slots))
    }
}

impl Clause {
    /// 0/1 result of this clause for slots `start..start + len`
    fn evaluate_chunk(&self, store: &mut OrderedStore, start: u64, len: u64) -> Result<Vec<f64>> {
        let n = len as usize;
        let mut acc = vec![self.combinator == Combinator::All; n];
        let mut seen_live = vec![false; n];
        let props = self.predicate.properties();

        for &t in &self.time_indices {
            let ids = match store.read_range(Property::Id, t, start, len)? {
                Column::U64(ids) => ids,
                other => {
                    return Err(Error::Storage(format!("Id column has dtype {:?}", other.dtype())))
                }
            };
            let mut columns = BTreeMap::new();
            for &prop in &props {
                let values = match prop {
                    Property::Id => ids.iter().map(|&id| id as f64).collect(),
                    _ => store.read_range(prop, t, start, len)?.to_f64(),
                };
                columns.insert(prop, values);
            }
            let env = Env {
                properties: columns.iter().map(|(p, v)| (*p, v.as_slice())).collect(),
                ids: Some(ids.as_slice()),
                ..Env::default()
            };
            let values = eval(&self.predicate, &env)?.into_array(n);

            for (((a, seen), id), v) in acc.iter_mut().zip(&mut seen_live).zip(&ids).zip(values) {
                if *id == 0 {
                    continue;
                }
                *seen = true;
                match self.combinator {
                    Combinator::Any => *a |= truthy(v),
                    Combinator::All => *a &= truthy(v),
                }
            }
        }
        Ok(acc
            .into_iter()
            .zip(seen_live)
            .map(|(a, seen)| if a && seen { 1.0 } else { 0.0 })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROPS: [Property; 3] = [Property::Id, Property::X, Property::Q];

    fn axis() -> TimeAxis {
        TimeAxis::new(vec![0, 10, 20, 30])
    }

    /// 5 slots, 4 times. Slot 4 is never alive.
    fn store(dir: &std::path::Path) -> OrderedStore {
        let mut store = OrderedStore::create(dir, "electron", axis(), 5, vec![0], &PROPS).unwrap();
        let ids = [
            vec![1, 2, 3, 0, 0],
            vec![1, 2, 3, 4, 0],
            vec![1, 2, 0, 4, 0],
            vec![1, 2, 0, 4, 0],
        ];
        let xs = [
            vec![0.5, -1.0, 2.0, f64::NAN, f64::NAN],
            vec![0.6, 1.0, 3.0, 1.0, f64::NAN],
            vec![0.7, -1.0, f64::NAN, 2.0, f64::NAN],
            vec![0.8, -1.0, f64::NAN, 3.0, f64::NAN],
        ];
        for t in 0..4 {
            store.write_row(Property::Id, t, &Column::U64(ids[t].clone())).unwrap();
            store.write_row(Property::X, t, &Column::F64(xs[t].clone())).unwrap();
        }
        store
    }

    fn select(store: &mut OrderedStore, query: &str, chunk_size: usize) -> Selection {
        Selector::parse(query, &PROPS, &axis())
            .unwrap()
            .evaluate(store, chunk_size, &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_find_closing_respects_brackets() {
        assert_eq!(find_closing("t>0, x>0)", 0, ','), Some(3));
        assert_eq!(find_closing("f(a,b), x)", 0, ','), Some(6));
        assert_eq!(find_closing("(t>0, x>0", 0, ','), None);
        assert_eq!(find_closing("a]", 0, ','), None);
    }

    #[test]
    fn test_clause_extraction() {
        let s = Selector::parse("any(t>0, x>0) * all(:2, abs(x)<1)", &PROPS, &axis()).unwrap();
        assert_eq!(s.clauses().len(), 2);
        assert_eq!(s.clauses()[0].combinator, Combinator::Any);
        assert_eq!(s.clauses()[0].text, "any(t>0, x>0)");
        assert_eq!(s.clauses()[0].time_indices, vec![1, 2, 3]);
        assert_eq!(s.clauses()[1].combinator, Combinator::All);
        assert_eq!(s.clauses()[1].time_indices, vec![0, 1]);
        assert!(!s.selects_everything());
        assert!(Selector::parse("  ", &PROPS, &axis()).unwrap().selects_everything());
        // "company(" is not a clause
        assert!(Selector::parse("company(t, x>0)", &PROPS, &axis()).is_err());
    }

    #[test]
    fn test_time_selector_forms() {
        let times = axis();
        assert_eq!(time_indices("t>=10", &times).unwrap(), vec![1, 2, 3]);
        assert_eq!(time_indices("(t>=10)&(t<30)", &times).unwrap(), vec![1, 2]);
        assert_eq!(time_indices("-1", &times).unwrap(), vec![3]);
        assert_eq!(time_indices("0", &times).unwrap(), vec![0]);
        assert_eq!(time_indices("1:3", &times).unwrap(), vec![1, 2]);
        assert_eq!(time_indices(":", &times).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(time_indices("-2:", &times).unwrap(), vec![2, 3]);
        assert_eq!(time_indices(" :1", &times).unwrap(), vec![0]);
        assert_eq!(time_indices("t", &times).unwrap(), vec![1, 2, 3]);

        for bad in ["4", "-5", "t>100", "2:1", "1.5", "a:b", "x>0"] {
            assert!(
                matches!(time_indices(bad, &times), Err(Error::SelectorSyntax { .. })),
                "{} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_syntax_errors_carry_fragment() {
        match Selector::parse("any(t>0 x>0)", &PROPS, &axis()) {
            Err(Error::SelectorSyntax { fragment, .. }) => assert_eq!(fragment, "any(t>0 x>0)"),
            other => panic!("unexpected {:?}", other),
        }
        match Selector::parse("any(t>0, (x>0)", &PROPS, &axis()) {
            Err(Error::SelectorSyntax { fragment, .. }) => assert_eq!(fragment, "any(t>0, (x>0)"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            Selector::parse("any(t>0, px>0)", &PROPS, &axis()),
            Err(Error::UnknownProperty(_))
        ));
        assert!(matches!(
            Selector::parse("any(t>0, foo>0)", &PROPS, &axis()),
            Err(Error::SelectorSyntax { .. })
        ));
        // outer expression may only combine clauses
        assert!(matches!(
            Selector::parse("any(t>0, x>0) & x>0", &PROPS, &axis()),
            Err(Error::SelectorSyntax { .. })
        ));
    }

    #[test]
    fn test_any_and_all() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = store(temp_dir.path());

        // slot 2 is dead at t=20,30 so NaN there never matches
        assert_eq!(select(&mut s, "any(t, x>0)", 100), Selection::Slots(vec![0, 1, 2, 3]));
        assert_eq!(select(&mut s, "any(t>=20, x>0)", 100), Selection::Slots(vec![0, 3]));
        // all() skips times where the slot is dead; slot 4 is never alive
        assert_eq!(select(&mut s, "all(t, x>0)", 100), Selection::Slots(vec![0, 2, 3]));
        // slot 3 is dead at t=0, so it does not match there
        assert_eq!(select(&mut s, "all(0, x>0)", 100), Selection::Slots(vec![0, 2]));
        assert_eq!(select(&mut s, "any(0, x>0)", 100), select(&mut s, "all(0, x>0)", 100));
        assert_eq!(select(&mut s, "all(-1, Id>0)", 100), Selection::Slots(vec![0, 1, 3]));
        assert_eq!(select(&mut s, "", 100), Selection::All);
    }

    #[test]
    fn test_outer_combination() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = store(temp_dir.path());
        let union = select(&mut s, "any(0, x<0) + any(-1, x>2)", 100);
        assert_eq!(union, Selection::Slots(vec![1, 3]));
        let inter = select(&mut s, "any(t, x>0) * any(t, x>1.5)", 100);
        assert_eq!(inter, Selection::Slots(vec![2, 3]));
        let negated = select(&mut s, "~any(t, Id>0)", 100);
        assert_eq!(negated, Selection::Slots(vec![4]));
    }

    #[test]
    fn test_id_equality_is_exact_for_tagged_ids() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = OrderedStore::create(temp_dir.path(), "electron", axis(), 2, vec![0], &PROPS).unwrap();
        let a = (0x10u64 << 56) | 1;
        for t in 0..4 {
            s.write_row(Property::Id, t, &Column::U64(vec![a, a + 1])).unwrap();
        }
        let query = format!("any(0, Id == {})", a);
        assert_eq!(select(&mut s, &query, 100), Selection::Slots(vec![0]));
        let query = format!("any(0, {} < Id)", a);
        assert_eq!(select(&mut s, &query, 100), Selection::Slots(vec![1]));
    }

    #[test]
    fn test_result_independent_of_chunking() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = store(temp_dir.path());
        let query = "any(t>0, x>0.65) | all(:2, x>0)";
        let expected = select(&mut s, query, 100);
        for chunk_size in [1, 2, 3] {
            assert_eq!(select(&mut s, query, chunk_size), expected);
        }
    }

    #[test]
    fn test_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = store(temp_dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let selector = Selector::parse("any(t, x>0)", &PROPS, &axis()).unwrap();
        assert!(matches!(selector.evaluate(&mut s, 2, &cancel), Err(Error::Cancelled)));
    }
}
