//! Ordered partition collection

use crate::error::{Error, Result};
use crate::partition::{cmp_start, Partition};
use serde::Serialize;
use std::cmp::Ordering;

/// Iteration direction for [`TableIter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Ordered collection of partitions
///
/// Entries need not be in partition number or start order. Used entries
/// never share a partition number.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Table {
    parts: Vec<Partition>,
    #[serde(skip)]
    generation: u64,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Drop every entry
    pub fn reset(&mut self) {
        self.parts.clear();
        self.touch();
    }

    fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// Append a partition
    pub fn add_partition(&mut self, pa: Partition) -> Result<()> {
        if pa.used {
            if let Some(n) = pa.partno {
                if self.parts.iter().any(|p| p.used && p.partno == Some(n)) {
                    return Err(Error::duplicate(format!("partition {} already in table", n + 1)));
                }
            }
        }
        tracing::trace!(partition = %pa, "table: add");
        self.parts.push(pa);
        self.touch();
        Ok(())
    }

    /// Remove and return the entry at `index`
    pub fn remove_partition(&mut self, index: usize) -> Result<Partition> {
        if index >= self.parts.len() {
            return Err(Error::not_found(format!("table entry {}", index)));
        }
        self.touch();
        Ok(self.parts.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&Partition> {
        self.parts.get(index)
    }

    /// Mutable access; invalidates outstanding cursors
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Partition> {
        self.touch();
        self.parts.get_mut(index)
    }

    /// First entry with the given partition number
    pub fn get_by_partno(&self, partno: usize) -> Option<&Partition> {
        self.parts.iter().find(|p| p.partno == Some(partno))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Partition> {
        self.parts.iter()
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.parts
    }

    pub fn into_partitions(self) -> Vec<Partition> {
        self.parts
    }

    /// Number of used entries
    pub fn nused(&self) -> usize {
        self.parts.iter().filter(|p| p.used).count()
    }

    /// Sort with a caller supplied comparator (stable)
    pub fn sort_partitions<F>(&mut self, cmp: F)
    where
        F: FnMut(&Partition, &Partition) -> Ordering,
    {
        self.parts.sort_by(cmp);
        self.touch();
    }

    /// True if some entry starts before an entry preceding it
    pub fn wrong_order(&self) -> bool {
        let mut last: Option<u64> = None;
        for pa in &self.parts {
            let Some(start) = pa.start else { continue };
            if last.is_some_and(|l| start < l) {
                return true;
            }
            last = Some(start);
        }
        false
    }

    /// Sort by start offset
    pub fn sort_by_start(&mut self) {
        self.sort_partitions(cmp_start);
    }

    /// Unused ranges within `[lo, hi]`, in order
    ///
    /// Only entries for which `occupies` returns true are considered.
    pub fn free_ranges<F>(&self, lo: u64, hi: u64, occupies: F) -> Vec<(u64, u64)>
    where
        F: Fn(&Partition) -> bool,
    {
        free_runs(
            lo,
            hi,
            self.parts
                .iter()
                .filter(|p| occupies(p))
                .filter_map(|p| Some((p.start?, p.end()?))),
        )
    }

    /// Cursor over the table
    pub fn cursor(&self, direction: Direction) -> TableIter {
        TableIter {
            direction,
            pos: 0,
            generation: self.generation,
        }
    }
}

/// Gaps between the inclusive `used` ranges within `[lo, hi]`
pub fn free_runs<I>(lo: u64, hi: u64, used: I) -> Vec<(u64, u64)>
where
    I: IntoIterator<Item = (u64, u64)>,
{
    let mut used: Vec<(u64, u64)> = used.into_iter().collect();
    used.sort_unstable();

    let mut free = Vec::new();
    let mut cursor = lo;
    for (start, end) in used {
        if end < cursor {
            continue;
        }
        if start > cursor {
            let stop = (start - 1).min(hi);
            if stop >= cursor {
                free.push((cursor, stop));
            }
        }
        cursor = cursor.max(end.saturating_add(1));
        if cursor > hi {
            return free;
        }
    }
    if cursor <= hi {
        free.push((cursor, hi));
    }
    free
}

impl From<Vec<Partition>> for Table {
    fn from(parts: Vec<Partition>) -> Self {
        Self {
            parts,
            generation: 0,
        }
    }
}

impl<'a> IntoIterator for &'a Table {
    type Item = &'a Partition;
    type IntoIter = std::slice::Iter<'a, Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.iter()
    }
}

/// External cursor over a [`Table`]
///
/// The cursor does not borrow the table; any mutation of the table after the
/// cursor was created makes further steps fail.
#[derive(Debug, Clone)]
pub struct TableIter {
    direction: Direction,
    pos: usize,
    generation: u64,
}

impl TableIter {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Step to the next entry, `Ok(None)` at the end
    pub fn next<'a>(&mut self, tb: &'a Table) -> Result<Option<&'a Partition>> {
        if tb.generation != self.generation {
            return Err(Error::invalid_operation("table modified during iteration"));
        }
        if self.pos >= tb.parts.len() {
            return Ok(None);
        }
        let idx = match self.direction {
            Direction::Forward => self.pos,
            Direction::Backward => tb.parts.len() - 1 - self.pos,
        };
        self.pos += 1;
        Ok(tb.parts.get(idx))
    }

    /// Rewind to the first entry for `direction`
    pub fn reset(&mut self, tb: &Table, direction: Direction) {
        self.direction = direction;
        self.pos = 0;
        self.generation = tb.generation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::cmp_partno;

    fn part(partno: usize, start: u64, size: u64) -> Partition {
        let mut pa = Partition::new();
        pa.set_partno(partno);
        pa.set_start(start);
        pa.set_size(size);
        pa.used = true;
        pa
    }

    #[test]
    fn test_wrong_order_and_sort() {
        let mut tb = Table::new();
        tb.add_partition(part(0, 4096, 100)).unwrap();
        tb.add_partition(part(1, 2048, 100)).unwrap();
        assert!(tb.wrong_order());

        tb.sort_partitions(cmp_start);
        assert!(!tb.wrong_order());
        assert_eq!(tb.get(0).unwrap().partno, Some(1));

        tb.sort_partitions(cmp_partno);
        assert!(tb.wrong_order());
    }

    #[test]
    fn test_duplicate_partno() {
        let mut tb = Table::new();
        tb.add_partition(part(0, 2048, 100)).unwrap();
        let err = tb.add_partition(part(0, 8192, 100)).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));

        let mut free = part(0, 8192, 100);
        free.used = false;
        free.freespace = true;
        tb.add_partition(free).unwrap();
        assert_eq!(tb.len(), 2);
        assert_eq!(tb.nused(), 1);
    }

    #[test]
    fn test_cursor() {
        let mut tb = Table::new();
        tb.add_partition(part(0, 2048, 100)).unwrap();
        tb.add_partition(part(1, 4096, 100)).unwrap();

        let mut itr = tb.cursor(Direction::Backward);
        assert_eq!(itr.next(&tb).unwrap().unwrap().partno, Some(1));
        assert_eq!(itr.next(&tb).unwrap().unwrap().partno, Some(0));
        assert!(itr.next(&tb).unwrap().is_none());

        let mut itr = tb.cursor(Direction::Forward);
        assert_eq!(itr.next(&tb).unwrap().unwrap().partno, Some(0));
        tb.remove_partition(0).unwrap();
        assert!(itr.next(&tb).is_err());

        itr.reset(&tb, Direction::Forward);
        assert_eq!(itr.next(&tb).unwrap().unwrap().partno, Some(1));
    }

    #[test]
    fn test_free_ranges() {
        let mut tb = Table::new();
        tb.add_partition(part(0, 2048, 2048)).unwrap();
        tb.add_partition(part(1, 8192, 2048)).unwrap();

        let free = tb.free_ranges(2048, 20479, |p| p.used);
        assert_eq!(free, vec![(4096, 8191), (10240, 20479)]);

        let free = tb.free_ranges(34, 1000, |p| p.used);
        assert_eq!(free, vec![(34, 1000)]);

        let free = tb.free_ranges(2048, 4095, |p| p.used);
        assert!(free.is_empty());

        assert_eq!(free_runs(0, 99, [(50, 200)]), vec![(0, 49)]);
        assert_eq!(free_runs(10, 20, []), vec![(10, 20)]);
    }
}
