//! Placement of new partitions
//!
//! Drivers compute the free runs a new partition may use; the planner picks
//! the partition number, start and end inside them, asking the dialog handler
//! for whatever the caller left out.

use crate::context::Disk;
use crate::label::LabelOps;
use disklabel_core::{AlignDirection, Ask, Error, NumberAsk, Partition, Result, Topology};

/// Boundary rule a driver places partitions on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grid {
    /// Alignment grain of the device
    Grain,
    /// Whole cylinders; the first cylinder may start after `track` sectors
    Cylinder { spc: u64, track: u64 },
    /// Any sector
    Exact,
}

impl Grid {
    pub(crate) fn up(&self, topo: &Topology, lba: u64) -> u64 {
        match *self {
            Grid::Grain => topo.align_lba(lba, AlignDirection::Up),
            Grid::Cylinder { spc, track } => {
                if lba <= track {
                    track
                } else if spc == 0 {
                    lba
                } else {
                    lba.div_ceil(spc) * spc
                }
            }
            Grid::Exact => lba,
        }
    }

    pub(crate) fn down(&self, topo: &Topology, lba: u64) -> u64 {
        match *self {
            Grid::Grain => topo.align_lba(lba, AlignDirection::Down),
            Grid::Cylinder { spc, .. } if spc != 0 => lba / spc * spc,
            _ => lba,
        }
    }
}

/// First free run with room for an aligned start, and that start
fn default_start(topo: &Topology, free: &[(u64, u64)], grid: Grid) -> Option<(u64, usize)> {
    free.iter().enumerate().find_map(|(i, &(s, e))| {
        let start = grid.up(topo, s);
        (start <= e).then_some((start, i))
    })
}

fn run_containing(free: &[(u64, u64)], lba: u64) -> Option<usize> {
    free.iter().position(|&(s, e)| s <= lba && lba <= e)
}

/// Pick start and end of a new partition inside `free`
///
/// A template without a start (or with `start_follow_default`) takes the
/// first aligned free sector; one without size or end takes the rest of
/// that free run, rounded down to the grid. With no template at all both
/// values are asked for.
pub(crate) fn place(
    disk: &Disk,
    free: &[(u64, u64)],
    pa: Option<&Partition>,
    grid: Grid,
) -> Result<(u64, u64)> {
    let topo = disk.topology();
    if free.is_empty() {
        return Err(Error::no_space("no free sectors available"));
    }

    let (start, run) = match pa {
        Some(pa) if !pa.start_is_default() => {
            let start = pa.start.unwrap_or_default();
            let run = run_containing(free, start).ok_or_else(|| {
                Error::out_of_range(format!("sector {} is already allocated", start))
            })?;
            (start, run)
        }
        Some(_) => default_start(topo, free, grid)
            .ok_or_else(|| Error::no_space("no free sectors available"))?,
        None => {
            let (dflt, _) = default_start(topo, free, grid)
                .ok_or_else(|| Error::no_space("no free sectors available"))?;
            let low = free[0].0;
            let high = free[free.len() - 1].1;
            let start = disk.ask_number("First sector", low, dflt, high)?;
            match run_containing(free, start) {
                Some(run) => (start, run),
                None => {
                    disk.warnx(format!("Sector {} is already allocated.", start));
                    return Err(Error::out_of_range(format!(
                        "sector {} is already allocated",
                        start
                    )));
                }
            }
        }
    };

    let limit = free[run].1;
    let aligned_end = grid.down(topo, limit.saturating_add(1)).saturating_sub(1);
    let dflt_end = if aligned_end > start { aligned_end } else { limit };

    let end = match pa {
        Some(pa) if !pa.end_is_default() => {
            let end = match (pa.has_explicit_size(), pa.size(), pa.end()) {
                (true, Some(0), _) => {
                    return Err(Error::invalid_argument("partition size must not be zero"))
                }
                (true, Some(size), _) => start.saturating_add(size - 1),
                (_, _, Some(end)) => end,
                _ => dflt_end,
            };
            if end < start {
                return Err(Error::out_of_range(format!(
                    "last sector {} is before first sector {}",
                    end, start
                )));
            }
            if end > limit {
                return Err(Error::out_of_range(format!(
                    "last sector {} is beyond the free area ending at {}",
                    end, limit
                )));
            }
            end
        }
        Some(_) => dflt_end,
        None => {
            let (result, relative) = disk.ask_offset(
                "Last sector, +sectors or +size{K,M,G,T,P}",
                start,
                dflt_end,
                limit,
                start,
                topo.sector_size,
            )?;
            if relative {
                let aligned = match grid {
                    Grid::Grain => topo
                        .align_lba_in_range(result, start, limit)
                        .unwrap_or(result),
                    _ => result,
                };
                aligned.saturating_sub(1).max(start)
            } else {
                result
            }
        }
    };

    tracing::debug!(start, end, ?grid, "placed partition");
    Ok((start, end))
}

/// Partition number for a new partition
///
/// A template with `partno_follow_default` or without a number takes the
/// lowest free slot; an explicit number must be a valid slot. Without a
/// template the number is asked for.
pub(crate) fn next_partno<L: LabelOps + ?Sized>(
    lb: &L,
    disk: &Disk,
    pa: Option<&Partition>,
) -> Result<usize> {
    let max = lb.state().nparts_max;
    match pa {
        Some(pa) if !pa.partno_follow_default && pa.partno.is_some() => {
            let n = pa.partno.unwrap_or_default();
            if n >= max {
                return Err(Error::out_of_range(format!(
                    "partition number {} out of range (1-{})",
                    n + 1,
                    max
                )));
            }
            Ok(n)
        }
        Some(_) => (0..max)
            .find(|&n| !lb.part_is_used(n))
            .ok_or_else(|| Error::no_space("all partitions are in use")),
        None => ask_partnum(lb, disk, true),
    }
}

/// Compress sorted numbers into `1-4,6` (or `a-d,f`) form
fn range_text(nums: &[usize], inchars: bool) -> String {
    let show = |n: usize| {
        if inchars {
            char::from(b'a' + (n % 26) as u8).to_string()
        } else {
            (n + 1).to_string()
        }
    };
    let mut out = Vec::new();
    let mut i = 0;
    while i < nums.len() {
        let mut j = i;
        while j + 1 < nums.len() && nums[j + 1] == nums[j] + 1 {
            j += 1;
        }
        out.push(if i == j {
            show(nums[i])
        } else {
            format!("{}-{}", show(nums[i]), show(nums[j]))
        });
        i = j + 1;
    }
    out.join(",")
}

/// Ask for a partition number; unused ones if `wantnew`, used ones otherwise
pub(crate) fn ask_partnum<L: LabelOps + ?Sized>(lb: &L, disk: &Disk, wantnew: bool) -> Result<usize> {
    let candidates: Vec<usize> = (0..lb.state().nparts_max)
        .filter(|&n| lb.part_is_used(n) != wantnew)
        .collect();
    let (Some(&first), Some(&last)) = (candidates.first(), candidates.last()) else {
        return Err(if wantnew {
            Error::no_space("all partitions are in use")
        } else {
            Error::not_found("no partition is defined yet")
        });
    };

    if !wantnew && candidates.len() == 1 {
        disk.info(format!("Selected partition {}", first + 1));
        return Ok(first);
    }

    let inchars = lb.inchars_partno();
    let shift = usize::from(!inchars);
    let mut num = NumberAsk::new("Partition number")
        .with_range((first + shift) as u64, (last + shift) as u64)
        .with_default((first + shift) as u64)
        .with_range_text(range_text(&candidates, inchars));
    if inchars {
        num = num.inchars();
    }
    let mut ask = Ask::Number(num);
    disk.ask(&mut ask)?;
    let answer = ask.number().map_or(first + shift, |n| n.result as usize);
    let n = answer.saturating_sub(shift);

    if candidates.contains(&n) {
        return Ok(n);
    }
    if wantnew {
        disk.warnx(format!("Partition {} is already defined.", n + 1));
        Err(Error::duplicate(format!("partition {} is already defined", n + 1)))
    } else {
        disk.warnx(format!("Partition {} does not exist yet!", n + 1));
        Err(Error::not_found(format!("partition {} is not used", n + 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_rounding() {
        let topo = Topology::for_image(512 * 1024 * 1024, 512);
        let grain = Grid::Grain;
        assert_eq!(grain.up(&topo, 34), 2048);
        assert_eq!(grain.up(&topo, 2049), 4096);
        assert_eq!(grain.down(&topo, 5000), 4096);

        let cyl = Grid::Cylinder { spc: 16065, track: 63 };
        assert_eq!(cyl.up(&topo, 1), 63);
        assert_eq!(cyl.up(&topo, 63), 63);
        assert_eq!(cyl.up(&topo, 64), 16065);
        assert_eq!(cyl.down(&topo, 16066), 16065);

        assert_eq!(Grid::Exact.up(&topo, 35), 35);
    }

    #[test]
    fn test_range_text() {
        assert_eq!(range_text(&[0, 1, 2, 3, 5], false), "1-4,6");
        assert_eq!(range_text(&[0, 1, 3], true), "a-b,d");
        assert_eq!(range_text(&[2], false), "3");
    }
}
