use serde::{Deserialize, Serialize};

/// A template producing multiple sibling tasks from one
/// task descriptor. At most one task per job may carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFactory {
  /// N identical copies. Positional parameters carry no
  /// information: `{k}` renders as the literal decimal k.
  Repeat { count: u64 },
  /// Cartesian product of integer ranges, left-most range
  /// varying slowest.
  Product { ranges: Vec<ParametricRange> },
  /// Length-L combinations of the iterable, in positional
  /// lexicographic order.
  Combinations {
    iterable: Vec<String>,
    length: usize,
    #[serde(default)]
    with_replacement: bool,
  },
  /// Length-L permutations of the iterable, in positional
  /// lexicographic order.
  Permutations { iterable: Vec<String>, length: usize },
  /// Element-wise zip of the iterables, stopping at the
  /// shortest.
  Zip { iterables: Vec<Vec<String>> },
  /// One task per object-store entry matching include minus
  /// exclude.
  File {
    /// Storage account binding name.
    account: String,
    /// `container/prefix` remote path to enumerate.
    remote_path: String,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    /// Template for the node-local path each file lands at.
    /// Supports the same named placeholders as the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_filepath: Option<String>,
  },
}

/// Half-open integer range `[start, stop)` with step.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct ParametricRange {
  pub start: i64,
  pub stop: i64,
  pub step: i64,
}

impl ParametricRange {
  pub fn validate(&self) -> anyhow::Result<()> {
    if self.step == 0 {
      anyhow::bail!(
        "range step must be non-zero ({} -> {})",
        self.start,
        self.stop
      );
    }
    Ok(())
  }

  /// Number of values the range yields.
  pub fn len(&self) -> u64 {
    let (start, stop, step) = (self.start, self.stop, self.step);
    if step > 0 {
      if stop <= start {
        0
      } else {
        ((stop - start) as u64).div_ceil(step as u64)
      }
    } else if stop >= start {
      0
    } else {
      ((start - stop) as u64).div_ceil(step.unsigned_abs())
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
    let range = *self;
    (0..range.len())
      .map(move |i| range.start + range.step * i as i64)
  }
}

impl TaskFactory {
  /// Closed-form cardinality of the expansion, when it can be
  /// computed without consulting external storage. File
  /// factories return None.
  pub fn cardinality(&self) -> Option<u64> {
    match self {
      TaskFactory::Repeat { count } => Some(*count),
      TaskFactory::Product { ranges } => {
        Some(ranges.iter().map(ParametricRange::len).product())
      }
      TaskFactory::Combinations {
        iterable,
        length,
        with_replacement,
      } => {
        let n = iterable.len() as u64;
        let k = *length as u64;
        if *with_replacement {
          Some(binomial(n + k.saturating_sub(1), k))
        } else if k > n {
          Some(0)
        } else {
          Some(binomial(n, k))
        }
      }
      TaskFactory::Permutations { iterable, length } => {
        let n = iterable.len() as u64;
        let k = *length as u64;
        if k > n {
          Some(0)
        } else {
          Some(((n - k + 1)..=n).product())
        }
      }
      TaskFactory::Zip { iterables } => Some(
        iterables
          .iter()
          .map(|iterable| iterable.len() as u64)
          .min()
          .unwrap_or(0),
      ),
      TaskFactory::File { .. } => None,
    }
  }
}

fn binomial(n: u64, k: u64) -> u64 {
  if k > n {
    return 0;
  }
  let k = k.min(n - k);
  let mut result: u64 = 1;
  for i in 0..k {
    result = result * (n - i) / (i + 1);
  }
  result
}
