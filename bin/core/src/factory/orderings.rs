//! Index orderings for combination and permutation factories.
//! Both enumerate in positional lexicographic order over the
//! source iterable, matching the documented expansion order.

/// Length-r combinations of `0..n`, optionally with
/// replacement.
pub fn combinations(
  n: usize,
  r: usize,
  with_replacement: bool,
) -> Vec<Vec<usize>> {
  let mut out = Vec::new();
  if r == 0 {
    out.push(Vec::new());
    return out;
  }
  if n == 0 {
    return out;
  }
  let mut indices: Vec<usize> = if with_replacement {
    vec![0; r]
  } else {
    if r > n {
      return out;
    }
    (0..r).collect()
  };
  loop {
    out.push(indices.clone());
    // Find the right-most index that can still advance.
    let mut i = r;
    loop {
      if i == 0 {
        return out;
      }
      i -= 1;
      let max = if with_replacement { n - 1 } else { i + n - r };
      if indices[i] < max {
        break;
      }
    }
    indices[i] += 1;
    for j in i + 1..r {
      indices[j] = if with_replacement {
        indices[i]
      } else {
        indices[j - 1] + 1
      };
    }
  }
}

/// Length-r permutations of `0..n` in lexicographic order.
pub fn permutations(n: usize, r: usize) -> Vec<Vec<usize>> {
  let mut out = Vec::new();
  if r > n {
    return out;
  }
  let mut current = Vec::with_capacity(r);
  let mut used = vec![false; n];
  fn descend(
    n: usize,
    r: usize,
    current: &mut Vec<usize>,
    used: &mut Vec<bool>,
    out: &mut Vec<Vec<usize>>,
  ) {
    if current.len() == r {
      out.push(current.clone());
      return;
    }
    for i in 0..n {
      if used[i] {
        continue;
      }
      used[i] = true;
      current.push(i);
      descend(n, r, current, used, out);
      current.pop();
      used[i] = false;
    }
  }
  descend(n, r, &mut current, &mut used, &mut out);
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn combinations_lexicographic() {
    assert_eq!(
      combinations(3, 2, false),
      vec![vec![0, 1], vec![0, 2], vec![1, 2]]
    );
  }

  #[test]
  fn combinations_with_replacement_lexicographic() {
    assert_eq!(
      combinations(2, 2, true),
      vec![vec![0, 0], vec![0, 1], vec![1, 1]]
    );
  }

  #[test]
  fn combinations_oversized_is_empty() {
    assert!(combinations(2, 3, false).is_empty());
    assert_eq!(combinations(2, 3, true).len(), 4);
  }

  #[test]
  fn permutations_lexicographic() {
    assert_eq!(
      permutations(3, 2),
      vec![
        vec![0, 1],
        vec![0, 2],
        vec![1, 0],
        vec![1, 2],
        vec![2, 0],
        vec![2, 1],
      ]
    );
  }
}
