//! Minimum-cost bipartite assignment (Hungarian / Kuhn-Munkres).

/// Cost at or above which a pairing is considered forbidden.
pub const FORBIDDEN: f64 = 1.0e6;

/// Solve a rectangular assignment problem.
///
/// Returns, for every row, the column it was assigned to. Rows left without
/// a column (more rows than columns) or assigned a forbidden cell map to
/// `None`. Identical inputs always produce identical assignments.
pub fn solve(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let rows = cost.len();
    let cols = cost.first().map(|r| r.len()).unwrap_or(0);
    if rows == 0 || cols == 0 {
        return vec![None; rows];
    }
    let assignment = if rows <= cols {
        solve_wide(cost, rows, cols)
    } else {
        let transposed: Vec<Vec<f64>> = (0..cols)
            .map(|c| (0..rows).map(|r| cost[r][c]).collect())
            .collect();
        let by_col = solve_wide(&transposed, cols, rows);
        let mut by_row = vec![None; rows];
        for (c, r) in by_col.into_iter().enumerate() {
            if let Some(r) = r {
                by_row[r] = Some(c);
            }
        }
        by_row
    };
    assignment
        .into_iter()
        .enumerate()
        .map(|(r, c)| c.filter(|c| cost[r][*c] < FORBIDDEN))
        .collect()
}

/// Potentials-based O(n^2 m) solver for `n <= m`.
fn solve_wide(cost: &[Vec<f64>], n: usize, m: usize) -> Vec<Option<usize>> {
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    // p[j]: row (1-based) matched to column j; way[j]: previous column on the augmenting path.
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = vec![None; n];
    for j in 1..=m {
        if p[j] != 0 {
            result[p[j] - 1] = Some(j - 1);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(cost: &[Vec<f64>], assignment: &[Option<usize>]) -> f64 {
        assignment
            .iter()
            .enumerate()
            .filter_map(|(r, c)| c.map(|c| cost[r][c]))
            .sum()
    }

    #[test]
    fn finds_optimum_where_greedy_fails() {
        // Greedy takes (0,0)=1 and is then forced into (1,1)=10.
        let cost = vec![vec![1.0, 2.0], vec![2.0, 10.0]];
        let a = solve(&cost);
        assert_eq!(a, vec![Some(1), Some(0)]);
        assert_eq!(total(&cost, &a), 4.0);
    }

    #[test]
    fn handles_more_rows_than_columns() {
        let cost = vec![vec![0.9], vec![0.1], vec![0.5]];
        assert_eq!(solve(&cost), vec![None, Some(0), None]);
    }

    #[test]
    fn handles_more_columns_than_rows() {
        let cost = vec![vec![0.8, 0.2, 0.5]];
        assert_eq!(solve(&cost), vec![Some(1)]);
    }

    #[test]
    fn forbidden_cells_are_never_assigned() {
        let cost = vec![vec![FORBIDDEN, FORBIDDEN], vec![0.3, FORBIDDEN]];
        assert_eq!(solve(&cost), vec![None, Some(0)]);
    }

    #[test]
    fn empty_inputs() {
        assert!(solve(&[]).is_empty());
        assert_eq!(solve(&[vec![], vec![]]), vec![None, None]);
    }
}
