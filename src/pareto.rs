//! Multi-objective utilities: dominance, fronts, crowding, ideal and nadir.
//!
//! All routines minimise every objective and operate on slices of objective
//! vectors; indices returned refer to positions in the input slice.

/// Whether `a` Pareto-dominates `b` (no worse everywhere, better somewhere).
#[must_use]
pub fn dominates(a: &[f64], b: &[f64]) -> bool {
    let mut strictly_better = false;
    for (x, y) in a.iter().zip(b) {
        if x > y {
            return false;
        }
        if x < y {
            strictly_better = true;
        }
    }
    strictly_better
}

/// Partition objective vectors into non-domination fronts, outermost first.
#[must_use]
pub fn fast_non_dominated_sorting(points: &[Vec<f64>]) -> Vec<Vec<usize>> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];
    let mut fronts: Vec<Vec<usize>> = vec![Vec::new()];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if dominates(&points[i], &points[j]) {
                dominated_by[i].push(j);
            } else if dominates(&points[j], &points[i]) {
                domination_count[i] += 1;
            }
        }
        if domination_count[i] == 0 {
            fronts[0].push(i);
        }
    }
    let mut current = 0;
    while !fronts[current].is_empty() {
        let mut next = Vec::new();
        for &i in &fronts[current] {
            for &j in &dominated_by[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        fronts.push(next);
        current += 1;
    }
    fronts.pop();
    fronts
}

/// Crowding distances for the members of a single front.
///
/// Boundary members of every objective get an infinite distance; interior
/// members accumulate normalised neighbour gaps.
#[must_use]
pub fn crowding_distance(front: &[Vec<f64>]) -> Vec<f64> {
    let n = front.len();
    let mut distance = vec![0.0; n];
    if n == 0 {
        return distance;
    }
    let n_obj = front[0].len();
    if n <= 2 {
        return vec![f64::INFINITY; n];
    }
    for obj in 0..n_obj {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| front[a][obj].total_cmp(&front[b][obj]));
        distance[order[0]] = f64::INFINITY;
        distance[order[n - 1]] = f64::INFINITY;
        let span = front[order[n - 1]][obj] - front[order[0]][obj];
        if span == 0.0 {
            continue;
        }
        for w in 1..n - 1 {
            distance[order[w]] += (front[order[w + 1]][obj] - front[order[w - 1]][obj]) / span;
        }
    }
    distance
}

/// Indices of the best `n` objective vectors under non-dominated sorting with
/// a crowding-distance tie break on the last front taken.
#[must_use]
pub fn select_best_n_mo(points: &[Vec<f64>], n: usize) -> Vec<usize> {
    let mut selected = Vec::with_capacity(n);
    for front in fast_non_dominated_sorting(points) {
        if selected.len() + front.len() <= n {
            selected.extend_from_slice(&front);
            if selected.len() == n {
                break;
            }
        } else {
            let members: Vec<Vec<f64>> = front.iter().map(|&i| points[i].clone()).collect();
            let distance = crowding_distance(&members);
            let mut order: Vec<usize> = (0..front.len()).collect();
            order.sort_by(|&a, &b| distance[b].total_cmp(&distance[a]));
            for &w in order.iter().take(n - selected.len()) {
                selected.push(front[w]);
            }
            break;
        }
    }
    selected
}

/// Coordinate-wise minimum over all objective vectors.
#[must_use]
pub fn ideal(points: &[Vec<f64>]) -> Vec<f64> {
    let Some(first) = points.first() else {
        return Vec::new();
    };
    let mut out = first.clone();
    for p in &points[1..] {
        for (o, v) in out.iter_mut().zip(p) {
            if v < o {
                *o = *v;
            }
        }
    }
    out
}

/// Coordinate-wise maximum over the non-dominated front.
#[must_use]
pub fn nadir(points: &[Vec<f64>]) -> Vec<f64> {
    let fronts = fast_non_dominated_sorting(points);
    let Some(front) = fronts.first() else {
        return Vec::new();
    };
    let mut out = points[front[0]].clone();
    for &i in &front[1..] {
        for (o, v) in out.iter_mut().zip(&points[i]) {
            if v > o {
                *o = *v;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Vec<f64>> {
        vec![
            vec![1.0, 5.0], // front 0
            vec![2.0, 3.0], // front 0
            vec![4.0, 1.0], // front 0
            vec![3.0, 4.0], // dominated by [2, 3]
            vec![5.0, 5.0], // dominated by everything above
        ]
    }

    #[test]
    fn test_dominates() {
        assert!(dominates(&[1.0, 2.0], &[2.0, 3.0]));
        assert!(dominates(&[1.0, 3.0], &[2.0, 3.0]));
        assert!(!dominates(&[1.0, 2.0], &[1.0, 2.0]));
        assert!(!dominates(&[1.0, 4.0], &[2.0, 3.0]));
    }

    #[test]
    fn test_fronts() {
        let fronts = fast_non_dominated_sorting(&sample());
        assert_eq!(fronts.len(), 3);
        assert_eq!(fronts[0], vec![0, 1, 2]);
        assert_eq!(fronts[1], vec![3]);
        assert_eq!(fronts[2], vec![4]);
    }

    #[test]
    fn test_crowding_boundaries_are_infinite() {
        let front = vec![vec![1.0, 5.0], vec![2.0, 3.0], vec![4.0, 1.0]];
        let d = crowding_distance(&front);
        assert!(d[0].is_infinite());
        assert!(d[2].is_infinite());
        assert!(d[1].is_finite());
    }

    #[test]
    fn test_select_best_n() {
        let best = select_best_n_mo(&sample(), 4);
        assert_eq!(best.len(), 4);
        assert!(best.contains(&0) && best.contains(&1) && best.contains(&2));
        assert!(best.contains(&3));
        // Truncation inside the first front keeps the extremes.
        let best = select_best_n_mo(&sample(), 2);
        assert_eq!(best.len(), 2);
        assert!(best.contains(&0) && best.contains(&2));
    }

    #[test]
    fn test_ideal_and_nadir() {
        let points = sample();
        assert_eq!(ideal(&points), vec![1.0, 1.0]);
        // The nadir ignores dominated points.
        assert_eq!(nadir(&points), vec![4.0, 5.0]);
    }
}
