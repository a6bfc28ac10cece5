/// A static spatial index over 2-D points, laid out as a flat, implicitly
/// balanced KD-tree.
///
/// The tree is built once over a fixed set of points and answers rectangle
/// and radius queries afterwards; there is no insertion or removal. Points
/// are referenced by their position in the input sequence, so query results
/// are indices into whatever collection the caller built the tree from.
#[derive(Clone, Debug, Default)]
pub struct KDTree {
    /// Leaf bucket capacity. Larger buckets build faster and query slower.
    node_size: usize,

    /// Permutation mapping tree slots back to input positions.
    ids: Vec<usize>,

    /// Interleaved x/y coordinates, ordered to match `ids`.
    coords: Vec<f64>,
}

impl KDTree {
    /// Build an index over the given points.
    ///
    /// The input order defines the indices later returned by queries.
    pub fn build<I>(points: I, node_size: usize) -> Self
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut coords = Vec::new();

        for (x, y) in points {
            coords.push(x);
            coords.push(y);
        }

        let count = coords.len() / 2;
        let mut tree = KDTree {
            node_size: node_size.max(1),
            ids: (0..count).collect(),
            coords,
        };

        if count > 1 {
            tree.balance(0, count - 1, 0);
        }

        tree
    }

    /// Indices of all points with `min_x <= x <= max_x` and
    /// `min_y <= y <= max_y`. Both bounds are inclusive; result order is
    /// unspecified.
    pub fn range(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<usize> {
        let mut found = Vec::new();

        if self.ids.is_empty() {
            return found;
        }

        let mut stack = vec![(0, self.ids.len() - 1, 0)];

        while let Some((left, right, axis)) = stack.pop() {
            if right - left <= self.node_size {
                for i in left..=right {
                    let x = self.coords[2 * i];
                    let y = self.coords[2 * i + 1];

                    if x >= min_x && x <= max_x && y >= min_y && y <= max_y {
                        found.push(self.ids[i]);
                    }
                }
                continue;
            }

            let m = (left + right) >> 1;
            let x = self.coords[2 * m];
            let y = self.coords[2 * m + 1];

            if x >= min_x && x <= max_x && y >= min_y && y <= max_y {
                found.push(self.ids[m]);
            }

            if (axis == 0 && min_x <= x) || (axis == 1 && min_y <= y) {
                stack.push((left, m - 1, 1 - axis));
            }
            if (axis == 0 && max_x >= x) || (axis == 1 && max_y >= y) {
                stack.push((m + 1, right, 1 - axis));
            }
        }

        found
    }

    /// Indices of all points strictly closer than `radius` to `(qx, qy)`.
    ///
    /// The inequality is strict: a point at exactly `radius` is not
    /// returned. The query location itself is returned when it coincides
    /// with a stored point. Result order is unspecified.
    pub fn within(&self, qx: f64, qy: f64, radius: f64) -> Vec<usize> {
        let mut found = Vec::new();

        if self.ids.is_empty() || radius <= 0.0 {
            return found;
        }

        let r2 = radius * radius;
        let mut stack = vec![(0, self.ids.len() - 1, 0)];

        while let Some((left, right, axis)) = stack.pop() {
            if right - left <= self.node_size {
                for i in left..=right {
                    let x = self.coords[2 * i];
                    let y = self.coords[2 * i + 1];

                    if sq_dist(x, y, qx, qy) < r2 {
                        found.push(self.ids[i]);
                    }
                }
                continue;
            }

            let m = (left + right) >> 1;
            let x = self.coords[2 * m];
            let y = self.coords[2 * m + 1];

            if sq_dist(x, y, qx, qy) < r2 {
                found.push(self.ids[m]);
            }

            if (axis == 0 && qx - radius <= x) || (axis == 1 && qy - radius <= y) {
                stack.push((left, m - 1, 1 - axis));
            }
            if (axis == 0 && qx + radius >= x) || (axis == 1 && qy + radius >= y) {
                stack.push((m + 1, right, 1 - axis));
            }
        }

        found
    }

    /// Recursively partition `[left, right]` around its median along the
    /// given axis, alternating axes, until buckets fit `node_size`.
    fn balance(&mut self, left: usize, right: usize, axis: usize) {
        if right - left <= self.node_size {
            return;
        }

        let m = (left + right) >> 1;

        self.select(m, left, right, axis);

        self.balance(left, m - 1, 1 - axis);
        self.balance(m + 1, right, 1 - axis);
    }

    /// Floyd-Rivest selection: place the k-th smallest element along `axis`
    /// at position `k`, with smaller elements to its left and larger ones to
    /// its right.
    fn select(&mut self, k: usize, mut left: usize, mut right: usize, axis: usize) {
        while right > left {
            if right - left > 600 {
                let n = (right - left + 1) as f64;
                let m = (k - left + 1) as f64;
                let z = n.ln();
                let s = 0.5 * (2.0 * z / 3.0).exp();
                let sign = if m - n / 2.0 < 0.0 { -1.0 } else { 1.0 };
                let sd = 0.5 * (z * s * (n - s) / n).sqrt() * sign;
                let kf = k as f64;

                let new_left = left.max((kf - m * s / n + sd).floor() as usize);
                let new_right = right.min((kf + (n - m) * s / n + sd).floor() as usize);

                self.select(k, new_left, new_right, axis);
            }

            let t = self.coords[2 * k + axis];
            let mut i = left;
            let mut j = right;

            self.swap(left, k);
            if self.coords[2 * right + axis] > t {
                self.swap(left, right);
            }

            while i < j {
                self.swap(i, j);
                i += 1;
                j -= 1;

                while self.coords[2 * i + axis] < t {
                    i += 1;
                }
                while self.coords[2 * j + axis] > t {
                    j -= 1;
                }
            }

            if self.coords[2 * left + axis] == t {
                self.swap(left, j);
            } else {
                j += 1;
                self.swap(j, right);
            }

            if j <= k {
                left = j + 1;
            }
            if k <= j {
                right = j - 1;
            }
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.ids.swap(a, b);
        self.coords.swap(2 * a, 2 * b);
        self.coords.swap(2 * a + 1, 2 * b + 1);
    }
}

fn sq_dist(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let dx = ax - bx;
    let dy = ay - by;

    dx * dx + dy * dy
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cloud(count: usize, seed: u64) -> Vec<(f64, f64)> {
        let mut rng = StdRng::seed_from_u64(seed);

        (0..count)
            .map(|_| (rng.gen_range(0.0..100.0), rng.gen_range(0.0..100.0)))
            .collect()
    }

    fn brute_range(
        points: &[(f64, f64)],
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    ) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.0 >= min_x && p.0 <= max_x && p.1 >= min_y && p.1 <= max_y)
            .map(|(i, _)| i)
            .collect()
    }

    fn brute_within(points: &[(f64, f64)], qx: f64, qy: f64, radius: f64) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| sq_dist(p.0, p.1, qx, qy) < radius * radius)
            .map(|(i, _)| i)
            .collect()
    }

    fn sorted(mut ids: Vec<usize>) -> Vec<usize> {
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_empty_tree() {
        let tree = KDTree::build(std::iter::empty(), 64);

        assert!(tree.ids.is_empty());
        assert!(tree.range(0.0, 0.0, 100.0, 100.0).is_empty());
        assert!(tree.within(50.0, 50.0, 10.0).is_empty());
    }

    #[test]
    fn test_single_point() {
        let tree = KDTree::build(vec![(4.0, 8.0)], 64);

        assert_eq!(tree.range(0.0, 0.0, 10.0, 10.0), vec![0]);
        assert_eq!(tree.within(4.0, 8.0, 0.5), vec![0]);
        assert!(tree.range(5.0, 0.0, 10.0, 10.0).is_empty());
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let points = vec![(0.0, 0.0), (3.0, 4.0), (3.0, 5.0)];
        let tree = KDTree::build(points, 2);

        assert_eq!(sorted(tree.range(0.0, 0.0, 3.0, 4.0)), vec![0, 1]);
    }

    #[test]
    fn test_within_is_strict_at_the_boundary() {
        // (3, 4) sits at distance exactly 5 from the origin.
        let points = vec![(0.0, 0.0), (3.0, 4.0), (1.0, 1.0)];
        let tree = KDTree::build(points, 2);

        assert_eq!(sorted(tree.within(0.0, 0.0, 5.0)), vec![0, 2]);
        assert_eq!(sorted(tree.within(0.0, 0.0, 5.001)), vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicate_points_are_all_returned() {
        let points = vec![(2.0, 2.0), (2.0, 2.0), (2.0, 2.0), (9.0, 9.0)];
        let tree = KDTree::build(points, 1);

        assert_eq!(sorted(tree.range(1.0, 1.0, 3.0, 3.0)), vec![0, 1, 2]);
        assert_eq!(sorted(tree.within(2.0, 2.0, 0.1)), vec![0, 1, 2]);
    }

    #[test]
    fn test_range_matches_linear_scan() {
        let points = cloud(200, 7);
        let tree = KDTree::build(points.iter().copied(), 4);

        let queries = [
            (10.0, 10.0, 40.0, 70.0),
            (0.0, 0.0, 100.0, 100.0),
            (55.5, 20.0, 56.0, 90.0),
            (80.0, 80.0, 81.0, 81.0),
        ];

        for (min_x, min_y, max_x, max_y) in queries {
            assert_eq!(
                sorted(tree.range(min_x, min_y, max_x, max_y)),
                brute_range(&points, min_x, min_y, max_x, max_y),
            );
        }
    }

    #[test]
    fn test_within_matches_linear_scan() {
        let points = cloud(200, 11);
        let tree = KDTree::build(points.iter().copied(), 4);

        let queries = [
            (50.0, 50.0, 20.0),
            (0.0, 0.0, 140.0),
            (33.0, 90.0, 5.0),
            (70.0, 10.0, 0.01),
        ];

        for (qx, qy, radius) in queries {
            assert_eq!(
                sorted(tree.within(qx, qy, radius)),
                brute_within(&points, qx, qy, radius),
            );
        }
    }

    #[test]
    fn test_large_bucket_degenerates_to_scan() {
        // node_size beyond the input size keeps everything in one leaf.
        let points = cloud(50, 3);
        let tree = KDTree::build(points.iter().copied(), 128);

        assert_eq!(
            sorted(tree.range(20.0, 20.0, 60.0, 60.0)),
            brute_range(&points, 20.0, 20.0, 60.0, 60.0),
        );
    }
}
