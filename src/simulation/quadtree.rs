//! Quadtree for Barnes–Hut approximation and neighbor queries

const LEAF_CAPACITY: usize = 8;
const MAX_DEPTH: usize = 16;

/// Square region of layout space
#[derive(Debug, Clone, Copy)]
pub(super) struct Bounds {
    pub(super) cx: f64,
    pub(super) cy: f64,
    pub(super) half: f64,
}

impl Bounds {
    fn from_points(points: &[[f64; 2]], members: &[usize]) -> Option<Self> {
        let mut min = [f64::INFINITY; 2];
        let mut max = [f64::NEG_INFINITY; 2];
        for &index in members {
            let [x, y] = points[index];
            min[0] = min[0].min(x);
            min[1] = min[1].min(y);
            max[0] = max[0].max(x);
            max[1] = max[1].max(y);
        }
        if !min.iter().chain(max.iter()).all(|v| v.is_finite()) {
            return None;
        }

        let span = (max[0] - min[0]).max(max[1] - min[1]).max(1.0);
        Some(Self {
            cx: (min[0] + max[0]) * 0.5,
            cy: (min[1] + max[1]) * 0.5,
            half: span * 0.5 + 1.0,
        })
    }

    fn child(self, quadrant: usize) -> Self {
        let quarter = self.half * 0.5;
        let (dx, dy) = match quadrant {
            0 => (-quarter, -quarter),
            1 => (quarter, -quarter),
            2 => (-quarter, quarter),
            _ => (quarter, quarter),
        };
        Self {
            cx: self.cx + dx,
            cy: self.cy + dy,
            half: quarter,
        }
    }

    fn quadrant_for(self, [x, y]: [f64; 2]) -> usize {
        match (x >= self.cx, y >= self.cy) {
            (false, false) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (true, true) => 3,
        }
    }

    pub(super) fn contains(self, [x, y]: [f64; 2]) -> bool {
        (x - self.cx).abs() <= self.half && (y - self.cy).abs() <= self.half
    }

    pub(super) fn width(self) -> f64 {
        self.half * 2.0
    }

    /// Squared distance from a point to the nearest point of the region
    fn distance_sq_to(self, [x, y]: [f64; 2]) -> f64 {
        let dx = ((x - self.cx).abs() - self.half).max(0.0);
        let dy = ((y - self.cy).abs() - self.half).max(0.0);
        dx * dx + dy * dy
    }
}

/// A quadtree cell holding either point indices (leaf) or children
#[derive(Debug)]
pub(super) struct QuadNode {
    pub(super) bounds: Bounds,
    /// Mean position of the points under this cell
    pub(super) center_of_mass: [f64; 2],
    /// Number of points under this cell
    pub(super) mass: f64,
    pub(super) indices: Vec<usize>,
    pub(super) children: [Option<Box<QuadNode>>; 4],
}

impl QuadNode {
    /// Build a tree over the given members of `points`
    pub(super) fn build(points: &[[f64; 2]], members: Vec<usize>) -> Option<Self> {
        if members.is_empty() {
            return None;
        }
        let bounds = Bounds::from_points(points, &members)?;
        Some(Self::build_node(bounds, members, points, 0))
    }

    fn build_node(bounds: Bounds, indices: Vec<usize>, points: &[[f64; 2]], depth: usize) -> Self {
        let mass = indices.len() as f64;
        let mut center_of_mass = [0.0, 0.0];
        for &index in &indices {
            center_of_mass[0] += points[index][0];
            center_of_mass[1] += points[index][1];
        }
        if mass > 0.0 {
            center_of_mass[0] /= mass;
            center_of_mass[1] /= mass;
        }

        let mut node = Self {
            bounds,
            center_of_mass,
            mass,
            indices,
            children: std::array::from_fn(|_| None),
        };
        if depth >= MAX_DEPTH || node.indices.len() <= LEAF_CAPACITY {
            return node;
        }

        let mut buckets: [Vec<usize>; 4] = std::array::from_fn(|_| Vec::new());
        for &index in &node.indices {
            buckets[bounds.quadrant_for(points[index])].push(index);
        }
        if buckets.iter().filter(|bucket| !bucket.is_empty()).count() <= 1 {
            return node;
        }

        for (quadrant, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            node.children[quadrant] = Some(Box::new(Self::build_node(
                bounds.child(quadrant),
                bucket,
                points,
                depth + 1,
            )));
        }
        node.indices.clear();
        node
    }

    pub(super) fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }

    /// Call `visit` with every point index within `radius` of `point`'s region
    ///
    /// Cells farther than `radius` are skipped whole; indices in visited
    /// leaves are passed through without an exact distance check.
    pub(super) fn for_each_near(&self, point: [f64; 2], radius: f64, visit: &mut impl FnMut(usize)) {
        if self.bounds.distance_sq_to(point) > radius * radius {
            return;
        }
        if self.is_leaf() {
            for &index in &self.indices {
                visit(index);
            }
            return;
        }
        for child in self.children.iter().flatten() {
            child.for_each_near(point, radius, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<[f64; 2]> {
        (0..n * n)
            .map(|i| [(i % n) as f64 * 10.0, (i / n) as f64 * 10.0])
            .collect()
    }

    fn count_points(node: &QuadNode) -> usize {
        node.indices.len()
            + node
                .children
                .iter()
                .flatten()
                .map(|child| count_points(child))
                .sum::<usize>()
    }

    #[test]
    fn tree_holds_every_point_once() {
        let points = grid(10);
        let tree = QuadNode::build(&points, (0..points.len()).collect()).unwrap();

        assert!(!tree.is_leaf());
        assert_eq!(tree.mass, 100.0);
        assert_eq!(count_points(&tree), 100);
    }

    #[test]
    fn center_of_mass_is_mean_position() {
        let points = vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]];
        let tree = QuadNode::build(&points, vec![0, 1, 2, 3]).unwrap();
        assert_eq!(tree.center_of_mass, [5.0, 5.0]);
        assert!(tree.bounds.contains([5.0, 5.0]));
    }

    #[test]
    fn coincident_points_stay_in_one_leaf() {
        let points = vec![[1.0, 1.0]; 20];
        let tree = QuadNode::build(&points, (0..20).collect()).unwrap();
        assert!(tree.is_leaf());
        assert_eq!(tree.indices.len(), 20);
    }

    #[test]
    fn near_query_includes_close_points() {
        let points = grid(10);
        let tree = QuadNode::build(&points, (0..points.len()).collect()).unwrap();

        let mut found = Vec::new();
        tree.for_each_near([0.0, 0.0], 5.0, &mut |index| found.push(index));

        assert!(found.contains(&0));
        assert!(!found.contains(&99));
        assert!(found.len() < points.len());
    }

    #[test]
    fn empty_or_non_finite_input_builds_nothing() {
        assert!(QuadNode::build(&[], Vec::new()).is_none());
        let points = vec![[f64::NAN, 0.0]];
        assert!(QuadNode::build(&points, vec![0]).is_none());
    }
}
