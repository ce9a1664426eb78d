//! Force kernels
//!
//! Each kernel adds to node velocities in place, scaled by the current alpha
//! where the force is alpha-dependent. Positions are only written by the
//! centering step and by integration.

use super::quadtree::QuadNode;
use super::{SimLink, SimNode};

/// Deterministic tiny offset for coincident points
fn jiggle(a: usize, b: usize) -> [f64; 2] {
    let angle = ((a as f64) * 0.618_034 + (b as f64) * 0.414_214) * std::f64::consts::TAU;
    [angle.cos() * 1e-6, angle.sin() * 1e-6]
}

/// Parameters for the charge (many-body) force
#[derive(Debug, Clone, Copy)]
pub(super) struct ChargeParams {
    /// Negative values repel
    pub(super) strength: f64,
    pub(super) alpha: f64,
    pub(super) distance_min_sq: f64,
    pub(super) theta: f64,
}

fn charge_between(
    dx: f64,
    dy: f64,
    mass: f64,
    params: ChargeParams,
    velocity: &mut [f64; 2],
) {
    let mut l = dx * dx + dy * dy;
    if l < params.distance_min_sq {
        l = (params.distance_min_sq * l).sqrt();
    }
    let w = params.strength * mass * params.alpha / l;
    velocity[0] += dx * w;
    velocity[1] += dy * w;
}

/// Exact pairwise repulsion among `members`
pub(super) fn apply_charge_exact(nodes: &mut [SimNode], members: &[usize], params: ChargeParams) {
    for &i in members {
        let mut dv = [0.0, 0.0];
        for &j in members {
            if i == j {
                continue;
            }
            let mut dx = nodes[j].x - nodes[i].x;
            let mut dy = nodes[j].y - nodes[i].y;
            if dx == 0.0 && dy == 0.0 {
                [dx, dy] = jiggle(i, j);
            }
            charge_between(dx, dy, 1.0, params, &mut dv);
        }
        nodes[i].vx += dv[0];
        nodes[i].vy += dv[1];
    }
}

/// Barnes–Hut repulsion among `members`
pub(super) fn apply_charge_barnes_hut(
    nodes: &mut [SimNode],
    members: &[usize],
    params: ChargeParams,
) {
    let points: Vec<[f64; 2]> = nodes.iter().map(|node| [node.x, node.y]).collect();
    let Some(tree) = QuadNode::build(&points, members.to_vec()) else {
        return;
    };

    for &i in members {
        let mut dv = [0.0, 0.0];
        accumulate_charge(&tree, i, &points, params, &mut dv);
        nodes[i].vx += dv[0];
        nodes[i].vy += dv[1];
    }
}

fn accumulate_charge(
    cell: &QuadNode,
    index: usize,
    points: &[[f64; 2]],
    params: ChargeParams,
    dv: &mut [f64; 2],
) {
    if cell.mass <= 0.0 {
        return;
    }
    let point = points[index];

    if cell.is_leaf() {
        for &other in &cell.indices {
            if other == index {
                continue;
            }
            let mut dx = points[other][0] - point[0];
            let mut dy = points[other][1] - point[1];
            if dx == 0.0 && dy == 0.0 {
                [dx, dy] = jiggle(index, other);
            }
            charge_between(dx, dy, 1.0, params, dv);
        }
        return;
    }

    let dx = cell.center_of_mass[0] - point[0];
    let dy = cell.center_of_mass[1] - point[1];
    let distance = (dx * dx + dy * dy).sqrt();
    let far_enough = !cell.bounds.contains(point)
        && distance > 0.0
        && cell.bounds.width() / distance < params.theta;
    if far_enough {
        charge_between(dx, dy, cell.mass, params, dv);
        return;
    }

    for child in cell.children.iter().flatten() {
        accumulate_charge(child, index, points, params, dv);
    }
}

/// Spring force along each link toward its rest length
pub(super) fn apply_links(nodes: &mut [SimNode], links: &[SimLink], alpha: f64) {
    for link in links {
        let (s, t) = (link.source, link.target);
        let mut x = nodes[t].x + nodes[t].vx - nodes[s].x - nodes[s].vx;
        let mut y = nodes[t].y + nodes[t].vy - nodes[s].y - nodes[s].vy;
        if x == 0.0 && y == 0.0 {
            [x, y] = jiggle(s, t);
        }
        let distance = (x * x + y * y).sqrt();
        let l = (distance - link.distance) / distance * alpha * link.strength;
        x *= l;
        y *= l;

        nodes[t].vx -= x * link.bias;
        nodes[t].vy -= y * link.bias;
        nodes[s].vx += x * (1.0 - link.bias);
        nodes[s].vy += y * (1.0 - link.bias);
    }
}

/// Shift free nodes so the barycenter moves toward the origin
pub(super) fn apply_center(nodes: &mut [SimNode], strength: f64) {
    if nodes.is_empty() || strength == 0.0 {
        return;
    }
    let n = nodes.len() as f64;
    let (sx, sy) = nodes
        .iter()
        .fold((0.0, 0.0), |(sx, sy), node| (sx + node.x, sy + node.y));
    let shift_x = sx / n * strength;
    let shift_y = sy / n * strength;

    for node in nodes.iter_mut().filter(|node| node.fixed.is_none()) {
        node.x -= shift_x;
        node.y -= shift_y;
    }
}

fn collide_pair(nodes: &mut [SimNode], i: usize, j: usize, strength: f64) {
    let ri = nodes[i].radius;
    let rj = nodes[j].radius;
    let r = ri + rj;
    let mut x = nodes[i].x + nodes[i].vx - nodes[j].x - nodes[j].vx;
    let mut y = nodes[i].y + nodes[i].vy - nodes[j].y - nodes[j].vy;
    let mut l = x * x + y * y;
    if l >= r * r {
        return;
    }
    if l == 0.0 {
        [x, y] = jiggle(i, j);
        l = x * x + y * y;
    }
    let distance = l.sqrt();
    let push = (r - distance) / distance * strength;
    let ri_sq = ri * ri;
    let rj_sq = rj * rj;
    let share = rj_sq / (ri_sq + rj_sq);

    nodes[i].vx += x * push * share;
    nodes[i].vy += y * push * share;
    nodes[j].vx -= x * push * (1.0 - share);
    nodes[j].vy -= y * push * (1.0 - share);
}

/// Push overlapping nodes apart
///
/// With `use_tree` set, candidate pairs come from a quadtree neighbor query
/// instead of the full pair scan.
pub(super) fn apply_collisions(nodes: &mut [SimNode], strength: f64, use_tree: bool) {
    let n = nodes.len();
    if n < 2 || strength == 0.0 {
        return;
    }

    if !use_tree {
        for i in 0..n {
            for j in (i + 1)..n {
                collide_pair(nodes, i, j, strength);
            }
        }
        return;
    }

    let points: Vec<[f64; 2]> = nodes
        .iter()
        .map(|node| [node.x + node.vx, node.y + node.vy])
        .collect();
    let max_radius = nodes.iter().map(|node| node.radius).fold(0.0, f64::max);
    let Some(tree) = QuadNode::build(&points, (0..n).collect()) else {
        return;
    };

    let mut candidates = Vec::new();
    for i in 0..n {
        candidates.clear();
        let reach = nodes[i].radius + max_radius;
        tree.for_each_near(points[i], reach, &mut |j| {
            if j > i {
                candidates.push(j);
            }
        });
        candidates.sort_unstable();
        for &j in &candidates {
            collide_pair(nodes, i, j, strength);
        }
    }
}

/// Apply velocity damping and move free nodes; pinned nodes snap to their pin
pub(super) fn integrate(nodes: &mut [SimNode], velocity_decay: f64, max_velocity: f64) {
    let retain = 1.0 - velocity_decay;
    for node in nodes {
        if let Some((fx, fy)) = node.fixed {
            node.x = fx;
            node.y = fy;
            node.vx = 0.0;
            node.vy = 0.0;
            continue;
        }

        node.vx *= retain;
        node.vy *= retain;
        let speed_sq = node.vx * node.vx + node.vy * node.vy;
        if speed_sq > max_velocity * max_velocity {
            let scale = max_velocity / speed_sq.sqrt();
            node.vx *= scale;
            node.vy *= scale;
        }
        node.x += node.vx;
        node.y += node.vy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(x: f64, y: f64) -> SimNode {
        SimNode {
            id: String::new(),
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            fixed: None,
            collapsed: false,
            radius: 5.0,
        }
    }

    fn params(theta: f64) -> ChargeParams {
        ChargeParams {
            strength: -30.0,
            alpha: 1.0,
            distance_min_sq: 1.0,
            theta,
        }
    }

    #[test]
    fn charge_pushes_pair_apart() {
        let mut nodes = vec![node(0.0, 0.0), node(10.0, 0.0)];
        apply_charge_exact(&mut nodes, &[0, 1], params(0.9));
        assert!(nodes[0].vx < 0.0);
        assert!(nodes[1].vx > 0.0);
        assert!((nodes[0].vx + nodes[1].vx).abs() < 1e-12);
    }

    #[test]
    fn coincident_nodes_still_separate() {
        let mut nodes = vec![node(0.0, 0.0), node(0.0, 0.0)];
        apply_charge_exact(&mut nodes, &[0, 1], params(0.9));
        let speed = nodes[0].vx.hypot(nodes[0].vy);
        assert!(speed > 0.0 && speed.is_finite());
    }

    #[test]
    fn barnes_hut_with_zero_theta_matches_exact() {
        let mut exact: Vec<SimNode> = (0..60)
            .map(|i| node((i % 8) as f64 * 13.0, (i / 8) as f64 * 7.0 + (i as f64) * 0.1))
            .collect();
        let mut approx = exact.clone();
        let members: Vec<usize> = (0..exact.len()).collect();

        apply_charge_exact(&mut exact, &members, params(0.0));
        apply_charge_barnes_hut(&mut approx, &members, params(0.0));

        for (a, b) in exact.iter().zip(&approx) {
            assert!((a.vx - b.vx).abs() < 1e-9);
            assert!((a.vy - b.vy).abs() < 1e-9);
        }
    }

    #[test]
    fn barnes_hut_approximates_exact() {
        let mut exact: Vec<SimNode> = (0..200)
            .map(|i| node((i % 20) as f64 * 15.0, (i / 20) as f64 * 15.0))
            .collect();
        let mut approx = exact.clone();
        let members: Vec<usize> = (0..exact.len()).collect();

        apply_charge_exact(&mut exact, &members, params(0.9));
        apply_charge_barnes_hut(&mut approx, &members, params(0.9));

        let error: f64 = exact
            .iter()
            .zip(&approx)
            .map(|(a, b)| (a.vx - b.vx).hypot(a.vy - b.vy))
            .sum();
        let magnitude: f64 = exact.iter().map(|a| a.vx.hypot(a.vy)).sum();
        assert!(error / magnitude < 0.2);
    }

    #[test]
    fn link_pulls_stretched_pair_together() {
        let mut nodes = vec![node(0.0, 0.0), node(100.0, 0.0)];
        let links = vec![SimLink {
            source: 0,
            target: 1,
            distance: 30.0,
            strength: 1.0,
            bias: 0.5,
        }];
        apply_links(&mut nodes, &links, 1.0);
        assert!(nodes[0].vx > 0.0);
        assert!(nodes[1].vx < 0.0);
    }

    #[test]
    fn center_moves_barycenter_and_skips_pinned() {
        let mut nodes = vec![node(10.0, 10.0), node(30.0, 10.0)];
        nodes[1].fixed = Some((30.0, 10.0));
        apply_center(&mut nodes, 1.0);
        assert_eq!((nodes[0].x, nodes[0].y), (-10.0, 0.0));
        assert_eq!((nodes[1].x, nodes[1].y), (30.0, 10.0));
    }

    #[test]
    fn collisions_match_with_and_without_tree() {
        let mut brute: Vec<SimNode> = (0..150)
            .map(|i| node((i % 15) as f64 * 30.0, (i / 15) as f64 * 30.0))
            .collect();
        brute.push(node(3.0, 4.0));
        let mut tree = brute.clone();

        apply_collisions(&mut brute, 0.7, false);
        apply_collisions(&mut tree, 0.7, true);

        for (a, b) in brute.iter().zip(&tree) {
            assert!((a.vx - b.vx).abs() < 1e-9);
            assert!((a.vy - b.vy).abs() < 1e-9);
        }
        assert!(tree[0].vx < 0.0 && tree[0].vy < 0.0);
        assert!(tree[150].vx > 0.0 && tree[150].vy > 0.0);
        assert_eq!(tree[1].vx, 0.0);
    }

    #[test]
    fn integrate_holds_pinned_nodes() {
        let mut nodes = vec![node(0.0, 0.0), node(5.0, 5.0)];
        nodes[0].vx = 10.0;
        nodes[1].vx = 10.0;
        nodes[1].fixed = Some((1.0, 2.0));
        integrate(&mut nodes, 0.4, 100.0);

        assert!((nodes[0].x - 6.0).abs() < 1e-12);
        assert_eq!((nodes[1].x, nodes[1].y), (1.0, 2.0));
        assert_eq!(nodes[1].vx, 0.0);
    }

    #[test]
    fn integrate_clamps_velocity() {
        let mut nodes = vec![node(0.0, 0.0)];
        nodes[0].vx = 1000.0;
        integrate(&mut nodes, 0.0, 50.0);
        assert!((nodes[0].x - 50.0).abs() < 1e-9);
    }
}
