/// A minimal fixed-4-dimension k-d tree over quad code vectors, keyed to
/// the sky positions those quads represent.
///
/// A balanced binary tree splitting on the widest dimension at each level,
/// searched with a simple radius query. It is shared between
/// [`crate::domain::index::MmapSkyIndex`]
/// (over persisted quad codes) and [`crate::domain::solve::solve`] (which
/// only ever queries, never builds, a tree handed to it by an index).
#[derive(Debug, Clone)]
pub struct KdTree4 {
    nodes: Vec<Node>,
    points: Vec<[f64; 4]>,
    root: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Index into `points`/`payload` for the point stored at this node.
    point_idx: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

impl KdTree4 {
    /// Build a tree over `points`. `points[i]` is addressable afterwards as
    /// payload index `i` (callers keep their own parallel metadata array).
    pub fn build(points: Vec<[f64; 4]>) -> Self {
        let mut order: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        let root = Self::build_recursive(&points, &mut order, &mut nodes, 0);
        Self { nodes, points, root }
    }

    fn build_recursive(
        points: &[[f64; 4]],
        indices: &mut [usize],
        nodes: &mut Vec<Node>,
        depth: usize,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }
        let axis = depth % 4;
        indices.sort_by(|&a, &b| points[a][axis].partial_cmp(&points[b][axis]).unwrap());
        let mid = indices.len() / 2;
        let point_idx = indices[mid];

        let node_idx = nodes.len();
        nodes.push(Node { point_idx, axis, left: None, right: None });

        let left = Self::build_recursive(points, &mut indices[..mid], nodes, depth + 1);
        let right = Self::build_recursive(points, &mut indices[mid + 1..], nodes, depth + 1);
        nodes[node_idx].left = left;
        nodes[node_idx].right = right;
        Some(node_idx)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Return payload indices of every stored point within Euclidean
    /// `radius` of `query`.
    pub fn query_radius(&self, query: &[f64; 4], radius: f64) -> Vec<usize> {
        let mut out = Vec::new();
        let Some(root) = self.root else { return out };
        let r2 = radius * radius;
        self.visit(root, query, r2, &mut out);
        out
    }

    fn visit(&self, node_idx: usize, query: &[f64; 4], r2: f64, out: &mut Vec<usize>) {
        let node = &self.nodes[node_idx];
        let p = &self.points[node.point_idx];

        let d2: f64 = p.iter().zip(query.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
        if d2 <= r2 {
            out.push(node.point_idx);
        }

        let diff = query[node.axis] - p[node.axis];
        let (near, far) = if diff < 0.0 { (node.left, node.right) } else { (node.right, node.left) };

        if let Some(n) = near {
            self.visit(n, query, r2, out);
        }
        if diff * diff <= r2 {
            if let Some(f) = far {
                self.visit(f, query, r2, out);
            }
        }
    }
}
