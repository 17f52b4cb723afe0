/// Canonical triangle descriptor used by the Frame Aligner.
///
/// `star_indices[k]` is the vertex opposite the k-th shortest side, so that
/// relabelling the same three points always yields the same descriptor
/// regardless of input order. `ratios = (s1/s0, s2/s0)` with `s0 <= s1 <= s2`
/// are scale-invariant and are what the Frame Aligner matches on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleDescriptor {
    pub star_indices: [usize; 3],
    pub ratios: (f64, f64),
    pub side_short: f64,
}

/// Smallest side length a triangle may have and still be used; anything
/// shorter is considered degenerate.
pub const MIN_TRIANGLE_SIDE: f64 = 1e-6;

/// Build the canonical descriptor for the triangle formed by three points.
/// `positions[i]` gives the pixel position of logical vertex `i`; `indices`
/// maps logical vertex `i` back to a caller-meaningful star index. Returns
/// `None` for degenerate triangles (a side shorter than
/// [`MIN_TRIANGLE_SIDE`]).
pub fn canonical_descriptor(
    positions: [(f64, f64); 3],
    indices: [usize; 3],
) -> Option<TriangleDescriptor> {
    // Side k is opposite vertex k: side 0 = |P1P2|, side 1 = |P0P2|, side 2 = |P0P1|.
    let side = |i: usize, j: usize| -> f64 {
        let (xi, yi) = positions[i];
        let (xj, yj) = positions[j];
        ((xi - xj).powi(2) + (yi - yj).powi(2)).sqrt()
    };
    let sides = [side(1, 2), side(0, 2), side(0, 1)];

    if sides.iter().any(|&s| s < MIN_TRIANGLE_SIDE) {
        return None;
    }

    // Sort vertex labels 0,1,2 by their opposite side length, ascending.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| sides[a].partial_cmp(&sides[b]).unwrap());

    let s0 = sides[order[0]];
    let s1 = sides[order[1]];
    let s2 = sides[order[2]];

    Some(TriangleDescriptor {
        star_indices: [indices[order[0]], indices[order[1]], indices[order[2]]],
        ratios: (s1 / s0, s2 / s0),
        side_short: s0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalisation_is_order_independent() {
        let p = [(0.0, 0.0), (4.0, 0.0), (0.0, 3.0)];
        let d1 = canonical_descriptor(p, [10, 20, 30]).unwrap();

        // Swap the last two input vertices (a,b) -> (b,a); same triangle.
        let p2 = [(0.0, 0.0), (0.0, 3.0), (4.0, 0.0)];
        let d2 = canonical_descriptor(p2, [10, 30, 20]).unwrap();

        assert_eq!(d1.star_indices, d2.star_indices);
        assert!((d1.ratios.0 - d2.ratios.0).abs() < 1e-12);
        assert!((d1.ratios.1 - d2.ratios.1).abs() < 1e-12);
    }

    #[test]
    fn opposite_vertex_is_correct() {
        // Right triangle, legs 3,4, hypotenuse 5. Shortest side (3) is
        // opposite the vertex at (0,3)... actually opposite vertex to side
        // |P1P2| is P0. Vertex 1 = (4,0), vertex 2 = (0,3): side0 = |P1P2| = 5.
        // side1 = |P0P2| = 3, side2 = |P0P1| = 4. Shortest is side1 (3),
        // opposite vertex 1.
        let p = [(0.0, 0.0), (4.0, 0.0), (0.0, 3.0)];
        let d = canonical_descriptor(p, [0, 1, 2]).unwrap();
        assert_eq!(d.star_indices[0], 1);
        assert!((d.side_short - 3.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_triangle_rejected() {
        let p = [(0.0, 0.0), (1e-9, 0.0), (0.0, 3.0)];
        assert!(canonical_descriptor(p, [0, 1, 2]).is_none());
    }
}
