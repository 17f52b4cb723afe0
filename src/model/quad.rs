/// A field or index quad: four star indices plus the scale/rotation-
/// invariant 4-D code vector computed from their positions.
///
/// `stars` holds indices into whatever star list the quad was built from, in
/// the order `[a, b, c, d]` where `a`,`b` are the diameter pair (the two
/// stars with the greatest inter-star distance) and `c`,`d` are the other
/// two, in the order they were projected into the unit square.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub stars: [usize; 4],
    pub code: [f64; 4],
    /// |AB|, the diameter used to normalise the code; also the quad's scale
    /// reference for the configured pixel-scale bounds.
    pub diameter: f64,
}

impl Quad {
    pub fn code_distance_sq(&self, other: &[f64; 4]) -> f64 {
        self.code
            .iter()
            .zip(other.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}
