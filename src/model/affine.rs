use crate::error::Error;

/// A 2-D affine map `[x' y']ᵀ = M·[x y]ᵀ + [tx ty]ᵀ`.
///
/// `M = [[a, b], [c, d]]` in row-major order, matching the CD matrix
/// convention used by [`crate::model::wcs`]. All affine arithmetic is double
/// precision, matching the WCS computations it feeds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Affine {
    pub const IDENTITY: Affine = Affine { a: 1.0, b: 0.0, c: 0.0, d: 1.0, tx: 0.0, ty: 0.0 };

    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (self.a * x + self.b * y + self.tx, self.c * x + self.d * y + self.ty)
    }

    /// Exact algebraic inverse. Caller is responsible for checking
    /// `determinant()` is non-zero first; a near-singular matrix produces a
    /// numerically unstable (but not panicking) result.
    pub fn invert(&self) -> Affine {
        let det = self.determinant();
        let inv_det = 1.0 / det;
        let a = self.d * inv_det;
        let b = -self.b * inv_det;
        let c = -self.c * inv_det;
        let d = self.a * inv_det;
        // [x y]ᵀ = M⁻¹([x' y']ᵀ - t), i.e. new translation is -M⁻¹·t.
        let tx = -(a * self.tx + b * self.ty);
        let ty = -(c * self.tx + d * self.ty);
        Affine { a, b, c, d, tx, ty }
    }

    /// Solve the exact 6-parameter affine mapping `src[i] -> dst[i]` for
    /// three non-collinear correspondences, via Gaussian elimination with
    /// partial pivoting over the 6x6 system in `[a,b,tx,c,d,ty]`.
    /// Returns [`Error::Singular`] when the three source points are
    /// (near-)collinear.
    pub fn solve_exact(
        src: [(f64, f64); 3],
        dst: [(f64, f64); 3],
    ) -> Result<Affine, Error> {
        // Row 2i:   a*x + b*y + tx            = x'_i
        // Row 2i+1:           c*x + d*y + ty   = y'_i
        // Unknowns ordered [a, b, tx, c, d, ty].
        let mut m = [[0.0f64; 7]; 6];
        for i in 0..3 {
            let (x, y) = src[i];
            let (xp, yp) = dst[i];
            let r0 = 2 * i;
            m[r0][0] = x;
            m[r0][1] = y;
            m[r0][2] = 1.0;
            m[r0][6] = xp;

            let r1 = 2 * i + 1;
            m[r1][3] = x;
            m[r1][4] = y;
            m[r1][5] = 1.0;
            m[r1][6] = yp;
        }

        let solved = gauss_partial_pivot(&mut m).ok_or(Error::Singular)?;
        Ok(Affine {
            a: solved[0],
            b: solved[1],
            tx: solved[2],
            c: solved[3],
            d: solved[4],
            ty: solved[5],
        })
    }
}

/// In-place Gaussian elimination with partial pivoting on an augmented
/// `N x (N+1)` matrix. Returns `None` if the system is singular to within
/// floating-point tolerance.
fn gauss_partial_pivot<const N: usize>(m: &mut [[f64; 7]; N]) -> Option<[f64; N]> {
    for col in 0..N {
        let mut pivot = col;
        let mut best = m[col][col].abs();
        for row in (col + 1)..N {
            let v = m[row][col].abs();
            if v > best {
                best = v;
                pivot = row;
            }
        }
        if best < 1e-12 {
            return None;
        }
        m.swap(col, pivot);

        let diag = m[col][col];
        for row in (col + 1)..N {
            let factor = m[row][col] / diag;
            if factor == 0.0 {
                continue;
            }
            for k in col..=N {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut x = [0.0f64; N];
    for row in (0..N).rev() {
        let mut sum = m[row][N];
        for col in (row + 1)..N {
            sum -= m[row][col] * x[col];
        }
        x[row] = sum / m[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_invert_round_trips() {
        let aff = Affine { a: 1.2, b: -0.3, c: 0.25, d: 0.9, tx: 5.0, ty: -3.0 };
        let inv = aff.invert();
        let p = (17.3, -4.2);
        let warped = aff.apply(p.0, p.1);
        let back = inv.apply(warped.0, warped.1);
        assert!((back.0 - p.0).abs() < 1e-6);
        assert!((back.1 - p.1).abs() < 1e-6);
    }

    #[test]
    fn solve_exact_recovers_known_similarity() {
        let theta: f64 = 30f64.to_radians();
        let (s, c) = theta.sin_cos();
        let truth = Affine { a: c, b: -s, c: s, d: c, tx: 5.0, ty: -3.0 };

        let src = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)];
        let dst = src.map(|(x, y)| truth.apply(x, y));

        let solved = Affine::solve_exact(src, dst).unwrap();
        assert!((solved.a - truth.a).abs() < 1e-9);
        assert!((solved.b - truth.b).abs() < 1e-9);
        assert!((solved.tx - truth.tx).abs() < 1e-9);
        assert!((solved.c - truth.c).abs() < 1e-9);
        assert!((solved.d - truth.d).abs() < 1e-9);
        assert!((solved.ty - truth.ty).abs() < 1e-9);
    }

    #[test]
    fn solve_exact_rejects_collinear_points() {
        let src = [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)];
        let dst = [(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)];
        assert!(matches!(Affine::solve_exact(src, dst), Err(Error::Singular)));
    }
}
