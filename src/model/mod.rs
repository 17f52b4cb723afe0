pub mod affine;
pub mod quad;
pub mod star;
pub mod triangle;
pub mod wcs;

pub use affine::Affine;
pub use quad::Quad;
pub use star::Star;
pub use triangle::TriangleDescriptor;
pub use wcs::WcsSolution;
