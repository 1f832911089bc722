pub mod affine;
pub mod io;
pub mod output;
pub mod repository;
pub mod resample;
pub mod space;

pub use affine::AffineTransform;
pub use repository::{Artifact, ArtifactKey, ArtifactKind, ImageRepository, KeyFilter};
pub use space::SpaceResolver;
