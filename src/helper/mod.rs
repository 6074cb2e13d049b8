pub mod canvas;
pub mod face_helper;
pub mod geometry;
pub mod transform;
