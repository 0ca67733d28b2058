//! Client-side response cache

pub mod gallery;
pub mod images;

pub use gallery::ImageGallery;
pub use images::{CachedImage, ImageCache, DEFAULT_CAPACITY};
