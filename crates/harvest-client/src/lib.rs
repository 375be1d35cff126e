pub mod portal;

pub use portal::HttpPortal;
