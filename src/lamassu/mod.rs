pub mod access;
pub mod fetcher;
pub mod models;
pub mod repository;

pub use repository::LamassuRepository;
