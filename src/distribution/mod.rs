pub mod calculator;
pub mod models;
pub mod recorder;

pub use recorder::PaymentRepository;
