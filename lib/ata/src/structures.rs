pub mod identification;
