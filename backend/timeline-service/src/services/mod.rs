pub mod admission;

pub use admission::{Admitted, AdmissionError, AdmissionService};
