//! Connection admission control

pub mod admission;

pub use admission::{AdmissionQueue, AdmitCallback, Admission, Release, RequesterId};
