pub mod contact_point;
pub mod email;
pub mod manager;
pub mod name;
pub mod phone;
pub mod similarity;
pub mod url;

pub use manager::CandidateFinder;
