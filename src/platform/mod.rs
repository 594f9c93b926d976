pub mod grnam;
pub mod pwnam;
