pub mod binding;
pub mod structs;
