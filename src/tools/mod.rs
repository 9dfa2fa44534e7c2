pub mod generate;
pub mod providers;
