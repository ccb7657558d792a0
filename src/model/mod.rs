pub mod architecture;
pub mod constants;
pub mod data;
pub mod noise;
pub mod training;
