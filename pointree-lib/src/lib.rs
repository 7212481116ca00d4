pub mod bounds;
pub mod cell;
pub mod geometry;
pub mod math_enums;
pub mod storage;
