pub mod bar;
pub mod pattern;
pub mod trade;
