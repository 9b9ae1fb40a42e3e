pub mod fsutils;
pub mod time;
