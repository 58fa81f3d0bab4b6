pub mod deal;
pub mod terminal;
pub mod trade;
