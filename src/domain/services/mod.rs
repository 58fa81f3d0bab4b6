pub mod asset_type;
pub mod terminal_time;
pub mod trade_processor;
