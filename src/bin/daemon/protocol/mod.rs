//! Device protocol clients: ASCII line controllers and fieldbus register modules

pub mod line;
pub mod register;
