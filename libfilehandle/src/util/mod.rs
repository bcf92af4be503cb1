pub mod open_options;
pub mod path;
